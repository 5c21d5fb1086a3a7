//! Approval steps and the approval matrix that decides who signs off on what
use super::context::{ActionContext, Actor, Audit, TimeStamp};
use super::error::Error;
use chrono::Utc;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ApprovalStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "Pending",
            ApprovalStatus::Approved => "Approved",
            ApprovalStatus::Rejected => "Rejected",
        };
        f.write_str(s)
    }
}

/// One pending or decided sign-off step
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Approval {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub level: u32,
    // position in the approval chain captured at submission
    #[n(2)]
    pub chain_index: u32,
    #[n(3)]
    pub matrix_code: Option<String>,
    #[n(4)]
    pub approver_role: Option<String>,
    #[n(5)]
    pub approver_user_id: Option<String>,
    #[n(6)]
    pub delegated_to: Option<String>,
    #[n(7)]
    pub is_escalated: bool,
    #[n(8)]
    pub status: ApprovalStatus,
    #[n(9)]
    pub comments: Option<String>,
    #[n(10)]
    pub requested_at: TimeStamp<Utc>,
    #[n(11)]
    pub decided_at: Option<TimeStamp<Utc>>,
    #[n(12)]
    pub decided_by: Option<String>,
}

impl Approval {
    pub(crate) fn pending(
        id: String,
        chain_index: u32,
        step: Option<&ApprovalMatrixEntry>,
        now: TimeStamp<Utc>,
    ) -> Self {
        Self {
            id,
            level: step.map_or(chain_index + 1, |s| s.approval_level),
            chain_index,
            matrix_code: step.map(|s| s.code.clone()),
            approver_role: step.map(|s| s.approver_role.clone()),
            approver_user_id: step.and_then(|s| s.approver_user_id.clone()),
            delegated_to: None,
            is_escalated: false,
            status: ApprovalStatus::Pending,
            comments: None,
            requested_at: now,
            decided_at: None,
            decided_by: None,
        }
    }

    /// The user expected to decide this step, if one was assigned
    pub fn assignee(&self) -> Option<&str> {
        self.delegated_to
            .as_deref()
            .or(self.approver_user_id.as_deref())
    }

    pub(crate) fn ensure_decidable_by(&self, actor: &Actor) -> Result<(), Error> {
        match self.assignee() {
            Some(expected) if expected != actor.user_id && !actor.elevated => {
                Err(Error::Forbidden(format!(
                    "Unauthorized approver. Expected: {}, Got: {}",
                    expected, actor.user_id
                )))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn decide(
        &mut self,
        status: ApprovalStatus,
        comments: Option<String>,
        ctx: &ActionContext,
    ) {
        self.status = status;
        self.comments = comments;
        self.decided_at = Some(ctx.now.clone());
        self.decided_by = Some(ctx.actor.user_id.clone());
    }
}

pub(crate) fn pending_count(approvals: &[Approval]) -> usize {
    approvals
        .iter()
        .filter(|a| a.status == ApprovalStatus::Pending)
        .count()
}

/// The single pending step. More than one, or none, is a broken workflow
/// and is reported rather than guessed around.
pub(crate) fn sole_pending_mut<'a>(
    approvals: &'a mut [Approval],
    entity: &'static str,
) -> Result<&'a mut Approval, Error> {
    match pending_count(approvals) {
        1 => approvals
            .iter_mut()
            .find(|a| a.status == ApprovalStatus::Pending)
            .ok_or_else(|| Error::state(entity, "decide approval for", "no pending approval")),
        0 => Err(Error::state(entity, "decide approval for", "no pending approval")),
        n => Err(Error::state(
            entity,
            "decide approval for",
            format!("{n} pending approvals"),
        )),
    }
}

/// Amount band and scope that routes an AFE to an approver level
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct ApprovalMatrixEntry {
    #[n(0)]
    pub code: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub min_amount: f64,
    #[n(3)]
    pub max_amount: f64,
    #[n(4)]
    pub well_type: Option<String>,
    #[n(5)]
    pub field_id: Option<String>,
    #[n(6)]
    pub approval_level: u32,
    #[n(7)]
    pub approver_role: String,
    #[n(8)]
    pub approver_user_id: Option<String>,
    #[n(9)]
    pub is_active: bool,
    #[n(10)]
    pub audit: Option<Audit>,
}

impl ApprovalMatrixEntry {
    pub fn new(
        code: &str,
        name: &str,
        min_amount: f64,
        max_amount: f64,
        approval_level: u32,
        approver_role: &str,
    ) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            min_amount,
            max_amount,
            well_type: None,
            field_id: None,
            approval_level,
            approver_role: approver_role.to_string(),
            approver_user_id: None,
            is_active: true,
            audit: None,
        }
    }
    pub fn set_well_type(mut self, well_type: &str) -> Self {
        self.well_type = Some(well_type.to_string());
        self
    }
    pub fn set_field(mut self, field_id: &str) -> Self {
        self.field_id = Some(field_id.to_string());
        self
    }
    pub fn set_approver(mut self, user_id: &str) -> Self {
        self.approver_user_id = Some(user_id.to_string());
        self
    }
    pub fn set_active(mut self, active: bool) -> Self {
        self.is_active = active;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.code.trim().is_empty() {
            return Err(Error::validation("Matrix code is required"));
        }
        if self.name.trim().is_empty() {
            return Err(Error::validation("Matrix name is required"));
        }
        if !self.min_amount.is_finite() || !self.max_amount.is_finite() || self.min_amount < 0.0 {
            return Err(Error::validation("Matrix amounts must be finite and non-negative"));
        }
        if self.min_amount > self.max_amount {
            return Err(Error::validation(format!(
                "Matrix '{}' has min amount {} above max amount {}",
                self.code, self.min_amount, self.max_amount
            )));
        }
        if self.approval_level == 0 {
            return Err(Error::validation("Approval level starts at 1"));
        }
        Ok(())
    }

    /// Entries without a well type or field apply to every well.
    pub fn matches(&self, amount: f64, well_type: Option<&str>, field_id: Option<&str>) -> bool {
        let scoped = |required: &Option<String>, actual: Option<&str>| match required {
            Some(r) => actual == Some(r.as_str()),
            None => true,
        };
        self.is_active
            && self.min_amount <= amount
            && amount <= self.max_amount
            && scoped(&self.well_type, well_type)
            && scoped(&self.field_id, field_id)
    }
}

/// Ordered approval chain for an amount: every matching entry, lowest level
/// first.
pub fn approval_chain(
    entries: &[ApprovalMatrixEntry],
    amount: f64,
    well_type: Option<&str>,
    field_id: Option<&str>,
) -> Vec<ApprovalMatrixEntry> {
    let mut chain: Vec<ApprovalMatrixEntry> = entries
        .iter()
        .filter(|e| e.matches(amount, well_type, field_id))
        .cloned()
        .collect();
    chain.sort_by(|a, b| {
        a.approval_level
            .cmp(&b.approval_level)
            .then_with(|| a.code.cmp(&b.code))
    });
    chain
}
