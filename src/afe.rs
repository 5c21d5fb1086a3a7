//! Authorization for Expenditure: the aggregate, its lifecycle and cost roll-ups
//!
//! An [`Afe`] is stored as one document that embeds its line items, WBS
//! elements, approvals, cost postings, commitments and allocations. Every
//! mutation goes through a method here that validates first and then updates
//! the derived totals, so the service layer writes the child change and the
//! roll-up together.
use super::approval::{self, Approval, ApprovalMatrixEntry, ApprovalStatus};
use super::context::{ActionContext, Actor, Audit, TimeStamp};
use super::error::Error;
use super::interest::PartnerInterest;
use super::utils::approx_eq;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum AfeStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    PendingApproval,
    #[n(2)]
    Approved,
    #[n(3)]
    Rejected,
    #[n(4)]
    Revision,
    #[n(5)]
    Active,
    #[n(6)]
    Closed,
    #[n(7)]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfeAction {
    SubmitForApproval,
    Approve,
    Reject,
    ReturnForRevision,
    Activate,
    Close,
    Cancel,
}

impl AfeAction {
    pub const ALL: [AfeAction; 7] = [
        AfeAction::SubmitForApproval,
        AfeAction::Approve,
        AfeAction::Reject,
        AfeAction::ReturnForRevision,
        AfeAction::Activate,
        AfeAction::Close,
        AfeAction::Cancel,
    ];

    fn verb(&self) -> &'static str {
        match self {
            AfeAction::SubmitForApproval => "submit",
            AfeAction::Approve => "approve",
            AfeAction::Reject => "reject",
            AfeAction::ReturnForRevision => "return for revision",
            AfeAction::Activate => "activate",
            AfeAction::Close => "close",
            AfeAction::Cancel => "cancel",
        }
    }
}

impl AfeStatus {
    pub const ALL: [AfeStatus; 8] = [
        AfeStatus::Draft,
        AfeStatus::PendingApproval,
        AfeStatus::Approved,
        AfeStatus::Rejected,
        AfeStatus::Revision,
        AfeStatus::Active,
        AfeStatus::Closed,
        AfeStatus::Cancelled,
    ];

    /// The status an action leads to, or `None` when the action is not
    /// allowed from this status.
    pub fn next(self, action: AfeAction) -> Option<AfeStatus> {
        use AfeAction as A;
        use AfeStatus as S;
        match (self, action) {
            (S::Draft | S::Revision, A::SubmitForApproval) => Some(S::PendingApproval),
            (S::PendingApproval, A::Approve) => Some(S::Approved),
            (S::PendingApproval, A::Reject) => Some(S::Rejected),
            (S::PendingApproval, A::ReturnForRevision) => Some(S::Revision),
            (S::Approved, A::Activate) => Some(S::Active),
            (S::Active, A::Close) => Some(S::Closed),
            (s, A::Cancel) if !s.is_terminal() => Some(S::Cancelled),
            _ => None,
        }
    }

    pub fn apply(self, action: AfeAction) -> Result<AfeStatus, Error> {
        self.next(action)
            .ok_or_else(|| Error::state("AFE", action.verb(), self))
    }

    /// Field edits need elevated rights in these states
    pub fn is_locked(self) -> bool {
        matches!(self, AfeStatus::Approved | AfeStatus::Closed | AfeStatus::Cancelled)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AfeStatus::Closed | AfeStatus::Cancelled)
    }

    pub fn can_delete(self) -> bool {
        self == AfeStatus::Draft
    }
}

impl fmt::Display for AfeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AfeStatus::Draft => "Draft",
            AfeStatus::PendingApproval => "Pending Approval",
            AfeStatus::Approved => "Approved",
            AfeStatus::Rejected => "Rejected",
            AfeStatus::Revision => "Revision",
            AfeStatus::Active => "Active",
            AfeStatus::Closed => "Closed",
            AfeStatus::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum AfeType {
    #[n(0)]
    Original,
    #[n(1)]
    Supplement,
}

/// Review state of the AFE's cost variance. Set by cost postings, cleared
/// only by an explicit decision.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum VarianceReview {
    #[n(0)]
    Clear,
    #[n(1)]
    PendingReview,
    #[n(2)]
    ExplanationRequested {
        #[n(0)]
        from: String,
    },
    #[n(3)]
    Accepted,
}

impl fmt::Display for VarianceReview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarianceReview::Clear => f.write_str("Clear"),
            VarianceReview::PendingReview => f.write_str("Pending Review"),
            VarianceReview::ExplanationRequested { .. } => f.write_str("Explanation Requested"),
            VarianceReview::Accepted => f.write_str("Accepted"),
        }
    }
}

// Used for constructing drafts
#[derive(Debug, Default, Clone)]
pub struct AfeDetails {
    title: Option<String>,
    well_id: Option<String>,
    well_type: Option<String>,
    field_id: Option<String>,
    justification: Option<String>,
    estimated_cost: f64,
    afe_number: Option<String>,
}

/// Checked [`AfeDetails`], ready to become an [`Afe`]
#[derive(Debug, Clone)]
pub(crate) struct AfeDraft {
    pub title: String,
    pub well_id: String,
    pub well_type: Option<String>,
    pub field_id: Option<String>,
    pub justification: Option<String>,
    pub estimated_cost: f64,
    pub afe_number: Option<String>,
}

fn required(value: Option<String>, message: &str) -> Result<String, Error> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::validation(message)),
    }
}

impl AfeDetails {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }
    pub fn set_well(mut self, well_id: &str) -> Self {
        self.well_id = Some(well_id.to_string());
        self
    }
    pub fn set_well_type(mut self, well_type: &str) -> Self {
        self.well_type = Some(well_type.to_string());
        self
    }
    pub fn set_field(mut self, field_id: &str) -> Self {
        self.field_id = Some(field_id.to_string());
        self
    }
    pub fn set_justification(mut self, justification: &str) -> Self {
        self.justification = Some(justification.to_string());
        self
    }
    pub fn set_estimated_cost(mut self, amount: f64) -> Self {
        self.estimated_cost = amount;
        self
    }
    /// Explicit number; generated from the yearly series when unset
    pub fn set_afe_number(mut self, afe_number: &str) -> Self {
        self.afe_number = Some(afe_number.to_string());
        self
    }

    pub(crate) fn validate_and_finalise(self) -> Result<AfeDraft, Error> {
        let title = required(self.title, "AFE title is required")?;
        let well_id = required(self.well_id, "Well reference is required")?;
        if !self.estimated_cost.is_finite() || self.estimated_cost <= 0.0 {
            return Err(Error::validation(format!(
                "Estimated cost must be greater than zero, got {}",
                self.estimated_cost
            )));
        }
        let afe_number = match self.afe_number {
            Some(n) if n.trim().is_empty() => {
                return Err(Error::validation("AFE number cannot be blank"));
            }
            other => other,
        };

        Ok(AfeDraft {
            title,
            well_id,
            well_type: self.well_type,
            field_id: self.field_id,
            justification: self.justification,
            estimated_cost: self.estimated_cost,
            afe_number,
        })
    }
}

/// Partial edit of the AFE header. Unset fields are left alone.
#[derive(Debug, Default, Clone)]
pub struct AfeUpdate {
    pub title: Option<String>,
    pub justification: Option<String>,
    pub well_type: Option<String>,
    pub field_id: Option<String>,
    pub requested_cost: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineItemInput {
    pub cost_element: String,
    pub description: String,
    pub quantity: f64,
    pub unit_cost: f64,
}

impl LineItemInput {
    pub fn new(cost_element: &str, description: &str, quantity: f64, unit_cost: f64) -> Self {
        Self {
            cost_element: cost_element.to_string(),
            description: description.to_string(),
            quantity,
            unit_cost,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.cost_element.trim().is_empty() {
            return Err(Error::validation("Cost element is required"));
        }
        if !self.quantity.is_finite() || self.quantity <= 0.0 {
            return Err(Error::validation("Quantity must be greater than zero"));
        }
        if !self.unit_cost.is_finite() || self.unit_cost < 0.0 {
            return Err(Error::validation("Unit cost cannot be negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct LineItem {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub cost_element: String,
    #[n(2)]
    pub description: String,
    #[n(3)]
    pub quantity: f64,
    #[n(4)]
    pub unit_cost: f64,
    // quantity * unit_cost, never set directly
    #[n(5)]
    pub total_cost: f64,
}

impl LineItem {
    fn apply(&mut self, input: LineItemInput) {
        self.cost_element = input.cost_element;
        self.description = input.description;
        self.quantity = input.quantity;
        self.unit_cost = input.unit_cost;
        self.total_cost = self.quantity * self.unit_cost;
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct WbsElement {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub code: String,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub level: u32,
    #[n(4)]
    pub budgeted_cost: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostActualInput {
    pub cost_element: String,
    pub wbs_code: Option<String>,
    pub amount: f64,
    pub posting_date: TimeStamp<Utc>,
}

impl CostActualInput {
    pub fn new(cost_element: &str, amount: f64, posting_date: TimeStamp<Utc>) -> Self {
        Self {
            cost_element: cost_element.to_string(),
            wbs_code: None,
            amount,
            posting_date,
        }
    }
    pub fn set_wbs(mut self, code: &str) -> Self {
        self.wbs_code = Some(code.to_string());
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.cost_element.trim().is_empty() {
            return Err(Error::validation("Cost element is required"));
        }
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(Error::validation("Valid amount is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct CostActual {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub document_number: String,
    #[n(2)]
    pub cost_element: String,
    #[n(3)]
    pub wbs_code: Option<String>,
    // negative for reversals
    #[n(4)]
    pub amount: f64,
    #[n(5)]
    pub posting_date: TimeStamp<Utc>,
    #[n(6)]
    pub is_reversed: bool,
    #[n(7)]
    pub reversal_of: Option<String>,
    #[n(8)]
    pub reversal_reason: Option<String>,
    #[n(9)]
    pub is_allocated: bool,
    #[n(10)]
    pub posted_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum CommitmentStatus {
    #[n(0)]
    Open,
    #[n(1)]
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitmentInput {
    pub po_number: String,
    pub vendor_id: Option<String>,
    pub amount: f64,
}

impl CommitmentInput {
    pub fn new(po_number: &str, amount: f64) -> Self {
        Self {
            po_number: po_number.to_string(),
            vendor_id: None,
            amount,
        }
    }
    pub fn set_vendor(mut self, vendor_id: &str) -> Self {
        self.vendor_id = Some(vendor_id.to_string());
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.po_number.trim().is_empty() {
            return Err(Error::validation("PO number is required"));
        }
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(Error::validation("Valid amount is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Commitment {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub po_number: String,
    #[n(2)]
    pub vendor_id: Option<String>,
    #[n(3)]
    pub amount: f64,
    #[n(4)]
    pub consumed_amount: f64,
    #[n(5)]
    pub remaining_amount: f64,
    #[n(6)]
    pub status: CommitmentStatus,
    #[n(7)]
    pub closed_at: Option<TimeStamp<Utc>>,
}

/// A partner's share of one cost posting
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct CostAllocation {
    #[n(0)]
    pub cost_actual_id: String,
    #[n(1)]
    pub partner_id: String,
    #[n(2)]
    pub gross_amount: f64,
    #[n(3)]
    pub working_interest: f64,
    #[n(4)]
    pub net_amount: f64,
    #[n(5)]
    pub allocated_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct StatusChange {
    #[n(0)]
    pub from: AfeStatus,
    #[n(1)]
    pub to: AfeStatus,
    #[n(2)]
    pub changed_by: String,
    #[n(3)]
    pub changed_at: TimeStamp<Utc>,
    #[n(4)]
    pub comments: Option<String>,
}

/// Derived cost figures of an AFE
#[derive(Debug, Clone, PartialEq)]
pub struct AfeTotals {
    pub estimated_cost: f64,
    pub approved_cost: f64,
    pub actual_cost: f64,
    pub committed_cost: f64,
    pub variance_amount: f64,
    pub variance_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarianceCategory {
    Favorable,
    Unfavorable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostElementVariance {
    pub cost_element: String,
    pub estimated: f64,
    pub actual: f64,
    pub variance: f64,
    pub variance_pct: f64,
    pub category: VarianceCategory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleFinding {
    pub rule_code: &'static str,
    pub severity: Severity,
    pub message: String,
}

/// Result of a single approve decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// Another level of the chain is now pending
    Advanced { level: u32 },
    Approved,
}

/// `variance_amount * 100 / estimated`, zero when nothing was estimated
pub fn variance_pct(estimated: f64, actual: f64) -> f64 {
    if estimated == 0.0 {
        return 0.0;
    }
    (actual - estimated) * 100.0 / estimated
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Afe {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub afe_number: String,
    #[n(2)]
    pub title: String,
    #[n(3)]
    pub afe_type: AfeType,
    #[n(4)]
    pub parent_afe_id: Option<String>,
    #[n(5)]
    pub well_id: String,
    #[n(6)]
    pub well_type: Option<String>,
    #[n(7)]
    pub field_id: Option<String>,
    #[n(8)]
    pub justification: Option<String>,
    #[n(9)]
    pub status: AfeStatus,
    // cost asked for at creation, the estimate until line items exist
    #[n(10)]
    pub requested_cost: f64,
    #[n(11)]
    pub estimated_cost: f64,
    #[n(12)]
    pub approved_cost: f64,
    #[n(13)]
    pub actual_cost: f64,
    #[n(14)]
    pub committed_cost: f64,
    #[n(15)]
    pub variance_review: VarianceReview,
    #[n(16)]
    pub variance_comments: Option<String>,
    #[n(17)]
    pub line_items: Vec<LineItem>,
    #[n(18)]
    pub wbs_elements: Vec<WbsElement>,
    #[n(19)]
    pub approval_chain: Vec<ApprovalMatrixEntry>,
    #[n(20)]
    pub approvals: Vec<Approval>,
    #[n(21)]
    pub cost_actuals: Vec<CostActual>,
    #[n(22)]
    pub commitments: Vec<Commitment>,
    #[n(23)]
    pub allocations: Vec<CostAllocation>,
    #[n(24)]
    pub history: Vec<StatusChange>,
    #[n(25)]
    pub approval_conditions: Option<String>,
    #[n(26)]
    pub revision_comments: Option<String>,
    #[n(27)]
    pub rejection_reason: Option<String>,
    #[n(28)]
    pub submitted_at: Option<TimeStamp<Utc>>,
    #[n(29)]
    pub submitted_by: Option<String>,
    #[n(30)]
    pub approved_at: Option<TimeStamp<Utc>>,
    #[n(31)]
    pub approved_by: Option<String>,
    #[n(32)]
    pub activated_at: Option<TimeStamp<Utc>>,
    #[n(33)]
    pub closed_at: Option<TimeStamp<Utc>>,
    #[n(34)]
    pub cancelled_at: Option<TimeStamp<Utc>>,
    #[n(35)]
    pub audit: Audit,
}

impl Afe {
    pub(crate) fn new(id: String, afe_number: String, draft: AfeDraft, ctx: &ActionContext) -> Self {
        Self {
            id,
            afe_number,
            title: draft.title,
            afe_type: AfeType::Original,
            parent_afe_id: None,
            well_id: draft.well_id,
            well_type: draft.well_type,
            field_id: draft.field_id,
            justification: draft.justification,
            status: AfeStatus::Draft,
            requested_cost: draft.estimated_cost,
            estimated_cost: draft.estimated_cost,
            approved_cost: 0.0,
            actual_cost: 0.0,
            committed_cost: 0.0,
            variance_review: VarianceReview::Clear,
            variance_comments: None,
            line_items: vec![],
            wbs_elements: vec![],
            approval_chain: vec![],
            approvals: vec![],
            cost_actuals: vec![],
            commitments: vec![],
            allocations: vec![],
            history: vec![],
            approval_conditions: None,
            revision_comments: None,
            rejection_reason: None,
            submitted_at: None,
            submitted_by: None,
            approved_at: None,
            approved_by: None,
            activated_at: None,
            closed_at: None,
            cancelled_at: None,
            audit: Audit::created(ctx),
        }
    }

    /// Draft supplement requesting additional funds on top of `parent`
    pub(crate) fn supplement_of(
        parent: &Afe,
        id: String,
        sequence: usize,
        estimated_cost: f64,
        justification: Option<String>,
        ctx: &ActionContext,
    ) -> Result<Self, Error> {
        if !matches!(parent.status, AfeStatus::Active | AfeStatus::Approved) {
            return Err(Error::state("AFE", "create a supplement for", parent.status));
        }
        let draft = AfeDetails::new()
            .set_title(&format!("{} - Supplement {sequence}", parent.title))
            .set_well(&parent.well_id)
            .set_estimated_cost(estimated_cost)
            .validate_and_finalise()?;

        let mut supplement = Afe::new(
            id,
            format!("{}-S{sequence}", parent.afe_number),
            draft,
            ctx,
        );
        supplement.afe_type = AfeType::Supplement;
        supplement.parent_afe_id = Some(parent.id.clone());
        supplement.well_type = parent.well_type.clone();
        supplement.field_id = parent.field_id.clone();
        supplement.justification = justification;
        Ok(supplement)
    }

    pub fn variance_amount(&self) -> f64 {
        self.actual_cost - self.estimated_cost
    }

    pub fn variance_pct(&self) -> f64 {
        variance_pct(self.estimated_cost, self.actual_cost)
    }

    pub fn totals(&self) -> AfeTotals {
        AfeTotals {
            estimated_cost: self.estimated_cost,
            approved_cost: self.approved_cost,
            actual_cost: self.actual_cost,
            committed_cost: self.committed_cost,
            variance_amount: self.variance_amount(),
            variance_pct: self.variance_pct(),
        }
    }

    /// Edits are refused for everyone while approval is pending, since the
    /// captured chain was routed on the submitted estimate. Locked states
    /// only admit elevated actors.
    pub(crate) fn ensure_editable(&self, actor: &Actor) -> Result<(), Error> {
        if self.status == AfeStatus::PendingApproval {
            return Err(Error::state("AFE", "edit", self.status));
        }
        if self.status.is_locked() && !actor.elevated {
            return Err(Error::Forbidden(format!(
                "AFE {} is {}; changes require administrative rights",
                self.afe_number, self.status
            )));
        }
        Ok(())
    }

    fn ensure_open_for_postings(&self, action: &'static str) -> Result<(), Error> {
        if self.status.is_terminal() {
            return Err(Error::state("AFE", action, self.status));
        }
        Ok(())
    }

    /// Re-aggregate every derived total from the child records.
    ///
    /// Returns true when this recompute raised the variance review flag.
    pub fn recompute_totals(&mut self, variance_threshold_pct: f64) -> bool {
        self.estimated_cost = if self.line_items.is_empty() {
            self.requested_cost
        } else {
            self.line_items.iter().map(|li| li.total_cost).sum()
        };
        let actual: f64 = self.cost_actuals.iter().map(|ca| ca.amount).sum();
        self.committed_cost = self
            .commitments
            .iter()
            .filter(|c| c.status == CommitmentStatus::Open)
            .map(|c| c.remaining_amount)
            .sum();

        let actual_changed = !approx_eq(actual, self.actual_cost);
        self.actual_cost = actual;

        tracing::debug!(
            afe = %self.afe_number,
            estimated = self.estimated_cost,
            actual = self.actual_cost,
            committed = self.committed_cost,
            "recomputed AFE totals"
        );

        let pct = self.variance_pct();
        if actual_changed
            && pct.abs() > variance_threshold_pct
            && self.variance_review != VarianceReview::PendingReview
        {
            tracing::warn!(
                afe = %self.afe_number,
                variance_pct = pct,
                threshold = variance_threshold_pct,
                "variance exceeds threshold, flagged for review"
            );
            self.variance_review = VarianceReview::PendingReview;
            return true;
        }
        false
    }

    pub(crate) fn apply_update(&mut self, update: AfeUpdate) -> Result<(), Error> {
        if let Some(title) = &update.title {
            if title.trim().is_empty() {
                return Err(Error::validation("AFE title is required"));
            }
        }
        if let Some(cost) = update.requested_cost {
            if !cost.is_finite() || cost <= 0.0 {
                return Err(Error::validation(format!(
                    "Estimated cost must be greater than zero, got {cost}"
                )));
            }
        }

        if let Some(title) = update.title {
            self.title = title;
        }
        if update.justification.is_some() {
            self.justification = update.justification;
        }
        if update.well_type.is_some() {
            self.well_type = update.well_type;
        }
        if update.field_id.is_some() {
            self.field_id = update.field_id;
        }
        if let Some(cost) = update.requested_cost {
            self.requested_cost = cost;
        }
        Ok(())
    }

    fn transition(
        &mut self,
        action: AfeAction,
        ctx: &ActionContext,
        comments: Option<String>,
    ) -> Result<(), Error> {
        let from = self.status;
        let to = from.apply(action)?;
        self.status = to;
        self.history.push(StatusChange {
            from,
            to,
            changed_by: ctx.actor.user_id.clone(),
            changed_at: ctx.now.clone(),
            comments,
        });
        tracing::info!(afe = %self.afe_number, %from, %to, user = %ctx.actor.user_id, "AFE status changed");
        Ok(())
    }

    // line items

    pub(crate) fn add_line_item(&mut self, id: String, input: LineItemInput) -> Result<&LineItem, Error> {
        input.validate()?;
        let mut item = LineItem {
            id,
            cost_element: String::new(),
            description: String::new(),
            quantity: 0.0,
            unit_cost: 0.0,
            total_cost: 0.0,
        };
        item.apply(input);
        self.line_items.push(item);
        let idx = self.line_items.len() - 1;
        Ok(&self.line_items[idx])
    }

    pub(crate) fn update_line_item(&mut self, line_item_id: &str, input: LineItemInput) -> Result<(), Error> {
        input.validate()?;
        let item = self
            .line_items
            .iter_mut()
            .find(|li| li.id == line_item_id)
            .ok_or_else(|| Error::not_found("AFE line item", line_item_id))?;
        item.apply(input);
        Ok(())
    }

    pub(crate) fn remove_line_item(&mut self, line_item_id: &str) -> Result<LineItem, Error> {
        let idx = self
            .line_items
            .iter()
            .position(|li| li.id == line_item_id)
            .ok_or_else(|| Error::not_found("AFE line item", line_item_id))?;
        Ok(self.line_items.remove(idx))
    }

    pub(crate) fn add_wbs_element(
        &mut self,
        id: String,
        code: &str,
        name: &str,
        level: u32,
        budgeted_cost: f64,
    ) -> Result<&WbsElement, Error> {
        if code.trim().is_empty() {
            return Err(Error::validation("WBS code is required"));
        }
        if !budgeted_cost.is_finite() || budgeted_cost < 0.0 {
            return Err(Error::validation("Budgeted cost cannot be negative"));
        }
        if self.wbs_elements.iter().any(|w| w.code == code) {
            return Err(Error::Conflict(format!(
                "WBS code '{code}' already exists on AFE {}",
                self.afe_number
            )));
        }
        self.wbs_elements.push(WbsElement {
            id,
            code: code.to_string(),
            name: name.to_string(),
            level,
            budgeted_cost,
        });
        let idx = self.wbs_elements.len() - 1;
        Ok(&self.wbs_elements[idx])
    }

    fn ensure_wbs(&self, code: Option<&str>) -> Result<(), Error> {
        match code {
            Some(code) if !self.wbs_elements.iter().any(|w| w.code == code) => {
                Err(Error::not_found("WBS element", code))
            }
            _ => Ok(()),
        }
    }

    // cost postings

    pub(crate) fn post_cost(
        &mut self,
        id: String,
        document_number: String,
        input: CostActualInput,
        ctx: &ActionContext,
    ) -> Result<&CostActual, Error> {
        self.ensure_open_for_postings("post costs to")?;
        input.validate()?;
        self.ensure_wbs(input.wbs_code.as_deref())?;

        self.cost_actuals.push(CostActual {
            id,
            document_number,
            cost_element: input.cost_element,
            wbs_code: input.wbs_code,
            amount: input.amount,
            posting_date: input.posting_date,
            is_reversed: false,
            reversal_of: None,
            reversal_reason: None,
            is_allocated: false,
            posted_by: ctx.actor.user_id.clone(),
        });
        let idx = self.cost_actuals.len() - 1;
        Ok(&self.cost_actuals[idx])
    }

    /// Offsets a posting with a negative entry and marks the original reversed
    pub(crate) fn reverse_cost(
        &mut self,
        cost_actual_id: &str,
        reversal_id: String,
        reason: &str,
        ctx: &ActionContext,
    ) -> Result<&CostActual, Error> {
        self.ensure_open_for_postings("reverse costs on")?;
        if reason.trim().is_empty() {
            return Err(Error::validation("Reversal reason is required"));
        }
        let original = self
            .cost_actuals
            .iter_mut()
            .find(|ca| ca.id == cost_actual_id)
            .ok_or_else(|| Error::not_found("cost actual", cost_actual_id))?;
        if original.is_reversed {
            return Err(Error::state("cost actual", "reverse", "Reversed"));
        }
        if original.reversal_of.is_some() {
            return Err(Error::state("cost actual", "reverse", "Reversal"));
        }

        original.is_reversed = true;
        let reversal = CostActual {
            id: reversal_id,
            document_number: format!("{}-REV", original.document_number),
            cost_element: original.cost_element.clone(),
            wbs_code: original.wbs_code.clone(),
            amount: -original.amount,
            posting_date: ctx.now.clone(),
            is_reversed: false,
            reversal_of: Some(original.id.clone()),
            reversal_reason: Some(reason.to_string()),
            is_allocated: false,
            posted_by: ctx.actor.user_id.clone(),
        };
        self.cost_actuals.push(reversal);
        let idx = self.cost_actuals.len() - 1;
        Ok(&self.cost_actuals[idx])
    }

    /// Detach a posting so it can be booked on another AFE
    pub(crate) fn take_cost(&mut self, cost_actual_id: &str) -> Result<CostActual, Error> {
        self.ensure_open_for_postings("reallocate costs from")?;
        let idx = self
            .cost_actuals
            .iter()
            .position(|ca| ca.id == cost_actual_id)
            .ok_or_else(|| Error::not_found("cost actual", cost_actual_id))?;
        let posting = &self.cost_actuals[idx];
        if posting.is_reversed || posting.reversal_of.is_some() {
            return Err(Error::state("cost actual", "reallocate", "Reversed"));
        }
        if posting.is_allocated {
            return Err(Error::state("cost actual", "reallocate", "Allocated"));
        }
        Ok(self.cost_actuals.remove(idx))
    }

    pub(crate) fn receive_cost(&mut self, mut posting: CostActual, wbs_code: Option<String>) -> Result<(), Error> {
        self.ensure_open_for_postings("reallocate costs to")?;
        self.ensure_wbs(wbs_code.as_deref())?;
        posting.wbs_code = wbs_code;
        self.cost_actuals.push(posting);
        Ok(())
    }

    // commitments

    pub(crate) fn add_commitment(&mut self, id: String, input: CommitmentInput) -> Result<&Commitment, Error> {
        self.ensure_open_for_postings("add commitments to")?;
        input.validate()?;
        if self.commitments.iter().any(|c| c.po_number == input.po_number) {
            return Err(Error::Conflict(format!(
                "PO {} is already committed on AFE {}",
                input.po_number, self.afe_number
            )));
        }
        self.commitments.push(Commitment {
            id,
            po_number: input.po_number,
            vendor_id: input.vendor_id,
            amount: input.amount,
            consumed_amount: 0.0,
            remaining_amount: input.amount,
            status: CommitmentStatus::Open,
            closed_at: None,
        });
        let idx = self.commitments.len() - 1;
        Ok(&self.commitments[idx])
    }

    fn open_commitment_mut(&mut self, commitment_id: &str, action: &'static str) -> Result<&mut Commitment, Error> {
        let commitment = self
            .commitments
            .iter_mut()
            .find(|c| c.id == commitment_id)
            .ok_or_else(|| Error::not_found("commitment", commitment_id))?;
        if commitment.status == CommitmentStatus::Closed {
            return Err(Error::state("commitment", action, "Closed"));
        }
        Ok(commitment)
    }

    pub(crate) fn consume_commitment(&mut self, commitment_id: &str, amount: f64) -> Result<(), Error> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(Error::validation("Consumed amount must be greater than zero"));
        }
        let commitment = self.open_commitment_mut(commitment_id, "consume")?;
        if amount > commitment.remaining_amount + 1e-9 {
            return Err(Error::validation(format!(
                "Consumed amount {amount} exceeds remaining {}",
                commitment.remaining_amount
            )));
        }
        commitment.consumed_amount += amount;
        commitment.remaining_amount = (commitment.amount - commitment.consumed_amount).max(0.0);
        Ok(())
    }

    pub(crate) fn close_commitment(&mut self, commitment_id: &str, now: TimeStamp<Utc>) -> Result<(), Error> {
        let commitment = self.open_commitment_mut(commitment_id, "close")?;
        commitment.status = CommitmentStatus::Closed;
        commitment.closed_at = Some(now);
        Ok(())
    }

    // approval workflow

    pub(crate) fn submit(
        &mut self,
        chain: Vec<ApprovalMatrixEntry>,
        approval_id: String,
        ctx: &ActionContext,
    ) -> Result<(), Error> {
        self.status.apply(AfeAction::SubmitForApproval)?;
        if self.line_items.is_empty() {
            return Err(Error::validation(
                "AFE must have at least one line item before submission",
            ));
        }
        if approval::pending_count(&self.approvals) > 0 {
            return Err(Error::state("AFE", "submit", "approval already pending"));
        }

        self.transition(AfeAction::SubmitForApproval, ctx, None)?;
        self.approval_chain = chain;
        self.approvals.push(Approval::pending(
            approval_id,
            0,
            self.approval_chain.first(),
            ctx.now.clone(),
        ));
        self.submitted_at = Some(ctx.now.clone());
        self.submitted_by = Some(ctx.actor.user_id.clone());
        Ok(())
    }

    pub fn pending_approval(&self) -> Option<&Approval> {
        self.approvals
            .iter()
            .find(|a| a.status == ApprovalStatus::Pending)
    }

    /// Decide the pending step. The AFE is approved once the last level of
    /// the captured chain signs off.
    pub(crate) fn approve(
        &mut self,
        next_approval_id: String,
        comments: Option<String>,
        ctx: &ActionContext,
    ) -> Result<ApprovalOutcome, Error> {
        self.status.apply(AfeAction::Approve)?;
        let pending = approval::sole_pending_mut(&mut self.approvals, "AFE")?;
        pending.ensure_decidable_by(&ctx.actor)?;
        pending.decide(ApprovalStatus::Approved, comments.clone(), ctx);
        let next = pending.chain_index as usize + 1;

        if let Some(step) = self.approval_chain.get(next) {
            let approval = Approval::pending(next_approval_id, next as u32, Some(step), ctx.now.clone());
            let level = approval.level;
            self.approvals.push(approval);
            tracing::info!(afe = %self.afe_number, level, "approval advanced to next level");
            return Ok(ApprovalOutcome::Advanced { level });
        }

        self.transition(AfeAction::Approve, ctx, comments.clone())?;
        self.approved_cost = self.estimated_cost;
        self.approval_conditions = comments;
        self.approved_at = Some(ctx.now.clone());
        self.approved_by = Some(ctx.actor.user_id.clone());
        Ok(ApprovalOutcome::Approved)
    }

    /// Reject, return for revision and cancel close out any open step.
    fn close_pending(&mut self, comments: &Option<String>, ctx: &ActionContext) {
        for approval in self
            .approvals
            .iter_mut()
            .filter(|a| a.status == ApprovalStatus::Pending)
        {
            approval.decide(ApprovalStatus::Rejected, comments.clone(), ctx);
        }
    }

    fn ensure_pending_decidable(&self, actor: &Actor) -> Result<(), Error> {
        match self.pending_approval() {
            Some(pending) => pending.ensure_decidable_by(actor),
            None => Ok(()),
        }
    }

    pub(crate) fn reject(&mut self, reason: Option<String>, ctx: &ActionContext) -> Result<(), Error> {
        self.status.apply(AfeAction::Reject)?;
        self.ensure_pending_decidable(&ctx.actor)?;
        self.close_pending(&reason, ctx);
        self.transition(AfeAction::Reject, ctx, reason.clone())?;
        self.rejection_reason = reason;
        Ok(())
    }

    pub(crate) fn return_for_revision(&mut self, comments: Option<String>, ctx: &ActionContext) -> Result<(), Error> {
        self.status.apply(AfeAction::ReturnForRevision)?;
        self.ensure_pending_decidable(&ctx.actor)?;
        self.close_pending(&comments, ctx);
        self.transition(AfeAction::ReturnForRevision, ctx, comments.clone())?;
        self.revision_comments = comments;
        Ok(())
    }

    pub(crate) fn activate(&mut self, ctx: &ActionContext) -> Result<(), Error> {
        self.transition(AfeAction::Activate, ctx, None)?;
        self.activated_at = Some(ctx.now.clone());
        Ok(())
    }

    pub(crate) fn close(&mut self, ctx: &ActionContext) -> Result<(), Error> {
        self.transition(AfeAction::Close, ctx, None)?;
        self.closed_at = Some(ctx.now.clone());
        Ok(())
    }

    pub(crate) fn cancel(&mut self, reason: Option<String>, ctx: &ActionContext) -> Result<(), Error> {
        self.status.apply(AfeAction::Cancel)?;
        self.close_pending(&reason, ctx);
        self.transition(AfeAction::Cancel, ctx, reason)?;
        self.cancelled_at = Some(ctx.now.clone());
        Ok(())
    }

    fn pending_step_mut(&mut self, action: &'static str) -> Result<&mut Approval, Error> {
        if self.status != AfeStatus::PendingApproval {
            return Err(Error::state("AFE", action, self.status));
        }
        approval::sole_pending_mut(&mut self.approvals, "AFE")
    }

    pub(crate) fn escalate(&mut self) -> Result<&Approval, Error> {
        let pending = self.pending_step_mut("escalate approval for")?;
        pending.level += 1;
        pending.is_escalated = true;
        Ok(pending)
    }

    pub(crate) fn delegate(&mut self, delegate_to: &str, actor: &Actor) -> Result<&Approval, Error> {
        if delegate_to.trim().is_empty() {
            return Err(Error::validation("Delegate user is required"));
        }
        let pending = self.pending_step_mut("delegate approval for")?;
        pending.ensure_decidable_by(actor)?;
        pending.delegated_to = Some(delegate_to.to_string());
        Ok(pending)
    }

    // variance review

    pub(crate) fn approve_variance(&mut self, comments: Option<String>) -> Result<(), Error> {
        match self.variance_review {
            VarianceReview::PendingReview | VarianceReview::ExplanationRequested { .. } => {
                self.variance_review = VarianceReview::Accepted;
                self.variance_comments = comments;
                Ok(())
            }
            ref other => Err(Error::state("AFE variance", "approve", other)),
        }
    }

    pub(crate) fn request_variance_explanation(&mut self, from_user: &str) -> Result<(), Error> {
        if from_user.trim().is_empty() {
            return Err(Error::validation("User to explain the variance is required"));
        }
        if self.variance_review != VarianceReview::PendingReview {
            return Err(Error::state(
                "AFE variance",
                "request an explanation for",
                &self.variance_review,
            ));
        }
        self.variance_review = VarianceReview::ExplanationRequested {
            from: from_user.to_string(),
        };
        Ok(())
    }

    /// Estimate against actual per cost element
    pub fn variance_breakdown(&self) -> Vec<CostElementVariance> {
        let mut by_element: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
        for item in &self.line_items {
            by_element.entry(&item.cost_element).or_default().0 += item.total_cost;
        }
        for posting in &self.cost_actuals {
            by_element.entry(&posting.cost_element).or_default().1 += posting.amount;
        }

        by_element
            .into_iter()
            .map(|(element, (estimated, actual))| {
                let variance = actual - estimated;
                CostElementVariance {
                    cost_element: element.to_string(),
                    estimated,
                    actual,
                    variance,
                    variance_pct: variance_pct(estimated, actual),
                    category: if variance >= 0.0 {
                        VarianceCategory::Unfavorable
                    } else {
                        VarianceCategory::Favorable
                    },
                }
            })
            .collect()
    }

    pub fn validate_rules(&self, variance_threshold_pct: f64) -> Vec<RuleFinding> {
        let mut findings = vec![];
        if self.title.trim().is_empty() {
            findings.push(RuleFinding {
                rule_code: "TITLE_REQUIRED",
                severity: Severity::Error,
                message: "AFE title is required".into(),
            });
        }
        if self.estimated_cost <= 0.0 {
            findings.push(RuleFinding {
                rule_code: "COST_REQUIRED",
                severity: Severity::Error,
                message: "Valid estimated cost is required".into(),
            });
        }
        if self.line_items.is_empty() {
            findings.push(RuleFinding {
                rule_code: "LINE_ITEMS_REQUIRED",
                severity: Severity::Warning,
                message: "AFE has no line items".into(),
            });
        }
        let pct = self.variance_pct();
        if pct.abs() > variance_threshold_pct {
            findings.push(RuleFinding {
                rule_code: "VARIANCE_THRESHOLD",
                severity: Severity::Warning,
                message: format!(
                    "Variance of {pct:.2}% exceeds {variance_threshold_pct}% threshold"
                ),
            });
        }
        findings
    }

    /// Split every unallocated posting across the partners by working
    /// interest. Reversals split negatively, so a reversed pair nets out.
    pub(crate) fn allocate(
        &mut self,
        interests: &[PartnerInterest],
        now: &TimeStamp<Utc>,
    ) -> Result<Vec<CostAllocation>, Error> {
        if interests.is_empty() {
            return Err(Error::validation(format!(
                "Well {} has no partner interests to allocate against",
                self.well_id
            )));
        }

        let mut created = vec![];
        for posting in self.cost_actuals.iter_mut().filter(|ca| !ca.is_allocated) {
            for interest in interests {
                created.push(CostAllocation {
                    cost_actual_id: posting.id.clone(),
                    partner_id: interest.partner_id.clone(),
                    gross_amount: posting.amount,
                    working_interest: interest.working_interest,
                    net_amount: posting.amount * interest.working_interest / 100.0,
                    allocated_at: now.clone(),
                });
            }
            posting.is_allocated = true;
        }
        self.allocations.extend(created.iter().cloned());
        Ok(created)
    }
}
