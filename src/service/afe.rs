//! AFE lifecycle, approval routing and the approval matrix
use super::WellCostService;
use crate::afe::{Afe, AfeDetails, AfeStatus, AfeTotals, AfeUpdate, ApprovalOutcome, LineItemInput, RuleFinding};
use crate::approval::{self, Approval, ApprovalMatrixEntry};
use crate::context::{ActionContext, Audit};
use crate::error::Error;
use tracing::info;

/// A pending approval step waiting on a particular user
#[derive(Debug, Clone, PartialEq)]
pub struct PendingApprovalItem {
    pub afe_id: String,
    pub afe_number: String,
    pub approval: Approval,
}

impl WellCostService {
    fn generate_afe_number(&self, year: i32) -> Result<String, Error> {
        // skip numbers already claimed explicitly by users
        loop {
            let number = self.next_number(&self.config.numbering.afe, year)?;
            if !self.store.afe_numbers.contains_key(number.as_bytes())? {
                return Ok(number);
            }
        }
    }

    /// Create a Draft AFE. The number comes from the yearly series unless the
    /// details carry one; an explicit number already in use is a conflict.
    pub fn create_afe(&self, details: AfeDetails, ctx: &ActionContext) -> Result<Afe, Error> {
        let draft = details.validate_and_finalise()?;
        let afe_number = match &draft.afe_number {
            Some(number) => number.clone(),
            None => self.generate_afe_number(ctx.now.year())?,
        };
        let afe = Afe::new(Self::new_id("afe_")?, afe_number, draft, ctx);

        self.store
            .afes
            .insert_indexed(&afe.id, &afe, &self.store.afe_numbers, "number", &afe.afe_number)?;
        info!(afe = %afe.afe_number, id = %afe.id, user = %ctx.user_id(), "AFE created");
        Ok(afe)
    }

    pub fn get_afe(&self, afe_id: &str) -> Result<Afe, Error> {
        Ok(self.store.afes.load(afe_id)?.into_value())
    }

    pub fn get_afe_by_number(&self, afe_number: &str) -> Result<Afe, Error> {
        let id = self
            .store
            .afe_id_by_number(afe_number)?
            .ok_or_else(|| Error::not_found("AFE", afe_number))?;
        self.get_afe(&id)
    }

    pub fn afes_by_status(&self, status: AfeStatus) -> Result<Vec<Afe>, Error> {
        self.store.afes.scan_where(|afe| afe.status == status)
    }

    pub fn afes_by_well(&self, well_id: &str) -> Result<Vec<Afe>, Error> {
        self.store.afes.scan_where(|afe| afe.well_id == well_id)
    }

    pub fn update_afe(&self, afe_id: &str, update: AfeUpdate, ctx: &ActionContext) -> Result<Afe, Error> {
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| {
            afe.ensure_editable(&ctx.actor)?;
            afe.apply_update(update)
        })?;
        Ok(afe)
    }

    /// Only Draft AFEs can be deleted; the number is released with it.
    pub fn delete_afe(&self, afe_id: &str, ctx: &ActionContext) -> Result<(), Error> {
        let snapshot = self.store.afes.load(afe_id)?;
        let afe = &snapshot.value;
        if !afe.status.can_delete() {
            return Err(Error::state("AFE", "delete", afe.status));
        }
        self.store
            .afes
            .remove_indexed(&snapshot, &self.store.afe_numbers, &afe.afe_number)?;
        info!(afe = %afe.afe_number, user = %ctx.user_id(), "AFE deleted");
        Ok(())
    }

    pub fn add_line_item(&self, afe_id: &str, input: LineItemInput, ctx: &ActionContext) -> Result<Afe, Error> {
        let id = Self::new_id("li_")?;
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| {
            afe.ensure_editable(&ctx.actor)?;
            afe.add_line_item(id, input)?;
            Ok(())
        })?;
        Ok(afe)
    }

    pub fn update_line_item(
        &self,
        afe_id: &str,
        line_item_id: &str,
        input: LineItemInput,
        ctx: &ActionContext,
    ) -> Result<Afe, Error> {
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| {
            afe.ensure_editable(&ctx.actor)?;
            afe.update_line_item(line_item_id, input)
        })?;
        Ok(afe)
    }

    pub fn remove_line_item(&self, afe_id: &str, line_item_id: &str, ctx: &ActionContext) -> Result<Afe, Error> {
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| {
            afe.ensure_editable(&ctx.actor)?;
            afe.remove_line_item(line_item_id)?;
            Ok(())
        })?;
        Ok(afe)
    }

    pub fn add_wbs_element(
        &self,
        afe_id: &str,
        code: &str,
        name: &str,
        level: u32,
        budgeted_cost: f64,
        ctx: &ActionContext,
    ) -> Result<Afe, Error> {
        let id = Self::new_id("wbs_")?;
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| {
            afe.ensure_editable(&ctx.actor)?;
            afe.add_wbs_element(id, code, name, level, budgeted_cost)?;
            Ok(())
        })?;
        Ok(afe)
    }

    /// Route the AFE into approval. The chain is looked up from the matrix
    /// for the current estimate and captured on the AFE.
    pub fn submit_for_approval(&self, afe_id: &str, ctx: &ActionContext) -> Result<Afe, Error> {
        let matrix = self.store.matrix.scan()?;
        let approval_id = Self::new_id("apr_")?;
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| {
            let chain = approval::approval_chain(
                &matrix,
                afe.estimated_cost,
                afe.well_type.as_deref(),
                afe.field_id.as_deref(),
            );
            afe.submit(chain, approval_id, ctx)
        })?;
        info!(
            afe = %afe.afe_number,
            levels = afe.approval_chain.len().max(1),
            "AFE submitted for approval"
        );
        Ok(afe)
    }

    pub fn approve(&self, afe_id: &str, comments: Option<String>, ctx: &ActionContext) -> Result<Afe, Error> {
        let next_id = Self::new_id("apr_")?;
        let (afe, outcome) = self.modify_afe(afe_id, ctx, |afe| afe.approve(next_id, comments, ctx))?;
        if outcome == ApprovalOutcome::Approved {
            info!(afe = %afe.afe_number, approved_cost = afe.approved_cost, "AFE fully approved");
        }
        Ok(afe)
    }

    pub fn reject(&self, afe_id: &str, reason: Option<String>, ctx: &ActionContext) -> Result<Afe, Error> {
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| afe.reject(reason, ctx))?;
        Ok(afe)
    }

    pub fn return_for_revision(&self, afe_id: &str, comments: Option<String>, ctx: &ActionContext) -> Result<Afe, Error> {
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| afe.return_for_revision(comments, ctx))?;
        Ok(afe)
    }

    pub fn activate(&self, afe_id: &str, ctx: &ActionContext) -> Result<Afe, Error> {
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| afe.activate(ctx))?;
        Ok(afe)
    }

    pub fn close(&self, afe_id: &str, ctx: &ActionContext) -> Result<Afe, Error> {
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| afe.close(ctx))?;
        Ok(afe)
    }

    pub fn cancel(&self, afe_id: &str, reason: Option<String>, ctx: &ActionContext) -> Result<Afe, Error> {
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| afe.cancel(reason, ctx))?;
        Ok(afe)
    }

    /// Supplementary AFE for additional spend on an approved or active one,
    /// numbered `<parent>-S<n>`.
    pub fn create_supplement(
        &self,
        parent_afe_id: &str,
        estimated_cost: f64,
        justification: Option<String>,
        ctx: &ActionContext,
    ) -> Result<Afe, Error> {
        let parent = self.get_afe(parent_afe_id)?;
        // next after the highest surviving suffix; deleted drafts may leave gaps
        let prefix = format!("{}-S", parent.afe_number);
        let highest = self
            .store
            .afes
            .scan_where(|afe| afe.parent_afe_id.as_deref() == Some(parent.id.as_str()))?
            .iter()
            .filter_map(|afe| afe.afe_number.strip_prefix(&prefix)?.parse::<usize>().ok())
            .max()
            .unwrap_or(0);
        let supplement = Afe::supplement_of(
            &parent,
            Self::new_id("afe_")?,
            highest + 1,
            estimated_cost,
            justification,
            ctx,
        )?;

        self.store.afes.insert_indexed(
            &supplement.id,
            &supplement,
            &self.store.afe_numbers,
            "number",
            &supplement.afe_number,
        )?;
        info!(afe = %supplement.afe_number, parent = %parent.afe_number, "supplement AFE created");
        Ok(supplement)
    }

    pub fn escalate_approval(&self, afe_id: &str, ctx: &ActionContext) -> Result<Afe, Error> {
        let (afe, level) = self.modify_afe(afe_id, ctx, |afe| Ok(afe.escalate()?.level))?;
        info!(afe = %afe.afe_number, level, user = %ctx.user_id(), "approval escalated");
        Ok(afe)
    }

    pub fn delegate_approval(&self, afe_id: &str, delegate_to: &str, ctx: &ActionContext) -> Result<Afe, Error> {
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| {
            afe.delegate(delegate_to, &ctx.actor)?;
            Ok(())
        })?;
        info!(afe = %afe.afe_number, delegate = %delegate_to, "approval delegated");
        Ok(afe)
    }

    /// Pending steps assigned to `user_id`, directly or by delegation
    pub fn pending_approvals_for(&self, user_id: &str) -> Result<Vec<PendingApprovalItem>, Error> {
        let afes = self.afes_by_status(AfeStatus::PendingApproval)?;
        Ok(afes
            .into_iter()
            .filter_map(|afe| {
                let approval = afe.pending_approval()?.clone();
                (approval.assignee() == Some(user_id)).then(|| PendingApprovalItem {
                    afe_id: afe.id.clone(),
                    afe_number: afe.afe_number.clone(),
                    approval,
                })
            })
            .collect())
    }

    /// Re-aggregate the AFE's totals from its child records. Writes only when
    /// a figure actually moved.
    pub fn recompute_afe_totals(&self, afe_id: &str, ctx: &ActionContext) -> Result<AfeTotals, Error> {
        let snapshot = self.store.afes.load(afe_id)?;
        let mut afe = snapshot.value.clone();
        afe.recompute_totals(self.config.variance.threshold_pct);
        if afe != snapshot.value {
            afe.audit.touch(ctx);
            self.store.afes.replace(&snapshot, &afe)?;
        }
        Ok(afe.totals())
    }

    pub fn afe_summary(&self, afe_id: &str) -> Result<AfeTotals, Error> {
        Ok(self.get_afe(afe_id)?.totals())
    }

    pub fn validate_afe(&self, afe_id: &str) -> Result<Vec<RuleFinding>, Error> {
        Ok(self
            .get_afe(afe_id)?
            .validate_rules(self.config.variance.threshold_pct))
    }

    pub fn register_matrix_entry(
        &self,
        mut entry: ApprovalMatrixEntry,
        ctx: &ActionContext,
    ) -> Result<ApprovalMatrixEntry, Error> {
        entry.validate()?;
        entry.audit = Some(Audit::created(ctx));
        self.store.matrix.insert_new(&entry.code, &entry)?;
        info!(code = %entry.code, level = entry.approval_level, "approval matrix entry registered");
        Ok(entry)
    }

    pub fn set_matrix_entry_active(
        &self,
        code: &str,
        active: bool,
        ctx: &ActionContext,
    ) -> Result<ApprovalMatrixEntry, Error> {
        let snapshot = self.store.matrix.load(code)?;
        let mut entry = snapshot.value.clone();
        entry.is_active = active;
        match entry.audit.as_mut() {
            Some(audit) => audit.touch(ctx),
            None => entry.audit = Some(Audit::created(ctx)),
        }
        self.store.matrix.replace(&snapshot, &entry)?;
        Ok(entry)
    }

    /// The approval chain an AFE with these attributes would be routed to
    pub fn approval_matrix_for(
        &self,
        amount: f64,
        well_type: Option<&str>,
        field_id: Option<&str>,
    ) -> Result<Vec<ApprovalMatrixEntry>, Error> {
        let matrix = self.store.matrix.scan()?;
        Ok(approval::approval_chain(&matrix, amount, well_type, field_id))
    }
}
