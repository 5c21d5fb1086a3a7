//! Cost postings, commitments, variance review, partner interests and JIB
use super::WellCostService;
use crate::afe::{Afe, CommitmentInput, CostActualInput, CostAllocation, CostElementVariance};
use crate::context::{ActionContext, TimeStamp};
use crate::error::Error;
use crate::interest::{
    self, InterestValidation, JibFailure, JibGenerationReport, JibStatement, PartnerInterest,
    WellInterests,
};
use chrono::{Datelike, Utc};
use tracing::{info, warn};

impl WellCostService {
    /// Book an actual cost against an AFE. The document number comes from
    /// the yearly CA series.
    pub fn post_cost_actual(&self, afe_id: &str, input: CostActualInput, ctx: &ActionContext) -> Result<Afe, Error> {
        input.validate()?;
        let id = Self::new_id("ca_")?;
        let document_number = self.next_number(&self.config.numbering.cost_actual, ctx.now.year())?;
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| {
            afe.post_cost(id, document_number, input, ctx)?;
            Ok(())
        })?;
        info!(afe = %afe.afe_number, actual = afe.actual_cost, "cost actual posted");
        Ok(afe)
    }

    pub fn reverse_cost_actual(
        &self,
        afe_id: &str,
        cost_actual_id: &str,
        reason: &str,
        ctx: &ActionContext,
    ) -> Result<Afe, Error> {
        let reversal_id = Self::new_id("ca_")?;
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| {
            afe.reverse_cost(cost_actual_id, reversal_id, reason, ctx)?;
            Ok(())
        })?;
        info!(afe = %afe.afe_number, cost_actual = %cost_actual_id, "cost actual reversed");
        Ok(afe)
    }

    /// Move a posting to another AFE. Both AFEs are re-aggregated and written
    /// in one transaction.
    pub fn reallocate_cost_actual(
        &self,
        from_afe_id: &str,
        cost_actual_id: &str,
        to_afe_id: &str,
        wbs_code: Option<String>,
        ctx: &ActionContext,
    ) -> Result<(Afe, Afe), Error> {
        if from_afe_id == to_afe_id {
            return Err(Error::validation("Cost actual is already booked on this AFE"));
        }
        let source_snapshot = self.store.afes.load(from_afe_id)?;
        let target_snapshot = self.store.afes.load(to_afe_id)?;
        let mut source = source_snapshot.value.clone();
        let mut target = target_snapshot.value.clone();

        let posting = source.take_cost(cost_actual_id)?;
        target.receive_cost(posting, wbs_code)?;

        let threshold = self.config.variance.threshold_pct;
        for afe in [&mut source, &mut target] {
            afe.recompute_totals(threshold);
            afe.audit.touch(ctx);
        }
        self.store
            .afes
            .replace_pair((&source_snapshot, &source), (&target_snapshot, &target))?;
        info!(
            cost_actual = %cost_actual_id,
            from = %source.afe_number,
            to = %target.afe_number,
            "cost actual reallocated"
        );
        Ok((source, target))
    }

    pub fn add_commitment(&self, afe_id: &str, input: CommitmentInput, ctx: &ActionContext) -> Result<Afe, Error> {
        let id = Self::new_id("cm_")?;
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| {
            afe.add_commitment(id, input)?;
            Ok(())
        })?;
        Ok(afe)
    }

    pub fn consume_commitment(
        &self,
        afe_id: &str,
        commitment_id: &str,
        amount: f64,
        ctx: &ActionContext,
    ) -> Result<Afe, Error> {
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| afe.consume_commitment(commitment_id, amount))?;
        Ok(afe)
    }

    pub fn close_commitment(&self, afe_id: &str, commitment_id: &str, ctx: &ActionContext) -> Result<Afe, Error> {
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| {
            afe.close_commitment(commitment_id, ctx.now.clone())
        })?;
        Ok(afe)
    }

    pub fn approve_variance(&self, afe_id: &str, comments: Option<String>, ctx: &ActionContext) -> Result<Afe, Error> {
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| afe.approve_variance(comments))?;
        info!(afe = %afe.afe_number, user = %ctx.user_id(), "variance accepted");
        Ok(afe)
    }

    pub fn request_variance_explanation(
        &self,
        afe_id: &str,
        from_user: &str,
        ctx: &ActionContext,
    ) -> Result<Afe, Error> {
        let (afe, _) = self.modify_afe(afe_id, ctx, |afe| afe.request_variance_explanation(from_user))?;
        info!(afe = %afe.afe_number, from = %from_user, "variance explanation requested");
        Ok(afe)
    }

    pub fn variance_breakdown(&self, afe_id: &str) -> Result<Vec<CostElementVariance>, Error> {
        Ok(self.get_afe(afe_id)?.variance_breakdown())
    }

    /// Split the AFE's unallocated postings across the well's partners
    pub fn allocate_costs(&self, afe_id: &str, ctx: &ActionContext) -> Result<Vec<CostAllocation>, Error> {
        let well_id = self.get_afe(afe_id)?.well_id;
        let interests = self.partner_interests(&well_id)?;
        let (afe, created) = self.modify_afe(afe_id, ctx, |afe| {
            afe.allocate(&interests, &ctx.now)
        })?;
        info!(afe = %afe.afe_number, allocations = created.len(), "costs allocated to partners");
        Ok(created)
    }

    // partner interests

    /// Interests of a well; empty when none were recorded
    pub fn partner_interests(&self, well_id: &str) -> Result<Vec<PartnerInterest>, Error> {
        Ok(self
            .store
            .interests
            .get(well_id)?
            .map(|well| well.interests)
            .unwrap_or_default())
    }

    pub fn add_partner_interest(
        &self,
        well_id: &str,
        partner_id: &str,
        working_interest: f64,
        net_revenue_interest: Option<f64>,
        ctx: &ActionContext,
    ) -> Result<WellInterests, Error> {
        if well_id.trim().is_empty() {
            return Err(Error::validation("Well reference is required"));
        }
        let id = Self::new_id("pi_")?;

        if !self.store.interests.contains(well_id)? {
            let mut interests = WellInterests::new(well_id, ctx);
            interests.add(id, partner_id, working_interest, net_revenue_interest)?;
            // a concurrent first insert for the same well surfaces as a conflict
            self.store.interests.insert_new(well_id, &interests)?;
            info!(well = %well_id, partner = %partner_id, working_interest, "partner interest added");
            return Ok(interests);
        }

        let interests = self.modify_interests(well_id, ctx, |interests| {
            interests.add(id, partner_id, working_interest, net_revenue_interest)?;
            Ok(())
        })?;
        info!(well = %well_id, partner = %partner_id, working_interest, "partner interest added");
        Ok(interests)
    }

    pub fn update_partner_interest(
        &self,
        well_id: &str,
        partner_id: &str,
        working_interest: f64,
        net_revenue_interest: Option<f64>,
        ctx: &ActionContext,
    ) -> Result<WellInterests, Error> {
        self.modify_interests(well_id, ctx, |interests| {
            interests.update(partner_id, working_interest, net_revenue_interest)?;
            Ok(())
        })
    }

    pub fn remove_partner_interest(&self, well_id: &str, partner_id: &str, ctx: &ActionContext) -> Result<WellInterests, Error> {
        self.modify_interests(well_id, ctx, |interests| {
            interests.remove(partner_id)?;
            Ok(())
        })
    }

    pub fn grant_consent(&self, well_id: &str, partner_id: &str, ctx: &ActionContext) -> Result<WellInterests, Error> {
        self.modify_interests(well_id, ctx, |interests| {
            interests.grant_consent(partner_id, ctx.now.clone())?;
            Ok(())
        })
    }

    pub fn mark_non_consent(
        &self,
        well_id: &str,
        partner_id: &str,
        reason: &str,
        ctx: &ActionContext,
    ) -> Result<WellInterests, Error> {
        self.modify_interests(well_id, ctx, |interests| {
            interests.mark_non_consent(partner_id, reason, ctx.now.clone())?;
            Ok(())
        })
    }

    pub fn validate_partner_interests(&self, well_id: &str) -> Result<InterestValidation, Error> {
        Ok(interest::validate_interests(&self.partner_interests(well_id)?))
    }

    // joint interest billing

    /// Create one Draft statement for a partner and period. The
    /// well/partner/period key is claimed in the same transaction.
    pub fn create_jib_statement(
        &self,
        well_id: &str,
        partner_id: &str,
        period_from: TimeStamp<Utc>,
        period_to: TimeStamp<Utc>,
        ctx: &ActionContext,
    ) -> Result<JibStatement, Error> {
        interest::validate_period(&period_from, &period_to)?;
        let key = interest::period_key(well_id, partner_id, &period_from, &period_to);
        if self.store.jib_periods.contains_key(key.as_bytes())? {
            return Err(Error::Conflict(format!(
                "JIB statement for partner {partner_id} on well {well_id} already exists for this period"
            )));
        }

        let number = self.next_number(&self.config.numbering.jib, ctx.now.year())?;
        let statement = JibStatement::draft(
            Self::new_id("jib_")?,
            number,
            well_id,
            partner_id,
            period_from,
            period_to,
            ctx,
        );
        self.store.jib.insert_indexed(
            &statement.id,
            &statement,
            &self.store.jib_periods,
            "billing period",
            &key,
        )?;
        info!(statement = %statement.statement_number, partner = %partner_id, "JIB statement created");
        Ok(statement)
    }

    /// One statement per partner of the well. Each partner is handled on its
    /// own; failures are collected and the remaining partners continue.
    pub fn generate_jib_statements(
        &self,
        well_id: &str,
        period_from: TimeStamp<Utc>,
        period_to: TimeStamp<Utc>,
        ctx: &ActionContext,
    ) -> Result<JibGenerationReport, Error> {
        interest::validate_period(&period_from, &period_to)?;
        let interests = self.partner_interests(well_id)?;
        if interests.is_empty() {
            return Err(Error::validation(format!(
                "Well {well_id} has no partner interests to bill"
            )));
        }

        let mut report = JibGenerationReport::default();
        for partner in &interests {
            match self.create_jib_statement(
                well_id,
                &partner.partner_id,
                period_from.clone(),
                period_to.clone(),
                ctx,
            ) {
                Ok(statement) => report.created.push(statement),
                Err(error) => {
                    warn!(well = %well_id, partner = %partner.partner_id, %error, "JIB statement not generated");
                    report.failures.push(JibFailure {
                        partner_id: partner.partner_id.clone(),
                        error,
                    });
                }
            }
        }
        Ok(report)
    }

    pub fn get_jib_statement(&self, statement_id: &str) -> Result<JibStatement, Error> {
        Ok(self.store.jib.load(statement_id)?.into_value())
    }

    /// Statements of a partner whose billing period falls inside `year`
    pub fn jib_statements_for_partner(&self, partner_id: &str, year: i32) -> Result<Vec<JibStatement>, Error> {
        self.store.jib.scan_where(|s| {
            s.partner_id == partner_id
                && s.period_from.to_datetime_utc().year() == year
                && s.period_to.to_datetime_utc().year() == year
        })
    }

    pub fn add_jib_line_item(
        &self,
        statement_id: &str,
        description: &str,
        cost_element: Option<String>,
        amount: f64,
        ctx: &ActionContext,
    ) -> Result<JibStatement, Error> {
        let id = Self::new_id("jl_")?;
        self.modify_jib(statement_id, ctx, |statement| {
            statement.add_line_item(id, description, cost_element, amount)?;
            Ok(())
        })
    }

    pub fn calculate_jib(&self, statement_id: &str, ctx: &ActionContext) -> Result<JibStatement, Error> {
        let snapshot = self.store.jib.load(statement_id)?;
        let well = self
            .store
            .interests
            .get(&snapshot.value.well_id)?
            .unwrap_or_else(|| WellInterests::new(&snapshot.value.well_id, ctx));
        let mut statement = snapshot.value.clone();
        statement.calculate(&well, ctx.now.clone())?;
        statement.audit.touch(ctx);
        self.store.jib.replace(&snapshot, &statement)?;
        Ok(statement)
    }

    pub fn send_jib(&self, statement_id: &str, ctx: &ActionContext) -> Result<JibStatement, Error> {
        let statement = self.modify_jib(statement_id, ctx, |statement| statement.send(ctx))?;
        info!(statement = %statement.statement_number, "JIB statement sent");
        Ok(statement)
    }

    pub fn mark_jib_paid(&self, statement_id: &str, payment_reference: &str, ctx: &ActionContext) -> Result<JibStatement, Error> {
        self.modify_jib(statement_id, ctx, |statement| {
            statement.mark_paid(payment_reference, ctx.now.clone())
        })
    }

    pub fn mark_jib_disputed(&self, statement_id: &str, reason: &str, ctx: &ActionContext) -> Result<JibStatement, Error> {
        let statement = self.modify_jib(statement_id, ctx, |statement| {
            statement.mark_disputed(reason, ctx.now.clone())
        })?;
        warn!(statement = %statement.statement_number, %reason, "JIB statement disputed");
        Ok(statement)
    }
}
