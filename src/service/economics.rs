use super::WellCostService;
use crate::approval::{self, Approval, ApprovalStatus};
use crate::context::{ActionContext, Audit};
use crate::economics::{
    self, AnalysisComparison, AnalysisStatus, CashFlow, CashFlowInput, EconomicsAnalysis,
    MonteCarloRun, ScenarioAdjustment, ScenarioResult, SensitivityResult,
};
use crate::error::Error;
use crate::metrics;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

/// Inputs for a new economics analysis
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    pub name: String,
    pub well_id: String,
    pub afe_id: Option<String>,
    /// Falls back to the configured default rate
    pub discount_rate_pct: Option<f64>,
}

impl AnalysisRequest {
    pub fn new(name: &str, well_id: &str) -> Self {
        Self {
            name: name.to_string(),
            well_id: well_id.to_string(),
            ..Default::default()
        }
    }

    pub fn set_afe(mut self, afe_id: &str) -> Self {
        self.afe_id = Some(afe_id.to_string());
        self
    }

    pub fn set_discount_rate(mut self, rate_pct: f64) -> Self {
        self.discount_rate_pct = Some(rate_pct);
        self
    }
}

impl WellCostService {
    pub fn create_analysis(&self, request: AnalysisRequest, ctx: &ActionContext) -> Result<EconomicsAnalysis, Error> {
        if request.name.trim().is_empty() {
            return Err(Error::validation("Analysis name is required"));
        }
        if request.well_id.trim().is_empty() {
            return Err(Error::validation("Well reference is required"));
        }
        let discount_rate_pct = request
            .discount_rate_pct
            .unwrap_or(self.config.economics.default_discount_rate_pct);
        economics::validate_discount_rate(discount_rate_pct)?;
        if let Some(afe_id) = &request.afe_id {
            if !self.store.afes.contains(afe_id)? {
                return Err(Error::not_found("AFE", afe_id.as_str()));
            }
        }

        let analysis = EconomicsAnalysis {
            id: Self::new_id("econ_")?,
            analysis_number: self.next_number(&self.config.numbering.analysis, ctx.now.year())?,
            name: request.name,
            well_id: request.well_id,
            afe_id: request.afe_id,
            discount_rate_pct,
            status: AnalysisStatus::Draft,
            cash_flows: vec![],
            metrics: None,
            monte_carlo: None,
            sensitivity: vec![],
            approvals: vec![],
            approval_comments: None,
            rejection_comments: None,
            submitted_at: None,
            submitted_by: None,
            approved_at: None,
            approved_by: None,
            audit: Audit::created(ctx),
        };
        self.store.analyses.insert_new(&analysis.id, &analysis)?;
        info!(analysis = %analysis.analysis_number, well = %analysis.well_id, "economics analysis created");
        Ok(analysis)
    }

    /// Analysis for the AFE's well, linked back to the AFE
    pub fn create_analysis_from_afe(&self, afe_id: &str, name: Option<&str>, ctx: &ActionContext) -> Result<EconomicsAnalysis, Error> {
        let afe = self.get_afe(afe_id)?;
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("{} economics", afe.afe_number),
        };
        let mut request = AnalysisRequest::new(&name, &afe.well_id);
        request.afe_id = Some(afe.id);
        self.create_analysis(request, ctx)
    }

    pub fn get_analysis(&self, analysis_id: &str) -> Result<EconomicsAnalysis, Error> {
        Ok(self.store.analyses.load(analysis_id)?.into_value())
    }

    pub fn analyses_by_well(&self, well_id: &str) -> Result<Vec<EconomicsAnalysis>, Error> {
        self.store.analyses.scan_where(|a| a.well_id == well_id)
    }

    pub fn set_discount_rate(&self, analysis_id: &str, rate_pct: f64, ctx: &ActionContext) -> Result<EconomicsAnalysis, Error> {
        economics::validate_discount_rate(rate_pct)?;
        let irr = &self.config.economics.irr;
        self.modify_analysis(analysis_id, ctx, |analysis| {
            analysis.ensure_editable("change the discount rate of")?;
            analysis.discount_rate_pct = rate_pct;
            analysis.refresh_after_edit(irr, ctx.now.clone())
        })
    }

    pub fn add_cash_flow(&self, analysis_id: &str, input: CashFlowInput, ctx: &ActionContext) -> Result<EconomicsAnalysis, Error> {
        input.validate()?;
        let id = Self::new_id("cf_")?;
        let irr = &self.config.economics.irr;
        self.modify_analysis(analysis_id, ctx, |analysis| {
            analysis.ensure_editable("add cash flows to")?;
            if analysis.cash_flows.iter().any(|cf| cf.year == input.year) {
                return Err(Error::Conflict(format!(
                    "Cash flow for year {} already exists",
                    input.year
                )));
            }
            analysis.cash_flows.push(CashFlow::from_input(id, &input));
            analysis.refresh_after_edit(irr, ctx.now.clone())
        })
    }

    pub fn update_cash_flow(
        &self,
        analysis_id: &str,
        cash_flow_id: &str,
        input: CashFlowInput,
        ctx: &ActionContext,
    ) -> Result<EconomicsAnalysis, Error> {
        input.validate()?;
        let irr = &self.config.economics.irr;
        self.modify_analysis(analysis_id, ctx, |analysis| {
            analysis.ensure_editable("update cash flows of")?;
            if analysis
                .cash_flows
                .iter()
                .any(|cf| cf.id != cash_flow_id && cf.year == input.year)
            {
                return Err(Error::Conflict(format!(
                    "Cash flow for year {} already exists",
                    input.year
                )));
            }
            analysis
                .cash_flows
                .iter_mut()
                .find(|cf| cf.id == cash_flow_id)
                .ok_or_else(|| Error::not_found("cash flow", cash_flow_id))?
                .apply(&input);
            analysis.refresh_after_edit(irr, ctx.now.clone())
        })
    }

    pub fn remove_cash_flow(&self, analysis_id: &str, cash_flow_id: &str, ctx: &ActionContext) -> Result<EconomicsAnalysis, Error> {
        let irr = &self.config.economics.irr;
        self.modify_analysis(analysis_id, ctx, |analysis| {
            analysis.ensure_editable("remove cash flows from")?;
            let before = analysis.cash_flows.len();
            analysis.cash_flows.retain(|cf| cf.id != cash_flow_id);
            if analysis.cash_flows.len() == before {
                return Err(Error::not_found("cash flow", cash_flow_id));
            }
            analysis.refresh_after_edit(irr, ctx.now.clone())
        })
    }

    pub fn recompute_analysis_metrics(&self, analysis_id: &str, ctx: &ActionContext) -> Result<EconomicsAnalysis, Error> {
        let irr = &self.config.economics.irr;
        let analysis = self.modify_analysis(analysis_id, ctx, |analysis| {
            analysis.metrics = Some(analysis.calculate_metrics(irr, ctx.now.clone())?);
            Ok(())
        })?;
        if let Some(m) = &analysis.metrics {
            info!(
                analysis = %analysis.analysis_number,
                npv = m.npv,
                irr_pct = ?m.irr_pct,
                "analysis metrics recalculated"
            );
        }
        Ok(analysis)
    }

    /// Monte Carlo NPV with the configured seed, or fresh entropy when none
    /// is set.
    pub fn run_monte_carlo(&self, analysis_id: &str, ctx: &ActionContext) -> Result<EconomicsAnalysis, Error> {
        let mut rng = match self.config.economics.monte_carlo.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        self.run_monte_carlo_with(analysis_id, &mut rng, ctx)
    }

    pub fn run_monte_carlo_with<R: Rng>(
        &self,
        analysis_id: &str,
        rng: &mut R,
        ctx: &ActionContext,
    ) -> Result<EconomicsAnalysis, Error> {
        let settings = &self.config.economics.monte_carlo;
        self.modify_analysis(analysis_id, ctx, |analysis| {
            analysis.ensure_editable("run a Monte Carlo simulation on")?;
            if analysis.cash_flows.is_empty() {
                return Err(Error::validation("No cash flows defined for calculations"));
            }
            let summary = metrics::monte_carlo_npv(
                &analysis.net_flows(),
                analysis.discount_rate_pct,
                settings.iterations,
                settings.spread_pct,
                rng,
            )?;
            info!(
                analysis = %analysis.analysis_number,
                p10 = summary.p10,
                p50 = summary.p50,
                p90 = summary.p90,
                "monte carlo run complete"
            );
            analysis.monte_carlo = Some(MonteCarloRun {
                summary,
                calculated_at: ctx.now.clone(),
            });
            Ok(())
        })
    }

    /// Tornado table at the configured variation; the results are stored on
    /// the analysis.
    pub fn run_sensitivity_analysis(&self, analysis_id: &str, ctx: &ActionContext) -> Result<Vec<SensitivityResult>, Error> {
        let variation_pct = self.config.economics.sensitivity_variation_pct;
        let analysis = self.modify_analysis(analysis_id, ctx, |analysis| {
            analysis.ensure_editable("run a sensitivity analysis on")?;
            if analysis.cash_flows.is_empty() {
                return Err(Error::validation("No cash flows defined for calculations"));
            }
            analysis.sensitivity = analysis.sensitivity_analysis(variation_pct);
            Ok(())
        })?;
        Ok(analysis.sensitivity)
    }

    /// What-if evaluation; nothing is stored
    pub fn evaluate_scenario(&self, analysis_id: &str, adjustment: &ScenarioAdjustment) -> Result<ScenarioResult, Error> {
        let analysis = self.get_analysis(analysis_id)?;
        if analysis.cash_flows.is_empty() {
            return Err(Error::validation("No cash flows defined for calculations"));
        }
        Ok(analysis.evaluate_scenario(adjustment, &self.config.economics.irr))
    }

    pub fn submit_analysis(&self, analysis_id: &str, ctx: &ActionContext) -> Result<EconomicsAnalysis, Error> {
        let approval_id = Self::new_id("apr_")?;
        let analysis = self.modify_analysis(analysis_id, ctx, |analysis| {
            analysis.submit(ctx.user_id(), ctx.now.clone())?;
            analysis
                .approvals
                .push(Approval::pending(approval_id, 0, None, ctx.now.clone()));
            Ok(())
        })?;
        info!(analysis = %analysis.analysis_number, user = %ctx.user_id(), "analysis submitted for approval");
        Ok(analysis)
    }

    pub fn approve_analysis(&self, analysis_id: &str, comments: Option<String>, ctx: &ActionContext) -> Result<EconomicsAnalysis, Error> {
        let analysis = self.modify_analysis(analysis_id, ctx, |analysis| {
            analysis.ensure_pending("approve")?;
            let step = approval::sole_pending_mut(&mut analysis.approvals, "economics analysis")?;
            step.ensure_decidable_by(&ctx.actor)?;
            step.decide(ApprovalStatus::Approved, comments.clone(), ctx);
            analysis.status = AnalysisStatus::Approved;
            analysis.approval_comments = comments;
            analysis.approved_at = Some(ctx.now.clone());
            analysis.approved_by = Some(ctx.actor.user_id.clone());
            Ok(())
        })?;
        info!(analysis = %analysis.analysis_number, user = %ctx.user_id(), "analysis approved");
        Ok(analysis)
    }

    pub fn reject_analysis(&self, analysis_id: &str, comments: Option<String>, ctx: &ActionContext) -> Result<EconomicsAnalysis, Error> {
        let analysis = self.modify_analysis(analysis_id, ctx, |analysis| {
            analysis.ensure_pending("reject")?;
            let step = approval::sole_pending_mut(&mut analysis.approvals, "economics analysis")?;
            step.ensure_decidable_by(&ctx.actor)?;
            step.decide(ApprovalStatus::Rejected, comments.clone(), ctx);
            analysis.status = AnalysisStatus::Rejected;
            analysis.rejection_comments = comments;
            Ok(())
        })?;
        info!(analysis = %analysis.analysis_number, user = %ctx.user_id(), "analysis rejected");
        Ok(analysis)
    }

    /// Approved analyses are kept
    pub fn delete_analysis(&self, analysis_id: &str) -> Result<(), Error> {
        let snapshot = self.store.analyses.load(analysis_id)?;
        snapshot.value.ensure_editable("delete")?;
        self.store.analyses.remove(&snapshot)?;
        info!(analysis = %snapshot.value.analysis_number, "economics analysis deleted");
        Ok(())
    }

    /// Side-by-side figures, best NPV first. Analyses without metrics sort
    /// last.
    pub fn compare_analyses(&self, analysis_ids: &[&str]) -> Result<Vec<AnalysisComparison>, Error> {
        let mut rows = analysis_ids
            .iter()
            .map(|id| Ok(self.get_analysis(id)?.comparison()))
            .collect::<Result<Vec<_>, Error>>()?;
        rows.sort_by(|a, b| match (a.npv, b.npv) {
            (Some(x), Some(y)) => y.total_cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        Ok(rows)
    }
}
