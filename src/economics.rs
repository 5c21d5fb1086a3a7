//! Economics analyses: cash flows, derived metrics and the analysis lifecycle
use super::approval::Approval;
use super::context::{Audit, TimeStamp};
use super::error::Error;
use super::metrics::{self, IrrSettings, MonteCarloSummary, NetFlow};
use chrono::Utc;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum AnalysisStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    PendingApproval,
    #[n(2)]
    Approved,
    #[n(3)]
    Rejected,
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnalysisStatus::Draft => "Draft",
            AnalysisStatus::PendingApproval => "Pending Approval",
            AnalysisStatus::Approved => "Approved",
            AnalysisStatus::Rejected => "Rejected",
        };
        f.write_str(s)
    }
}

// Used for creating and editing a period; the net is always derived
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CashFlowInput {
    pub year: i32,
    pub revenue: f64,
    pub capex: f64,
    pub opex: f64,
    pub taxes: f64,
    pub royalty: f64,
}

impl CashFlowInput {
    pub fn new(year: i32) -> Self {
        Self {
            year,
            ..Self::default()
        }
    }
    pub fn set_revenue(mut self, amount: f64) -> Self {
        self.revenue = amount;
        self
    }
    pub fn set_capex(mut self, amount: f64) -> Self {
        self.capex = amount;
        self
    }
    pub fn set_opex(mut self, amount: f64) -> Self {
        self.opex = amount;
        self
    }
    pub fn set_taxes(mut self, amount: f64) -> Self {
        self.taxes = amount;
        self
    }
    pub fn set_royalty(mut self, amount: f64) -> Self {
        self.royalty = amount;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        let components = [
            ("revenue", self.revenue),
            ("capex", self.capex),
            ("opex", self.opex),
            ("taxes", self.taxes),
            ("royalty", self.royalty),
        ];
        for (name, value) in components {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::validation(format!(
                    "Cash flow {name} must be a non-negative amount, got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct CashFlow {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub year: i32,
    #[n(2)]
    pub revenue: f64,
    #[n(3)]
    pub capex: f64,
    #[n(4)]
    pub opex: f64,
    #[n(5)]
    pub taxes: f64,
    #[n(6)]
    pub royalty: f64,
    #[n(7)]
    pub net_cash_flow: f64,
}

impl CashFlow {
    pub(crate) fn from_input(id: String, input: &CashFlowInput) -> Self {
        let mut flow = Self {
            id,
            year: input.year,
            revenue: 0.0,
            capex: 0.0,
            opex: 0.0,
            taxes: 0.0,
            royalty: 0.0,
            net_cash_flow: 0.0,
        };
        flow.apply(input);
        flow
    }

    pub(crate) fn apply(&mut self, input: &CashFlowInput) {
        self.year = input.year;
        self.revenue = input.revenue;
        self.capex = input.capex;
        self.opex = input.opex;
        self.taxes = input.taxes;
        self.royalty = input.royalty;
        self.net_cash_flow = self.revenue - self.capex - self.opex - self.taxes - self.royalty;
    }

    pub fn net_flow(&self) -> NetFlow {
        NetFlow::at(self.year, self.net_cash_flow)
    }
}

/// Metrics derived from the cash flows, valid as of `calculated_at`
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct AnalysisMetrics {
    #[n(0)]
    pub npv: f64,
    // percent; None when no rate brings NPV to zero
    #[n(1)]
    pub irr_pct: Option<f64>,
    #[n(2)]
    pub payback_period: Option<f64>,
    #[n(3)]
    pub profitability_index: f64,
    #[n(4)]
    pub calculated_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct MonteCarloRun {
    #[n(0)]
    pub summary: MonteCarloSummary,
    #[n(1)]
    pub calculated_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum SensitivityVariable {
    #[n(0)]
    OilPrice,
    #[n(1)]
    GasPrice,
    #[n(2)]
    Capex,
    #[n(3)]
    Opex,
    #[n(4)]
    ProductionRate,
}

impl SensitivityVariable {
    pub const ALL: [SensitivityVariable; 5] = [
        SensitivityVariable::OilPrice,
        SensitivityVariable::GasPrice,
        SensitivityVariable::Capex,
        SensitivityVariable::Opex,
        SensitivityVariable::ProductionRate,
    ];

    fn vary(&self, flow: &CashFlow, multiplier: f64) -> CashFlowInput {
        let mut input = CashFlowInput {
            year: flow.year,
            revenue: flow.revenue,
            capex: flow.capex,
            opex: flow.opex,
            taxes: flow.taxes,
            royalty: flow.royalty,
        };
        match self {
            SensitivityVariable::OilPrice
            | SensitivityVariable::GasPrice
            | SensitivityVariable::ProductionRate => input.revenue *= multiplier,
            SensitivityVariable::Capex => input.capex *= multiplier,
            SensitivityVariable::Opex => input.opex *= multiplier,
        }
        input
    }
}

impl fmt::Display for SensitivityVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SensitivityVariable::OilPrice => "Oil Price",
            SensitivityVariable::GasPrice => "Gas Price",
            SensitivityVariable::Capex => "CAPEX",
            SensitivityVariable::Opex => "OPEX",
            SensitivityVariable::ProductionRate => "Production Rate",
        };
        f.write_str(s)
    }
}

/// One bar of a tornado chart
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct SensitivityResult {
    #[n(0)]
    pub variable: SensitivityVariable,
    #[n(1)]
    pub variation_pct: f64,
    #[n(2)]
    pub base_npv: f64,
    #[n(3)]
    pub low_npv: f64,
    #[n(4)]
    pub high_npv: f64,
    #[n(5)]
    pub impact: f64,
}

/// Multipliers applied to every period of an analysis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScenarioAdjustment {
    pub price_multiplier: f64,
    pub cost_multiplier: f64,
    pub production_multiplier: f64,
}

impl Default for ScenarioAdjustment {
    fn default() -> Self {
        Self {
            price_multiplier: 1.0,
            cost_multiplier: 1.0,
            production_multiplier: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioResult {
    pub npv: f64,
    pub irr_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recommendation {
    Proceed,
    Review,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisComparison {
    pub analysis_id: String,
    pub name: String,
    pub npv: Option<f64>,
    pub irr_pct: Option<f64>,
    pub payback_period: Option<f64>,
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct EconomicsAnalysis {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub analysis_number: String,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub well_id: String,
    #[n(4)]
    pub afe_id: Option<String>,
    #[n(5)]
    pub discount_rate_pct: f64,
    #[n(6)]
    pub status: AnalysisStatus,
    #[n(7)]
    pub cash_flows: Vec<CashFlow>,
    #[n(8)]
    pub metrics: Option<AnalysisMetrics>,
    #[n(9)]
    pub monte_carlo: Option<MonteCarloRun>,
    #[n(10)]
    pub sensitivity: Vec<SensitivityResult>,
    #[n(11)]
    pub approvals: Vec<Approval>,
    #[n(12)]
    pub approval_comments: Option<String>,
    #[n(13)]
    pub rejection_comments: Option<String>,
    #[n(14)]
    pub submitted_at: Option<TimeStamp<Utc>>,
    #[n(15)]
    pub submitted_by: Option<String>,
    #[n(16)]
    pub approved_at: Option<TimeStamp<Utc>>,
    #[n(17)]
    pub approved_by: Option<String>,
    #[n(18)]
    pub audit: Audit,
}

pub(crate) fn validate_discount_rate(rate_pct: f64) -> Result<(), Error> {
    if !rate_pct.is_finite() || rate_pct <= -100.0 {
        return Err(Error::validation(format!(
            "Discount rate must be above -100%, got {rate_pct}"
        )));
    }
    Ok(())
}

impl EconomicsAnalysis {
    /// Flows ordered by year
    pub fn net_flows(&self) -> Vec<NetFlow> {
        let mut flows: Vec<NetFlow> = self.cash_flows.iter().map(CashFlow::net_flow).collect();
        flows.sort_by_key(|f| f.year);
        flows
    }

    /// Flows and stored results are frozen once submitted: the figures under
    /// review must be the figures approved.
    pub(crate) fn ensure_editable(&self, action: &'static str) -> Result<(), Error> {
        if matches!(self.status, AnalysisStatus::PendingApproval | AnalysisStatus::Approved) {
            return Err(Error::state("economics analysis", action, self.status));
        }
        Ok(())
    }

    pub fn calculate_metrics(
        &self,
        irr_settings: &IrrSettings,
        now: TimeStamp<Utc>,
    ) -> Result<AnalysisMetrics, Error> {
        if self.cash_flows.is_empty() {
            return Err(Error::validation(
                "No cash flows defined for calculations",
            ));
        }
        let flows = self.net_flows();

        let irr_pct = match metrics::irr_with(&flows, irr_settings) {
            Ok(rate) => Some(rate * 100.0),
            Err(Error::Computation(reason)) => {
                tracing::debug!(analysis = %self.analysis_number, %reason, "IRR undefined");
                None
            }
            Err(e) => return Err(e),
        };

        Ok(AnalysisMetrics {
            npv: metrics::npv(&flows, self.discount_rate_pct),
            irr_pct,
            payback_period: metrics::payback_period(&flows),
            profitability_index: metrics::profitability_index(&flows, self.discount_rate_pct),
            calculated_at: now,
        })
    }

    /// Recompute after a cash-flow edit. Simulation results no longer match
    /// the flows and are dropped until they are rerun.
    pub(crate) fn refresh_after_edit(
        &mut self,
        irr_settings: &IrrSettings,
        now: TimeStamp<Utc>,
    ) -> Result<(), Error> {
        self.monte_carlo = None;
        self.sensitivity.clear();
        self.metrics = if self.cash_flows.is_empty() {
            None
        } else {
            Some(self.calculate_metrics(irr_settings, now)?)
        };
        Ok(())
    }

    pub fn sensitivity_analysis(&self, variation_pct: f64) -> Vec<SensitivityResult> {
        let base_npv = metrics::npv(&self.net_flows(), self.discount_rate_pct);
        let npv_with = |variable: SensitivityVariable, multiplier: f64| {
            let flows: Vec<NetFlow> = self
                .cash_flows
                .iter()
                .map(|cf| CashFlow::from_input(cf.id.clone(), &variable.vary(cf, multiplier)).net_flow())
                .collect();
            metrics::npv(&flows, self.discount_rate_pct)
        };

        let mut results: Vec<SensitivityResult> = SensitivityVariable::ALL
            .iter()
            .map(|variable| {
                let low_npv = npv_with(*variable, 1.0 - variation_pct / 100.0);
                let high_npv = npv_with(*variable, 1.0 + variation_pct / 100.0);
                SensitivityResult {
                    variable: *variable,
                    variation_pct,
                    base_npv,
                    low_npv,
                    high_npv,
                    impact: (high_npv - low_npv).abs(),
                }
            })
            .collect();
        results.sort_by(|a, b| b.impact.total_cmp(&a.impact));
        results
    }

    pub fn evaluate_scenario(
        &self,
        adjustment: &ScenarioAdjustment,
        irr_settings: &IrrSettings,
    ) -> ScenarioResult {
        let revenue_factor = adjustment.price_multiplier * adjustment.production_multiplier;
        let flows: Vec<NetFlow> = self
            .cash_flows
            .iter()
            .map(|cf| {
                // royalty is a share of revenue and moves with it
                let net = cf.revenue * revenue_factor
                    - cf.capex * adjustment.cost_multiplier
                    - cf.opex * adjustment.cost_multiplier
                    - cf.taxes
                    - cf.royalty * revenue_factor;
                NetFlow::at(cf.year, net)
            })
            .collect();

        ScenarioResult {
            npv: metrics::npv(&flows, self.discount_rate_pct),
            irr_pct: metrics::irr_with(&flows, irr_settings).ok().map(|r| r * 100.0),
        }
    }

    pub fn comparison(&self) -> AnalysisComparison {
        let npv = self.metrics.as_ref().map(|m| m.npv);
        let irr_pct = self.metrics.as_ref().and_then(|m| m.irr_pct);
        let recommendation = match (npv, irr_pct) {
            (Some(npv), Some(irr)) if npv > 0.0 && irr > 10.0 => Recommendation::Proceed,
            _ => Recommendation::Review,
        };
        AnalysisComparison {
            analysis_id: self.id.clone(),
            name: self.name.clone(),
            npv,
            irr_pct,
            payback_period: self.metrics.as_ref().and_then(|m| m.payback_period),
            recommendation,
        }
    }

    pub(crate) fn submit(&mut self, user: &str, now: TimeStamp<Utc>) -> Result<(), Error> {
        if self.status != AnalysisStatus::Draft {
            return Err(Error::state("economics analysis", "submit", self.status));
        }
        if self.metrics.is_none() {
            return Err(Error::validation(
                "Analysis metrics must be calculated before submission",
            ));
        }
        self.status = AnalysisStatus::PendingApproval;
        self.submitted_at = Some(now);
        self.submitted_by = Some(user.to_string());
        Ok(())
    }

    pub(crate) fn ensure_pending(&self, action: &'static str) -> Result<(), Error> {
        if self.status != AnalysisStatus::PendingApproval {
            return Err(Error::state("economics analysis", action, self.status));
        }
        Ok(())
    }
}
