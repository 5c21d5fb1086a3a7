//! Cash-flow metrics: NPV, IRR, payback, profitability index and a Monte Carlo
//! NPV distribution.
//!
//! Everything here is a pure function over a slice of [`NetFlow`]s. Rates are
//! passed as percentages (`10.0` means 10 %), except the value returned by
//! [`irr`], which is a fraction so that `npv(flows, irr(flows)? * 100.0)` is
//! zero.
use super::error::Error;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Net cash flow of one period. `year` falls back to the position in the
/// slice when unset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetFlow {
    pub year: Option<i32>,
    pub amount: f64,
}

impl NetFlow {
    pub fn at(year: i32, amount: f64) -> Self {
        Self {
            year: Some(year),
            amount,
        }
    }
    pub fn unscheduled(amount: f64) -> Self {
        Self { year: None, amount }
    }
}

/// Flows for consecutive years starting at year 0
pub fn from_amounts(amounts: &[f64]) -> Vec<NetFlow> {
    amounts
        .iter()
        .enumerate()
        .map(|(i, amount)| NetFlow::at(i as i32, *amount))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IrrMethod {
    Bisection,
    /// Newton-Raphson, falling back to bisection when it does not converge
    Newton,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrrSettings {
    pub method: IrrMethod,
    pub lower_bound_pct: f64,
    pub upper_bound_pct: f64,
    /// Absolute NPV tolerance at the root
    pub tolerance: f64,
    pub max_bisection_iterations: u32,
    pub newton_guess_pct: f64,
    pub max_newton_iterations: u32,
}

impl Default for IrrSettings {
    fn default() -> Self {
        Self {
            method: IrrMethod::Bisection,
            lower_bound_pct: -99.0,
            upper_bound_pct: 1000.0,
            tolerance: 1e-4,
            max_bisection_iterations: 1000,
            newton_guess_pct: 10.0,
            max_newton_iterations: 100,
        }
    }
}

fn scheduled(flows: &[NetFlow]) -> impl Iterator<Item = (i32, f64)> + '_ {
    flows
        .iter()
        .enumerate()
        .map(|(i, flow)| (flow.year.unwrap_or(i as i32), flow.amount))
}

fn discount_factor(rate: f64, year: i32) -> f64 {
    (1.0 + rate).powi(year)
}

/// Net present value at `rate_pct` percent.
pub fn npv(flows: &[NetFlow], rate_pct: f64) -> f64 {
    let rate = rate_pct / 100.0;
    scheduled(flows)
        .map(|(year, amount)| amount / discount_factor(rate, year))
        .sum()
}

fn npv_and_derivative(flows: &[NetFlow], rate: f64) -> (f64, f64) {
    scheduled(flows).fold((0.0, 0.0), |(value, slope), (year, amount)| {
        let factor = discount_factor(rate, year);
        let t = f64::from(year);
        (
            value + amount / factor,
            slope - t * amount / (factor * (1.0 + rate)),
        )
    })
}

/// Internal rate of return with the default settings (bisection).
pub fn irr(flows: &[NetFlow]) -> Result<f64, Error> {
    irr_with(flows, &IrrSettings::default())
}

/// Internal rate of return as a fraction.
///
/// Fails with a computation error when the flows never change sign or no
/// root lies inside the configured bounds; callers report "IRR undefined"
/// instead of a number.
pub fn irr_with(flows: &[NetFlow], settings: &IrrSettings) -> Result<f64, Error> {
    let has_inflow = flows.iter().any(|f| f.amount > 0.0);
    let has_outflow = flows.iter().any(|f| f.amount < 0.0);
    if !(has_inflow && has_outflow) {
        return Err(Error::Computation(
            "IRR undefined: cash flows never change sign".into(),
        ));
    }

    match settings.method {
        IrrMethod::Bisection => irr_bisection(flows, settings),
        IrrMethod::Newton => match irr_newton(flows, settings) {
            Some(rate) => Ok(rate),
            None => {
                tracing::debug!("newton IRR did not converge, falling back to bisection");
                irr_bisection(flows, settings)
            }
        },
    }
}

fn irr_bisection(flows: &[NetFlow], settings: &IrrSettings) -> Result<f64, Error> {
    let mut low = settings.lower_bound_pct / 100.0;
    let mut high = settings.upper_bound_pct / 100.0;
    let mut f_low = npv(flows, low * 100.0);
    let f_high = npv(flows, high * 100.0);

    if f_low.abs() < settings.tolerance {
        return Ok(low);
    }
    if f_high.abs() < settings.tolerance {
        return Ok(high);
    }
    if f_low.is_nan() || f_high.is_nan() || f_low.signum() == f_high.signum() {
        return Err(Error::Computation(format!(
            "IRR undefined: NPV does not cross zero between {}% and {}%",
            settings.lower_bound_pct, settings.upper_bound_pct
        )));
    }

    for _ in 0..settings.max_bisection_iterations {
        let mid = (low + high) / 2.0;
        let f_mid = npv(flows, mid * 100.0);

        // stop once the bracket can no longer shrink in f64
        if f_mid.abs() < settings.tolerance
            || (high - low) / 2.0 <= f64::EPSILON * mid.abs().max(1.0)
        {
            return Ok(mid);
        }
        if f_mid.signum() == f_low.signum() {
            low = mid;
            f_low = f_mid;
        } else {
            high = mid;
        }
    }

    Ok((low + high) / 2.0)
}

fn irr_newton(flows: &[NetFlow], settings: &IrrSettings) -> Option<f64> {
    let low = settings.lower_bound_pct / 100.0;
    let high = settings.upper_bound_pct / 100.0;
    let mut rate = settings.newton_guess_pct / 100.0;

    for _ in 0..settings.max_newton_iterations {
        let (value, slope) = npv_and_derivative(flows, rate);
        if value.abs() < settings.tolerance {
            return (low..=high).contains(&rate).then_some(rate);
        }
        if !slope.is_finite() || slope.abs() < 1e-12 {
            return None;
        }
        let next = rate - value / slope;
        if !next.is_finite() || next <= -1.0 {
            return None;
        }
        rate = next;
    }

    None
}

/// Fractional year at which the cumulative net cash flow first becomes
/// non-negative, interpolated linearly between the year before the crossing
/// and the crossing year. `None` when the project never pays back.
pub fn payback_period(flows: &[NetFlow]) -> Option<f64> {
    let mut ordered: Vec<(i32, f64)> = scheduled(flows).collect();
    ordered.sort_by_key(|(year, _)| *year);

    let mut cumulative = 0.0;
    let mut prev_year: Option<i32> = None;
    for (year, amount) in ordered {
        let before = cumulative;
        cumulative += amount;
        if cumulative >= 0.0 {
            let Some(prev) = prev_year else {
                return Some(f64::from(year));
            };
            let fraction = if amount != 0.0 { -before / amount } else { 0.0 };
            return Some(f64::from(prev) + fraction * f64::from(year - prev));
        }
        prev_year = Some(year);
    }

    None
}

/// Present value of inflows over present value of outflows; `0` when there
/// are no outflows.
pub fn profitability_index(flows: &[NetFlow], rate_pct: f64) -> f64 {
    let rate = rate_pct / 100.0;
    let (inflows, outflows) =
        scheduled(flows).fold((0.0, 0.0), |(pv_in, pv_out), (year, amount)| {
            let pv = amount / discount_factor(rate, year);
            if amount > 0.0 {
                (pv_in + pv, pv_out)
            } else {
                (pv_in, pv_out + pv.abs())
            }
        });

    if outflows > 0.0 { inflows / outflows } else { 0.0 }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct MonteCarloSummary {
    #[n(0)]
    pub p10: f64,
    #[n(1)]
    pub p50: f64,
    #[n(2)]
    pub p90: f64,
    #[n(3)]
    pub mean: f64,
    #[n(4)]
    pub std_dev: f64,
    #[n(5)]
    pub iterations: u32,
}

/// Samples NPV with every flow scaled by an independent uniform factor in
/// `[1 - spread, 1 + spread)`. The random source is supplied by the caller.
pub fn monte_carlo_npv<R: Rng>(
    flows: &[NetFlow],
    rate_pct: f64,
    iterations: u32,
    spread_pct: f64,
    rng: &mut R,
) -> Result<MonteCarloSummary, Error> {
    if iterations == 0 {
        return Err(Error::validation("Monte Carlo needs at least one iteration"));
    }
    if !(0.0..100.0).contains(&spread_pct) {
        return Err(Error::validation(format!(
            "Monte Carlo spread must be within [0, 100), got {spread_pct}"
        )));
    }

    let spread = spread_pct / 100.0;
    let mut results: Vec<f64> = (0..iterations)
        .map(|_| {
            let varied: Vec<NetFlow> = flows
                .iter()
                .map(|flow| {
                    let factor = if spread > 0.0 {
                        rng.gen_range(1.0 - spread..1.0 + spread)
                    } else {
                        1.0
                    };
                    NetFlow {
                        amount: flow.amount * factor,
                        ..*flow
                    }
                })
                .collect();
            npv(&varied, rate_pct)
        })
        .collect();
    results.sort_by(f64::total_cmp);

    let n = results.len();
    let percentile = |p: f64| results[((n as f64 * p).floor() as usize).min(n - 1)];
    let mean = results.iter().sum::<f64>() / n as f64;
    let variance = results.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;

    Ok(MonteCarloSummary {
        p10: percentile(0.1),
        p50: percentile(0.5),
        p90: percentile(0.9),
        mean,
        std_dev: variance.sqrt(),
        iterations,
    })
}
