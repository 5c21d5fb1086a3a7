//! Engine configuration loaded from TOML
//!
//! Search order for [`EngineConfig::load`]:
//! 1. `$WELL_COST_CONFIG`
//! 2. `./well_cost.toml`
//! 3. built-in defaults
//!
//! Every section is optional; missing keys take their default.
use super::error::Error;
use super::metrics::IrrSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CONFIG_ENV_VAR: &str = "WELL_COST_CONFIG";
const LOCAL_CONFIG: &str = "well_cost.toml";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub variance: VarianceConfig,
    pub economics: EconomicsConfig,
    pub numbering: NumberingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VarianceConfig {
    /// |variance %| above this flags the AFE for review
    pub threshold_pct: f64,
}

impl Default for VarianceConfig {
    fn default() -> Self {
        Self { threshold_pct: 10.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomicsConfig {
    pub default_discount_rate_pct: f64,
    pub sensitivity_variation_pct: f64,
    pub irr: IrrSettings,
    pub monte_carlo: MonteCarloConfig,
}

impl Default for EconomicsConfig {
    fn default() -> Self {
        Self {
            default_discount_rate_pct: 10.0,
            sensitivity_variation_pct: 20.0,
            irr: IrrSettings::default(),
            monte_carlo: MonteCarloConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloConfig {
    pub iterations: u32,
    pub spread_pct: f64,
    /// Fixed seed for reproducible runs; entropy when unset
    pub seed: Option<u64>,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            iterations: 1000,
            spread_pct: 20.0,
            seed: None,
        }
    }
}

/// Keys left out of a `[numbering.*]` table fall back to `DOC` and a width
/// of 5, not to that series' built-in values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeriesFormat {
    pub prefix: String,
    /// Minimum digits; longer sequences are never truncated
    pub width: usize,
}

impl Default for SeriesFormat {
    fn default() -> Self {
        Self::new("DOC", 5)
    }
}

impl SeriesFormat {
    fn new(prefix: &str, width: usize) -> Self {
        Self {
            prefix: prefix.to_string(),
            width,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumberingConfig {
    pub afe: SeriesFormat,
    pub analysis: SeriesFormat,
    pub jib: SeriesFormat,
    pub cost_actual: SeriesFormat,
}

impl Default for NumberingConfig {
    fn default() -> Self {
        Self {
            afe: SeriesFormat::new("AFE", 5),
            analysis: SeriesFormat::new("ECON", 4),
            jib: SeriesFormat::new("JIB", 5),
            cost_actual: SeriesFormat::new("CA", 6),
        }
    }
}

impl EngineConfig {
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_path(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "loaded engine config from {CONFIG_ENV_VAR}");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "failed to load config from {CONFIG_ENV_VAR}, falling back");
                    }
                }
            } else {
                warn!(path = %path, "{CONFIG_ENV_VAR} points to a missing file, falling back");
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG);
        if local.exists() {
            match Self::load_from_path(&local) {
                Ok(config) => {
                    info!("loaded engine config from ./{LOCAL_CONFIG}");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "failed to load ./{LOCAL_CONFIG}, using defaults");
                }
            }
        }

        info!("no engine config found, using built-in defaults");
        Self::default()
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, Error> {
        let config: Self =
            toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let v = &self.variance;
        if !v.threshold_pct.is_finite() || v.threshold_pct < 0.0 {
            return Err(Error::Config(format!(
                "variance.threshold_pct must be non-negative, got {}",
                v.threshold_pct
            )));
        }

        let e = &self.economics;
        if !e.default_discount_rate_pct.is_finite() || e.default_discount_rate_pct <= -100.0 {
            return Err(Error::Config(format!(
                "economics.default_discount_rate_pct must be above -100, got {}",
                e.default_discount_rate_pct
            )));
        }
        if !(0.0..100.0).contains(&e.sensitivity_variation_pct) {
            return Err(Error::Config(format!(
                "economics.sensitivity_variation_pct must be within [0, 100), got {}",
                e.sensitivity_variation_pct
            )));
        }

        let irr = &e.irr;
        if irr.lower_bound_pct <= -100.0 || irr.lower_bound_pct >= irr.upper_bound_pct {
            return Err(Error::Config(format!(
                "economics.irr bounds must satisfy -100 < lower < upper, got [{}, {}]",
                irr.lower_bound_pct, irr.upper_bound_pct
            )));
        }
        if !(irr.tolerance > 0.0) {
            return Err(Error::Config("economics.irr.tolerance must be positive".into()));
        }
        if irr.max_bisection_iterations == 0 || irr.max_newton_iterations == 0 {
            return Err(Error::Config("economics.irr iteration limits must be positive".into()));
        }

        let mc = &e.monte_carlo;
        if mc.iterations == 0 {
            return Err(Error::Config("economics.monte_carlo.iterations must be positive".into()));
        }
        if !(0.0..100.0).contains(&mc.spread_pct) {
            return Err(Error::Config(format!(
                "economics.monte_carlo.spread_pct must be within [0, 100), got {}",
                mc.spread_pct
            )));
        }

        let n = &self.numbering;
        for (name, series) in [
            ("afe", &n.afe),
            ("analysis", &n.analysis),
            ("jib", &n.jib),
            ("cost_actual", &n.cost_actual),
        ] {
            if series.prefix.trim().is_empty() || series.width == 0 {
                return Err(Error::Config(format!(
                    "numbering.{name} needs a prefix and a positive width"
                )));
            }
        }
        Ok(())
    }
}
