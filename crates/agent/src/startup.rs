//! Startup sizing from the environment.
//!
//! The injector cannot know how long hook installation will take in an
//! arbitrary target, so the attach deadline can be stretched through
//! environment variables. They size the startup budget only; they never
//! change the synchronization protocol itself.
//!
//! All values are milliseconds, integer or float:
//!
//! - `ADA_STARTUP_TIMEOUT` — floor for the whole attach budget
//! - `ADA_STARTUP_WARM_UP_DURATION` — fixed warm-up cost
//! - `ADA_STARTUP_PER_SYMBOL_COST` — per-hooked-symbol cost
//! - `ADA_STARTUP_TIMEOUT_TOLERANCE` — slack added on top

use std::time::Duration;

pub const ENV_TIMEOUT: &str = "ADA_STARTUP_TIMEOUT";
pub const ENV_WARM_UP: &str = "ADA_STARTUP_WARM_UP_DURATION";
pub const ENV_PER_SYMBOL: &str = "ADA_STARTUP_PER_SYMBOL_COST";
pub const ENV_TOLERANCE: &str = "ADA_STARTUP_TIMEOUT_TOLERANCE";

/// Parsed startup overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StartupBudget {
    pub timeout_ms: Option<f64>,
    pub warm_up_ms: Option<f64>,
    pub per_symbol_cost_ms: Option<f64>,
    pub tolerance_ms: Option<f64>,
}

fn parse_ms(var: &str) -> Option<f64> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Some(v),
        _ => {
            log::warn!("ignoring {var}={raw:?}: not a non-negative millisecond value");
            None
        }
    }
}

impl StartupBudget {
    /// Read the four variables from the process environment.
    pub fn from_env() -> Self {
        Self {
            timeout_ms: parse_ms(ENV_TIMEOUT),
            warm_up_ms: parse_ms(ENV_WARM_UP),
            per_symbol_cost_ms: parse_ms(ENV_PER_SYMBOL),
            tolerance_ms: parse_ms(ENV_TOLERANCE),
        }
    }

    /// Attach deadline for a target with `symbol_count` hooked symbols.
    ///
    /// The sized budget is `warm_up + per_symbol * symbols + tolerance`;
    /// the result is the largest of that, the explicit timeout override,
    /// and the caller's default. Overrides can only stretch the budget.
    pub fn attach_timeout(&self, default: Duration, symbol_count: usize) -> Duration {
        let sized_ms = self.warm_up_ms.unwrap_or(0.0)
            + self.per_symbol_cost_ms.unwrap_or(0.0) * symbol_count as f64
            + self.tolerance_ms.unwrap_or(0.0);
        let floor_ms = self.timeout_ms.unwrap_or(0.0);

        let budget = Duration::from_secs_f64(sized_ms.max(floor_ms) / 1_000.0);
        budget.max(default)
    }
}
