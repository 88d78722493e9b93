//! What-if re-pricing of a scenario set: shocked severities or frequencies,
//! and a grid over margin and confidence level.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::canvas::PerilCanvas;
use crate::config::PricingParams;
use crate::error::PricingError;
use crate::pricer::{PricingResult, price};
use crate::scenarios::{EventRecord, ScenarioSet, SimulatedYear, YearKind};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Shock {
    /// Pushes every triggering severity `factor` times further past the
    /// threshold; payouts are re-derived from the shocked severity.
    SeverityShock { factor: f64 },
    /// Each baseline event is copied `factor` times on average.
    FrequencyShock { factor: f64 },
}

impl Shock {
    pub fn label(&self) -> String {
        match self {
            Shock::SeverityShock { factor } => format!("severity x{factor}"),
            Shock::FrequencyShock { factor } => format!("frequency x{factor}"),
        }
    }
}

/// Shocks reported alongside a quote.
pub const STANDARD_SHOCKS: [Shock; 4] = [
    Shock::SeverityShock { factor: 1.2 },
    Shock::SeverityShock { factor: 1.5 },
    Shock::FrequencyShock { factor: 1.5 },
    Shock::FrequencyShock { factor: 2.0 },
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressOutcome {
    pub shock: Shock,
    pub expected_loss: f64,
    pub gross_premium: f64,
    pub var_99: f64,
    pub tvar_99: f64,
    /// Relative change in expected loss against the unshocked set.
    pub expected_loss_change: f64,
}

fn severity_shocked(scenarios: &ScenarioSet, canvas: &PerilCanvas, factor: f64) -> ScenarioSet {
    let shock_year = |year: &SimulatedYear| SimulatedYear {
        events: year
            .events
            .iter()
            .map(|e| {
                let severity = canvas.trigger.scale_severity(e.severity, factor);
                EventRecord { severity, payout: canvas.payout(severity) }
            })
            .collect(),
        ..year.clone()
    };
    ScenarioSet {
        years: scenarios.years.iter().map(shock_year).collect(),
        tail_years: scenarios.tail_years.iter().map(shock_year).collect(),
        ..scenarios.clone()
    }
}

fn frequency_shocked(scenarios: &ScenarioSet, factor: f64) -> ScenarioSet {
    let factor = factor.max(0.0);
    let whole = factor.floor() as usize;
    let fraction = factor - factor.floor();
    let mut rng = ChaCha20Rng::seed_from_u64(scenarios.seed);
    rng.set_stream(u64::MAX);

    let years = scenarios
        .years
        .iter()
        .map(|year| {
            let mut events = Vec::with_capacity(year.events.len() * (whole + 1));
            for event in &year.events {
                let copies = whole + usize::from(rng.random::<f64>() < fraction);
                events.extend(std::iter::repeat_n(*event, copies));
            }
            SimulatedYear { index: year.index, kind: YearKind::Baseline, events }
        })
        .collect();
    ScenarioSet { years, ..scenarios.clone() }
}

pub fn apply_shock(scenarios: &ScenarioSet, canvas: &PerilCanvas, shock: Shock) -> ScenarioSet {
    match shock {
        Shock::SeverityShock { factor } => severity_shocked(scenarios, canvas, factor),
        Shock::FrequencyShock { factor } => frequency_shocked(scenarios, factor),
    }
}

/// Re-prices `scenarios` under each shock.
pub fn stress_test(
    scenarios: &ScenarioSet,
    canvas: &PerilCanvas,
    params: &PricingParams,
    shocks: &[Shock],
) -> Result<Vec<StressOutcome>, PricingError> {
    let base = price(scenarios, &canvas.peril, params)?;
    shocks
        .iter()
        .map(|&shock| {
            let shocked = price(&apply_shock(scenarios, canvas, shock), &canvas.peril, params)?;
            Ok(StressOutcome {
                shock,
                expected_loss: shocked.expected_loss,
                gross_premium: shocked.gross_premium,
                var_99: shocked.var_99,
                tvar_99: shocked.tvar_99,
                expected_loss_change: shocked.expected_loss / base.expected_loss - 1.0,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityRow {
    pub base_margin: f64,
    pub confidence_level: f64,
    pub risk_load: f64,
    pub gross_premium: f64,
    pub var: f64,
    pub tvar: f64,
}

impl SensitivityRow {
    fn from_result(base_margin: f64, r: &PricingResult) -> Self {
        SensitivityRow {
            base_margin,
            confidence_level: r.confidence_level,
            risk_load: r.risk_load,
            gross_premium: r.gross_premium,
            var: r.var_99,
            tvar: r.tvar_99,
        }
    }
}

/// Every combination of base margin and confidence level, margins outermost.
pub fn sensitivity(
    scenarios: &ScenarioSet,
    peril: &str,
    params: &PricingParams,
    base_margins: &[f64],
    confidence_levels: &[f64],
) -> Result<Vec<SensitivityRow>, PricingError> {
    let mut rows = Vec::with_capacity(base_margins.len() * confidence_levels.len());
    for &base_margin in base_margins {
        for &confidence_level in confidence_levels {
            let grid = PricingParams { base_margin, confidence_level, ..params.clone() };
            rows.push(SensitivityRow::from_result(base_margin, &price(scenarios, peril, &grid)?));
        }
    }
    Ok(rows)
}
