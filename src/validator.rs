//! Post-pricing sanity checks and the audit record that goes with them.
//!
//! A failed check never aborts the request: the quote carries
//! `validation_passed = false` with itemised failures and the caller decides.
//! The one exception to "flag, don't fix" is tail padding, which is corrected
//! upward in place.

use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};

use crate::audit::{AuditRecord, Provenance};
use crate::canvas::{PerilCanvas, TriggerDirection};
use crate::config::{Benchmark, PmlBasis, PricingConfig, ValidationConfig};
use crate::pricer::PricingResult;
use crate::priors::Priors;
use crate::scenarios::ScenarioSet;
use crate::types::RiskLevel;

/// Relative tolerance for the premium identity.
const IDENTITY_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    TailPadding,
    VarTvarOrdering,
    PositiveExpectedLoss,
    PremiumAboveExpectedLoss,
    PremiumIdentity,
    LossRatioBand,
    SimulationYears,
    PayoutBounds,
    PriorBands,
    CovCeiling,
    PmlCeiling,
    RiskLoadRange,
}

impl Check {
    pub const ALL: [Check; 12] = [
        Check::TailPadding,
        Check::VarTvarOrdering,
        Check::PositiveExpectedLoss,
        Check::PremiumAboveExpectedLoss,
        Check::PremiumIdentity,
        Check::LossRatioBand,
        Check::SimulationYears,
        Check::PayoutBounds,
        Check::PriorBands,
        Check::CovCeiling,
        Check::PmlCeiling,
        Check::RiskLoadRange,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Check::TailPadding => "Risk load ≥ floor (tail padding)",
            Check::VarTvarOrdering => "VaR ≤ TVaR",
            Check::PositiveExpectedLoss => "Expected loss > 0",
            Check::PremiumAboveExpectedLoss => "Gross premium > expected loss",
            Check::PremiumIdentity => "Gross = EL × (1 + risk load)",
            Check::LossRatioBand => "Loss ratio within band",
            Check::SimulationYears => "Simulation years match request",
            Check::PayoutBounds => "Payouts within [0, limit]",
            Check::PriorBands => "Prior bands bracket estimates",
            Check::CovCeiling => "CoV below ceiling",
            Check::PmlCeiling => "PML ratio below ceiling",
            Check::RiskLoadRange => "Risk load within [0, ceiling]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub check: Check,
    pub passed: bool,
    /// The result was adjusted to satisfy the check.
    pub corrected: bool,
    pub message: String,
}

impl CheckOutcome {
    fn new(check: Check, passed: bool, message: String) -> Self {
        CheckOutcome { check, passed, corrected: false, message }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub check: Check,
    pub message: String,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.check.label(), self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub checks: Vec<CheckOutcome>,
    pub validation_passed: bool,
    /// Final result, after any tail-padding correction.
    pub result: PricingResult,
    pub alerts: Vec<String>,
    pub dashboard: SanityDashboard,
}

/// Headline ratios of the final result, set against market benchmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanityDashboard {
    /// Gross premium over expected loss; 0 when expected loss is not positive.
    pub premium_to_el_ratio: f64,
    /// TVaR over VaR; 0 when VaR is not positive.
    pub tail_ratio: f64,
    pub pml_ratio: f64,
    pub extreme_loss_probability: f64,
    pub benchmark: BenchmarkComparison,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkComparison {
    /// Benchmark key the peril matched, or `default`.
    pub peril: String,
    pub benchmark: Benchmark,
    pub expected_loss_in_range: bool,
    pub cov_in_range: bool,
    /// Gross premium as a share of the limit.
    pub rate_on_line: f64,
    pub rate_on_line_in_range: bool,
    /// Final risk load minus the benchmark's typical load.
    pub risk_load_gap: f64,
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 { numerator / denominator } else { 0.0 }
}

fn within([lo, hi]: [f64; 2], value: f64) -> bool {
    (lo..=hi).contains(&value)
}

fn dashboard(result: &PricingResult, config: &PricingConfig) -> SanityDashboard {
    let (key, benchmark) = config.benchmarks.lookup(&result.peril);
    let rate_on_line = ratio(result.gross_premium, result.limit);
    SanityDashboard {
        premium_to_el_ratio: ratio(result.gross_premium, result.expected_loss),
        tail_ratio: ratio(result.tvar_99, result.var_99),
        pml_ratio: result.pml_ratio,
        extreme_loss_probability: result.summary.extreme_loss_probability,
        benchmark: BenchmarkComparison {
            peril: key.to_string(),
            benchmark: *benchmark,
            expected_loss_in_range: within(benchmark.expected_loss, result.expected_loss),
            cov_in_range: within(benchmark.cov, result.coefficient_of_variation),
            rate_on_line,
            rate_on_line_in_range: within(benchmark.rate_on_line, rate_on_line),
            risk_load_gap: result.risk_load - benchmark.risk_load,
        },
    }
}

impl ValidationReport {
    pub fn failures(&self) -> Vec<ValidationFailure> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| ValidationFailure { check: c.check, message: c.message.clone() })
            .collect()
    }

    pub fn outcome(&self, check: Check) -> Option<&CheckOutcome> {
        self.checks.iter().find(|c| c.check == check)
    }

    /// Plain-text summary for a non-technical reader: headline figures, the
    /// trigger structure, tail metrics, then validation status and alerts.
    pub fn executive_summary(&self, canvas: &PerilCanvas) -> String {
        let r = &self.result;
        let t = &canvas.trigger;
        let cur = &canvas.currency;
        let confidence = r.confidence_level * 100.0;
        let operator = match t.direction {
            TriggerDirection::Above => "above",
            TriggerDirection::Below => "below",
        };
        let passed = self.checks.iter().filter(|c| c.passed).count();
        let total = self.checks.len();

        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = writeln!(out, "# {} parametric pricing summary", canvas.peril.to_uppercase());
        let _ = writeln!(out, "\n## Key metrics");
        let _ = writeln!(out, "- Expected loss: {cur} {:.0}", r.expected_loss);
        let _ = writeln!(out, "- Recommended premium: {cur} {:.0}", r.gross_premium);
        let _ = writeln!(out, "- Risk level: {}", r.risk_level);
        let _ = writeln!(out, "- Coefficient of variation: {:.2}", r.coefficient_of_variation);
        let _ = writeln!(out, "\n## Recommendation\n{}", r.recommendation);
        let _ = writeln!(out, "\n## Risk structure");
        let _ = writeln!(out, "- Trigger: {} {operator} {} {}", t.metric, t.threshold, t.unit);
        let _ = writeln!(out, "- Maximum payout: {cur} {:.0}", canvas.limit);
        let _ = writeln!(out, "- Payout curve: {}", canvas.payout.shape());
        let _ = writeln!(out, "\n## Risk analysis");
        let _ = writeln!(out, "- {confidence:.0}% VaR: {cur} {:.0}", r.var_99);
        let _ = writeln!(out, "- {confidence:.0}% TVaR: {cur} {:.0}", r.tvar_99);
        let _ = writeln!(out, "- PML ratio: {:.1}x", r.pml_ratio);
        let _ = writeln!(out, "\n## Validation");
        let _ = writeln!(
            out,
            "- Checks passed: {passed}/{total} ({:.0}%)",
            ratio(passed as f64 * 100.0, total as f64)
        );
        let failures = self.failures();
        if !failures.is_empty() {
            let _ = writeln!(out, "\n## Failed checks");
            for f in &failures {
                let _ = writeln!(out, "- {f}");
            }
        }
        if !self.alerts.is_empty() {
            let _ = writeln!(out, "\n## Alerts");
            for alert in &self.alerts {
                let _ = writeln!(out, "- {alert}");
            }
        }
        let _ = write!(out, "\n---\nSimulation: {} years", r.simulation_years);
        out
    }
}

/// Enforces the risk-load floor, raising the load and re-deriving the gross
/// premium when the priced load sits below it.
fn tail_padding(result: &mut PricingResult, floor: f64) -> CheckOutcome {
    if !result.risk_load.is_finite() {
        return CheckOutcome::new(Check::TailPadding, false, format!("risk load {} is not finite", result.risk_load));
    }
    if result.risk_load >= floor {
        return CheckOutcome::new(
            Check::TailPadding,
            true,
            format!("risk load {:.4} ≥ floor {floor:.2}", result.risk_load),
        );
    }
    let before = result.risk_load;
    result.risk_load = floor;
    result.gross_premium = result.expected_loss * (1.0 + floor);
    tracing::warn!(before, floor, "risk load padded up to floor");
    CheckOutcome {
        check: Check::TailPadding,
        passed: true,
        corrected: true,
        message: format!("risk load {before:.4} below floor; padded to {floor:.2}"),
    }
}

fn alerts(result: &PricingResult, band: &ValidationConfig) -> Vec<String> {
    let mut alerts = Vec::new();
    if result.coefficient_of_variation > 1.0 {
        alerts.push(format!(
            "High volatility: CoV {:.2} exceeds 1.0",
            result.coefficient_of_variation
        ));
    }
    let pml_alert = match result.pml_basis {
        PmlBasis::ExpectedLoss => 20.0,
        PmlBasis::Limit => 1.0,
    };
    if result.pml_ratio > pml_alert {
        alerts.push(format!("High PML: ratio {:.2} exceeds {pml_alert}", result.pml_ratio));
    }
    if result.risk_load < band.low_risk_load_alert {
        alerts.push(format!(
            "Low risk load: {:.4} (under {})",
            result.risk_load, band.low_risk_load_alert
        ));
    }
    if result.risk_level == RiskLevel::VeryHigh {
        alerts.push("Risk level VERY_HIGH: launch not recommended on current terms".to_string());
    }
    alerts
}

/// Runs every check against `result`, then assembles the audit record for the
/// request. The record keeps `result` as priced; the report carries it as
/// corrected.
pub fn validate_and_report(
    result: PricingResult,
    scenarios: &ScenarioSet,
    canvas: &PerilCanvas,
    priors: &Priors,
    config: &PricingConfig,
    provenance: &Provenance,
) -> (ValidationReport, AuditRecord) {
    let band = &config.validation;
    let mut corrected = result.clone();
    let mut checks = Vec::with_capacity(Check::ALL.len());

    // ── Tail padding first: later checks see the padded premium ──────────────
    checks.push(tail_padding(&mut corrected, config.pricing.risk_load_floor));
    let r = &corrected;

    checks.push(CheckOutcome::new(
        Check::VarTvarOrdering,
        r.var_99 <= r.tvar_99,
        format!("VaR {:.2} vs TVaR {:.2}", r.var_99, r.tvar_99),
    ));
    checks.push(CheckOutcome::new(
        Check::PositiveExpectedLoss,
        r.expected_loss.is_finite() && r.expected_loss > 0.0,
        format!("expected loss {:.2}", r.expected_loss),
    ));
    checks.push(CheckOutcome::new(
        Check::PremiumAboveExpectedLoss,
        r.gross_premium > r.expected_loss,
        format!("gross {:.2} vs expected loss {:.2}", r.gross_premium, r.expected_loss),
    ));
    let implied = r.expected_loss * (1.0 + r.risk_load);
    checks.push(CheckOutcome::new(
        Check::PremiumIdentity,
        (r.gross_premium - implied).abs() <= IDENTITY_TOLERANCE * implied.abs().max(1.0),
        format!("gross {:.2} vs EL × (1 + load) {implied:.2}", r.gross_premium),
    ));
    checks.push(CheckOutcome::new(
        Check::LossRatioBand,
        (band.loss_ratio_min..=band.loss_ratio_max).contains(&r.loss_ratio),
        format!(
            "loss ratio {:.4} in [{}, {}]",
            r.loss_ratio, band.loss_ratio_min, band.loss_ratio_max
        ),
    ));
    checks.push(CheckOutcome::new(
        Check::SimulationYears,
        r.simulation_years == provenance.years && scenarios.years.len() == provenance.years as usize,
        format!(
            "requested {}, simulated {} baseline year(s)",
            provenance.years,
            scenarios.years.len()
        ),
    ));
    let out_of_bounds = scenarios
        .events()
        .filter(|e| !(e.payout.is_finite() && e.payout >= 0.0 && e.payout <= canvas.limit))
        .count();
    checks.push(CheckOutcome::new(
        Check::PayoutBounds,
        out_of_bounds == 0,
        format!("{out_of_bounds} payout(s) outside [0, {}]", canvas.limit),
    ));
    let band_issues = priors.band_issues();
    checks.push(CheckOutcome::new(
        Check::PriorBands,
        band_issues.is_empty(),
        if band_issues.is_empty() { "all bands bracket their estimates".to_string() } else { band_issues.join("; ") },
    ));
    checks.push(CheckOutcome::new(
        Check::CovCeiling,
        r.coefficient_of_variation < band.max_cov,
        format!("CoV {:.4} vs ceiling {}", r.coefficient_of_variation, band.max_cov),
    ));
    checks.push(CheckOutcome::new(
        Check::PmlCeiling,
        r.pml_ratio < band.max_pml_ratio,
        format!("PML ratio {:.4} vs ceiling {}", r.pml_ratio, band.max_pml_ratio),
    ));
    checks.push(CheckOutcome::new(
        Check::RiskLoadRange,
        (0.0..=band.max_risk_load).contains(&r.risk_load),
        format!("risk load {:.4} in [0, {}]", r.risk_load, band.max_risk_load),
    ));

    let validation_passed = checks.iter().all(|c| c.passed);
    for c in checks.iter().filter(|c| !c.passed) {
        tracing::warn!(check = ?c.check, message = %c.message, "validation check failed");
    }
    let report = ValidationReport {
        alerts: alerts(&corrected, band),
        dashboard: dashboard(&corrected, config),
        checks,
        validation_passed,
        result: corrected,
    };

    let mut record = AuditRecord::open(provenance, &config.pricing);
    record.canvas = Some(canvas.clone());
    record.priors = Some(priors.clone());
    record.scenarios = Some(scenarios.clone());
    record.result = Some(result);
    record.validation = Some(report.clone());
    (report, record)
}
