use serde::{Deserialize, Serialize};

use crate::config::{PmlBasis, PricingParams};
use crate::error::{DegenerateLossError, PricingError};
use crate::scenarios::ScenarioSet;
use crate::types::RiskLevel;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistStats {
    pub n: usize,
    pub min: f64,
    pub p5: f64,
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
    pub mean: f64,
    /// Sample standard deviation (n − 1 denominator).
    pub std_dev: f64,
}

/// Sorts `values` in place and summarises them. Percentiles interpolate
/// linearly between order statistics.
pub fn percentile_stats(values: &mut [f64]) -> Option<DistStats> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let n = values.len();

    let interp = |p: f64| -> f64 {
        let h = p * (n - 1) as f64;
        let lo = h.floor() as usize;
        let hi = (lo + 1).min(n - 1);
        let frac = h - lo as f64;
        values[lo] * (1.0 - frac) + values[hi] * frac
    };

    let mean = values.iter().sum::<f64>() / n as f64;
    let variance = if n > 1 {
        values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64
    } else {
        0.0
    };

    Some(DistStats {
        n,
        min: values[0],
        p5: interp(0.05),
        p10: interp(0.10),
        p25: interp(0.25),
        p50: interp(0.50),
        p75: interp(0.75),
        p90: interp(0.90),
        p95: interp(0.95),
        p99: interp(0.99),
        max: values[n - 1],
        mean,
        std_dev: variance.sqrt(),
    })
}

/// Order statistic at `ceil(confidence · n) − 1` of an ascending slice.
pub fn value_at_risk(sorted: &[f64], confidence: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    let rank = (confidence * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

/// Mean of every total at or above `var`.
pub fn tail_value_at_risk(sorted: &[f64], var: f64) -> f64 {
    let first = sorted.partition_point(|&x| x < var);
    let tail = &sorted[first..];
    if tail.is_empty() {
        return var;
    }
    let mean = tail.iter().sum::<f64>() / tail.len() as f64;
    // A flat tail can round a hair below VaR.
    mean.max(var)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSummary {
    pub years: usize,
    pub tail_years: usize,
    pub total_events: usize,
    pub mean_events_per_year: f64,
    pub max_events_per_year: usize,
    /// Share of simulated years with no payout.
    pub zero_loss_probability: f64,
    /// Share of simulated years whose total exceeds the 95th percentile.
    #[serde(default)]
    pub extreme_loss_probability: f64,
    pub skewness: f64,
    pub excess_kurtosis: f64,
    pub annual_loss: DistStats,
}

fn shape_moments(values: &[f64], mean: f64) -> (f64, f64) {
    let n = values.len() as f64;
    let (m2, m3, m4) = values.iter().fold((0.0, 0.0, 0.0), |(m2, m3, m4), x| {
        let d = x - mean;
        (m2 + d * d, m3 + d * d * d, m4 + d * d * d * d)
    });
    let (m2, m3, m4) = (m2 / n, m3 / n, m4 / n);
    if m2 <= 0.0 {
        return (0.0, 0.0);
    }
    (m3 / m2.powf(1.5), m4 / (m2 * m2) - 3.0)
}

fn summarise(scenarios: &ScenarioSet, sorted: &[f64], stats: DistStats) -> ScenarioSummary {
    let years = scenarios.year_count();
    let total_events = scenarios.event_count();
    let (skewness, excess_kurtosis) = shape_moments(sorted, stats.mean);
    ScenarioSummary {
        years,
        tail_years: scenarios.tail_years.len(),
        total_events,
        mean_events_per_year: total_events as f64 / years as f64,
        max_events_per_year: scenarios.all_years().map(|y| y.events.len()).max().unwrap_or(0),
        zero_loss_probability: sorted.iter().filter(|&&x| x == 0.0).count() as f64 / years as f64,
        extreme_loss_probability: (sorted.len() - sorted.partition_point(|&x| x <= stats.p95)) as f64
            / years as f64,
        skewness,
        excess_kurtosis,
        annual_loss: stats,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingResult {
    pub peril: String,
    pub expected_loss: f64,
    pub std_dev: f64,
    pub coefficient_of_variation: f64,
    /// `base_margin + sensitivity × CoV`, before the floor.
    pub formula_risk_load: f64,
    pub risk_load: f64,
    pub net_premium: f64,
    pub gross_premium: f64,
    pub var_99: f64,
    pub tvar_99: f64,
    pub confidence_level: f64,
    pub pml_ratio: f64,
    pub pml_basis: PmlBasis,
    pub loss_ratio: f64,
    pub limit: f64,
    pub risk_level: RiskLevel,
    pub recommendation: String,
    /// Baseline years requested; tail years come on top.
    pub simulation_years: u32,
    pub summary: ScenarioSummary,
}

/// Prices a scenario set. Pure: the same set and parameters always give a
/// bit-identical result.
pub fn price(
    scenarios: &ScenarioSet,
    peril: &str,
    params: &PricingParams,
) -> Result<PricingResult, PricingError> {
    let mut sorted = scenarios.annual_totals();
    let stats =
        percentile_stats(&mut sorted).ok_or(DegenerateLossError { expected_loss: 0.0 })?;

    let expected_loss = stats.mean;
    if !(expected_loss.is_finite() && expected_loss > 0.0) {
        tracing::warn!(expected_loss, "degenerate expected loss");
        return Err(DegenerateLossError { expected_loss }.into());
    }

    let cov = stats.std_dev / expected_loss;
    let formula_risk_load = params.base_margin + params.sensitivity * cov;
    let risk_load = formula_risk_load.max(params.risk_load_floor);
    let gross_premium = expected_loss * (1.0 + risk_load);

    let var = value_at_risk(&sorted, params.confidence_level);
    let tvar = tail_value_at_risk(&sorted, var);
    let pml_ratio = match params.pml_basis {
        PmlBasis::Limit => var / scenarios.limit,
        PmlBasis::ExpectedLoss => var / expected_loss,
    };
    let loss_ratio = expected_loss / scenarios.limit;
    let risk_level = params.thresholds.classify(cov, loss_ratio);

    tracing::info!(
        expected_loss,
        cov,
        risk_load,
        gross_premium,
        var_99 = var,
        risk_level = %risk_level,
        "priced"
    );

    Ok(PricingResult {
        peril: peril.to_string(),
        expected_loss,
        std_dev: stats.std_dev,
        coefficient_of_variation: cov,
        formula_risk_load,
        risk_load,
        net_premium: expected_loss,
        gross_premium,
        var_99: var,
        tvar_99: tvar,
        confidence_level: params.confidence_level,
        pml_ratio,
        pml_basis: params.pml_basis,
        loss_ratio,
        limit: scenarios.limit,
        risk_level,
        recommendation: risk_level.recommendation().to_string(),
        simulation_years: scenarios.requested_years,
        summary: summarise(scenarios, &sorted, stats),
    })
}
