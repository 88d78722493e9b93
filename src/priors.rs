use rand::Rng;
use rand_distr::{Distribution, Exp, Gamma, LogNormal, Pareto};
use serde::{Deserialize, Serialize};

use crate::error::SimulationError;

/// Hard ceiling on events drawn for a single simulated year.
pub const MAX_EVENTS_PER_YEAR: u64 = 100_000;

/// Best estimate of one parameter with the model's 5th–95th percentile band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub value: f64,
    pub p5: f64,
    pub p95: f64,
}

impl Estimate {
    /// Degenerate band around `value`.
    pub fn point(value: f64) -> Self {
        Estimate { value, p5: value, p95: value }
    }

    pub fn brackets(&self) -> bool {
        self.p5 <= self.value && self.value <= self.p95
    }

    fn band_issue(&self, name: &str) -> Option<String> {
        if !(self.p5.is_finite() && self.p95.is_finite()) {
            return Some(format!("{name} band [{}, {}] is not finite", self.p5, self.p95));
        }
        (!self.brackets()).then(|| {
            format!(
                "{name} estimate {} lies outside its 5th-95th band [{}, {}]",
                self.value, self.p5, self.p95
            )
        })
    }
}

fn finite(name: &str, v: f64) -> Option<String> {
    (!v.is_finite()).then(|| format!("{name} must be finite, got {v}"))
}

fn positive(name: &str, v: f64) -> Option<String> {
    (!(v.is_finite() && v > 0.0)).then(|| format!("{name} must be finite and > 0, got {v}"))
}

fn unit_open(name: &str, v: f64) -> Option<String> {
    (!(v.is_finite() && v > 0.0 && v < 1.0)).then(|| format!("{name} must lie in (0, 1), got {v}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum FrequencyModel {
    /// Failures before `r` successes with success probability `p`.
    /// E[N] = r(1 − p)/p.
    NegativeBinomial { r: Estimate, p: Estimate },
    Poisson { lambda: Estimate },
}

impl FrequencyModel {
    pub fn mean(&self) -> f64 {
        match self {
            FrequencyModel::NegativeBinomial { r, p } => r.value * (1.0 - p.value) / p.value,
            FrequencyModel::Poisson { lambda } => lambda.value,
        }
    }

    fn estimates(&self) -> Vec<(&'static str, &Estimate)> {
        match self {
            FrequencyModel::NegativeBinomial { r, p } => vec![("frequency r", r), ("frequency p", p)],
            FrequencyModel::Poisson { lambda } => vec![("frequency lambda", lambda)],
        }
    }

    /// Parameters outside their domain. Never clamped; the caller decides.
    pub fn domain_issues(&self) -> Vec<String> {
        match self {
            FrequencyModel::NegativeBinomial { r, p } => {
                [positive("frequency r", r.value), unit_open("frequency p", p.value)]
                    .into_iter()
                    .flatten()
                    .collect()
            }
            FrequencyModel::Poisson { lambda } => {
                positive("frequency lambda", lambda.value).into_iter().collect()
            }
        }
    }

    pub fn band_issues(&self) -> Vec<String> {
        self.estimates().into_iter().filter_map(|(name, e)| e.band_issue(name)).collect()
    }

    pub fn sampler(&self) -> Result<CountSampler, SimulationError> {
        if let Some(issue) = self.domain_issues().into_iter().next() {
            return Err(SimulationError::InvalidPrior(issue));
        }
        let law = match *self {
            FrequencyModel::NegativeBinomial { r, p } => CountLaw::NegativeBinomial {
                r: r.value,
                ln_p: p.value.ln(),
                ln_q: (1.0 - p.value).ln(),
            },
            FrequencyModel::Poisson { lambda } => {
                CountLaw::Poisson { lambda: lambda.value, ln_lambda: lambda.value.ln() }
            }
        };
        Ok(CountSampler { law, mean: self.mean() })
    }
}

#[derive(Debug, Clone, Copy)]
enum CountLaw {
    Poisson { lambda: f64, ln_lambda: f64 },
    NegativeBinomial { r: f64, ln_p: f64, ln_q: f64 },
}

/// Annual event counts by inversion: one uniform per year, mapped through the
/// CDF. A higher-mean prior never yields fewer events from the same uniform.
#[derive(Debug, Clone, Copy)]
pub struct CountSampler {
    law: CountLaw,
    mean: f64,
}

impl CountSampler {
    /// Smallest `k` with `CDF(k) ≥ u`, capped at [`MAX_EVENTS_PER_YEAR`].
    pub fn quantile(&self, u: f64) -> u64 {
        let mut ln_pmf = match self.law {
            CountLaw::Poisson { lambda, .. } => -lambda,
            CountLaw::NegativeBinomial { r, ln_p, .. } => r * ln_p,
        };
        let mut cdf = ln_pmf.exp();
        let mut k = 0u64;
        while cdf < u && k < MAX_EVENTS_PER_YEAR {
            k += 1;
            let kf = k as f64;
            ln_pmf += match self.law {
                CountLaw::Poisson { ln_lambda, .. } => ln_lambda - kf.ln(),
                CountLaw::NegativeBinomial { r, ln_q, .. } => ((kf - 1.0 + r) / kf).ln() + ln_q,
            };
            cdf += ln_pmf.exp();
            // Past the mean with negligible mass left: rounding kept cdf below u.
            if kf > self.mean && ln_pmf < -60.0 {
                break;
            }
        }
        k
    }

    /// Consumes exactly one draw from `rng`.
    pub fn sample(&self, rng: &mut impl Rng) -> u64 {
        self.quantile(rng.random::<f64>())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum SeverityModel {
    /// ln-space params; E[X] = exp(mu + sigma²/2).
    LogNormal { mu: Estimate, sigma: Estimate },
    /// E[X] = shape · scale.
    Gamma { shape: Estimate, scale: Estimate },
    Exponential { rate: Estimate },
    /// `scale` = minimum value, `shape` = tail index α.
    /// E[X] = scale · shape / (shape − 1), infinite for shape ≤ 1.
    Pareto { scale: Estimate, shape: Estimate },
}

impl SeverityModel {
    pub fn mean(&self) -> f64 {
        match self {
            SeverityModel::LogNormal { mu, sigma } => (mu.value + sigma.value.powi(2) / 2.0).exp(),
            SeverityModel::Gamma { shape, scale } => shape.value * scale.value,
            SeverityModel::Exponential { rate } => 1.0 / rate.value,
            SeverityModel::Pareto { scale, shape } => {
                if shape.value > 1.0 {
                    scale.value * shape.value / (shape.value - 1.0)
                } else {
                    f64::INFINITY
                }
            }
        }
    }

    pub fn family(&self) -> &'static str {
        match self {
            SeverityModel::LogNormal { .. } => "lognormal",
            SeverityModel::Gamma { .. } => "gamma",
            SeverityModel::Exponential { .. } => "exponential",
            SeverityModel::Pareto { .. } => "pareto",
        }
    }

    fn estimates(&self) -> Vec<(&'static str, &Estimate)> {
        match self {
            SeverityModel::LogNormal { mu, sigma } => vec![("severity mu", mu), ("severity sigma", sigma)],
            SeverityModel::Gamma { shape, scale } => {
                vec![("severity shape", shape), ("severity scale", scale)]
            }
            SeverityModel::Exponential { rate } => vec![("severity rate", rate)],
            SeverityModel::Pareto { scale, shape } => {
                vec![("severity scale", scale), ("severity shape", shape)]
            }
        }
    }

    pub fn domain_issues(&self) -> Vec<String> {
        let issues = match self {
            SeverityModel::LogNormal { mu, sigma } => {
                [finite("severity mu", mu.value), positive("severity sigma", sigma.value)]
            }
            SeverityModel::Gamma { shape, scale } => {
                [positive("severity shape", shape.value), positive("severity scale", scale.value)]
            }
            SeverityModel::Exponential { rate } => [positive("severity rate", rate.value), None],
            SeverityModel::Pareto { scale, shape } => {
                [positive("severity scale", scale.value), positive("severity shape", shape.value)]
            }
        };
        issues.into_iter().flatten().collect()
    }

    pub fn band_issues(&self) -> Vec<String> {
        self.estimates().into_iter().filter_map(|(name, e)| e.band_issue(name)).collect()
    }

    pub fn sampler(&self) -> Result<SeveritySampler, SimulationError> {
        if let Some(issue) = self.domain_issues().into_iter().next() {
            return Err(SimulationError::InvalidPrior(issue));
        }
        let invalid = |e: &dyn std::fmt::Display| SimulationError::InvalidPrior(e.to_string());
        Ok(match *self {
            SeverityModel::LogNormal { mu, sigma } => SeveritySampler::LogNormal(
                LogNormal::new(mu.value, sigma.value).map_err(|e| invalid(&e))?,
            ),
            SeverityModel::Gamma { shape, scale } => SeveritySampler::Gamma(
                Gamma::new(shape.value, scale.value).map_err(|e| invalid(&e))?,
            ),
            SeverityModel::Exponential { rate } => {
                SeveritySampler::Exponential(Exp::new(rate.value).map_err(|e| invalid(&e))?)
            }
            SeverityModel::Pareto { scale, shape } => SeveritySampler::Pareto(
                Pareto::new(scale.value, shape.value).map_err(|e| invalid(&e))?,
            ),
        })
    }
}

/// Validated, ready-to-draw severity distribution.
#[derive(Debug, Clone)]
pub enum SeveritySampler {
    LogNormal(LogNormal<f64>),
    Gamma(Gamma<f64>),
    Exponential(Exp<f64>),
    Pareto(Pareto<f64>),
}

impl SeveritySampler {
    pub fn sample(&self, rng: &mut impl Rng) -> f64 {
        match self {
            SeveritySampler::LogNormal(d) => d.sample(rng),
            SeveritySampler::Gamma(d) => d.sample(rng),
            SeveritySampler::Exponential(d) => d.sample(rng),
            SeveritySampler::Pareto(d) => d.sample(rng),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyPrior {
    pub distribution: FrequencyModel,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub rationale: String,
    /// Self-reported confidence in [0, 1]; informational only.
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityPrior {
    pub distribution: SeverityModel,
    /// Trigger-metric unit the severity is expressed in.
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub confidence: f64,
}

/// Black-swan event suggested by the model, in trigger-metric units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TailScenario {
    pub name: String,
    pub severity: f64,
    #[serde(default)]
    pub annual_probability: f64,
    #[serde(default)]
    pub rationale: String,
}

impl TailScenario {
    pub fn issues(&self) -> Vec<String> {
        let mut issues: Vec<String> =
            positive(&format!("tail scenario '{}' severity", self.name), self.severity)
                .into_iter()
                .collect();
        let p = self.annual_probability;
        if !(p.is_finite() && p > 0.0 && p <= 1.0) {
            issues.push(format!(
                "tail scenario '{}' annual probability must lie in (0, 1], got {p}",
                self.name
            ));
        }
        issues
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Priors {
    pub frequency: FrequencyPrior,
    pub severity: SeverityPrior,
    #[serde(default)]
    pub tail: Vec<TailScenario>,
    /// Critique rounds it took to accept these priors.
    #[serde(default)]
    pub critique_rounds: u32,
}

impl Priors {
    /// Domain and band problems across both priors.
    pub fn issues(&self) -> Vec<String> {
        let mut issues = self.frequency.distribution.domain_issues();
        issues.extend(self.severity.distribution.domain_issues());
        issues.extend(self.band_issues());
        issues
    }

    pub fn band_issues(&self) -> Vec<String> {
        let mut issues = self.frequency.distribution.band_issues();
        issues.extend(self.severity.distribution.band_issues());
        issues
    }
}
