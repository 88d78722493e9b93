use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::canvas::PerilCanvas;
use crate::config::SimulationConfig;
use crate::error::{PricingError, SimulationError};
use crate::priors::{CountSampler, MAX_EVENTS_PER_YEAR, Priors, SeveritySampler};
use crate::types::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YearKind {
    Baseline,
    /// One-event year built from an elicited tail scenario.
    Tail,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Trigger-metric value.
    pub severity: f64,
    /// Clipped payout, in `[0, limit]`.
    pub payout: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedYear {
    pub index: u32,
    pub kind: YearKind,
    pub events: Vec<EventRecord>,
}

impl SimulatedYear {
    pub fn total_payout(&self) -> f64 {
        self.events.iter().map(|e| e.payout).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSet {
    pub seed: u64,
    pub requested_years: u32,
    pub limit: f64,
    pub years: Vec<SimulatedYear>,
    pub tail_years: Vec<SimulatedYear>,
}

impl ScenarioSet {
    /// Baseline years then tail years, each weighted equally.
    pub fn all_years(&self) -> impl Iterator<Item = &SimulatedYear> {
        self.years.iter().chain(self.tail_years.iter())
    }

    pub fn annual_totals(&self) -> Vec<f64> {
        self.all_years().map(SimulatedYear::total_payout).collect()
    }

    pub fn year_count(&self) -> usize {
        self.years.len() + self.tail_years.len()
    }

    pub fn event_count(&self) -> usize {
        self.all_years().map(|y| y.events.len()).sum()
    }

    pub fn events(&self) -> impl Iterator<Item = &EventRecord> {
        self.all_years().flat_map(|y| y.events.iter())
    }
}

/// RNG for one simulated year. Each year reads its own ChaCha stream, so a
/// year's draws do not depend on which thread samples it or in what order.
pub fn year_rng(seed: u64, index: u32) -> ChaCha20Rng {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    rng.set_stream(u64::from(index));
    rng
}

fn simulate_year(
    canvas: &PerilCanvas,
    counts: &CountSampler,
    severities: &SeveritySampler,
    seed: u64,
    index: u32,
) -> Result<SimulatedYear, SimulationError> {
    let mut rng = year_rng(seed, index);
    let n = counts.sample(&mut rng);
    if n >= MAX_EVENTS_PER_YEAR {
        return Err(SimulationError::ExcessiveCount { year: index, count: n });
    }

    let mut events = Vec::with_capacity(n as usize);
    for event in 0..n {
        let severity = severities.sample(&mut rng);
        if !severity.is_finite() {
            return Err(SimulationError::NonFiniteSeverity { year: index, event, value: severity });
        }
        events.push(EventRecord { severity, payout: canvas.payout(severity) });
    }

    let year = SimulatedYear { index, kind: YearKind::Baseline, events };
    if !year.total_payout().is_finite() {
        return Err(SimulationError::NonFiniteTotal { year: index });
    }
    Ok(year)
}

/// Samples `years` baseline years from the priors, then appends one year per
/// tail scenario. Same canvas, priors, years and seed give an identical set.
///
/// Years run in batches of `batch_years`; `cancel` is checked before each
/// batch. Batches are sampled on the rayon pool once `years` reaches
/// `parallel_threshold`.
pub fn generate_scenarios(
    canvas: &PerilCanvas,
    priors: &Priors,
    years: u32,
    seed: u64,
    settings: &SimulationConfig,
    cancel: &CancelToken,
) -> Result<ScenarioSet, PricingError> {
    if years == 0 {
        return Err(SimulationError::NoYears.into());
    }
    let counts = priors.frequency.distribution.sampler()?;
    let severities = priors.severity.distribution.sampler()?;

    let parallel = years >= settings.parallel_threshold;
    let batch = settings.batch_years.max(1);
    let mut baseline = Vec::with_capacity(years as usize);
    let mut start = 0u32;
    while start < years {
        if cancel.is_cancelled() {
            tracing::info!(completed_years = start, "scenario generation cancelled");
            return Err(PricingError::Cancelled);
        }
        let end = start.saturating_add(batch).min(years);
        let sample = |index: u32| simulate_year(canvas, &counts, &severities, seed, index);
        let chunk: Result<Vec<_>, _> = if parallel {
            (start..end).into_par_iter().map(sample).collect()
        } else {
            (start..end).map(sample).collect()
        };
        baseline.extend(chunk?);
        start = end;
    }

    let mut tail_years = Vec::with_capacity(priors.tail.len());
    for (offset, scenario) in priors.tail.iter().enumerate() {
        let index = years.saturating_add(offset as u32);
        if !scenario.severity.is_finite() {
            return Err(SimulationError::NonFiniteSeverity {
                year: index,
                event: 0,
                value: scenario.severity,
            }
            .into());
        }
        tail_years.push(SimulatedYear {
            index,
            kind: YearKind::Tail,
            events: vec![EventRecord {
                severity: scenario.severity,
                payout: canvas.payout(scenario.severity),
            }],
        });
    }

    let set = ScenarioSet { seed, requested_years: years, limit: canvas.limit, years: baseline, tail_years };
    tracing::info!(
        years = set.years.len(),
        tail_years = set.tail_years.len(),
        events = set.event_count(),
        parallel,
        "scenarios generated"
    );
    Ok(set)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn settings() -> SimulationConfig {
        SimulationConfig::default()
    }

    #[test]
    fn same_seed_same_scenarios() {
        let a = generate_scenarios(&golden_canvas(), &golden_priors(), 500, 7, &settings(), &CancelToken::new()).unwrap();
        let b = generate_scenarios(&golden_canvas(), &golden_priors(), 500, 7, &settings(), &CancelToken::new()).unwrap();
        assert_eq!(a, b);
        let c = generate_scenarios(&golden_canvas(), &golden_priors(), 500, 8, &settings(), &CancelToken::new()).unwrap();
        assert_ne!(a.years, c.years);
    }

    /// Parallel and sequential sampling, and any batch size, give the same set.
    #[test]
    fn parallelism_does_not_change_output() {
        let sequential = SimulationConfig { parallel_threshold: u32::MAX, batch_years: 1000, ..settings() };
        let parallel = SimulationConfig { parallel_threshold: 1, batch_years: 37, ..settings() };
        let a = generate_scenarios(&golden_canvas(), &golden_priors(), 1200, 42, &sequential, &CancelToken::new()).unwrap();
        let b = generate_scenarios(&golden_canvas(), &golden_priors(), 1200, 42, &parallel, &CancelToken::new()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn year_counts_and_indices() {
        let set = generate_scenarios(&golden_canvas(), &golden_priors(), 1000, 42, &settings(), &CancelToken::new()).unwrap();
        assert_eq!(set.years.len(), 1000);
        assert_eq!(set.requested_years, 1000);
        assert_eq!(set.tail_years.len(), 3);
        assert_eq!(set.year_count(), 1003);
        for (i, y) in set.years.iter().enumerate() {
            assert_eq!(y.index, i as u32);
            assert_eq!(y.kind, YearKind::Baseline);
        }
        assert_eq!(set.tail_years[0].index, 1000);
        assert!(set.tail_years.iter().all(|y| y.kind == YearKind::Tail && y.events.len() == 1));
    }

    #[test]
    fn payouts_stay_within_limit() {
        let mut canvas = golden_canvas();
        canvas.limit = 900_000.0;
        let set = generate_scenarios(&canvas, &golden_priors(), 1000, 42, &settings(), &CancelToken::new()).unwrap();
        assert!(set.events().any(|e| e.payout == canvas.limit), "some events should hit the limit");
        for e in set.events() {
            assert!(e.payout >= 0.0 && e.payout <= canvas.limit, "payout {} out of range", e.payout);
            assert_eq!(e.payout, canvas.payout(e.severity));
        }
    }

    #[test]
    fn mean_event_count_matches_prior() {
        let set = generate_scenarios(&golden_canvas(), &golden_priors(), 5000, 42, &settings(), &CancelToken::new()).unwrap();
        let mean = set.years.iter().map(|y| y.events.len()).sum::<usize>() as f64 / 5000.0;
        assert!((1.85..=2.15).contains(&mean), "mean events/year {mean:.3}");
    }

    #[test]
    fn cancellation_stops_between_batches() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = generate_scenarios(&golden_canvas(), &golden_priors(), 1000, 42, &settings(), &cancel).unwrap_err();
        assert!(matches!(err, PricingError::Cancelled));
    }

    #[test]
    fn invalid_priors_are_simulation_errors() {
        let mut priors = golden_priors();
        priors.severity.distribution = crate::priors::SeverityModel::Exponential {
            rate: crate::priors::Estimate::point(-1.0),
        };
        let err = generate_scenarios(&golden_canvas(), &priors, 10, 42, &settings(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, PricingError::Simulation(SimulationError::InvalidPrior(_))), "{err:?}");
    }

    #[test]
    fn zero_years_is_rejected() {
        let err = generate_scenarios(&golden_canvas(), &golden_priors(), 0, 42, &settings(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, PricingError::Simulation(SimulationError::NoYears)));
    }

    /// With common random numbers a larger λ never yields a smaller year total.
    #[test]
    fn higher_frequency_dominates_year_by_year() {
        let low = generate_scenarios(&golden_canvas(), &poisson_priors(1.0), 300, 42, &settings(), &CancelToken::new()).unwrap();
        let high = generate_scenarios(&golden_canvas(), &poisson_priors(1.5), 300, 42, &settings(), &CancelToken::new()).unwrap();
        for (a, b) in low.years.iter().zip(&high.years) {
            assert!(a.events.len() <= b.events.len());
            assert!(a.total_payout() <= b.total_payout());
        }
    }
}
