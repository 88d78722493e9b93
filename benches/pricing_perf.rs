
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use priorquote::config::{PricingParams, SimulationConfig};
use priorquote::pricer::price;
use priorquote::stress::{STANDARD_SHOCKS, stress_test};
use priorquote::types::CancelToken;

use fixtures::{BUSY, LINEAR, STEP, canvas, priors, scenario_set};

// ── Group 1: scenario_generation — year-count scaling ───────────────────────

fn bench_scenario_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("scenario_generation");
    let settings = SimulationConfig::default();
    for &years in &[1_000u32, 10_000, 100_000] {
        if years == 100_000 {
            group.sample_size(10);
        }
        group.throughput(Throughput::Elements(u64::from(years)));
        group.bench_with_input(BenchmarkId::from_parameter(years), &years, |b, &y| {
            let (canvas, priors) = (canvas(&LINEAR), priors(&LINEAR));
            b.iter(|| {
                priorquote::scenarios::generate_scenarios(&canvas, &priors, y, 42, &settings, &CancelToken::new())
            })
        });
    }
    group.finish();
}

// ── Group 2: sequential_vs_parallel — rayon threshold ───────────────────────

fn bench_sequential_vs_parallel(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_vs_parallel");
    group.sample_size(10);
    let sequential = SimulationConfig { parallel_threshold: u32::MAX, ..SimulationConfig::default() };
    let parallel = SimulationConfig { parallel_threshold: 1, ..SimulationConfig::default() };
    for (name, settings) in [("sequential", &sequential), ("parallel", &parallel)] {
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            b.iter(|| scenario_set(&BUSY, 20_000, settings))
        });
    }
    group.finish();
}

// ── Group 3: price — reduction over annual totals ───────────────────────────

fn bench_price(c: &mut Criterion) {
    let mut group = c.benchmark_group("price");
    let params = PricingParams::default();
    for book in [&LINEAR, &STEP, &BUSY] {
        let set = scenario_set(book, 10_000, &SimulationConfig::default());
        group.throughput(Throughput::Elements(set.year_count() as u64));
        group.bench_function(BenchmarkId::from_parameter(book.name), |b| {
            b.iter(|| price(&set, "typhoon", &params))
        });
    }
    group.finish();
}

// ── Group 4: stress — re-pricing under standard shocks ──────────────────────

fn bench_stress(c: &mut Criterion) {
    let mut group = c.benchmark_group("stress");
    let params = PricingParams::default();
    let canvas = canvas(&LINEAR);
    group.bench_function("standard_shocks", |b| {
        b.iter_batched(
            || scenario_set(&LINEAR, 5_000, &SimulationConfig::default()),
            |set| stress_test(&set, &canvas, &params, &STANDARD_SHOCKS),
            BatchSize::LargeInput,
        )
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_scenario_generation,
    bench_sequential_vs_parallel,
    bench_price,
    bench_stress,
);
criterion_main!(benches);
