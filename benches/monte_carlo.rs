use std::hint::black_box;
use std::time::Duration;

use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use ndarray::Array2;
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use portfolio_risk::quant::monte_carlo::MonteCarloEngine;
use portfolio_risk::quant::monte_carlo::SimulationSpec;
use portfolio_risk::quant::returns::ReturnSeries;
use portfolio_risk::quant::risk::RiskCalculator;
use portfolio_risk::quant::risk::RiskConfig;
use portfolio_risk::quant::risk::VarMethod;

const ASSETS: usize = 8;
const PERIODS: usize = 500;

fn sample_series() -> ReturnSeries {
  let mut rng = StdRng::seed_from_u64(7);
  let draws = Array2::random_using((PERIODS, ASSETS), Normal::new(0.0004, 0.012).unwrap(), &mut rng);
  let rows: Vec<Vec<f64>> = draws.outer_iter().map(|r| r.to_vec()).collect();
  ReturnSeries::new(&rows).unwrap()
}

fn spec(series: &ReturnSeries, num_paths: usize) -> SimulationSpec {
  let cov = series.covariance().unwrap();
  SimulationSpec::new(
    vec![1.0 / ASSETS as f64; ASSETS],
    series.mean_returns().to_vec(),
    cov.outer_iter().map(|r| r.to_vec()).collect(),
    num_paths,
    10,
    Some(42),
    None,
  )
}

fn bench_simulation(c: &mut Criterion) {
  let series = sample_series();
  let mut group = c.benchmark_group("MonteCarlo");
  group.measurement_time(Duration::from_secs(3));
  group.warm_up_time(Duration::from_millis(500));

  for &paths in &[1_000usize, 10_000usize] {
    let engine = MonteCarloEngine::new(&spec(&series, paths)).unwrap();

    group.bench_with_input(BenchmarkId::new("terminal_values", paths), &paths, |b, _| {
      b.iter(|| black_box(engine.terminal_values().sum::<f64>()));
    });

    group.bench_with_input(BenchmarkId::new("terminal_values_par", paths), &paths, |b, _| {
      b.iter(|| black_box(engine.terminal_values_par()));
    });

    group.bench_with_input(BenchmarkId::new("summarize", paths), &paths, |b, _| {
      b.iter(|| black_box(engine.summarize(0.95).unwrap()));
    });
  }

  group.finish();
}

fn bench_var_methods(c: &mut Criterion) {
  let series = sample_series();
  let weights = vec![1.0 / ASSETS as f64; ASSETS];
  let mut group = c.benchmark_group("VaR");

  for method in [VarMethod::Historical, VarMethod::Parametric, VarMethod::MonteCarlo] {
    let calc = RiskCalculator::new(RiskConfig {
      method,
      num_simulations: 5_000,
      seed: Some(42),
      ..RiskConfig::default()
    });
    group.bench_function(method.to_string(), |b| {
      b.iter(|| black_box(calc.assess(&series, &weights, None).unwrap()));
    });
  }

  group.finish();
}

criterion_group!(benches, bench_simulation, bench_var_methods);
criterion_main!(benches);
