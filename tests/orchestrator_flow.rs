use std::time::Duration;

use approx::assert_abs_diff_eq;
use portfolio_risk::orchestrator::CancelOutcome;
use portfolio_risk::orchestrator::TaskResult;
use portfolio_risk::orchestrator::TaskStatus;
use portfolio_risk::ErrorKind;
use portfolio_risk::Orchestrator;
use portfolio_risk::OrchestratorConfig;
use serde_json::json;
use serde_json::Value;

const WAIT: Duration = Duration::from_secs(10);

fn two_assets() -> Value {
  json!({
    "mean_returns": [0.08, 0.12],
    "covariance": [[0.04, 0.01], [0.01, 0.09]],
    "bounds": [[0.0, 1.0], [0.0, 1.0]],
    "mode": "mean_variance",
    "target_return": 0.10
  })
}

async fn succeeded(orch: &Orchestrator, task_id: &str) -> Value {
  match orch.wait(task_id, WAIT).await.unwrap() {
    TaskResult::Succeeded { result } => result,
    other => panic!("task {task_id} ended as {other:?}"),
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn risk_and_allocation_round_trip() {
  let orch = Orchestrator::start(OrchestratorConfig::development()).unwrap();

  let var = orch
    .submit(
      "var_cvar",
      json!({
        "returns": [[-0.02], [0.01], [-0.015], [0.03], [-0.01]],
        "weights": [1.0],
        "confidence": 0.95,
        "horizon": 1,
        "method": "historical"
      }),
    )
    .await
    .unwrap();
  let opt = orch.submit("optimize_portfolio", two_assets()).await.unwrap();
  assert_eq!(var.status, TaskStatus::Queued);
  assert_eq!(opt.status, TaskStatus::Queued);

  let risk = succeeded(&orch, &var.task_id).await;
  assert_abs_diff_eq!(risk["var"].as_f64().unwrap(), 0.019, epsilon = 1e-12);
  assert_abs_diff_eq!(risk["cvar"].as_f64().unwrap(), 0.02, epsilon = 1e-12);

  let alloc = succeeded(&orch, &opt.task_id).await;
  let weights: Vec<f64> = alloc["portfolio"]["holdings"]
    .as_array()
    .unwrap()
    .iter()
    .map(|h| h["weight"].as_f64().unwrap())
    .collect();
  assert_abs_diff_eq!(weights.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
  assert_abs_diff_eq!(weights[0], 0.5, epsilon = 1e-6);
  assert_abs_diff_eq!(alloc["expected_return"].as_f64().unwrap(), 0.10, epsilon = 1e-6);

  let status = orch.status(&opt.task_id).unwrap();
  assert!(status.started_at.is_some() && status.completed_at.is_some());
  orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_submission_dispatches_once() {
  let orch = Orchestrator::start(OrchestratorConfig::development()).unwrap();
  let payload = json!({
    "weights": [0.6, 0.4],
    "mean_returns": [0.0005, 0.0003],
    "covariance": [[0.0002, 0.00005], [0.00005, 0.0001]],
    "num_simulations": 2000,
    "horizon": 20,
    "seed": 9
  });

  let handles = submit_repeatedly(&orch, "monte_carlo_simulation", &payload, 5).await;
  assert!(handles.windows(2).all(|w| w[0] == w[1]));

  let first = succeeded(&orch, &handles[0]).await;
  let again = orch.submit("monte_carlo_simulation", payload).await.unwrap();
  assert_eq!(again.status, TaskStatus::Succeeded);
  assert_eq!(orch.result(&again.task_id), Some(TaskResult::Succeeded { result: first }));
  assert_eq!(orch.stats().counters.dispatched, 1);
  orch.shutdown().await;
}

async fn submit_repeatedly(orch: &Orchestrator, name: &str, payload: &Value, n: usize) -> Vec<String> {
  let mut ids = Vec::with_capacity(n);
  for _ in 0..n {
    ids.push(orch.submit(name, payload.clone()).await.unwrap().task_id);
  }
  ids
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn infeasible_target_is_reported_as_optimization_error() {
  let orch = Orchestrator::start(OrchestratorConfig::development()).unwrap();
  let mut payload = two_assets();
  payload["target_return"] = json!(0.20);

  let sub = orch.submit("optimize_portfolio", payload).await.unwrap();
  match orch.wait(&sub.task_id, WAIT).await.unwrap() {
    TaskResult::Failed { error } => {
      assert_eq!(error.error_kind, ErrorKind::OptimizationError);
      assert!(!error.message.is_empty());
    }
    other => panic!("expected failure, got {other:?}"),
  }
  assert_eq!(orch.cancel(&sub.task_id), Some(CancelOutcome::AlreadyTerminal(TaskStatus::Failed)));
  orch.shutdown().await;
}

#[tokio::test]
async fn malformed_parameters_are_rejected() {
  let orch = Orchestrator::start(OrchestratorConfig::development()).unwrap();
  let err = orch
    .submit("stress_test", json!({"weights": [1.0], "scenarios": [], "leverage": 2}))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::ValidationError);
  assert!(orch.status("anything").is_none());
  orch.shutdown().await;
}
