//! Resource loading: retry with linear backoff and offline resolution.

mod common;

use common::{eventually, raw_config, CollectingObserver, ScriptedBackend};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tuneforge_training::{
    AttemptOutcome, ResourceError, RunConfig, RunError, RunPhase, RunSupervisor,
};

fn config_with_backoff(temp: &TempDir, base_secs: u32) -> RunConfig {
    let mut raw = raw_config(temp, 1);
    raw.max_retries = "3".to_string();
    raw.retry_backoff_secs = base_secs.to_string();
    RunConfig::from_raw(&raw).unwrap()
}

async fn run(backend: ScriptedBackend, config: RunConfig) -> (Arc<ScriptedBackend>, Arc<CollectingObserver>, tuneforge_training::RunSummary) {
    let backend = Arc::new(backend);
    let observer = Arc::new(CollectingObserver::default());
    let supervisor = RunSupervisor::new(Arc::clone(&backend)).with_observer(observer.clone());
    supervisor.start_from_config(config).unwrap();
    let summary = supervisor.wait().await.unwrap();
    (backend, observer, summary)
}

#[tokio::test(start_paused = true)]
async fn test_two_failures_then_success_backs_off_linearly() {
    let temp = TempDir::new().unwrap();
    let started = tokio::time::Instant::now();

    let (backend, observer, summary) =
        run(ScriptedBackend::with_losses(&[1.0]).failing_loads(2), config_with_backoff(&temp, 1)).await;

    assert_eq!(summary.phase, RunPhase::Completed);
    assert_eq!(backend.load_calls(), 3);

    let attempts = observer.load_attempts();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(
        attempts.iter().map(|a| a.outcome).collect::<Vec<_>>(),
        vec![AttemptOutcome::Failure, AttemptOutcome::Failure, AttemptOutcome::Success]
    );
    assert_eq!(
        attempts.iter().map(|a| a.backoff).collect::<Vec<_>>(),
        vec![Some(Duration::from_secs(1)), Some(Duration::from_secs(2)), None]
    );
    assert!(attempts[0].error.as_deref().unwrap().contains("connection reset"));
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_load_exhausts_retries() {
    let temp = TempDir::new().unwrap();

    let (backend, observer, summary) =
        run(ScriptedBackend::with_losses(&[1.0]).failing_loads(u32::MAX), config_with_backoff(&temp, 5)).await;

    assert_eq!(summary.phase, RunPhase::Failed);
    assert_eq!(backend.load_calls(), 3);
    assert!(matches!(
        summary.error,
        Some(RunError::Resource(ResourceError::ExhaustedRetries { attempts: 3, .. }))
    ));

    let backoffs: Vec<_> = observer.load_attempts().into_iter().map(|a| a.backoff).collect();
    assert_eq!(backoffs, vec![Some(Duration::from_secs(5)), Some(Duration::from_secs(10)), None]);
    assert_eq!(observer.phases(), vec![RunPhase::Loading, RunPhase::Failed]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_backoff_cancels_without_another_attempt() {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::with_losses(&[1.0]).failing_loads(u32::MAX));
    let observer = Arc::new(CollectingObserver::default());
    let supervisor = RunSupervisor::new(Arc::clone(&backend)).with_observer(observer.clone());
    let started = tokio::time::Instant::now();

    supervisor.start_from_config(config_with_backoff(&temp, 30)).unwrap();
    eventually(|| observer.load_attempts().len() == 1).await;
    supervisor.stop().unwrap();
    let summary = supervisor.wait().await.unwrap();

    assert_eq!(summary.phase, RunPhase::Cancelled);
    assert!(summary.error.is_none());
    assert_eq!(backend.load_calls(), 1);
    assert_eq!(observer.load_attempts()[0].backoff, Some(Duration::from_secs(30)));
    assert_eq!(observer.phases(), vec![RunPhase::Loading, RunPhase::Stopping, RunPhase::Cancelled]);
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_offline_missing_local_model_fails_without_delay() {
    let temp = TempDir::new().unwrap();
    let mut raw = raw_config(&temp, 1);
    raw.offline = true;
    raw.local_model_dir = temp.path().join("models").display().to_string();
    raw.retry_backoff_secs = "5".to_string();
    let config = RunConfig::from_raw(&raw).unwrap();
    let started = tokio::time::Instant::now();

    let (backend, observer, summary) = run(ScriptedBackend::with_losses(&[1.0]), config).await;

    assert_eq!(summary.phase, RunPhase::Failed);
    assert_eq!(backend.load_calls(), 0);
    match summary.error {
        Some(RunError::Resource(ResourceError::LocalModelMissing { path })) => {
            assert_eq!(path, temp.path().join("models").join("tiny-model"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let attempts = observer.load_attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Failure);
    assert_eq!(attempts[0].backoff, None);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_offline_existing_local_model_is_passed_to_backend() {
    let temp = TempDir::new().unwrap();
    let models = temp.path().join("models");
    std::fs::create_dir_all(models.join("tiny-model")).unwrap();
    let mut raw = raw_config(&temp, 1);
    raw.offline = true;
    raw.local_model_dir = models.display().to_string();

    let (backend, _observer, summary) =
        run(ScriptedBackend::with_losses(&[1.0]), RunConfig::from_raw(&raw).unwrap()).await;

    assert_eq!(summary.phase, RunPhase::Completed);
    let requests = backend.requests.lock().unwrap();
    assert_eq!(requests[0].local_path, Some(models.join("tiny-model")));
}
