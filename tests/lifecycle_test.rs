mod common;

use axum::{Router, routing::get};
use common::{entries_in, spawn_server};
use file_resolver::services::lifecycle::INTERNALS_FILE;
use file_resolver::{
    ExecutionEnvironment, FileReference, LifecycleCoordinator, Output, ResolveError,
    ResolverConfig, coordinator,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Server counting how often each file is fetched.
async fn counting_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new()
        .route(
            "/input.csv",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    "a,b\n1,2\n"
                }
            }),
        )
        .route("/other.csv", get(|| async { "c,d\n" }));
    (spawn_server(app).await, hits)
}

fn config(temp: &Path) -> ResolverConfig {
    ResolverConfig {
        temp_dir: Some(temp.to_path_buf()),
        ..ResolverConfig::development()
    }
}

fn persisting(temp: &Path, workflow: &Path) -> LifecycleCoordinator {
    let config = ResolverConfig {
        persist_locally: true,
        ..config(temp)
    };
    coordinator(config, ExecutionEnvironment::local(workflow))
}

fn local_path(coordinator: &LifecycleCoordinator, id: &str) -> std::path::PathBuf {
    coordinator
        .resolved_location(id)
        .and_then(|l| l.local_path.clone())
        .unwrap()
}

#[tokio::test]
async fn test_unchanged_reference_is_fetched_once() {
    let (addr, hits) = counting_server().await;
    let temp = tempfile::tempdir().unwrap();
    let mut coordinator = coordinator(config(temp.path()), ExecutionEnvironment::detached());

    let references = vec![FileReference::with_id("in", format!("http://{}/input.csv", addr))];
    let first = coordinator.execute(&references).await;
    let second = coordinator.execute(&references).await;

    assert!(first.is_complete());
    assert!(!first.outcomes[0].reused);
    assert!(second.outcomes[0].reused);
    assert_eq!(second.epoch, first.epoch + 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(
        first.outcomes[0].result.as_ref().unwrap(),
        second.outcomes[0].result.as_ref().unwrap()
    );
    assert_eq!(first.outcomes[0].updated_reference().file_size, Some(8));
}

#[tokio::test]
async fn test_reference_from_outputs_is_not_fetched_again() {
    let (addr, hits) = counting_server().await;
    let temp = tempfile::tempdir().unwrap();
    let mut coordinator = coordinator(config(temp.path()), ExecutionEnvironment::detached());

    let references = vec![FileReference::with_id("in", format!("http://{}/input.csv", addr))];
    let first = coordinator.execute(&references).await;
    let handed_back: Vec<FileReference> = first
        .outputs(false)
        .unwrap()
        .into_iter()
        .map(|output| match output {
            Output::Active { reference, .. } => reference,
            Output::Inactive { reference, .. } => reference,
        })
        .collect();
    assert_eq!(handed_back[0].file_size, Some(8));

    let second = coordinator.execute(&handed_back).await;
    assert!(second.outcomes[0].reused);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_changed_reference_supersedes_previous_copy() {
    let (addr, hits) = counting_server().await;
    let temp = tempfile::tempdir().unwrap();
    let mut coordinator = coordinator(config(temp.path()), ExecutionEnvironment::detached());

    let first = vec![FileReference::with_id("in", format!("http://{}/input.csv", addr))];
    coordinator.execute(&first).await;
    let old_path = local_path(&coordinator, "in");

    let changed = vec![FileReference::with_id("in", format!("http://{}/other.csv", addr))];
    let report = coordinator.execute(&changed).await;
    assert!(report.is_complete());
    let new_path = local_path(&coordinator, "in");

    assert_ne!(old_path, new_path);
    assert!(!old_path.exists());
    assert_eq!(std::fs::read_to_string(&new_path).unwrap(), "c,d\n");
    assert_eq!(coordinator.temp_files().handles().len(), 1);

    // Back to the first source: fetched again.
    coordinator.execute(&first).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_deleted_copy_is_fetched_again() {
    let (addr, hits) = counting_server().await;
    let temp = tempfile::tempdir().unwrap();
    let mut coordinator = coordinator(config(temp.path()), ExecutionEnvironment::detached());

    let references = vec![FileReference::with_id("in", format!("http://{}/input.csv", addr))];
    coordinator.execute(&references).await;
    std::fs::remove_file(local_path(&coordinator, "in")).unwrap();

    let report = coordinator.execute(&references).await;
    assert!(!report.outcomes[0].reused);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(local_path(&coordinator, "in").exists());
}

#[tokio::test]
async fn test_partial_failure_continues() {
    let (addr, _) = counting_server().await;
    let temp = tempfile::tempdir().unwrap();
    let mut coordinator = coordinator(config(temp.path()), ExecutionEnvironment::detached());

    let references = vec![
        FileReference::with_id("a", format!("http://{}/input.csv", addr)),
        FileReference::with_id("b", format!("http://{}/missing.csv", addr)),
        FileReference::with_id("c", "data:text/plain;base64,SGVsbG8="),
        FileReference::with_id("d", "   "),
    ];
    let report = coordinator.execute(&references).await;

    assert_eq!(report.outcomes.len(), 4);
    assert!(report.outcomes[0].result.is_ok());
    assert!(matches!(
        report.outcomes[1].result,
        Err(ResolveError::FetchFailed { .. })
    ));
    assert!(report.outcomes[2].result.is_ok());
    assert!(matches!(
        report.outcomes[3].result,
        Err(ResolveError::MalformedReference(_))
    ));
    assert_eq!(report.failures().count(), 2);

    let outputs = report.outputs(true).unwrap();
    assert!(matches!(outputs[0], Output::Active { .. }));
    assert!(matches!(outputs[1], Output::Inactive { .. }));
    assert!(matches!(outputs[3], Output::Inactive { .. }));
    assert!(matches!(
        report.outputs(false),
        Err(ResolveError::FetchFailed { .. })
    ));

    let summary = report.summary();
    assert_eq!(summary[1].error_code, Some("FETCH_FAILED"));
    assert_eq!(summary[2].status, "resolved");
}

#[tokio::test]
async fn test_configure_fetches_and_writes_nothing() {
    let (addr, hits) = counting_server().await;
    let temp = tempfile::tempdir().unwrap();
    let mut coordinator = coordinator(config(temp.path()), ExecutionEnvironment::detached());

    let references = vec![
        FileReference::with_id("a", format!("http://{}/input.csv", addr)),
        FileReference::with_id("b", "data:,hello"),
        FileReference::with_id("c", "workflow://data.csv"),
    ];
    let report = coordinator.configure(&references).await;

    assert!(report.outcomes[0].result.is_ok());
    assert!(report.outcomes[1].result.is_ok());
    assert!(matches!(
        report.outcomes[2].result,
        Err(ResolveError::EnvironmentUnavailable(_))
    ));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(entries_in(temp.path()), 0);
    assert!(coordinator.resolved_location("a").is_none());
}

#[tokio::test]
async fn test_reset_keeps_persisted_copies() {
    let (addr, hits) = counting_server().await;
    let temp = tempfile::tempdir().unwrap();
    let workflow = tempfile::tempdir().unwrap();
    let mut coordinator = persisting(temp.path(), workflow.path());

    let references = vec![
        FileReference::with_id("remote", format!("http://{}/input.csv", addr)),
        FileReference::with_id("inline", "data:text/plain,hello"),
    ];
    assert!(coordinator.execute(&references).await.is_complete());
    let persisted = local_path(&coordinator, "remote");
    let anonymous = local_path(&coordinator, "inline");
    assert!(persisted.starts_with(workflow.path()));
    assert!(anonymous.starts_with(temp.path()));

    assert_eq!(coordinator.reset().await, 1);
    assert!(persisted.exists());
    assert!(!anonymous.exists());
    assert!(coordinator.resolved_location("inline").is_none());

    let report = coordinator.execute(&references).await;
    assert!(report.outcomes[0].reused);
    assert!(!report.outcomes[1].reused);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reset_can_release_persisted_copies() {
    let (addr, _) = counting_server().await;
    let temp = tempfile::tempdir().unwrap();
    let workflow = tempfile::tempdir().unwrap();
    let config = ResolverConfig {
        persist_locally: true,
        release_persisted_on_reset: true,
        ..config(temp.path())
    };
    let mut coordinator = coordinator(config, ExecutionEnvironment::local(workflow.path()));

    let references = vec![FileReference::with_id("remote", format!("http://{}/input.csv", addr))];
    coordinator.execute(&references).await;
    let persisted = local_path(&coordinator, "remote");

    assert_eq!(coordinator.dispose().await, 1);
    assert!(!persisted.exists());
    assert!(coordinator.temp_files().handles().is_empty());
}

#[tokio::test]
async fn test_dropped_reference_releases_its_copy() {
    let temp = tempfile::tempdir().unwrap();
    let mut coordinator = coordinator(config(temp.path()), ExecutionEnvironment::detached());

    let both = vec![
        FileReference::with_id("a", "data:,first"),
        FileReference::with_id("b", "data:,second"),
    ];
    coordinator.execute(&both).await;
    let dropped = local_path(&coordinator, "b");

    coordinator.execute(&both[..1]).await;
    assert!(!dropped.exists());
    assert!(coordinator.resolved_location("b").is_none());
    assert_eq!(entries_in(temp.path()), 1);
}

#[tokio::test]
async fn test_dropping_coordinator_removes_anonymous_files() {
    let temp = tempfile::tempdir().unwrap();
    {
        let mut coordinator = coordinator(config(temp.path()), ExecutionEnvironment::detached());
        coordinator
            .execute(&[FileReference::with_id("a", "data:,hello")])
            .await;
        assert_eq!(entries_in(temp.path()), 1);
    }
    assert_eq!(entries_in(temp.path()), 0);
}

#[tokio::test]
async fn test_detached_files_survive() {
    let temp = tempfile::tempdir().unwrap();
    let mut coordinator = coordinator(config(temp.path()), ExecutionEnvironment::detached());
    coordinator
        .execute(&[FileReference::with_id("a", "data:,hello")])
        .await;

    let kept = coordinator.detach();
    assert_eq!(kept.len(), 1);
    assert_eq!(coordinator.dispose().await, 0);
    drop(coordinator);
    assert!(kept[0].path.exists());
}

#[tokio::test]
async fn test_save_and_load_internals() {
    let (addr, hits) = counting_server().await;
    let temp = tempfile::tempdir().unwrap();
    let workflow = tempfile::tempdir().unwrap();
    let internals = tempfile::tempdir().unwrap();

    let references = vec![
        FileReference::with_id("remote", format!("http://{}/input.csv", addr)),
        FileReference::with_id("inline", "data:,hello"),
    ];
    let persisted = {
        let mut coordinator = persisting(temp.path(), workflow.path());
        coordinator.execute(&references).await;
        assert_eq!(coordinator.save_internals(internals.path()).await.unwrap(), 1);
        local_path(&coordinator, "remote")
    };
    assert!(internals.path().join(INTERNALS_FILE).exists());
    assert!(persisted.exists());

    let mut restored = persisting(temp.path(), workflow.path());
    assert_eq!(restored.load_internals(internals.path()).await.unwrap(), 1);
    assert_eq!(local_path(&restored, "remote"), persisted);

    let report = restored.execute(&references).await;
    assert!(report.outcomes[0].reused);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_load_internals_skips_missing_files() {
    let (addr, hits) = counting_server().await;
    let temp = tempfile::tempdir().unwrap();
    let workflow = tempfile::tempdir().unwrap();
    let internals = tempfile::tempdir().unwrap();

    let references = vec![FileReference::with_id("remote", format!("http://{}/input.csv", addr))];
    {
        let mut coordinator = persisting(temp.path(), workflow.path());
        coordinator.execute(&references).await;
        coordinator.save_internals(internals.path()).await.unwrap();
        std::fs::remove_file(local_path(&coordinator, "remote")).unwrap();
    }

    let mut restored = persisting(temp.path(), workflow.path());
    assert_eq!(restored.load_internals(internals.path()).await.unwrap(), 0);
    assert!(restored.resolved_location("remote").is_none());

    let report = restored.execute(&references).await;
    assert!(report.is_complete());
    assert!(!report.outcomes[0].reused);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_load_internals_without_saved_state() {
    let temp = tempfile::tempdir().unwrap();
    let nothing = tempfile::tempdir().unwrap();
    let mut coordinator = coordinator(config(temp.path()), ExecutionEnvironment::detached());
    assert_eq!(coordinator.load_internals(nothing.path()).await.unwrap(), 0);

    std::fs::write(nothing.path().join(INTERNALS_FILE), "not json").unwrap();
    assert!(matches!(
        coordinator.load_internals(nothing.path()).await,
        Err(ResolveError::MaterializationFailed(_))
    ));
}
