//! Mirror runs against a mocked git transport

mod common;

use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use common::{run_config, ApiRepo, MockTransport};
use farmore::config::TargetType;
use farmore::layout::destination_for;
use farmore::{GitOutcome, IncrementalStateStore, MirrorAction, MirrorOrchestrator, RunConfig};

fn config(root: &Path) -> RunConfig {
    let mut config = run_config("http://127.0.0.1:9", TargetType::Org, "acme", root);
    config.max_workers = 3;
    config
}

/// A transport whose clones leave a working copy behind
fn cloning_transport() -> MockTransport {
    let mut mock = MockTransport::new();
    mock.expect_clone_repository().returning(|_, dest, _| {
        std::fs::create_dir_all(dest.join(".git")).expect("create working copy");
        GitOutcome::ok("Cloned successfully")
    });
    mock.expect_is_repository()
        .returning(|path| path.join(".git").is_dir());
    mock.expect_remote_url().returning(|path| {
        let name = path.file_name()?.to_string_lossy().to_string();
        Some(format!("git@github.com:acme/{}.git", name))
    });
    mock.expect_fetch_and_pull()
        .returning(|_, _| GitOutcome::ok("Already up to date"));
    mock
}

#[tokio::test]
async fn test_one_failure_does_not_affect_the_others() {
    let temp_dir = TempDir::new().unwrap();
    let repos: Vec<_> = ["a", "b", "broken", "d", "e"]
        .iter()
        .map(|name| ApiRepo::new("acme", name).in_org().repository())
        .collect();

    let mut mock = MockTransport::new();
    mock.expect_clone_repository().returning(|url, _, _| {
        if url.contains("/broken.git") {
            GitOutcome::failed("Clone failed: fatal: early EOF")
        } else {
            GitOutcome::ok("Cloned successfully")
        }
    });

    let summary = MirrorOrchestrator::new(Arc::new(config(temp_dir.path())), Arc::new(mock))
        .run(repos)
        .await;

    assert_eq!(summary.total, 5);
    assert_eq!(summary.cloned, 4);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errors, vec!["acme/broken: Clone failed: fatal: early EOF".to_string()]);
    assert_eq!(summary.exit_code(), 0);
}

#[tokio::test]
async fn test_rerun_updates_and_incremental_skips() {
    let temp_dir = TempDir::new().unwrap();
    let repos: Vec<_> = ["anvil", "rocket"]
        .iter()
        .map(|name| ApiRepo::new("acme", name).in_org().repository())
        .collect();

    let mut config = config(temp_dir.path());
    config.incremental = true;
    let config = Arc::new(config);

    let first = MirrorOrchestrator::new(Arc::clone(&config), Arc::new(cloning_transport()))
        .run(repos.clone())
        .await;
    assert_eq!(first.cloned, 2);
    for repo in &repos {
        assert!(destination_for(repo, &config).join(".git").is_dir());
    }

    let mut store = IncrementalStateStore::new(temp_dir.path());
    assert!(store.load().is_some());
    assert!(!store.should_update("acme/anvil", Some("2024-01-01T00:00:00Z")));

    // Same timestamps: nothing to do
    let second = MirrorOrchestrator::new(Arc::clone(&config), Arc::new(cloning_transport()))
        .run(repos.clone())
        .await;
    assert_eq!(second.skipped, 2);
    assert!(second
        .results
        .iter()
        .all(|r| r.message == "Unchanged since last backup"));

    // Without incremental mode every repository is refreshed
    let mut full = (*config).clone();
    full.incremental = false;
    let third = MirrorOrchestrator::new(Arc::new(full), Arc::new(cloning_transport()))
        .run(repos)
        .await;
    assert_eq!(third.updated, 2);
    assert!(third.results.iter().all(|r| r.action == MirrorAction::Updated));
}

#[tokio::test]
async fn test_foreign_remote_is_left_alone() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(temp_dir.path());
    let repo = ApiRepo::new("acme", "anvil").in_org().repository();
    std::fs::create_dir_all(destination_for(&repo, &config).join(".git")).unwrap();

    let mut mock = MockTransport::new();
    mock.expect_is_repository().returning(|_| true);
    mock.expect_remote_url()
        .returning(|_| Some("git@github.com:coyote/anvil.git".to_string()));
    mock.expect_fetch_and_pull().never();
    mock.expect_clone_repository().never();

    let summary = MirrorOrchestrator::new(Arc::new(config), Arc::new(mock))
        .run(vec![repo])
        .await;

    assert_eq!(summary.skipped, 1);
    assert!(summary.results[0].message.contains("mismatch"));
    assert!(summary.results[0].success);
}

#[tokio::test]
async fn test_https_fallback_happens_exactly_once() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = config(temp_dir.path());
    config.token = Some("ghp_test".to_string());

    let mut mock = MockTransport::new();
    mock.expect_clone_repository()
        .withf(|url, _, _| url.starts_with("git@"))
        .times(1)
        .returning(|_, _, _| {
            GitOutcome::failed("SSH authentication failed: git@github.com: Permission denied (publickey).")
        });
    mock.expect_clone_repository()
        .withf(|url, _, _| url.starts_with("https://"))
        .times(1)
        .returning(|_, _, _| GitOutcome::failed("Clone failed: repository not found"));

    let repo = ApiRepo::new("acme", "anvil").in_org().repository();
    let summary = MirrorOrchestrator::new(Arc::new(config), Arc::new(mock))
        .run(vec![repo])
        .await;

    assert_eq!(summary.failed, 1);
    assert!(summary.all_failed());
    assert_eq!(summary.exit_code(), 1);
}

#[tokio::test]
async fn test_categorized_destinations() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(temp_dir.path());

    let org_repo = ApiRepo::new("acme", "anvil").in_org().repository();
    let fork = ApiRepo::new("octocat", "fork").as_fork().repository();
    let private = ApiRepo::new("octocat", "diary").as_private().repository();

    assert_eq!(
        destination_for(&org_repo, &config),
        temp_dir.path().join("repos/organizations/acme/anvil")
    );
    assert_eq!(
        destination_for(&fork, &config),
        temp_dir.path().join("repos/forks/octocat/fork")
    );
    assert_eq!(
        destination_for(&private, &config),
        temp_dir.path().join("repos/private/octocat/diary")
    );
}
