//! Mirror orchestration
//!
//! Mirrors a list of discovered repositories to disk with a bounded worker
//! pool. Each repository ends in exactly one [`MirrorResult`]; one failing or
//! panicking repository never affects the others. Results are folded into a
//! [`MirrorSummary`] by a single consumer as they complete.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::discovery::Repository;
use crate::git::{is_ssh_auth_failure, remote_matches, GitOutcome, GitTransport};
use crate::layout::destination_for;
use crate::progress::ProgressReporter;
use crate::state::IncrementalStateStore;

/// Terminal state of one repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorAction {
    Cloned,
    Updated,
    Skipped,
    Failed,
}

impl MirrorAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorAction::Cloned => "cloned",
            MirrorAction::Updated => "updated",
            MirrorAction::Skipped => "skipped",
            MirrorAction::Failed => "failed",
        }
    }

    /// Column label used in progress output
    pub fn label(&self) -> &'static str {
        match self {
            MirrorAction::Cloned => "CLONE",
            MirrorAction::Updated => "UPDATE",
            MirrorAction::Skipped => "SKIP",
            MirrorAction::Failed => "FAIL",
        }
    }
}

impl fmt::Display for MirrorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of mirroring a single repository
#[derive(Debug, Clone)]
pub struct MirrorResult {
    pub repository: Repository,
    pub success: bool,
    pub action: MirrorAction,
    pub message: String,
    pub error: Option<String>,
}

impl MirrorResult {
    pub fn cloned(repository: Repository, message: impl Into<String>) -> Self {
        Self {
            repository,
            success: true,
            action: MirrorAction::Cloned,
            message: message.into(),
            error: None,
        }
    }

    pub fn updated(repository: Repository, message: impl Into<String>) -> Self {
        Self {
            repository,
            success: true,
            action: MirrorAction::Updated,
            message: message.into(),
            error: None,
        }
    }

    pub fn skipped(repository: Repository, message: impl Into<String>) -> Self {
        Self {
            repository,
            success: true,
            action: MirrorAction::Skipped,
            message: message.into(),
            error: None,
        }
    }

    pub fn failed(repository: Repository, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            repository,
            success: false,
            action: MirrorAction::Failed,
            message: error.clone(),
            error: Some(error),
        }
    }
}

/// Totals for a mirror run
#[derive(Debug, Clone, Default)]
pub struct MirrorSummary {
    pub total: usize,
    pub cloned: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    /// `"owner/name: error"` for every failed repository
    pub errors: Vec<String>,
    pub results: Vec<MirrorResult>,
    pub duration: Duration,
}

impl MirrorSummary {
    pub fn add(&mut self, result: MirrorResult) {
        self.total += 1;
        match result.action {
            MirrorAction::Cloned => self.cloned += 1,
            MirrorAction::Updated => self.updated += 1,
            MirrorAction::Skipped => self.skipped += 1,
            MirrorAction::Failed => {
                self.failed += 1;
                let error = result.error.as_deref().unwrap_or(&result.message);
                self.errors
                    .push(format!("{}: {}", result.repository.full_name, error));
            }
        }
        self.results.push(result);
    }

    /// Repositories that ended cloned, updated or skipped
    pub fn success_count(&self) -> usize {
        self.cloned + self.updated + self.skipped
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    /// Every repository in the batch failed
    pub fn all_failed(&self) -> bool {
        self.has_failures() && self.success_count() == 0
    }

    /// Process exit code for this run
    pub fn exit_code(&self) -> i32 {
        if self.all_failed() {
            1
        } else {
            0
        }
    }
}

impl fmt::Display for MirrorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total repositories: {}", self.total)?;
        writeln!(f, "  Cloned:  {}", self.cloned)?;
        writeln!(f, "  Updated: {}", self.updated)?;
        writeln!(f, "  Skipped: {}", self.skipped)?;
        write!(f, "  Failed:  {}", self.failed)?;
        if !self.errors.is_empty() {
            write!(f, "\nErrors:")?;
            for error in &self.errors {
                write!(f, "\n  - {}", error)?;
            }
        }
        Ok(())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Per-repository state machine, cloned into every spawned task
#[derive(Clone)]
struct Worker {
    config: Arc<RunConfig>,
    transport: Arc<dyn GitTransport>,
    state: Option<Arc<IncrementalStateStore>>,
}

impl Worker {
    async fn mirror(self, repo: Repository) -> MirrorResult {
        let dest = destination_for(&repo, &self.config);

        if tokio::fs::metadata(&dest).await.is_err() {
            debug!("Cloning {} into {}", repo.full_name, dest.display());
            let outcome = self.clone_with_fallback(&repo, &dest).await;
            return if outcome.success {
                MirrorResult::cloned(repo, outcome.message)
            } else {
                MirrorResult::failed(repo, outcome.message)
            };
        }

        if !self.transport.is_repository(&dest).await {
            return MirrorResult::failed(
                repo,
                format!("Path exists but is not a git repository: {}", dest.display()),
            );
        }

        if let Some(actual) = self.transport.remote_url(&dest).await {
            if !remote_matches(&actual, &repo.ssh_url, &repo.clone_url) {
                let message = format!(
                    "Remote URL mismatch (expected {} or {}, got {})",
                    repo.ssh_url, repo.clone_url, actual
                );
                return MirrorResult::skipped(repo, message);
            }
        }

        if let Some(state) = &self.state {
            if !state.should_update(&repo.full_name, repo.updated_at.as_deref()) {
                return MirrorResult::skipped(repo, "Unchanged since last backup");
            }
        }

        let outcome = if self.config.bare {
            self.transport.mirror_update(&dest).await
        } else {
            self.transport
                .fetch_and_pull(&dest, &repo.default_branch)
                .await
        };

        if outcome.success && self.uses_lfs() {
            let lfs = self.transport.fetch_lfs(&dest).await;
            if !lfs.success {
                warn!("{}: {}", repo.full_name, lfs.message);
            }
        }

        if outcome.success {
            MirrorResult::updated(repo, outcome.message)
        } else {
            MirrorResult::failed(repo, outcome.message)
        }
    }

    /// LFS applies to working copies only; bare mirrors ignore it
    fn uses_lfs(&self) -> bool {
        self.config.lfs && !self.config.bare
    }

    async fn clone_from(&self, url: &str, dest: &Path) -> GitOutcome {
        if self.uses_lfs() {
            self.transport.lfs_clone(url, dest).await
        } else {
            self.transport
                .clone_repository(url, dest, self.config.bare)
                .await
        }
    }

    /// SSH first when configured; one HTTPS retry on SSH auth failure if a token is set
    async fn clone_with_fallback(&self, repo: &Repository, dest: &Path) -> GitOutcome {
        let outcome = self.clone_from(repo.url(self.config.use_ssh), dest).await;
        if !self.config.use_ssh
            || outcome.success
            || !is_ssh_auth_failure(&outcome.message)
            || !self.config.has_token()
        {
            return outcome;
        }

        warn!(
            "SSH authentication failed for {}, retrying over HTTPS",
            repo.full_name
        );
        let https = self.clone_from(&repo.clone_url, dest).await;
        if https.success {
            GitOutcome::ok(format!("{} (via HTTPS)", https.message))
        } else {
            https
        }
    }
}

/// Mirrors repositories in parallel and aggregates the results
pub struct MirrorOrchestrator {
    config: Arc<RunConfig>,
    transport: Arc<dyn GitTransport>,
    cancel: CancellationToken,
    interactive_progress: bool,
}

impl MirrorOrchestrator {
    pub fn new(config: Arc<RunConfig>, transport: Arc<dyn GitTransport>) -> Self {
        Self {
            config,
            transport,
            cancel: CancellationToken::new(),
            interactive_progress: false,
        }
    }

    /// Stop starting new repositories once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Draw a progress bar when attached to a terminal
    pub fn with_interactive_progress(mut self, enabled: bool) -> Self {
        self.interactive_progress = enabled;
        self
    }

    /// Mirror every repository and return the summary.
    ///
    /// If cancelled, repositories not yet started are left out of the summary
    /// while in-flight ones run to completion.
    pub async fn run(&self, repositories: Vec<Repository>) -> MirrorSummary {
        let start = Instant::now();

        if repositories.is_empty() {
            info!("No repositories found matching the specified filters");
            return MirrorSummary::default();
        }

        let mut summary = if self.config.dry_run {
            self.dry_run(repositories).await
        } else {
            self.mirror_all(repositories).await
        };
        summary.duration = start.elapsed();

        info!(
            "Mirror completed in {:.2}s: {} cloned, {} updated, {} skipped, {} failed",
            summary.duration.as_secs_f64(),
            summary.cloned,
            summary.updated,
            summary.skipped,
            summary.failed
        );
        summary
    }

    fn load_state(&self) -> Option<Arc<IncrementalStateStore>> {
        if !self.config.incremental {
            return None;
        }

        let mut store = IncrementalStateStore::new(&self.config.destination_root);
        match store.load() {
            Some(previous) => info!(
                "Incremental mode: last backup at {} ({} repositories)",
                previous.last_backup,
                previous.repos_backed_up.len()
            ),
            None => info!("Incremental mode: no previous state, running a full backup"),
        }
        Some(Arc::new(store))
    }

    async fn mirror_all(&self, repositories: Vec<Repository>) -> MirrorSummary {
        let total = repositories.len();
        let state = self.load_state();
        let worker = Worker {
            config: Arc::clone(&self.config),
            transport: Arc::clone(&self.transport),
            state: state.clone(),
        };

        let progress = if self.interactive_progress {
            ProgressReporter::new(total as u64)
        } else {
            ProgressReporter::logging(total as u64)
        };

        info!(
            "Mirroring {} repositories with {} workers",
            total, self.config.max_workers
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
        let mut futures = FuturesUnordered::new();

        for repo in repositories {
            let semaphore = Arc::clone(&semaphore);
            let worker = worker.clone();
            let cancel = self.cancel.clone();

            futures.push(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    permit = semaphore.acquire_owned() => permit.ok()?,
                };

                let handle = tokio::spawn(worker.mirror(repo.clone()));
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => {
                        let message = panic_message(e.into_panic());
                        error!("Mirroring {} panicked: {}", repo.full_name, message);
                        MirrorResult::failed(repo, format!("Internal error: {}", message))
                    }
                    Err(e) => MirrorResult::failed(repo, format!("Mirror task aborted: {}", e)),
                };
                Some(result)
            });
        }

        let mut summary = MirrorSummary::default();
        while let Some(outcome) = futures.next().await {
            let Some(result) = outcome else {
                continue;
            };
            progress.advance(&result);
            summary.add(result);
        }
        progress.finish();

        if self.cancel.is_cancelled() && summary.total < total {
            warn!(
                "Run cancelled: {} of {} repositories were not started",
                total - summary.total,
                total
            );
        }

        if let Some(store) = state {
            self.record_state(&store, &summary);
        }

        summary
    }

    fn record_state(&self, store: &IncrementalStateStore, summary: &MirrorSummary) {
        let mut state = store.new_state(self.config.target_type, &self.config.target_name);
        for result in &summary.results {
            if matches!(result.action, MirrorAction::Cloned | MirrorAction::Updated) {
                state.record_repository(
                    &result.repository.full_name,
                    result.repository.updated_at.as_deref(),
                );
            }
        }
        if let Err(e) = store.finalize(&mut state) {
            warn!("Failed to save incremental state: {:#}", e);
        }
    }

    async fn dry_run(&self, repositories: Vec<Repository>) -> MirrorSummary {
        info!("DRY RUN MODE - no changes will be made");
        let mut summary = MirrorSummary::default();

        for repo in repositories {
            if self.cancel.is_cancelled() {
                warn!("Dry run cancelled");
                break;
            }

            let dest = destination_for(&repo, &self.config);
            let exists = tokio::fs::metadata(&dest).await.is_ok()
                && self.transport.is_repository(&dest).await;
            if exists {
                info!("{:8} {}", "UPDATE", repo.full_name);
            } else {
                info!("{:8} {} -> {}", "CLONE", repo.full_name, dest.display());
            }

            summary.add(MirrorResult::skipped(repo, "dry run"));
        }

        summary
    }
}
