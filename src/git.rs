//! Git subprocess plumbing
//!
//! Every git invocation runs in its own process group with a timeout, so a
//! hung clone over SSH can be killed together with its helpers.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tokio::sync::OnceCell;
use tracing::debug;

/// Outcome of a git operation: success flag plus a human-readable message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutcome {
    pub success: bool,
    pub message: String,
}

impl GitOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Git operations the mirror orchestrator relies on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitTransport: Send + Sync {
    /// Whether `path` holds a working copy or a bare repository
    async fn is_repository(&self, path: &Path) -> bool;

    /// URL of the `origin` remote
    async fn remote_url(&self, path: &Path) -> Option<String>;

    /// Clone `url` into `dest`; `bare` makes a mirror clone
    async fn clone_repository(&self, url: &str, dest: &Path, bare: bool) -> GitOutcome;

    /// Fetch all remotes, then pull `branch`
    async fn fetch_and_pull(&self, path: &Path, branch: &str) -> GitOutcome;

    /// Refresh a bare mirror
    async fn mirror_update(&self, path: &Path) -> GitOutcome;

    /// Clone `url` into `dest` with `git lfs clone`
    async fn lfs_clone(&self, url: &str, dest: &Path) -> GitOutcome;

    /// Fetch LFS objects for all refs of a working copy
    async fn fetch_lfs(&self, path: &Path) -> GitOutcome;
}

/// Message for clones that need LFS on a machine without it
pub const LFS_MISSING: &str = "Git LFS not installed. Install with: git lfs install";

/// Whether a failure message means SSH could not authenticate
pub fn is_ssh_auth_failure(message: &str) -> bool {
    message.contains("SSH authentication failed")
        || message.contains("Permission denied")
        || message.contains("publickey")
}

/// Whether an `origin` URL points at the expected repository.
///
/// Either the SSH or the HTTPS URL is accepted; trailing slashes are ignored.
pub fn remote_matches(actual: &str, ssh_url: &str, clone_url: &str) -> bool {
    let actual = actual.trim().trim_end_matches('/');
    actual == ssh_url.trim_end_matches('/') || actual == clone_url.trim_end_matches('/')
}

enum CommandOutput {
    Finished {
        success: bool,
        stdout: String,
        stderr: String,
    },
    TimedOut,
    SpawnFailed(String),
}

/// [`GitTransport`] backed by the `git` executable
#[derive(Debug)]
pub struct GitCli {
    clone_timeout: Duration,
    update_timeout: Duration,
    lfs_timeout: Duration,
    lfs_available: OnceCell<bool>,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), Duration::from_secs(120))
    }
}

impl GitCli {
    pub fn new(clone_timeout: Duration, update_timeout: Duration) -> Self {
        Self {
            clone_timeout,
            update_timeout,
            lfs_timeout: Duration::from_secs(600),
            lfs_available: OnceCell::new(),
        }
    }

    pub fn with_lfs_timeout(mut self, lfs_timeout: Duration) -> Self {
        self.lfs_timeout = lfs_timeout;
        self
    }

    /// Whether `git lfs` works here; probed once per process
    pub async fn is_lfs_available(&self) -> bool {
        *self
            .lfs_available
            .get_or_init(|| async {
                let available = matches!(
                    self.run(&["lfs", "version"], None, Duration::from_secs(10))
                        .await,
                    CommandOutput::Finished { success: true, .. }
                );
                if !available {
                    debug!("git lfs is not available");
                }
                available
            })
            .await
    }

    async fn create_parent(dest: &Path) -> Result<(), GitOutcome> {
        if let Some(parent) = dest.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Err(GitOutcome::failed(format!(
                    "Failed to create parent directory {}: {}",
                    parent.display(),
                    e
                )));
            }
        }
        Ok(())
    }

    async fn run(&self, args: &[&str], cwd: Option<&Path>, timeout: Duration) -> CommandOutput {
        debug!("git {}", args.join(" "));

        let mut command = AsyncCommand::new("git");
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        // Own process group so a timeout also takes down ssh and helpers
        #[cfg(unix)]
        command.process_group(0);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return CommandOutput::SpawnFailed(format!("failed to run git: {}", e)),
        };
        let pid = child.id();

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => CommandOutput::Finished {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            },
            Ok(Err(e)) => CommandOutput::SpawnFailed(format!("failed to wait for git: {}", e)),
            Err(_) => {
                kill_process_group(pid);
                CommandOutput::TimedOut
            }
        }
    }

    async fn fetch(&self, path: &Path) -> GitOutcome {
        match self
            .run(&["fetch", "--all", "--prune"], Some(path), self.update_timeout)
            .await
        {
            CommandOutput::Finished { success: true, .. } => GitOutcome::ok("Fetched successfully"),
            CommandOutput::Finished { stderr, .. } => {
                GitOutcome::failed(format!("Fetch failed: {}", stderr))
            }
            CommandOutput::TimedOut => GitOutcome::failed("Fetch operation timed out"),
            CommandOutput::SpawnFailed(e) => GitOutcome::failed(e),
        }
    }

    async fn pull(&self, path: &Path, branch: &str) -> GitOutcome {
        // Empty repositories have no branch to check out; ignore the result
        let _ = self
            .run(&["checkout", branch], Some(path), self.update_timeout)
            .await;

        match self
            .run(&["pull", "origin", branch], Some(path), self.update_timeout)
            .await
        {
            CommandOutput::Finished {
                success: true,
                stdout,
                ..
            } => {
                if stdout.contains("Already up to date") || stdout.contains("Already up-to-date") {
                    GitOutcome::ok("Already up to date")
                } else {
                    GitOutcome::ok("Updated successfully")
                }
            }
            CommandOutput::Finished { stderr, .. } => {
                let lower = stderr.to_lowercase();
                if lower.contains("no tracking information") {
                    GitOutcome::ok("No tracking information (empty repository?)")
                } else if lower.contains("couldn't find remote ref") {
                    GitOutcome::ok("Branch not found (empty repository?)")
                } else {
                    GitOutcome::failed(format!("Pull failed: {}", stderr))
                }
            }
            CommandOutput::TimedOut => GitOutcome::failed("Pull operation timed out"),
            CommandOutput::SpawnFailed(e) => GitOutcome::failed(e),
        }
    }
}

fn clone_outcome(output: CommandOutput, done: &str) -> GitOutcome {
    match output {
        CommandOutput::Finished { success: true, .. } => GitOutcome::ok(done),
        CommandOutput::Finished { stderr, .. } => {
            if stderr.contains("Permission denied") || stderr.contains("publickey") {
                GitOutcome::failed(format!("SSH authentication failed: {}", stderr))
            } else {
                GitOutcome::failed(format!("Clone failed: {}", stderr))
            }
        }
        CommandOutput::TimedOut => GitOutcome::failed("Clone operation timed out"),
        CommandOutput::SpawnFailed(e) => GitOutcome::failed(e),
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!("Failed to kill git process group {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[async_trait]
impl GitTransport for GitCli {
    async fn is_repository(&self, path: &Path) -> bool {
        let git_dir = path.join(".git");
        let is_worktree = tokio::fs::metadata(&git_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if is_worktree {
            return true;
        }

        // bare layout
        tokio::fs::metadata(path.join("HEAD")).await.is_ok()
            && tokio::fs::metadata(path.join("objects")).await.is_ok()
    }

    async fn remote_url(&self, path: &Path) -> Option<String> {
        match self
            .run(
                &["remote", "get-url", "origin"],
                Some(path),
                Duration::from_secs(10),
            )
            .await
        {
            CommandOutput::Finished {
                success: true,
                stdout,
                ..
            } if !stdout.is_empty() => Some(stdout),
            _ => None,
        }
    }

    async fn clone_repository(&self, url: &str, dest: &Path, bare: bool) -> GitOutcome {
        if let Err(outcome) = Self::create_parent(dest).await {
            return outcome;
        }

        let dest_str = dest.to_string_lossy();
        let mut args = vec!["clone"];
        if bare {
            args.push("--mirror");
        }
        args.push(url);
        args.push(&dest_str);

        let output = self.run(&args, None, self.clone_timeout).await;
        if bare {
            clone_outcome(output, "Cloned successfully (mirror)")
        } else {
            clone_outcome(output, "Cloned successfully")
        }
    }

    async fn lfs_clone(&self, url: &str, dest: &Path) -> GitOutcome {
        if !self.is_lfs_available().await {
            return GitOutcome::failed(LFS_MISSING);
        }
        if let Err(outcome) = Self::create_parent(dest).await {
            return outcome;
        }

        let dest_str = dest.to_string_lossy();
        let output = self
            .run(&["lfs", "clone", url, &dest_str], None, self.lfs_timeout)
            .await;
        clone_outcome(output, "Cloned successfully (with LFS)")
    }

    async fn fetch_lfs(&self, path: &Path) -> GitOutcome {
        if !self.is_lfs_available().await {
            return GitOutcome::failed("Git LFS not installed");
        }

        match self
            .run(&["lfs", "fetch", "--all"], Some(path), self.lfs_timeout)
            .await
        {
            CommandOutput::Finished { success: true, .. } => {
                GitOutcome::ok("LFS objects fetched successfully")
            }
            CommandOutput::Finished { stderr, .. } => {
                GitOutcome::failed(format!("LFS fetch failed: {}", stderr))
            }
            CommandOutput::TimedOut => GitOutcome::failed("LFS fetch operation timed out"),
            CommandOutput::SpawnFailed(e) => GitOutcome::failed(e),
        }
    }

    async fn fetch_and_pull(&self, path: &Path, branch: &str) -> GitOutcome {
        let fetched = self.fetch(path).await;
        if !fetched.success {
            return fetched;
        }
        self.pull(path, branch).await
    }

    async fn mirror_update(&self, path: &Path) -> GitOutcome {
        match self
            .run(&["remote", "update", "--prune"], Some(path), self.clone_timeout)
            .await
        {
            CommandOutput::Finished { success: true, .. } => {
                GitOutcome::ok("Mirror updated successfully")
            }
            CommandOutput::Finished { stderr, .. } => {
                GitOutcome::failed(format!("Mirror update failed: {}", stderr))
            }
            CommandOutput::TimedOut => GitOutcome::failed("Mirror update operation timed out"),
            CommandOutput::SpawnFailed(e) => GitOutcome::failed(e),
        }
    }
}
