//! Incremental backup state
//!
//! Each backup root keeps a `.farmore_state.json` recording which
//! repositories were mirrored and the remote `updated_at` seen at the time.
//! A later run with incremental mode on skips repositories whose timestamp
//! has not advanced.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::TargetType;

/// File name of the state file inside a backup root
pub const STATE_FILE: &str = ".farmore_state.json";

/// Current state file format version
pub const STATE_VERSION: &str = "1";

/// Persisted record of the last backup of a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupState {
    pub version: String,
    /// ISO-8601 time the last run finished
    pub last_backup: String,
    pub target_type: String,
    pub target_name: String,
    /// full_name -> remote `updated_at` when last mirrored
    pub repos_updated: BTreeMap<String, String>,
    pub repos_backed_up: Vec<String>,
    pub total_repos: u64,
    /// Fields written by other tools or versions, kept as they are
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for BackupState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            last_backup: String::new(),
            target_type: String::new(),
            target_name: String::new(),
            repos_updated: BTreeMap::new(),
            repos_backed_up: Vec::new(),
            total_repos: 0,
            extra: Map::new(),
        }
    }
}

impl BackupState {
    /// Record a mirrored repository. Recording the same name twice is a no-op
    /// apart from refreshing its timestamp.
    pub fn record_repository(&mut self, full_name: &str, updated_at: Option<&str>) {
        if !self.repos_backed_up.iter().any(|n| n == full_name) {
            self.repos_backed_up.push(full_name.to_string());
            self.total_repos += 1;
        }
        if let Some(updated_at) = updated_at.filter(|t| !t.is_empty()) {
            self.repos_updated
                .insert(full_name.to_string(), updated_at.to_string());
        }
    }
}

/// Short description of a state file, for `farmore state`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSummary {
    pub last_backup: String,
    pub target: String,
    pub repos_count: usize,
    pub total_repos: u64,
}

impl fmt::Display for StateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Target:       {}", self.target)?;
        writeln!(f, "Last backup:  {}", self.last_backup)?;
        writeln!(f, "Repositories: {}", self.repos_count)?;
        write!(f, "Total repos:  {}", self.total_repos)
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Reads and writes the state file of one backup root
#[derive(Debug)]
pub struct IncrementalStateStore {
    state_file: PathBuf,
    previous: Option<BackupState>,
}

impl IncrementalStateStore {
    pub fn new(backup_dir: impl AsRef<Path>) -> Self {
        Self {
            state_file: backup_dir.as_ref().join(STATE_FILE),
            previous: None,
        }
    }

    /// Load the state left by the previous run.
    ///
    /// A missing file means no previous run. A corrupt file is reported and
    /// treated the same way.
    pub fn load(&mut self) -> Option<BackupState> {
        self.previous = self.read();
        self.previous.clone()
    }

    fn read(&self) -> Option<BackupState> {
        let content = match fs::read_to_string(&self.state_file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {:?}", self.state_file);
                return None;
            }
            Err(e) => {
                warn!("Cannot read state file {:?}, starting fresh: {}", self.state_file, e);
                return None;
            }
        };

        match serde_json::from_str::<BackupState>(&content) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Corrupted state file {:?}, starting fresh: {}", self.state_file, e);
                None
            }
        }
    }

    /// Whether a repository needs mirroring given its remote `updated_at`.
    ///
    /// True when there is no record, when the remote timestamp is newer, or
    /// when either timestamp cannot be parsed.
    pub fn should_update(&self, full_name: &str, remote_updated_at: Option<&str>) -> bool {
        let Some(recorded) = self
            .previous
            .as_ref()
            .and_then(|state| state.repos_updated.get(full_name))
        else {
            return true;
        };

        match (
            parse_timestamp(recorded),
            remote_updated_at.and_then(parse_timestamp),
        ) {
            (Some(recorded), Some(remote)) => remote > recorded,
            _ => true,
        }
    }

    /// Start the state for this run.
    ///
    /// Records from the previous run of the same target are carried over so
    /// that repositories skipped as unchanged keep their entries. Fields this
    /// crate does not manage are always carried over.
    pub fn new_state(&self, target_type: TargetType, target_name: &str) -> BackupState {
        let mut state = BackupState {
            last_backup: Utc::now().to_rfc3339(),
            target_type: target_type.as_str().to_string(),
            target_name: target_name.to_string(),
            ..BackupState::default()
        };

        if let Some(previous) = &self.previous {
            state.extra = previous.extra.clone();
            if previous.target_type == state.target_type && previous.target_name == target_name {
                state.repos_updated = previous.repos_updated.clone();
                state.repos_backed_up = previous.repos_backed_up.clone();
                state.total_repos = previous.total_repos;
            }
        }

        state
    }

    /// Stamp the finish time and persist
    pub fn finalize(&self, state: &mut BackupState) -> Result<()> {
        state.last_backup = Utc::now().to_rfc3339();
        self.save(state)?;
        info!(
            "Saved incremental state for {} repositories to {:?}",
            state.repos_backed_up.len(),
            self.state_file
        );
        Ok(())
    }

    /// Write the state atomically: a temp file in the same directory, then rename
    pub fn save(&self, state: &BackupState) -> Result<()> {
        let dir = self
            .state_file
            .parent()
            .context("State file has no parent directory")?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create backup directory: {:?}", dir))?;

        let content =
            serde_json::to_string_pretty(state).context("Failed to serialize backup state")?;

        let tmp = dir.join(format!("{}.tmp-{}", STATE_FILE, std::process::id()));
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write temporary state file: {:?}", tmp))?;
        if let Err(e) = fs::rename(&tmp, &self.state_file) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| {
                format!("Failed to move state file into place: {:?}", self.state_file)
            });
        }

        Ok(())
    }

    /// Summary of the state currently on disk
    pub fn summary(&self) -> Option<StateSummary> {
        let state = self.read()?;
        Some(StateSummary {
            last_backup: state.last_backup,
            target: format!("{}/{}", state.target_type, state.target_name),
            repos_count: state.repos_backed_up.len(),
            total_repos: state.total_repos,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with(state: &BackupState) -> (TempDir, IncrementalStateStore) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut store = IncrementalStateStore::new(temp_dir.path());
        store.save(state).expect("Failed to save state");
        store.load();
        (temp_dir, store)
    }

    #[test]
    fn test_missing_state_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut store = IncrementalStateStore::new(temp_dir.path());
        assert!(store.load().is_none());
        assert!(store.summary().is_none());
        assert!(store.should_update("owner/repo", Some("2024-01-01T00:00:00Z")));
    }

    #[test]
    fn test_corrupt_state_file_is_discarded() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(temp_dir.path().join(STATE_FILE), "{ not json").unwrap();

        let mut store = IncrementalStateStore::new(temp_dir.path());
        assert!(store.load().is_none());
    }

    #[test]
    fn test_should_update_compares_timestamps() {
        let mut state = BackupState::default();
        state.record_repository("owner/repo", Some("2024-01-01T00:00:00Z"));
        let (_dir, store) = store_with(&state);

        assert!(store.should_update("owner/repo", Some("2024-01-15T00:00:00Z")));
        assert!(!store.should_update("owner/repo", Some("2024-01-01T00:00:00Z")));
        assert!(!store.should_update("owner/repo", Some("2023-12-01T00:00:00Z")));
        assert!(store.should_update("owner/other", Some("2023-12-01T00:00:00Z")));
    }

    #[test]
    fn test_should_update_fails_open_on_bad_timestamps() {
        let mut state = BackupState::default();
        state.record_repository("owner/repo", Some("yesterday"));
        state.record_repository("owner/good", Some("2024-01-01T00:00:00Z"));
        let (_dir, store) = store_with(&state);

        assert!(store.should_update("owner/repo", Some("2024-01-01T00:00:00Z")));
        assert!(store.should_update("owner/good", Some("not a date")));
        assert!(store.should_update("owner/good", None));
    }

    #[test]
    fn test_record_repository_is_idempotent() {
        let mut state = BackupState::default();
        state.record_repository("owner/repo", Some("2024-01-01T00:00:00Z"));
        state.record_repository("owner/repo", Some("2024-02-01T00:00:00Z"));
        state.record_repository("owner/repo", None);

        assert_eq!(state.repos_backed_up, vec!["owner/repo".to_string()]);
        assert_eq!(state.total_repos, 1);
        assert_eq!(
            state.repos_updated.get("owner/repo").map(String::as_str),
            Some("2024-02-01T00:00:00Z")
        );
    }

    #[test]
    fn test_finalize_persists_and_summarizes() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut store = IncrementalStateStore::new(temp_dir.path().join("nested"));
        store.load();

        let mut state = store.new_state(TargetType::User, "octocat");
        state.record_repository("octocat/hello", Some("2024-01-01T00:00:00Z"));
        store.finalize(&mut state).expect("Failed to finalize");

        let summary = store.summary().expect("summary");
        assert_eq!(summary.target, "user/octocat");
        assert_eq!(summary.repos_count, 1);
        assert!(parse_timestamp(&summary.last_backup).is_some());

        // no temp files left behind
        let leftovers: Vec<_> = fs::read_dir(temp_dir.path().join("nested"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_new_state_carries_records_for_same_target() {
        let mut previous = BackupState {
            target_type: "org".to_string(),
            target_name: "acme".to_string(),
            ..BackupState::default()
        };
        previous.record_repository("acme/widgets", Some("2024-01-01T00:00:00Z"));
        let (_dir, store) = store_with(&previous);

        let same = store.new_state(TargetType::Org, "acme");
        assert_eq!(same.total_repos, 1);

        let other = store.new_state(TargetType::User, "acme");
        assert_eq!(other.total_repos, 0);
    }

    #[test]
    fn test_unknown_and_missing_fields() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(
            temp_dir.path().join(STATE_FILE),
            r#"{"last_backup": "2024-01-01T00:00:00Z", "total_issues": 7, "gists_backed_up": []}"#,
        )
        .unwrap();

        let mut store = IncrementalStateStore::new(temp_dir.path());
        let state = store.load().expect("state");
        assert_eq!(state.version, STATE_VERSION);
        assert!(state.repos_updated.is_empty());
    }

    #[test]
    fn test_foreign_counters_survive_rewrite() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(
            temp_dir.path().join(STATE_FILE),
            r#"{
  "version": "1",
  "last_backup": "2024-01-01T00:00:00Z",
  "target_type": "user",
  "target_name": "octocat",
  "repos_updated": {},
  "repos_backed_up": [],
  "total_repos": 0,
  "issues_since": {"octocat/hello": "2024-01-01T00:00:00Z"},
  "total_issues": 42,
  "gists_backed_up": ["abc123"]
}"#,
        )
        .unwrap();

        let mut store = IncrementalStateStore::new(temp_dir.path());
        store.load().expect("state");
        let mut state = store.new_state(TargetType::User, "octocat");
        state.record_repository("octocat/hello", Some("2024-02-01T00:00:00Z"));
        store.finalize(&mut state).expect("Failed to finalize");

        let written: Value =
            serde_json::from_str(&fs::read_to_string(store.state_file.as_path()).unwrap())
                .unwrap();
        assert_eq!(written["total_issues"], 42);
        assert_eq!(
            written["issues_since"]["octocat/hello"],
            "2024-01-01T00:00:00Z"
        );
        assert_eq!(written["gists_backed_up"][0], "abc123");
        assert_eq!(written["total_repos"], 1);
    }
}
