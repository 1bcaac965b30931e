//! Farmore - mirror a GitHub account's repositories to local disk
//!
//! Farmore turns a target (a user, an organization, starred or watched
//! repositories, or a search query) into a filtered list of repositories and
//! mirrors each one with a bounded pool of git workers.
//!
//! ## Core Features
//!
//! - **Discovery**: paginated, rate-limit-aware GitHub REST client
//! - **Filtering**: visibility, forks, archived, organization, name rules
//! - **Parallel mirroring**: clone-if-absent, fetch+pull otherwise, with
//!   per-repository failure isolation and SSH to HTTPS fallback
//! - **Incremental backups**: skip repositories unchanged since the last run
//!
//! ## Modules
//!
//! - [`config`]: configuration file and per-run settings
//! - [`github`]: HTTP page fetching, authentication and rate limits
//! - [`discovery`]: repository listings, search and lookup
//! - [`filter`]: the filter pipeline
//! - [`layout`]: where each repository lands on disk
//! - [`git`]: the git transport and its subprocess implementation
//! - [`sync`]: the mirror orchestrator
//! - [`state`]: incremental backup state

pub mod config;
pub mod discovery;
pub mod error;
pub mod filter;
pub mod git;
pub mod github;
pub mod layout;
pub mod progress;
pub mod retry;
pub mod shutdown;
pub mod state;
pub mod sync;

pub use config::{Config, RunConfig, TargetType, Visibility};
pub use discovery::{RepoListing, Repository, RepositoryCatalog, SearchQuery};
pub use error::GitHubError;
pub use git::{GitCli, GitOutcome, GitTransport};
pub use state::{BackupState, IncrementalStateStore};
pub use sync::{MirrorAction, MirrorOrchestrator, MirrorResult, MirrorSummary};
