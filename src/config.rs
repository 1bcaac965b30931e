use anyhow::{bail, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryConfig;

/// Persistent defaults for Farmore, read from `config.yml`
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Directory that holds one backup folder per target
    #[serde(default = "default_backup_root")]
    pub backup_root: String,

    /// GitHub authentication and API settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Mirroring behavior
    #[serde(default)]
    pub mirror: MirrorConfig,

    /// Repository filtering defaults
    #[serde(default)]
    pub filters: FilterConfig,

    /// Timeouts and retry budget
    #[serde(default)]
    pub network: NetworkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// GitHub configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    /// Authentication method
    #[serde(default = "default_auth_method")]
    pub auth_method: String, // "auto", "token", "gh_cli", "none"

    /// REST API base URL (GitHub Enterprise or a test server)
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Page size for listing endpoints (GitHub caps it at 100)
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

/// Mirroring configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MirrorConfig {
    /// Maximum parallel clone/update operations (1-20)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Clone over SSH first, falling back to HTTPS on SSH auth failures
    #[serde(default = "default_true")]
    pub use_ssh: bool,

    /// Create bare mirrors (`git clone --mirror`) instead of working copies
    #[serde(default)]
    pub bare: bool,

    /// Skip repositories whose `updated_at` has not advanced since the last run
    #[serde(default)]
    pub incremental: bool,

    /// Clone working copies with `git lfs clone` and fetch LFS objects on update
    #[serde(default)]
    pub lfs: bool,
}

/// Repository filtering configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct FilterConfig {
    #[serde(default)]
    pub include_forks: bool,

    #[serde(default)]
    pub include_archived: bool,

    /// Repository names excluded by exact match
    #[serde(default)]
    pub exclude_names: Vec<String>,

    /// Only keep repositories whose name matches this regex
    pub name_regex: Option<String>,
}

/// Network configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NetworkConfig {
    /// Timeout for each GitHub API request in seconds
    #[serde(default = "default_http_timeout")]
    pub http_timeout: u64,

    /// Timeout for a clone in seconds
    #[serde(default = "default_clone_timeout")]
    pub clone_timeout: u64,

    /// Timeout for each fetch/pull step in seconds
    #[serde(default = "default_update_timeout")]
    pub update_timeout: u64,

    /// Timeout for LFS clones and LFS fetches in seconds
    #[serde(default = "default_lfs_timeout")]
    pub lfs_timeout: u64,

    /// Retries for transient network and server errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in seconds for transient errors
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,

    /// Retries when the API reports an exhausted rate limit
    #[serde(default = "default_max_retries")]
    pub rate_limit_retries: u32,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_backup_root() -> String {
    "backups".to_string()
}
fn default_auth_method() -> String {
    "auto".to_string()
}
fn default_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_per_page() -> u32 {
    100
}
fn default_true() -> bool {
    true
}
fn default_max_workers() -> usize {
    4
}
fn default_http_timeout() -> u64 {
    30
}
fn default_clone_timeout() -> u64 {
    300
}
fn default_update_timeout() -> u64 {
    120
}
fn default_lfs_timeout() -> u64 {
    600
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            auth_method: default_auth_method(),
            api_url: default_api_url(),
            per_page: default_per_page(),
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            use_ssh: default_true(),
            bare: false,
            incremental: false,
            lfs: false,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            http_timeout: default_http_timeout(),
            clone_timeout: default_clone_timeout(),
            update_timeout: default_update_timeout(),
            lfs_timeout: default_lfs_timeout(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            rate_limit_retries: default_max_retries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backup_root: default_backup_root(),
            github: GitHubConfig::default(),
            mirror: MirrorConfig::default(),
            filters: FilterConfig::default(),
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, falling back to defaults
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            tracing::debug!("No configuration at {:?}, using defaults", config_path);
            let mut config = Self::default();
            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("farmore").join("config.yml"))
    }

    /// Expand `~` and environment variables in configured paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.backup_root = shellexpand::full(&self.backup_root)
            .context("Failed to expand backup_root path")?
            .into_owned();

        Ok(())
    }

    /// Default destination for a target: `<backup_root>/<target_name>`
    pub fn default_destination(&self, target_name: &str) -> PathBuf {
        PathBuf::from(&self.backup_root).join(target_name)
    }

    /// Retry settings derived from the network section
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.network.max_retries,
            initial_delay: Duration::from_secs(self.network.retry_delay),
            max_rate_limit_retries: self.network.rate_limit_retries,
            ..RetryConfig::default()
        }
    }
}

/// Kind of GitHub account being mirrored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    User,
    Org,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::User => "user",
            TargetType::Org => "org",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Repository visibility filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    All,
    Public,
    Private,
}

/// Category subdirectory under `repos/` in a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryCategory {
    Private,
    Public,
    Starred,
    Watched,
    Organizations,
    Forks,
}

impl RepositoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryCategory::Private => "private",
            RepositoryCategory::Public => "public",
            RepositoryCategory::Starred => "starred",
            RepositoryCategory::Watched => "watched",
            RepositoryCategory::Organizations => "organizations",
            RepositoryCategory::Forks => "forks",
        }
    }
}

/// Smallest and largest accepted worker pool size
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 20;

/// Settings for a single discovery + mirror run.
///
/// Built once from [`Config`] and command-line overrides, validated, then
/// shared read-only between the catalog and the orchestrator.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub target_type: TargetType,
    pub target_name: String,
    pub destination_root: PathBuf,
    pub token: Option<String>,

    pub visibility: Visibility,
    pub include_forks: bool,
    pub include_archived: bool,
    pub exclude_org_repos: bool,
    pub exclude_names: Vec<String>,
    pub name_regex: Option<String>,

    pub max_workers: usize,
    pub dry_run: bool,
    pub use_ssh: bool,
    pub bare: bool,
    pub incremental: bool,
    pub lfs: bool,

    pub repository_category: Option<RepositoryCategory>,
    pub disable_categorization: bool,

    pub api_url: String,
    pub per_page: u32,
    pub http_timeout: Duration,
    pub clone_timeout: Duration,
    pub update_timeout: Duration,
    pub lfs_timeout: Duration,
    pub retry: RetryConfig,
}

impl RunConfig {
    /// A run with built-in defaults for everything but the target
    pub fn new(
        target_type: TargetType,
        target_name: impl Into<String>,
        destination_root: impl Into<PathBuf>,
    ) -> Self {
        Self::from_config(&Config::default(), target_type, target_name, destination_root)
    }

    /// A run seeded from the persistent configuration
    pub fn from_config(
        config: &Config,
        target_type: TargetType,
        target_name: impl Into<String>,
        destination_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            target_type,
            target_name: target_name.into(),
            destination_root: destination_root.into(),
            token: None,
            visibility: Visibility::All,
            include_forks: config.filters.include_forks,
            include_archived: config.filters.include_archived,
            exclude_org_repos: false,
            exclude_names: config.filters.exclude_names.clone(),
            name_regex: config.filters.name_regex.clone(),
            max_workers: config.mirror.max_workers,
            dry_run: false,
            use_ssh: config.mirror.use_ssh,
            bare: config.mirror.bare,
            incremental: config.mirror.incremental,
            lfs: config.mirror.lfs,
            repository_category: None,
            disable_categorization: false,
            api_url: config.github.api_url.trim_end_matches('/').to_string(),
            per_page: config.github.per_page.clamp(1, 100),
            http_timeout: Duration::from_secs(config.network.http_timeout),
            clone_timeout: Duration::from_secs(config.network.clone_timeout),
            update_timeout: Duration::from_secs(config.network.update_timeout),
            lfs_timeout: Duration::from_secs(config.network.lfs_timeout),
            retry: config.retry_config(),
        }
    }

    /// Reject settings that cannot produce a meaningful run
    pub fn validate(&self) -> Result<()> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.max_workers) {
            bail!(
                "max_workers must be between {} and {}, got {}",
                MIN_WORKERS,
                MAX_WORKERS,
                self.max_workers
            );
        }
        if self.target_name.trim().is_empty() {
            bail!("target name must not be empty");
        }
        Ok(())
    }

    pub fn has_token(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.is_empty())
    }
}
