use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use console::Term;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use farmore::config::RepositoryCategory;
use farmore::discovery::{SearchSort, SortOrder};
use farmore::github::resolve_token;
use farmore::shutdown::install_ctrl_c_handler;
use farmore::{
    Config, GitCli, IncrementalStateStore, MirrorOrchestrator, MirrorSummary, Repository,
    RepositoryCatalog, RunConfig, SearchQuery, TargetType, Visibility,
};

#[derive(Parser)]
#[command(name = "farmore")]
#[command(about = "Mirror every GitHub repository you care about to local disk")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror all repositories of a user
    User {
        username: String,

        #[command(flatten)]
        mirror: MirrorArgs,
    },

    /// Mirror all repositories of an organization
    Org {
        org: String,

        #[command(flatten)]
        mirror: MirrorArgs,
    },

    /// Mirror repositories starred by a user (the authenticated user if omitted)
    Starred {
        username: Option<String>,

        #[command(flatten)]
        mirror: MirrorArgs,
    },

    /// Mirror repositories watched by a user (the authenticated user if omitted)
    Watched {
        username: Option<String>,

        #[command(flatten)]
        mirror: MirrorArgs,
    },

    /// Search GitHub and mirror the matching repositories
    Search {
        query: String,

        /// Restrict to a language
        #[arg(short, long)]
        language: Option<String>,

        /// Minimum number of stars
        #[arg(long)]
        min_stars: Option<u32>,

        #[arg(long, value_enum, default_value_t = SearchSort::BestMatch)]
        sort: SearchSort,

        #[arg(long, value_enum, default_value_t = SortOrder::Desc)]
        order: SortOrder,

        /// Maximum number of results (1-100)
        #[arg(long, default_value_t = 30)]
        limit: u32,

        #[command(flatten)]
        mirror: MirrorArgs,
    },

    /// Mirror a single repository given as owner/name
    Repo {
        repository: String,

        #[command(flatten)]
        mirror: MirrorArgs,
    },

    /// Show the incremental backup state of a destination
    State {
        /// Backup root holding the state file
        dest: PathBuf,
    },
}

#[derive(Args, Clone, Debug)]
struct MirrorArgs {
    /// Destination directory (default: <backup_root>/<target>)
    #[arg(short, long)]
    dest: Option<PathBuf>,

    /// Filter repositories by visibility
    #[arg(long, value_enum, default_value_t = Visibility::All)]
    visibility: Visibility,

    /// Include forked repositories
    #[arg(long)]
    include_forks: bool,

    /// Include archived repositories
    #[arg(long)]
    include_archived: bool,

    /// Skip repositories owned by someone other than the authenticated user
    #[arg(long)]
    exclude_orgs: bool,

    /// Skip a repository by name (repeatable)
    #[arg(long = "exclude", value_name = "NAME")]
    exclude: Vec<String>,

    /// Only mirror repositories whose name matches this regex
    #[arg(long)]
    name_regex: Option<String>,

    /// Number of parallel workers (1-20)
    #[arg(short = 'w', long = "max-workers", alias = "workers")]
    workers: Option<usize>,

    /// Show what would be done without touching the disk
    #[arg(long)]
    dry_run: bool,

    /// Clone over HTTPS instead of SSH
    #[arg(long)]
    https: bool,

    /// Skip repositories unchanged since the last backup
    #[arg(long)]
    incremental: bool,

    /// Create bare mirror clones
    #[arg(long)]
    bare: bool,

    /// Use Git LFS for clones and updates of working copies
    #[arg(long)]
    lfs: bool,

    /// GitHub token (prefer the GITHUB_TOKEN environment variable)
    #[arg(short, long)]
    token: Option<String>,
}

impl MirrorArgs {
    /// Layer the flags over the file configuration
    fn run_config(
        &self,
        config: &Config,
        target_type: TargetType,
        target_name: &str,
    ) -> Result<RunConfig> {
        let dest = self
            .dest
            .clone()
            .unwrap_or_else(|| config.default_destination(target_name));

        let mut run = RunConfig::from_config(config, target_type, target_name, dest);
        run.token = resolve_token(self.token.clone(), &config.github.auth_method);
        run.visibility = self.visibility;
        run.include_forks |= self.include_forks;
        run.include_archived |= self.include_archived;
        run.exclude_org_repos = self.exclude_orgs;
        run.exclude_names.extend(self.exclude.iter().cloned());
        if let Some(regex) = &self.name_regex {
            run.name_regex = Some(regex.clone());
        }
        if let Some(workers) = self.workers {
            run.max_workers = workers;
        }
        run.dry_run = self.dry_run;
        if self.https {
            run.use_ssh = false;
        }
        run.incremental |= self.incremental;
        run.bare |= self.bare;
        run.lfs |= self.lfs;

        run.validate()?;
        Ok(run)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.verbose, &config.logging.level)?;
    info!("Starting Farmore v{}", env!("CARGO_PKG_VERSION"));

    let exit_code = match cli.command {
        Commands::User { username, mirror } => {
            let run = mirror.run_config(&config, TargetType::User, &username)?;
            let catalog = RepositoryCatalog::from_run_config(&run)?;
            let repos = catalog.discover(&run).await?;
            mirror_repositories(run, repos).await
        }
        Commands::Org { org, mirror } => {
            let run = mirror.run_config(&config, TargetType::Org, &org)?;
            let catalog = RepositoryCatalog::from_run_config(&run)?;
            let repos = catalog.discover(&run).await?;
            mirror_repositories(run, repos).await
        }
        Commands::Starred { username, mirror } => {
            cmd_starred_or_watched(&config, username, mirror, RepositoryCategory::Starred).await?
        }
        Commands::Watched { username, mirror } => {
            cmd_starred_or_watched(&config, username, mirror, RepositoryCategory::Watched).await?
        }
        Commands::Search {
            query,
            language,
            min_stars,
            sort,
            order,
            limit,
            mirror,
        } => {
            let search = SearchQuery {
                query,
                language,
                min_stars,
                sort,
                order,
                limit,
            };
            cmd_search(&config, search, mirror).await?
        }
        Commands::Repo { repository, mirror } => cmd_repo(&config, &repository, mirror).await?,
        Commands::State { dest } => cmd_state(dest),
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// Initialize logging; `RUST_LOG` wins over `--verbose` and the config level
fn init_logging(verbose: bool, default_level: &str) -> Result<()> {
    let level = if verbose { "debug" } else { default_level };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&std::path::Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

async fn cmd_starred_or_watched(
    config: &Config,
    username: Option<String>,
    mirror: MirrorArgs,
    category: RepositoryCategory,
) -> Result<i32> {
    let placeholder = username.as_deref().unwrap_or(category.as_str());
    let mut run = mirror.run_config(config, TargetType::User, placeholder)?;
    run.repository_category = Some(category);
    let catalog = RepositoryCatalog::from_run_config(&run)?;

    if username.is_none() {
        if let Some(login) = catalog.authenticated_login().await {
            if mirror.dest.is_none() {
                run.destination_root = config.default_destination(&login);
            }
            run.target_name = login;
        }
    }

    let repos = match category {
        RepositoryCategory::Watched => catalog.watched(username.as_deref(), &run).await?,
        _ => catalog.starred(username.as_deref(), &run).await?,
    };
    Ok(mirror_repositories(run, repos).await)
}

async fn cmd_search(config: &Config, search: SearchQuery, mirror: MirrorArgs) -> Result<i32> {
    let mut run = mirror.run_config(config, TargetType::User, "search")?;
    run.disable_categorization = true;

    let catalog = RepositoryCatalog::from_run_config(&run)?;
    let repos = catalog.search_repositories(&search).await?;
    Ok(mirror_repositories(run, repos).await)
}

async fn cmd_repo(config: &Config, repository: &str, mirror: MirrorArgs) -> Result<i32> {
    let Some((owner, name)) = repository
        .split_once('/')
        .filter(|(owner, name)| !owner.is_empty() && !name.is_empty() && !name.contains('/'))
    else {
        bail!("Repository must be in the form owner/name, got '{}'", repository);
    };

    let run = mirror.run_config(config, TargetType::User, owner)?;
    let catalog = RepositoryCatalog::from_run_config(&run)?;
    let Some(repo) = catalog.get_repository(owner, name).await? else {
        bail!("Repository not found: {}", repository);
    };
    Ok(mirror_repositories(run, vec![repo]).await)
}

fn cmd_state(dest: PathBuf) -> i32 {
    let store = IncrementalStateStore::new(&dest);
    match store.summary() {
        Some(summary) => println!("{}", summary),
        None => println!("No backup state found in {}", dest.display()),
    }
    0
}

async fn mirror_repositories(run: RunConfig, repos: Vec<Repository>) -> i32 {
    let run = Arc::new(run);
    let transport = Arc::new(
        GitCli::new(run.clone_timeout, run.update_timeout).with_lfs_timeout(run.lfs_timeout),
    );

    let cancel = CancellationToken::new();
    install_ctrl_c_handler(cancel.clone());

    println!(
        "Mirroring {} repositories to {}",
        repos.len(),
        run.destination_root.display()
    );

    let summary = MirrorOrchestrator::new(Arc::clone(&run), transport)
        .with_cancellation(cancel)
        .with_interactive_progress(true)
        .run(repos)
        .await;

    print_summary(&summary, run.dry_run);
    summary.exit_code()
}

fn print_summary(summary: &MirrorSummary, dry_run: bool) {
    println!();
    if dry_run {
        println!("Dry run complete, nothing was changed");
    }
    println!("{}", summary);
    if Term::stdout().is_term() {
        println!("Finished in {:.2}s", summary.duration.as_secs_f64());
    }
}
