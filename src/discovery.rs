//! Repository discovery
//!
//! Turns a target (user, organization, starred list, watch list, search
//! query or a single `owner/name`) into [`Repository`] descriptors by walking
//! every page of the matching GitHub listing endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::{RunConfig, TargetType};
use crate::error::{GitHubError, Result};
use crate::filter::apply_filters;
use crate::github::PageFetcher;

/// Account kind that owns a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OwnerType {
    #[default]
    User,
    Organization,
}

/// A repository as reported by the GitHub API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repository {
    /// Repository name (e.g., "farmore")
    pub name: String,
    /// `owner/name`
    pub full_name: String,
    /// Owner login; empty for flattened search results
    pub owner: String,
    pub owner_type: OwnerType,
    pub ssh_url: String,
    pub clone_url: String,
    pub default_branch: String,
    pub private: bool,
    pub fork: bool,
    pub archived: bool,
    /// ISO-8601 timestamp of the last remote update
    pub updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiOwner {
    login: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiRepository {
    name: String,
    full_name: Option<String>,
    owner: Option<ApiOwner>,
    ssh_url: Option<String>,
    clone_url: Option<String>,
    default_branch: Option<String>,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    fork: bool,
    #[serde(default)]
    archived: bool,
    updated_at: Option<String>,
}

impl From<ApiRepository> for Repository {
    fn from(api: ApiRepository) -> Self {
        let (owner, owner_type) = match api.owner {
            Some(owner) => {
                let owner_type = match owner.kind.as_deref() {
                    Some("Organization") => OwnerType::Organization,
                    _ => OwnerType::User,
                };
                (owner.login, owner_type)
            }
            None => (String::new(), OwnerType::User),
        };

        let full_name = api.full_name.unwrap_or_else(|| {
            if owner.is_empty() {
                api.name.clone()
            } else {
                format!("{}/{}", owner, api.name)
            }
        });

        Self {
            ssh_url: api
                .ssh_url
                .unwrap_or_else(|| format!("git@github.com:{}.git", full_name)),
            clone_url: api
                .clone_url
                .unwrap_or_else(|| format!("https://github.com/{}.git", full_name)),
            default_branch: api
                .default_branch
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| "main".to_string()),
            name: api.name,
            full_name,
            owner,
            owner_type,
            private: api.private,
            fork: api.fork,
            archived: api.archived,
            updated_at: api.updated_at,
        }
    }
}

impl Repository {
    /// Build a descriptor from one element of an API response
    pub fn from_api(value: &Value) -> Result<Self> {
        ApiRepository::deserialize(value)
            .map(Repository::from)
            .map_err(|e| GitHubError::Decode(format!("repository: {}", e)))
    }

    /// Clone URL for the requested protocol
    pub fn url(&self, use_ssh: bool) -> &str {
        if use_ssh {
            &self.ssh_url
        } else {
            &self.clone_url
        }
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name)
    }
}

fn repositories_from_page(body: Value, url: &str) -> Result<Vec<Repository>> {
    match body {
        Value::Array(items) => items.iter().map(Repository::from_api).collect(),
        other => Err(GitHubError::Decode(format!(
            "expected a JSON array from {}, got {}",
            url,
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Listing endpoint for a discovery run, chosen once up front
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoListing {
    /// `/user/repos`: everything the token can see, private included
    SelfRepositories,
    /// `/users/{name}/repos`: public repositories of another user
    OtherUserRepositories(String),
    /// `/orgs/{name}/repos`
    OrganizationRepositories(String),
    SelfStarred,
    UserStarred(String),
    SelfWatched,
    UserWatched(String),
}

impl RepoListing {
    pub fn path(&self) -> String {
        match self {
            RepoListing::SelfRepositories => "/user/repos".to_string(),
            RepoListing::OtherUserRepositories(user) => format!("/users/{}/repos", user),
            RepoListing::OrganizationRepositories(org) => format!("/orgs/{}/repos", org),
            RepoListing::SelfStarred => "/user/starred".to_string(),
            RepoListing::UserStarred(user) => format!("/users/{}/starred", user),
            RepoListing::SelfWatched => "/user/subscriptions".to_string(),
            RepoListing::UserWatched(user) => format!("/users/{}/subscriptions", user),
        }
    }

    /// Query parameters for the first page
    pub fn params(&self, per_page: u32) -> Vec<(&'static str, String)> {
        let mut params = vec![("per_page", per_page.to_string())];
        if matches!(
            self,
            RepoListing::SelfRepositories
                | RepoListing::OtherUserRepositories(_)
                | RepoListing::OrganizationRepositories(_)
        ) {
            params.push(("type", "all".to_string()));
        }
        params
    }

    /// Name of the target, for "not found" errors
    fn describe(&self) -> String {
        match self {
            RepoListing::SelfRepositories | RepoListing::SelfStarred | RepoListing::SelfWatched => {
                "Authenticated user".to_string()
            }
            RepoListing::OtherUserRepositories(user)
            | RepoListing::UserStarred(user)
            | RepoListing::UserWatched(user) => format!("User '{}'", user),
            RepoListing::OrganizationRepositories(org) => format!("Organization '{}'", org),
        }
    }
}

/// Sort key for repository search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SearchSort {
    #[default]
    BestMatch,
    Stars,
    Forks,
    Updated,
}

impl SearchSort {
    fn as_param(&self) -> Option<&'static str> {
        match self {
            SearchSort::BestMatch => None,
            SearchSort::Stars => Some("stars"),
            SearchSort::Forks => Some("forks"),
            SearchSort::Updated => Some("updated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn as_param(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// A repository search request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub query: String,
    pub language: Option<String>,
    pub min_stars: Option<u32>,
    pub sort: SearchSort,
    pub order: SortOrder,
    /// Maximum results, 1..=100
    pub limit: u32,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            language: None,
            min_stars: None,
            sort: SearchSort::default(),
            order: SortOrder::default(),
            limit: 30,
        }
    }

    /// The `q` parameter sent to GitHub
    pub fn to_query_string(&self) -> String {
        let mut q = self.query.trim().to_string();
        if let Some(language) = self.language.as_deref().filter(|l| !l.is_empty()) {
            q.push_str(&format!(" language:{}", language));
        }
        if let Some(stars) = self.min_stars {
            q.push_str(&format!(" stars:>={}", stars));
        }
        q
    }
}

/// Discovers repositories through the GitHub API
pub struct RepositoryCatalog {
    fetcher: PageFetcher,
    per_page: u32,
    login: OnceCell<Option<String>>,
}

impl RepositoryCatalog {
    pub fn new(fetcher: PageFetcher, per_page: u32) -> Self {
        Self {
            fetcher,
            per_page: per_page.clamp(1, 100),
            login: OnceCell::new(),
        }
    }

    pub fn from_run_config(config: &RunConfig) -> Result<Self> {
        Ok(Self::new(PageFetcher::from_run_config(config)?, config.per_page))
    }

    pub fn fetcher(&self) -> &PageFetcher {
        &self.fetcher
    }

    /// Login of the token's owner, looked up once per catalog.
    ///
    /// `None` when running without a token or when `/user` cannot be read.
    pub async fn authenticated_login(&self) -> Option<String> {
        self.login
            .get_or_init(|| async {
                if !self.fetcher.is_authenticated() {
                    return None;
                }
                match self.fetcher.get(&self.fetcher.url("/user"), &[]).await {
                    Ok(page) => {
                        let login = page.body.get("login").and_then(Value::as_str).map(str::to_string);
                        if let Some(login) = &login {
                            debug!("Authenticated as GitHub user: {}", login);
                        }
                        login
                    }
                    Err(e) => {
                        warn!("Could not determine the authenticated user: {}", e);
                        None
                    }
                }
            })
            .await
            .clone()
    }

    async fn is_self(&self, username: &str) -> bool {
        self.authenticated_login()
            .await
            .is_some_and(|login| login.eq_ignore_ascii_case(username))
    }

    /// Pick the listing endpoint for a user or organization target
    pub async fn select_listing(&self, config: &RunConfig) -> RepoListing {
        match config.target_type {
            TargetType::Org => RepoListing::OrganizationRepositories(config.target_name.clone()),
            TargetType::User => {
                if self.is_self(&config.target_name).await {
                    info!("Target matches the authenticated user, including private repositories");
                    RepoListing::SelfRepositories
                } else {
                    RepoListing::OtherUserRepositories(config.target_name.clone())
                }
            }
        }
    }

    /// Fetch every page of a listing
    pub async fn list(&self, listing: &RepoListing) -> Result<Vec<Repository>> {
        let first_url = self.fetcher.url(&listing.path());
        let first_params = listing.params(self.per_page);

        let mut repositories = Vec::new();
        let mut next = Some(first_url.clone());
        let mut page_number = 0usize;

        while let Some(url) = next.take() {
            let params: &[(&str, String)] = if page_number == 0 { &first_params } else { &[] };

            let page = self.fetcher.get(&url, params).await.map_err(|e| match e {
                GitHubError::NotFound { .. } => GitHubError::NotFound {
                    what: listing.describe(),
                },
                other => other,
            })?;

            if page_number == 0 {
                page.rate_limit.log(self.fetcher.is_authenticated());
            }
            page_number += 1;

            let items = repositories_from_page(page.body, &url)?;
            debug!("Page {} of {}: {} repositories", page_number, first_url, items.len());
            repositories.extend(items);

            next = page.next.filter(|n| *n != url);
        }

        info!(
            "Found {} repositories via {} ({} page{})",
            repositories.len(),
            listing.path(),
            page_number,
            if page_number == 1 { "" } else { "s" }
        );
        Ok(repositories)
    }

    /// Discover and filter the repositories of the configured user or organization
    pub async fn discover(&self, config: &RunConfig) -> Result<Vec<Repository>> {
        info!("Discovering repositories for {} '{}'", config.target_type, config.target_name);
        let listing = self.select_listing(config).await;
        self.list_filtered(&listing, config).await
    }

    /// Repositories starred by `username`, or by the token's owner when `None`
    pub async fn starred(&self, username: Option<&str>, config: &RunConfig) -> Result<Vec<Repository>> {
        let listing = match username {
            Some(user) => {
                if self.is_self(user).await {
                    RepoListing::SelfStarred
                } else {
                    RepoListing::UserStarred(user.to_string())
                }
            }
            None => self.require_token(RepoListing::SelfStarred)?,
        };
        self.list_filtered(&listing, config).await
    }

    /// Repositories watched by `username`, or by the token's owner when `None`
    pub async fn watched(&self, username: Option<&str>, config: &RunConfig) -> Result<Vec<Repository>> {
        let listing = match username {
            Some(user) => {
                if self.is_self(user).await {
                    RepoListing::SelfWatched
                } else {
                    RepoListing::UserWatched(user.to_string())
                }
            }
            None => self.require_token(RepoListing::SelfWatched)?,
        };
        self.list_filtered(&listing, config).await
    }

    fn require_token(&self, listing: RepoListing) -> Result<RepoListing> {
        if self.fetcher.is_authenticated() {
            Ok(listing)
        } else {
            Err(GitHubError::InvalidInput(format!(
                "{} requires a token; pass a username or set GITHUB_TOKEN",
                listing.path()
            )))
        }
    }

    async fn list_filtered(&self, listing: &RepoListing, config: &RunConfig) -> Result<Vec<Repository>> {
        let repositories = self.list(listing).await?;
        let login = if config.exclude_org_repos {
            self.authenticated_login().await
        } else {
            None
        };
        Ok(apply_filters(repositories, config, login.as_deref()))
    }

    /// Search public repositories
    pub async fn search_repositories(&self, query: &SearchQuery) -> Result<Vec<Repository>> {
        if !(1..=100).contains(&query.limit) {
            return Err(GitHubError::InvalidInput(format!(
                "search limit must be between 1 and 100, got {}",
                query.limit
            )));
        }
        let q = query.to_query_string();
        if q.is_empty() {
            return Err(GitHubError::InvalidInput("search query must not be empty".into()));
        }

        let mut params = vec![("q", q.clone()), ("per_page", query.limit.to_string())];
        if let Some(sort) = query.sort.as_param() {
            params.push(("sort", sort.to_string()));
            params.push(("order", query.order.as_param().to_string()));
        }

        info!("Searching repositories: {}", q);
        let url = self.fetcher.url("/search/repositories");
        let page = self.fetcher.get(&url, &params).await.map_err(|e| match e {
            GitHubError::Api { status: 422, message } => GitHubError::InvalidQuery {
                query: q.clone(),
                message,
            },
            other => other,
        })?;
        page.rate_limit.log(self.fetcher.is_authenticated());

        let total = page.body.get("total_count").and_then(Value::as_u64).unwrap_or(0);
        let items = match page.body.get("items") {
            Some(items) => repositories_from_page(items.clone(), &url)?,
            None => return Err(GitHubError::Decode(format!("missing `items` in response from {}", url))),
        };

        let limit = usize::try_from(query.limit).unwrap_or(usize::MAX);
        let results: Vec<Repository> = items.into_iter().take(limit).collect();
        info!("Search matched {} repositories, keeping {}", total, results.len());
        Ok(results)
    }

    /// Look up a single repository; `None` when it does not exist
    pub async fn get_repository(&self, owner: &str, name: &str) -> Result<Option<Repository>> {
        let url = self.fetcher.url(&format!("/repos/{}/{}", owner, name));
        match self.fetcher.get(&url, &[]).await {
            Ok(page) => Repository::from_api(&page.body).map(Some),
            Err(GitHubError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
