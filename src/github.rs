//! Authenticated access to the GitHub REST API.
//!
//! [`PageFetcher`] performs one GET at a time: it attaches the auth and
//! content headers, reads the rate-limit headers and the `rel="next"` link,
//! and classifies failures into [`GitHubError`]. Walking pages and choosing
//! endpoints is the job of [`crate::discovery`].

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, LINK, USER_AGENT};
use reqwest::StatusCode;
use serde_json::Value;
use std::env;
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::error::{GitHubError, Result};
use crate::retry::{RetryConfig, RetryPolicy};

const ACCEPT_V3: &str = "application/vnd.github.v3+json";
const FARMORE_USER_AGENT: &str = concat!("farmore/", env!("CARGO_PKG_VERSION"));

/// Resolve the API token.
///
/// An explicit token (command-line flag) always wins. Otherwise the
/// configured `auth_method` decides where to look: `auto` tries the
/// `GITHUB_TOKEN` environment variable and then the GitHub CLI, `token` only
/// the environment, `gh_cli` only the CLI and `none` disables authentication.
pub fn resolve_token(explicit: Option<String>, auth_method: &str) -> Option<String> {
    if let Some(token) = explicit.filter(|t| !t.trim().is_empty()) {
        debug!("Using token from command line");
        return Some(token);
    }

    match auth_method {
        "auto" => try_environment_token().or_else(try_github_cli),
        "token" => try_environment_token(),
        "gh_cli" => try_github_cli(),
        "none" => None,
        other => {
            warn!("Unknown auth method '{}', continuing unauthenticated", other);
            None
        }
    }
}

/// Try to get token from environment variable
fn try_environment_token() -> Option<String> {
    let token = env::var("GITHUB_TOKEN").ok()?;
    if token.trim().is_empty() {
        return None;
    }

    if !["ghp_", "gho_", "ghs_", "github_pat_"]
        .iter()
        .any(|prefix| token.starts_with(prefix))
    {
        warn!("GITHUB_TOKEN doesn't look like a GitHub token (expected a ghp_, gho_, ghs_ or github_pat_ prefix)");
    }

    debug!("Using GITHUB_TOKEN environment variable");
    Some(token)
}

/// Try to get token from the GitHub CLI
fn try_github_cli() -> Option<String> {
    let output = Command::new("gh").args(["auth", "token"]).output().ok()?;
    if !output.status.success() {
        debug!(
            "GitHub CLI did not return a token: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return None;
    }

    let token = String::from_utf8(output.stdout).ok()?.trim().to_string();
    if token.is_empty() {
        return None;
    }

    debug!("Using token from GitHub CLI");
    Some(token)
}

/// Rate-limit headers reported with a response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitInfo {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let number = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
        };

        Self {
            limit: number("x-ratelimit-limit"),
            remaining: number("x-ratelimit-remaining"),
            reset_at: number("x-ratelimit-reset")
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }

    /// Log the current quota, with a hint when running without a token
    pub fn log(&self, authenticated: bool) {
        let (Some(limit), Some(remaining)) = (self.limit, self.remaining) else {
            return;
        };
        let reset = self
            .reset_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string());

        info!(
            "GitHub API rate limit: {}/{} requests remaining (resets at {})",
            remaining, limit, reset
        );
        if !authenticated {
            warn!("Running unauthenticated (60 requests/hour). Set GITHUB_TOKEN to raise the limit to 5,000/hour");
        }
    }
}

/// One successful API response
#[derive(Debug, Clone)]
pub struct Page {
    pub body: Value,
    /// URL of the following page, if any
    pub next: Option<String>,
    pub rate_limit: RateLimitInfo,
}

/// Extract the `rel="next"` URL from a `Link` header
pub fn parse_next_link(header: &str) -> Option<String> {
    static LINK_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = LINK_RE
        .get_or_init(|| Regex::new(r#"<([^>]+)>;\s*rel="([^"]+)""#).ok())
        .as_ref()?;

    re.captures_iter(header)
        .find(|caps| caps[2].split_whitespace().any(|rel| rel == "next"))
        .map(|caps| caps[1].to_string())
}

/// Pull the `message` field out of a GitHub error body
fn api_message(body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string())
}

/// Single-request GitHub API client
pub struct PageFetcher {
    client: reqwest::Client,
    api_url: String,
    authenticated: bool,
    retry: RetryPolicy,
}

impl PageFetcher {
    pub fn new(
        api_url: &str,
        token: Option<&str>,
        timeout: Duration,
        retry: RetryConfig,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_V3));
        headers.insert(USER_AGENT, HeaderValue::from_static(FARMORE_USER_AGENT));

        let token = token.filter(|t| !t.is_empty());
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("token {}", token))
                .map_err(|_| GitHubError::InvalidInput("token contains invalid characters".into()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| GitHubError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            authenticated: token.is_some(),
            retry: RetryPolicy::new(retry),
        })
    }

    pub fn from_run_config(config: &RunConfig) -> Result<Self> {
        Self::new(
            &config.api_url,
            config.token.as_deref(),
            config.http_timeout,
            config.retry.clone(),
        )
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Absolute URL for an API path such as `/user/repos`
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// GET a URL under the retry policy
    pub async fn get(&self, url: &str, params: &[(&str, String)]) -> Result<Page> {
        let what = format!("GET {}", url);
        self.retry.run(&what, move || self.get_once(url, params)).await
    }

    async fn get_once(&self, url: &str, params: &[(&str, String)]) -> Result<Page> {
        debug!("GET {} {:?}", url, params);

        let mut request = self.client.get(url);
        if !params.is_empty() {
            request = request.query(params);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                GitHubError::InvalidInput(format!("invalid request URL {}: {}", url, e))
            } else {
                GitHubError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        let rate_limit = RateLimitInfo::from_headers(response.headers());
        let next = response
            .headers()
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_next_link);

        let body = response
            .bytes()
            .await
            .map_err(|e| GitHubError::Network(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(self.classify(status, &rate_limit, &body, url));
        }

        let body: Value = serde_json::from_slice(&body)
            .map_err(|e| GitHubError::Decode(format!("{}: {}", url, e)))?;

        Ok(Page {
            body,
            next,
            rate_limit,
        })
    }

    fn classify(
        &self,
        status: StatusCode,
        rate_limit: &RateLimitInfo,
        body: &[u8],
        url: &str,
    ) -> GitHubError {
        let message = api_message(body);
        match status {
            StatusCode::UNAUTHORIZED => GitHubError::Auth,
            StatusCode::NOT_FOUND => GitHubError::NotFound {
                what: format!("Resource {}", url),
            },
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS if rate_limit.is_exhausted() => {
                GitHubError::RateLimited {
                    remaining: 0,
                    reset_at: rate_limit.reset_at,
                    authenticated: self.authenticated,
                }
            }
            StatusCode::FORBIDDEN => GitHubError::Forbidden(message),
            _ => GitHubError::Api {
                status: status.as_u16(),
                message,
            },
        }
    }
}
