//! GitHub API error types.

use chrono::{DateTime, Local, Utc};
use thiserror::Error;

/// Errors that can occur while discovering repositories through the GitHub API.
///
/// Everything here is fatal for discovery. Per-repository mirroring problems
/// never surface as a `GitHubError`; they end up as failed or skipped
/// entries in the [`MirrorSummary`](crate::sync::MirrorSummary).
#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("{what} not found. Check the name and your access to it.")]
    NotFound { what: String },

    #[error("Authentication failed (HTTP 401). Check your GITHUB_TOKEN.")]
    Auth,

    #[error("{}", rate_limit_message(.remaining, .reset_at, .authenticated))]
    RateLimited {
        remaining: u64,
        reset_at: Option<DateTime<Utc>>,
        authenticated: bool,
    },

    #[error("Access forbidden: {0}")]
    Forbidden(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("GitHub API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("GitHub rejected the search query `{query}`: {message}")]
    InvalidQuery { query: String, message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to decode GitHub response: {0}")]
    Decode(String),
}

impl GitHubError {
    /// Whether the error is worth another attempt under the retry policy.
    pub fn is_transient(&self) -> bool {
        match self {
            GitHubError::Network(_) => true,
            GitHubError::Api { status, .. } => matches!(status, 502..=504),
            _ => false,
        }
    }
}

fn rate_limit_message(
    remaining: &u64,
    reset_at: &Option<DateTime<Utc>>,
    authenticated: &bool,
) -> String {
    let reset = reset_at
        .as_ref()
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let status = if *authenticated {
        "authenticated"
    } else {
        "unauthenticated"
    };

    let mut message = format!(
        "GitHub API rate limit exceeded ({status}). Remaining requests: {remaining}, limit resets at: {reset}. \
         Limits are 60 requests/hour unauthenticated and 5,000 requests/hour authenticated."
    );
    if !*authenticated {
        message.push_str(
            " To raise your limit, create a token at https://github.com/settings/tokens \
             and export it as GITHUB_TOKEN.",
        );
    }
    message
}

pub type Result<T> = std::result::Result<T, GitHubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(GitHubError::Network("reset".into()).is_transient());
        assert!(GitHubError::Api { status: 502, message: String::new() }.is_transient());
        assert!(GitHubError::Api { status: 504, message: String::new() }.is_transient());
        assert!(!GitHubError::Api { status: 500, message: String::new() }.is_transient());
        assert!(!GitHubError::Auth.is_transient());
        assert!(!GitHubError::NotFound { what: "x".into() }.is_transient());
    }

    #[test]
    fn test_rate_limit_message_mentions_token_when_unauthenticated() {
        let err = GitHubError::RateLimited {
            remaining: 0,
            reset_at: None,
            authenticated: false,
        };
        let message = err.to_string();
        assert!(message.contains("Remaining requests: 0"));
        assert!(message.contains("GITHUB_TOKEN"));

        let err = GitHubError::RateLimited {
            remaining: 0,
            reset_at: Some(Utc::now()),
            authenticated: true,
        };
        assert!(!err.to_string().contains("GITHUB_TOKEN"));
    }

    #[test]
    fn test_invalid_query_echoes_query() {
        let err = GitHubError::InvalidQuery {
            query: "rust language:rust stars:>=10".into(),
            message: "Validation Failed".into(),
        };
        assert!(err.to_string().contains("rust language:rust stars:>=10"));
    }
}
