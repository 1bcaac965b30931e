//! Common test utilities and helpers for Farmore tests
#![allow(dead_code)]

use async_trait::async_trait;
use mockall::mock;
use serde_json::{json, Value};
use std::path::Path;

use farmore::config::TargetType;
use farmore::retry::RetryConfig;
use farmore::{GitOutcome, GitTransport, Repository, RunConfig};

mock! {
    pub Transport {}

    #[async_trait]
    impl GitTransport for Transport {
        async fn is_repository(&self, path: &Path) -> bool;
        async fn remote_url(&self, path: &Path) -> Option<String>;
        async fn clone_repository(&self, url: &str, dest: &Path, bare: bool) -> GitOutcome;
        async fn fetch_and_pull(&self, path: &Path, branch: &str) -> GitOutcome;
        async fn mirror_update(&self, path: &Path) -> GitOutcome;
        async fn lfs_clone(&self, url: &str, dest: &Path) -> GitOutcome;
        async fn fetch_lfs(&self, path: &Path) -> GitOutcome;
    }
}

/// GitHub API repository payload builder
#[derive(Debug, Clone)]
pub struct ApiRepo {
    pub owner: String,
    pub name: String,
    pub owner_type: &'static str,
    pub fork: bool,
    pub private: bool,
    pub archived: bool,
    pub updated_at: String,
}

impl ApiRepo {
    pub fn new(owner: &str, name: &str) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            owner_type: "User",
            fork: false,
            private: false,
            archived: false,
            updated_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    pub fn in_org(mut self) -> Self {
        self.owner_type = "Organization";
        self
    }

    pub fn as_fork(mut self) -> Self {
        self.fork = true;
        self
    }

    pub fn as_private(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn as_archived(mut self) -> Self {
        self.archived = true;
        self
    }

    pub fn json(&self) -> Value {
        json!({
            "name": self.name,
            "full_name": format!("{}/{}", self.owner, self.name),
            "owner": {"login": self.owner, "type": self.owner_type},
            "ssh_url": format!("git@github.com:{}/{}.git", self.owner, self.name),
            "clone_url": format!("https://github.com/{}/{}.git", self.owner, self.name),
            "default_branch": "main",
            "private": self.private,
            "fork": self.fork,
            "archived": self.archived,
            "updated_at": self.updated_at,
        })
    }

    pub fn repository(&self) -> Repository {
        Repository::from_api(&self.json()).expect("valid repository payload")
    }
}

pub fn page(repos: &[ApiRepo]) -> Value {
    Value::Array(repos.iter().map(ApiRepo::json).collect())
}

/// Run settings pointed at a mock API server, retrying without delays
pub fn run_config(api_url: &str, target_type: TargetType, name: &str, dest: &Path) -> RunConfig {
    let mut config = RunConfig::new(target_type, name, dest);
    config.api_url = api_url.to_string();
    config.retry = RetryConfig::immediate();
    config
}
