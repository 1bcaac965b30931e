//! Repository filter pipeline
//!
//! Stages run in a fixed order (visibility, forks, archived, organization
//! owned, excluded names, name regex) and each logs how many repositories it
//! removed. Running the pipeline twice gives the same result as running it once.

use regex::Regex;
use std::fmt;
use tracing::{info, warn};

use crate::config::{RunConfig, Visibility};
use crate::discovery::Repository;

/// How many repositories one stage removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: &'static str,
    pub removed: usize,
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} filtered", self.removed, self.stage)
    }
}

fn stage(
    repos: Vec<Repository>,
    name: &'static str,
    reports: &mut Vec<StageReport>,
    keep: impl Fn(&Repository) -> bool,
) -> Vec<Repository> {
    let before = repos.len();
    let kept: Vec<Repository> = repos.into_iter().filter(|r| keep(r)).collect();
    let removed = before - kept.len();
    if removed > 0 {
        reports.push(StageReport {
            stage: name,
            removed,
        });
    }
    kept
}

/// Run the pipeline and report what each stage removed
pub fn filter_with_report(
    repos: Vec<Repository>,
    config: &RunConfig,
    authenticated_login: Option<&str>,
) -> (Vec<Repository>, Vec<StageReport>) {
    let mut reports = Vec::new();

    let repos = match config.visibility {
        Visibility::All => repos,
        Visibility::Public => stage(repos, "private", &mut reports, |r| !r.private),
        Visibility::Private => stage(repos, "public", &mut reports, |r| r.private),
    };

    let repos = if config.include_forks {
        repos
    } else {
        stage(repos, "forks", &mut reports, |r| !r.fork)
    };

    let repos = if config.include_archived {
        repos
    } else {
        stage(repos, "archived", &mut reports, |r| !r.archived)
    };

    // Only meaningful when we know who "self" is
    let repos = match authenticated_login {
        Some(login) if config.exclude_org_repos => {
            stage(repos, "organization-owned", &mut reports, |r| {
                r.owner.eq_ignore_ascii_case(login)
            })
        }
        _ => repos,
    };

    let repos = if config.exclude_names.is_empty() {
        repos
    } else {
        stage(repos, "excluded by name", &mut reports, |r| {
            !config.exclude_names.iter().any(|n| n == &r.name)
        })
    };

    let repos = match config.name_regex.as_deref() {
        Some(pattern) => match Regex::new(pattern) {
            Ok(re) => stage(repos, "not matching name pattern", &mut reports, |r| {
                re.is_match(&r.name)
            }),
            Err(e) => {
                warn!("Ignoring invalid name regex '{}': {}", pattern, e);
                repos
            }
        },
        None => repos,
    };

    (repos, reports)
}

/// Run the pipeline, logging each stage's effect
pub fn apply_filters(
    repos: Vec<Repository>,
    config: &RunConfig,
    authenticated_login: Option<&str>,
) -> Vec<Repository> {
    let initial = repos.len();
    let (filtered, reports) = filter_with_report(repos, config, authenticated_login);

    for report in &reports {
        info!("{}", report);
    }
    if filtered.len() < initial {
        info!("Total after filtering: {} → {} repositories", initial, filtered.len());
    }

    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetType;
    use crate::discovery::OwnerType;
    use quickcheck_macros::quickcheck;

    fn repo(owner: &str, name: &str) -> Repository {
        Repository {
            name: name.to_string(),
            full_name: format!("{}/{}", owner, name),
            owner: owner.to_string(),
            owner_type: OwnerType::User,
            ssh_url: format!("git@github.com:{}/{}.git", owner, name),
            clone_url: format!("https://github.com/{}/{}.git", owner, name),
            default_branch: "main".to_string(),
            private: false,
            fork: false,
            archived: false,
            updated_at: None,
        }
    }

    fn config() -> RunConfig {
        RunConfig::new(TargetType::Org, "acme", "/tmp/acme")
    }

    #[test]
    fn test_forks_filtered_by_default() {
        let mut repos: Vec<Repository> = (0..5).map(|i| repo("acme", &format!("r{}", i))).collect();
        repos[1].fork = true;
        repos[3].fork = true;

        let (kept, reports) = filter_with_report(repos, &config(), None);

        assert_eq!(kept.len(), 3);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].to_string(), "2 forks filtered");
    }

    #[test]
    fn test_include_forks_and_archived() {
        let mut repos = vec![repo("acme", "a"), repo("acme", "b")];
        repos[0].fork = true;
        repos[1].archived = true;

        let mut config = config();
        config.include_forks = true;
        config.include_archived = true;

        let (kept, reports) = filter_with_report(repos, &config, None);
        assert_eq!(kept.len(), 2);
        assert!(reports.is_empty());
    }

    #[test]
    fn test_visibility_filter() {
        let mut repos = vec![repo("me", "secret"), repo("me", "open")];
        repos[0].private = true;

        let mut config = config();
        config.visibility = Visibility::Public;
        let (kept, _) = filter_with_report(repos.clone(), &config, None);
        assert_eq!(kept.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["open"]);

        config.visibility = Visibility::Private;
        let (kept, _) = filter_with_report(repos, &config, None);
        assert_eq!(kept.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["secret"]);
    }

    #[test]
    fn test_exclude_org_repos_needs_login() {
        let repos = vec![repo("me", "mine"), repo("acme", "theirs")];
        let mut config = config();
        config.exclude_org_repos = true;

        let (kept, _) = filter_with_report(repos.clone(), &config, None);
        assert_eq!(kept.len(), 2);

        let (kept, reports) = filter_with_report(repos, &config, Some("ME"));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "mine");
        assert_eq!(reports[0].to_string(), "1 organization-owned filtered");
    }

    #[test]
    fn test_exclude_names_and_regex() {
        let repos = vec![
            repo("me", "rust-cli"),
            repo("me", "rust-web"),
            repo("me", "python-tool"),
        ];
        let mut config = config();
        config.exclude_names = vec!["rust-web".to_string()];
        config.name_regex = Some("^rust".to_string());

        let (kept, reports) = filter_with_report(repos, &config, None);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "rust-cli");
        assert_eq!(reports.len(), 2);
    }

    #[test]
    fn test_regex_uses_search_semantics() {
        let repos = vec![repo("me", "my-rust-lib"), repo("me", "golang")];
        let mut config = config();
        config.name_regex = Some("rust".to_string());

        let (kept, _) = filter_with_report(repos, &config, None);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_invalid_regex_leaves_list_unchanged() {
        let repos = vec![repo("me", "a"), repo("me", "b")];
        let mut config = config();
        config.name_regex = Some("([".to_string());

        let kept = apply_filters(repos, &config, None);
        assert_eq!(kept.len(), 2);
    }

    #[quickcheck]
    fn prop_filtering_is_idempotent(flags: Vec<(bool, bool, bool, u8)>, include_forks: bool) -> bool {
        let repos: Vec<Repository> = flags
            .iter()
            .enumerate()
            .map(|(i, (private, fork, archived, n))| {
                let mut r = repo(if n % 3 == 0 { "acme" } else { "me" }, &format!("repo-{}-{}", i, n % 4));
                r.private = *private;
                r.fork = *fork;
                r.archived = *archived;
                r
            })
            .collect();

        let mut config = config();
        config.include_forks = include_forks;
        config.exclude_org_repos = true;
        config.exclude_names = vec!["repo-0-1".to_string()];
        config.name_regex = Some("-[0-2]$".to_string());

        let once = apply_filters(repos, &config, Some("me"));
        let twice = apply_filters(once.clone(), &config, Some("me"));
        once == twice
    }
}
