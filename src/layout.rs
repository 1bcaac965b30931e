//! On-disk layout of a backup.
//!
//! ```text
//! <destination_root>/
//!   repos/
//!     private/<owner>/<name>
//!     public/<owner>/<name>
//!     forks/<owner>/<name>
//!     organizations/<owner>/<name>
//!     starred/<owner>/<name>
//!     watched/<owner>/<name>
//! ```
//!
//! With categorization disabled (search results, single repositories) the
//! path is just `<owner>/<name>`.

use path_clean::PathClean;
use std::path::{Path, PathBuf};

use crate::config::{RepositoryCategory, RunConfig};
use crate::discovery::{OwnerType, Repository};

/// A single path component that cannot climb out of its parent
fn component(raw: &str) -> String {
    let cleaned = raw.replace(['/', '\\'], "_");
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{}", cleaned),
        _ => cleaned,
    }
}

fn owner_and_name(repo: &Repository) -> PathBuf {
    if repo.owner.is_empty() {
        PathBuf::from(component(&repo.name))
    } else {
        Path::new(&component(&repo.owner)).join(component(&repo.name))
    }
}

/// Category a repository is filed under when categorization is on
pub fn category_for(repo: &Repository, config: &RunConfig) -> RepositoryCategory {
    if let Some(category) = config.repository_category {
        category
    } else if repo.owner_type == OwnerType::Organization {
        RepositoryCategory::Organizations
    } else if repo.fork {
        RepositoryCategory::Forks
    } else if repo.private {
        RepositoryCategory::Private
    } else {
        RepositoryCategory::Public
    }
}

/// Path of a repository relative to the destination root
pub fn categorize(repo: &Repository, config: &RunConfig) -> PathBuf {
    if config.disable_categorization {
        return owner_and_name(repo);
    }

    Path::new("repos")
        .join(category_for(repo, config).as_str())
        .join(owner_and_name(repo))
}

/// Absolute destination of a repository for this run
pub fn destination_for(repo: &Repository, config: &RunConfig) -> PathBuf {
    config.destination_root.join(categorize(repo, config)).clean()
}
