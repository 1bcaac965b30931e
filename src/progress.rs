//! Progress reporting for mirror runs.
//!
//! - Interactive mode (TTY): one indicatif bar for the whole run
//! - Logging mode (non-TTY): a tracing line per finished repository

use console::Term;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info};

use crate::sync::{MirrorAction, MirrorResult};

pub enum ProgressReporter {
    Interactive(ProgressBar),
    Logging { total: u64, done: AtomicU64 },
}

impl ProgressReporter {
    /// Pick interactive or logging mode depending on whether stderr is a terminal
    pub fn new(total: u64) -> Self {
        if Term::stderr().is_term() {
            Self::interactive(total)
        } else {
            Self::logging(total)
        }
    }

    pub fn interactive(total: u64) -> Self {
        let bar = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        ) {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_message("Mirroring repositories...");
        Self::Interactive(bar)
    }

    pub fn logging(total: u64) -> Self {
        Self::Logging {
            total,
            done: AtomicU64::new(0),
        }
    }

    /// Record one finished repository
    pub fn advance(&self, result: &MirrorResult) {
        match self {
            Self::Interactive(bar) => {
                let line = format_result(result);
                bar.println(line);
                bar.inc(1);
            }
            Self::Logging { total, done } => {
                let done = done.fetch_add(1, Ordering::Relaxed) + 1;
                if result.action == MirrorAction::Failed {
                    error!("[{}/{}] {}", done, total, format_result(result));
                } else {
                    info!("[{}/{}] {}", done, total, format_result(result));
                }
            }
        }
    }

    pub fn finish(&self) {
        if let Self::Interactive(bar) = self {
            bar.finish_and_clear();
        }
    }
}

fn format_result(result: &MirrorResult) -> String {
    let detail = match (&result.action, &result.error) {
        (MirrorAction::Failed, Some(error)) => format!(": {}", error),
        (MirrorAction::Skipped, _) => format!(" ({})", result.message),
        _ if result.message.is_empty() => String::new(),
        _ => format!(" ({})", result.message),
    };
    format!("{:8} {}{}", result.action.label(), result.repository.full_name, detail)
}
