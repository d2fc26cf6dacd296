use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::LapseConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub kept: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Trims the staging directory of already-archived files to the newest
/// `keep`, by name order (which matches time order for archive names).
pub struct RetentionCleaner {
    config: Arc<LapseConfig>,
}

impl RetentionCleaner {
    pub fn new(config: Arc<LapseConfig>) -> Self {
        Self { config }
    }

    pub fn cleanup(&self, read_only: bool) -> CleanupReport {
        let mut report = CleanupReport::default();
        let staging_dir = self.config.staging_dir();
        let mut staged: Vec<PathBuf> = match std::fs::read_dir(&staging_dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
                .map(|entry| entry.path())
                .collect(),
            Err(err) => {
                warn!(dir = %staging_dir.display(), error = %err, "staging directory not readable");
                return report;
            }
        };
        staged.sort();

        let keep = self.config.archiver.keep;
        let excess = staged.len().saturating_sub(keep);
        report.kept = staged.len() - excess;
        for path in staged.into_iter().take(excess) {
            if read_only {
                info!(path = %path.display(), "read-only: would delete staged archive");
                report.deleted += 1;
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "deleted staged archive past retention");
                    report.deleted += 1;
                }
                Err(err) => {
                    // Skipped, not fatal; the next pass retries.
                    warn!(path = %path.display(), error = %err, "could not delete staged archive");
                    report.failed += 1;
                }
            }
        }
        report
    }
}
