use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

/// Job state of one artifact, read entirely from the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Pending,
    Done,
    Errored,
}

/// The two marker paths that encode an artifact's state.
#[derive(Debug, Clone)]
pub struct SentinelPair {
    pub done: PathBuf,
    pub err: PathBuf,
}

impl SentinelPair {
    /// Timelapse artifacts: the finished video itself is the done marker.
    pub fn for_output(output: &Path) -> Self {
        Self {
            done: output.to_path_buf(),
            err: sibling_with_suffix(output, "err"),
        }
    }

    /// Archive artifacts: a dedicated `.ok` marker, written only after
    /// the raw sources were verified and deleted.
    pub fn for_archive(output: &Path) -> Self {
        Self {
            done: sibling_with_suffix(output, "ok"),
            err: sibling_with_suffix(output, "err"),
        }
    }

    /// Single source of truth for artifact state. A done marker wins over
    /// a lingering error sentinel; the generator removes the latter
    /// before the next attempt.
    pub fn inspect(&self) -> ArtifactState {
        if self.done.exists() {
            ArtifactState::Done
        } else if self.err.exists() {
            ArtifactState::Errored
        } else {
            ArtifactState::Pending
        }
    }

    pub fn write_error(&self, failure: &str) -> std::io::Result<()> {
        let body = format!("{}\n{}\n", Utc::now().to_rfc3339(), failure);
        std::fs::write(&self.err, body)
    }

    pub fn write_done_marker(&self) -> std::io::Result<()> {
        std::fs::write(&self.done, format!("{}\n", Utc::now().to_rfc3339()))
    }

    /// Drops a stale error sentinel ahead of a retry attempt.
    pub fn clear_error(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.err) {
            Ok(()) => {
                debug!(sentinel = %self.err.display(), "cleared error sentinel before retry");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
