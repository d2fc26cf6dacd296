use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("capture name does not match out-<YYYYMMDDTHHMM>.<ext>: {0}")]
    MalformedName(String),
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// One fixed-duration chunk written by the external ingestion process.
/// Read-only to the engine except during archiving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCapture {
    pub path: PathBuf,
    pub captured_at: NaiveDateTime,
}

fn capture_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^out-(\d{8}T\d{4})\.\w+$").unwrap())
}

/// Parses the capture timestamp out of a chunk filename. Fails fast on
/// anything that does not match the ingestion naming scheme.
pub fn parse_capture_timestamp(path: &Path) -> CatalogResult<NaiveDateTime> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| CatalogError::MalformedName(path.display().to_string()))?;
    let captures = capture_name_pattern()
        .captures(name)
        .ok_or_else(|| CatalogError::MalformedName(name.to_string()))?;
    NaiveDateTime::parse_from_str(&captures[1], "%Y%m%dT%H%M")
        .map_err(|_| CatalogError::MalformedName(name.to_string()))
}

/// Time-ordered view over the raw-capture directory tree. Sessions are
/// subdirectories; ordering by path matches capture order given the
/// wall-clock naming scheme.
#[derive(Debug, Clone)]
pub struct CaptureCatalog {
    raw_dir: PathBuf,
}

impl CaptureCatalog {
    pub fn new<P: Into<PathBuf>>(raw_dir: P) -> Self {
        Self {
            raw_dir: raw_dir.into(),
        }
    }

    pub fn raw_dir(&self) -> &Path {
        &self.raw_dir
    }

    /// All parseable captures exactly one session directory below the
    /// raw root, ascending by path. Non-regular files and names outside
    /// the pattern are skipped, not fatal.
    pub fn list_raw_captures(&self) -> Vec<RawCapture> {
        let mut captures: Vec<RawCapture> = WalkDir::new(&self.raw_dir)
            .min_depth(2)
            .max_depth(2)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let path = entry.into_path();
                let captured_at = parse_capture_timestamp(&path).ok()?;
                Some(RawCapture { path, captured_at })
            })
            .collect();
        captures.sort_by(|a, b| a.path.cmp(&b.path));
        captures
    }

    pub fn raw_count(&self) -> usize {
        self.list_raw_captures().len()
    }

    /// Timestamp of the newest capture, completed or not.
    pub fn raw_last_at(&self) -> Option<NaiveDateTime> {
        self.list_raw_captures()
            .last()
            .map(|capture| capture.captured_at)
    }

    /// Timestamp of the newest capture guaranteed to be fully written.
    /// The last chunk is excluded because the ingestion process flushes a
    /// chunk only when the next one starts.
    pub fn last_completed_capture(&self) -> Option<NaiveDateTime> {
        let captures = self.list_raw_captures();
        if captures.len() < 2 {
            return None;
        }
        captures
            .get(captures.len() - 2)
            .map(|capture| capture.captured_at)
    }

    /// Filesystem modification time of the newest capture, used by the
    /// watchdog: the filename timestamp lags true write completion.
    pub fn last_capture_mtime(&self) -> CatalogResult<Option<DateTime<Utc>>> {
        let captures = self.list_raw_captures();
        let Some(last) = captures.last() else {
            return Ok(None);
        };
        let metadata = std::fs::metadata(&last.path).map_err(|source| CatalogError::Io {
            path: last.path.clone(),
            source,
        })?;
        let modified = metadata.modified().map_err(|source| CatalogError::Io {
            path: last.path.clone(),
            source,
        })?;
        Ok(Some(system_time_to_utc(modified)))
    }
}

fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}
