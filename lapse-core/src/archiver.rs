use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Local, NaiveDate, NaiveDateTime, Timelike};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::catalog::CaptureCatalog;
use crate::config::LapseConfig;
use crate::generator::Clock;
use crate::media::{write_concat_list, CommandExecutor, MediaCommand, MediaError, MediaTools};
use crate::sentinel::{ArtifactState, SentinelPair};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("upload of {key} failed: {message}")]
    Upload { key: String, message: String },
}

type ArchiveResult<T> = std::result::Result<T, ArchiveError>;

/// Cold object storage collaborator: one key, one local file, one
/// storage tier decided by the implementation.
#[async_trait::async_trait]
pub trait ColdStorage: Send + Sync {
    async fn upload(&self, key: &str, path: &Path) -> ArchiveResult<()>;
}

/// Ships archives with an S3-compatible command-line client.
pub struct S3CliStorage {
    bucket: String,
    storage_class: String,
    executor: Arc<dyn CommandExecutor>,
}

impl S3CliStorage {
    pub fn new(bucket: String, storage_class: String, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            bucket,
            storage_class,
            executor,
        }
    }
}

#[async_trait::async_trait]
impl ColdStorage for S3CliStorage {
    async fn upload(&self, key: &str, path: &Path) -> ArchiveResult<()> {
        let command = MediaCommand::new("aws")
            .args(["s3", "cp"])
            .arg(path.to_string_lossy())
            .arg(format!("s3://{}/{}", self.bucket, key))
            .args(["--storage-class", &self.storage_class]);
        let mut process = tokio::process::Command::new(&command.program);
        process.args(&command.args);
        let output = self
            .executor
            .run(&mut process)
            .await
            .map_err(|err| ArchiveError::Upload {
                key: key.to_string(),
                message: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(ArchiveError::Upload {
                key: key.to_string(),
                message: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub eligible_dates: usize,
    pub pending_cells: usize,
    pub generated: bool,
}

/// Rolls raw footage into hourly archives. Unlike the timelapse
/// generator, an errored cell is terminal: the operator removes the
/// `.err` sentinel to request another attempt.
pub struct Archiver {
    catalog: CaptureCatalog,
    tools: Arc<MediaTools>,
    config: Arc<LapseConfig>,
    storage: Option<Arc<dyn ColdStorage>>,
    clock: Clock,
    cooldown: StdDuration,
}

impl Archiver {
    pub fn new(catalog: CaptureCatalog, tools: Arc<MediaTools>, config: Arc<LapseConfig>) -> Self {
        let cooldown = StdDuration::from_secs(config.archiver.cooldown_seconds);
        Self {
            catalog,
            tools,
            config,
            storage: None,
            clock: Arc::new(|| Local::now().naive_local()),
            cooldown,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn ColdStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cooldown(mut self, cooldown: StdDuration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn archive_output_path(&self, date: NaiveDate, hour: u32) -> PathBuf {
        self.config.archive_dir().join(format!(
            "archive-{}_{:02}.{}",
            date.format("%Y%m%d"),
            hour,
            self.config.archiver.extension
        ))
    }

    /// Archives one (date, hour) cell. Skips when either sentinel exists;
    /// there is no automatic retry after an error here.
    pub async fn generate_archive(
        &self,
        date: NaiveDate,
        hour: u32,
        read_only: bool,
        compress: bool,
    ) -> bool {
        let output = self.archive_output_path(date, hour);
        let sentinels = SentinelPair::for_archive(&output);
        if sentinels.inspect() != ArtifactState::Pending {
            return false;
        }

        match self
            .try_generate(date, hour, &output, read_only, compress)
            .await
        {
            Ok(generated) => generated,
            Err(err) => {
                error!(date = %date, hour, error = %err, "archive generation failed");
                if let Err(io_err) = sentinels.write_error(&err.to_string()) {
                    error!(sentinel = %sentinels.err.display(), error = %io_err, "could not write error sentinel");
                }
                false
            }
        }
    }

    async fn try_generate(
        &self,
        date: NaiveDate,
        hour: u32,
        output: &Path,
        read_only: bool,
        compress: bool,
    ) -> ArchiveResult<bool> {
        let candidates: Vec<PathBuf> = self
            .catalog
            .list_raw_captures()
            .into_iter()
            .filter(|capture| {
                capture.captured_at.date() == date && capture.captured_at.hour() == hour
            })
            .map(|capture| capture.path)
            .collect();
        if candidates.is_empty() {
            return Ok(false);
        }

        let good = self.select_good(&candidates, read_only).await?;
        if good.is_empty() {
            warn!(date = %date, hour, "no playable captures left for archive cell");
            return Ok(false);
        }

        let work = self.work_dir()?;
        let produced = work.path().join(output.file_name().unwrap_or_default());
        let command = if compress {
            self.tools
                .archive_compress_command(&good, &produced, &self.config.archiver)
        } else {
            let list_file = work.path().join("concat.txt");
            write_concat_list(&list_file, &good)?;
            self.tools.concat_command(&list_file, &produced)
        };

        if read_only {
            info!(command = %command, "read-only: validated archive command");
            return Ok(true);
        }

        self.tools.run(&command).await?;
        if !self.tools.probe_ok(&produced).await? {
            return Err(MediaError::Verification {
                path: produced.clone(),
            }
            .into());
        }

        let file_name = output
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        if self.config.archiver.upload_enabled {
            if let Some(storage) = &self.storage {
                let key = format!("{}/{}", date.format("%Y/%m/%d"), file_name);
                storage.upload(&key, &produced).await?;
                info!(key, "archive uploaded to cold storage");
            }
        }

        let staged = self.config.staging_dir().join(&file_name);
        self.relocate(&produced, &staged)?;

        // Raw sources go first so a `Done` cell never coexists with its
        // captures; a crash in between leaves the cell pending and empty.
        for path in &good {
            std::fs::remove_file(path).map_err(|source| ArchiveError::Io {
                path: path.clone(),
                source,
            })?;
        }
        let sentinels = SentinelPair::for_archive(output);
        sentinels
            .write_done_marker()
            .map_err(|source| ArchiveError::Io {
                path: sentinels.done.clone(),
                source,
            })?;
        info!(output = %staged.display(), inputs = good.len(), "archive cell completed");
        Ok(true)
    }

    /// One incremental pass: look only at dates past the archive horizon,
    /// process cells in date-then-hour order and stop after the first
    /// cell that actually produced an archive.
    pub async fn archive(&self, read_only: bool, compress: bool) -> ArchiveReport {
        let mut report = ArchiveReport::default();
        let now = (self.clock)();
        let horizon = Duration::hours(self.config.archiver.horizon_hours);

        let dates: BTreeSet<NaiveDate> = self
            .catalog
            .list_raw_captures()
            .into_iter()
            .map(|capture| capture.captured_at.date())
            .filter(|date| past_horizon(*date, now, horizon))
            .collect();
        report.eligible_dates = dates.len();

        let mut pending: Vec<(NaiveDate, u32)> = Vec::new();
        for date in &dates {
            for hour in 0..24 {
                let output = self.archive_output_path(*date, hour);
                if SentinelPair::for_archive(&output).inspect() == ArtifactState::Pending {
                    pending.push((*date, hour));
                }
            }
        }
        report.pending_cells = pending.len();
        info!(
            eligible_dates = report.eligible_dates,
            pending_cells = report.pending_cells,
            "archive pass starting"
        );

        for (date, hour) in pending {
            if self.generate_archive(date, hour, read_only, compress).await {
                report.generated = true;
                // Cede the rest of the backlog to the next invocation.
                if !self.cooldown.is_zero() {
                    sleep(self.cooldown).await;
                }
                break;
            }
        }
        report
    }

    async fn select_good(
        &self,
        candidates: &[PathBuf],
        read_only: bool,
    ) -> ArchiveResult<Vec<PathBuf>> {
        let mut good = Vec::with_capacity(candidates.len());
        for path in candidates {
            if self.tools.probe_ok(path).await? {
                good.push(path.clone());
                continue;
            }
            warn!(path = %path.display(), "capture failed playability probe");
            if !read_only {
                self.quarantine(path)?;
            }
        }
        Ok(good)
    }

    fn quarantine(&self, path: &Path) -> ArchiveResult<()> {
        let quarantine_dir = self.config.quarantine_dir();
        std::fs::create_dir_all(&quarantine_dir).map_err(|source| ArchiveError::Io {
            path: quarantine_dir.clone(),
            source,
        })?;
        let target = quarantine_dir.join(path.file_name().unwrap_or_default());
        std::fs::rename(path, &target).map_err(|source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(from = %path.display(), to = %target.display(), "quarantined corrupt capture");
        Ok(())
    }

    fn work_dir(&self) -> ArchiveResult<tempfile::TempDir> {
        let tmp_dir = self.config.tmp_dir();
        std::fs::create_dir_all(&tmp_dir).map_err(|source| ArchiveError::Io {
            path: tmp_dir.clone(),
            source,
        })?;
        tempfile::Builder::new()
            .prefix("lapse-archive-")
            .tempdir_in(&tmp_dir)
            .map_err(|source| ArchiveError::Io {
                path: tmp_dir,
                source,
            })
    }

    fn relocate(&self, from: &Path, to: &Path) -> ArchiveResult<()> {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ArchiveError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::rename(from, to).map_err(|source| ArchiveError::Io {
            path: to.to_path_buf(),
            source,
        })
    }
}

/// A date is archivable once its midnight is older than the horizon, so
/// archiving never races with ingestion or the timelapse backlog.
fn past_horizon(date: NaiveDate, now: NaiveDateTime, horizon: Duration) -> bool {
    let midnight = date.and_hms_opt(0, 0, 0).expect("midnight is always valid");
    now.signed_duration_since(midnight) > horizon
}
