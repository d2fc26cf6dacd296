use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Local, NaiveDate, NaiveDateTime, Timelike};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::catalog::CaptureCatalog;
use crate::config::LapseConfig;
use crate::media::{write_concat_list, MediaError, MediaTools};
use crate::sentinel::{ArtifactState, SentinelPair};
use crate::slot::{Slot, SLOTS_PER_DAY};

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("simulated failure requested")]
    Simulated,
}

type GeneratorResult<T> = std::result::Result<T, GeneratorError>;

pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratorReport {
    pub slots_generated: usize,
    pub dailies_generated: usize,
}

/// Idempotent per-slot and per-day timelapse synthesis. All job state
/// lives in the timelapse directory: a finished video means done, an
/// `.err` sentinel means the last attempt failed and the next invocation
/// retries.
pub struct TimelapseGenerator {
    catalog: CaptureCatalog,
    tools: Arc<MediaTools>,
    config: Arc<LapseConfig>,
    clock: Clock,
    cooldown: StdDuration,
}

impl TimelapseGenerator {
    pub fn new(catalog: CaptureCatalog, tools: Arc<MediaTools>, config: Arc<LapseConfig>) -> Self {
        let cooldown = StdDuration::from_secs(config.generator.cooldown_seconds);
        Self {
            catalog,
            tools,
            config,
            clock: Arc::new(|| Local::now().naive_local()),
            cooldown,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cooldown(mut self, cooldown: StdDuration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn slot_output_path(&self, date: NaiveDate, slot: u8) -> PathBuf {
        self.config.timelapse_dir().join(format!(
            "timelapse-slots-{}_{}.{}",
            date.format("%Y%m%d"),
            slot,
            self.config.generator.extension
        ))
    }

    pub fn daily_output_path(&self, date: NaiveDate) -> PathBuf {
        self.config.timelapse_dir().join(format!(
            "timelapse-daily-{}.{}",
            date.format("%Y%m%d"),
            self.config.generator.extension
        ))
    }

    /// Produces the timelapse for one (date, slot) cell. Returns whether
    /// work was performed; an existing finished video short-circuits to
    /// `false`. Failures are absorbed into the `.err` sentinel so a
    /// backlog scan is never aborted by one bad cell.
    pub async fn produce_slot_timelapse(
        &self,
        date: NaiveDate,
        slot: u8,
        read_only: bool,
        simulate_failure: bool,
    ) -> bool {
        let output = self.slot_output_path(date, slot);
        let sentinels = SentinelPair::for_output(&output);
        match sentinels.inspect() {
            ArtifactState::Done => return false,
            ArtifactState::Errored => {
                // Every invocation is a fresh retry attempt.
                if let Err(err) = sentinels.clear_error() {
                    warn!(output = %output.display(), error = %err, "could not clear error sentinel");
                }
            }
            ArtifactState::Pending => {}
        }

        match self
            .try_produce_slot(date, slot, &output, read_only, simulate_failure)
            .await
        {
            Ok(produced) => produced,
            Err(err) => {
                error!(date = %date, slot, error = %err, "slot timelapse generation failed");
                self.record_failure(&sentinels, &err);
                false
            }
        }
    }

    async fn try_produce_slot(
        &self,
        date: NaiveDate,
        slot: u8,
        output: &PathBuf,
        read_only: bool,
        simulate_failure: bool,
    ) -> GeneratorResult<bool> {
        if simulate_failure {
            return Err(GeneratorError::Simulated);
        }

        let candidates: Vec<PathBuf> = self
            .catalog
            .list_raw_captures()
            .into_iter()
            .filter(|capture| {
                capture.captured_at.date() == date
                    && Slot::new(date, slot).covers_hour(capture.captured_at.hour())
            })
            .map(|capture| capture.path)
            .collect();
        if candidates.is_empty() {
            return Ok(false);
        }

        let good = self.select_good(&candidates, read_only, true).await?;
        if good.is_empty() {
            warn!(date = %date, slot, "no playable captures left for slot");
            return Ok(false);
        }

        if read_only {
            info!(output = %output.display(), inputs = good.len(), "read-only: would generate slot timelapse");
            return Ok(true);
        }

        let work = self.work_dir("lapse-slot-")?;
        let list_file = work.path().join("concat.txt");
        write_concat_list(&list_file, &good)?;
        let joined = work
            .path()
            .join(format!("joined.{}", self.config.capture.extension));
        self.tools
            .run(&self.tools.concat_command(&list_file, &joined))
            .await?;
        let encoded = work.path().join(output.file_name().unwrap_or_default());
        self.tools
            .run(&self.tools.timelapse_encode_command(&joined, &encoded, &self.config.generator))
            .await?;
        self.relocate(&encoded, output)?;
        info!(output = %output.display(), inputs = good.len(), "slot timelapse generated");
        Ok(true)
    }

    /// Produces the daily timelapse by composing the already sped-up slot
    /// videos of that date. Same contract as the slot variant.
    pub async fn produce_daily_timelapse(
        &self,
        date: NaiveDate,
        read_only: bool,
        simulate_failure: bool,
    ) -> bool {
        let output = self.daily_output_path(date);
        let sentinels = SentinelPair::for_output(&output);
        match sentinels.inspect() {
            ArtifactState::Done => return false,
            ArtifactState::Errored => {
                if let Err(err) = sentinels.clear_error() {
                    warn!(output = %output.display(), error = %err, "could not clear error sentinel");
                }
            }
            ArtifactState::Pending => {}
        }

        match self
            .try_produce_daily(date, &output, read_only, simulate_failure)
            .await
        {
            Ok(produced) => produced,
            Err(err) => {
                error!(date = %date, error = %err, "daily timelapse generation failed");
                self.record_failure(&sentinels, &err);
                false
            }
        }
    }

    async fn try_produce_daily(
        &self,
        date: NaiveDate,
        output: &PathBuf,
        read_only: bool,
        simulate_failure: bool,
    ) -> GeneratorResult<bool> {
        if simulate_failure {
            return Err(GeneratorError::Simulated);
        }

        let candidates: Vec<PathBuf> = (1..=SLOTS_PER_DAY)
            .map(|slot| self.slot_output_path(date, slot))
            .filter(|path| path.is_file())
            .collect();
        if candidates.is_empty() {
            return Ok(false);
        }

        // Slot videos are this engine's own outputs; a corrupt one is
        // excluded from the daily cut but left in place for the operator.
        let good = self.select_good(&candidates, read_only, false).await?;
        if good.is_empty() {
            warn!(date = %date, "no playable slot videos for daily timelapse");
            return Ok(false);
        }

        if read_only {
            info!(output = %output.display(), inputs = good.len(), "read-only: would generate daily timelapse");
            return Ok(true);
        }

        let work = self.work_dir("lapse-daily-")?;
        let list_file = work.path().join("concat.txt");
        write_concat_list(&list_file, &good)?;
        let joined = work.path().join(output.file_name().unwrap_or_default());
        self.tools
            .run(&self.tools.concat_command(&list_file, &joined))
            .await?;
        self.relocate(&joined, output)?;
        info!(output = %output.display(), inputs = good.len(), "daily timelapse generated");
        Ok(true)
    }

    /// Drives the generator across the whole backlog: one hourly pass
    /// from the first capture to the last completed one, then a daily
    /// pass over the dates touched (excluding today).
    pub async fn check_timelapses(&self, read_only: bool, simulate_failure: bool) -> GeneratorReport {
        let mut report = GeneratorReport::default();
        let captures = self.catalog.list_raw_captures();
        let (Some(first), Some(last_at)) =
            (captures.first(), self.catalog.last_completed_capture())
        else {
            info!("fewer than two raw captures, nothing to generate");
            return report;
        };

        let now = (self.clock)();
        let current_slot = Slot::containing(now);
        let grace = Duration::minutes(self.config.generator.grace_minutes);

        let mut touched: BTreeSet<NaiveDate> = BTreeSet::new();
        let mut hour = truncate_to_hour(first.captured_at);
        let end = truncate_to_hour(last_at);
        while hour <= end {
            let slot = Slot::containing(hour);
            if slot == current_slot {
                // Still accumulating captures for this slot.
                hour += Duration::hours(1);
                continue;
            }
            if last_at.signed_duration_since(hour) < grace {
                // The chunks for this hour may still be mid-write.
                hour += Duration::hours(1);
                continue;
            }
            touched.insert(hour.date());
            if self
                .produce_slot_timelapse(hour.date(), slot.index, read_only, simulate_failure)
                .await
            {
                report.slots_generated += 1;
                self.pause().await;
            }
            hour += Duration::hours(1);
        }

        for date in touched {
            if date == now.date() {
                continue;
            }
            if self
                .produce_daily_timelapse(date, read_only, simulate_failure)
                .await
            {
                report.dailies_generated += 1;
                self.pause().await;
            }
        }
        report
    }

    /// Splits candidates into playable and corrupt; corrupt raw files go
    /// to the quarantine directory unless running read-only.
    async fn select_good(
        &self,
        candidates: &[PathBuf],
        read_only: bool,
        quarantine_bad: bool,
    ) -> GeneratorResult<Vec<PathBuf>> {
        let mut good = Vec::with_capacity(candidates.len());
        for path in candidates {
            if self.tools.probe_ok(path).await? {
                good.push(path.clone());
                continue;
            }
            warn!(path = %path.display(), "capture failed playability probe");
            if quarantine_bad && !read_only {
                self.quarantine(path)?;
            }
        }
        Ok(good)
    }

    fn quarantine(&self, path: &PathBuf) -> GeneratorResult<()> {
        let quarantine_dir = self.config.quarantine_dir();
        std::fs::create_dir_all(&quarantine_dir).map_err(|source| GeneratorError::Io {
            path: quarantine_dir.clone(),
            source,
        })?;
        let target = quarantine_dir.join(path.file_name().unwrap_or_default());
        std::fs::rename(path, &target).map_err(|source| GeneratorError::Io {
            path: path.clone(),
            source,
        })?;
        info!(from = %path.display(), to = %target.display(), "quarantined corrupt capture");
        Ok(())
    }

    fn work_dir(&self, prefix: &str) -> GeneratorResult<tempfile::TempDir> {
        let tmp_dir = self.config.tmp_dir();
        std::fs::create_dir_all(&tmp_dir).map_err(|source| GeneratorError::Io {
            path: tmp_dir.clone(),
            source,
        })?;
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&tmp_dir)
            .map_err(|source| GeneratorError::Io {
                path: tmp_dir,
                source,
            })
    }

    /// Atomic rename-after-temp-write; readers never observe a partial
    /// file in the timelapse directory.
    fn relocate(&self, from: &PathBuf, to: &PathBuf) -> GeneratorResult<()> {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent).map_err(|source| GeneratorError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::rename(from, to).map_err(|source| GeneratorError::Io {
            path: to.clone(),
            source,
        })
    }

    fn record_failure(&self, sentinels: &SentinelPair, err: &GeneratorError) {
        if let Err(io_err) = sentinels.write_error(&err.to_string()) {
            error!(sentinel = %sentinels.err.display(), error = %io_err, "could not write error sentinel");
        }
    }

    async fn pause(&self) {
        if !self.cooldown.is_zero() {
            sleep(self.cooldown).await;
        }
    }
}

fn truncate_to_hour(at: NaiveDateTime) -> NaiveDateTime {
    at.date()
        .and_hms_opt(at.hour(), 0, 0)
        .expect("hour taken from a valid timestamp")
}
