use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sysinfo::{get_current_pid, ProcessRefreshKind, RefreshKind, Signal, System};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::catalog::CaptureCatalog;
use crate::config::WatchdogSection;
use crate::store::EngineStore;

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("catalog error: {0}")]
    Catalog(#[from] crate::catalog::CatalogError),
    #[error("process inspection failed: {0}")]
    Scan(String),
}

pub type WatchdogResult<T> = std::result::Result<T, WatchdogError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub command_line: String,
}

/// Heuristic OS process discovery is racy and platform-dependent, so it
/// sits behind this seam with one production implementation.
pub trait ProcessScanner: Send + Sync {
    /// Processes owned by the engine's own user.
    fn list_own_processes(&self) -> WatchdogResult<Vec<ProcessRecord>>;
    fn force_kill(&self, pid: u32) -> WatchdogResult<()>;
}

#[derive(Debug, Default)]
pub struct SysinfoScanner;

impl ProcessScanner for SysinfoScanner {
    fn list_own_processes(&self) -> WatchdogResult<Vec<ProcessRecord>> {
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
        );
        let own_pid = get_current_pid().map_err(|err| WatchdogError::Scan(err.to_string()))?;
        let own_uid = system
            .process(own_pid)
            .and_then(|process| process.user_id())
            .cloned();
        let records = system
            .processes()
            .iter()
            .filter(|(pid, process)| {
                **pid != own_pid && process.user_id().cloned() == own_uid
            })
            .map(|(pid, process)| ProcessRecord {
                pid: pid.as_u32(),
                command_line: process.cmd().join(" "),
            })
            .collect();
        Ok(records)
    }

    fn force_kill(&self, pid: u32) -> WatchdogResult<()> {
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
        );
        let process = system
            .process(sysinfo::Pid::from_u32(pid))
            .ok_or_else(|| WatchdogError::Scan(format!("pid {pid} not found")))?;
        if process.kill_with(Signal::Kill).unwrap_or(false) {
            Ok(())
        } else {
            Err(WatchdogError::Scan(format!("pid {pid} refused SIGKILL")))
        }
    }
}

/// External scheduler seam: forceful cancellation of a supervised task
/// identified by the handle the receiver registered.
pub trait TaskScheduler: Send + Sync {
    fn revoke(&self, handle: &str) -> WatchdogResult<()>;
}

/// Task handles published by the receiver carry the capture process id,
/// so revocation maps to a forced kill of that process.
pub struct ProcessTaskScheduler {
    scanner: Arc<dyn ProcessScanner>,
}

impl ProcessTaskScheduler {
    pub fn new(scanner: Arc<dyn ProcessScanner>) -> Self {
        Self { scanner }
    }
}

impl TaskScheduler for ProcessTaskScheduler {
    fn revoke(&self, handle: &str) -> WatchdogResult<()> {
        let pid = handle
            .rsplit(':')
            .next()
            .and_then(|raw| raw.parse::<u32>().ok())
            .ok_or_else(|| WatchdogError::Scan(format!("unparseable task handle {handle}")))?;
        self.scanner.force_kill(pid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogAction {
    KilledProcess(u32),
    RevokedTask(String),
}

#[derive(Debug, Clone, Default)]
pub struct WatchdogReport {
    pub drift_seconds: Option<i64>,
    pub stalled: bool,
    pub restart_count: i64,
    pub actions: Vec<WatchdogAction>,
    pub observations: Vec<String>,
}

/// Bad drift means the ingestion pipeline is not writing: either its
/// output is older than the allowed maximum or an operator raised the
/// stop flag. Both disjuncts force a restart on their own.
pub fn is_bad_drift(
    now: DateTime<Utc>,
    last_write: Option<DateTime<Utc>>,
    max_drift: Duration,
    stop_flag: bool,
) -> bool {
    if stop_flag {
        return true;
    }
    match last_write {
        Some(last) => now.signed_duration_since(last) > max_drift,
        None => true,
    }
}

pub type UtcClock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Supervises the health of the external ingestion pipeline. Must never
/// crash the scheduler that invokes it, so every failure is absorbed into
/// the report.
pub struct CaptureWatchdog {
    catalog: CaptureCatalog,
    store: EngineStore,
    section: WatchdogSection,
    scanner: Arc<dyn ProcessScanner>,
    scheduler: Arc<dyn TaskScheduler>,
    clock: UtcClock,
}

impl CaptureWatchdog {
    pub fn new(
        catalog: CaptureCatalog,
        store: EngineStore,
        section: WatchdogSection,
        scanner: Option<Arc<dyn ProcessScanner>>,
        scheduler: Option<Arc<dyn TaskScheduler>>,
    ) -> Self {
        let scanner = scanner.unwrap_or_else(|| Arc::new(SysinfoScanner));
        let scheduler = scheduler
            .unwrap_or_else(|| Arc::new(ProcessTaskScheduler::new(Arc::clone(&scanner))));
        Self {
            catalog,
            store,
            section,
            scanner,
            scheduler,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: UtcClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn run(&self, use_process_restart: bool, use_task_restart: bool) -> WatchdogReport {
        let mut report = WatchdogReport::default();
        let now = (self.clock)();

        let stop_flag = match self.store.stop_flag() {
            Ok(flag) => flag,
            Err(err) => {
                error!(error = %err, "could not read stop flag");
                report.observations.push(format!("stop flag unreadable: {err}"));
                false
            }
        };
        if stop_flag {
            report.observations.push("stop flag is set".into());
        }

        let last_write = match self.catalog.last_capture_mtime() {
            Ok(mtime) => mtime,
            Err(err) => {
                error!(error = %err, "could not stat last capture");
                report.observations.push(format!("last capture unreadable: {err}"));
                None
            }
        };
        report.drift_seconds =
            last_write.map(|last| now.signed_duration_since(last).num_seconds());

        let max_drift = Duration::minutes(self.section.max_drift_minutes);
        report.stalled = is_bad_drift(now, last_write, max_drift, stop_flag);
        if !report.stalled {
            report.restart_count = self.store.restart_count().unwrap_or(0);
            return report;
        }
        warn!(
            drift_seconds = report.drift_seconds,
            stop_flag, "capture pipeline looks stalled"
        );

        if use_process_restart {
            self.restart_process(&mut report);
        }
        if use_task_restart {
            self.restart_task(&mut report);
        }
        report.restart_count = self.store.restart_count().unwrap_or(0);
        report
    }

    fn restart_process(&self, report: &mut WatchdogReport) {
        let records = match self.scanner.list_own_processes() {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "process scan failed");
                report.observations.push(format!("process scan failed: {err}"));
                return;
            }
        };
        for record in records {
            if !(record.command_line.contains(&self.section.process_marker)
                && record.command_line.contains(&self.section.transport_flag))
            {
                continue;
            }
            if let Err(err) = self.store.incr_restart_count() {
                error!(error = %err, "could not bump restart counter");
            }
            match self.scanner.force_kill(record.pid) {
                Ok(()) => {
                    info!(pid = record.pid, "killed stalled capture process");
                    report.actions.push(WatchdogAction::KilledProcess(record.pid));
                }
                Err(err) => {
                    error!(pid = record.pid, error = %err, "could not kill capture process");
                    report
                        .observations
                        .push(format!("kill of pid {} failed: {err}", record.pid));
                }
            }
        }
    }

    fn restart_task(&self, report: &mut WatchdogReport) {
        let handle = match self.store.task_handle() {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                report.observations.push("no active capture task handle".into());
                return;
            }
            Err(err) => {
                error!(error = %err, "could not read task handle");
                report.observations.push(format!("task handle unreadable: {err}"));
                return;
            }
        };
        if let Err(err) = self.store.clear_stop_flag() {
            error!(error = %err, "could not clear stop flag");
        }
        if let Err(err) = self.store.incr_restart_count() {
            error!(error = %err, "could not bump restart counter");
        }
        match self.scheduler.revoke(&handle) {
            Ok(()) => {
                info!(handle, "revoked stalled capture task");
                report.actions.push(WatchdogAction::RevokedTask(handle));
            }
            Err(err) => {
                error!(handle, error = %err, "task revocation failed");
                report
                    .observations
                    .push(format!("revocation of {handle} failed: {err}"));
            }
        }
    }
}
