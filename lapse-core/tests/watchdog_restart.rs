mod support;

use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use tempfile::TempDir;

use lapse_core::watchdog::{
    CaptureWatchdog, ProcessRecord, ProcessScanner, TaskScheduler, WatchdogAction, WatchdogResult,
};
use lapse_core::{CaptureCatalog, EngineStore};
use support::{test_config, write_chunk};

#[derive(Default)]
struct FakeScanner {
    records: Vec<ProcessRecord>,
    killed: Mutex<Vec<u32>>,
}

impl ProcessScanner for FakeScanner {
    fn list_own_processes(&self) -> WatchdogResult<Vec<ProcessRecord>> {
        Ok(self.records.clone())
    }

    fn force_kill(&self, pid: u32) -> WatchdogResult<()> {
        self.killed.lock().unwrap().push(pid);
        Ok(())
    }
}

#[derive(Default)]
struct FakeScheduler {
    revoked: Mutex<Vec<String>>,
}

impl TaskScheduler for FakeScheduler {
    fn revoke(&self, handle: &str) -> WatchdogResult<()> {
        self.revoked.lock().unwrap().push(handle.to_string());
        Ok(())
    }
}

fn build_watchdog(
    base: &TempDir,
    scanner: Arc<FakeScanner>,
    scheduler: Arc<FakeScheduler>,
) -> (CaptureWatchdog, EngineStore, lapse_core::LapseConfig) {
    let config = test_config(base.path());
    let store = EngineStore::new(config.data_dir().join("engine.sqlite"));
    store.initialize().unwrap();
    let watchdog = CaptureWatchdog::new(
        CaptureCatalog::new(config.raw_dir()),
        store.clone(),
        config.watchdog.clone(),
        Some(scanner),
        Some(scheduler),
    );
    (watchdog, store, config)
}

fn ingestion_process(pid: u32) -> ProcessRecord {
    ProcessRecord {
        pid,
        command_line: "ffmpeg -rtsp_transport tcp -i rtsp://camera.test/stream -f segment".into(),
    }
}

#[test]
fn healthy_drift_takes_no_action() {
    let base = TempDir::new().unwrap();
    let scanner = Arc::new(FakeScanner {
        records: vec![ingestion_process(101)],
        killed: Mutex::default(),
    });
    let scheduler = Arc::new(FakeScheduler::default());
    let (watchdog, store, config) = build_watchdog(&base, scanner.clone(), scheduler);
    // Chunk written just now, mtime is fresh.
    write_chunk(&config, "s1", "out-20240601T0005.mp4");

    let report = watchdog.run(true, true);
    assert!(!report.stalled);
    assert!(report.actions.is_empty());
    assert!(scanner.killed.lock().unwrap().is_empty());
    assert_eq!(store.restart_count().unwrap(), 0);
}

#[test]
fn stale_capture_kills_only_matching_processes() {
    let base = TempDir::new().unwrap();
    let scanner = Arc::new(FakeScanner {
        records: vec![
            ingestion_process(101),
            ProcessRecord {
                pid: 202,
                command_line: "ffmpeg -i other.mp4 transcode.mp4".into(),
            },
            ProcessRecord {
                pid: 303,
                command_line: "sshd: operator@pts/0".into(),
            },
        ],
        killed: Mutex::default(),
    });
    let scheduler = Arc::new(FakeScheduler::default());
    let (watchdog, store, config) = build_watchdog(&base, scanner.clone(), scheduler);
    write_chunk(&config, "s1", "out-20240601T0005.mp4");

    // The chunk's mtime is "now"; move the clock past the drift limit.
    let watchdog = watchdog.with_clock(Arc::new(|| Utc::now() + Duration::hours(1)));
    let report = watchdog.run(true, false);
    assert!(report.stalled);
    assert_eq!(report.actions, vec![WatchdogAction::KilledProcess(101)]);
    assert_eq!(*scanner.killed.lock().unwrap(), vec![101]);
    assert_eq!(store.restart_count().unwrap(), 1);
    assert_eq!(report.restart_count, 1);
}

#[test]
fn stop_flag_forces_task_revocation() {
    let base = TempDir::new().unwrap();
    let scanner = Arc::new(FakeScanner::default());
    let scheduler = Arc::new(FakeScheduler::default());
    let (watchdog, store, config) = build_watchdog(&base, scanner, scheduler.clone());
    write_chunk(&config, "s1", "out-20240601T0005.mp4");
    store.set_task_handle("capture:4242").unwrap();
    store.set_stop_flag().unwrap();

    // Drift itself is fine; the stop flag alone marks the pipeline bad.
    let report = watchdog.run(false, true);
    assert!(report.stalled);
    assert_eq!(
        report.actions,
        vec![WatchdogAction::RevokedTask("capture:4242".into())]
    );
    assert_eq!(*scheduler.revoked.lock().unwrap(), vec!["capture:4242"]);
    assert!(!store.stop_flag().unwrap());
    assert_eq!(store.restart_count().unwrap(), 1);
}

#[test]
fn both_restart_paths_can_fire_in_one_invocation() {
    let base = TempDir::new().unwrap();
    let scanner = Arc::new(FakeScanner {
        records: vec![ingestion_process(101)],
        killed: Mutex::default(),
    });
    let scheduler = Arc::new(FakeScheduler::default());
    let (watchdog, store, config) = build_watchdog(&base, scanner.clone(), scheduler.clone());
    write_chunk(&config, "s1", "out-20240601T0005.mp4");
    store.set_task_handle("capture:4242").unwrap();

    let watchdog = watchdog.with_clock(Arc::new(|| Utc::now() + Duration::hours(1)));
    let report = watchdog.run(true, true);
    assert_eq!(report.actions.len(), 2);
    assert_eq!(store.restart_count().unwrap(), 2);
}

#[test]
fn missing_task_handle_is_only_an_observation() {
    let base = TempDir::new().unwrap();
    let scanner = Arc::new(FakeScanner::default());
    let scheduler = Arc::new(FakeScheduler::default());
    let (watchdog, store, _config) = build_watchdog(&base, scanner, scheduler.clone());

    // No captures at all counts as stalled, but with no handle there is
    // nothing to revoke and the watchdog must not fail.
    let report = watchdog.run(false, true);
    assert!(report.stalled);
    assert!(report.actions.is_empty());
    assert!(scheduler.revoked.lock().unwrap().is_empty());
    assert_eq!(store.restart_count().unwrap(), 0);
}
