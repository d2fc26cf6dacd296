mod support;

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use tempfile::TempDir;

use lapse_core::{
    ArchiveReport, Archiver, CaptureCatalog, ColdStorage, MediaTools, RetentionCleaner,
};
use support::{fixed_clock, naive, test_config, write_chunk, ScriptedExecutor};

fn build_archiver(
    base: &TempDir,
) -> (Archiver, Arc<ScriptedExecutor>, lapse_core::LapseConfig) {
    let config = test_config(base.path());
    let executor = Arc::new(ScriptedExecutor::new());
    let tools = Arc::new(MediaTools::new(
        config.tools.clone(),
        executor.clone() as Arc<dyn lapse_core::CommandExecutor>,
    ));
    let archiver = Archiver::new(
        CaptureCatalog::new(config.raw_dir()),
        tools,
        Arc::new(config.clone()),
    )
    .with_cooldown(std::time::Duration::ZERO);
    (archiver, executor, config)
}

fn june_first() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
}

#[tokio::test]
async fn archive_pass_completes_one_cell_and_stops() {
    let base = TempDir::new().unwrap();
    let (archiver, _executor, config) = build_archiver(&base);
    let early_a = write_chunk(&config, "s1", "out-20240601T0005.mp4");
    let early_b = write_chunk(&config, "s1", "out-20240601T0015.mp4");
    let later = write_chunk(&config, "s1", "out-20240601T0305.mp4");

    let archiver = archiver.with_clock(fixed_clock(naive("2024-06-04 12:00:00")));
    let report = archiver.archive(false, true).await;
    assert_eq!(
        report,
        ArchiveReport {
            eligible_dates: 1,
            pending_cells: 24,
            generated: true
        }
    );

    // Hour 00 rolled up: staged output, ok sentinel, sources gone.
    assert!(config.staging_dir().join("archive-20240601_00.mkv").is_file());
    assert!(config.archive_dir().join("archive-20240601_00.mkv.ok").is_file());
    assert!(!early_a.exists());
    assert!(!early_b.exists());
    // One cell per invocation: hour 03 is untouched until the next pass.
    assert!(later.exists());
    assert!(!config.archive_dir().join("archive-20240601_03.mkv.ok").exists());
}

#[tokio::test]
async fn errored_cell_is_terminal_until_operator_intervenes() {
    let base = TempDir::new().unwrap();
    let (archiver, executor, config) = build_archiver(&base);
    write_chunk(&config, "s1", "out-20240601T0005.mp4");
    let sentinel = config.archive_dir().join("archive-20240601_00.mkv.err");
    std::fs::write(&sentinel, "2024-06-02T00:00:00Z\nencode blew up\n").unwrap();

    assert!(!archiver.generate_archive(june_first(), 0, false, true).await);
    assert_eq!(executor.call_count(), 0);
    assert!(sentinel.is_file());

    // Removing the sentinel is the explicit retry request.
    std::fs::remove_file(&sentinel).unwrap();
    assert!(archiver.generate_archive(june_first(), 0, false, true).await);
}

#[tokio::test]
async fn horizon_excludes_active_dates() {
    let base = TempDir::new().unwrap();
    let (archiver, _executor, config) = build_archiver(&base);
    write_chunk(&config, "s1", "out-20240601T0005.mp4");

    // 24 hours past midnight is still inside the 36 hour horizon.
    let archiver = archiver.with_clock(fixed_clock(naive("2024-06-02 00:00:00")));
    let report = archiver.archive(false, true).await;
    assert_eq!(report.eligible_dates, 0);
    assert!(!report.generated);
}

#[tokio::test]
async fn read_only_validates_without_touching_sources() {
    let base = TempDir::new().unwrap();
    let (archiver, _executor, config) = build_archiver(&base);
    let chunk = write_chunk(&config, "s1", "out-20240601T0005.mp4");

    assert!(archiver.generate_archive(june_first(), 0, true, true).await);
    assert!(chunk.exists());
    assert!(!config.archive_dir().join("archive-20240601_00.mkv.ok").exists());
    assert!(std::fs::read_dir(config.staging_dir()).unwrap().next().is_none());
}

#[tokio::test]
async fn upload_failure_writes_error_sentinel_and_keeps_sources() {
    struct FailingStorage;
    #[async_trait::async_trait]
    impl ColdStorage for FailingStorage {
        async fn upload(&self, key: &str, _path: &Path) -> Result<(), lapse_core::archiver::ArchiveError> {
            Err(lapse_core::archiver::ArchiveError::Upload {
                key: key.to_string(),
                message: "bucket unreachable".into(),
            })
        }
    }

    let base = TempDir::new().unwrap();
    let mut config = test_config(base.path());
    config.archiver.upload_enabled = true;
    let executor = Arc::new(ScriptedExecutor::new());
    let tools = Arc::new(MediaTools::new(
        config.tools.clone(),
        executor.clone() as Arc<dyn lapse_core::CommandExecutor>,
    ));
    let archiver = Archiver::new(
        CaptureCatalog::new(config.raw_dir()),
        tools,
        Arc::new(config.clone()),
    )
    .with_storage(Arc::new(FailingStorage))
    .with_cooldown(std::time::Duration::ZERO);
    let chunk = write_chunk(&config, "s1", "out-20240601T0005.mp4");

    assert!(!archiver.generate_archive(june_first(), 0, false, true).await);
    let sentinel = config.archive_dir().join("archive-20240601_00.mkv.err");
    let body = std::fs::read_to_string(&sentinel).unwrap();
    assert!(body.contains("bucket unreachable"));
    assert!(chunk.exists());
    assert!(std::fs::read_dir(config.staging_dir()).unwrap().next().is_none());
}

#[test]
fn retention_keeps_only_the_newest_archives() {
    let base = TempDir::new().unwrap();
    let config = test_config(base.path());
    let names = [
        "archive-20240601_00.mkv",
        "archive-20240601_01.mkv",
        "archive-20240601_02.mkv",
        "archive-20240602_00.mkv",
        "archive-20240602_01.mkv",
    ];
    for name in names {
        std::fs::write(config.staging_dir().join(name), b"archived").unwrap();
    }

    let cleaner = RetentionCleaner::new(Arc::new(config.clone()));
    let report = cleaner.cleanup(false);
    assert_eq!((report.kept, report.deleted, report.failed), (2, 3, 0));

    let mut remaining: Vec<String> = std::fs::read_dir(config.staging_dir())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    remaining.sort();
    assert_eq!(
        remaining,
        vec!["archive-20240602_00.mkv", "archive-20240602_01.mkv"]
    );
}

#[test]
fn read_only_retention_deletes_nothing() {
    let base = TempDir::new().unwrap();
    let config = test_config(base.path());
    for index in 0..5 {
        std::fs::write(
            config.staging_dir().join(format!("archive-20240601_{index:02}.mkv")),
            b"archived",
        )
        .unwrap();
    }
    let cleaner = RetentionCleaner::new(Arc::new(config.clone()));
    cleaner.cleanup(true);
    assert_eq!(std::fs::read_dir(config.staging_dir()).unwrap().count(), 5);
}
