#![allow(dead_code)]

use std::collections::HashSet;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};

use chrono::NaiveDateTime;
use tokio::process::Command;

use lapse_core::config::{
    ArchiverSection, CaptureSection, GeneratorSection, LapseConfig, PathsSection, SystemSection,
    ToolsSection, WatchdogSection,
};
use lapse_core::generator::Clock;
use lapse_core::CommandExecutor;

/// Stands in for ffmpeg/ffprobe/aws: records every invocation, fabricates
/// the output file an encoder would produce and answers probes from a
/// configurable set of unplayable paths.
#[derive(Default)]
pub struct ScriptedExecutor {
    calls: Mutex<Vec<String>>,
    unplayable: Mutex<HashSet<PathBuf>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_unplayable(&self, path: impl Into<PathBuf>) {
        self.unplayable.lock().unwrap().insert(path.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        let std_command = command.as_std();
        let program = std_command.get_program().to_string_lossy().to_string();
        let args: Vec<String> = std_command
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();
        self.calls
            .lock()
            .unwrap()
            .push(format!("{program} {}", args.join(" ")));

        if program.contains("ffprobe") {
            let target = PathBuf::from(args.last().cloned().unwrap_or_default());
            if self.unplayable.lock().unwrap().contains(&target) {
                return Ok(Output {
                    status: ExitStatus::from_raw(1 << 8),
                    stdout: Vec::new(),
                    stderr: b"moov atom not found".to_vec(),
                });
            }
            return Ok(Output {
                status: ExitStatus::from_raw(0),
                stdout: b"h264\n".to_vec(),
                stderr: Vec::new(),
            });
        }
        if program.contains("ffmpeg") {
            if let Some(target) = args.last() {
                std::fs::write(target, b"fabricated video")?;
            }
        }
        Ok(Output {
            status: ExitStatus::from_raw(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

pub fn test_config(base: &Path) -> LapseConfig {
    let config = LapseConfig {
        system: SystemSection {
            node_name: "lapse-test".into(),
            environment: "test".into(),
            read_only: false,
        },
        paths: PathsSection {
            base_dir: base.to_string_lossy().to_string(),
            raw_dir: "raw".into(),
            timelapse_dir: "timelapse".into(),
            archive_dir: "archive".into(),
            staging_dir: "staging".into(),
            quarantine_dir: "quarantine".into(),
            tmp_dir: "tmp".into(),
            data_dir: "data".into(),
        },
        tools: ToolsSection {
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
        },
        capture: CaptureSection {
            source_url: "rtsp://camera.test/stream".into(),
            segment_seconds: 300,
            extension: "mp4".into(),
            rtsp_transport: "tcp".into(),
        },
        generator: GeneratorSection {
            speedup: 60,
            fps: 30,
            video_bitrate: "4M".into(),
            extension: "mp4".into(),
            grace_minutes: 11,
            cooldown_seconds: 0,
        },
        archiver: ArchiverSection {
            horizon_hours: 36,
            extension: "mkv".into(),
            codec_args: "-c:v libx265 -crf 28".into(),
            fps: 15,
            scale: "1920:1080".into(),
            pix_fmt: "yuv420p".into(),
            keep: 2,
            cooldown_seconds: 0,
            upload_enabled: false,
            bucket: "lapse-cold".into(),
            storage_class: "DEEP_ARCHIVE".into(),
        },
        watchdog: WatchdogSection {
            max_drift_minutes: 15,
            process_marker: "ffmpeg".into(),
            transport_flag: "rtsp_transport".into(),
        },
    };
    for dir in [
        config.raw_dir(),
        config.timelapse_dir(),
        config.archive_dir(),
        config.staging_dir(),
        config.quarantine_dir(),
        config.tmp_dir(),
        config.data_dir(),
    ] {
        std::fs::create_dir_all(dir).unwrap();
    }
    config
}

/// Drops a raw chunk file into a capture session directory.
pub fn write_chunk(config: &LapseConfig, session: &str, name: &str) -> PathBuf {
    let session_dir = config.raw_dir().join(session);
    std::fs::create_dir_all(&session_dir).unwrap();
    let path = session_dir.join(name);
    std::fs::write(&path, b"chunk").unwrap();
    path
}

pub fn fixed_clock(at: NaiveDateTime) -> Clock {
    Arc::new(move || at)
}

pub fn naive(text: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").unwrap()
}
