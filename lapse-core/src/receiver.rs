use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::LapseConfig;
use crate::store::EngineStore;

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to launch capture process: {0}")]
    Spawn(std::io::Error),
    #[error("capture process exited with status {status:?}")]
    CaptureExited { status: Option<i32> },
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

pub type ReceiverResult<T> = std::result::Result<T, ReceiverError>;

/// Launches the long-running external capture process: reads the network
/// video source and segments it into fixed-duration chunks under a fresh
/// per-session subdirectory, chunks named by wall-clock time. A non-zero
/// exit is a hard error; the scheduler re-invokes, this code never
/// retries.
pub struct Receiver {
    config: Arc<LapseConfig>,
    store: EngineStore,
}

impl Receiver {
    pub fn new(config: Arc<LapseConfig>, store: EngineStore) -> Self {
        Self { config, store }
    }

    pub async fn run(&self) -> ReceiverResult<()> {
        let session = format!(
            "session-{}-{}",
            chrono::Local::now().format("%Y%m%dT%H%M%S"),
            Uuid::new_v4().simple()
        );
        let session_dir = self.config.raw_dir().join(&session);
        std::fs::create_dir_all(&session_dir).map_err(|source| ReceiverError::Io {
            path: session_dir.clone(),
            source,
        })?;

        let capture = &self.config.capture;
        let chunk_pattern = session_dir.join(format!("out-%Y%m%dT%H%M.{}", capture.extension));
        let mut command = tokio::process::Command::new(&self.config.tools.ffmpeg);
        // An error before the wait drops the child; it must not keep
        // recording orphaned.
        command.kill_on_drop(true);
        command
            .args(["-hide_banner", "-loglevel", "warning"])
            .args(["-rtsp_transport", &capture.rtsp_transport])
            .args(["-i", &capture.source_url])
            .args(["-c", "copy", "-an"])
            .args(["-f", "segment"])
            .args(["-segment_time", &capture.segment_seconds.to_string()])
            .args(["-segment_atclocktime", "1"])
            .args(["-strftime", "1", "-reset_timestamps", "1"])
            .arg(&chunk_pattern);

        let mut child = command.spawn().map_err(ReceiverError::Spawn)?;
        let handle = match child.id() {
            Some(pid) => format!("capture:{pid}"),
            None => format!("capture:{session}"),
        };
        // Registered before we block on the process so the watchdog can
        // find and revoke this session while it runs.
        self.store.set_task_handle(&handle)?;
        info!(session, handle, "capture session started");

        let status = child.wait().await.map_err(ReceiverError::Spawn)?;
        if !status.success() {
            error!(session, status = status.code(), "capture process died");
            return Err(ReceiverError::CaptureExited {
                status: status.code(),
            });
        }
        info!(session, "capture process exited cleanly");
        Ok(())
    }
}
