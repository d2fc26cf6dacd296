use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;
use tracing::warn;

use crate::config::{ArchiverSection, GeneratorSection, ToolsSection};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("command failed ({command}): {stderr}")]
    ToolFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("output failed playability verification: {path}")]
    Verification { path: PathBuf },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type MediaResult<T> = std::result::Result<T, MediaError>;

#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output> {
        command.output().await
    }
}

/// A fully rendered external-tool invocation. Built up front so read-only
/// runs can validate and log the exact command without executing it.
#[derive(Debug, Clone)]
pub struct MediaCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl MediaCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl std::fmt::Display for MediaCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// External media-tool facade. The tools themselves are black boxes; only
/// their exit status and captured stderr matter here.
pub struct MediaTools {
    tools: ToolsSection,
    executor: std::sync::Arc<dyn CommandExecutor>,
}

impl MediaTools {
    pub fn new(tools: ToolsSection, executor: std::sync::Arc<dyn CommandExecutor>) -> Self {
        Self { tools, executor }
    }

    /// Structural "good video" check: exit 0 with a reported video stream
    /// means playable. A failing probe is an answer, not an error.
    pub async fn probe_ok(&self, path: &Path) -> MediaResult<bool> {
        let command = MediaCommand::new(&self.tools.ffprobe)
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", "stream=codec_name"])
            .args(["-of", "csv=p=0"])
            .arg(path.to_string_lossy());
        let output = self.executor.run(&mut command.to_command()).await?;
        if !output.status.success() {
            warn!(path = %path.display(), status = output.status.code(), "probe rejected file");
            return Ok(false);
        }
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    /// Lossless container merge of pre-sorted inputs via a concat list
    /// file written next to the output.
    pub fn concat_command(&self, list_file: &Path, output: &Path) -> MediaCommand {
        MediaCommand::new(&self.tools.ffmpeg)
            .args(["-hide_banner", "-y", "-f", "concat", "-safe", "0", "-i"])
            .arg(list_file.to_string_lossy())
            .args(["-c", "copy"])
            .arg(output.to_string_lossy())
    }

    /// Fixed speed-up re-encode producing the final timelapse rendition.
    pub fn timelapse_encode_command(
        &self,
        input: &Path,
        output: &Path,
        generator: &GeneratorSection,
    ) -> MediaCommand {
        MediaCommand::new(&self.tools.ffmpeg)
            .args(["-hide_banner", "-y", "-i"])
            .arg(input.to_string_lossy())
            .args(["-vf", &format!("setpts=PTS/{}", generator.speedup)])
            .args(["-r", &generator.fps.to_string()])
            .args(["-b:v", &generator.video_bitrate])
            .arg("-an")
            .arg(output.to_string_lossy())
    }

    /// One filter graph that resamples every input to a common frame
    /// rate, resolution and pixel format before concatenating.
    pub fn archive_compress_command(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        archiver: &ArchiverSection,
    ) -> MediaCommand {
        let mut command = MediaCommand::new(&self.tools.ffmpeg).args(["-hide_banner", "-y"]);
        for input in inputs {
            command = command.arg("-i").arg(input.to_string_lossy());
        }
        let mut graph = String::new();
        for index in 0..inputs.len() {
            graph.push_str(&format!(
                "[{index}:v]fps={},scale={},format={}[v{index}];",
                archiver.fps, archiver.scale, archiver.pix_fmt
            ));
        }
        for index in 0..inputs.len() {
            graph.push_str(&format!("[v{index}]"));
        }
        graph.push_str(&format!("concat=n={}:v=1:a=0[out]", inputs.len()));
        command = command
            .args(["-filter_complex", &graph])
            .args(["-map", "[out]"])
            .args(archiver.codec_args.split_whitespace())
            .arg("-an")
            .arg(output.to_string_lossy());
        command
    }

    pub async fn run(&self, command: &MediaCommand) -> MediaResult<()> {
        let output = self.executor.run(&mut command.to_command()).await?;
        if !output.status.success() {
            return Err(MediaError::ToolFailure {
                command: command.to_string(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }
}

/// Writes the concat demuxer list file for a set of inputs.
pub fn write_concat_list(list_file: &Path, inputs: &[PathBuf]) -> MediaResult<()> {
    let mut body = String::new();
    for input in inputs {
        body.push_str(&format!("file '{}'\n", input.display()));
    }
    std::fs::write(list_file, body).map_err(|source| MediaError::Io {
        path: list_file.to_path_buf(),
        source,
    })
}
