use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LapseConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    pub tools: ToolsSection,
    pub capture: CaptureSection,
    pub generator: GeneratorSection,
    pub archiver: ArchiverSection,
    pub watchdog: WatchdogSection,
}

impl LapseConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.raw_dir)
    }

    pub fn timelapse_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.timelapse_dir)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.archive_dir)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.staging_dir)
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.quarantine_dir)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.tmp_dir)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.data_dir)
    }

    /// Required settings must be present before any engine component is
    /// constructed; a missing directory is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("paths.raw_dir", &self.paths.raw_dir),
            ("paths.timelapse_dir", &self.paths.timelapse_dir),
            ("paths.archive_dir", &self.paths.archive_dir),
            ("paths.staging_dir", &self.paths.staging_dir),
            ("paths.quarantine_dir", &self.paths.quarantine_dir),
            ("paths.tmp_dir", &self.paths.tmp_dir),
            ("paths.data_dir", &self.paths.data_dir),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Validation(format!("{key} is not set")));
            }
        }
        if self.generator.speedup == 0 {
            return Err(ConfigError::Validation(
                "generator.speedup must be positive".into(),
            ));
        }
        if self.archiver.keep == 0 {
            return Err(ConfigError::Validation(
                "archiver.keep must retain at least one file".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub environment: String,
    /// Operations log intent without touching the filesystem when set.
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub raw_dir: String,
    pub timelapse_dir: String,
    pub archive_dir: String,
    pub staging_dir: String,
    pub quarantine_dir: String,
    pub tmp_dir: String,
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    pub ffmpeg: String,
    pub ffprobe: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureSection {
    pub source_url: String,
    pub segment_seconds: u32,
    pub extension: String,
    pub rtsp_transport: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorSection {
    pub speedup: u32,
    pub fps: u32,
    pub video_bitrate: String,
    pub extension: String,
    pub grace_minutes: i64,
    pub cooldown_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiverSection {
    pub horizon_hours: i64,
    pub extension: String,
    pub codec_args: String,
    pub fps: u32,
    pub scale: String,
    pub pix_fmt: String,
    pub keep: usize,
    pub cooldown_seconds: u64,
    pub upload_enabled: bool,
    pub bucket: String,
    pub storage_class: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogSection {
    pub max_drift_minutes: i64,
    pub process_marker: String,
    pub transport_flag: String,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<LapseConfig> {
    let config: LapseConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> String {
        r#"
[system]
node_name = "lapse-primary"
environment = "test"

[paths]
base_dir = "/var/lib/lapse"
raw_dir = "raw"
timelapse_dir = "timelapse"
archive_dir = "archive"
staging_dir = "staging"
quarantine_dir = "quarantine"
tmp_dir = "tmp"
data_dir = "data"

[tools]
ffmpeg = "ffmpeg"
ffprobe = "ffprobe"

[capture]
source_url = "rtsp://camera.local/stream"
segment_seconds = 300
extension = "mp4"
rtsp_transport = "tcp"

[generator]
speedup = 60
fps = 30
video_bitrate = "4M"
extension = "mp4"
grace_minutes = 11
cooldown_seconds = 30

[archiver]
horizon_hours = 36
extension = "mkv"
codec_args = "-c:v libx265 -crf 28 -preset medium"
fps = 15
scale = "1920:1080"
pix_fmt = "yuv420p"
keep = 48
cooldown_seconds = 30
upload_enabled = false
bucket = "lapse-cold"
storage_class = "DEEP_ARCHIVE"

[watchdog]
max_drift_minutes = 15
process_marker = "ffmpeg"
transport_flag = "rtsp_transport"
"#
        .to_string()
    }

    #[test]
    fn parse_full_config() {
        let config: LapseConfig = toml::from_str(&fixture()).expect("config should parse");
        config.validate().expect("config should validate");
        assert_eq!(config.system.node_name, "lapse-primary");
        assert_eq!(config.generator.grace_minutes, 11);
        assert_eq!(config.archiver.horizon_hours, 36);
        assert_eq!(config.raw_dir(), Path::new("/var/lib/lapse/raw"));
    }

    #[test]
    fn absolute_paths_are_kept() {
        let mut config: LapseConfig = toml::from_str(&fixture()).unwrap();
        config.paths.raw_dir = "/mnt/cam/raw".into();
        assert_eq!(config.raw_dir(), Path::new("/mnt/cam/raw"));
    }

    #[test]
    fn missing_required_path_is_fatal() {
        let mut config: LapseConfig = toml::from_str(&fixture()).unwrap();
        config.paths.staging_dir = " ".into();
        assert!(config.validate().is_err());
    }
}
