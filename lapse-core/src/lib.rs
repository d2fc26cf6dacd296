pub mod archiver;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod generator;
pub mod media;
pub mod receiver;
pub mod retention;
pub mod sentinel;
pub mod slot;
mod sqlite;
pub mod stats;
pub mod store;
pub mod watchdog;

pub use archiver::{ArchiveError, ArchiveReport, Archiver, ColdStorage, S3CliStorage};
pub use catalog::{parse_capture_timestamp, CaptureCatalog, CatalogError, RawCapture};
pub use config::{load_config, LapseConfig};
pub use engine::{Engine, EngineError};
pub use error::{ConfigError, Result};
pub use generator::{GeneratorError, GeneratorReport, TimelapseGenerator};
pub use media::{CommandExecutor, MediaCommand, MediaError, MediaTools, SystemCommandExecutor};
pub use receiver::{Receiver, ReceiverError};
pub use retention::{CleanupReport, RetentionCleaner};
pub use sentinel::{ArtifactState, SentinelPair};
pub use slot::{slot_index, Slot};
pub use stats::StatsAggregator;
pub use store::{EngineStore, StoreError};
pub use watchdog::{
    is_bad_drift, CaptureWatchdog, ProcessRecord, ProcessScanner, SysinfoScanner, TaskScheduler,
    WatchdogAction, WatchdogReport,
};
