use std::sync::Arc;

use thiserror::Error;

use crate::archiver::{Archiver, ColdStorage, S3CliStorage};
use crate::catalog::CaptureCatalog;
use crate::config::LapseConfig;
use crate::generator::TimelapseGenerator;
use crate::media::{CommandExecutor, MediaTools, SystemCommandExecutor};
use crate::receiver::Receiver;
use crate::retention::RetentionCleaner;
use crate::stats::StatsAggregator;
use crate::store::EngineStore;
use crate::watchdog::CaptureWatchdog;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(#[from] crate::error::ConfigError),
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

/// Explicit per-process context: configuration plus the shared service
/// handles, constructed once at startup and passed into each operation.
pub struct Engine {
    config: Arc<LapseConfig>,
    store: EngineStore,
    tools: Arc<MediaTools>,
    executor: Arc<dyn CommandExecutor>,
}

impl Engine {
    pub fn new(config: LapseConfig) -> Result<Self, EngineError> {
        Self::with_executor(config, Arc::new(SystemCommandExecutor))
    }

    pub fn with_executor(
        config: LapseConfig,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let config = Arc::new(config);
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir).map_err(|source| {
            EngineError::Config(crate::error::ConfigError::Io {
                source,
                path: data_dir.clone(),
            })
        })?;
        let store = EngineStore::new(data_dir.join("engine.sqlite"));
        store.initialize()?;
        let tools = Arc::new(MediaTools::new(config.tools.clone(), Arc::clone(&executor)));
        Ok(Self {
            config,
            store,
            tools,
            executor,
        })
    }

    pub fn config(&self) -> &Arc<LapseConfig> {
        &self.config
    }

    pub fn store(&self) -> &EngineStore {
        &self.store
    }

    pub fn catalog(&self) -> CaptureCatalog {
        CaptureCatalog::new(self.config.raw_dir())
    }

    pub fn generator(&self) -> TimelapseGenerator {
        TimelapseGenerator::new(
            self.catalog(),
            Arc::clone(&self.tools),
            Arc::clone(&self.config),
        )
    }

    pub fn archiver(&self) -> Archiver {
        let archiver = Archiver::new(
            self.catalog(),
            Arc::clone(&self.tools),
            Arc::clone(&self.config),
        );
        if self.config.archiver.upload_enabled {
            let storage: Arc<dyn ColdStorage> = Arc::new(S3CliStorage::new(
                self.config.archiver.bucket.clone(),
                self.config.archiver.storage_class.clone(),
                Arc::clone(&self.executor),
            ));
            archiver.with_storage(storage)
        } else {
            archiver
        }
    }

    pub fn cleaner(&self) -> RetentionCleaner {
        RetentionCleaner::new(Arc::clone(&self.config))
    }

    pub fn watchdog(&self) -> CaptureWatchdog {
        CaptureWatchdog::new(
            self.catalog(),
            self.store.clone(),
            self.config.watchdog.clone(),
            None,
            None,
        )
    }

    pub fn stats(&self) -> StatsAggregator {
        StatsAggregator::new(self.catalog(), Arc::clone(&self.config), self.store.clone())
    }

    pub fn receiver(&self) -> Receiver {
        Receiver::new(Arc::clone(&self.config), self.store.clone())
    }
}
