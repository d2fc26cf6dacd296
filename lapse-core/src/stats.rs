use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use sysinfo::Disks;
use tracing::warn;

use crate::catalog::CaptureCatalog;
use crate::config::LapseConfig;
use crate::store::EngineStore;

/// Read-only status snapshot over every engine surface, published for
/// the external HTTP facade. A collection failure degrades the snapshot
/// to a partial map with an `error` field instead of failing the whole
/// operation.
pub struct StatsAggregator {
    catalog: CaptureCatalog,
    config: Arc<LapseConfig>,
    store: EngineStore,
}

impl StatsAggregator {
    pub fn new(catalog: CaptureCatalog, config: Arc<LapseConfig>, store: EngineStore) -> Self {
        Self {
            catalog,
            config,
            store,
        }
    }

    pub fn collect(&self) -> Value {
        let mut map = Map::new();
        map.insert("alive".into(), Value::Bool(true));
        map.insert("ts".into(), Value::String(Utc::now().to_rfc3339()));
        if let Err(err) = self.fill(&mut map) {
            warn!(error = %err, "stats collection degraded to partial snapshot");
            map.insert("error".into(), Value::String(err));
        }
        Value::Object(map)
    }

    /// Collects and publishes the snapshot to the store for the facade.
    pub fn publish(&self) -> Value {
        let snapshot = self.collect();
        if let Err(err) = self.store.publish_snapshot(&snapshot) {
            warn!(error = %err, "could not publish status snapshot");
        }
        snapshot
    }

    fn fill(&self, map: &mut Map<String, Value>) -> Result<(), String> {
        map.insert("raw_count".into(), Value::from(self.catalog.raw_count()));
        map.insert(
            "raw_last_at".into(),
            self.catalog
                .raw_last_at()
                .map(|at| Value::String(at.format("%Y-%m-%dT%H:%M:%S").to_string()))
                .unwrap_or(Value::Null),
        );

        let timelapse_dir = self.config.timelapse_dir();
        let slots = count_artifacts(&timelapse_dir, "timelapse-slots-").map_err(stringify)?;
        map.insert("timelapse_slots_count".into(), Value::from(slots.done));
        map.insert("timelapse_slots_errors".into(), Value::from(slots.errors));
        let daily = count_artifacts(&timelapse_dir, "timelapse-daily-").map_err(stringify)?;
        map.insert("timelapse_daily_count".into(), Value::from(daily.done));
        map.insert("timelapse_daily_errors".into(), Value::from(daily.errors));
        // Ranked by the embedded date key, not the full name, so a newer
        // daily beats an older slot video.
        map.insert(
            "last_timelapse".into(),
            slots
                .newest
                .into_iter()
                .chain(daily.newest)
                .max()
                .map(|(_, name)| Value::String(name))
                .unwrap_or(Value::Null),
        );

        let archives = count_archive_cells(&self.config.archive_dir()).map_err(stringify)?;
        map.insert("archives_count".into(), Value::from(archives.done));
        map.insert("archives_errors".into(), Value::from(archives.errors));
        map.insert(
            "last_archive".into(),
            archives
                .newest
                .map(|(_, name)| Value::String(name))
                .unwrap_or(Value::Null),
        );

        map.insert(
            "disk_free_bytes".into(),
            free_space_for(&self.config.raw_dir())
                .map(Value::from)
                .unwrap_or(Value::Null),
        );
        map.insert(
            "restarts".into(),
            Value::from(self.store.restart_count().map_err(stringify)?),
        );
        Ok(())
    }
}

/// `newest` pairs the date key embedded after the artifact prefix with
/// the full file name, so recency ranks by date across artifact kinds.
struct ArtifactTally {
    done: usize,
    errors: usize,
    newest: Option<(String, String)>,
}

fn count_artifacts(dir: &Path, prefix: &str) -> std::io::Result<ArtifactTally> {
    let mut tally = ArtifactTally {
        done: 0,
        errors: 0,
        newest: None,
    };
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(tally),
        Err(err) => return Err(err),
    };
    for entry in entries.filter_map(|entry| entry.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(prefix) {
            continue;
        }
        if name.ends_with(".err") {
            tally.errors += 1;
        } else {
            tally.done += 1;
            let key = name[prefix.len()..].to_string();
            if tally.newest.as_ref().map_or(true, |(newest, _)| *newest < key) {
                tally.newest = Some((key, name));
            }
        }
    }
    Ok(tally)
}

fn count_archive_cells(dir: &Path) -> std::io::Result<ArtifactTally> {
    let mut tally = ArtifactTally {
        done: 0,
        errors: 0,
        newest: None,
    };
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(tally),
        Err(err) => return Err(err),
    };
    for entry in entries.filter_map(|entry| entry.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("archive-") {
            continue;
        }
        if let Some(archive_name) = name.strip_suffix(".ok") {
            tally.done += 1;
            let key = archive_name["archive-".len()..].to_string();
            if tally.newest.as_ref().map_or(true, |(newest, _)| *newest < key) {
                tally.newest = Some((key, archive_name.to_string()));
            }
        } else if name.ends_with(".err") {
            tally.errors += 1;
        }
    }
    Ok(tally)
}

/// Free space on the filesystem holding the raw capture tree, by longest
/// matching mount point.
fn free_space_for(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

fn stringify<E: std::fmt::Display>(err: E) -> String {
    err.to_string()
}
