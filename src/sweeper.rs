//! Expiry pass over the download cache and the periodic task that drives it.

use std::{collections::HashSet, io::ErrorKind, path::Path, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    cache::{DownloadCache, is_safe_component},
    index::{CacheRecord, IndexEntry},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub live: usize,
    pub retained_malformed: usize,
    pub cleanup_failures: usize,
    pub orphans_removed: usize,
}

pub async fn sweep(cache: &DownloadCache) -> SweepReport {
    sweep_at(cache, Utc::now()).await
}

/// Never fails: per-entry problems keep the entry, store problems are logged
/// and leave the index as it was.
pub async fn sweep_at(cache: &DownloadCache, now: DateTime<Utc>) -> SweepReport {
    let mut report = SweepReport::default();
    // Taken before the index read; reservations are released only after the
    // download's row is appended.
    let in_progress = cache.artifacts_in_progress();
    let guard = cache.index().lock().await;

    let entries = match guard.read_entries().await {
        Ok(entries) => entries,
        Err(error) => {
            warn!("Limpieza omitida, no se pudo leer el indice de cache: {error}");
            return report;
        }
    };

    let mut retained = Vec::with_capacity(entries.len());
    for entry in entries {
        let record = match entry {
            IndexEntry::Record(record) => record,
            malformed @ IndexEntry::Malformed { .. } => {
                report.retained_malformed += 1;
                retained.push(malformed);
                continue;
            }
        };

        if !cache.is_expired(&record, now) {
            report.live += 1;
            retained.push(IndexEntry::Record(record));
            continue;
        }

        match remove_artifact(cache, &record).await {
            Ok(()) => {
                report.removed += 1;
                info!("Descarga expirada eliminada: {}", record.file_name);
            }
            Err(error) => {
                report.cleanup_failures += 1;
                warn!(
                    "No se pudo eliminar la descarga expirada {:?}, se reintentara: {error}",
                    record.file_path
                );
                retained.push(IndexEntry::Record(record));
            }
        }
    }

    if report.removed > 0
        && let Err(error) = guard.replace_entries(&retained).await
    {
        warn!("No se pudo reescribir el indice de cache: {error}");
    }

    let mut referenced = retained
        .iter()
        .filter_map(|entry| match entry {
            IndexEntry::Record(record) => Some(record.artifact_id.clone()),
            IndexEntry::Malformed { row, .. } => row
                .get(1)
                .and_then(|id| std::str::from_utf8(id).ok())
                .map(ToString::to_string),
        })
        .collect::<HashSet<_>>();
    drop(guard);
    referenced.extend(in_progress);

    report.orphans_removed =
        remove_orphan_dirs(cache.downloads_root(), &referenced, cache.orphan_age()).await;

    report
}

/// NotFound counts as already removed. A non-empty or racing directory is
/// left in place.
async fn remove_artifact(cache: &DownloadCache, record: &CacheRecord) -> std::io::Result<()> {
    if !cache.is_contained(record) {
        warn!(
            "Registro {} apunta fuera de su carpeta, solo se descarta del indice: {:?}",
            record.artifact_id, record.file_path
        );
        return Ok(());
    }

    match tokio::fs::remove_file(&record.file_path).await {
        Ok(()) => {}
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => return Err(error),
    }

    let artifact_dir = cache.artifact_dir(&record.artifact_id);
    match tokio::fs::remove_dir(&artifact_dir).await {
        Ok(()) => {}
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => debug!("Carpeta {:?} no se elimina: {error}", artifact_dir),
    }

    Ok(())
}

/// Removes UUID-named directories that no record points at and no download is
/// writing, once they are older than `max_age`.
async fn remove_orphan_dirs(
    downloads_root: &Path,
    referenced: &HashSet<String>,
    max_age: Duration,
) -> usize {
    let mut entries = match tokio::fs::read_dir(downloads_root).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("No se pudo abrir la carpeta de descargas para limpieza: {error}");
            }
            return 0;
        }
    };

    let now = std::time::SystemTime::now();
    let mut removed = 0;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("No se pudo iterar la carpeta de descargas: {error}");
                break;
            }
        };

        let name = entry.file_name().to_string_lossy().into_owned();
        if referenced.contains(&name)
            || !is_safe_component(&name)
            || Uuid::parse_str(&name).is_err()
        {
            continue;
        }

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_dir() => metadata,
            Ok(_) => continue,
            Err(error) => {
                warn!("No se pudo leer metadata de {:?}: {error}", path);
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or(Duration::ZERO);
        if age < max_age {
            continue;
        }

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                removed += 1;
                info!("Carpeta huerfana eliminada: {:?}", path);
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("No se pudo eliminar carpeta huerfana {:?}: {error}", path),
        }
    }

    removed
}

/// Periodic sweeper bound to the service lifetime.
pub struct SweeperHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// The first periodic pass happens one `every` after start; run [`sweep`]
    /// directly for the startup pass.
    pub fn start(cache: Arc<DownloadCache>, every: Duration) -> Self {
        let token = CancellationToken::new();
        let task = tokio::spawn(run_periodic(cache, every, token.clone()));
        Self { token, task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn stop(self) {
        self.token.cancel();
        if let Err(error) = self.task.await {
            warn!("La tarea de limpieza termino con error: {error}");
        }
    }
}

async fn run_periodic(cache: Arc<DownloadCache>, every: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let report = sweep(&cache).await;
                if report.removed > 0 || report.orphans_removed > 0 || report.cleanup_failures > 0 {
                    info!(
                        "Limpieza periodica: {} expiradas, {} huerfanas, {} fallos, {} vigentes",
                        report.removed, report.orphans_removed, report.cleanup_failures, report.live
                    );
                } else {
                    debug!("Limpieza periodica sin cambios ({} vigentes)", report.live);
                }
            }
        }
    }

    debug!("Tarea de limpieza detenida");
}
