//! Request coordination: cache check, bounded dispatch to the extractor, and
//! cache insertion once the artifact is on disk.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    cache::{CacheHit, DownloadCache, is_safe_component},
    error::{ServiceError, ServiceResult},
    extractor::{FetchRequest, MediaExtractor, VideoInfo},
    format::{FormatType, parse_quality},
};

type InFlightKey = (String, FormatType);
type InFlightMap = StdMutex<HashMap<InFlightKey, Arc<Mutex<()>>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub cached: bool,
    pub artifact_id: String,
    pub file_name: String,
    pub download_url: String,
    pub title: Option<String>,
}

pub struct DownloadService {
    cache: Arc<DownloadCache>,
    extractor: Arc<dyn MediaExtractor>,
    workers: Arc<Semaphore>,
    in_flight: InFlightMap,
}

impl DownloadService {
    pub fn new(
        cache: Arc<DownloadCache>,
        extractor: Arc<dyn MediaExtractor>,
        workers: usize,
    ) -> Self {
        Self {
            cache,
            extractor,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            in_flight: StdMutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &DownloadCache {
        &self.cache
    }

    pub async fn info(&self, url: &str) -> ServiceResult<VideoInfo> {
        let url = validate_url(url)?;
        let _permit = self.acquire_worker().await?;

        self.extractor.probe(url).await.map_err(|error| {
            warn!("No se pudo obtener informacion de {url}: {error}");
            ServiceError::ProbeFailed(error.to_string())
        })
    }

    pub async fn download(
        &self,
        url: &str,
        format: &str,
        quality: Option<&str>,
    ) -> ServiceResult<DownloadOutcome> {
        let format_type = FormatType::parse(format)
            .ok_or_else(|| ServiceError::InvalidFormat(format.trim().to_string()))?;
        let url = validate_url(url)?;
        let quality = match quality.map(str::trim).filter(|value| !value.is_empty()) {
            Some(value) => Some(
                parse_quality(value)
                    .ok_or_else(|| ServiceError::InvalidQuality(value.to_string()))?,
            ),
            None => None,
        };

        if let Some(hit) = self.cache.lookup(url, format_type).await {
            info!("Sirviendo archivo en cache: {}", hit.file_name);
            return Ok(cached_outcome(hit));
        }

        // Identical misses queue behind one download and then hit the cache.
        let slot = InFlightSlot::claim(&self.in_flight, (url.to_string(), format_type));
        let _turn = slot.lock.lock().await;

        if let Some(hit) = self.cache.lookup(url, format_type).await {
            info!("Sirviendo archivo recien descargado: {}", hit.file_name);
            return Ok(cached_outcome(hit));
        }

        self.download_fresh(url, format_type, quality).await
    }

    async fn download_fresh(
        &self,
        url: &str,
        format_type: FormatType,
        quality: Option<u32>,
    ) -> ServiceResult<DownloadOutcome> {
        let permit = self.acquire_worker().await?;

        let artifact_id = Uuid::new_v4().to_string();
        let artifact_dir = self.cache.artifact_dir(&artifact_id);
        // Held until the row is appended so the sweeper never treats the
        // directory as an orphan.
        let _reservation = self.cache.reserve_artifact(&artifact_id);
        tokio::fs::create_dir_all(&artifact_dir).await.map_err(|error| {
            ServiceError::Internal(format!("No se pudo preparar la carpeta de descarga: {error}"))
        })?;

        let result = self
            .extractor
            .fetch(FetchRequest {
                url: url.to_string(),
                format: format_type,
                artifact_dir: artifact_dir.clone(),
                quality,
            })
            .await;
        drop(permit);

        let fetched = match result {
            Ok(fetched) => fetched,
            Err(error) => {
                warn!("Fallo la descarga de {url} ({format_type}): {error}");
                cleanup_artifact_dir(&artifact_dir).await;
                return Err(ServiceError::DownloadFailed(error.to_string()));
            }
        };

        let file_path = artifact_dir.join(&fetched.file_name);
        let present = tokio::fs::metadata(&file_path)
            .await
            .map(|metadata| metadata.is_file())
            .unwrap_or(false);
        if !is_safe_component(&fetched.file_name) || !present {
            warn!(
                "La descarga {artifact_id} no dejo un archivo utilizable: {:?}",
                fetched.file_path
            );
            cleanup_artifact_dir(&artifact_dir).await;
            return Err(ServiceError::DownloadFailed(
                "No se encontro el archivo tras la descarga.".to_string(),
            ));
        }

        if let Err(error) = self
            .cache
            .insert(url, &artifact_id, &fetched.file_name, &file_path, format_type)
            .await
        {
            warn!("No se pudo registrar la descarga {artifact_id} en la cache: {error}");
        }

        info!("Descargado: {}", fetched.title);
        Ok(DownloadOutcome {
            cached: false,
            download_url: download_url(&artifact_id, &fetched.file_name),
            artifact_id,
            file_name: fetched.file_name,
            title: Some(fetched.title),
        })
    }

    pub async fn resolve_file(&self, download_id: &str, file_name: &str) -> ServiceResult<PathBuf> {
        if !is_safe_component(download_id) || !is_safe_component(file_name) {
            return Err(ServiceError::FileNotFound);
        }

        let candidate = self.cache.artifact_dir(download_id).join(file_name);
        match tokio::fs::metadata(&candidate).await {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => return Err(ServiceError::FileNotFound),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(ServiceError::FileNotFound);
            }
            Err(error) => {
                return Err(ServiceError::Internal(format!(
                    "No se pudo leer el archivo solicitado: {error}"
                )));
            }
        }

        let root = canonical(self.cache.downloads_root()).await?;
        let resolved = canonical(&candidate).await?;
        if !resolved.starts_with(&root) {
            warn!("Se bloqueo un archivo fuera de la carpeta de descargas: {:?}", resolved);
            return Err(ServiceError::FileNotFound);
        }

        Ok(resolved)
    }

    async fn acquire_worker(&self) -> ServiceResult<tokio::sync::OwnedSemaphorePermit> {
        self.workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| {
                ServiceError::Internal("No se pudo reservar capacidad de descarga.".to_string())
            })
    }
}

/// Membership in the in-flight map; the entry is dropped once the last
/// waiter for the key leaves.
struct InFlightSlot<'a> {
    map: &'a InFlightMap,
    key: InFlightKey,
    lock: Arc<Mutex<()>>,
}

impl<'a> InFlightSlot<'a> {
    fn claim(map: &'a InFlightMap, key: InFlightKey) -> Self {
        let lock = map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone();
        Self { map, key, lock }
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&self.lock) <= 2 {
            map.remove(&self.key);
        }
    }
}

fn cached_outcome(hit: CacheHit) -> DownloadOutcome {
    DownloadOutcome {
        cached: true,
        download_url: download_url(&hit.artifact_id, &hit.file_name),
        artifact_id: hit.artifact_id,
        file_name: hit.file_name,
        title: None,
    }
}

pub fn download_url(artifact_id: &str, file_name: &str) -> String {
    format!(
        "/file/{}/{}",
        urlencoding::encode(artifact_id),
        urlencoding::encode(file_name)
    )
}

fn validate_url(input: &str) -> ServiceResult<&str> {
    let trimmed = input.trim();
    let parsed = Url::parse(trimmed).map_err(|_| ServiceError::InvalidUrl)?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ServiceError::InvalidUrl);
    }
    Ok(trimmed)
}

async fn canonical(path: &Path) -> ServiceResult<PathBuf> {
    tokio::fs::canonicalize(path).await.map_err(|error| {
        if error.kind() == ErrorKind::NotFound {
            ServiceError::FileNotFound
        } else {
            ServiceError::Internal(format!("No se pudo resolver la ruta: {error}"))
        }
    })
}

async fn cleanup_artifact_dir(artifact_dir: &Path) {
    if let Err(error) = tokio::fs::remove_dir_all(artifact_dir).await {
        if error.kind() != ErrorKind::NotFound {
            info!("No se pudo limpiar la carpeta de descarga: {error}");
        }
    } else {
        debug!("Carpeta de descarga eliminada: {:?}", artifact_dir);
    }
}
