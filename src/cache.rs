use std::{
    collections::HashSet,
    path::{Component, Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    error::IndexResult,
    format::FormatType,
    index::{CacheIndex, CacheRecord},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    pub artifact_id: String,
    pub file_name: String,
    pub file_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct DownloadCache {
    index: CacheIndex,
    downloads_root: PathBuf,
    freshness_window: Duration,
    orphan_grace: Duration,
    in_progress: Mutex<HashSet<String>>,
}

impl DownloadCache {
    pub fn new(
        index: CacheIndex,
        downloads_root: impl Into<PathBuf>,
        freshness_window: Duration,
    ) -> Self {
        Self {
            index,
            downloads_root: downloads_root.into(),
            freshness_window,
            orphan_grace: Duration::ZERO,
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    /// Unreferenced artifact directories younger than this (or than the
    /// freshness window, whichever is longer) are never treated as orphans.
    pub fn with_orphan_grace(mut self, grace: Duration) -> Self {
        self.orphan_grace = grace;
        self
    }

    pub fn orphan_age(&self) -> Duration {
        self.freshness_window.max(self.orphan_grace)
    }

    /// Marks `artifact_id` as being written until the reservation is dropped.
    pub fn reserve_artifact(&self, artifact_id: &str) -> ArtifactReservation<'_> {
        self.in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(artifact_id.to_string());
        ArtifactReservation {
            cache: self,
            artifact_id: artifact_id.to_string(),
        }
    }

    pub fn artifacts_in_progress(&self) -> HashSet<String> {
        self.in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    pub fn downloads_root(&self) -> &Path {
        &self.downloads_root
    }

    pub fn freshness_window(&self) -> Duration {
        self.freshness_window
    }

    pub fn artifact_dir(&self, artifact_id: &str) -> PathBuf {
        self.downloads_root.join(artifact_id)
    }

    pub async fn lookup(&self, url: &str, format_type: FormatType) -> Option<CacheHit> {
        self.lookup_at(url, format_type, Utc::now()).await
    }

    /// First matching live record in stored order wins. Never evicts; stale
    /// records are left for the sweeper.
    pub async fn lookup_at(
        &self,
        url: &str,
        format_type: FormatType,
        now: DateTime<Utc>,
    ) -> Option<CacheHit> {
        let records = match self.index.read_all().await {
            Ok(records) => records,
            Err(error) => {
                warn!("No se pudo leer el indice de cache, se trata como fallo de cache: {error}");
                return None;
            }
        };

        for record in records {
            if record.source_url != url || record.format_type != format_type {
                continue;
            }
            if self.is_expired(&record, now) {
                continue;
            }
            if !self.is_contained(&record) {
                warn!(
                    "Registro de cache {} apunta fuera de su carpeta: {:?}",
                    record.artifact_id, record.file_path
                );
                continue;
            }
            if !tokio::fs::try_exists(&record.file_path).await.unwrap_or(false) {
                debug!(
                    "Registro de cache {} vigente pero sin archivo en disco",
                    record.artifact_id
                );
                continue;
            }

            return Some(CacheHit {
                artifact_id: record.artifact_id,
                file_name: record.file_name,
                file_path: record.file_path,
                created_at: record.created_at,
            });
        }

        None
    }

    pub async fn insert(
        &self,
        url: &str,
        artifact_id: &str,
        file_name: &str,
        file_path: &Path,
        format_type: FormatType,
    ) -> IndexResult<CacheRecord> {
        self.insert_at(url, artifact_id, file_name, file_path, format_type, Utc::now())
            .await
    }

    pub async fn insert_at(
        &self,
        url: &str,
        artifact_id: &str,
        file_name: &str,
        file_path: &Path,
        format_type: FormatType,
        now: DateTime<Utc>,
    ) -> IndexResult<CacheRecord> {
        let record = CacheRecord {
            source_url: url.to_string(),
            artifact_id: artifact_id.to_string(),
            file_name: file_name.to_string(),
            file_path: file_path.to_path_buf(),
            created_at: now,
            format_type,
        };
        self.index.append(&record).await?;
        debug!("Descarga {} agregada a la cache ({format_type})", artifact_id);
        Ok(record)
    }

    /// Age is measured from `created_at`; a timestamp in the future counts as
    /// age zero.
    pub fn is_expired(&self, record: &CacheRecord, now: DateTime<Utc>) -> bool {
        let age = (now - record.created_at).to_std().unwrap_or(Duration::ZERO);
        age >= self.freshness_window
    }

    /// The record's file must sit under `downloads_root/artifact_id/`.
    pub fn is_contained(&self, record: &CacheRecord) -> bool {
        is_safe_component(&record.artifact_id)
            && record
                .file_path
                .starts_with(self.artifact_dir(&record.artifact_id))
            && !record
                .file_path
                .components()
                .any(|component| matches!(component, Component::ParentDir))
    }
}

pub struct ArtifactReservation<'a> {
    cache: &'a DownloadCache,
    artifact_id: String,
}

impl Drop for ArtifactReservation<'_> {
    fn drop(&mut self) {
        self.cache
            .in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.artifact_id);
    }
}

/// A single, plain path segment: no separators, no `.`/`..`, not empty.
pub fn is_safe_component(value: &str) -> bool {
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(segment)), None) if segment == value
    ) && !value.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::INDEX_FILE_NAME;
    use tempfile::TempDir;

    const WINDOW: Duration = Duration::from_secs(30 * 60);

    fn cache_in(dir: &TempDir) -> DownloadCache {
        DownloadCache::new(
            CacheIndex::new(dir.path().join(INDEX_FILE_NAME)),
            dir.path(),
            WINDOW,
        )
    }

    fn write_artifact(cache: &DownloadCache, id: &str, name: &str) -> PathBuf {
        let artifact_dir = cache.artifact_dir(id);
        std::fs::create_dir_all(&artifact_dir).unwrap();
        let path = artifact_dir.join(name);
        std::fs::write(&path, b"data").unwrap();
        path
    }

    #[tokio::test]
    async fn insert_then_lookup_hits() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let path = write_artifact(&cache, "abc-1", "song.mp3");

        cache
            .insert("http://x/1", "abc-1", "song.mp3", &path, FormatType::AudioMp3)
            .await
            .unwrap();

        let hit = cache.lookup("http://x/1", FormatType::AudioMp3).await.unwrap();
        assert_eq!(hit.artifact_id, "abc-1");
        assert_eq!(hit.file_name, "song.mp3");
        assert_eq!(hit.file_path, path);
    }

    #[tokio::test]
    async fn lookup_is_keyed_by_url_and_format() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let path = write_artifact(&cache, "abc-1", "song.mp3");
        cache
            .insert("http://x/1", "abc-1", "song.mp3", &path, FormatType::AudioMp3)
            .await
            .unwrap();

        assert!(cache.lookup("http://x/1", FormatType::AudioWav).await.is_none());
        assert!(cache.lookup("http://x/1/", FormatType::AudioMp3).await.is_none());
        assert!(cache.lookup("http://x/2", FormatType::AudioMp3).await.is_none());
    }

    #[tokio::test]
    async fn stale_record_never_hits_even_with_file_present() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let path = write_artifact(&cache, "abc-1", "song.mp3");
        let created = Utc::now();
        cache
            .insert_at("http://x/1", "abc-1", "song.mp3", &path, FormatType::AudioMp3, created)
            .await
            .unwrap();

        let just_before = created + chrono::Duration::seconds(WINDOW.as_secs() as i64 - 1);
        let at_window = created + chrono::Duration::seconds(WINDOW.as_secs() as i64);
        let later = created + chrono::Duration::hours(5);

        assert!(cache.lookup_at("http://x/1", FormatType::AudioMp3, just_before).await.is_some());
        assert!(cache.lookup_at("http://x/1", FormatType::AudioMp3, at_window).await.is_none());
        assert!(cache.lookup_at("http://x/1", FormatType::AudioMp3, later).await.is_none());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn missing_file_is_a_miss_and_record_is_kept() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let path = write_artifact(&cache, "abc-1", "song.mp3");
        cache
            .insert("http://x/1", "abc-1", "song.mp3", &path, FormatType::AudioMp3)
            .await
            .unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(cache.lookup("http://x/1", FormatType::AudioMp3).await.is_none());
        assert_eq!(cache.index().read_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn first_live_record_takes_precedence() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let now = Utc::now();

        let gone = cache.artifact_dir("gone").join("a.mp4");
        let first = write_artifact(&cache, "first", "a.mp4");
        let second = write_artifact(&cache, "second", "a.mp4");

        cache
            .insert_at("http://x/v", "gone", "a.mp4", &gone, FormatType::Video, now)
            .await
            .unwrap();
        cache
            .insert_at("http://x/v", "first", "a.mp4", &first, FormatType::Video, now)
            .await
            .unwrap();
        cache
            .insert_at("http://x/v", "second", "a.mp4", &second, FormatType::Video, now)
            .await
            .unwrap();

        let hit = cache.lookup_at("http://x/v", FormatType::Video, now).await.unwrap();
        assert_eq!(hit.artifact_id, "first");
    }

    #[tokio::test]
    async fn record_outside_its_artifact_dir_is_not_live() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let stray = write_artifact(&cache, "other", "song.mp3");
        cache
            .insert("http://x/1", "abc-1", "song.mp3", &stray, FormatType::AudioMp3)
            .await
            .unwrap();

        let sneaky = cache.artifact_dir("abc-2").join("..").join("other").join("song.mp3");
        cache
            .insert("http://x/1", "abc-2", "song.mp3", &sneaky, FormatType::AudioMp3)
            .await
            .unwrap();

        assert!(cache.lookup("http://x/1", FormatType::AudioMp3).await.is_none());
    }

    #[test]
    fn reservations_are_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);

        let first = cache.reserve_artifact("abc-1");
        let second = cache.reserve_artifact("abc-2");
        assert_eq!(cache.artifacts_in_progress().len(), 2);

        drop(first);
        let left = cache.artifacts_in_progress();
        assert!(!left.contains("abc-1"));
        assert!(left.contains("abc-2"));

        drop(second);
        assert!(cache.artifacts_in_progress().is_empty());
    }

    #[test]
    fn orphan_age_is_the_longer_of_window_and_grace() {
        let dir = TempDir::new().unwrap();
        assert_eq!(cache_in(&dir).orphan_age(), WINDOW);

        let grace = Duration::from_secs(3 * 60 * 60);
        assert_eq!(cache_in(&dir).with_orphan_grace(grace).orphan_age(), grace);
    }

    #[test]
    fn safe_components() {
        assert!(is_safe_component("abc-1"));
        assert!(is_safe_component("My Song (live).mp3"));
        assert!(!is_safe_component(""));
        assert!(!is_safe_component("."));
        assert!(!is_safe_component(".."));
        assert!(!is_safe_component("a/b"));
        assert!(!is_safe_component("a\\b"));
        assert!(!is_safe_component("/etc"));
    }
}
