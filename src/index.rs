//! Durable CSV store behind the download cache.
//!
//! Every read and write goes through a single async mutex, so a full read never
//! observes a half-written row and the sweeper can hold the lock across its
//! read/rewrite cycle.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use csv::{ByteRecord, StringRecord};
use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, MutexGuard},
};
use tracing::{debug, warn};

use crate::{
    error::{IndexError, IndexResult},
    format::FormatType,
};

pub const INDEX_FILE_NAME: &str = "download_cache.csv";

const HEADER: [&str; 6] = [
    "url",
    "download_id",
    "file_name",
    "file_path",
    "download_time",
    "format_type",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub source_url: String,
    pub artifact_id: String,
    pub file_name: String,
    pub file_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub format_type: FormatType,
}

impl CacheRecord {
    fn to_row(&self) -> [String; 6] {
        [
            self.source_url.clone(),
            self.artifact_id.clone(),
            self.file_name.clone(),
            self.file_path.to_string_lossy().into_owned(),
            self.created_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.format_type.as_str().to_string(),
        ]
    }

    fn from_row(row: &StringRecord) -> Result<Self, String> {
        if row.len() != HEADER.len() {
            return Err(format!(
                "se esperaban {} columnas y hay {}",
                HEADER.len(),
                row.len()
            ));
        }

        let field = |position: usize| row.get(position).map(str::trim).unwrap_or_default();
        let required = |position: usize| {
            let value = field(position);
            if value.is_empty() {
                Err(format!("la columna {} esta vacia", HEADER[position]))
            } else {
                Ok(value.to_string())
            }
        };

        let created_at = parse_timestamp(field(4))
            .ok_or_else(|| format!("fecha invalida: {:?}", field(4)))?;
        let format_type = FormatType::parse(field(5))
            .ok_or_else(|| format!("formato invalido: {:?}", field(5)))?;

        Ok(Self {
            source_url: required(0)?,
            artifact_id: required(1)?,
            file_name: required(2)?,
            file_path: PathBuf::from(required(3)?),
            created_at,
            format_type,
        })
    }
}

/// A persisted row as seen by the sweeper: malformed rows, including ones that
/// are not valid UTF-8, are carried as raw bytes so a rewrite never drops data
/// it could not interpret.
#[derive(Debug, Clone)]
pub enum IndexEntry {
    Record(CacheRecord),
    Malformed { row: ByteRecord, reason: String },
}

#[derive(Debug)]
pub struct CacheIndex {
    path: PathBuf,
    lock: Mutex<()>,
}

pub struct IndexGuard<'a> {
    path: &'a Path,
    _held: MutexGuard<'a, ()>,
}

impl CacheIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Holds the store lock until the guard is dropped.
    pub async fn lock(&self) -> IndexGuard<'_> {
        IndexGuard {
            path: &self.path,
            _held: self.lock.lock().await,
        }
    }

    pub async fn initialize(&self) -> IndexResult<()> {
        self.lock().await.initialize().await
    }

    pub async fn append(&self, record: &CacheRecord) -> IndexResult<()> {
        self.lock().await.append(record).await
    }

    pub async fn read_all(&self) -> IndexResult<Vec<CacheRecord>> {
        self.lock().await.read_all().await
    }

    pub async fn replace_all(&self, records: &[CacheRecord]) -> IndexResult<()> {
        self.lock().await.replace_all(records).await
    }
}

impl IndexGuard<'_> {
    pub async fn initialize(&self) -> IndexResult<()> {
        if tokio::fs::try_exists(self.path)
            .await
            .map_err(|error| IndexError::io(self.path, error))?
        {
            return Ok(());
        }

        if let Some(parent) = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| IndexError::io(parent, error))?;
        }

        let header = encode_rows(std::iter::once(HEADER.map(String::from)))?;
        self.write_atomically(&header).await?;
        debug!("Indice de cache creado en {:?}", self.path);
        Ok(())
    }

    pub async fn append(&self, record: &CacheRecord) -> IndexResult<()> {
        let needs_header = match tokio::fs::metadata(self.path).await {
            Ok(metadata) => metadata.len() == 0,
            Err(error) if error.kind() == ErrorKind::NotFound => true,
            Err(error) => return Err(IndexError::io(self.path, error)),
        };

        let mut rows = Vec::with_capacity(2);
        if needs_header {
            rows.push(HEADER.map(String::from));
        }
        rows.push(record.to_row());
        let payload = encode_rows(rows)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path)
            .await
            .map_err(|error| IndexError::io(self.path, error))?;
        file.write_all(&payload)
            .await
            .map_err(|error| IndexError::io(self.path, error))?;
        file.sync_all()
            .await
            .map_err(|error| IndexError::io(self.path, error))
    }

    pub async fn read_all(&self) -> IndexResult<Vec<CacheRecord>> {
        let entries = self.read_entries().await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match entry {
                IndexEntry::Record(record) => Some(record),
                IndexEntry::Malformed { .. } => None,
            })
            .collect())
    }

    pub async fn read_entries(&self) -> IndexResult<Vec<IndexEntry>> {
        let contents = match tokio::fs::read(self.path).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(IndexError::io(self.path, error)),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(contents.as_slice());

        let mut entries = Vec::new();
        for (position, result) in reader.byte_records().enumerate() {
            let row = match result {
                Ok(row) => row,
                Err(error) => {
                    warn!(
                        "Fila {} ilegible en el indice de cache, se omite: {error}",
                        position + 1
                    );
                    continue;
                }
            };

            let parsed = StringRecord::from_byte_record(row.clone())
                .map_err(|error| format!("texto no UTF-8: {}", error.utf8_error()))
                .and_then(|text| CacheRecord::from_row(&text));
            match parsed {
                Ok(record) => entries.push(IndexEntry::Record(record)),
                Err(reason) => {
                    warn!(
                        "Fila {} malformada en el indice de cache, se omite: {reason}",
                        position + 1
                    );
                    entries.push(IndexEntry::Malformed { row, reason });
                }
            }
        }

        Ok(entries)
    }

    pub async fn replace_all(&self, records: &[CacheRecord]) -> IndexResult<()> {
        let entries = records
            .iter()
            .cloned()
            .map(IndexEntry::Record)
            .collect::<Vec<_>>();
        self.replace_entries(&entries).await
    }

    pub async fn replace_entries(&self, entries: &[IndexEntry]) -> IndexResult<()> {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(Vec::new());
        writer.write_record(HEADER)?;
        for entry in entries {
            match entry {
                IndexEntry::Record(record) => writer.write_record(record.to_row())?,
                IndexEntry::Malformed { row, .. } => writer.write_byte_record(row)?,
            }
        }
        let payload = writer
            .into_inner()
            .map_err(|error| IndexError::Encode(error.to_string()))?;

        self.write_atomically(&payload).await
    }

    async fn write_atomically(&self, payload: &[u8]) -> IndexResult<()> {
        let tmp = tmp_path(self.path);
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|error| IndexError::io(&tmp, error))?;
        file.write_all(payload)
            .await
            .map_err(|error| IndexError::io(&tmp, error))?;
        file.sync_all()
            .await
            .map_err(|error| IndexError::io(&tmp, error))?;
        drop(file);

        tokio::fs::rename(&tmp, self.path)
            .await
            .map_err(|error| IndexError::io(self.path, error))
    }
}

fn encode_rows(rows: impl IntoIterator<Item = [String; 6]>) -> IndexResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.write_record(row)?;
    }
    writer
        .into_inner()
        .map_err(|error| IndexError::Encode(error.to_string()))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// RFC 3339 first; older stores wrote naive local ISO-8601 timestamps.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(url: &str, id: &str, format_type: FormatType) -> CacheRecord {
        CacheRecord {
            source_url: url.to_string(),
            artifact_id: id.to_string(),
            file_name: "song.mp3".to_string(),
            file_path: PathBuf::from(format!("downloads/{id}/song.mp3")),
            created_at: Utc::now(),
            format_type,
        }
    }

    fn index_in(dir: &TempDir) -> CacheIndex {
        CacheIndex::new(dir.path().join(INDEX_FILE_NAME))
    }

    #[tokio::test]
    async fn initialize_writes_header_once_and_keeps_records() {
        let dir = TempDir::new().unwrap();
        let index = index_in(&dir);

        index.initialize().await.unwrap();
        let first = std::fs::read_to_string(index.path()).unwrap();
        assert_eq!(
            first.trim_end(),
            "url,download_id,file_name,file_path,download_time,format_type"
        );

        let stored = record("http://x/1", "abc-1", FormatType::AudioMp3);
        index.append(&stored).await.unwrap();
        index.initialize().await.unwrap();

        let records = index.read_all().await.unwrap();
        assert_eq!(records, vec![stored]);
    }

    #[tokio::test]
    async fn read_all_on_missing_store_is_empty() {
        let dir = TempDir::new().unwrap();
        let index = index_in(&dir);

        assert!(index.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn append_without_initialize_still_writes_header() {
        let dir = TempDir::new().unwrap();
        let index = index_in(&dir);

        index
            .append(&record("http://x/1", "a", FormatType::Video))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(index.path()).unwrap();
        assert!(contents.starts_with("url,download_id"));
        assert_eq!(index.read_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn append_keeps_insertion_order() {
        let dir = TempDir::new().unwrap();
        let index = index_in(&dir);
        index.initialize().await.unwrap();

        for id in ["a", "b", "c"] {
            index
                .append(&record("http://x/1", id, FormatType::Video))
                .await
                .unwrap();
        }

        let ids = index
            .read_all()
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.artifact_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn urls_with_commas_and_quotes_are_escaped() {
        let dir = TempDir::new().unwrap();
        let index = index_in(&dir);
        let mut stored = record("http://x/watch?v=1,2&t=\"3\"", "a", FormatType::AudioWav);
        stored.file_name = "a, \"quoted\" title.wav".to_string();
        index.append(&stored).await.unwrap();

        assert_eq!(index.read_all().await.unwrap(), vec![stored]);
    }

    #[tokio::test]
    async fn malformed_rows_are_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let index = index_in(&dir);
        std::fs::write(
            index.path(),
            "url,download_id,file_name,file_path,download_time,format_type\n\
             http://x/1,a,f.mp3,downloads/a/f.mp3,not-a-date,mp3\n\
             http://x/2,b,f.mp3\n\
             http://x/3,c,f.flac,downloads/c/f.flac,2024-01-01T00:00:00Z,flac\n\
             http://x/4,d,f.mp4,downloads/d/f.mp4,2024-01-01T00:00:00Z,mp4\n",
        )
        .unwrap();

        let records = index.read_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].artifact_id, "d");

        let entries = index.lock().await.read_entries().await.unwrap();
        let malformed = entries
            .iter()
            .filter(|entry| matches!(entry, IndexEntry::Malformed { .. }))
            .count();
        assert_eq!(malformed, 3);
    }

    #[tokio::test]
    async fn replace_all_overwrites_and_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let index = index_in(&dir);
        index.initialize().await.unwrap();
        for id in ["a", "b", "c"] {
            index
                .append(&record("http://x/1", id, FormatType::AudioMp3))
                .await
                .unwrap();
        }

        let keep = vec![record("http://x/9", "z", FormatType::Video)];
        index.replace_all(&keep).await.unwrap();

        assert_eq!(index.read_all().await.unwrap(), keep);
        assert!(!tmp_path(index.path()).exists());
    }

    #[tokio::test]
    async fn replace_entries_preserves_malformed_rows_verbatim() {
        let dir = TempDir::new().unwrap();
        let index = index_in(&dir);
        std::fs::write(
            index.path(),
            "url,download_id,file_name,file_path,download_time,format_type\n\
             http://x/1,a,f.mp3,downloads/a/f.mp3,yesterday,mp3\n",
        )
        .unwrap();

        let guard = index.lock().await;
        let entries = guard.read_entries().await.unwrap();
        guard.replace_entries(&entries).await.unwrap();
        drop(guard);

        let contents = std::fs::read_to_string(index.path()).unwrap();
        assert!(contents.contains("http://x/1,a,f.mp3,downloads/a/f.mp3,yesterday,mp3"));
    }

    #[tokio::test]
    async fn non_utf8_rows_survive_a_rewrite_byte_for_byte() {
        let dir = TempDir::new().unwrap();
        let index = index_in(&dir);
        let mut contents =
            b"url,download_id,file_name,file_path,download_time,format_type\n".to_vec();
        let bad_row = b"http://x/\xff,a,f.mp3,downloads/a/f.mp3,2024-01-01T00:00:00Z,mp3\n";
        contents.extend_from_slice(bad_row);
        std::fs::write(index.path(), &contents).unwrap();

        assert!(index.read_all().await.unwrap().is_empty());

        let guard = index.lock().await;
        let entries = guard.read_entries().await.unwrap();
        assert!(matches!(
            entries.as_slice(),
            [IndexEntry::Malformed { reason, .. }] if reason.contains("UTF-8")
        ));
        guard.replace_entries(&entries).await.unwrap();
        drop(guard);

        assert_eq!(std::fs::read(index.path()).unwrap(), contents);
    }

    #[test]
    fn parses_rfc3339_and_naive_timestamps() {
        let utc = parse_timestamp("2024-05-01T10:20:30.123456Z").unwrap();
        assert_eq!(utc.to_rfc3339_opts(SecondsFormat::Micros, true), "2024-05-01T10:20:30.123456Z");

        let naive = parse_timestamp("2024-05-01T10:20:30.500000").unwrap();
        let expected = Local
            .from_local_datetime(
                &NaiveDateTime::parse_from_str("2024-05-01 10:20:30.5", "%Y-%m-%d %H:%M:%S%.f")
                    .unwrap(),
            )
            .earliest()
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(naive, expected);

        assert!(parse_timestamp("yesterday").is_none());
    }
}
