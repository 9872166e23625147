use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    error::ExtractorError,
    extractor::{
        AudioEstimates, FetchRequest, FetchedArtifact, MediaExtractor, QualityOption, VideoInfo,
    },
    format::FormatType,
};

const MIN_LISTED_HEIGHT: u32 = 360;
const DEFAULT_MP3_BITRATE: u32 = 320;
const WAV_POSTPROCESSOR_ARGS: &str = "ExtractAudio:-ar 44100 -ac 2 -sample_fmt s16";
const PARTIAL_SUFFIXES: [&str; 4] = ["part", "ytdl", "tmp", "temp"];

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: String,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<std::process::Output, ExtractorError> {
        let command_future = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| ExtractorError::TimedOut(self.timeout.as_secs()))?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    ExtractorError::NotInstalled
                } else {
                    ExtractorError::Io(error)
                }
            })?;

        if !output.status.success() {
            return Err(ExtractorError::Failed(run_error_message(&output.stderr)));
        }

        Ok(output)
    }
}

#[async_trait]
impl MediaExtractor for YtDlp {
    async fn probe(&self, url: &str) -> Result<VideoInfo, ExtractorError> {
        let output = self
            .run(vec![
                "-J".to_string(),
                "--no-playlist".to_string(),
                "--no-warnings".to_string(),
                "--".to_string(),
                url.to_string(),
            ])
            .await?;

        let info: YtDlpVideoInfo = serde_json::from_slice(&output.stdout)
            .map_err(|error| ExtractorError::InvalidOutput(error.to_string()))?;
        Ok(build_video_info(info))
    }

    async fn fetch(&self, request: FetchRequest) -> Result<FetchedArtifact, ExtractorError> {
        info!("Descargando {} como {}", request.url, request.format);
        let output = self.run(fetch_args(&request)).await?;
        let printed_path = extract_printed_path(&output.stdout);
        let file_path =
            resolve_downloaded_file(&request.artifact_dir, printed_path.as_deref(), request.format)
                .await?;

        let file_name = file_path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToString::to_string)
            .ok_or_else(|| {
                ExtractorError::InvalidOutput(format!(
                    "nombre de archivo invalido: {:?}",
                    file_path
                ))
            })?;
        let title = file_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(ToString::to_string)
            .unwrap_or_else(|| file_name.clone());

        Ok(FetchedArtifact {
            file_path,
            file_name,
            title,
        })
    }
}

fn fetch_args(request: &FetchRequest) -> Vec<String> {
    let output_template = format!("{}/%(title)s.%(ext)s", request.artifact_dir.to_string_lossy());

    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--newline".to_string(),
        "--print".to_string(),
        "after_move:filepath".to_string(),
        "-o".to_string(),
        output_template,
    ];

    match request.format {
        FormatType::AudioMp3 => {
            let bitrate = request.quality.unwrap_or(DEFAULT_MP3_BITRATE);
            args.extend([
                "-f".to_string(),
                "bestaudio/best".to_string(),
                "-x".to_string(),
                "--audio-format".to_string(),
                "mp3".to_string(),
                "--audio-quality".to_string(),
                format!("{bitrate}K"),
            ]);
        }
        FormatType::AudioWav => {
            args.extend([
                "-f".to_string(),
                "bestaudio/best".to_string(),
                "-x".to_string(),
                "--audio-format".to_string(),
                "wav".to_string(),
                "--postprocessor-args".to_string(),
                WAV_POSTPROCESSOR_ARGS.to_string(),
            ]);
        }
        FormatType::Video => {
            let selector = match request.quality {
                Some(height) => format!(
                    "bestvideo[height<={height}][ext=mp4]+bestaudio[ext=m4a]/\
                     best[height<={height}][ext=mp4]/best"
                ),
                None => "best[ext=mp4]/bestvideo[ext=mp4]+bestaudio[ext=m4a]/best".to_string(),
            };
            args.extend([
                "-f".to_string(),
                selector,
                "--merge-output-format".to_string(),
                "mp4".to_string(),
            ]);
        }
    }

    args.push("--".to_string());
    args.push(request.url.clone());
    args
}

fn build_video_info(info: YtDlpVideoInfo) -> VideoInfo {
    let mut by_quality: HashMap<u32, QualityOption> = HashMap::new();

    for format in info
        .formats
        .iter()
        .filter(|item| codec_present(&item.vcodec) && codec_present(&item.acodec))
    {
        let Some(height) = format.height.filter(|height| *height >= MIN_LISTED_HEIGHT) else {
            continue;
        };
        let size = format
            .filesize
            .or(format.filesize_approx)
            .filter(|value| value.is_finite() && *value > 0.0)
            .map(|value| value as u64)
            .unwrap_or_default();

        let replace = by_quality
            .get(&height)
            .is_none_or(|existing| size > existing.size);
        if replace {
            by_quality.insert(
                height,
                QualityOption {
                    quality: format!("{height}p"),
                    size,
                    size_mb: round_tenths(size as f64 / 1_048_576.0),
                },
            );
        }
    }

    let mut heights = by_quality.keys().copied().collect::<Vec<_>>();
    heights.sort_unstable_by(|a, b| b.cmp(a));
    let video_formats = heights
        .into_iter()
        .filter_map(|height| by_quality.remove(&height))
        .collect();

    let duration = info
        .duration
        .filter(|value| value.is_finite() && *value > 0.0)
        .unwrap_or_default();

    VideoInfo {
        title: info
            .title
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Sin titulo".to_string()),
        duration,
        thumbnail: info.thumbnail,
        video_formats,
        audio_estimates: AudioEstimates {
            mp3_320: estimate_mb(duration, 320.0),
            mp3_192: estimate_mb(duration, 192.0),
            wav: estimate_mb(duration, 1411.0),
        },
    }
}

/// yt-dlp reports a missing stream as the literal `none`; an absent field
/// means unknown and is kept.
fn codec_present(codec: &Option<String>) -> bool {
    codec.as_deref() != Some("none")
}

fn estimate_mb(duration_seconds: f64, kbps: f64) -> f64 {
    round_tenths(duration_seconds * kbps / 8.0 / 1024.0)
}

fn round_tenths(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn run_error_message(stderr: &[u8]) -> String {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(|line| line.trim_start_matches("ERROR:").trim().to_string())
        .filter(|line| !line.is_empty())
        .unwrap_or_else(|| "yt-dlp no pudo completar la operacion".to_string());
    let lower = message.to_ascii_lowercase();

    if lower.contains("unsupported url") {
        "URL no soportada o invalida para descarga.".to_string()
    } else if lower.contains("video unavailable") || lower.contains("private video") {
        "El video no esta disponible.".to_string()
    } else {
        message
    }
}

fn extract_printed_path(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

async fn resolve_downloaded_file(
    artifact_dir: &Path,
    printed_path: Option<&str>,
    format: FormatType,
) -> Result<PathBuf, ExtractorError> {
    let canonical_dir = tokio::fs::canonicalize(artifact_dir)
        .await
        .map_err(artifact_dir_error)?;

    if let Some(path_value) = printed_path {
        let path = PathBuf::from(path_value);
        if let Some(valid_path) = resolve_download_candidate(&canonical_dir, &path).await? {
            return Ok(valid_path);
        }

        let relative_candidate = artifact_dir.join(path_value);
        if let Some(valid_path) =
            resolve_download_candidate(&canonical_dir, &relative_candidate).await?
        {
            return Ok(valid_path);
        }
        debug!("yt-dlp imprimio una ruta no utilizable: {:?}", path_value);
    }

    let mut entries = tokio::fs::read_dir(artifact_dir)
        .await
        .map_err(artifact_dir_error)?;
    let mut fallback = None;

    while let Some(entry) = entries.next_entry().await.map_err(artifact_dir_error)? {
        let path = entry.path();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if PARTIAL_SUFFIXES.contains(&extension.as_str()) {
            continue;
        }
        let Some(valid_path) = resolve_download_candidate(&canonical_dir, &path).await? else {
            continue;
        };
        if extension == format.extension() {
            return Ok(valid_path);
        }
        fallback.get_or_insert(valid_path);
    }

    fallback.ok_or_else(|| {
        ExtractorError::Failed("No se encontro el archivo descargado.".to_string())
    })
}

async fn resolve_download_candidate(
    canonical_dir: &Path,
    candidate_path: &Path,
) -> Result<Option<PathBuf>, ExtractorError> {
    let metadata = match tokio::fs::metadata(candidate_path).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(artifact_dir_error(error)),
    };

    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical_candidate = tokio::fs::canonicalize(candidate_path)
        .await
        .map_err(artifact_dir_error)?;
    if !canonical_candidate.starts_with(canonical_dir) {
        warn!(
            "Se bloqueo un archivo fuera de la carpeta de la descarga: {:?}",
            canonical_candidate
        );
        return Ok(None);
    }

    Ok(Some(canonical_candidate))
}

fn artifact_dir_error(error: std::io::Error) -> ExtractorError {
    ExtractorError::ArtifactDir(error.to_string())
}
