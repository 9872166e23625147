use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

use crate::{error::ExtractorError, format::FormatType};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityOption {
    pub quality: String,
    pub size: u64,
    pub size_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioEstimates {
    pub mp3_320: f64,
    pub mp3_192: f64,
    pub wav: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoInfo {
    pub title: String,
    pub duration: f64,
    pub thumbnail: Option<String>,
    pub video_formats: Vec<QualityOption>,
    pub audio_estimates: AudioEstimates,
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub format: FormatType,
    /// Already created, owned exclusively by this fetch.
    pub artifact_dir: PathBuf,
    /// Max height for video, bitrate in kbps for mp3.
    pub quality: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct FetchedArtifact {
    pub file_path: PathBuf,
    pub file_name: String,
    pub title: String,
}

/// External tool that inspects and downloads media. Both calls may take
/// minutes; callers bound their concurrency.
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    async fn probe(&self, url: &str) -> Result<VideoInfo, ExtractorError>;

    async fn fetch(&self, request: FetchRequest) -> Result<FetchedArtifact, ExtractorError>;
}
