use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("error de E/S en el indice de cache {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("error de CSV en el indice de cache: {0}")]
    Csv(#[from] csv::Error),
    #[error("no se pudo serializar el indice de cache: {0}")]
    Encode(String),
}

impl IndexError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type IndexResult<T> = std::result::Result<T, IndexError>;

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("{0}")]
    Failed(String),
    #[error("yt-dlp no esta instalado en el sistema. Instala yt-dlp y reinicia el backend.")]
    NotInstalled,
    #[error(
        "La operacion excedio el tiempo limite de {0} segundos. Intenta con otra URL o formato."
    )]
    TimedOut(u64),
    #[error("No se pudo ejecutar yt-dlp: {0}")]
    Io(#[from] std::io::Error),
    #[error("Respuesta invalida de yt-dlp: {0}")]
    InvalidOutput(String),
    #[error("No se pudo leer la carpeta de la descarga: {0}")]
    ArtifactDir(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Formato invalido ({0}). Elige mp4, mp3 o wav.")]
    InvalidFormat(String),
    #[error("Ingresa una URL valida (http o https).")]
    InvalidUrl,
    #[error("Calidad invalida: {0}")]
    InvalidQuality(String),
    #[error("{0}")]
    ProbeFailed(String),
    #[error("{0}")]
    DownloadFailed(String),
    #[error("Archivo no encontrado")]
    FileNotFound,
    #[error("{0}")]
    Internal(String),
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;
