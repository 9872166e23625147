use std::{path::PathBuf, time::Duration};

use tracing::warn;

pub const DEFAULT_DOWNLOADS_DIR: &str = "downloads";
pub const DEFAULT_FRESHNESS_MINUTES: u64 = 30;
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 5 * 60;
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
pub const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";
pub const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 180;
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub downloads_dir: PathBuf,
    pub freshness_window: Duration,
    pub sweep_interval: Duration,
    pub max_concurrent_downloads: usize,
    pub yt_dlp_bin: String,
    pub yt_dlp_timeout: Duration,
    pub bind_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            downloads_dir: PathBuf::from(DEFAULT_DOWNLOADS_DIR),
            freshness_window: Duration::from_secs(DEFAULT_FRESHNESS_MINUTES * 60),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECONDS),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            yt_dlp_bin: DEFAULT_YT_DLP_BIN.to_string(),
            yt_dlp_timeout: Duration::from_secs(DEFAULT_YT_DLP_TIMEOUT_SECONDS),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let downloads_dir = lookup("DOWNLOADS_DIR")
            .as_deref()
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or(defaults.downloads_dir);
        let freshness_window = read_positive(&lookup, "CACHE_FRESHNESS_MINUTES")
            .map(|minutes| Duration::from_secs(minutes.saturating_mul(60)))
            .unwrap_or(defaults.freshness_window);
        let sweep_interval = read_positive(&lookup, "CACHE_SWEEP_INTERVAL_SECONDS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval);
        let max_concurrent_downloads = read_positive(&lookup, "MAX_CONCURRENT_DOWNLOADS")
            .and_then(|value| usize::try_from(value).ok())
            .unwrap_or(defaults.max_concurrent_downloads);
        let yt_dlp_bin = lookup("YT_DLP_BIN")
            .as_deref()
            .and_then(non_empty)
            .map(ToString::to_string)
            .unwrap_or(defaults.yt_dlp_bin);
        let yt_dlp_timeout = read_positive(&lookup, "YT_DLP_TIMEOUT_SECONDS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.yt_dlp_timeout);

        Self {
            downloads_dir,
            freshness_window,
            sweep_interval,
            max_concurrent_downloads,
            yt_dlp_bin,
            yt_dlp_timeout,
            bind_addr: resolve_bind_addr(&lookup),
        }
    }
}

fn read_positive(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    let raw = lookup(name)?;
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            warn!("{name}={raw:?} no es un entero positivo, se usara el valor por defecto.");
            None
        }
    }
}

fn resolve_bind_addr(lookup: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(configured) = lookup("APP_ADDR")
        .as_deref()
        .and_then(non_empty)
        .map(ToString::to_string)
    {
        return configured;
    }

    if let Some(port) = lookup("PORT").and_then(|value| value.trim().parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
