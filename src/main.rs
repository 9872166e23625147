use std::sync::Arc;

use media_downloader::{
    cache::DownloadCache,
    config::Config,
    http::{self, ApiError, AppState},
    index::{CacheIndex, INDEX_FILE_NAME},
    service::DownloadService,
    sweeper::{self, SweeperHandle},
    ytdlp::YtDlp,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "media_downloader=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message());
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    tokio::fs::create_dir_all(&config.downloads_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!("No se pudo crear la carpeta de descargas: {error}"))
        })?;

    let index = CacheIndex::new(config.downloads_dir.join(INDEX_FILE_NAME));
    index.initialize().await.map_err(|error| {
        ApiError::internal(format!("No se pudo inicializar el indice de cache: {error}"))
    })?;

    let cache = Arc::new(
        DownloadCache::new(
            index,
            config.downloads_dir.clone(),
            config.freshness_window,
        )
        .with_orphan_grace(config.yt_dlp_timeout),
    );

    info!("Carpeta de descargas: {:?}", config.downloads_dir);
    info!(
        "Duracion de cache: {} minutos",
        config.freshness_window.as_secs() / 60
    );

    let report = sweeper::sweep(&cache).await;
    info!(
        "Limpieza inicial: {} expiradas, {} huerfanas, {} vigentes",
        report.removed, report.orphans_removed, report.live
    );
    let sweeper_handle = SweeperHandle::start(Arc::clone(&cache), config.sweep_interval);
    info!(
        "Limpieza periodica iniciada (cada {} segundos)",
        config.sweep_interval.as_secs()
    );

    let extractor = Arc::new(YtDlp::new(config.yt_dlp_bin.clone(), config.yt_dlp_timeout));
    let service = Arc::new(DownloadService::new(
        cache,
        extractor,
        config.max_concurrent_downloads,
    ));
    let app = http::router(AppState { service });

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!(
            "No se pudo iniciar el puerto {}: {error}",
            config.bind_addr
        ))
    })?;

    info!("Backend listo en http://{}", config.bind_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|error| ApiError::internal(format!("Error del servidor HTTP: {error}")));

    sweeper_handle.stop().await;
    info!("Backend detenido");
    served
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!("No se pudo escuchar la senal de apagado: {error}");
        std::future::pending::<()>().await;
    }
}
