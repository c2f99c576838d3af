use log::{error, info, warn};
use std::future::IntoFuture;
use time::UtcOffset;

use envlog::appliance::{ApplianceScraper, HttpFetcher};
use envlog::bluetooth::{BeaconRegistry, BluezScanner, DecoderTable};
use envlog::collector::Collector;
use envlog::config::AppConfig;
use envlog::query::QueryService;
use envlog::server;
use envlog::storage::TelemetryLog;

async fn serve(config: AppConfig, offset: UtcOffset) -> anyhow::Result<()> {
    // Rebuild the in-memory window from the journal
    let log = TelemetryLog::open(
        config.record_file.clone(),
        config.archive_dir.clone(),
        config.max_snapshots,
    )
    .await?;
    let query = QueryService::new(log.window(), log.archive());

    let registry = BeaconRegistry::from_file(
        config.device_conf.clone(),
        DecoderTable::switchbot(),
        config.stale_after,
    );
    let scraper = ApplianceScraper::new(
        HttpFetcher::new(config.http_timeout)?,
        config.appliances.clone(),
        config.get_retry,
        config.error_file.clone(),
    );
    if scraper.is_empty() {
        warn!("No appliances configured");
    }

    let collector = Collector::new(
        registry,
        BluezScanner::new(),
        scraper,
        log,
        config.rotate_at,
        offset,
    );
    let collection = tokio::spawn(collector.run());

    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    info!("Serving queries on {}", config.http_bind);
    let app = server::router(query, config.web_root.clone());

    // Run until the collector fails, the server fails or Ctrl+C
    tokio::select! {
        result = collection => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::anyhow!("Log write failed: {}", e)),
                Err(e) => Err(anyhow::anyhow!("Collector task died: {}", e)),
            }
        }
        result = axum::serve(listener, app).into_future() => {
            result.map_err(|e| anyhow::anyhow!("HTTP server failed: {}", e))
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Program terminated by user. Exiting gracefully.");
            Ok(())
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    // The local offset can only be queried reliably before worker threads exist
    let offset = UtcOffset::current_local_offset().unwrap_or_else(|_| {
        warn!("Local UTC offset unknown, rotating on UTC dates");
        UtcOffset::UTC
    });

    // Load configuration
    let config = match AppConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            return Err(e);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(serve(config, offset));
    if let Err(e) = &result {
        error!("Fatal error: {:#}", e);
    }
    result
}
