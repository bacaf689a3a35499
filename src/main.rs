use std::sync::Arc;

use sfu_rooms::api::sfu_routes;
use sfu_rooms::config::Config;
use sfu_rooms::media::LocalMediaEngine;
use sfu_rooms::recording::transcoder_from_config;
use sfu_rooms::sfu::SfuServer;

#[tokio::main]
async fn main() {
    // .env has to be loaded before the log filter is read
    dotenv::dotenv().ok();
    sfu_rooms::init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    let transcoder = match transcoder_from_config(&config.recording) {
        Ok(transcoder) => transcoder,
        Err(e) => {
            tracing::error!(error = %e, "Failed to set up recording backend");
            std::process::exit(1);
        }
    };

    let engine = Arc::new(LocalMediaEngine::new(config.media.clone()));
    let bind_address = config.bind_address();
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        workers = config.media.num_workers,
        recording = config.recording.enabled,
        transcoder = transcoder.name(),
        "Starting SFU server"
    );

    let sfu_server = SfuServer::new(config, engine, transcoder);
    let supervisor = sfu_server.spawn_supervisor();

    let (addr, server) = warp::serve(sfu_routes::routes(sfu_server.clone()))
        .bind_with_graceful_shutdown(bind_address, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        });
    tracing::info!(address = %addr, "SFU server listening");
    server.await;

    sfu_server.shutdown().await;
    supervisor.abort();
}
