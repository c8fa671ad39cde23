//! Canvas sync server entry point.
//!
//! Configuration comes from `CANVAS_*` environment variables (see
//! [`ServerConfig::from_env`]); log filtering from `RUST_LOG`.

use std::process::ExitCode;

use canvas_room::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    log::info!(
        "Starting canvas server on {} (data: {})",
        config.bind_addr,
        config
            .storage_path
            .as_ref()
            .map_or_else(|| "in-memory".to_string(), |p| p.display().to_string())
    );

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    let code = tokio::select! {
        result = server.run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                log::error!("Server stopped: {e}");
                ExitCode::FAILURE
            }
        },
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                log::error!("Failed to listen for shutdown signal: {e}");
            }
            ExitCode::SUCCESS
        }
    };

    let slept = server.shutdown().await;
    log::info!("Flushed {slept} room(s); goodbye");
    code
}
