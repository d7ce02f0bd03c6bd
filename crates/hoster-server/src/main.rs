#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use hoster::Host;
use server::config::{CliArgs, ServerConfig};
use server::interceptors;
use server::telemetry::init_telemetry;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let gateway = config.gateway_enabled();
    let mut builder = Host::builder(config.host)
        .server_builder(hoster_echo::register_server)
        .unary_interceptor(interceptors::observe)
        .stream_interceptor(interceptors::observe);
    if gateway {
        builder = builder.gateway_builder(hoster_echo::register_gateway);
    }

    let result = builder
        .build()
        .listen_and_serve_with_shutdown(shutdown_signal())
        .await;

    match &result {
        Ok(()) => {
            #[cfg(feature = "tracing")]
            tracing::info!("Host shut down successfully");
        }
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::error!("Host stopped: {_e}");
        }
    }

    providers.shutdown();
    Ok(result?)
}

fn log_startup_info(_config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!("Starting host with full config: {:#?}", _config.host);
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            rpc = ?_config.host.rpc_address(),
            http = ?_config.host.http_address(),
            diagnostics = _config.host.enable_diagnostics,
            tls = _config.host.is_tls_enabled(),
            "Starting host"
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to install SIGTERM handler: {_e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(_e) = signal::ctrl_c().await {
            #[cfg(feature = "tracing")]
            tracing::error!("Failed to install Ctrl+C handler: {_e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");
}
