//! Fiscal printer gateway.
//!
//! Many clients send newline-terminated text commands over TCP (or one client
//! over a serial line); the gateway frames each command for the fiscal
//! printer, exchanges it over the printer's TCP or serial link, and relays the
//! framed reply back.

pub mod client;
pub mod config;
pub mod diagnostics;
pub mod listener;
pub mod printer;
pub mod relay;
pub mod serial;
pub mod session;

use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{ConfigError, GatewayConfig, ListenEndpoint, LogFormat, LoggingConfig};
use printer::{ClientId, DispatchError, FrameError, PrinterDispatcher};
use relay::{NoRelay, Relay, SerialRelay};
use session::SessionContext;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("printer unavailable: {0}")]
    Printer(#[from] DispatchError),

    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid serial client id: {0}")]
    ClientId(#[from] FrameError),
}

// ============================================================================
// Logging
// ============================================================================

/// Install the global subscriber: console output plus an optional rolling
/// daily file. Keep the returned guard alive until exit so the file writer
/// flushes.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fiscal_gateway=debug"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => match std::fs::create_dir_all(dir) {
            Ok(()) => {
                diagnostics::prune_old_logs(dir);
                let appender = tracing_appender::rolling::daily(dir, diagnostics::LOG_FILE_PREFIX);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!("cannot create log directory {}: {e}", dir.display());
                (None, None)
            }
        },
        None => (None, None),
    };

    let (text_layer, json_layer) = match config.format {
        LogFormat::Text => (Some(fmt::layer().with_target(true)), None),
        LogFormat::Json => (None, Some(fmt::layer().json().with_target(true))),
    };

    // A subscriber may already be installed (tests, embedding applications).
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init();

    guard
}

// ============================================================================
// Gateway entry point
// ============================================================================

/// Run the gateway until `shutdown` is cancelled.
pub async fn run(config: GatewayConfig, shutdown: CancellationToken) -> Result<(), GatewayError> {
    config.validate()?;

    let build = diagnostics::build_info();
    info!(
        version = build.version,
        git_sha = build.git_sha,
        built = build.build_timestamp,
        platform = build.platform,
        arch = build.arch,
        "Starting fiscal gateway"
    );

    let dispatcher = PrinterDispatcher::from_config(&config)?;
    info!(printer = dispatcher.description(), "Printer dispatcher ready");

    let relay: Arc<dyn Relay> = match &config.relay {
        Some(r) => Arc::new(SerialRelay::init(&r.port_name)),
        None => Arc::new(NoRelay),
    };

    let ctx = Arc::new(SessionContext::new(&config, dispatcher, relay));

    match &config.listen {
        ListenEndpoint::Tcp { bind, port } => {
            let addr = format!("{bind}:{port}");
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|source| GatewayError::Bind {
                    addr: addr.clone(),
                    source,
                })?;
            listener::serve_tcp(listener, ctx, config.limits.max_sessions, shutdown).await;
        }
        ListenEndpoint::Serial {
            port_name,
            client_id,
        } => {
            let client_id = ClientId::new(client_id)?;
            listener::serve_serial(
                port_name.clone(),
                client_id,
                ctx,
                config.timeouts.inter_byte(),
                shutdown,
            )
            .await;
        }
    }

    info!("Gateway stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::PrinterEndpoint;

    #[tokio::test]
    async fn test_run_rejects_invalid_config() {
        let mut config = GatewayConfig::default();
        config.limits.max_consecutive_errors = 0;
        let err = run(config, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[tokio::test]
    async fn test_run_fails_when_serial_printer_missing() {
        let mut config = GatewayConfig::default();
        config.printer = PrinterEndpoint::Serial {
            port_name: "/dev/definitely-not-a-printer".into(),
        };
        let err = run(config, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Printer(DispatchError::DeviceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut config = GatewayConfig::default();
        config.printer = PrinterEndpoint::Simulated;
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        config.listen = ListenEndpoint::Tcp {
            bind: "127.0.0.1".into(),
            port,
        };

        let token = CancellationToken::new();
        token.cancel();
        run(config, token).await.unwrap();
    }
}
