//! # fiscal-gateway
//!
//! ```bash
//! # Serve TCP clients on :9999, printer on the LAN
//! fiscal-gateway serve --printer-tcp 10.0.70.11:3000
//!
//! # Serial client on COM1, serial printer on COM2, feed relay on COM9
//! fiscal-gateway serve --listen-serial COM1 --printer-serial COM2 --relay-port COM9
//!
//! # Bench test without hardware
//! fiscal-gateway serve --simulate
//!
//! # Send commands to a running gateway
//! fiscal-gateway send --host 127.0.0.1 --port 9999 =K "=T1/\$100"
//!
//! # List serial ports
//! fiscal-gateway ports
//! ```

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fiscal_gateway::client::{ClientOptions, ClientReply, GatewayClient};
use fiscal_gateway::config::{
    GatewayConfig, ListenEndpoint, LogFormat, LoggingConfig, PrinterEndpoint, RelayConfig,
};

/// Fiscal printer gateway
#[derive(Parser, Debug)]
#[command(name = "fiscal-gateway")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway
    Serve(ServeArgs),

    /// Send commands to a running gateway and print the replies
    Send {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value_t = 9999)]
        port: u16,

        /// Accept frames without verifying their checksum
        #[arg(long)]
        lenient: bool,

        /// Commands, sent one after the other
        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// List serial ports
    Ports,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// JSON configuration file; flags below override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// TCP port for clients
    #[arg(long, conflicts_with = "listen_serial")]
    listen_port: Option<u16>,

    /// Serve a single client on this serial port instead of TCP
    #[arg(long, value_name = "PORT")]
    listen_serial: Option<String>,

    /// Printer reachable over TCP
    #[arg(long, value_name = "HOST:PORT", conflicts_with_all = ["printer_serial", "simulate"])]
    printer_tcp: Option<String>,

    /// Printer on a serial port (9600-8N1)
    #[arg(long, value_name = "PORT", conflicts_with = "simulate")]
    printer_serial: Option<String>,

    /// Use the built-in simulated printer
    #[arg(long)]
    simulate: bool,

    /// Relay board serial port for FEED
    #[arg(long, value_name = "PORT")]
    relay_port: Option<String>,

    /// Directory for rolling log files
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

impl ServeArgs {
    fn into_config(self) -> anyhow::Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => GatewayConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => GatewayConfig::default(),
        };

        if let Some(port) = self.listen_port {
            let bind = match &config.listen {
                ListenEndpoint::Tcp { bind, .. } => bind.clone(),
                ListenEndpoint::Serial { .. } => "0.0.0.0".to_string(),
            };
            config.listen = ListenEndpoint::Tcp { bind, port };
        }
        if let Some(port_name) = self.listen_serial {
            config.listen = ListenEndpoint::Serial {
                port_name,
                client_id: "S1".to_string(),
            };
        }

        if let Some(target) = self.printer_tcp {
            let (host, port) = target
                .rsplit_once(':')
                .context("--printer-tcp expects HOST:PORT")?;
            let port = port
                .parse()
                .with_context(|| format!("invalid printer port {port:?}"))?;
            config.printer = PrinterEndpoint::Tcp {
                host: host.to_string(),
                port,
            };
        }
        if let Some(port_name) = self.printer_serial {
            config.printer = PrinterEndpoint::Serial { port_name };
        }
        if self.simulate {
            config.printer = PrinterEndpoint::Simulated;
        }

        if let Some(port_name) = self.relay_port {
            let pulse_ms = config.relay.as_ref().map_or(200, |r| r.pulse_ms);
            config.relay = Some(RelayConfig {
                port_name,
                pulse_ms,
            });
        }

        if self.log_dir.is_some() {
            config.logging.log_dir = self.log_dir;
        }
        if self.json_logs {
            config.logging.format = LogFormat::Json;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                token.cancel();
            }
            Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C"),
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let config = args.into_config()?;
            let _log_guard = fiscal_gateway::init_logging(&config.logging);

            let shutdown = CancellationToken::new();
            cancel_on_ctrl_c(shutdown.clone());
            fiscal_gateway::run(config, shutdown)
                .await
                .context("gateway failed")?;
        }

        Commands::Send {
            host,
            port,
            lenient,
            commands,
        } => {
            let _log_guard = fiscal_gateway::init_logging(&LoggingConfig::default());
            let shutdown = CancellationToken::new();
            cancel_on_ctrl_c(shutdown.clone());

            let options = ClientOptions {
                strict_checksum: !lenient,
                ..ClientOptions::default()
            };
            let mut client = GatewayClient::connect(&host, port, options, shutdown).await?;

            if commands.len() == 1 {
                match client.send_command(&commands[0]).await? {
                    ClientReply::Frame { payload, .. } => println!("{payload}"),
                    ClientReply::Text(text) => print!("{text}"),
                }
            } else {
                let report = client.send_batch(commands.as_slice()).await;
                println!(
                    "{} sent, {} succeeded, {} failed",
                    report.sent, report.succeeded, report.failed
                );
                if report.failed > 0 {
                    bail!("{} of {} commands failed", report.failed, report.sent);
                }
            }
        }

        Commands::Ports => {
            let ports = fiscal_gateway::serial::list_ports().context("listing serial ports")?;
            if ports.is_empty() {
                println!("No serial ports found");
            }
            for p in ports {
                match (&p.manufacturer, &p.product) {
                    (Some(m), Some(prod)) => println!("{:<16} {} ({m} {prod})", p.name, p.port_type),
                    _ => println!("{:<16} {}", p.name, p.port_type),
                }
            }
        }
    }

    Ok(())
}
