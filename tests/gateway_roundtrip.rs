//! End-to-end: TCP clients -> gateway -> simulated printer and back.

use std::sync::Arc;
use std::time::Duration;

use fiscal_gateway::client::{ClientError, ClientOptions, ClientReply, GatewayClient};
use fiscal_gateway::config::GatewayConfig;
use fiscal_gateway::listener::serve_tcp;
use fiscal_gateway::printer::frame::{self, ClientId};
use fiscal_gateway::printer::simulator::SimulatedPrinter;
use fiscal_gateway::printer::transport::{DispatchError, PrinterTransport};
use fiscal_gateway::printer::{DispatcherOptions, PrinterDispatcher, StatusKind};
use fiscal_gateway::relay::NoRelay;
use fiscal_gateway::session::SessionContext;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct Gateway {
    port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl Gateway {
    async fn start(printer: Box<dyn PrinterTransport>) -> Self {
        let config = GatewayConfig::default();
        let dispatcher = PrinterDispatcher::exclusive(printer, DispatcherOptions::default()).unwrap();
        let ctx = Arc::new(SessionContext::new(&config, dispatcher, Arc::new(NoRelay)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_tcp(listener, ctx, 16, shutdown.clone()));
        Self {
            port,
            shutdown,
            server,
        }
    }

    async fn client(&self) -> GatewayClient {
        let options = ClientOptions {
            retry_delay: Duration::from_millis(50),
            max_retries: 40,
            strict_checksum: true,
        };
        GatewayClient::connect("127.0.0.1", self.port, options, self.shutdown.clone())
            .await
            .unwrap()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.server)
            .await
            .expect("listener did not stop")
            .unwrap();
    }
}

/// Printer whose link is down.
struct Unplugged;

impl PrinterTransport for Unplugged {
    fn exchange(&mut self, _frame: &[u8]) -> Result<Vec<u8>, DispatchError> {
        Err(DispatchError::Timeout(Duration::from_millis(1)))
    }

    fn description(&self) -> String {
        "Unplugged".into()
    }
}

fn status_code(reply: &ClientReply) -> String {
    match reply {
        ClientReply::Frame {
            status: Some(s), ..
        } => s.code.clone(),
        other => panic!("expected a status frame, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reset_command_round_trip() {
    let gw = Gateway::start(Box::new(SimulatedPrinter::new())).await;
    let mut client = gw.client().await;

    let reply = client.send_command("=K").await.unwrap();
    let ClientReply::Frame {
        bytes,
        payload,
        status,
    } = reply
    else {
        panic!("expected a frame");
    };
    assert_eq!(payload, "O|N|0000|Reset completato");
    assert_eq!(status.unwrap().kind, StatusKind::Success);

    // Independent checksum: XOR of everything between STX and the checksum.
    let n = bytes.len();
    let xor = bytes[1..n - 3].iter().fold(0u8, |acc, b| acc ^ b);
    assert_eq!(&bytes[n - 3..n - 1], format!("{xor:02X}").as_bytes());
    assert_eq!(bytes.len(), 11 + payload.len());

    drop(client);
    gw.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_are_served_independently() {
    let gw = Gateway::start(Box::new(SimulatedPrinter::new())).await;

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let mut client = gw.client().await;
        tasks.push(tokio::spawn(async move {
            let mut codes = Vec::new();
            for cmd in ["=K", "=C1", "=K"] {
                codes.push(status_code(&client.send_command(cmd).await.unwrap()));
            }
            codes
        }));
    }
    for t in tasks {
        assert_eq!(t.await.unwrap(), vec!["0000", "0002", "0000"]);
    }

    gw.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_printer_blocks_after_three_failures() {
    let gw = Gateway::start(Box::new(Unplugged)).await;
    let mut client = gw.client().await;

    for _ in 0..3 {
        let reply = client.send_command("=K").await.unwrap();
        assert_eq!(status_code(&reply), "0004");
    }
    let reply = client.send_command("=K").await.unwrap();
    assert_eq!(status_code(&reply), "0003");

    let reply = client.send_command("RESET").await.unwrap();
    assert_eq!(status_code(&reply), "0000");

    drop(client);
    gw.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn feed_without_relay_answers_plain_text() {
    let gw = Gateway::start(Box::new(SimulatedPrinter::new())).await;
    let mut client = gw.client().await;

    let reply = client.send_command("FEED").await.unwrap();
    assert!(matches!(reply, ClientReply::Text(ref t) if t.contains("rele")));

    // The session keeps working afterwards.
    assert_eq!(status_code(&client.send_command("=K").await.unwrap()), "0000");

    drop(client);
    gw.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_cancels_waiting_client() {
    let gw = Gateway::start(Box::new(SimulatedPrinter::new())).await;
    let mut client = gw.client().await;
    assert_eq!(status_code(&client.send_command("=K").await.unwrap()), "0000");

    let shutdown = gw.shutdown.clone();
    gw.stop().await;
    assert!(shutdown.is_cancelled());

    let err = client.send_command("=K").await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Cancelled | ClientError::Closed | ClientError::Io(_)
    ));
}

#[test]
fn frame_reference_example() {
    let bytes = frame::encode(ClientId::new("01").unwrap(), b"=K").unwrap();
    assert_eq!(&bytes[..7], b"\x0201002N");
    assert_eq!(bytes.len(), 13);
    assert_eq!(*bytes.last().unwrap(), 0x03);
}
