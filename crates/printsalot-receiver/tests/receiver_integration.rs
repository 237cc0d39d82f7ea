#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end tests for the receiver pipeline.
//!
//! A fake Socket.IO relay runs in-process over a real WebSocket; the printer
//! is an ESC/POS device writing into memory. Covers pairing, token issue and
//! reconnect, job printing and status reporting.

use std::future::Future;
use std::io::{self, Cursor, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures_util::{SinkExt, StreamExt};
use image::{DynamicImage, ImageFormat, RgbImage};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message;

use printsalot_core::{ConfigStore, ReceiverConfig};
use printsalot_receiver::content::ContentResolver;
use printsalot_receiver::job::JobDispatcher;
use printsalot_receiver::printer::{DeviceConnector, EscPosDevice, PrinterDevice, PrinterSink};
use printsalot_receiver::relay::{RelayClient, RelayConfig, RelayHandle, SocketIoConnector};

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("timed out")
}

// =========================================================================
// Fake relay
// =========================================================================

/// One accepted client session on the fake relay.
struct RelayConn {
    ws: WebSocketStream<TcpStream>,
    auth: Value,
}

impl RelayConn {
    async fn emit(&mut self, name: &str, data: Value) {
        let frame = format!("42{}", json!([name, data]));
        self.ws.send(Message::Text(frame)).await.unwrap();
    }

    /// Next application event from the client, skipping control frames.
    async fn next_event(&mut self) -> (String, Value) {
        loop {
            let msg = self.ws.next().await.expect("client went away").unwrap();
            let Message::Text(text) = msg else { continue };
            let Some(body) = text.strip_prefix("42") else {
                continue;
            };
            let array: Vec<Value> = serde_json::from_str(body).unwrap();
            let name = array[0].as_str().unwrap().to_string();
            return (name, array.get(1).cloned().unwrap_or(Value::Null));
        }
    }
}

/// Start a fake relay. With `reject` set every connect is refused with a
/// Socket.IO connect error.
async fn start_relay(reject: bool) -> (String, mpsc::UnboundedReceiver<RelayConn>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
                ws.send(Message::Text(
                    r#"0{"sid":"eio-1","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#
                        .into(),
                ))
                .await
                .unwrap();
                let auth = loop {
                    match ws.next().await {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(body) = text.strip_prefix("40") {
                                break serde_json::from_str::<Value>(body).unwrap();
                            }
                        }
                        Some(Ok(_)) => {}
                        _ => return,
                    }
                };
                if reject {
                    let _ = ws
                        .send(Message::Text(r#"44{"message":"Invalid token"}"#.into()))
                        .await;
                    return;
                }
                ws.send(Message::Text(r#"40{"sid":"sio-1"}"#.into()))
                    .await
                    .unwrap();
                let _ = tx.send(RelayConn { ws, auth });
            });
        }
    });
    (format!("http://{addr}"), rx)
}

// =========================================================================
// Printer doubles
// =========================================================================

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct MemoryPrinter {
    out: SharedBuf,
}

impl DeviceConnector for MemoryPrinter {
    fn acquire(&self) -> io::Result<Box<dyn PrinterDevice>> {
        Ok(Box::new(EscPosDevice::new(self.out.clone(), 384)))
    }
}

/// Printer whose liveness probe always fails.
struct PaperOut;

impl PrinterDevice for PaperOut {
    fn probe(&mut self) -> io::Result<()> {
        Err(io::Error::other("paper end"))
    }

    fn render(&mut self, _image: &DynamicImage) -> io::Result<()> {
        panic!("render after failed probe");
    }

    fn cut(&mut self) -> io::Result<()> {
        panic!("cut after failed probe");
    }
}

impl DeviceConnector for PaperOut {
    fn acquire(&self) -> io::Result<Box<dyn PrinterDevice>> {
        Ok(Box::new(Self))
    }
}

// =========================================================================
// Receiver wiring
// =========================================================================

struct Receiver {
    relay: RelayHandle,
    store: Arc<ConfigStore>,
    _shutdown: watch::Sender<bool>,
}

fn start_receiver(store: Arc<ConfigStore>, printer: Arc<dyn DeviceConnector>) -> Receiver {
    let http = printsalot_receiver::http_client_builder()
        .no_proxy()
        .build()
        .unwrap();
    let sink = Arc::new(PrinterSink::new(printer));
    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let (client, relay) = RelayClient::new(
        SocketIoConnector,
        Arc::clone(&store),
        RelayConfig::default(),
        jobs_tx,
    );
    let dispatcher = JobDispatcher::new(ContentResolver::new(http), sink, relay.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(client.run(shutdown_rx));
    tokio::spawn(dispatcher.run(jobs_rx));
    Receiver {
        relay,
        store,
        _shutdown: shutdown_tx,
    }
}

fn png_data_uri(width: u32, height: u32) -> String {
    let mut buf = Vec::new();
    RgbImage::new(width, height)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    format!("data:image/png;base64,{}", STANDARD.encode(buf))
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn pairing_token_issue_and_print_round_trip() {
    let (relay_url, mut conns) = start_relay(false).await;
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.json");
    let store = Arc::new(
        ConfigStore::open(&config_path)
            .unwrap()
            .with_relay_override(Some(relay_url)),
    );
    let paper = SharedBuf::default();
    let rx = start_receiver(store, Arc::new(MemoryPrinter { out: paper.clone() }));

    assert!(within(rx.relay.connect()).await.unwrap());
    let mut first = within(conns.recv()).await.unwrap();
    assert!(first.auth.get("token").is_none());
    assert_eq!(first.auth["width"], 384);
    assert_eq!(first.auth["timezone"], "UTC");

    // Unlinked: the pairing code is surfaced.
    first
        .emit("welcome", json!({"code": "ABCD-1234", "linked": false}))
        .await;
    let mut state = rx.relay.watch_state();
    within(state.wait_for(|s| s.pairing_code.as_deref() == Some("ABCD-1234")))
        .await
        .unwrap();

    // Linking issues a token; the receiver reconnects with it.
    first.emit("token_issued", json!({"token": "tok-1"})).await;
    let mut second = within(conns.recv()).await.unwrap();
    assert_eq!(second.auth["token"], "tok-1");
    assert_eq!(rx.store.token().as_deref(), Some("tok-1"));
    let on_disk: ReceiverConfig =
        serde_json::from_str(&std::fs::read_to_string(&config_path).unwrap()).unwrap();
    assert_eq!(on_disk.token.as_deref(), Some("tok-1"));
    assert_eq!(rx.relay.state().pairing_code, None);

    second
        .emit(
            "print_job",
            json!({"job_id": "j1", "content": png_data_uri(16, 8), "auto_cut": true}),
        )
        .await;
    let (name, data) = within(second.next_event()).await;
    assert_eq!(name, "job_update");
    assert_eq!(data, json!({"job_id": "j1", "status": "completed"}));

    let printed = paper.bytes();
    assert!(printed.starts_with(&[0x1B, b'@']));
    assert!(printed.windows(3).any(|w| w == [0x1D, b'v', b'0']));
    assert!(printed.ends_with(&[0x1D, b'V', b'B', 0]));

    within(rx.relay.disconnect()).await.unwrap();
    assert!(!rx.relay.state().connected);
}

#[tokio::test]
async fn job_without_cut_is_not_cut() {
    let (relay_url, mut conns) = start_relay(false).await;
    let store = Arc::new(
        ConfigStore::in_memory(ReceiverConfig {
            token: Some("tok".into()),
            ..ReceiverConfig::default()
        })
        .with_relay_override(Some(relay_url)),
    );
    let paper = SharedBuf::default();
    let rx = start_receiver(store, Arc::new(MemoryPrinter { out: paper.clone() }));

    assert!(within(rx.relay.connect()).await.unwrap());
    let mut conn = within(conns.recv()).await.unwrap();
    assert_eq!(conn.auth["token"], "tok");

    conn.emit(
        "print_job",
        json!({"job_id": 7, "content": png_data_uri(8, 8), "auto_cut": false}),
    )
    .await;
    let (_, data) = within(conn.next_event()).await;
    assert_eq!(data, json!({"job_id": "7", "status": "completed"}));
    assert!(!paper.bytes().ends_with(&[0x1D, b'V', b'B', 0]));
}

#[tokio::test]
async fn paper_out_reports_failure_once() {
    let (relay_url, mut conns) = start_relay(false).await;
    let store = Arc::new(
        ConfigStore::in_memory(ReceiverConfig {
            token: Some("tok".into()),
            ..ReceiverConfig::default()
        })
        .with_relay_override(Some(relay_url)),
    );
    let rx = start_receiver(store, Arc::new(PaperOut));

    assert!(within(rx.relay.connect()).await.unwrap());
    let mut conn = within(conns.recv()).await.unwrap();

    conn.emit(
        "print_job",
        json!({"job_id": "j9", "content": png_data_uri(8, 8)}),
    )
    .await;
    let (name, data) = within(conn.next_event()).await;
    assert_eq!(name, "job_update");
    assert_eq!(
        data,
        json!({"job_id": "j9", "status": "failed", "reason": "out_of_paper"})
    );

    // No second status for the same job.
    let extra = tokio::time::timeout(Duration::from_millis(300), conn.next_event()).await;
    assert!(extra.is_err());
}

#[tokio::test]
async fn rejected_connect_stays_disconnected_and_retries() {
    let (relay_url, _conns) = start_relay(true).await;
    let store = Arc::new(
        ConfigStore::in_memory(ReceiverConfig::default()).with_relay_override(Some(relay_url)),
    );
    let rx = start_receiver(store, Arc::new(PaperOut));

    assert!(!within(rx.relay.connect()).await.unwrap());
    let state = rx.relay.state();
    assert!(!state.connected);
    assert!(state.should_reconnect);

    within(rx.relay.disconnect()).await.unwrap();
    assert!(!rx.relay.state().should_reconnect);
}
