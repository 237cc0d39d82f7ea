//! Relay transport: connector trait, established link, and the WebSocket
//! implementation.
//!
//! A [`RelayLink`] is a pair of channels to a pump task that owns the socket.
//! The session task only ever sees typed events; pings, framing and close
//! handshakes stay inside the pump. Dropping the link closes the connection.

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::error::RelayError;
use super::protocol::{AuthPayload, InboundEvent, OutboundEvent};
use super::wire::{self, OpenHandshake, Packet};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Buffer between the pump task and the session task, per direction.
const LINK_BUFFER: usize = 32;

/// Used when the server handshake omits ping timings.
const FALLBACK_PING_WINDOW: Duration = Duration::from_secs(45);

/// Opens authenticated links to the relay.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        relay_url: &str,
        auth: &AuthPayload,
    ) -> impl Future<Output = Result<RelayLink, RelayError>> + Send;
}

/// An authenticated, live connection to the relay.
#[derive(Debug)]
pub struct RelayLink {
    inbound: mpsc::Receiver<InboundEvent>,
    outbound: mpsc::Sender<OutboundEvent>,
}

impl RelayLink {
    pub const fn new(
        inbound: mpsc::Receiver<InboundEvent>,
        outbound: mpsc::Sender<OutboundEvent>,
    ) -> Self {
        Self { inbound, outbound }
    }

    /// Next event from the relay; `None` once the transport has closed.
    /// Cancel-safe.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        self.inbound.recv().await
    }

    /// Queue an event without waiting. Fails if the transport is gone or
    /// backed up.
    pub fn try_send(&self, event: OutboundEvent) -> Result<(), RelayError> {
        self.outbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(ev) => {
                RelayError::Connection(format!("outbound queue full, dropped {}", ev.name()))
            }
            mpsc::error::TrySendError::Closed(_) => RelayError::Connection("link closed".into()),
        })
    }
}

/// Socket.IO client over a single WebSocket (no long-polling fallback).
#[derive(Debug, Clone, Default)]
pub struct SocketIoConnector;

impl Connector for SocketIoConnector {
    async fn connect(&self, relay_url: &str, auth: &AuthPayload) -> Result<RelayLink, RelayError> {
        let url = wire::socket_io_url(relay_url)?;
        debug!(url = %url, "Opening relay WebSocket");

        let (mut ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| RelayError::Connection(e.to_string()))?;

        let open = read_open(&mut ws).await?;
        let auth = serde_json::to_value(auth)
            .map_err(|e| RelayError::Handshake(format!("failed to encode auth: {e}")))?;
        ws.send(Message::Text(wire::encode(&Packet::Connect(Some(auth)))))
            .await
            .map_err(|e| RelayError::Connection(e.to_string()))?;
        read_connect_ack(&mut ws).await?;

        info!(sid = %open.sid, "Relay session established");

        let ping_window = if open.ping_interval == 0 {
            FALLBACK_PING_WINDOW
        } else {
            Duration::from_millis(open.ping_interval + open.ping_timeout)
        };
        let (inbound_tx, inbound_rx) = mpsc::channel(LINK_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::channel(LINK_BUFFER);
        tokio::spawn(pump(ws, inbound_tx, outbound_rx, ping_window));
        Ok(RelayLink::new(inbound_rx, outbound_tx))
    }
}

async fn next_packet(ws: &mut WsStream) -> Result<Packet, RelayError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return wire::decode(&text),
            Some(Ok(Message::Close(_))) | None => {
                return Err(RelayError::Handshake("closed during handshake".into()));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(RelayError::Connection(e.to_string())),
        }
    }
}

async fn read_open(ws: &mut WsStream) -> Result<OpenHandshake, RelayError> {
    match next_packet(ws).await? {
        Packet::Open(open) => Ok(open),
        other => Err(RelayError::Handshake(format!(
            "expected open packet, got {other:?}"
        ))),
    }
}

async fn read_connect_ack(ws: &mut WsStream) -> Result<(), RelayError> {
    loop {
        match next_packet(ws).await? {
            Packet::Connect(_) => return Ok(()),
            Packet::ConnectError(message) => return Err(RelayError::Rejected(message)),
            Packet::Ping => {
                ws.send(Message::Text(wire::encode(&Packet::Pong)))
                    .await
                    .map_err(|e| RelayError::Connection(e.to_string()))?;
            }
            Packet::Noop | Packet::Pong => {}
            other => {
                return Err(RelayError::Handshake(format!(
                    "expected connect ack, got {other:?}"
                )));
            }
        }
    }
}

/// Own the socket until either side goes away.
async fn pump(
    ws: WsStream,
    inbound: mpsc::Sender<InboundEvent>,
    mut outbound: mpsc::Receiver<OutboundEvent>,
    ping_window: Duration,
) {
    let (mut write, mut read) = ws.split();
    let mut deadline = Instant::now() + ping_window;

    loop {
        tokio::select! {
            msg = read.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Relay closed the connection");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "Relay WebSocket error");
                        break;
                    }
                };
                match wire::decode(&text) {
                    Ok(Packet::Ping) => {
                        deadline = Instant::now() + ping_window;
                        if write.send(Message::Text(wire::encode(&Packet::Pong))).await.is_err() {
                            break;
                        }
                    }
                    Ok(Packet::Event { name, data }) => match InboundEvent::from_event(&name, data) {
                        Ok(event) => {
                            if inbound.send(event).await.is_err() {
                                // Session dropped the link.
                                break;
                            }
                        }
                        Err(e) => warn!(event = %name, error = %e, "Ignoring malformed relay event"),
                    },
                    Ok(Packet::Disconnect | Packet::Close) => {
                        info!("Relay ended the session");
                        break;
                    }
                    Ok(other) => debug!(packet = ?other, "Ignoring relay packet"),
                    Err(e) => warn!(error = %e, "Undecodable relay frame"),
                }
            }
            event = outbound.recv() => {
                let Some(event) = event else {
                    let _ = write.send(Message::Text(wire::encode(&Packet::Disconnect))).await;
                    let _ = write.close().await;
                    break;
                };
                let payload = match event.payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(event = event.name(), error = %e, "Failed to encode outbound event");
                        continue;
                    }
                };
                let frame = wire::encode(&Packet::Event {
                    name: event.name().to_string(),
                    data: payload,
                });
                if let Err(e) = write.send(Message::Text(frame)).await {
                    warn!(event = event.name(), error = %e, "Failed to send to relay");
                    break;
                }
            }
            () = sleep_until(deadline) => {
                warn!(window_ms = ping_window.as_millis(), "No ping from relay, assuming connection lost");
                break;
            }
        }
    }
    debug!("Relay pump stopped");
}
