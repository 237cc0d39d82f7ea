//! Socket.IO v4 over Engine.IO v4 text framing.
//!
//! Only what a WebSocket-only client on the default namespace needs:
//! open/close/ping/pong at the Engine.IO layer, and connect, disconnect,
//! event and connect-error at the Socket.IO layer. Binary attachments are
//! not supported.

use serde::Deserialize;
use serde_json::Value;
use url::{Host, Url};

use super::error::RelayError;

/// Engine.IO open packet payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
}

/// One decoded text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(OpenHandshake),
    Close,
    Ping,
    Pong,
    Noop,
    /// Namespace connect; the client sends its auth here, the server its sid.
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, data: Value },
    ConnectError(String),
}

/// Decode a WebSocket text frame.
pub fn decode(frame: &str) -> Result<Packet, RelayError> {
    let mut chars = frame.chars();
    let kind = chars
        .next()
        .ok_or_else(|| RelayError::Protocol("empty frame".into()))?;
    let rest = chars.as_str();
    match kind {
        '0' => serde_json::from_str(rest)
            .map(Packet::Open)
            .map_err(|e| RelayError::Protocol(format!("bad open packet: {e}"))),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => decode_message(rest),
        '6' => Ok(Packet::Noop),
        other => Err(RelayError::Protocol(format!(
            "unknown engine packet type '{other}'"
        ))),
    }
}

fn decode_message(body: &str) -> Result<Packet, RelayError> {
    let mut chars = body.chars();
    let kind = chars
        .next()
        .ok_or_else(|| RelayError::Protocol("empty socket packet".into()))?;
    let rest = strip_namespace(chars.as_str());
    match kind {
        '0' => {
            if rest.is_empty() {
                Ok(Packet::Connect(None))
            } else {
                serde_json::from_str(rest)
                    .map(|v| Packet::Connect(Some(v)))
                    .map_err(|e| RelayError::Protocol(format!("bad connect packet: {e}")))
            }
        }
        '1' => Ok(Packet::Disconnect),
        '2' => decode_event(rest),
        '4' => {
            let message = match serde_json::from_str::<Value>(rest) {
                Ok(Value::Object(map)) => map
                    .get("message")
                    .and_then(Value::as_str)
                    .map_or_else(|| Value::Object(map.clone()).to_string(), str::to_string),
                Ok(Value::String(s)) => s,
                _ => rest.to_string(),
            };
            Ok(Packet::ConnectError(message))
        }
        other => Err(RelayError::Protocol(format!(
            "unsupported socket packet type '{other}'"
        ))),
    }
}

fn decode_event(body: &str) -> Result<Packet, RelayError> {
    // Optional ack id precedes the array.
    let body = body.trim_start_matches(|c: char| c.is_ascii_digit());
    let array: Vec<Value> = serde_json::from_str(body)
        .map_err(|e| RelayError::Protocol(format!("bad event packet: {e}")))?;
    let mut items = array.into_iter();
    let name = match items.next() {
        Some(Value::String(name)) => name,
        _ => return Err(RelayError::Protocol("event without a name".into())),
    };
    Ok(Packet::Event {
        name,
        data: items.next().unwrap_or(Value::Null),
    })
}

/// Drop a `/namespace,` prefix; this client only uses the default namespace.
fn strip_namespace(body: &str) -> &str {
    if body.starts_with('/') {
        body.split_once(',').map_or("", |(_, rest)| rest)
    } else {
        body
    }
}

/// Encode a packet as a WebSocket text frame.
pub fn encode(packet: &Packet) -> String {
    match packet {
        Packet::Open(_) | Packet::Noop => "6".to_string(),
        Packet::Close => "1".to_string(),
        Packet::Ping => "2".to_string(),
        Packet::Pong => "3".to_string(),
        Packet::Connect(None) => "40".to_string(),
        Packet::Connect(Some(auth)) => format!("40{auth}"),
        Packet::Disconnect => "41".to_string(),
        Packet::Event { name, data } => {
            format!("42{}", Value::Array(vec![Value::String(name.clone()), data.clone()]))
        }
        Packet::ConnectError(message) => {
            format!("44{}", serde_json::json!({ "message": message }))
        }
    }
}

/// Map a relay base URL to its Socket.IO WebSocket endpoint.
///
/// `https://relay.example` → `wss://relay.example/socket.io/?EIO=4&transport=websocket`
pub fn socket_io_url(relay_url: &str) -> Result<Url, RelayError> {
    let mut url =
        Url::parse(relay_url).map_err(|e| RelayError::InvalidUrl(format!("{relay_url}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RelayError::InvalidUrl(format!(
                "unsupported scheme '{other}' in {relay_url}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| RelayError::InvalidUrl(relay_url.to_string()))?;
    let path = format!("{}/socket.io/", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(Some("EIO=4&transport=websocket"));
    Ok(url)
}

/// True when the relay URL is unencrypted and not on this machine.
pub fn is_insecure_remote(relay_url: &str) -> bool {
    let Ok(url) = Url::parse(relay_url) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "ws") {
        return false;
    }
    match url.host() {
        Some(Host::Domain(domain)) => !domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(addr)) => !addr.is_loopback(),
        Some(Host::Ipv6(addr)) => !addr.is_loopback(),
        None => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_open_handshake() {
        let p = decode(r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#)
            .unwrap();
        assert_eq!(
            p,
            Packet::Open(OpenHandshake {
                sid: "abc".into(),
                ping_interval: 25000,
                ping_timeout: 20000,
            })
        );
    }

    #[test]
    fn decodes_engine_control_packets() {
        assert_eq!(decode("2").unwrap(), Packet::Ping);
        assert_eq!(decode("2probe").unwrap(), Packet::Ping);
        assert_eq!(decode("3").unwrap(), Packet::Pong);
        assert_eq!(decode("1").unwrap(), Packet::Close);
        assert_eq!(decode("6").unwrap(), Packet::Noop);
        assert!(decode("").is_err());
        assert!(decode("9").is_err());
    }

    #[test]
    fn decodes_connect_and_disconnect() {
        assert_eq!(
            decode(r#"40{"sid":"xyz"}"#).unwrap(),
            Packet::Connect(Some(json!({"sid": "xyz"})))
        );
        assert_eq!(decode("40").unwrap(), Packet::Connect(None));
        assert_eq!(decode("41").unwrap(), Packet::Disconnect);
    }

    #[test]
    fn decodes_events() {
        assert_eq!(
            decode(r#"42["welcome",{"code":"AB12","linked":false}]"#).unwrap(),
            Packet::Event {
                name: "welcome".into(),
                data: json!({"code": "AB12", "linked": false}),
            }
        );
        // ack id and namespace prefixes
        assert_eq!(
            decode(r#"4217["token_rotated",{"token":"t"}]"#).unwrap(),
            Packet::Event {
                name: "token_rotated".into(),
                data: json!({"token": "t"}),
            }
        );
        assert_eq!(
            decode(r#"42/printers,["ping"]"#).unwrap(),
            Packet::Event {
                name: "ping".into(),
                data: Value::Null,
            }
        );
        assert!(decode(r#"42[1,2]"#).is_err());
        assert!(decode(r#"42{"#).is_err());
    }

    #[test]
    fn decodes_connect_error() {
        assert_eq!(
            decode(r#"44{"message":"Invalid token"}"#).unwrap(),
            Packet::ConnectError("Invalid token".into())
        );
    }

    #[test]
    fn encodes_client_packets() {
        assert_eq!(encode(&Packet::Pong), "3");
        assert_eq!(encode(&Packet::Disconnect), "41");
        assert_eq!(
            encode(&Packet::Connect(Some(json!({"token": "t"})))),
            r#"40{"token":"t"}"#
        );
        assert_eq!(
            encode(&Packet::Event {
                name: "job_update".into(),
                data: json!({"job_id": "j1"}),
            }),
            r#"42["job_update",{"job_id":"j1"}]"#
        );
    }

    #[test]
    fn builds_socket_io_url() {
        assert_eq!(
            socket_io_url("https://printerbot.dragnai.dev").unwrap().as_str(),
            "wss://printerbot.dragnai.dev/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(
            socket_io_url("http://localhost:3000/").unwrap().as_str(),
            "ws://localhost:3000/socket.io/?EIO=4&transport=websocket"
        );
        assert!(socket_io_url("ftp://relay").is_err());
        assert!(socket_io_url("not a url").is_err());
    }

    #[test]
    fn flags_insecure_remote_relays() {
        assert!(is_insecure_remote("http://relay.example.com"));
        assert!(is_insecure_remote("ws://10.0.0.4:3000"));
        assert!(!is_insecure_remote("https://relay.example.com"));
        assert!(!is_insecure_remote("http://localhost:3000"));
        assert!(!is_insecure_remote("http://127.0.0.1:3000"));
        assert!(!is_insecure_remote("http://[::1]:3000"));
    }
}
