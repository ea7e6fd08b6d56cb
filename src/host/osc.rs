//! OSC over UDP for `send-osc` requests.

use rosc::{OscMessage, OscPacket, OscType};
use serde_json::Value;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use super::services::OscSender;
use crate::ipc::protocol::SendOscMessage;

/// Map a JSON argument to an OSC argument.
///
/// Accepts plain values and `{type, value}` objects with an explicit OSC
/// type tag (`i`, `f`, `s`, `d`, `h`, `T`, `F`, `N`).
pub fn osc_arg(value: &Value) -> Option<OscType> {
    match value {
        Value::Null => Some(OscType::Nil),
        Value::Bool(b) => Some(OscType::Bool(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) if i32::try_from(i).is_ok() => Some(OscType::Int(i as i32)),
            Some(i) => Some(OscType::Long(i)),
            None => n.as_f64().map(|f| OscType::Float(f as f32)),
        },
        Value::String(s) => Some(OscType::String(s.clone())),
        Value::Object(object) => {
            let tag = object.get("type")?.as_str()?;
            let inner = object.get("value");
            match tag {
                "i" => inner?.as_i64().map(|i| OscType::Int(i as i32)),
                "h" => inner?.as_i64().map(OscType::Long),
                "f" => inner?.as_f64().map(|f| OscType::Float(f as f32)),
                "d" => inner?.as_f64().map(OscType::Double),
                "s" => inner?.as_str().map(|s| OscType::String(s.to_string())),
                "T" => Some(OscType::Bool(true)),
                "F" => Some(OscType::Bool(false)),
                "N" => Some(OscType::Nil),
                _ => None,
            }
        }
        Value::Array(_) => None,
    }
}

/// Encode a `send-osc` request as an OSC packet.
pub fn encode(message: &SendOscMessage) -> Result<Vec<u8>, String> {
    let mut args = Vec::with_capacity(message.args.len());
    for (index, arg) in message.args.iter().enumerate() {
        args.push(osc_arg(arg).ok_or_else(|| format!("unsupported OSC argument {}", index))?);
    }
    let packet = OscPacket::Message(OscMessage {
        addr: message.path.clone(),
        args,
    });
    rosc::encoder::encode(&packet).map_err(|e| e.to_string())
}

/// Sends OSC packets from an ephemeral UDP socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpOscSender;

impl OscSender for UdpOscSender {
    fn send(&self, connection_id: &str, message: SendOscMessage) -> Result<(), String> {
        let packet = encode(&message)?;
        let connection_id = connection_id.to_string();
        tokio::spawn(async move {
            let target = format!("{}:{}", message.host, message.port);
            let result = async {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.send_to(&packet, &target).await
            }
            .await;
            match result {
                Ok(sent) => debug!("Sent {} byte OSC packet to {} for {}", sent, target, connection_id),
                Err(e) => warn!("Failed to send OSC to {} for {}: {}", target, connection_id, e),
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_arguments() {
        assert_eq!(osc_arg(&json!(5)), Some(OscType::Int(5)));
        assert_eq!(osc_arg(&json!(1.5)), Some(OscType::Float(1.5)));
        assert_eq!(osc_arg(&json!("go")), Some(OscType::String("go".to_string())));
        assert_eq!(osc_arg(&json!(true)), Some(OscType::Bool(true)));
        assert_eq!(osc_arg(&json!([1])), None);
    }

    #[test]
    fn test_typed_arguments() {
        assert_eq!(osc_arg(&json!({ "type": "f", "value": 2 })), Some(OscType::Float(2.0)));
        assert_eq!(osc_arg(&json!({ "type": "h", "value": 7 })), Some(OscType::Long(7)));
        assert_eq!(osc_arg(&json!({ "type": "x", "value": 7 })), None);
    }

    #[test]
    fn test_encode_message() {
        let message = SendOscMessage {
            host: "127.0.0.1".to_string(),
            port: 53000,
            path: "/cue/1/go".to_string(),
            args: vec![json!(1)],
        };
        let bytes = encode(&message).unwrap();
        assert!(bytes.starts_with(b"/cue/1/go\0"));
        assert_eq!(bytes.len() % 4, 0);

        let bad = SendOscMessage {
            args: vec![json!([1, 2])],
            ..message
        };
        assert!(encode(&bad).is_err());
    }

    #[tokio::test]
    async fn test_udp_sender_delivers_packet() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        UdpOscSender
            .send(
                "osc-1",
                SendOscMessage {
                    host: "127.0.0.1".to_string(),
                    port,
                    path: "/ping".to_string(),
                    args: vec![],
                },
            )
            .unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert!(buf[..len].starts_with(b"/ping\0"));
    }
}
