//! Wire protocol for the terminal WebSocket.
//!
//! Inbound control frames form a closed sum type ([`ClientFrame`]) with an
//! exhaustive match at the dispatch site — adding a message type is a
//! compile error until every consumer handles it. Outbound control frames
//! are [`ServerFrame`]; raw PTY output travels alongside them in the same
//! ordered queue as [`Outbound::Pty`].
//!
//! ## Framing
//!
//! Control frames are JSON over WebSocket **Text** frames in both
//! directions. PTY output is delivered as **Binary** frames: the shell
//! emits arbitrary octets, and a binary frame keeps them intact without a
//! JSON wrapper. Clients distinguish the two by frame type.
//!
//! Inbound text that is not valid JSON is accepted as a legacy command
//! line; valid JSON that is not a known control frame is a protocol error
//! and the frame is dropped.

use serde::{Deserialize, Serialize};

/// A control frame from the client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Application-level keepalive; the transport's own ping/pong does the
    /// real work.
    Ping,
    /// Raw keystrokes as a uint8 array, forwarded verbatim to stdin.
    Data { data: Vec<u8> },
    /// Terminal geometry change.
    Resize { dimensions: Dimensions },
    /// Legacy path: a command line, normalised to end in a single LF.
    Command { command: String },
    /// Named signal delivered in-band.
    Signal { signal: Signal },
}

/// Terminal geometry carried by [`ClientFrame::Resize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Dimensions {
    pub cols: u32,
    pub rows: u32,
}

impl Dimensions {
    /// A resize is acted on only when both axes are positive.
    pub fn is_valid(self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

/// Signals the client may send. Only SIGINT is supported; it is delivered
/// as the ETX byte on stdin rather than as a process signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Signal {
    #[serde(rename = "SIGINT")]
    Interrupt,
}

impl Signal {
    /// The in-band byte sequence this signal maps to.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Interrupt => &[0x03],
        }
    }
}

/// Result of parsing one inbound text payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A well-formed control frame.
    Control(ClientFrame),
    /// Not JSON — treated as a legacy command line.
    Legacy(String),
    /// JSON, but not a known control frame. Dropped with a warning.
    Invalid(String),
}

/// Parse one inbound text payload.
pub fn parse_inbound(text: &str) -> Inbound {
    if serde_json::from_str::<serde_json::Value>(text).is_err() {
        return Inbound::Legacy(text.to_string());
    }
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => Inbound::Control(frame),
        Err(e) => Inbound::Invalid(e.to_string()),
    }
}

/// Normalise a legacy command: strip one trailing CR/LF pair (or lone
/// terminator) and append a single LF. An empty command becomes a bare LF.
pub fn normalize_command(command: &str) -> Vec<u8> {
    let stripped = command
        .strip_suffix("\r\n")
        .or_else(|| command.strip_suffix('\n'))
        .or_else(|| command.strip_suffix('\r'))
        .unwrap_or(command);
    let mut bytes = Vec::with_capacity(stripped.len() + 1);
    bytes.extend_from_slice(stripped.as_bytes());
    bytes.push(b'\n');
    bytes
}

/// Lifecycle stage reported to the client while its shell is being
/// materialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Provisioning,
    Waiting,
    Ready,
}

/// A control frame to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Lifecycle progress while the pod is being resolved.
    Status { status: StatusKind, message: String },
    /// The session id the client should present to reattach.
    Session {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Fatal session error; the transport closes right after.
    Error { message: String },
}

/// One entry in a session's outbound queue. Control frames and PTY bytes
/// share the queue so their relative order is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Control(ServerFrame),
    Pty(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_control_variant() {
        assert_eq!(
            parse_inbound(r#"{"type":"ping"}"#),
            Inbound::Control(ClientFrame::Ping)
        );
        assert_eq!(
            parse_inbound(r#"{"type":"data","data":[101,99,104,111,10]}"#),
            Inbound::Control(ClientFrame::Data {
                data: vec![101, 99, 104, 111, 10]
            })
        );
        assert_eq!(
            parse_inbound(r#"{"type":"resize","dimensions":{"cols":200,"rows":50}}"#),
            Inbound::Control(ClientFrame::Resize {
                dimensions: Dimensions {
                    cols: 200,
                    rows: 50
                }
            })
        );
        assert_eq!(
            parse_inbound(r#"{"type":"command","command":"ls -la"}"#),
            Inbound::Control(ClientFrame::Command {
                command: "ls -la".to_string()
            })
        );
        assert_eq!(
            parse_inbound(r#"{"type":"signal","signal":"SIGINT"}"#),
            Inbound::Control(ClientFrame::Signal {
                signal: Signal::Interrupt
            })
        );
    }

    #[test]
    fn non_json_is_legacy() {
        assert_eq!(
            parse_inbound("ls -la"),
            Inbound::Legacy("ls -la".to_string())
        );
        assert_eq!(parse_inbound(""), Inbound::Legacy(String::new()));
    }

    #[test]
    fn unknown_json_is_invalid_not_legacy() {
        assert!(matches!(
            parse_inbound(r#"{"type":"upload","path":"/etc/passwd"}"#),
            Inbound::Invalid(_)
        ));
        assert!(matches!(
            parse_inbound(r#"{"type":"signal","signal":"SIGKILL"}"#),
            Inbound::Invalid(_)
        ));
        // Byte values out of u8 range are a malformed frame, not keystrokes.
        assert!(matches!(
            parse_inbound(r#"{"type":"data","data":[300]}"#),
            Inbound::Invalid(_)
        ));
    }

    #[test]
    fn command_normalisation() {
        assert_eq!(normalize_command("ls"), b"ls\n");
        assert_eq!(normalize_command("ls\n"), b"ls\n");
        assert_eq!(normalize_command("ls\r\n"), b"ls\n");
        assert_eq!(normalize_command("ls\r"), b"ls\n");
        assert_eq!(normalize_command(""), b"\n");
    }

    #[test]
    fn resize_validation() {
        assert!(Dimensions { cols: 200, rows: 50 }.is_valid());
        assert!(!Dimensions { cols: 0, rows: 50 }.is_valid());
        assert!(!Dimensions { cols: 200, rows: 0 }.is_valid());
    }

    #[test]
    fn sigint_maps_to_etx() {
        assert_eq!(Signal::Interrupt.as_bytes(), &[0x03]);
    }

    #[test]
    fn server_frames_serialise_to_contract_shapes() {
        let status = serde_json::to_value(ServerFrame::Status {
            status: StatusKind::Provisioning,
            message: "Provisioning terminal".to_string(),
        })
        .unwrap();
        assert_eq!(
            status,
            serde_json::json!({
                "type": "status",
                "status": "provisioning",
                "message": "Provisioning terminal"
            })
        );

        let session = serde_json::to_value(ServerFrame::Session {
            session_id: "abc".to_string(),
        })
        .unwrap();
        assert_eq!(
            session,
            serde_json::json!({"type": "session", "sessionId": "abc"})
        );

        let error = serde_json::to_value(ServerFrame::Error {
            message: "timeout".to_string(),
        })
        .unwrap();
        assert_eq!(
            error,
            serde_json::json!({"type": "error", "message": "timeout"})
        );
    }
}
