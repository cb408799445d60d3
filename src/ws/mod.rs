//! WebSocket transport for interactive terminal sessions.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /ws/terminal/{assessment_id}` with optional
//!    query parameters (`sessionId`, `newSession`, `templateType`,
//!    `customImage`, `customCpu`, `customMemory`).
//! 2. The bridge resolves or provisions the backing pod, streaming
//!    `status` frames while it waits, then opens an SSH shell inside it.
//! 3. Steady state runs two pumps — client frames to SSH stdin, PTY output
//!    to the client — until either side closes.
//! 4. On disconnect the pod is **not** deleted; the idle reaper handles
//!    expiry, which is what makes reattach-by-`sessionId` work.
//!
//! ## Message types (client → broker, JSON text frames)
//!
//! | Type      | Fields                              | Effect                          |
//! |-----------|-------------------------------------|---------------------------------|
//! | `ping`    | —                                   | none (transport pings keep the connection warm) |
//! | `data`    | `data` (uint8 array)                | bytes verbatim to stdin         |
//! | `resize`  | `dimensions.cols`, `dimensions.rows`| PTY window change               |
//! | `command` | `command`                           | legacy: line + LF to stdin      |
//! | `signal`  | `signal` (`"SIGINT"`)               | ETX byte to stdin               |
//!
//! Non-JSON text is accepted as a legacy command line.
//!
//! ## Message types (broker → client)
//!
//! | Type      | Key fields                  | Framing |
//! |-----------|-----------------------------|---------|
//! | `status`  | `status`, `message`         | Text    |
//! | `session` | `sessionId`                 | Text    |
//! | `error`   | `message`                   | Text    |
//! | PTY bytes | —                           | Binary  |
//!
//! ## Session phases
//!
//! Admitting → Provisioning → WaitingReady → Connecting → Active →
//! Closing → Closed. Transitions are monotonic; no phase is re-entered.

pub mod protocol;

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::hub::SessionHandle;
use crate::k8s::workload::{PodTarget, SessionKey};
use crate::k8s::template::PodOverrides;
use crate::ssh::SshChannel;
use crate::state::AppState;
use protocol::{
    normalize_command, parse_inbound, ClientFrame, Inbound, Outbound, ServerFrame, StatusKind,
};

/// Time allowed to write one frame to the peer.
const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Time allowed between inbound messages (renewed by the transport pong).
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Transport ping period (90 % of the read deadline).
const PING_PERIOD: Duration = Duration::from_secs(54);
/// Maximum inbound message size.
const MAX_MESSAGE_SIZE: usize = 8192;
/// Outbound queue capacity; overflow closes the session.
const OUTBOUND_CAPACITY: usize = 256;

/// Lifecycle phase of one session. Used for logging; the bridge code only
/// ever moves forward through these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Admitting,
    Provisioning,
    WaitingReady,
    Connecting,
    Active,
    Closing,
    Closed,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Admitting => "admitting",
            Self::Provisioning => "provisioning",
            Self::WaitingReady => "waiting-ready",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalQuery {
    /// Resume a prior session. Absent (or with `new_session`) a fresh id is
    /// allocated.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Force a fresh pod even when one exists for this assessment.
    #[serde(default)]
    pub new_session: bool,
    /// Pod template name (default `default`).
    #[serde(default)]
    pub template_type: Option<String>,
    #[serde(default)]
    pub custom_image: Option<String>,
    #[serde(default)]
    pub custom_cpu: Option<String>,
    #[serde(default)]
    pub custom_memory: Option<String>,
}

/// `GET /ws/terminal/{assessment_id}` — WebSocket upgrade handler.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Path(assessment_id): Path<String>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    info!("Terminal connection request for assessment {assessment_id}");
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_session(socket, state, assessment_id, query))
}

/// The session bridge: one invocation per WebSocket connection, alive from
/// Admitting through Closed.
#[allow(clippy::too_many_lines)]
async fn handle_session(
    socket: WebSocket,
    state: AppState,
    assessment_id: String,
    query: TerminalQuery,
) {
    // Admitting: mint the session key. A missing sessionId or an explicit
    // newSession allocates a fresh id.
    let session_id = match (&query.session_id, query.new_session) {
        (Some(id), false) if !id.is_empty() => id.clone(),
        _ => Uuid::new_v4().to_string(),
    };
    let mut key = SessionKey {
        assessment_id: assessment_id.clone(),
        session_id,
    };
    let connection_id = Uuid::new_v4().to_string();
    let mut phase = Phase::Admitting;

    let (out_tx, out_rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);
    let (ws_sink, mut ws_stream) = socket.split();
    let writer = tokio::spawn(writer_task(ws_sink, out_rx));
    let mut shutdown_rx = state.hub.subscribe_shutdown();

    state
        .hub
        .register(
            &connection_id,
            SessionHandle {
                assessment_id: key.assessment_id.clone(),
                session_id: key.session_id.clone(),
                outbound: out_tx.clone(),
            },
        )
        .await;

    let overrides = PodOverrides {
        template_type: query.template_type.clone().unwrap_or_default(),
        image: query.custom_image.clone().unwrap_or_default(),
        cpu: query.custom_cpu.clone().unwrap_or_default(),
        memory: query.custom_memory.clone().unwrap_or_default(),
        labels: [("created-by".to_string(), "qualifyd-broker".to_string())].into(),
        annotations: [(
            "description".to_string(),
            "On-demand terminal pod for assessment".to_string(),
        )]
        .into(),
    };

    // Provisioning through Connecting, with every failure mapped to the
    // client-facing error message that ends the session.
    let established = establish(
        &state,
        &mut key,
        &overrides,
        query.new_session,
        &out_tx,
        &mut shutdown_rx,
        &mut phase,
    )
    .await;

    match established {
        Ok(Some((ssh, heartbeat))) => {
            phase = Phase::Active;
            debug!(
                "Session {} entered phase {}",
                key.session_id,
                phase.as_str()
            );
            send_control(
                &out_tx,
                ServerFrame::Session {
                    session_id: key.session_id.clone(),
                },
            )
            .await;

            let mut ssh_closed = ssh.closed();
            read_pump(&mut ws_stream, &ssh, &mut ssh_closed, &mut shutdown_rx, &key).await;

            ssh.close().await;
            if let Some(heartbeat) = heartbeat {
                heartbeat.abort();
            }
        }
        Ok(None) => {
            // Shutdown before the shell came up; end quietly.
        }
        Err(message) => {
            warn!("Session {} failed: {message}", key.session_id);
            send_control(&out_tx, ServerFrame::Error { message }).await;
        }
    }

    // Closing → Closed: deregister exactly once, drop our producer half,
    // and let the writer drain what is queued before the socket closes.
    phase = Phase::Closing;
    debug!(
        "Session {} entered phase {}",
        key.session_id,
        phase.as_str()
    );
    state.hub.deregister(&connection_id).await;
    drop(out_tx);
    let _ = writer.await;
    phase = Phase::Closed;
    info!(
        "Terminal disconnected (assessment {}, session {}, phase {})",
        key.assessment_id,
        key.session_id,
        phase.as_str()
    );
}

/// Provisioning → WaitingReady → Connecting. Returns the live SSH channel
/// and heartbeat task on success, `Ok(None)` when the session should end
/// quietly (shutdown), or the client-facing error message.
async fn establish(
    state: &AppState,
    key: &mut SessionKey,
    overrides: &PodOverrides,
    new_session: bool,
    out_tx: &mpsc::Sender<Outbound>,
    shutdown_rx: &mut broadcast::Receiver<()>,
    phase: &mut Phase,
) -> Result<Option<(SshChannel, Option<JoinHandle<()>>)>, String> {
    let cluster = &state.config.cluster;

    *phase = Phase::Provisioning;
    send_control(
        out_tx,
        ServerFrame::Status {
            status: StatusKind::Provisioning,
            message: "Provisioning terminal".to_string(),
        },
    )
    .await;

    let target = state
        .workload
        .ensure_pod(key, overrides, new_session)
        .await
        .map_err(|e| format!("Failed to provision terminal: {e}"))?;

    // WaitingReady: poll until the orchestrator reports ready, the
    // deadline lapses, or shutdown wins.
    *phase = Phase::WaitingReady;
    let started = tokio::time::Instant::now();
    let deadline = started + Duration::from_secs(cluster.ready_timeout_secs);
    let poll_interval = Duration::from_secs(cluster.poll_interval_secs);
    let attempt_timeout = Duration::from_secs(cluster.poll_attempt_timeout_secs);

    loop {
        match tokio::time::timeout(attempt_timeout, state.workload.pod_ready(&target)).await {
            Ok(Ok(true)) => break,
            Ok(Ok(false)) => {}
            Ok(Err(e)) => warn!("Readiness poll for session {} failed: {e}", key.session_id),
            Err(_) => warn!("Readiness poll for session {} timed out", key.session_id),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!(
                "timeout waiting for terminal to become ready after {}s",
                cluster.ready_timeout_secs
            ));
        }
        send_control(
            out_tx,
            ServerFrame::Status {
                status: StatusKind::Waiting,
                message: format!(
                    "Waiting for terminal ({}s elapsed)",
                    started.elapsed().as_secs()
                ),
            },
        )
        .await;
        tokio::select! {
            () = tokio::time::sleep(poll_interval) => {}
            _ = shutdown_rx.recv() => return Ok(None),
        }
    }

    send_control(
        out_tx,
        ServerFrame::Status {
            status: StatusKind::Ready,
            message: "Terminal ready".to_string(),
        },
    )
    .await;

    // Connecting: resolve the address and bring up the shell.
    *phase = Phase::Connecting;
    let host = state
        .workload
        .address_of(&target)
        .await
        .map_err(|e| format!("Failed to resolve terminal address: {e}"))?;

    let ssh = SshChannel::connect(&host, &state.config.ssh, out_tx.clone())
        .await
        .map_err(|e| format!("Failed to connect to terminal: {e}"))?;

    let heartbeat = spawn_heartbeat(state, &target);
    Ok(Some((ssh, heartbeat)))
}

/// Periodic activity heartbeat for cluster-backed sessions. Failures are
/// logged, never fatal.
fn spawn_heartbeat(state: &AppState, target: &PodTarget) -> Option<JoinHandle<()>> {
    let PodTarget::Cluster(pod) = target else {
        return None;
    };
    let workload = state.workload.clone();
    let mut pod = pod.clone();
    let mut shutdown_rx = state.hub.subscribe_shutdown();
    let period = Duration::from_secs(state.config.terminal.heartbeat_interval_secs);

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The creation annotations are fresh; skip the immediate tick.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = workload.heartbeat(&mut pod).await {
                        warn!("Activity heartbeat for pod {} failed: {e}", pod.name);
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }))
}

/// The client→SSH pump. Runs until the client closes, the read deadline
/// lapses without a pong, the SSH stream ends, or shutdown is signalled.
async fn read_pump(
    ws_stream: &mut (impl futures::Stream<Item = Result<Message, axum::Error>> + Unpin),
    ssh: &SshChannel,
    ssh_closed: &mut tokio::sync::watch::Receiver<bool>,
    shutdown_rx: &mut broadcast::Receiver<()>,
    key: &SessionKey,
) {
    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(PONG_WAIT, ws_stream.next()) => next,
            _ = ssh_closed.changed() => {
                info!("SSH stream ended for session {}", key.session_id);
                return;
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown: closing session {}", key.session_id);
                return;
            }
        };

        let message = match next {
            Err(_) => {
                info!(
                    "Read deadline exceeded for session {}, closing",
                    key.session_id
                );
                return;
            }
            Ok(None) | Ok(Some(Err(_))) => {
                info!("WebSocket closed for session {}", key.session_id);
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        let text = match message {
            Message::Text(text) => text.to_string(),
            // Clients are expected to send text; tolerate binary payloads
            // by running them through the same dispatch.
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            // Any traffic renews the read deadline, pongs included.
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                info!("WebSocket close frame for session {}", key.session_id);
                return;
            }
        };

        if !dispatch(&text, ssh, key).await {
            return;
        }
    }
}

/// Handle one inbound payload in the Active phase. Returns `false` when
/// the session must close (stdin write failed — the SSH side is gone).
async fn dispatch(text: &str, ssh: &SshChannel, key: &SessionKey) -> bool {
    match parse_inbound(text) {
        Inbound::Control(ClientFrame::Ping) => {
            debug!("Keepalive ping from session {}", key.session_id);
            true
        }
        Inbound::Control(ClientFrame::Data { data }) => {
            if data.is_empty() {
                return true;
            }
            ssh.write(data).await.is_ok()
        }
        Inbound::Control(ClientFrame::Resize { dimensions }) => {
            if dimensions.is_valid() {
                info!(
                    "Resizing session {} to {}x{}",
                    key.session_id, dimensions.cols, dimensions.rows
                );
                if let Err(e) = ssh.resize(dimensions.cols, dimensions.rows).await {
                    warn!("Resize failed for session {}: {e}", key.session_id);
                }
            } else {
                debug!(
                    "Ignoring degenerate resize {}x{} for session {}",
                    dimensions.cols, dimensions.rows, key.session_id
                );
            }
            true
        }
        Inbound::Control(ClientFrame::Command { command }) => {
            ssh.write(normalize_command(&command)).await.is_ok()
        }
        Inbound::Control(ClientFrame::Signal { signal }) => {
            info!("Delivering {signal:?} to session {}", key.session_id);
            ssh.write(signal.as_bytes().to_vec()).await.is_ok()
        }
        Inbound::Legacy(line) => {
            let mut bytes = line.into_bytes();
            if !bytes.ends_with(b"\n") {
                bytes.push(b'\n');
            }
            ssh.write(bytes).await.is_ok()
        }
        Inbound::Invalid(reason) => {
            warn!(
                "Dropping malformed control frame from session {}: {reason}",
                key.session_id
            );
            true
        }
    }
}

/// The outbound→client pump: serialises control frames as Text, PTY bytes
/// as Binary, pings on a ticker, and closes the socket once the queue is
/// drained and all producers are gone. Each write gets its own deadline.
async fn writer_task(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            item = rx.recv() => match item {
                Some(Outbound::Control(frame)) => match serde_json::to_string(&frame) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        warn!("Failed to serialise control frame: {e}");
                        continue;
                    }
                },
                Some(Outbound::Pty(bytes)) => Message::Binary(bytes.into()),
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => Message::Ping(Vec::new().into()),
        };

        match tokio::time::timeout(WRITE_WAIT, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break,
            Err(_) => {
                warn!("Write deadline exceeded, closing writer");
                break;
            }
        }
    }
}

/// Enqueue a control frame on the outbound queue. Control frames share the
/// queue with PTY bytes so ordering is preserved; a closed queue means the
/// session is already tearing down.
async fn send_control(out_tx: &mpsc::Sender<Outbound>, frame: ServerFrame) {
    let _ = out_tx.send(Outbound::Control(frame)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_period_stays_inside_read_deadline() {
        assert!(PING_PERIOD < PONG_WAIT);
        assert_eq!(PING_PERIOD, PONG_WAIT * 9 / 10);
    }

    #[test]
    fn query_parsing_defaults() {
        let query: TerminalQuery =
            serde_urlencoded::from_str("").unwrap();
        assert!(query.session_id.is_none());
        assert!(!query.new_session);
        assert!(query.template_type.is_none());
    }

    #[test]
    fn query_parsing_full() {
        let query: TerminalQuery = serde_urlencoded::from_str(
            "sessionId=abc&newSession=true&templateType=kubernetes&customImage=img:1&customCpu=500m&customMemory=1Gi",
        )
        .unwrap();
        assert_eq!(query.session_id.as_deref(), Some("abc"));
        assert!(query.new_session);
        assert_eq!(query.template_type.as_deref(), Some("kubernetes"));
        assert_eq!(query.custom_image.as_deref(), Some("img:1"));
        assert_eq!(query.custom_cpu.as_deref(), Some("500m"));
        assert_eq!(query.custom_memory.as_deref(), Some("1Gi"));
    }

    #[test]
    fn phases_have_stable_names() {
        assert_eq!(Phase::Admitting.as_str(), "admitting");
        assert_eq!(Phase::Closed.as_str(), "closed");
    }
}
