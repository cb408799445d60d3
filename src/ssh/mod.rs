//! SSH channel — an interactive shell over a single TCP connection,
//! surfaced as bytes.
//!
//! [`SshChannel::connect`] dials the pod, authenticates with the shared
//! password credential, requests a PTY, and starts the user's default
//! shell. A single I/O task then owns the channel for the life of the
//! session: it forwards stdin writes and window-change requests from a
//! command queue, and pushes shell output (stdout and stderr interleaved
//! first-come-first-served) into the session's outbound queue.
//!
//! Connect failures are retried with exponential back-off (2 s doubling,
//! capped at 32 s); authentication failures are fatal immediately. No
//! retry happens in steady state — a broken channel ends the session.
//!
//! ## Host key verification
//!
//! The policy is a deliberate configuration choice, not a default:
//! `accept-any` (development clusters only — a warning is logged at
//! startup) or a pinned `SHA256:...` fingerprint checked against every
//! server key.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult};
use russh::keys::{HashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect, Pty};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::SshConfig;
use crate::ws::protocol::Outbound;

/// Initial PTY geometry requested at session start.
const INITIAL_COLS: u32 = 120;
const INITIAL_ROWS: u32 = 40;
/// Back-off cap between connect attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(32);

/// Errors from SSH channel operations.
#[derive(Debug, Error)]
pub enum SshError {
    #[error("ssh connect to {addr} failed after {attempts} attempts: {reason}")]
    Connect {
        addr: String,
        attempts: u32,
        reason: String,
    },
    #[error("ssh host key for {0} rejected by pinned fingerprint")]
    HostKey(String),
    #[error("ssh authentication failed for user {0}")]
    Auth(String),
    #[error("ssh protocol error: {0}")]
    Protocol(#[from] russh::Error),
    #[error("ssh channel closed")]
    Closed,
}

/// Host key verification policy. See module docs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    AcceptAny,
    /// Pinned `SHA256:...` fingerprint of the expected server key.
    Pinned(String),
}

impl HostKeyPolicy {
    /// Parse the configured policy string: `accept-any` or a
    /// `SHA256:...` fingerprint.
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "accept-any" => Ok(Self::AcceptAny),
            fp if fp.starts_with("SHA256:") => Ok(Self::Pinned(fp.to_string())),
            other => Err(format!(
                "invalid host key policy {other:?}: expected \"accept-any\" or a \"SHA256:...\" fingerprint"
            )),
        }
    }

    /// Whether `key` is acceptable under this policy.
    pub fn verify(&self, key: &PublicKey) -> bool {
        match self {
            Self::AcceptAny => true,
            Self::Pinned(expected) => {
                key.fingerprint(HashAlg::Sha256).to_string() == *expected
            }
        }
    }
}

struct ClientHandler {
    policy: HostKeyPolicy,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let accepted = self.policy.verify(server_public_key);
        if !accepted {
            warn!(
                "Server key {} rejected by pinned fingerprint",
                server_public_key.fingerprint(HashAlg::Sha256)
            );
        }
        Ok(accepted)
    }
}

/// Commands accepted by the channel's I/O task.
enum Command {
    /// Raw bytes for the shell's stdin, forwarded verbatim.
    Data(Vec<u8>),
    /// Window-change request.
    Resize { cols: u32, rows: u32 },
    /// Orderly teardown: stdin EOF, channel close, transport disconnect.
    Close,
}

/// Handle to a connected interactive shell.
///
/// Writes go through a small command queue to the I/O task that owns the
/// underlying channel; output arrives on the outbound queue handed to
/// [`SshChannel::connect`]. All operations on a closed channel fail with
/// [`SshError::Closed`]; `close` itself is idempotent.
pub struct SshChannel {
    commands: mpsc::Sender<Command>,
    closed: watch::Receiver<bool>,
}

impl SshChannel {
    /// Dial `host`, authenticate, negotiate a PTY, and start the shell.
    ///
    /// Shell output is pushed into `outbound`; if that queue is full the
    /// client is considered dead and the channel shuts down.
    pub async fn connect(
        host: &str,
        config: &SshConfig,
        outbound: mpsc::Sender<Outbound>,
    ) -> Result<Self, SshError> {
        let policy = HostKeyPolicy::parse(&config.host_key)
            .map_err(|reason| SshError::Connect {
                addr: host.to_string(),
                attempts: 0,
                reason,
            })?;
        let addr = format!("{host}:{}", config.port);
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);

        let mut handle = dial(&addr, &policy, config.connect_attempts, connect_timeout).await?;
        match handle
            .authenticate_password(config.user.as_str(), config.password.as_str())
            .await?
        {
            AuthResult::Success => {}
            AuthResult::Failure { .. } => {
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "auth failed", "en")
                    .await;
                return Err(SshError::Auth(config.user.clone()));
            }
        }

        let channel = handle.channel_open_session().await?;
        channel
            .request_pty(
                false,
                "xterm",
                INITIAL_COLS,
                INITIAL_ROWS,
                0,
                0,
                &[
                    (Pty::ECHO, 1),
                    (Pty::ICRNL, 1),
                    (Pty::ICANON, 1),
                    (Pty::ISIG, 1),
                    (Pty::TTY_OP_ISPEED, 14400),
                    (Pty::TTY_OP_OSPEED, 14400),
                ],
            )
            .await?;
        channel.request_shell(false).await?;

        info!("SSH shell established on {addr} as {}", config.user);

        let (commands, command_rx) = mpsc::channel(64);
        let (closed_tx, closed) = watch::channel(false);
        tokio::spawn(io_task(handle, channel, command_rx, outbound, closed_tx));

        Ok(Self { commands, closed })
    }

    /// Forward raw bytes to the shell's stdin.
    pub async fn write(&self, bytes: Vec<u8>) -> Result<(), SshError> {
        self.commands
            .send(Command::Data(bytes))
            .await
            .map_err(|_| SshError::Closed)
    }

    /// Send a window-change request.
    pub async fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        self.commands
            .send(Command::Resize { cols, rows })
            .await
            .map_err(|_| SshError::Closed)
    }

    /// Begin orderly teardown. Idempotent — closing an already-closed
    /// channel is a no-op.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
    }

    /// A watch that flips to `true` once the I/O task has exited.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }
}

/// Dial with retries: `attempts` tries, 2 s initial back-off, doubling up
/// to [`MAX_RETRY_DELAY`]. A pinned-fingerprint rejection aborts
/// immediately — retrying cannot change the server's key.
async fn dial(
    addr: &str,
    policy: &HostKeyPolicy,
    attempts: u32,
    connect_timeout: Duration,
) -> Result<client::Handle<ClientHandler>, SshError> {
    let ssh_config = Arc::new(client::Config::default());
    let mut delay = Duration::from_secs(2);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        debug!("SSH connection attempt {attempt}/{attempts} to {addr}");
        let handler = ClientHandler {
            policy: policy.clone(),
        };
        let result = tokio::time::timeout(
            connect_timeout,
            client::connect(Arc::clone(&ssh_config), addr, handler),
        )
        .await;
        match result {
            Ok(Ok(handle)) => return Ok(handle),
            Ok(Err(russh::Error::UnknownKey)) => {
                return Err(SshError::HostKey(addr.to_string()));
            }
            Ok(Err(e)) => {
                warn!("Attempt {attempt}/{attempts}: failed to dial {addr}: {e}");
                last_error = e.to_string();
            }
            Err(_) => {
                warn!(
                    "Attempt {attempt}/{attempts}: dialing {addr} timed out after {}s",
                    connect_timeout.as_secs()
                );
                last_error = "connect timeout".to_string();
            }
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_RETRY_DELAY);
        }
    }

    Err(SshError::Connect {
        addr: addr.to_string(),
        attempts,
        reason: last_error,
    })
}

/// Owns the channel until either side ends. Stdout and stderr are merged
/// into one ordered byte sequence; stream identity is not preserved.
async fn io_task(
    handle: client::Handle<ClientHandler>,
    mut channel: russh::Channel<client::Msg>,
    mut commands: mpsc::Receiver<Command>,
    outbound: mpsc::Sender<Outbound>,
    closed_tx: watch::Sender<bool>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Data(bytes)) => {
                    if let Err(e) = channel.data(&bytes[..]).await {
                        warn!("SSH stdin write failed: {e}");
                        break;
                    }
                }
                Some(Command::Resize { cols, rows }) => {
                    if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                        warn!("SSH window change failed: {e}");
                    }
                }
                Some(Command::Close) | None => break,
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    // A slow client is dead, not a reason to buffer
                    // unboundedly.
                    if outbound.try_send(Outbound::Pty(data.to_vec())).is_err() {
                        warn!("Outbound queue full, dropping session");
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if outbound.try_send(Outbound::Pty(data.to_vec())).is_err() {
                        warn!("Outbound queue full, dropping session");
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("Shell exited with status {exit_status}");
                }
                Some(ChannelMsg::Eof | ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }

    // Teardown order: stdin EOF, then the session channel, then the
    // transport.
    let _ = channel.eof().await;
    let _ = channel.close().await;
    let _ = handle
        .disconnect(Disconnect::ByApplication, "session closed", "en")
        .await;
    let _ = closed_tx.send(true);
    debug!("SSH channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parses_accept_any() {
        assert_eq!(
            HostKeyPolicy::parse("accept-any").unwrap(),
            HostKeyPolicy::AcceptAny
        );
    }

    #[test]
    fn policy_parses_pinned_fingerprint() {
        let fp = "SHA256:nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8";
        assert_eq!(
            HostKeyPolicy::parse(fp).unwrap(),
            HostKeyPolicy::Pinned(fp.to_string())
        );
    }

    #[test]
    fn policy_rejects_garbage() {
        assert!(HostKeyPolicy::parse("trust-me").is_err());
        assert!(HostKeyPolicy::parse("").is_err());
        assert!(HostKeyPolicy::parse("md5:abcdef").is_err());
    }
}
