//! Client side of the monitor wire protocol.
//!
//! Every frame is `CCC <len> <body>`: a three-letter command code, the
//! decimal body length, a single space and exactly `len` body bytes. The
//! monitor answers each command with an `ROK` or `ERR` frame. The session
//! state machine lives on the client, so commands that are not allowed in
//! the current state never reach the wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest body the codec accepts in either direction.
pub const MAX_BODY_LENGTH: usize = 16 * 1024 * 1024;

const CODE_LEN: usize = 3;
const MAX_LENGTH_DIGITS: usize = 10;
const OK_CODE: &[u8; 3] = b"ROK";
const ERR_CODE: &[u8; 3] = b"ERR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Are-you-there, carries the protocol version.
    Ayt,
    /// List connectors.
    Gco,
    /// Select connector.
    Sco,
    /// Set connector parameters.
    Scp,
    /// Call target for testing.
    Ctt,
    /// Set watchers.
    Swa,
    /// List watchers.
    Gwa,
    /// Call target with fuzz data.
    Ctf,
    /// Reset to the initial state.
    Rst,
}

impl Command {
    pub const ALL: [Command; 9] = [
        Command::Ayt,
        Command::Gco,
        Command::Sco,
        Command::Scp,
        Command::Ctt,
        Command::Swa,
        Command::Gwa,
        Command::Ctf,
        Command::Rst,
    ];

    pub fn code(self) -> &'static [u8; 3] {
        match self {
            Command::Ayt => b"AYT",
            Command::Gco => b"GCO",
            Command::Sco => b"SCO",
            Command::Scp => b"SCP",
            Command::Ctt => b"CTT",
            Command::Swa => b"SWA",
            Command::Gwa => b"GWA",
            Command::Ctf => b"CTF",
            Command::Rst => b"RST",
        }
    }

    pub fn from_code(code: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.code()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    New,
    MonitorSet,
    ConnectorSet,
    ConnectorReady,
    WatcherSet,
    Fuzzing,
}

impl SessionState {
    /// State reached once `command` is acknowledged, or `None` when the
    /// command is not allowed here.
    pub fn next(self, command: Command) -> Option<SessionState> {
        use Command::*;
        use SessionState::*;
        match (self, command) {
            (_, Rst) if self != New => Some(New),
            (New, Ayt) => Some(MonitorSet),
            (MonitorSet, Gco) => Some(MonitorSet),
            (MonitorSet, Sco) => Some(ConnectorSet),
            (ConnectorSet | ConnectorReady, Sco | Scp) => Some(ConnectorSet),
            (ConnectorSet, Ctt) => Some(ConnectorReady),
            (ConnectorReady, Gwa) => Some(ConnectorReady),
            (ConnectorReady | WatcherSet, Swa) => Some(WatcherSet),
            (WatcherSet | Fuzzing, Ctf) => Some(Fuzzing),
            _ => None,
        }
    }

    pub fn allows(self, command: Command) -> bool {
        self.next(command).is_some()
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::New => "NEW",
            SessionState::MonitorSet => "MONITOR_SET",
            SessionState::ConnectorSet => "CONNECTOR_SET",
            SessionState::ConnectorReady => "CONNECTOR_READY",
            SessionState::WatcherSet => "WATCHER_SET",
            SessionState::Fuzzing => "FUZZING",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Command {command} is not allowed in state {state}")]
    RejectedCommand {
        command: Command,
        state: SessionState,
    },
    #[error("Monitor refused {command}: {message}")]
    Refused { command: Command, message: String },
    #[error("Unexpected response code {code:?} to {command}")]
    UnexpectedResponse { command: Command, code: String },
    #[error("Malformed monitor frame: {0}")]
    MalformedFrame(String),
    #[error("Frame body of {length} bytes exceeds the {max} byte limit")]
    FrameTooLong { length: usize, max: usize },
    #[error("Monitor closed the connection while waiting for {command}")]
    ConnectionClosed { command: Command },
    #[error("No response to {command} within {timeout:?}")]
    Timeout { command: Command, timeout: Duration },
    #[error("Failed to connect to monitor at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Monitor session is broken after an earlier failure")]
    Broken,
    #[error("Monitor exchange canceled")]
    Canceled,
    #[error("Monitor I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One protocol frame, command or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: [u8; 3],
    pub body: Bytes,
}

impl Frame {
    pub fn new(code: [u8; 3], body: impl Into<Bytes>) -> Self {
        Self {
            code,
            body: body.into(),
        }
    }

    pub fn command(command: Command, body: impl Into<Bytes>) -> Self {
        Self::new(*command.code(), body)
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(*OK_CODE, body)
    }

    pub fn err(body: impl Into<Bytes>) -> Self {
        Self::new(*ERR_CODE, body)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MonitorCodec;

impl Decoder for MonitorCodec {
    type Item = Frame;
    type Error = MonitorError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, MonitorError> {
        if src.len() <= CODE_LEN {
            return Ok(None);
        }
        if src[CODE_LEN] != b' ' {
            return Err(MonitorError::MalformedFrame(
                "missing space after command code".to_string(),
            ));
        }

        let digits_start = CODE_LEN + 1;
        let window = &src[digits_start..src.len().min(digits_start + MAX_LENGTH_DIGITS + 1)];
        let Some(digits_len) = window.iter().position(|&b| b == b' ') else {
            if window.len() > MAX_LENGTH_DIGITS {
                return Err(MonitorError::MalformedFrame(
                    "length field too long".to_string(),
                ));
            }
            if let Some(bad) = window.iter().find(|b| !b.is_ascii_digit()) {
                return Err(MonitorError::MalformedFrame(format!(
                    "invalid length byte 0x{bad:02x}"
                )));
            }
            return Ok(None);
        };

        let digits = &window[..digits_len];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(MonitorError::MalformedFrame(format!(
                "invalid length field {:?}",
                String::from_utf8_lossy(digits)
            )));
        }
        let length = digits
            .iter()
            .fold(0usize, |acc, d| acc * 10 + usize::from(d - b'0'));
        if length > MAX_BODY_LENGTH {
            return Err(MonitorError::FrameTooLong {
                length,
                max: MAX_BODY_LENGTH,
            });
        }

        let header_len = digits_start + digits_len + 1;
        if src.len() < header_len + length {
            src.reserve(header_len + length - src.len());
            return Ok(None);
        }

        let mut code = [0u8; 3];
        code.copy_from_slice(&src[..CODE_LEN]);
        src.advance(header_len);
        let body = src.split_to(length).freeze();
        Ok(Some(Frame { code, body }))
    }
}

impl Encoder<Frame> for MonitorCodec {
    type Error = MonitorError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), MonitorError> {
        if frame.body.len() > MAX_BODY_LENGTH {
            return Err(MonitorError::FrameTooLong {
                length: frame.body.len(),
                max: MAX_BODY_LENGTH,
            });
        }
        let length = frame.body.len().to_string();
        dst.reserve(CODE_LEN + length.len() + 2 + frame.body.len());
        dst.put_slice(&frame.code);
        dst.put_u8(b' ');
        dst.put_slice(length.as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(&frame.body);
        Ok(())
    }
}

/// Monitor answer to an accepted command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok(Bytes),
    Err(Bytes),
}

/// Settings replayed to bring a fresh session up to `WATCHER_SET`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionSetup {
    pub version: String,
    pub connector: String,
    pub parameters: Vec<(String, String)>,
    pub watchers: Vec<String>,
}

pub struct MonitorClient<T> {
    framed: Framed<T, MonitorCodec>,
    state: SessionState,
    broken: bool,
    response_timeout: Option<Duration>,
}

impl MonitorClient<TcpStream> {
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, MonitorError> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(MonitorError::Connect { addr, source }),
            Err(_) => {
                return Err(MonitorError::Connect {
                    addr,
                    source: std::io::ErrorKind::TimedOut.into(),
                });
            }
        };
        stream.set_nodelay(true)?;
        info!("Connected to monitor at {}", addr);
        Ok(Self::new(stream))
    }
}

impl<T> MonitorClient<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: T) -> Self {
        Self {
            framed: Framed::new(io, MonitorCodec),
            state: SessionState::New,
            broken: false,
            response_timeout: None,
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Sends `command` and waits for the monitor's answer.
    ///
    /// Commands not allowed in the current state fail without touching the
    /// connection. The state advances only on `ROK`. Any transport or framing
    /// failure, a timeout, or a cancellation after bytes went out marks the
    /// session broken; later calls fail with [`MonitorError::Broken`].
    pub async fn send_command(
        &mut self,
        command: Command,
        body: impl Into<Bytes>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Reply, MonitorError> {
        if self.broken {
            return Err(MonitorError::Broken);
        }
        let Some(next) = self.state.next(command) else {
            return Err(MonitorError::RejectedCommand {
                command,
                state: self.state,
            });
        };
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(MonitorError::Canceled);
        }

        let frame = Frame::command(command, body);
        debug!("-> {} ({} bytes)", command, frame.body.len());
        let response_timeout = self.response_timeout;
        let exchange = async {
            let round_trip = round_trip(&mut self.framed, frame, command);
            match response_timeout {
                Some(timeout) => tokio::time::timeout(timeout, round_trip)
                    .await
                    .unwrap_or(Err(MonitorError::Timeout { command, timeout })),
                None => round_trip.await,
            }
        };
        let result = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(MonitorError::Canceled),
                response = exchange => response,
            },
            None => exchange.await,
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!("Monitor session broken during {}: {}", command, e);
                self.broken = true;
                return Err(e);
            }
        };
        debug!(
            "<- {} ({} bytes)",
            String::from_utf8_lossy(&response.code),
            response.body.len()
        );
        match &response.code {
            OK_CODE => {
                if next != self.state {
                    debug!("Monitor session {} -> {}", self.state, next);
                }
                self.state = next;
                Ok(Reply::Ok(response.body))
            }
            ERR_CODE => Ok(Reply::Err(response.body)),
            other => {
                self.broken = true;
                Err(MonitorError::UnexpectedResponse {
                    command,
                    code: String::from_utf8_lossy(other).into_owned(),
                })
            }
        }
    }

    async fn expect_ok(
        &mut self,
        command: Command,
        body: impl Into<Bytes>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Bytes, MonitorError> {
        match self.send_command(command, body, cancel).await? {
            Reply::Ok(body) => Ok(body),
            Reply::Err(body) => Err(MonitorError::Refused {
                command,
                message: String::from_utf8_lossy(&body).into_owned(),
            }),
        }
    }

    /// Handshake. Returns the monitor's version string.
    pub async fn are_you_there(&mut self, version: &str) -> Result<String, MonitorError> {
        let body = self
            .expect_ok(Command::Ayt, version.as_bytes().to_vec(), None)
            .await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    pub async fn connectors(&mut self) -> Result<Vec<String>, MonitorError> {
        let body = self.expect_ok(Command::Gco, Bytes::new(), None).await?;
        Ok(split_lines(&body))
    }

    pub async fn select_connector(&mut self, name: &str) -> Result<(), MonitorError> {
        self.expect_ok(Command::Sco, name.as_bytes().to_vec(), None)
            .await
            .map(drop)
    }

    /// Sends `key=value` pairs, one per line.
    pub async fn set_connector_parameters(
        &mut self,
        parameters: &[(String, String)],
    ) -> Result<(), MonitorError> {
        let body = parameters
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("\n");
        self.expect_ok(Command::Scp, body.into_bytes(), None)
            .await
            .map(drop)
    }

    pub async fn call_target_for_testing(&mut self) -> Result<Bytes, MonitorError> {
        self.expect_ok(Command::Ctt, Bytes::new(), None).await
    }

    pub async fn set_watchers(&mut self, watchers: &[String]) -> Result<(), MonitorError> {
        self.expect_ok(Command::Swa, watchers.join("\n").into_bytes(), None)
            .await
            .map(drop)
    }

    pub async fn watchers(&mut self) -> Result<Vec<String>, MonitorError> {
        let body = self.expect_ok(Command::Gwa, Bytes::new(), None).await?;
        Ok(split_lines(&body))
    }

    /// Delivers fuzz data to the target through the monitor.
    pub async fn call_target_with_fuzz(
        &mut self,
        data: &[u8],
        cancel: Option<&CancellationToken>,
    ) -> Result<Reply, MonitorError> {
        self.send_command(Command::Ctf, data.to_vec(), cancel).await
    }

    pub async fn reset(&mut self) -> Result<(), MonitorError> {
        self.expect_ok(Command::Rst, Bytes::new(), None)
            .await
            .map(drop)
    }

    /// Drives a fresh session from `NEW` to `WATCHER_SET`.
    pub async fn prepare(&mut self, setup: &SessionSetup) -> Result<(), MonitorError> {
        let version = self.are_you_there(&setup.version).await?;
        debug!("Monitor answered handshake with {:?}", version);
        self.select_connector(&setup.connector).await?;
        if !setup.parameters.is_empty() {
            self.set_connector_parameters(&setup.parameters).await?;
        }
        self.call_target_for_testing().await?;
        self.set_watchers(&setup.watchers).await?;
        info!(
            "Monitor session ready with connector {} and {} watchers",
            setup.connector,
            setup.watchers.len()
        );
        Ok(())
    }
}

async fn round_trip<T>(
    framed: &mut Framed<T, MonitorCodec>,
    frame: Frame,
    command: Command,
) -> Result<Frame, MonitorError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(frame).await?;
    match framed.next().await {
        Some(response) => response,
        None => Err(MonitorError::ConnectionClosed { command }),
    }
}

fn split_lines(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect()
}
