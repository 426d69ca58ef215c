use crate::monitor::{MonitorClient, MonitorError, Reply, SessionSetup, SessionState};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Upper bound on a single response read from the target.
pub const MAX_RESPONSE_LENGTH: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("No response within {0:?}")]
    Timeout(Duration),
    #[error("Target closed the connection")]
    Closed,
    #[error("Target I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Monitor reported a target failure: {0}")]
    Refused(String),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

/// Something the engine can deliver fuzzed messages to.
///
/// A target owns its connection exclusively. `send_receive` reports any
/// failure to obtain a response as an error; the engine decides whether the
/// failure is a strike or a crash.
#[async_trait]
pub trait Target: Send {
    /// (Re)establishes the connection, replacing any previous one.
    async fn connect(&mut self) -> Result<(), TargetError>;

    /// Sends one message and waits for the response.
    async fn send_receive(&mut self, message: &[u8]) -> Result<Vec<u8>, TargetError>;

    fn describe(&self) -> String;
}

/// Talks to the target directly over TCP.
pub struct TcpTarget {
    addr: SocketAddr,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTarget {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            stream: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn exchange(stream: &mut TcpStream, message: &[u8]) -> Result<Vec<u8>, TargetError> {
        stream.write_all(message).await?;
        stream.flush().await?;
        let mut buf = vec![0u8; MAX_RESPONSE_LENGTH];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(TargetError::Closed);
        }
        buf.truncate(n);
        Ok(buf)
    }
}

#[async_trait]
impl Target for TcpTarget {
    async fn connect(&mut self) -> Result<(), TargetError> {
        self.stream = None;
        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect(self.addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TargetError::Connect {
                    addr: self.addr,
                    source,
                });
            }
            Err(_) => {
                return Err(TargetError::Connect {
                    addr: self.addr,
                    source: std::io::ErrorKind::TimedOut.into(),
                });
            }
        };
        stream.set_nodelay(true)?;
        debug!("Connected to target {}", self.addr);
        self.stream = Some(stream);
        Ok(())
    }

    async fn send_receive(&mut self, message: &[u8]) -> Result<Vec<u8>, TargetError> {
        if self.stream.is_none() {
            self.connect().await?;
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(TargetError::Closed);
        };
        // One deadline covers the write, the flush and the read.
        let result = tokio::time::timeout(self.timeout, Self::exchange(stream, message))
            .await
            .unwrap_or(Err(TargetError::Timeout(self.timeout)));
        if result.is_err() {
            // The stream may hold a late response; start over on the next send.
            self.stream = None;
        }
        result
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// Delivers messages through a monitor session using `CTF`.
pub struct MonitorTarget {
    addr: SocketAddr,
    setup: SessionSetup,
    timeout: Duration,
    client: Option<MonitorClient<TcpStream>>,
}

impl MonitorTarget {
    pub fn new(addr: SocketAddr, setup: SessionSetup, timeout: Duration) -> Self {
        Self {
            addr,
            setup,
            timeout,
            client: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// State of the live session, if there is one.
    pub fn session_state(&self) -> Option<SessionState> {
        self.client.as_ref().map(MonitorClient::state)
    }
}

#[async_trait]
impl Target for MonitorTarget {
    async fn connect(&mut self) -> Result<(), TargetError> {
        self.client = None;
        let mut client = MonitorClient::connect(self.addr, self.timeout)
            .await?
            .with_response_timeout(self.timeout);
        client.prepare(&self.setup).await?;
        info!("Monitor session at {} prepared for fuzzing", self.addr);
        self.client = Some(client);
        Ok(())
    }

    async fn send_receive(&mut self, message: &[u8]) -> Result<Vec<u8>, TargetError> {
        if self.client.is_none() {
            self.connect().await?;
        }
        let Some(client) = self.client.as_mut() else {
            return Err(TargetError::Closed);
        };
        match client.call_target_with_fuzz(message, None).await {
            Ok(Reply::Ok(body)) => Ok(body.to_vec()),
            Ok(Reply::Err(body)) => Err(TargetError::Refused(
                String::from_utf8_lossy(&body).into_owned(),
            )),
            Err(e) => {
                self.client = None;
                Err(e.into())
            }
        }
    }

    fn describe(&self) -> String {
        format!("monitor://{} via {}", self.addr, self.setup.connector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{Command, Frame, MonitorCodec};
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    async fn echo_once(listener: TcpListener) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let n = socket.read(&mut buf).await.unwrap();
        socket.write_all(&buf[..n]).await.unwrap();
    }

    #[tokio::test]
    async fn tcp_target_connects_lazily_and_reads_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(echo_once(listener));

        let mut target = TcpTarget::new(addr, Duration::from_secs(5));
        assert!(!target.is_connected());
        let response = target.send_receive(b"hello").await.unwrap();
        assert_eq!(response, b"hello");
        assert!(target.is_connected());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_target_silent_peer_times_out_and_drops_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let mut target = TcpTarget::new(addr, Duration::from_millis(50));
        let err = target.send_receive(b"ping").await.unwrap_err();
        assert!(matches!(err, TargetError::Timeout(_)), "got {err:?}");
        assert!(!target.is_connected());
        server.abort();
    }

    #[tokio::test]
    async fn tcp_target_times_out_when_peer_never_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        // Far more than the socket buffers hold, so the write itself stalls.
        let message = vec![0x41u8; 64 * 1024 * 1024];
        let mut target = TcpTarget::new(addr, Duration::from_millis(200));
        let result =
            tokio::time::timeout(Duration::from_secs(5), target.send_receive(&message)).await;
        let err = result
            .expect("send_receive must give up within its own timeout")
            .unwrap_err();
        assert!(matches!(err, TargetError::Timeout(_)), "got {err:?}");
        assert!(!target.is_connected());
        server.abort();
    }

    #[tokio::test]
    async fn tcp_target_reports_closed_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let _ = socket.read(&mut buf).await;
        });

        let mut target = TcpTarget::new(addr, Duration::from_secs(5));
        let err = target.send_receive(b"ping").await.unwrap_err();
        assert!(
            matches!(err, TargetError::Closed | TargetError::Io(_)),
            "got {err:?}"
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_target_connect_failure_names_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut target = TcpTarget::new(addr, Duration::from_secs(1));
        let err = target.connect().await.unwrap_err();
        assert!(matches!(err, TargetError::Connect { addr: a, .. } if a == addr));
        assert!(target.describe().contains(&addr.to_string()));
    }

    /// Answers one monitor connection with `replies`, then hangs up.
    async fn serve_session(listener: &TcpListener, replies: Vec<Frame>) -> Vec<Command> {
        let (socket, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(socket, MonitorCodec);
        let mut received = Vec::new();
        for reply in replies {
            let Some(Ok(frame)) = framed.next().await else {
                break;
            };
            received.push(Command::from_code(&frame.code).unwrap());
            framed.send(reply).await.unwrap();
        }
        received
    }

    fn setup_replies() -> Vec<Frame> {
        vec![
            Frame::ok(&b"2.1"[..]),
            Frame::ok(Bytes::new()),
            Frame::ok(&b"alive"[..]),
            Frame::ok(Bytes::new()),
        ]
    }

    fn session_setup() -> SessionSetup {
        SessionSetup {
            version: "2.1".to_string(),
            connector: "tcp".to_string(),
            parameters: Vec::new(),
            watchers: vec!["process".to_string()],
        }
    }

    #[tokio::test]
    async fn monitor_target_prepares_session_before_fuzzing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut replies = setup_replies();
            replies.push(Frame::ok(&b"pong"[..]));
            serve_session(&listener, replies).await
        });

        let mut target = MonitorTarget::new(addr, session_setup(), Duration::from_secs(5));
        assert!(!target.is_connected());
        target.connect().await.unwrap();
        assert_eq!(target.session_state(), Some(SessionState::WatcherSet));

        let response = target.send_receive(b"ping").await.unwrap();
        assert_eq!(response, b"pong");
        assert_eq!(target.session_state(), Some(SessionState::Fuzzing));
        assert!(target.describe().contains("via tcp"));

        let received = server.await.unwrap();
        assert_eq!(
            received,
            vec![
                Command::Ayt,
                Command::Sco,
                Command::Ctt,
                Command::Swa,
                Command::Ctf
            ]
        );
    }

    #[tokio::test]
    async fn monitor_target_refusal_fails_send_and_lost_session_is_rebuilt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut first = setup_replies();
            first.push(Frame::err(&b"target down"[..]));
            first.push(Frame::ok(&b"pong"[..]));
            let first = serve_session(&listener, first).await;
            let mut second = setup_replies();
            second.push(Frame::ok(&b"back"[..]));
            let second = serve_session(&listener, second).await;
            (first, second)
        });

        let mut target = MonitorTarget::new(addr, session_setup(), Duration::from_secs(5));
        let err = target.send_receive(b"one").await.unwrap_err();
        assert!(
            matches!(err, TargetError::Refused(ref message) if message == "target down"),
            "got {err:?}"
        );
        // A refusal leaves the session usable.
        assert!(target.is_connected());
        assert_eq!(target.send_receive(b"two").await.unwrap(), b"pong");

        // The monitor hung up; the session is dropped and rebuilt on the next send.
        let err = target.send_receive(b"three").await.unwrap_err();
        assert!(matches!(err, TargetError::Monitor(_)), "got {err:?}");
        assert!(!target.is_connected());
        assert_eq!(target.send_receive(b"four").await.unwrap(), b"back");
        assert_eq!(target.session_state(), Some(SessionState::Fuzzing));

        let (first, second) = server.await.unwrap();
        let setup = [Command::Ayt, Command::Sco, Command::Ctt, Command::Swa];
        assert_eq!(first[..4], setup);
        assert_eq!(first[4..], [Command::Ctf, Command::Ctf]);
        assert_eq!(second[..4], setup);
        assert_eq!(second[4..], [Command::Ctf]);
    }
}
