//! The connection engine.
//!
//! One task owns the socket and the pending-reply queue for the lifetime
//! of a client.  The lifecycle is an explicit state machine driven by a
//! single loop:
//!
//! ```text
//! Idle → Connecting → Handshaking → Connected → Closing → Closed
//!                 ↘ Reconnecting ↙ (unexpected disconnect, with budget)
//! ```
//!
//! Commands arrive over an mpsc channel; writing the bytes and registering
//! the continuation happen in one task step, so inbound frame delivery can
//! never interleave between them and replies always match the pending-queue
//! head in write order.
//!
//! # Handshake
//! The server opens with `+HI {"v":…[,"s":…,"i":…]}`.  The engine checks
//! the protocol version, answers `HELLO` with hostname, labels, version,
//! worker identity (when configured), and the iterated password hash (when
//! the greeting carries a salt), then requires `+OK`.
//!
//! # Reconnect
//! An unexpected disconnect drains the pending queue with a
//! connection-lost error, then retries with linear backoff
//! (`delay × attempt`) while the attempt counter stays within the
//! configured budget.  The counter resets once a handshake completes.
//! Exhausting the budget terminates the engine and is surfaced as a
//! [`ConnectionEvent::Terminated`].

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use faktory_protocol::frame::{Frame, FrameDecoder};
use faktory_protocol::{Command, HelloPayload, PROTOCOL_VERSION, hash_password};

use crate::config::Config;
use crate::error::ClientError;
use crate::events::ConnectionEvent;
use crate::pending::{PendingReplies, ReplyTx};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Idle,
    Connecting,
    Handshaking,
    Connected,
    Reconnecting,
    Closing,
    Closed,
}

/// A request from the command surface to the engine.
pub(crate) enum Request {
    Command { command: Command, reply: ReplyTx },
    Close { done: oneshot::Sender<()> },
}

/// How one served session ended.
enum SessionEnd {
    /// Deliberate `END` + half-close; no reconnect.
    Closed,
    /// The socket died underneath us or the reply stream desynchronized.
    Lost(ClientError),
}

/// What the socket produced next.
enum ReadOutcome {
    Frame(Frame),
    /// A correctly delimited frame with an unparseable body; fails only
    /// the head pending entry.
    Recoverable(ClientError),
    Eof,
}

pub(crate) struct Engine {
    cfg: Config,
    requests: mpsc::Receiver<Request>,
    events: broadcast::Sender<ConnectionEvent>,
    pending: PendingReplies,
}

impl Engine {
    pub(crate) fn new(
        cfg: Config,
        requests: mpsc::Receiver<Request>,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        Engine {
            cfg,
            requests,
            events,
            pending: PendingReplies::new(),
        }
    }

    /// Drive the connection until it is closed or terminated.  `ready`
    /// resolves once the first handshake completes (or fails for good).
    pub(crate) async fn run(self, ready: oneshot::Sender<Result<(), ClientError>>) {
        let Engine {
            cfg,
            mut requests,
            events,
            mut pending,
        } = self;
        let mut state = ConnState::Idle;
        let mut ready = Some(ready);
        let mut attempt: u32 = 0;

        loop {
            let mut session = match establish(&cfg, &mut state).await {
                Ok(session) => session,
                Err(err) => {
                    if err.is_retryable() && attempt < cfg.reconnect_limit {
                        attempt += 1;
                        if wait_backoff(&cfg, &mut requests, &events, &mut state, attempt).await {
                            continue;
                        }
                        finish_closed(&mut requests, &events, &mut state);
                        return;
                    }
                    finish_terminated(err, &mut requests, &events, &mut state, &mut pending, &mut ready);
                    return;
                }
            };

            attempt = 0;
            transition(&mut state, ConnState::Connected);
            if let Some(tx) = ready.take() {
                let _ = tx.send(Ok(()));
            }
            let _ = events.send(ConnectionEvent::Connected);
            info!(host = %cfg.host, port = cfg.port, "session established");

            match serve(&cfg, &mut requests, &mut pending, &mut session, &mut state).await {
                SessionEnd::Closed => {
                    finish_closed(&mut requests, &events, &mut state);
                    return;
                }
                SessionEnd::Lost(err) => {
                    warn!(error = %err, in_flight = pending.len(), "session lost");
                    pending.drain(&ClientError::ConnectionLost);
                    if attempt < cfg.reconnect_limit {
                        attempt += 1;
                        if wait_backoff(&cfg, &mut requests, &events, &mut state, attempt).await {
                            continue;
                        }
                        finish_closed(&mut requests, &events, &mut state);
                        return;
                    }
                    finish_terminated(err, &mut requests, &events, &mut state, &mut pending, &mut ready);
                    return;
                }
            }
        }
    }
}

fn transition(state: &mut ConnState, next: ConnState) {
    debug!(from = ?*state, to = ?next, "connection state");
    *state = next;
}

/// Open the socket and run the handshake.
async fn establish(cfg: &Config, state: &mut ConnState) -> Result<Session<TcpStream>, ClientError> {
    transition(state, ConnState::Connecting);
    debug!(host = %cfg.host, port = cfg.port, "connecting");
    let stream = TcpStream::connect((cfg.host.as_str(), cfg.port))
        .await
        .map_err(|e| ClientError::Connect(format!("{}:{}: {e}", cfg.host, cfg.port)))?;

    transition(state, ConnState::Handshaking);
    let mut session = Session::new(stream);
    handshake(cfg, &mut session).await?;
    Ok(session)
}

/// Read the greeting, answer HELLO, require `+OK`.
async fn handshake<S>(cfg: &Config, session: &mut Session<S>) -> Result<(), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting = match session.read_frame().await? {
        Frame::Hello(greeting) => greeting,
        other => {
            return Err(ClientError::Handshake(format!(
                "expected HI greeting, got {other:?}"
            )));
        }
    };
    if greeting.v != PROTOCOL_VERSION {
        return Err(ClientError::VersionMismatch { server: greeting.v });
    }

    let pwdhash = match &greeting.s {
        Some(salt) => {
            let password = cfg.password.as_deref().ok_or_else(|| {
                ClientError::Handshake("server requires a password, none configured".to_owned())
            })?;
            let hash = hash_password(password, salt, greeting.i.unwrap_or(1))
                .map_err(|e| ClientError::Handshake(e.to_string()))?;
            Some(hash)
        }
        None => None,
    };

    let payload = HelloPayload {
        hostname: local_hostname(),
        labels: cfg.labels.clone(),
        v: PROTOCOL_VERSION,
        pid: cfg.wid.as_ref().map(|_| std::process::id()),
        wid: cfg.wid.clone(),
        pwdhash,
    };
    let hello = Command::hello(&payload).map_err(|e| ClientError::Handshake(e.to_string()))?;
    session.write(&hello.encode()).await?;

    match session.read_frame().await? {
        Frame::Inline(status) if status == "OK" => Ok(()),
        Frame::Error(message) => Err(ClientError::Handshake(message)),
        other => Err(ClientError::Handshake(format!(
            "expected OK after HELLO, got {other:?}"
        ))),
    }
}

/// Serve one established session until it closes or dies.
async fn serve<S>(
    cfg: &Config,
    requests: &mut mpsc::Receiver<Request>,
    pending: &mut PendingReplies,
    session: &mut Session<S>,
    state: &mut ConnState,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            req = requests.recv() => match req {
                // All client handles dropped: end the session politely.
                None => {
                    transition(state, ConnState::Closing);
                    let _ = session.write(&Command::end().encode()).await;
                    let _ = session.shutdown().await;
                    return SessionEnd::Closed;
                }
                Some(Request::Close { done }) => {
                    transition(state, ConnState::Closing);
                    if let Err(e) = session.write(&Command::end().encode()).await {
                        debug!(error = %e, "END not delivered during close");
                    }
                    let _ = session.shutdown().await;
                    let _ = done.send(());
                    return SessionEnd::Closed;
                }
                Some(Request::Command { command, reply }) => {
                    // Commands only ever hit the wire from a Connected
                    // session; the close paths above leave this loop
                    // before transitioning away.
                    debug_assert_eq!(
                        *state,
                        ConnState::Connected,
                        "command dispatched outside Connected"
                    );
                    if let Err(e) = session.write(&command.encode()).await {
                        let _ = reply.send(Err(ClientError::ConnectionLost));
                        return SessionEnd::Lost(e);
                    }
                    pending.push(reply);
                    debug!(verb = command.verb().as_str(), in_flight = pending.len(), "command written");
                }
            },
            outcome = tokio::time::timeout(cfg.idle_timeout, session.next_event()) => match outcome {
                // Soft signal only: the server's BEAT protocol is the
                // authoritative liveness check.
                Err(_elapsed) => {
                    debug!(idle_ms = cfg.idle_timeout.as_millis() as u64, "socket idle");
                }
                Ok(Ok(ReadOutcome::Frame(frame))) => {
                    if !pending.resume_head(Ok(frame)) {
                        return SessionEnd::Lost(ClientError::Protocol(
                            "reply received with no pending request".to_owned(),
                        ));
                    }
                }
                Ok(Ok(ReadOutcome::Recoverable(err))) => {
                    if !pending.resume_head(Err(err)) {
                        return SessionEnd::Lost(ClientError::Protocol(
                            "undecodable reply with no pending request".to_owned(),
                        ));
                    }
                }
                Ok(Ok(ReadOutcome::Eof)) => return SessionEnd::Lost(ClientError::ConnectionLost),
                Ok(Err(fatal)) => return SessionEnd::Lost(fatal),
            },
        }
    }
}

/// Sleep out the linear backoff, failing any requests that arrive while
/// the socket is down.  Returns `false` if the client closed meanwhile.
async fn wait_backoff(
    cfg: &Config,
    requests: &mut mpsc::Receiver<Request>,
    events: &broadcast::Sender<ConnectionEvent>,
    state: &mut ConnState,
    attempt: u32,
) -> bool {
    transition(state, ConnState::Reconnecting);
    let delay = cfg.reconnect_delay * attempt;
    let _ = events.send(ConnectionEvent::Reconnecting { attempt });
    info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            () = &mut sleep => return true,
            req = requests.recv() => match req {
                None => return false,
                Some(Request::Close { done }) => {
                    let _ = done.send(());
                    return false;
                }
                Some(Request::Command { reply, .. }) => {
                    let _ = reply.send(Err(ClientError::NotWritable));
                }
            },
        }
    }
}

fn finish_closed(
    requests: &mut mpsc::Receiver<Request>,
    events: &broadcast::Sender<ConnectionEvent>,
    state: &mut ConnState,
) {
    transition(state, ConnState::Closed);
    let _ = events.send(ConnectionEvent::Closed);
    fail_queued(requests);
}

fn finish_terminated(
    err: ClientError,
    requests: &mut mpsc::Receiver<Request>,
    events: &broadcast::Sender<ConnectionEvent>,
    state: &mut ConnState,
    pending: &mut PendingReplies,
    ready: &mut Option<oneshot::Sender<Result<(), ClientError>>>,
) {
    transition(state, ConnState::Closed);
    pending.drain(&ClientError::ConnectionLost);
    match ready.take() {
        // Initial connect still waiting: it gets the failure directly.
        Some(tx) => {
            let _ = tx.send(Err(err));
        }
        None => {
            warn!(error = %err, "giving up on connection");
            let _ = events.send(ConnectionEvent::Terminated {
                reason: err.to_string(),
            });
        }
    }
    fail_queued(requests);
}

/// Close the request channel and fail everything still queued in it.
fn fail_queued(requests: &mut mpsc::Receiver<Request>) {
    requests.close();
    while let Ok(req) = requests.try_recv() {
        match req {
            Request::Command { reply, .. } => {
                let _ = reply.send(Err(ClientError::NotWritable));
            }
            Request::Close { done } => {
                let _ = done.send(());
            }
        }
    }
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned())
}

// ---------------------------------------------------------------------------
// Session: socket + decoder
// ---------------------------------------------------------------------------

/// One live socket with its frame decoder.
struct Session<S> {
    stream: S,
    decoder: FrameDecoder,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S) -> Self {
        Session {
            stream,
            decoder: FrameDecoder::new(),
        }
    }

    /// Next decoded frame, recoverable payload error, or EOF.  `Err` is a
    /// fatal transport or framing failure.  Cancellation-safe: partial
    /// reads stay buffered in the decoder.
    async fn next_event(&mut self) -> Result<ReadOutcome, ClientError> {
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => return Ok(ReadOutcome::Frame(frame)),
                Ok(None) => {}
                Err(e) if e.is_recoverable() => {
                    return Ok(ReadOutcome::Recoverable(ClientError::Protocol(e.to_string())));
                }
                Err(e) => return Err(ClientError::Protocol(e.to_string())),
            }
            let mut chunk = [0u8; 4096];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| ClientError::Connect(e.to_string()))?;
            if n == 0 {
                return Ok(ReadOutcome::Eof);
            }
            self.decoder.feed(&chunk[..n]);
        }
    }

    /// Next frame where anything short of one is an error (handshake path).
    async fn read_frame(&mut self) -> Result<Frame, ClientError> {
        match self.next_event().await? {
            ReadOutcome::Frame(frame) => Ok(frame),
            ReadOutcome::Recoverable(err) => Err(err),
            ReadOutcome::Eof => Err(ClientError::ConnectionLost),
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn next_event_reassembles_split_frames() {
        let (mut server, client) = duplex(64);
        let mut session = Session::new(client);

        server.write_all(b"+O").await.unwrap();
        let pending = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            server.write_all(b"K\r\n").await.unwrap();
            server
        });

        match session.next_event().await.unwrap() {
            ReadOutcome::Frame(Frame::Inline(text)) => assert_eq!(text, "OK"),
            _ => panic!("expected inline frame"),
        }
        pending.await.unwrap();
    }

    #[tokio::test]
    async fn next_event_reports_eof_when_peer_closes() {
        let (server, client) = duplex(64);
        let mut session = Session::new(client);
        drop(server);
        assert!(matches!(
            session.next_event().await.unwrap(),
            ReadOutcome::Eof
        ));
    }

    #[tokio::test]
    async fn bad_bulk_body_is_recoverable_and_stream_continues() {
        let (mut server, client) = duplex(64);
        let mut session = Session::new(client);
        server.write_all(b"$3\r\nnot\r\n+OK\r\n").await.unwrap();

        assert!(matches!(
            session.next_event().await.unwrap(),
            ReadOutcome::Recoverable(ClientError::Protocol(_))
        ));
        match session.next_event().await.unwrap() {
            ReadOutcome::Frame(Frame::Inline(text)) => assert_eq!(text, "OK"),
            _ => panic!("expected inline frame after recoverable error"),
        }
    }

    #[tokio::test]
    async fn handshake_rejects_version_mismatch() {
        let (mut server, client) = duplex(256);
        let mut session = Session::new(client);
        server.write_all(b"+HI {\"v\":3}\r\n").await.unwrap();

        let cfg = Config::default();
        let err = handshake(&cfg, &mut session).await.unwrap_err();
        assert_eq!(err, ClientError::VersionMismatch { server: 3 });
    }

    #[tokio::test]
    async fn handshake_requires_configured_password_for_salted_greeting() {
        let (mut server, client) = duplex(256);
        let mut session = Session::new(client);
        server
            .write_all(b"+HI {\"v\":2,\"s\":\"abc\",\"i\":4}\r\n")
            .await
            .unwrap();

        let cfg = Config::default();
        let err = handshake(&cfg, &mut session).await.unwrap_err();
        assert!(matches!(err, ClientError::Handshake(_)));
    }

    #[tokio::test]
    async fn handshake_sends_hello_and_accepts_ok() {
        let (mut server, client) = duplex(1024);
        let mut session = Session::new(client);
        server.write_all(b"+HI {\"v\":2}\r\n+OK\r\n").await.unwrap();

        let cfg = Config::default();
        handshake(&cfg, &mut session).await.unwrap();

        let mut sent = vec![0u8; 1024];
        let n = server.read(&mut sent).await.unwrap();
        let line = String::from_utf8_lossy(&sent[..n]);
        assert!(line.starts_with("HELLO {"));
        assert!(line.contains("\"v\":2"));
        assert!(line.ends_with("\r\n"));
    }
}
