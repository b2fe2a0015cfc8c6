//! Application-facing command surface.
//!
//! A [`Client`] is a cheap handle onto the connection engine: operations
//! send an encoded command over a channel and await the one-shot
//! continuation the engine registers against the reply stream.  Handles
//! may be cloned freely; overlapping operations pipeline onto the single
//! connection and each receives its own reply by FIFO correspondence.

use tokio::sync::{broadcast, mpsc, oneshot};

use faktory_protocol::{BeatState, Command, Fail, Frame, Job, generate_jid};

use crate::config::Config;
use crate::conn::{Engine, Request};
use crate::error::ClientError;
use crate::events::{ConnectionEvent, EVENT_CAPACITY};

/// Depth of the request channel into the engine; callers awaiting their
/// replies provide the real backpressure.
const REQUEST_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct Client {
    requests: mpsc::Sender<Request>,
    events: broadcast::Sender<ConnectionEvent>,
    cfg: Config,
}

impl Client {
    /// Connect and handshake.  Resolves once the session is usable, or
    /// with the terminal error once the connect budget is spent.
    pub async fn connect(cfg: Config) -> Result<Self, ClientError> {
        let (req_tx, req_rx) = mpsc::channel(REQUEST_CAPACITY);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        let engine = Engine::new(cfg.clone(), req_rx, event_tx.clone());
        tokio::spawn(engine.run(ready_tx));

        ready_rx.await.map_err(|_| ClientError::ConnectionLost)??;
        Ok(Client {
            requests: req_tx,
            events: event_tx,
            cfg,
        })
    }

    /// Connect to the endpoint resolved from the environment
    /// (`FAKTORY_PROVIDER` → `FAKTORY_URL` → `localhost:7419`).
    pub async fn connect_from_env() -> Result<Self, ClientError> {
        Self::connect(Config::from_env()?).await
    }

    /// Subscribe to connection lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Submit a job.  Assigns a generated jid when the descriptor has
    /// none and returns the jid the server accepted.
    pub async fn push(&self, job: &mut Job) -> Result<String, ClientError> {
        let jid = match &job.jid {
            Some(jid) => jid.clone(),
            None => {
                let jid = generate_jid();
                job.jid = Some(jid.clone());
                jid
            }
        };
        let command = Command::push(job).map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.issue(command, Some("OK")).await?;
        Ok(jid)
    }

    /// Fetch the next job from the given queues, or `None` when every
    /// queue is empty.
    pub async fn fetch<S: AsRef<str>>(&self, queues: &[S]) -> Result<Option<Job>, ClientError> {
        match self.issue(Command::fetch(queues), None).await? {
            Frame::Empty => Ok(None),
            Frame::Bulk(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| ClientError::Protocol(format!("job payload: {e}"))),
            other => Err(ClientError::Protocol(format!(
                "unexpected FETCH reply: {other:?}"
            ))),
        }
    }

    /// Acknowledge successful completion of a job.
    pub async fn ack(&self, jid: &str) -> Result<(), ClientError> {
        let command = Command::ack(jid).map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.issue(command, Some("OK")).await?;
        Ok(())
    }

    /// Report a failed job with error details.  At most 100 backtrace
    /// lines are transmitted.
    pub async fn fail(&self, jid: &str, fail: &Fail) -> Result<(), ClientError> {
        let command = Command::fail(jid, fail).map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.issue(command, Some("OK")).await?;
        Ok(())
    }

    /// Send a worker heartbeat.  Requires a configured worker id.
    pub async fn beat(&self) -> Result<BeatState, ClientError> {
        let wid = self
            .cfg
            .wid
            .as_deref()
            .ok_or_else(|| ClientError::Config("BEAT requires a worker id (wid)".to_owned()))?;
        let command = Command::beat(wid).map_err(|e| ClientError::Protocol(e.to_string()))?;
        match self.issue(command, None).await? {
            Frame::Inline(status) if status == "OK" => Ok(BeatState::Ok),
            Frame::Bulk(value) => {
                let state = value
                    .get("state")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| {
                        ClientError::Protocol("BEAT reply carries no state field".to_owned())
                    })?;
                BeatState::from_state(state)
                    .ok_or_else(|| ClientError::Protocol(format!("unknown BEAT state '{state}'")))
            }
            other => Err(ClientError::Protocol(format!(
                "unexpected BEAT reply: {other:?}"
            ))),
        }
    }

    /// Server state dump (queue depths, totals, …).
    pub async fn info(&self) -> Result<serde_json::Value, ClientError> {
        match self.issue(Command::info(), None).await? {
            Frame::Bulk(value) => Ok(value),
            other => Err(ClientError::Protocol(format!(
                "unexpected INFO reply: {other:?}"
            ))),
        }
    }

    /// Wipe the server's dataset.  Destructive; intended for test rigs.
    pub async fn flush(&self) -> Result<String, ClientError> {
        match self.issue(Command::flush(), None).await? {
            Frame::Inline(status) => Ok(status),
            other => Err(ClientError::Protocol(format!(
                "unexpected FLUSH reply: {other:?}"
            ))),
        }
    }

    /// End the session: `END` is written, the socket half-closed, and the
    /// engine stops.  Later operations on any handle fail as not
    /// writable.
    pub async fn close(&self) -> Result<(), ClientError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.requests
            .send(Request::Close { done: done_tx })
            .await
            .map_err(|_| ClientError::NotWritable)?;
        done_rx.await.map_err(|_| ClientError::ConnectionLost)
    }

    /// Write one command and await its reply.  `expect` asserts the
    /// inline status; a mismatch fails only this operation.
    async fn issue(&self, command: Command, expect: Option<&str>) -> Result<Frame, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(Request::Command {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClientError::NotWritable)?;
        let frame = reply_rx.await.map_err(|_| ClientError::ConnectionLost)??;

        if let Frame::Error(message) = &frame {
            return Err(ClientError::Server(message.clone()));
        }
        if let Some(expected) = expect {
            match &frame {
                Frame::Inline(status) if status == expected => {}
                Frame::Inline(status) => {
                    return Err(ClientError::Unexpected {
                        expected: expected.to_owned(),
                        got: status.clone(),
                    });
                }
                other => {
                    return Err(ClientError::Unexpected {
                        expected: expected.to_owned(),
                        got: format!("{other:?}"),
                    });
                }
            }
        }
        Ok(frame)
    }
}
