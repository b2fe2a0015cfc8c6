//! Outbound command encoding.
//!
//! A command is a verb plus ordered arguments, each either a
//! whitespace-free token or one compact JSON object.  Arguments are joined
//! by single spaces and the line is CRLF-terminated.  The encoder performs
//! no escaping: JSON itself escapes any CR/LF inside payloads, and queue
//! names / jids are whitespace-free tokens by contract.

use serde::Serialize;

use crate::handshake::HelloPayload;
use crate::job::{Fail, Job};

/// Command verbs understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Hello,
    Push,
    Fetch,
    Ack,
    Fail,
    Beat,
    Info,
    Flush,
    End,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Hello => "HELLO",
            Verb::Push => "PUSH",
            Verb::Fetch => "FETCH",
            Verb::Ack => "ACK",
            Verb::Fail => "FAIL",
            Verb::Beat => "BEAT",
            Verb::Info => "INFO",
            Verb::Flush => "FLUSH",
            Verb::End => "END",
        }
    }
}

/// An encodable command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    verb: Verb,
    args: Vec<String>,
}

impl Command {
    pub fn hello(payload: &HelloPayload) -> serde_json::Result<Self> {
        Self::with_json(Verb::Hello, payload)
    }

    pub fn push(job: &Job) -> serde_json::Result<Self> {
        Self::with_json(Verb::Push, job)
    }

    /// `FETCH q1 q2 …` — one token per queue name.
    pub fn fetch<S: AsRef<str>>(queues: &[S]) -> Self {
        Command {
            verb: Verb::Fetch,
            args: queues.iter().map(|q| q.as_ref().to_owned()).collect(),
        }
    }

    pub fn ack(jid: &str) -> serde_json::Result<Self> {
        Self::with_json(Verb::Ack, &serde_json::json!({ "jid": jid }))
    }

    pub fn fail(jid: &str, fail: &Fail) -> serde_json::Result<Self> {
        Self::with_json(Verb::Fail, &fail.wire_payload(jid))
    }

    pub fn beat(wid: &str) -> serde_json::Result<Self> {
        Self::with_json(Verb::Beat, &serde_json::json!({ "wid": wid }))
    }

    pub fn info() -> Self {
        Command {
            verb: Verb::Info,
            args: Vec::new(),
        }
    }

    pub fn flush() -> Self {
        Command {
            verb: Verb::Flush,
            args: Vec::new(),
        }
    }

    pub fn end() -> Self {
        Command {
            verb: Verb::End,
            args: Vec::new(),
        }
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    /// Render the CRLF-terminated wire line.
    pub fn encode(&self) -> Vec<u8> {
        let mut line = String::from(self.verb.as_str());
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line.push_str("\r\n");
        line.into_bytes()
    }

    fn with_json<T: Serialize>(verb: Verb, payload: &T) -> serde_json::Result<Self> {
        Ok(Command {
            verb,
            args: vec![serde_json::to_string(payload)?],
        })
    }
}
