// faktory-protocol: Wire types and codec for the Faktory work-server protocol.
//
// Outbound commands are single CRLF-terminated lines: a verb followed by
// whitespace-free tokens or compact JSON objects.  Inbound replies use
// RESP-style framing (`+inline`, `-error`, `$len` bulk, `$-1` null bulk).
// This crate is IO-free: the decoder consumes byte slices and emits frames,
// the encoder renders commands to bytes.  Socket handling lives in
// `faktory-client`.

pub mod command;
pub mod frame;
pub mod handshake;
pub mod job;

pub use command::{Command, Verb};
pub use frame::{DecodeError, Frame, FrameDecoder};
pub use handshake::{Greeting, HelloPayload, ZeroIterations, hash_password};
pub use job::{BeatState, Fail, Job, MAX_BACKTRACE_LINES, generate_jid};

/// The protocol revision this crate speaks.  Sent in the HELLO payload and
/// checked against the server's HI greeting.
pub const PROTOCOL_VERSION: u64 = 2;

/// Default Faktory server port.
pub const DEFAULT_PORT: u16 = 7419;
