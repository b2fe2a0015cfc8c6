// faktory-client: Async client for the Faktory work server.
//
// One TCP connection, one engine task. The engine owns the socket and the
// pending-reply FIFO; `Client` handles multiplex request/reply command
// exchanges over it and survive socket failure through bounded reconnect
// with linear backoff.

mod client;
mod config;
mod conn;
mod error;
mod events;
mod pending;

pub use client::Client;
pub use config::{Config, PROVIDER_VAR, URL_VAR};
pub use error::ClientError;
pub use events::ConnectionEvent;

// The job-level vocabulary callers need alongside the client.
pub use faktory_protocol::{BeatState, Fail, Job, PROTOCOL_VERSION};
