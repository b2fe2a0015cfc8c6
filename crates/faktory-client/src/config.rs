//! Client configuration.
//!
//! A [`Config`] is immutable once the engine is running.  Environment
//! discovery is a construction-time adapter: `FAKTORY_PROVIDER` names the
//! variable holding the endpoint (PaaS indirection), defaulting to
//! `FAKTORY_URL`, whose value is `host:port` with an optional
//! `scheme://` prefix that is stripped.

use std::time::Duration;

use faktory_protocol::DEFAULT_PORT;

use crate::error::ClientError;

/// Name of the variable that names the endpoint variable.
pub const PROVIDER_VAR: &str = "FAKTORY_PROVIDER";

/// Default endpoint variable.
pub const URL_VAR: &str = "FAKTORY_URL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Advisory labels sent in the HELLO payload.
    pub labels: Vec<String>,
    /// Worker id; set only for worker (fetch/ack/beat) connections.
    pub wid: Option<String>,
    /// Consecutive reconnect attempts before the engine gives up.
    pub reconnect_limit: u32,
    /// Base reconnect delay; the actual wait is `delay × attempt`.
    pub reconnect_delay: Duration,
    /// Soft idle threshold on the socket; logged, never enforced.
    pub idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_owned(),
            port: DEFAULT_PORT,
            password: None,
            labels: vec!["rust".to_owned()],
            wid: None,
            reconnect_limit: 2,
            reconnect_delay: Duration::from_millis(2000),
            idle_timeout: Duration::from_millis(20_000),
        }
    }
}

impl Config {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Config {
            host: host.into(),
            port,
            ..Config::default()
        }
    }

    /// Parse a `[scheme://]host[:port]` endpoint string.
    pub fn from_endpoint(endpoint: &str) -> Result<Self, ClientError> {
        let stripped = match endpoint.find("://") {
            Some(idx) => &endpoint[idx + 3..],
            None => endpoint,
        };
        let (host, port) = match stripped.rsplit_once(':') {
            Some((host, port_text)) => {
                let port = port_text.parse::<u16>().map_err(|_| {
                    ClientError::Config(format!("invalid port in endpoint '{endpoint}'"))
                })?;
                (host, port)
            }
            None => (stripped, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(ClientError::Config(format!(
                "endpoint '{endpoint}' has no host"
            )));
        }
        Ok(Config::new(host, port))
    }

    /// Resolve the endpoint from the process environment.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Same as [`Config::from_env`] with an injected variable lookup.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ClientError> {
        let url_var = lookup(PROVIDER_VAR).unwrap_or_else(|| URL_VAR.to_owned());
        match lookup(&url_var) {
            Some(endpoint) => Self::from_endpoint(&endpoint),
            None => Ok(Config::default()),
        }
    }
}
