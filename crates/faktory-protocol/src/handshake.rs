//! Handshake payload types.
//!
//! The server opens every connection with `+HI {...}` carrying a [`Greeting`];
//! the client answers `HELLO {...}` carrying a [`HelloPayload`] and must then
//! receive `+OK` before the session is usable.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The JSON body of the server's `HI` greeting.
///
/// `s` (salt) and `i` (iteration count) are present only when the server
/// requires password authentication.  `i` is always ≥ 1 when present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    /// Protocol version the server speaks.
    pub v: u64,
    /// Password salt; absent on servers without a password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<String>,
    /// Password hash iteration count; only present together with `s`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i: Option<u32>,
}

/// The JSON body of the client's `HELLO` response.
///
/// `pid` and `wid` are set only for worker connections (a configured worker
/// id); `pwdhash` only when the greeting carried a salt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub hostname: String,
    pub labels: Vec<String>,
    /// Protocol version the client speaks.
    pub v: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pwdhash: Option<String>,
}

/// A greeting carried an iteration count of zero.
///
/// The greeting contract guarantees `i ≥ 1` whenever a salt is present;
/// a zero count is a malformed greeting, not a request for zero hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("password hash iteration count must be at least 1")]
pub struct ZeroIterations;

/// Compute the `pwdhash` HELLO field: iterated SHA-256 over
/// `password ‖ salt`, hex-encoded.
///
/// Iteration 1 is a single hash; every further iteration hashes the raw
/// (not hex) digest of the previous round.  `iterations = 0` is
/// rejected.
pub fn hash_password(
    password: &str,
    salt: &str,
    iterations: u32,
) -> Result<String, ZeroIterations> {
    if iterations == 0 {
        return Err(ZeroIterations);
    }
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    let mut digest = hasher.finalize();
    for _ in 1..iterations {
        digest = Sha256::digest(digest.as_slice());
    }
    Ok(hex::encode(digest.as_slice()))
}
