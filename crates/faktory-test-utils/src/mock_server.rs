// mock_server: A mock Faktory server for testing clients.
//
// Accepts connections on 127.0.0.1:<random port>, greets with `+HI`,
// validates the HELLO handshake (version and pwdhash when a password is
// configured), and serves the command set against in-memory queues.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use faktory_protocol::hash_password;

/// Behavior knobs for a mock server instance.
#[derive(Debug, Clone)]
pub struct MockServerConfig {
    /// Protocol version advertised in the greeting.
    pub version: u64,
    /// Salt advertised in the greeting; enables password validation.
    pub salt: Option<String>,
    /// Iteration count advertised alongside the salt.
    pub iterations: u32,
    /// Expected password; HELLO pwdhash is checked when both this and
    /// `salt` are set.
    pub password: Option<String>,
    /// When set, BEAT is answered with `{"state": …}` instead of `+OK`.
    pub beat_state: Option<String>,
    /// Never answer FETCH — leaves the client's operation in flight.
    pub stall_fetch: bool,
    /// Raw reply line pushed right after the first successful HELLO,
    /// with nothing awaiting it on the client side.
    pub unsolicited_once: Option<String>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        MockServerConfig {
            version: 2,
            salt: None,
            iterations: 1,
            password: None,
            beat_state: None,
            stall_fetch: false,
            unsolicited_once: None,
        }
    }
}

/// A mock Faktory server for integration testing.
///
/// Binds to port 0 (random) and exposes the actual bound port.  Each test
/// can spin up its own isolated server instance.
pub struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: tokio::task::JoinHandle<()>,
}

struct Shared {
    cfg: MockServerConfig,
    queues: Mutex<HashMap<String, VecDeque<serde_json::Value>>>,
    connections: AtomicUsize,
    last_hello: Mutex<Option<serde_json::Value>>,
    last_fail: Mutex<Option<serde_json::Value>>,
    /// Scripted raw reply lines consumed by upcoming PUSH commands.
    push_scripts: Mutex<VecDeque<String>>,
    unsolicited_fired: AtomicBool,
    drop_conns: watch::Sender<u64>,
}

impl MockServer {
    /// Start a mock server with default behavior.
    pub async fn start() -> std::io::Result<Self> {
        Self::start_with(MockServerConfig::default()).await
    }

    /// Start a mock server with the given behavior knobs.
    pub async fn start_with(cfg: MockServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (drop_tx, _) = watch::channel(0u64);

        let shared = Arc::new(Shared {
            cfg,
            queues: Mutex::new(HashMap::new()),
            connections: AtomicUsize::new(0),
            last_hello: Mutex::new(None),
            last_fail: Mutex::new(None),
            push_scripts: Mutex::new(VecDeque::new()),
            unsolicited_fired: AtomicBool::new(false),
            drop_conns: drop_tx,
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let conn_shared = Arc::clone(&accept_shared);
                        tokio::spawn(async move {
                            // Connection errors are expected in tests
                            // (clients drop mid-session); swallow them.
                            let _ = handle_connection(stream, conn_shared).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(MockServer {
            addr,
            shared,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Total connections accepted so far (including dropped ones).
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Answer the next PUSH with `+<status>` instead of `+OK`.
    pub fn reject_next_push(&self, status: &str) {
        self.shared
            .push_scripts
            .lock()
            .unwrap()
            .push_back(format!("+{status}"));
    }

    /// Answer the next PUSH with `-<message>`.
    pub fn error_next_push(&self, message: &str) {
        self.shared
            .push_scripts
            .lock()
            .unwrap()
            .push_back(format!("-{message}"));
    }

    /// Force-close every live connection.
    pub fn drop_connections(&self) {
        self.shared.drop_conns.send_modify(|n| *n += 1);
    }

    /// Stop accepting new connections and drop live ones.  The listener
    /// is gone once this returns, so reconnect attempts get refused.
    pub async fn shutdown(&mut self) {
        self.accept_task.abort();
        let _ = (&mut self.accept_task).await;
        self.drop_connections();
    }

    /// The JSON payload of the most recent HELLO.
    pub fn last_hello(&self) -> Option<serde_json::Value> {
        self.shared.last_hello.lock().unwrap().clone()
    }

    /// The JSON payload of the most recent FAIL.
    pub fn last_fail(&self) -> Option<serde_json::Value> {
        self.shared.last_fail.lock().unwrap().clone()
    }

    /// Jobs currently queued on `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.shared
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .map_or(0, VecDeque::len)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

// ---------------------------------------------------------------------------
// Connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    stream: TcpStream,
    shared: Arc<Shared>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    shared.connections.fetch_add(1, Ordering::SeqCst);
    let mut drop_rx = shared.drop_conns.subscribe();
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut greeting = serde_json::json!({ "v": shared.cfg.version });
    if let Some(salt) = &shared.cfg.salt {
        greeting["s"] = serde_json::json!(salt);
        greeting["i"] = serde_json::json!(shared.cfg.iterations);
    }
    writer
        .write_all(format!("+HI {greeting}\r\n").as_bytes())
        .await?;

    let mut line = String::new();
    loop {
        line.clear();
        tokio::select! {
            _ = drop_rx.changed() => {
                // Force-drop requested (or the server is gone): close the
                // socket without ceremony.
                return Ok(());
            }
            read = reader.read_line(&mut line) => {
                if read? == 0 {
                    return Ok(());
                }
                let trimmed = line.trim_end_matches(['\r', '\n']);
                let (verb, rest) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
                match verb {
                    "HELLO" => handle_hello(rest, &shared, &mut writer).await?,
                    "PUSH" => handle_push(rest, &shared, &mut writer).await?,
                    "FETCH" => {
                        if shared.cfg.stall_fetch {
                            continue;
                        }
                        handle_fetch(rest, &shared, &mut writer).await?;
                    }
                    "ACK" => writer.write_all(b"+OK\r\n").await?,
                    "FAIL" => {
                        *shared.last_fail.lock().unwrap() =
                            serde_json::from_str(rest).ok();
                        writer.write_all(b"+OK\r\n").await?;
                    }
                    "BEAT" => match &shared.cfg.beat_state {
                        Some(state) => {
                            let body = serde_json::json!({ "state": state }).to_string();
                            writer
                                .write_all(format!("${}\r\n{body}\r\n", body.len()).as_bytes())
                                .await?;
                        }
                        None => writer.write_all(b"+OK\r\n").await?,
                    },
                    "INFO" => {
                        let depths: HashMap<String, usize> = shared
                            .queues
                            .lock()
                            .unwrap()
                            .iter()
                            .map(|(name, jobs)| (name.clone(), jobs.len()))
                            .collect();
                        let body = serde_json::json!({
                            "server": { "description": "mock faktory" },
                            "queues": depths,
                        })
                        .to_string();
                        writer
                            .write_all(format!("${}\r\n{body}\r\n", body.len()).as_bytes())
                            .await?;
                    }
                    "FLUSH" => {
                        shared.queues.lock().unwrap().clear();
                        writer.write_all(b"+OK\r\n").await?;
                    }
                    "END" => return Ok(()),
                    _ => {
                        writer
                            .write_all(format!("-ERR unknown command '{verb}'\r\n").as_bytes())
                            .await?;
                    }
                }
            }
        }
    }
}

async fn handle_hello(
    rest: &str,
    shared: &Shared,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let payload: serde_json::Value = match serde_json::from_str(rest) {
        Ok(payload) => payload,
        Err(_) => {
            writer.write_all(b"-ERR malformed HELLO\r\n").await?;
            return Ok(());
        }
    };
    *shared.last_hello.lock().unwrap() = Some(payload.clone());

    if let (Some(salt), Some(password)) = (&shared.cfg.salt, &shared.cfg.password) {
        let expected = hash_password(password, salt, shared.cfg.iterations)
            .expect("mock configured with an iteration count >= 1");
        if payload["pwdhash"].as_str() != Some(expected.as_str()) {
            writer.write_all(b"-ERR Invalid password\r\n").await?;
            return Ok(());
        }
    }

    writer.write_all(b"+OK\r\n").await?;

    if let Some(unsolicited) = &shared.cfg.unsolicited_once {
        if !shared.unsolicited_fired.swap(true, Ordering::SeqCst) {
            writer
                .write_all(format!("{unsolicited}\r\n").as_bytes())
                .await?;
        }
    }
    Ok(())
}

async fn handle_push(
    rest: &str,
    shared: &Shared,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let scripted = shared.push_scripts.lock().unwrap().pop_front();
    if let Some(reply) = scripted {
        writer.write_all(format!("{reply}\r\n").as_bytes()).await?;
        return Ok(());
    }

    match serde_json::from_str::<serde_json::Value>(rest) {
        Ok(job) => {
            let queue = job["queue"].as_str().unwrap_or("default").to_owned();
            shared
                .queues
                .lock()
                .unwrap()
                .entry(queue)
                .or_default()
                .push_back(job);
            writer.write_all(b"+OK\r\n").await?;
        }
        Err(_) => {
            writer.write_all(b"-ERR malformed job\r\n").await?;
        }
    }
    Ok(())
}

async fn handle_fetch(
    rest: &str,
    shared: &Shared,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let job = {
        let mut queues = shared.queues.lock().unwrap();
        rest.split_whitespace()
            .find_map(|queue| queues.get_mut(queue).and_then(VecDeque::pop_front))
    };
    match job {
        Some(job) => {
            let body = serde_json::to_string(&job)?;
            writer
                .write_all(format!("${}\r\n{body}\r\n", body.len()).as_bytes())
                .await?;
        }
        None => writer.write_all(b"$-1\r\n").await?,
    }
    Ok(())
}
