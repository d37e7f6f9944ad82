//! Pool of validated persistent connections to remote inference workers.
//!
//! Connections are created by an init pass and a once-per-second refill
//! task; both run connect + handshake under a wall-clock deadline so a
//! dead or slow worker cannot stall the pool. Checked-out sockets come
//! from the front of a FIFO and are returned to the back; a socket whose
//! request failed or timed out is dropped instead of returned, because its
//! protocol state is unknowable.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Wall-clock budget for connect plus handshake.
pub const CONNECT_DEADLINE: Duration = Duration::from_millis(500);

/// How often the refill task checks the pool level.
const REFILL_PERIOD: Duration = Duration::from_secs(1);

/// A `serverlist` entry that does not parse is fatal at startup.
#[derive(Debug, Clone, Error)]
#[error("malformed server entry '{entry}': expected host:port")]
pub struct ServerParseError {
    pub entry: String,
}

#[derive(Debug, Clone)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn parse(entry: &str) -> Result<Self, ServerParseError> {
        let malformed = || ServerParseError {
            entry: entry.to_string(),
        };

        let (host, port) = entry.rsplit_once(':').ok_or_else(malformed)?;
        if host.is_empty() {
            return Err(malformed());
        }
        let port = port.parse::<u16>().map_err(|_| malformed())?;

        Ok(ServerAddr {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

pub struct SocketPool {
    servers: Vec<ServerAddr>,
    desired: usize,
    weights_hash: u64,
    verbose: bool,

    available: Mutex<VecDeque<TcpStream>>,
    active: AtomicUsize,
}

impl SocketPool {
    pub fn new(
        serverlist: &[String],
        desired: usize,
        weights_hash: u64,
        verbose: bool,
    ) -> Result<Self, ServerParseError> {
        let servers = serverlist
            .iter()
            .map(|entry| ServerAddr::parse(entry))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SocketPool {
            servers,
            desired,
            weights_hash,
            verbose,
            available: Mutex::new(VecDeque::new()),
            active: AtomicUsize::new(0),
        })
    }

    pub fn desired(&self) -> usize {
        self.desired
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn available_count(&self) -> usize {
        self.available.lock().unwrap().len()
    }

    /// Top the pool up towards `desired`, spreading new connections evenly
    /// over the servers. Each attempt runs under `CONNECT_DEADLINE`; a
    /// timeout, refusal or fingerprint mismatch just discards that socket.
    pub async fn fill(&self) {
        if self.servers.is_empty() {
            return;
        }

        let missing = self.desired.saturating_sub(self.active_count());
        if missing == 0 {
            return;
        }
        let per_server = missing.div_ceil(self.servers.len());

        for server in &self.servers {
            for slot in 0..per_server {
                if self.active_count() >= self.desired {
                    return;
                }

                match tokio::time::timeout(
                    CONNECT_DEADLINE,
                    connect_and_handshake(server, self.weights_hash),
                )
                .await
                {
                    Ok(Ok(stream)) => {
                        self.available.lock().unwrap().push_back(stream);
                        self.active.fetch_add(1, Ordering::SeqCst);
                        if self.verbose {
                            info!("connected to worker {server} (slot {slot})");
                        }
                    }
                    Ok(Err(e)) => {
                        if self.verbose {
                            warn!("dropped connection to worker {server}: {e}");
                        }
                    }
                    Err(_) => {
                        if self.verbose {
                            warn!("connection to worker {server} timed out");
                        }
                    }
                }
            }
        }
    }

    /// Pop the least-recently-used idle socket, if any.
    pub fn acquire(&self) -> Option<TcpStream> {
        self.available.lock().unwrap().pop_front()
    }

    /// Return a socket that completed its exchange.
    pub fn release_ok(&self, stream: TcpStream) {
        self.available.lock().unwrap().push_back(stream);
    }

    /// Discard a socket after an error or timeout. The refill task will
    /// replace it.
    pub fn release_bad(&self, stream: TcpStream) {
        drop(stream);
        self.active.fetch_sub(1, Ordering::SeqCst);
        debug!("discarded a worker connection");
    }

    /// Spawn the refill task on `handle`. It runs for the lifetime of the
    /// pool.
    pub fn spawn_refill(self: &Arc<Self>, handle: &tokio::runtime::Handle) {
        let pool = Arc::clone(self);
        handle.spawn(async move {
            let mut tick = tokio::time::interval(REFILL_PERIOD);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if pool.active_count() < pool.desired {
                    pool.fill().await;
                }
            }
        });
    }
}

async fn connect_and_handshake(server: &ServerAddr, weights_hash: u64) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect((server.host.as_str(), server.port)).await?;

    stream.write_all(&weights_hash.to_le_bytes()).await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    let server_hash = u64::from_le_bytes(reply);

    if server_hash != weights_hash {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("weights fingerprint mismatch ({server_hash:#x} != {weights_hash:#x})"),
        ));
    }

    Ok(stream)
}
