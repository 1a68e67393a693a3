//! Keyed pool of idle outbound connections.
//!
//! The pool has a single owner (the dispatch engine) and is never shared
//! across engines. A connection is either idle in the pool or held by the
//! engine for exactly one frame exchange.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::PoolSettings;
use crate::error::TransferError;
use crate::task::ConnectionKey;

/// An open stream plus the bucket it belongs to.
#[derive(Debug)]
pub struct PooledConnection {
    pub key: ConnectionKey,
    pub stream: TcpStream,
    pub io_timeout: Duration,
    pub ack_timeout: Duration,
    created_at: Instant,
    last_used: Instant,
    frames: u64,
}

impl PooledConnection {
    /// Frames successfully exchanged on this connection.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn mark_frame_done(&mut self) {
        self.frames += 1;
        self.last_used = Instant::now();
    }
}

pub struct ConnectionPool {
    idle: HashMap<ConnectionKey, Vec<PooledConnection>>,
    settings: PoolSettings,
    opened: u64,
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            idle: HashMap::new(),
            settings,
            opened: 0,
        }
    }

    /// Take an idle connection for `key`, or open a new one.
    pub async fn acquire(&mut self, key: &ConnectionKey) -> Result<PooledConnection, TransferError> {
        let expiry = match self.settings.idle_expiry_secs {
            0 => None,
            s => Some(Duration::from_secs(s)),
        };
        while let Some(conn) = self.idle.get_mut(key).and_then(|v| v.pop()) {
            if let Some(max) = expiry {
                if conn.last_used.elapsed() > max {
                    tracing::debug!(%key, "idle connection expired");
                    discard_quiet(conn).await;
                    continue;
                }
            }
            if !peer_alive(&conn.stream) {
                tracing::debug!(%key, frames = conn.frames, "idle connection no longer usable");
                discard_quiet(conn).await;
                continue;
            }
            tracing::trace!(%key, frames = conn.frames, "reusing pooled connection");
            return Ok(conn);
        }
        self.connect(key).await
    }

    async fn connect(&mut self, key: &ConnectionKey) -> Result<PooledConnection, TransferError> {
        let ms = self.settings.connect_timeout_ms;
        tracing::info!(%key, "creating new connection");
        let stream = match timeout(
            Duration::from_millis(ms),
            TcpStream::connect((key.host.as_str(), key.port)),
        )
        .await
        {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return Err(TransferError::Connect {
                    key: key.clone(),
                    source: e,
                })
            }
            Err(_) => {
                return Err(TransferError::ConnectTimeout {
                    key: key.clone(),
                    ms,
                })
            }
        };
        tune_socket(&stream);
        self.opened += 1;
        let now = Instant::now();
        Ok(PooledConnection {
            key: key.clone(),
            stream,
            io_timeout: Duration::from_millis(self.settings.io_timeout_ms),
            ack_timeout: Duration::from_millis(self.settings.ack_timeout_ms),
            created_at: now,
            last_used: now,
            frames: 0,
        })
    }

    /// Return a connection after a fully successful frame exchange.
    pub async fn release(&mut self, conn: PooledConnection) {
        let bucket = self.idle.entry(conn.key.clone()).or_default();
        if bucket.len() >= self.settings.max_idle_per_key {
            tracing::debug!(key = %conn.key, "idle bucket full, closing connection");
            discard_quiet(conn).await;
            return;
        }
        bucket.push(conn);
    }

    /// Close a connection that failed. Errors while closing are ignored.
    pub async fn discard(&mut self, conn: PooledConnection) {
        tracing::debug!(key = %conn.key, frames = conn.frames, "discarding connection");
        discard_quiet(conn).await;
    }

    /// Close every idle connection.
    pub async fn close_all(&mut self) {
        let buckets: Vec<_> = self.idle.drain().collect();
        for (_, conns) in buckets {
            for c in conns {
                discard_quiet(c).await;
            }
        }
    }

    /// Connections established since the pool was created.
    pub fn connections_opened(&self) -> u64 {
        self.opened
    }

    pub fn idle_count(&self, key: &ConnectionKey) -> usize {
        self.idle.get(key).map(|v| v.len()).unwrap_or(0)
    }
}

async fn discard_quiet(mut conn: PooledConnection) {
    let _ = timeout(Duration::from_millis(100), conn.stream.shutdown()).await;
}

// Non-blocking peek: an idle connection must have nothing to read. EOF means the
// peer closed; stray bytes mean the stream is out of sync with the protocol.
#[cfg(unix)]
fn peer_alive(stream: &TcpStream) -> bool {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let mut byte = 0u8;
    let r = unsafe {
        libc::recv(
            fd,
            &mut byte as *mut u8 as *mut libc::c_void,
            1,
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    if r < 0 {
        let e = std::io::Error::last_os_error();
        return matches!(
            e.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
        );
    }
    false
}

#[cfg(not(unix))]
fn peer_alive(_stream: &TcpStream) -> bool {
    true
}

fn tune_socket(stream: &TcpStream) {
    // Latency sensitive: one header write followed by the body
    let _ = stream.set_nodelay(true);
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        let fd = stream.as_raw_fd();
        unsafe {
            // Enable TCP keepalive so long-idle pooled connections get checked
            let keepalive: libc::c_int = 1;
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                &keepalive as *const _ as *const libc::c_void,
                std::mem::size_of_val(&keepalive) as libc::socklen_t,
            );

            #[cfg(target_os = "linux")]
            {
                let keepidle: libc::c_int = 60; // Start keepalives after 60s idle
                let keepintvl: libc::c_int = 10; // 10s between keepalives
                let keepcnt: libc::c_int = 6; // 6 unanswered keepalives before failure
                let _ = libc::setsockopt(
                    fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_KEEPIDLE,
                    &keepidle as *const _ as *const libc::c_void,
                    std::mem::size_of_val(&keepidle) as libc::socklen_t,
                );
                let _ = libc::setsockopt(
                    fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_KEEPINTVL,
                    &keepintvl as *const _ as *const libc::c_void,
                    std::mem::size_of_val(&keepintvl) as libc::socklen_t,
                );
                let _ = libc::setsockopt(
                    fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_KEEPCNT,
                    &keepcnt as *const _ as *const libc::c_void,
                    std::mem::size_of_val(&keepcnt) as libc::socklen_t,
                );
            }
        }
    }
}
