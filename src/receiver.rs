//! Receiving endpoint: accepts connections and persists every frame as a file.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::ReceiverConfig;
use crate::error::TransferError;
use crate::frame;
use crate::logger::Logger;

#[cfg(target_os = "linux")]
fn preallocate(file: &std::fs::File, size: u64) {
    use std::os::fd::AsRawFd;
    if size == 0 {
        return;
    }
    // Failure falls back to sparse allocation
    let _ = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
}
#[cfg(not(target_os = "linux"))]
fn preallocate(_file: &std::fs::File, _size: u64) {}

/// `received_<unix micros>_<size>.bin`
pub fn output_name(at: DateTime<Utc>, size: u64) -> String {
    format!("received_{}_{}.bin", at.timestamp_micros(), size)
}

/// Create a fresh output file, never overwriting: a taken name gets a `-<n>` suffix.
pub fn create_output(dir: &Path, at: DateTime<Utc>, size: u64) -> io::Result<(PathBuf, std::fs::File)> {
    let base = output_name(at, size);
    let stem = base.trim_end_matches(".bin");
    for n in 0u32..10_000 {
        let name = if n == 0 {
            base.clone()
        } else {
            format!("{}-{}.bin", stem, n)
        };
        let path = dir.join(name);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(f) => return Ok((path, f)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free output name for {}", base),
    ))
}

/// Create and preallocate the output file off the async workers;
/// `posix_fallocate` on a large frame can take a while.
async fn prepare_output(dir: PathBuf, at: DateTime<Utc>, size: u64) -> io::Result<(PathBuf, std::fs::File)> {
    tokio::task::spawn_blocking(move || {
        let (path, file) = create_output(&dir, at, size)?;
        preallocate(&file, size);
        Ok::<_, io::Error>((path, file))
    })
    .await
    .map_err(io::Error::other)?
}

pub struct Receiver {
    listener: TcpListener,
    config: Arc<ReceiverConfig>,
    logger: Arc<dyn Logger>,
}

impl Receiver {
    /// Create the save directory and bind the listener. Either failing is fatal.
    pub async fn bind(config: ReceiverConfig, logger: Arc<dyn Logger>) -> Result<Self> {
        std::fs::create_dir_all(&config.save_dir).with_context(|| {
            format!("Failed to create save directory: {}", config.save_dir.display())
        })?;
        let listener = TcpListener::bind(&config.bind)
            .await
            .with_context(|| format!("bind {}", config.bind))?;
        Ok(Self {
            listener,
            config: Arc::new(config),
            logger,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` fires, then wait for open connections to
    /// finish their current frame.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            addr = %self.local_addr()?,
            save_dir = %self.config.save_dir.display(),
            "receiver listening"
        );
        let mut conns = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(%peer, "connection accepted");
                    let config = self.config.clone();
                    let logger = self.logger.clone();
                    let token = shutdown.clone();
                    conns.spawn(async move {
                        match handle_connection(stream, peer, &config, logger.as_ref(), &token).await {
                            Ok(frames) => tracing::debug!(%peer, frames, "connection closed"),
                            Err(e) => tracing::warn!(%peer, error = %e, "connection aborted"),
                        }
                    });
                }
                Some(res) = conns.join_next(), if !conns.is_empty() => {
                    if let Err(e) = res {
                        tracing::error!(error = %e, "connection task panicked");
                    }
                }
            }
        }
        drop(self.listener);
        tracing::info!(open = conns.len(), "receiver stopping");
        while conns.join_next().await.is_some() {}
        Ok(())
    }
}

/// Serve frames on one connection until the peer closes between frames.
///
/// Returns the number of frames persisted. Cancellation and the idle timeout
/// are only observed while waiting for the next header.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    config: &ReceiverConfig,
    logger: &dyn Logger,
    shutdown: &CancellationToken,
) -> Result<u64, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let idle = config.idle_timeout();
    let mut frames = 0u64;
    loop {
        let next = async {
            match idle {
                Some(d) => timeout(d, frame::read_header(&mut stream)).await.ok(),
                None => Some(frame::read_header(&mut stream).await),
            }
        };
        let header = tokio::select! {
            _ = shutdown.cancelled() => break,
            h = next => h,
        };
        let len = match header {
            None => {
                tracing::debug!(%peer, "idle timeout, closing");
                break;
            }
            Some(h) => match h? {
                Some(len) => len,
                None => break,
            },
        };
        receive_frame(&mut stream, peer, len, config, logger).await?;
        frames += 1;
    }
    Ok(frames)
}

async fn receive_frame<S>(
    stream: &mut S,
    peer: SocketAddr,
    len: u64,
    config: &ReceiverConfig,
    logger: &dyn Logger,
) -> Result<(), TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let (path, file) = prepare_output(config.save_dir.clone(), Utc::now(), len)
        .await
        .map_err(|e| TransferError::Io { stage: "create output", source: e })?;
    let mut out = tokio::fs::File::from_std(file);
    let io_timeout = (config.io_timeout_ms > 0).then(|| Duration::from_millis(config.io_timeout_ms));

    if let Err(e) = frame::receive_body(stream, &mut out, len, config.read_chunk, io_timeout).await {
        drop(out);
        let _ = tokio::fs::remove_file(&path).await;
        return Err(e);
    }
    drop(out);
    frame::write_ack(stream).await?;

    tracing::info!(%peer, path = %path.display(), bytes = len, elapsed = ?started.elapsed(), "file received");
    logger.received(&peer, &path, len);
    Ok(())
}
