//! Frame encode/decode over a byte stream, sender and receiver sides.
//!
//! The sender writes the 8-byte header, then the file body (zero-copy through
//! `sendfile(2)` on Linux), then blocks for the single acknowledgment byte.
//! The receiver reads exactly the declared length before acknowledging.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::TransferError;
use crate::pool::PooledConnection;
use crate::protocol::{decode_header, encode_header, ACK_BYTE, HEADER_LEN, SEND_CHUNK};

#[inline]
fn ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

#[inline]
async fn write_all_timed<W: AsyncWrite + Unpin>(
    w: &mut W,
    buf: &[u8],
    limit: Duration,
    stage: &'static str,
) -> Result<(), TransferError> {
    match timeout(limit, w.write_all(buf)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(TransferError::from_io(stage, e)),
        Err(_) => Err(TransferError::Timeout {
            stage,
            ms: ms(limit),
        }),
    }
}

#[inline]
async fn read_timed<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut [u8],
    limit: Option<Duration>,
    stage: &'static str,
) -> Result<usize, TransferError> {
    let res = match limit {
        Some(l) => match timeout(l, r.read(buf)).await {
            Ok(res) => res,
            Err(_) => return Err(TransferError::Timeout { stage, ms: ms(l) }),
        },
        None => r.read(buf).await,
    };
    res.map_err(|e| TransferError::from_io(stage, e))
}

/// Send one file as one frame and wait for the acknowledgment.
///
/// Returns the number of body bytes sent. The connection must be discarded
/// on any error; it is only reusable after `Ok`.
pub async fn send_file(conn: &mut PooledConnection, path: &Path) -> Result<u64, TransferError> {
    let local = |e: io::Error| TransferError::LocalIo {
        path: path.to_path_buf(),
        source: e,
    };
    let file = std::fs::File::open(path).map_err(local)?;
    let size = file.metadata().map_err(local)?.len();

    tracing::debug!(key = %conn.key, path = %path.display(), size, "sending frame");
    write_all_timed(&mut conn.stream, &encode_header(size), conn.io_timeout, "header").await?;
    let sent = transmit_body(&file, &mut conn.stream, size, conn.io_timeout).await?;
    if sent < size {
        return Err(TransferError::Protocol(format!(
            "short transfer: sent {} of {} declared bytes",
            sent, size
        )));
    }
    await_ack(&mut conn.stream, conn.ack_timeout).await?;
    conn.mark_frame_done();
    Ok(size)
}

#[cfg(target_os = "linux")]
async fn transmit_body(
    file: &std::fs::File,
    stream: &mut TcpStream,
    size: u64,
    io_timeout: Duration,
) -> Result<u64, TransferError> {
    use std::os::fd::AsRawFd;
    use tokio::io::Interest;

    let in_fd = file.as_raw_fd();
    let out_fd = stream.as_raw_fd();
    let mut offset: libc::off_t = 0;
    let mut sent: u64 = 0;
    while sent < size {
        let to_send = (size - sent).min(SEND_CHUNK as u64) as usize;
        match timeout(io_timeout, stream.writable()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(TransferError::from_io("body", e)),
            Err(_) => {
                return Err(TransferError::Timeout {
                    stage: "body",
                    ms: ms(io_timeout),
                })
            }
        }
        let res = stream.try_io(Interest::WRITABLE, || {
            let n = unsafe { libc::sendfile(out_fd, in_fd, &mut offset, to_send) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        });
        match res {
            // Source file shrank since it was stat'd
            Ok(0) => break,
            Ok(n) => sent += n as u64,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                continue
            }
            Err(e) => return Err(TransferError::from_io("body", e)),
        }
    }
    Ok(sent)
}

// Buffered fallback for platforms without sendfile(2) on sockets
#[cfg(not(target_os = "linux"))]
async fn transmit_body(
    file: &std::fs::File,
    stream: &mut TcpStream,
    size: u64,
    io_timeout: Duration,
) -> Result<u64, TransferError> {
    let f = file
        .try_clone()
        .map_err(|e| TransferError::Io { stage: "body", source: e })?;
    let mut f = tokio::fs::File::from_std(f).take(size);
    let mut buf = vec![0u8; (size.min(4 * 1024 * 1024) as usize).max(1)];
    let mut sent: u64 = 0;
    loop {
        let n = f
            .read(&mut buf)
            .await
            .map_err(|e| TransferError::Io { stage: "body", source: e })?;
        if n == 0 {
            break;
        }
        write_all_timed(stream, &buf[..n], io_timeout, "body").await?;
        sent += n as u64;
    }
    Ok(sent)
}

async fn await_ack(stream: &mut TcpStream, ack_timeout: Duration) -> Result<(), TransferError> {
    let mut b = [0u8; 1];
    match timeout(ack_timeout, stream.read(&mut b)).await {
        Ok(Ok(0)) => Err(TransferError::Protocol(
            "peer closed before acknowledgment".to_string(),
        )),
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(TransferError::from_io("acknowledgment", e)),
        Err(_) => Err(TransferError::Timeout {
            stage: "acknowledgment",
            ms: ms(ack_timeout),
        }),
    }
}

/// Read the next frame header.
///
/// `Ok(None)` when the peer closed cleanly between frames; a close after a
/// partial header is a protocol error.
pub async fn read_header<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<u64>, TransferError> {
    let mut hdr = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = read_timed(r, &mut hdr[filled..], None, "header").await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(TransferError::Protocol(format!(
                "peer closed after {} of {} header bytes",
                filled, HEADER_LEN
            )));
        }
        filled += n;
    }
    Ok(Some(decode_header(&hdr)))
}

/// Copy exactly `len` body bytes from `r` to `w` in reads of at most `chunk` bytes.
pub async fn receive_body<R, W>(
    r: &mut R,
    w: &mut W,
    len: u64,
    chunk: usize,
    io_timeout: Option<Duration>,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk.max(1).min(len.max(1) as usize)];
    let mut received: u64 = 0;
    while received < len {
        let want = (len - received).min(buf.len() as u64) as usize;
        let n = read_timed(r, &mut buf[..want], io_timeout, "body").await?;
        if n == 0 {
            return Err(TransferError::Protocol(format!(
                "connection closed inside frame body: got {} of {} bytes",
                received, len
            )));
        }
        w.write_all(&buf[..n])
            .await
            .map_err(|e| TransferError::Io { stage: "persist", source: e })?;
        received += n as u64;
    }
    w.flush()
        .await
        .map_err(|e| TransferError::Io { stage: "persist", source: e })?;
    Ok(received)
}

/// Acknowledge a fully received frame.
pub async fn write_ack<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), TransferError> {
    w.write_all(&[ACK_BYTE])
        .await
        .map_err(|e| TransferError::from_io("acknowledgment", e))?;
    w.flush()
        .await
        .map_err(|e| TransferError::from_io("acknowledgment", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    use crate::config::PoolSettings;
    use crate::pool::ConnectionPool;
    use crate::task::ConnectionKey;
    use tokio::net::TcpListener;

    /// Peer that consumes one whole frame, then either stays silent or hangs up.
    async fn swallowing_peer(hang_up: bool) -> (ConnectionKey, tokio::task::JoinHandle<()>) {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let key = ConnectionKey::new("127.0.0.1", l.local_addr().unwrap().port());
        let handle = tokio::spawn(async move {
            let (mut s, _) = l.accept().await.unwrap();
            let len = read_header(&mut s).await.unwrap().unwrap();
            let mut sink = Vec::new();
            receive_body(&mut s, &mut sink, len, 4096, None).await.unwrap();
            if hang_up {
                drop(s);
            } else {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
        (key, handle)
    }

    async fn send_to(key: &ConnectionKey) -> Result<u64, TransferError> {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("f.bin");
        std::fs::write(&path, vec![3u8; 1000]).unwrap();
        let mut pool = ConnectionPool::new(PoolSettings {
            ack_timeout_ms: 200,
            ..PoolSettings::default()
        });
        let mut conn = pool.acquire(key).await.unwrap();
        send_file(&mut conn, &path).await
    }

    #[tokio::test]
    async fn test_silent_peer_is_ack_timeout() {
        let (key, peer) = swallowing_peer(false).await;
        let err = send_to(&key).await.unwrap_err();
        assert!(err.is_timeout(), "{err}");
        assert!(!err.is_protocol());
        assert!(matches!(err, TransferError::Timeout { stage: "acknowledgment", .. }));
        peer.abort();
    }

    #[tokio::test]
    async fn test_close_before_ack_is_protocol_error() {
        let (key, peer) = swallowing_peer(true).await;
        let err = send_to(&key).await.unwrap_err();
        assert!(err.is_protocol(), "{err}");
        assert!(!err.is_timeout());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_close_before_header() {
        let (client, mut server) = duplex(64);
        drop(client);
        assert_eq!(read_header(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_partial_header_is_protocol_error() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0, 0, 0]).await.unwrap();
        drop(client);
        let err = read_header(&mut server).await.unwrap_err();
        assert!(err.is_protocol(), "{err}");
    }

    #[tokio::test]
    async fn test_header_split_across_reads() {
        let (mut client, mut server) = duplex(64);
        let writer = tokio::spawn(async move {
            let hdr = encode_header(300);
            client.write_all(&hdr[..5]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(&hdr[5..]).await.unwrap();
            client
        });
        assert_eq!(read_header(&mut server).await.unwrap(), Some(300));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_short_body_is_protocol_error() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[7u8; 10]).await.unwrap();
        drop(client);
        let mut out = Vec::new();
        let err = receive_body(&mut server, &mut out, 20, 4, None).await.unwrap_err();
        assert!(err.is_protocol());
        assert_eq!(out.len(), 10);
    }

    #[tokio::test]
    async fn test_body_read_in_bounded_chunks() {
        let (mut client, mut server) = duplex(1 << 16);
        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let expect = body.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&body).await.unwrap();
            client
        });
        let mut out = Vec::new();
        let n = receive_body(&mut server, &mut out, 10_000, 333, None).await.unwrap();
        assert_eq!(n, 10_000);
        assert_eq!(out, expect);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_length_body() {
        let (_client, mut server) = duplex(8);
        let mut out = Vec::new();
        assert_eq!(receive_body(&mut server, &mut out, 0, 1024, None).await.unwrap(), 0);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_body_read_timeout() {
        let (_client, mut server) = duplex(8);
        let mut out = Vec::new();
        let err = receive_body(&mut server, &mut out, 4, 4, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
