//! Shared protocol constants for the filejet frame transport
//!
//! Wire format, one frame per file:
//!
//! ```text
//! sender -> receiver   [u64 big-endian length][length bytes of file content]
//! receiver -> sender   [1 byte acknowledgment]
//! ```
//!
//! Frames are sent back-to-back over one connection; the sender never starts
//! a new frame before it has read the acknowledgment of the previous one.

/// Size of the length header in bytes.
pub const HEADER_LEN: usize = 8;

/// Acknowledgment byte written by the receiver. The sender ignores its value.
pub const ACK_BYTE: u8 = 0x01;

/// Receiver read chunk size (64KB); messages are never assumed to fit in one read.
pub const RECV_CHUNK: usize = 64 * 1024;

// Largest single sendfile(2) call (8MB), same chunking as the buffered fallback
pub const SEND_CHUNK: usize = 8 * 1024 * 1024;

/// Defaults applied to queue entries that omit the target.
pub const DEFAULT_TARGET_HOST: &str = "127.0.0.1";
pub const DEFAULT_TARGET_PORT: u16 = 9000;

/// Encode a frame header for a body of `len` bytes.
pub fn encode_header(len: u64) -> [u8; HEADER_LEN] {
    len.to_be_bytes()
}

/// Decode a frame header into the declared body length.
pub fn decode_header(hdr: &[u8; HEADER_LEN]) -> u64 {
    u64::from_be_bytes(*hdr)
}

// Centralized timeout defaults shared by the dispatcher and the receiver
pub mod timeouts {
    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // Steady-state read/write stall timeout (ms)
    pub const IO_MS: u64 = 30_000;

    // Wait for the acknowledgment byte after a frame (ms)
    pub const ACK_MS: u64 = 30_000;

    // Queue blocking read (ms)
    pub const QUEUE_BLOCK_MS: u64 = 2_000;

    // Loop-level backoff after a queue error (ms)
    pub const LOOP_BACKOFF_MS: u64 = 1_000;
}
