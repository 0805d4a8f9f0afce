//! Probe packet structures for the timestamp-exchange protocol.
//!
//! Every field on the wire is an unsigned 32-bit word in network (big-endian)
//! byte order. A timestamp occupies two words: seconds, then microseconds.

use thiserror::Error;

use crate::time::Timestamp;

/// Size in bytes of one encoded timestamp (two 32-bit words).
pub const TIMESTAMP_SIZE: usize = 8;
/// Size in bytes of a probe request.
pub const PROBE_REQUEST_SIZE: usize = TIMESTAMP_SIZE;
/// Size in bytes of a probe reply.
pub const PROBE_REPLY_SIZE: usize = 2 * TIMESTAMP_SIZE;

/// Errors raised while decoding probe packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// The buffer ended before the fixed layout did.
    #[error("Buffer too small: need {needed} bytes, got {got}")]
    TooShort { needed: usize, got: usize },
}

/// Writes a timestamp into the first 8 bytes of `buf`.
///
/// # Panics
/// Panics if `buf` is shorter than [`TIMESTAMP_SIZE`].
pub fn encode_timestamp(ts: &Timestamp, buf: &mut [u8]) {
    buf[0..4].copy_from_slice(&ts.secs.to_be_bytes());
    buf[4..8].copy_from_slice(&ts.micros.to_be_bytes());
}

/// Reads a timestamp from the first 8 bytes of `buf`.
pub fn decode_timestamp(buf: &[u8]) -> Result<Timestamp, PacketError> {
    if buf.len() < TIMESTAMP_SIZE {
        return Err(PacketError::TooShort {
            needed: TIMESTAMP_SIZE,
            got: buf.len(),
        });
    }
    Ok(Timestamp {
        secs: read_word(buf, 0),
        micros: read_word(buf, 4),
    })
}

fn read_word(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Probe sent by a Prober to a peer's Responder (8 bytes).
///
/// Wire format:
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                     Sender Seconds                            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                   Sender Microseconds                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    /// Time the Prober sent the probe, on the Prober's clock.
    pub sent_at: Timestamp,
}

impl ProbeRequest {
    pub fn to_bytes(&self) -> [u8; PROBE_REQUEST_SIZE] {
        let mut buf = [0u8; PROBE_REQUEST_SIZE];
        encode_timestamp(&self.sent_at, &mut buf);
        buf
    }

    /// Decodes a request; bytes past the fixed layout are ignored.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < PROBE_REQUEST_SIZE {
            return Err(PacketError::TooShort {
                needed: PROBE_REQUEST_SIZE,
                got: buf.len(),
            });
        }
        Ok(Self {
            sent_at: decode_timestamp(buf)?,
        })
    }
}

/// Reply reflected by a Responder (16 bytes).
///
/// Wire format:
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                 Echoed Sender Seconds                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |               Echoed Sender Microseconds                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                Responder Arrival Seconds                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |              Responder Arrival Microseconds                   |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProbeReply {
    /// The sender timestamp, copied unchanged from the request.
    pub sent_at: Timestamp,
    /// Time the Responder received the request, on the Responder's clock.
    pub arrived_at: Timestamp,
}

impl ProbeReply {
    pub fn to_bytes(&self) -> [u8; PROBE_REPLY_SIZE] {
        let mut buf = [0u8; PROBE_REPLY_SIZE];
        encode_timestamp(&self.sent_at, &mut buf[0..TIMESTAMP_SIZE]);
        encode_timestamp(&self.arrived_at, &mut buf[TIMESTAMP_SIZE..]);
        buf
    }

    /// Decodes a reply; bytes past the fixed layout are ignored.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < PROBE_REPLY_SIZE {
            return Err(PacketError::TooShort {
                needed: PROBE_REPLY_SIZE,
                got: buf.len(),
            });
        }
        Ok(Self {
            sent_at: decode_timestamp(&buf[0..TIMESTAMP_SIZE])?,
            arrived_at: decode_timestamp(&buf[TIMESTAMP_SIZE..])?,
        })
    }
}
