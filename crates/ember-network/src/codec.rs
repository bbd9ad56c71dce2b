//! Wire framing.
//!
//! Every message on the wire is:
//!
//! ```text
//! +----------+----------+------------------+
//! |   Sync   |  Length  |     Payload      |
//! | 4 bytes  | 4 bytes  |  (Length bytes)  |
//! +----------+----------+------------------+
//! ```
//!
//! - Sync: the literal bytes `22 40 08 91`
//! - Length: payload byte count, big-endian, excluding the 8-byte header
//! - Payload: an RLP list whose first element is the packet opcode
//!
//! A misaligned or bad-sync frame is fatal for the connection.

use crate::{NetworkError, NetworkResult};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame sync magic.
pub const SYNC_BYTES: [u8; 4] = [0x22, 0x40, 0x08, 0x91];

/// Header size: sync (4) + length (4).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum payload size.
pub const MAX_FRAME_PAYLOAD: usize = 10 * 1024 * 1024; // 10 MiB

/// Seal a frame in place.
///
/// The first [`FRAME_HEADER_SIZE`] bytes of `frame` must be reserved by the
/// caller; the rest is the payload. Writes the sync bytes and the
/// big-endian payload length into the reserved prefix.
pub fn seal(frame: &mut [u8]) {
    debug_assert!(frame.len() >= FRAME_HEADER_SIZE);
    let len = (frame.len() - FRAME_HEADER_SIZE) as u32;
    frame[..4].copy_from_slice(&SYNC_BYTES);
    frame[4..8].copy_from_slice(&len.to_be_bytes());
}

/// Read and verify a frame header, returning the declared payload length.
pub fn read_frame_header(header: &[u8; FRAME_HEADER_SIZE]) -> NetworkResult<usize> {
    if header[..4] != SYNC_BYTES {
        let mut got = [0u8; 4];
        got.copy_from_slice(&header[..4]);
        return Err(NetworkError::BadMagic(got));
    }
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(NetworkError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_PAYLOAD,
        });
    }
    Ok(len)
}

/// Frame codec for use with `tokio_util::codec::Framed`.
///
/// Decodes to the raw payload bytes; packet decoding happens one layer up.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&src[..FRAME_HEADER_SIZE]);
        let len = read_frame_header(&header)?;

        let total = FRAME_HEADER_SIZE + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_SIZE);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = NetworkError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(NetworkError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_PAYLOAD,
            });
        }

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.resize(FRAME_HEADER_SIZE, 0);
        frame.extend_from_slice(&payload);
        seal(&mut frame);

        dst.extend_from_slice(&frame);
        Ok(())
    }
}
