//! Frame encoding, decoding and MTU-bounded chunking.
//!
//! The checksum, when present, is CRC-16/XMODEM over
//! `[sequence, data_length, payload]`, appended big-endian.

use bytes::Bytes;
use crc::{Crc, CRC_16_XMODEM};

use super::frame::{Frame, FrameHeader};
use crate::error::{MowlinkError, Result};

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 4;

/// Trailing checksum size in bytes, when present.
pub const CHECKSUM_SIZE: usize = 2;

/// Largest payload the one-byte length field can declare.
pub const MAX_PAYLOAD_SIZE: usize = 255;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Compute the frame checksum over `[sequence, data_length, payload]`.
pub fn frame_checksum(sequence: u8, data_length: u8, payload: &[u8]) -> u16 {
    let mut digest = CRC16.digest();
    digest.update(&[sequence, data_length]);
    digest.update(payload);
    digest.finalize()
}

/// Encode one wire frame.
///
/// Writes the 4-byte header, the payload, and the 2 checksum bytes iff the
/// header's checksum bit is set. Fails `FrameTooLarge` if the payload does
/// not fit the one-byte length field.
pub fn encode_frame(header: &FrameHeader, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(MowlinkError::FrameTooLarge { len: payload.len() });
    }

    let data_length = payload.len() as u8;
    let trailer = if header.has_checksum() {
        CHECKSUM_SIZE
    } else {
        0
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + trailer);
    buf.push(header.type_byte());
    buf.push(header.control);
    buf.push(header.sequence);
    buf.push(data_length);
    buf.extend_from_slice(payload);

    if header.has_checksum() {
        let checksum = frame_checksum(header.sequence, data_length, payload);
        buf.extend_from_slice(&checksum.to_be_bytes());
    }

    Ok(buf)
}

/// Decode the fixed header. Fails `FrameTooShort` on fewer than 4 bytes.
pub fn decode_header(buf: &[u8]) -> Result<FrameHeader> {
    if buf.len() < HEADER_SIZE {
        return Err(MowlinkError::FrameTooShort {
            len: buf.len(),
            min: HEADER_SIZE,
        });
    }

    let (package_type, sub_type) = FrameHeader::split_type_byte(buf[0]);
    Ok(FrameHeader {
        package_type,
        sub_type,
        control: buf[1],
        sequence: buf[2],
        data_length: buf[3],
    })
}

/// Extract and verify the payload declared by `header`.
///
/// Fails `FrameTooShort` if the buffer does not hold the declared payload
/// (and checksum, if present), and `ChecksumMismatch` if the trailing bytes
/// do not match. Either way the caller drops the frame; neither is fatal to
/// the link.
pub fn decode_payload(header: &FrameHeader, buf: &[u8]) -> Result<Bytes> {
    let payload_end = HEADER_SIZE + header.data_length as usize;
    let total = payload_end + if header.has_checksum() { CHECKSUM_SIZE } else { 0 };

    if buf.len() < total {
        return Err(MowlinkError::FrameTooShort {
            len: buf.len(),
            min: total,
        });
    }

    let payload = &buf[HEADER_SIZE..payload_end];

    if header.has_checksum() {
        let received = u16::from_be_bytes([buf[payload_end], buf[payload_end + 1]]);
        let computed = frame_checksum(header.sequence, header.data_length, payload);
        if received != computed {
            return Err(MowlinkError::ChecksumMismatch { computed, received });
        }
    }

    Ok(Bytes::copy_from_slice(payload))
}

/// Decode a complete frame: header, payload, checksum verification.
pub fn decode_frame(buf: &[u8]) -> Result<Frame> {
    let header = decode_header(buf)?;
    let payload = decode_payload(&header, buf)?;
    Ok(Frame { header, payload })
}

/// One piece of a chunked payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// Payload bytes of this piece.
    pub data: &'a [u8],
    /// Set on every piece but the last.
    pub has_fragment: bool,
}

/// Split a payload into pieces no larger than `max_chunk_len`.
///
/// `max_chunk_len` is the link MTU minus the fixed frame overhead, supplied
/// by the transport; it is clamped to the length-field maximum. An empty
/// payload yields a single empty chunk so the command still produces one
/// frame on the wire.
pub fn chunk(payload: &[u8], max_chunk_len: usize) -> Vec<Chunk<'_>> {
    let piece_len = max_chunk_len.clamp(1, MAX_PAYLOAD_SIZE);

    if payload.is_empty() {
        return vec![Chunk {
            data: payload,
            has_fragment: false,
        }];
    }

    let mut chunks: Vec<Chunk<'_>> = payload
        .chunks(piece_len)
        .map(|data| Chunk {
            data,
            has_fragment: true,
        })
        .collect();
    if let Some(last) = chunks.last_mut() {
        last.has_fragment = false;
    }
    chunks
}
