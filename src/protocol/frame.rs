//! Frame struct with typed accessors.
//!
//! One link-layer transmission unit: a 4-byte header, up to 255 payload
//! bytes and an optional 2-byte checksum. The `type` byte packs the package
//! type into its low 2 bits and the sub-type into the remaining 6:
//!
//! ```text
//! byte 0: type          = (sub_type << 2) | package_type
//! byte 1: frame_control   bit flags, see [`control`]
//! byte 2: sequence        (mod 256)
//! byte 3: data_length     (0-255)
//! bytes 4..: payload
//! [+2 checksum bytes, present iff control bit1 set]
//! ```

use bytes::Bytes;

/// Frame-control bit flags (header byte 1).
pub mod control {
    /// Payload is pre-encrypted by the injected transform.
    pub const ENCRYPTED: u8 = 0b0000_0001;
    /// A 2-byte checksum trails the payload.
    pub const CHECKSUM: u8 = 0b0000_0010;
    /// Direction: device to app (1) or app to device (0).
    pub const DIRECTION: u8 = 0b0000_0100;
    /// The sender expects a link-level ack for this frame.
    pub const ACK_REQUIRED: u8 = 0b0000_1000;
    /// More fragments of the same logical message follow.
    pub const HAS_FRAGMENT: u8 = 0b0001_0000;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(bits: u8, flag: u8) -> bool {
        bits & flag != 0
    }
}

/// Ctrl-package sub-types owned by the link layer itself.
pub mod ctrl_sub {
    /// Link-level ack; 1-byte payload holds the acknowledged sequence.
    pub const ACK: u8 = 0;
    /// Keep-alive link sync.
    pub const SYNC: u8 = 1;
    /// Best-effort final notice before releasing the transport.
    pub const GOODBYE: u8 = 2;
}

/// Package type, the low 2 bits of the type byte.
///
/// Only values 0 and 1 are assigned; the remaining encodings are decoded
/// as data so an unknown frame degrades to an unroutable message instead
/// of a hard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PackageType {
    /// Link-level control traffic.
    Ctrl,
    /// Application data.
    Data,
}

impl PackageType {
    /// Decode from the low 2 bits of the type byte.
    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => PackageType::Ctrl,
            _ => PackageType::Data,
        }
    }

    /// Wire encoding of this package type.
    #[inline]
    pub fn bits(self) -> u8 {
        match self {
            PackageType::Ctrl => 0,
            PackageType::Data => 1,
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Package type (type byte, low 2 bits).
    pub package_type: PackageType,
    /// Sub-type (type byte, high 6 bits).
    pub sub_type: u8,
    /// Frame-control flags (see [`control`]).
    pub control: u8,
    /// Link sequence number, mod 256.
    pub sequence: u8,
    /// Declared payload length.
    pub data_length: u8,
}

impl FrameHeader {
    /// Create a header; `sub_type` is masked to its 6 wire bits.
    pub fn new(package_type: PackageType, sub_type: u8, control: u8, sequence: u8) -> Self {
        Self {
            package_type,
            sub_type: sub_type & 0x3F,
            control,
            sequence,
            data_length: 0,
        }
    }

    /// Re-pack the type byte: `(sub_type << 2) | package_type`.
    #[inline]
    pub fn type_byte(&self) -> u8 {
        (self.sub_type << 2) | self.package_type.bits()
    }

    /// Split a type byte into package type and sub-type.
    #[inline]
    pub fn split_type_byte(byte: u8) -> (PackageType, u8) {
        (PackageType::from_bits(byte & 0b11), byte >> 2)
    }

    /// Check if the payload is encrypted.
    #[inline]
    pub fn is_encrypted(&self) -> bool {
        control::has_flag(self.control, control::ENCRYPTED)
    }

    /// Check if a checksum trails the payload.
    #[inline]
    pub fn has_checksum(&self) -> bool {
        control::has_flag(self.control, control::CHECKSUM)
    }

    /// Check if the sender expects a link-level ack.
    #[inline]
    pub fn ack_required(&self) -> bool {
        control::has_flag(self.control, control::ACK_REQUIRED)
    }

    /// Check if more fragments of the same message follow.
    #[inline]
    pub fn has_fragment(&self) -> bool {
        control::has_flag(self.control, control::HAS_FRAGMENT)
    }

    /// Check if this is a link-level ack frame.
    #[inline]
    pub fn is_link_ack(&self) -> bool {
        self.package_type == PackageType::Ctrl && self.sub_type == ctrl_sub::ACK
    }
}

/// A complete decoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: FrameHeader,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from header and payload, fixing up `data_length`.
    pub fn new(mut header: FrameHeader, payload: Bytes) -> Self {
        header.data_length = payload.len() as u8;
        Self { header, payload }
    }
}
