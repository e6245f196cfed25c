//! Wire protocol: framing, sequencing, reassembly.

mod assembler;
mod codec;
mod frame;
mod sequence;

pub use assembler::{
    FeedOutcome, FrameTransform, LogicalMessage, NotificationAssembler, PlainTransform,
};
pub use codec::{
    chunk, decode_frame, decode_header, decode_payload, encode_frame, frame_checksum, Chunk,
    CHECKSUM_SIZE, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
pub use frame::{control, ctrl_sub, Frame, FrameHeader, PackageType};
pub use sequence::{AckWait, ReceiveStatus, SequenceTracker};
