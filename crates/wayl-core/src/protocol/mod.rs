//! Protocol module containing message types and the binary frame codec.

pub mod codec;
pub mod messages;

pub use codec::{
    decode_frame, decode_frame_body, decode_frame_header, decode_payload, decode_text_payload,
    encode_frame, encode_payload, Frame, FrameHeader, ProtocolError,
};
pub use messages::*;
