//! Protocol implementation module
//!
//! This module defines the command and result envelopes, their wire
//! encoding, and typed access to argument and return bytes.

pub mod args;
pub mod codec;
pub mod message;

pub use self::args::{ArgReader, Reply};
pub use self::codec::{
    command_frame_len, decode_command, decode_result, encode_command, encode_result, result_frame_len,
    ControllerCodec, FirmwareCodec, COMMAND_HEADER_LEN, RESULT_HEADER_LEN,
};
pub use self::message::{CommandEnvelope, ResultEnvelope};
