//! Frame encoding/decoding.
//!
//! Command frames (controller to firmware):
//!
//! ```text
//! +-----------+------------+------+---------+---------+------------------+
//! | module_id | command_id | unit | len_lo  | len_hi  | args[0..len]     |
//! +-----------+------------+------+---------+---------+------------------+
//! ```
//!
//! Result frames (firmware to controller):
//!
//! ```text
//! +--------+---------+---------+------------------+
//! | status | len_lo  | len_hi  | data[0..len]     |
//! +--------+---------+---------+------------------+
//! ```
//!
//! No padding and no checksum; the transport provides integrity.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{DecodeError, Error, ModuleId, StatusCode};
use super::message::{CommandEnvelope, ResultEnvelope};

/// Bytes preceding the argument run of a command frame
pub const COMMAND_HEADER_LEN: usize = 5;

/// Bytes preceding the data run of a result frame
pub const RESULT_HEADER_LEN: usize = 3;

/// Appends the wire form of a command to `dst`
pub fn encode_command(envelope: &CommandEnvelope, dst: &mut BytesMut) {
    dst.reserve(COMMAND_HEADER_LEN + envelope.args.len());
    dst.put_u8(envelope.module_id.0);
    dst.put_u8(envelope.command_id);
    dst.put_u8(envelope.unit);
    dst.put_u16_le(envelope.args.len() as u16);
    dst.extend_from_slice(&envelope.args);
}

/// Appends the wire form of a result to `dst`
pub fn encode_result(envelope: &ResultEnvelope, dst: &mut BytesMut) {
    dst.reserve(RESULT_HEADER_LEN + envelope.data.len());
    dst.put_u8(envelope.status as u8);
    dst.put_u16_le(envelope.data.len() as u16);
    dst.extend_from_slice(&envelope.data);
}

/// Checks a frame header and returns the declared payload length
fn declared_len(src: &[u8], header_len: usize, max_buffer: usize) -> Result<usize, DecodeError> {
    if src.len() < header_len {
        return Err(DecodeError::Truncated {
            needed: header_len,
            available: src.len(),
        });
    }

    let declared = u16::from_le_bytes([src[header_len - 2], src[header_len - 1]]) as usize;
    if declared > max_buffer {
        return Err(DecodeError::Oversize {
            declared,
            max: max_buffer,
        });
    }

    if src.len() < header_len + declared {
        return Err(DecodeError::Truncated {
            needed: header_len + declared,
            available: src.len(),
        });
    }

    Ok(declared)
}

/// Decodes one complete command frame
pub fn decode_command(src: &[u8], max_buffer: usize) -> Result<CommandEnvelope, DecodeError> {
    let len = declared_len(src, COMMAND_HEADER_LEN, max_buffer)?;
    Ok(CommandEnvelope {
        module_id: ModuleId(src[0]),
        command_id: src[1],
        unit: src[2],
        args: Bytes::copy_from_slice(&src[COMMAND_HEADER_LEN..COMMAND_HEADER_LEN + len]),
    })
}

/// Decodes one complete result frame
pub fn decode_result(src: &[u8], max_buffer: usize) -> Result<ResultEnvelope, DecodeError> {
    let len = declared_len(src, RESULT_HEADER_LEN, max_buffer)?;
    let status = StatusCode::from_u8(src[0]).ok_or(DecodeError::UnknownStatus(src[0]))?;
    Ok(ResultEnvelope {
        status,
        data: Bytes::copy_from_slice(&src[RESULT_HEADER_LEN..RESULT_HEADER_LEN + len]),
    })
}

/// Total length of the command frame at the start of `src`
///
/// Returns `None` until the header is complete. Used by stream transports to
/// split a byte stream into frames.
pub fn command_frame_len(src: &[u8]) -> Option<usize> {
    if src.len() < COMMAND_HEADER_LEN {
        return None;
    }
    let declared = u16::from_le_bytes([src[3], src[4]]) as usize;
    Some(COMMAND_HEADER_LEN + declared)
}

/// Total length of the result frame at the start of `src`
pub fn result_frame_len(src: &[u8]) -> Option<usize> {
    if src.len() < RESULT_HEADER_LEN {
        return None;
    }
    let declared = u16::from_le_bytes([src[1], src[2]]) as usize;
    Some(RESULT_HEADER_LEN + declared)
}

/// Streaming variant of the header check
///
/// `Ok(None)` means more bytes are needed. On an oversize header the buffered
/// bytes are dropped, since there is no way to resynchronise inside them.
fn stream_frame(
    src: &mut BytesMut,
    header_len: usize,
    max_buffer: usize,
) -> Result<Option<BytesMut>, Error> {
    match declared_len(&src[..], header_len, max_buffer) {
        Ok(len) => Ok(Some(src.split_to(header_len + len))),
        Err(DecodeError::Truncated { needed, .. }) => {
            src.reserve(needed - src.len());
            Ok(None)
        }
        Err(e) => {
            src.clear();
            Err(e.into())
        }
    }
}

/// Firmware-side codec: decodes commands, encodes results
#[derive(Debug, Clone)]
pub struct FirmwareCodec {
    max_buffer: usize,
}

impl FirmwareCodec {
    /// Creates a new firmware codec
    pub fn new(max_buffer: usize) -> Self {
        FirmwareCodec { max_buffer }
    }
}

impl Decoder for FirmwareCodec {
    type Item = CommandEnvelope;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match stream_frame(src, COMMAND_HEADER_LEN, self.max_buffer)? {
            Some(frame) => Ok(Some(decode_command(&frame, self.max_buffer)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<ResultEnvelope> for FirmwareCodec {
    type Error = Error;

    fn encode(&mut self, item: ResultEnvelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.data.len() > self.max_buffer {
            return Err(Error::protocol(format!(
                "result of {} bytes exceeds buffer capacity {}",
                item.data.len(),
                self.max_buffer
            )));
        }
        encode_result(&item, dst);
        Ok(())
    }
}

/// Controller-side codec: encodes commands, decodes results
#[derive(Debug, Clone)]
pub struct ControllerCodec {
    max_buffer: usize,
}

impl ControllerCodec {
    /// Creates a new controller codec
    pub fn new(max_buffer: usize) -> Self {
        ControllerCodec { max_buffer }
    }
}

impl Decoder for ControllerCodec {
    type Item = ResultEnvelope;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match stream_frame(src, RESULT_HEADER_LEN, self.max_buffer)? {
            Some(mut frame) => {
                let status = frame.get_u8();
                let status = StatusCode::from_u8(status).ok_or(DecodeError::UnknownStatus(status))?;
                frame.advance(RESULT_HEADER_LEN - 1);
                Ok(Some(ResultEnvelope {
                    status,
                    data: frame.freeze(),
                }))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<CommandEnvelope> for ControllerCodec {
    type Error = Error;

    fn encode(&mut self, item: CommandEnvelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.args.len() > self.max_buffer {
            return Err(Error::protocol(format!(
                "{} argument bytes exceed buffer capacity {}",
                item.args.len(),
                self.max_buffer
            )));
        }
        encode_command(&item, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ModuleKind, DEFAULT_MAX_BUFFER};
    use rand::Rng;

    fn encoded(envelope: &CommandEnvelope) -> BytesMut {
        let mut bytes = BytesMut::new();
        encode_command(envelope, &mut bytes);
        bytes
    }

    #[test]
    fn test_command_layout() {
        let cmd = CommandEnvelope::to(ModuleKind::Stepper, 1)
            .with_unit(3)
            .with_args(1000i32.to_le_bytes().to_vec());

        let bytes = encoded(&cmd);
        assert_eq!(&bytes[..], &[1, 1, 3, 4, 0, 0xE8, 0x03, 0, 0]);
        assert_eq!(command_frame_len(&bytes), Some(bytes.len()));
    }

    #[test]
    fn test_random_commands_survive_the_wire() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let len = rng.gen_range(0..=DEFAULT_MAX_BUFFER);
            let args: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let cmd = CommandEnvelope::new(ModuleId(rng.gen()), rng.gen())
                .with_unit(rng.gen())
                .with_args(args);

            let decoded = decode_command(&encoded(&cmd), DEFAULT_MAX_BUFFER).unwrap();
            assert_eq!(decoded, cmd);
        }
    }

    #[test]
    fn test_oversize_declared_length() {
        // Header declares 200 argument bytes, capacity is 64
        let mut frame = vec![1, 1, 0];
        frame.extend_from_slice(&200u16.to_le_bytes());
        frame.extend_from_slice(&[0u8; 10]);

        assert_eq!(
            decode_command(&frame, 64),
            Err(DecodeError::Oversize { declared: 200, max: 64 })
        );

        // Still oversize when all declared bytes are present
        frame.resize(COMMAND_HEADER_LEN + 200, 0);
        assert!(matches!(decode_command(&frame, 64), Err(DecodeError::Oversize { .. })));
    }

    #[test]
    fn test_truncated_frames() {
        assert_eq!(
            decode_command(&[1, 2], 64),
            Err(DecodeError::Truncated { needed: 5, available: 2 })
        );

        let mut frame = vec![1, 1, 0];
        frame.extend_from_slice(&4u16.to_le_bytes());
        frame.extend_from_slice(&[1, 2]);
        assert_eq!(
            decode_command(&frame, 64),
            Err(DecodeError::Truncated { needed: 9, available: 7 })
        );
    }

    #[test]
    fn test_result_unknown_status() {
        assert_eq!(decode_result(&[9, 0, 0], 64), Err(DecodeError::UnknownStatus(9)));
    }

    #[test]
    fn test_frame_len_helpers() {
        assert_eq!(command_frame_len(&[0, 0, 0, 2]), None);
        assert_eq!(command_frame_len(&[0, 0, 0, 2, 0]), Some(7));
        assert_eq!(result_frame_len(&[0, 1]), None);
        assert_eq!(result_frame_len(&[0, 4, 0, 9]), Some(7));
    }

    #[test]
    fn test_streaming_command_decode() {
        let mut codec = FirmwareCodec::new(64);
        let cmd = CommandEnvelope::to(ModuleKind::Pin, 2).with_args(vec![13, 1]);
        let bytes = encoded(&cmd);

        let mut src = BytesMut::new();
        src.extend_from_slice(&bytes[..4]);
        assert!(codec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(&bytes[4..]);
        src.extend_from_slice(&bytes);
        assert_eq!(codec.decode(&mut src).unwrap(), Some(cmd.clone()));
        assert_eq!(codec.decode(&mut src).unwrap(), Some(cmd));
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_streaming_oversize_clears_buffer() {
        let mut codec = FirmwareCodec::new(64);
        let mut src = BytesMut::from(&[1u8, 1, 0, 200, 0, 1, 2, 3][..]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(Error::Decode(DecodeError::Oversize { declared: 200, max: 64 }))
        ));
        assert!(src.is_empty());
    }

    #[test]
    fn test_result_codec_pair() {
        let mut firmware = FirmwareCodec::new(64);
        let mut controller = ControllerCodec::new(64);
        let mut wire = BytesMut::new();

        let result = ResultEnvelope::ok(vec![0xAA, 0xBB]);
        firmware.encode(result.clone(), &mut wire).unwrap();
        assert_eq!(&wire[..], &[0, 2, 0, 0xAA, 0xBB]);
        assert_eq!(controller.decode(&mut wire).unwrap(), Some(result));

        let too_big = ResultEnvelope::ok(vec![0u8; 65]);
        assert!(firmware.encode(too_big, &mut wire).is_err());

        let too_big = CommandEnvelope::new(ModuleId(1), 0).with_args(vec![0u8; 65]);
        assert!(controller.encode(too_big, &mut wire).is_err());
    }
}
