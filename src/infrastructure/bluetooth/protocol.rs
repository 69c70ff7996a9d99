//! Proteus Protocol
//!
//! Application-layer framing used on the Proteus write and notify
//! characteristics.
//!
//! # Frame Structure
//!
//! ```text
//! [0]     : Command byte
//! [1..N]  : Payload (0..N bytes, N bounded by negotiated PDU - 4)
//! ```

use anyhow::Result;
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

/// Proteus primary service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_C352_11E5_953D_0002A5D5C51B);

/// TX characteristic, written by the central
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400002_C352_11E5_953D_0002A5D5C51B);

/// RX characteristic, notified by the peripheral
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400003_C352_11E5_953D_0002A5D5C51B);

/// Bytes of the negotiated PDU not available to the frame
pub const PDU_OVERHEAD: usize = 4;

/// Frame budget when only the default BLE 4.0 PDU (23 bytes) is available
pub const DEFAULT_MAX_PAYLOAD: usize = 23 - PDU_OVERHEAD;

/// Frame commands known to the Proteus firmware.
///
/// Any other byte is carried as [`Command::Other`] and passed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Plain user data
    Data,
    /// User data sent in high-throughput mode
    HighThroughputData,
    Other(u8),
}

impl Command {
    pub const DATA: u8 = 0x01;
    pub const HIGH_THROUGHPUT_DATA: u8 = 0x04;

    pub fn code(self) -> u8 {
        match self {
            Command::Data => Self::DATA,
            Command::HighThroughputData => Self::HIGH_THROUGHPUT_DATA,
            Command::Other(code) => code,
        }
    }
}

impl From<u8> for Command {
    fn from(code: u8) -> Self {
        match code {
            Self::DATA => Command::Data,
            Self::HIGH_THROUGHPUT_DATA => Command::HighThroughputData,
            other => Command::Other(other),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Payload too large: frame of {frame_len} bytes exceeds budget of {max_payload}")]
    PayloadTooLarge { frame_len: usize, max_payload: usize },
    #[error("Empty frame")]
    EmptyFrame,
}

/// Encoded frame, ready to be written to the peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    pub fn command(&self) -> u8 {
        self.bytes[0]
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[1..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Encoder/decoder for the one-byte-header protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl FrameCodec {
    /// `max_payload` is the budget for command byte plus payload.
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    /// Codec for a negotiated PDU size.
    pub fn for_pdu(pdu_size: usize) -> Self {
        Self::new(pdu_size.saturating_sub(PDU_OVERHEAD))
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn encode(&self, cmd: u8, payload: &[u8]) -> Result<Frame, FrameError> {
        let frame_len = payload.len() + 1;
        if frame_len > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                frame_len,
                max_payload: self.max_payload,
            });
        }

        let mut bytes = Vec::with_capacity(frame_len);
        bytes.push(cmd);
        bytes.extend_from_slice(payload);
        trace!("Encoded frame: {:02X?}", bytes);
        Ok(Frame { bytes })
    }

    pub fn decode(&self, raw: &[u8]) -> Result<(u8, Vec<u8>), FrameError> {
        decode(raw)
    }
}

/// Split a raw notification into command and payload.
pub fn decode(raw: &[u8]) -> Result<(u8, Vec<u8>), FrameError> {
    let (cmd, payload) = raw.split_first().ok_or(FrameError::EmptyFrame)?;
    Ok((*cmd, payload.to_vec()))
}

/// Upper-case hex rendering used in status lines.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Parse operator hex input. Whitespace is ignored; the digit count must be even.
pub fn parse_hex(text: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(compact)
}

/// Parse a configured UUID string.
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim())
        .map_err(|e| anyhow::anyhow!("Invalid UUID format '{}': {}", uuid_str, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::settings::{
        PROTEUS_NOTIFY_CHAR_UUID, PROTEUS_SERVICE_UUID, PROTEUS_WRITE_CHAR_UUID,
    };
    use proptest::prelude::*;

    #[test]
    fn test_parse_uuid() {
        let uuid = parse_uuid(PROTEUS_SERVICE_UUID).unwrap();
        assert_eq!(uuid.as_u128() >> 96, 0x6E40_0001);
        assert!(parse_uuid("6E400001").is_err());
    }

    #[test]
    fn test_uuid_constants_match_defaults() {
        assert_eq!(parse_uuid(PROTEUS_SERVICE_UUID).unwrap(), SERVICE_UUID);
        assert_eq!(parse_uuid(PROTEUS_WRITE_CHAR_UUID).unwrap(), WRITE_CHAR_UUID);
        assert_eq!(parse_uuid(PROTEUS_NOTIFY_CHAR_UUID).unwrap(), NOTIFY_CHAR_UUID);
    }

    #[test]
    fn test_encode_decode_data_frame() {
        let codec = FrameCodec::new(20);
        let frame = codec.encode(0x01, &[0xDE, 0xAD]).unwrap();
        assert_eq!(frame.as_bytes(), &[0x01, 0xDE, 0xAD]);
        assert_eq!(frame.command(), 0x01);
        assert_eq!(frame.payload(), &[0xDE, 0xAD]);
        assert_eq!(codec.decode(frame.as_bytes()).unwrap(), (0x01, vec![0xDE, 0xAD]));
    }

    #[test]
    fn test_payload_budget() {
        let codec = FrameCodec::new(4);
        assert!(codec.encode(0x01, &[1, 2, 3]).is_ok());
        assert_eq!(
            codec.encode(0x01, &[1, 2, 3, 4]),
            Err(FrameError::PayloadTooLarge {
                frame_len: 5,
                max_payload: 4
            })
        );
    }

    #[test]
    fn test_decode_edge_cases() {
        assert_eq!(decode(&[]), Err(FrameError::EmptyFrame));
        assert_eq!(decode(&[0x04]).unwrap(), (0x04, vec![]));
        // unknown commands pass through
        assert_eq!(decode(&[0x7F, 0x00]).unwrap(), (0x7F, vec![0x00]));
    }

    #[test]
    fn test_command_codes() {
        assert_eq!(Command::from(0x01), Command::Data);
        assert_eq!(Command::from(0x04), Command::HighThroughputData);
        assert_eq!(Command::from(0x05), Command::Other(0x05));
        assert_eq!(Command::Other(0x05).code(), 0x05);
    }

    #[test]
    fn test_codec_for_pdu() {
        assert_eq!(FrameCodec::for_pdu(247).max_payload(), 243);
        assert_eq!(FrameCodec::for_pdu(2).max_payload(), 0);
        assert_eq!(FrameCodec::default().max_payload(), 19);
    }

    #[test]
    fn test_hex_helpers() {
        assert_eq!(parse_hex("de AD 01").unwrap(), vec![0xDE, 0xAD, 0x01]);
        assert!(parse_hex("ABC").is_err());
        assert!(parse_hex("zz").is_err());
        assert_eq!(to_hex(&[0x0a, 0xff]), "0AFF");
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            cmd in any::<u8>(),
            max_payload in 1usize..64,
            payload in proptest::collection::vec(any::<u8>(), 0..80),
        ) {
            let codec = FrameCodec::new(max_payload);
            match codec.encode(cmd, &payload) {
                Ok(frame) => {
                    prop_assert!(payload.len() < max_payload);
                    prop_assert_eq!(codec.decode(frame.as_bytes()).unwrap(), (cmd, payload));
                }
                Err(FrameError::PayloadTooLarge { .. }) => prop_assert!(payload.len() >= max_payload),
                Err(other) => prop_assert!(false, "unexpected error {:?}", other),
            }
        }
    }
}
