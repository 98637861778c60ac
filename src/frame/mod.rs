//! L0: frame codec. Fixed 29-byte big-endian header plus variable payload
//! on top of UDP datagrams (§4.1, §6.1).
//!
//! ```text
//! offset  size  field
//! 0       8     connectionId
//! 8       8     dataId
//! 16      4     total
//! 20      1     frameType
//! 21      4     sequence
//! 25      4     frameTotalLength
//! 29      *     payload (length = frameTotalLength - 29)
//! ```

use std::net::SocketAddr;

use crate::config::{FRAME_HEADER_LEN, MAX_FRAME_PAYLOAD};
use crate::error::FrameError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 1,
    DataAck = 2,
    AllAck = 3,
    BatchAck = 4,
    Ping = 5,
    Pong = 6,
    ConnectReq = 7,
    ConnectResp = 8,
    Off = 9,
    PeerOff = 10,
}

impl FrameType {
    pub fn from_byte(b: u8) -> Result<Self, FrameError> {
        Ok(match b {
            1 => FrameType::Data,
            2 => FrameType::DataAck,
            3 => FrameType::AllAck,
            4 => FrameType::BatchAck,
            5 => FrameType::Ping,
            6 => FrameType::Pong,
            7 => FrameType::ConnectReq,
            8 => FrameType::ConnectResp,
            9 => FrameType::Off,
            10 => FrameType::PeerOff,
            other => return Err(FrameError::UnknownFrameType(other)),
        })
    }

    /// ACK-family and control frames that always carry `total=1, sequence=0`.
    pub fn is_singleton(&self) -> bool {
        !matches!(self, FrameType::Data)
    }
}

/// A single transport-level frame, built fresh per send/receive and owning
/// its payload buffer directly; see DESIGN.md for why this crate doesn't
/// pool frame buffers despite §9's "Ownership and pooling" design note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub connection_id: u64,
    pub data_id: u64,
    pub total: u32,
    pub frame_type: FrameType,
    pub sequence: u32,
    pub payload: Vec<u8>,
    pub remote_address: Option<SocketAddr>,
}

impl Frame {
    pub fn frame_total_length(&self) -> u32 {
        FRAME_HEADER_LEN as u32 + self.payload.len() as u32
    }

    /// Validates the invariants of §3.1 that are not structural (i.e. not
    /// already guaranteed by successful [`decode`]).
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.frame_type == FrameType::Data {
            if self.payload.len() > MAX_FRAME_PAYLOAD {
                return Err(FrameError::LengthMismatch {
                    declared: self.frame_total_length(),
                    actual: FRAME_HEADER_LEN + self.payload.len(),
                });
            }
            if self.sequence >= self.total {
                return Err(FrameError::SequenceOutOfRange {
                    sequence: self.sequence,
                    total: self.total,
                });
            }
            return Ok(());
        }

        // ACK/control frames: total=1 always. DATA_ACK's sequence echoes
        // the acknowledged fragment, so it is exempt from the
        // sequence-must-be-zero rule other singleton frame types follow.
        if self.total != 1 {
            return Err(FrameError::MalformedAck);
        }
        if self.frame_type != FrameType::DataAck && self.sequence != 0 {
            return Err(FrameError::MalformedAck);
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.connection_id.to_be_bytes());
        out.extend_from_slice(&self.data_id.to_be_bytes());
        out.extend_from_slice(&self.total.to_be_bytes());
        out.push(self.frame_type as u8);
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.frame_total_length().to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8], remote_address: Option<SocketAddr>) -> Result<Self, FrameError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(FrameError::TooShort {
                len: bytes.len(),
                min: FRAME_HEADER_LEN,
            });
        }
        let connection_id = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
        let data_id = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
        let total = u32::from_be_bytes(bytes[16..20].try_into().unwrap());
        let frame_type = FrameType::from_byte(bytes[20])?;
        let sequence = u32::from_be_bytes(bytes[21..25].try_into().unwrap());
        let frame_total_length = u32::from_be_bytes(bytes[25..29].try_into().unwrap());

        if (frame_total_length as usize) < FRAME_HEADER_LEN {
            return Err(FrameError::LengthBelowHeader {
                declared: frame_total_length,
                min: FRAME_HEADER_LEN as u32,
            });
        }
        if frame_total_length as usize != bytes.len() {
            return Err(FrameError::LengthMismatch {
                declared: frame_total_length,
                actual: bytes.len(),
            });
        }

        let frame = Frame {
            connection_id,
            data_id,
            total,
            frame_type,
            sequence,
            payload: bytes[FRAME_HEADER_LEN..].to_vec(),
            remote_address,
        };
        frame.validate()?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data_frame() -> Frame {
        Frame {
            connection_id: 0x0102030405060708,
            data_id: 0x1112131415161718,
            total: 3,
            frame_type: FrameType::Data,
            sequence: 1,
            payload: vec![9, 9, 9, 9],
            remote_address: None,
        }
    }

    #[test]
    fn encode_decode_round_trips_fields_and_payload() {
        let frame = sample_data_frame();
        let bytes = frame.encode();
        let decoded = Frame::decode(&bytes, None).unwrap();
        assert_eq!(decoded.connection_id, frame.connection_id);
        assert_eq!(decoded.data_id, frame.data_id);
        assert_eq!(decoded.total, frame.total);
        assert_eq!(decoded.frame_type, frame.frame_type);
        assert_eq!(decoded.sequence, frame.sequence);
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let err = Frame::decode(&[0u8; 10], None).unwrap_err();
        assert_eq!(
            err,
            FrameError::TooShort {
                len: 10,
                min: FRAME_HEADER_LEN
            }
        );
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let frame = sample_data_frame();
        let mut bytes = frame.encode();
        bytes.push(0xFF); // trailing garbage byte not reflected in frameTotalLength
        let err = Frame::decode(&bytes, None).unwrap_err();
        assert!(matches!(err, FrameError::LengthMismatch { .. }));
    }

    #[test]
    fn decode_rejects_sequence_out_of_range() {
        let mut frame = sample_data_frame();
        frame.sequence = 5; // total is 3
        let bytes = frame.encode();
        let err = Frame::decode(&bytes, None).unwrap_err();
        assert!(matches!(err, FrameError::SequenceOutOfRange { .. }));
    }

    #[test]
    fn ack_frames_require_total_one_sequence_zero() {
        let mut ack = sample_data_frame();
        ack.frame_type = FrameType::AllAck;
        ack.total = 1;
        ack.sequence = 0;
        ack.payload.clear();
        assert!(ack.validate().is_ok());

        ack.total = 2;
        assert!(matches!(ack.validate(), Err(FrameError::MalformedAck)));
    }
}
