//! Closed protocol-code set (§6.3), grounded on the teacher's
//! `Message::command`/`max_size_for_command` match-table idiom.

use crate::error::MessageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolCode {
    HeartbeatV1 = 0,
    BlockV1 = 1,
    TxV1 = 2,
    ChainV1 = 3,
    TextV1 = 4,
    NetworkHandshakeV1 = 5,
    ZeroV1 = 6,
}

impl ProtocolCode {
    pub fn from_u32(code: u32) -> Result<Self, MessageError> {
        Ok(match code {
            0 => ProtocolCode::HeartbeatV1,
            1 => ProtocolCode::BlockV1,
            2 => ProtocolCode::TxV1,
            3 => ProtocolCode::ChainV1,
            4 => ProtocolCode::TextV1,
            5 => ProtocolCode::NetworkHandshakeV1,
            6 => ProtocolCode::ZeroV1,
            other => return Err(MessageError::UnknownProtocol(other)),
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// `/name/1.0.0`-style path label.
    pub fn path_label(self) -> &'static str {
        match self {
            ProtocolCode::HeartbeatV1 => "/heartbeat/1.0.0",
            ProtocolCode::BlockV1 => "/block/1.0.0",
            ProtocolCode::TxV1 => "/tx/1.0.0",
            ProtocolCode::ChainV1 => "/chain/1.0.0",
            ProtocolCode::TextV1 => "/text/1.0.0",
            ProtocolCode::NetworkHandshakeV1 => "/network_handshake/1.0.0",
            ProtocolCode::ZeroV1 => "/zero/1.0.0",
        }
    }

    /// Whether a request on this protocol code declares a response. The
    /// registry (§4.6) refuses to bind a handler kind that disagrees with
    /// this.
    pub fn has_response(self) -> bool {
        matches!(
            self,
            ProtocolCode::TextV1 | ProtocolCode::NetworkHandshakeV1 | ProtocolCode::TxV1
        )
    }
}
