//! `P2PMessage` application envelope (§3.4, §4.6), grounded on the
//! teacher's `net::message::Message` enum and size-table pattern.

use serde::{Deserialize, Serialize};

use crate::error::MessageError;
use crate::ids::{is_zero_id, zero_id, TimeOrderedId128};
use crate::message::protocol::ProtocolCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqResFlag {
    Request = 0,
    Response = 1,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct P2PMessage {
    pub sender_id: [u8; 32],
    pub message_id: [u8; 16],
    pub request_id: [u8; 16],
    pub req_res_flag: u8,
    pub protocol_type: u32,
    pub length: u32,
    pub version: u16,
    pub payload: Vec<u8>,
}

impl P2PMessage {
    pub fn new_request(sender_id: [u8; 32], protocol: ProtocolCode, payload: Vec<u8>, id_gen: &TimeOrderedId128) -> Self {
        let m = id_gen.next();
        let length = payload.len() as u32;
        Self {
            sender_id,
            message_id: m,
            request_id: m,
            req_res_flag: ReqResFlag::Request as u8,
            protocol_type: protocol.as_u32(),
            length,
            version: 1,
            payload,
        }
    }

    pub fn new_response(
        sender_id: [u8; 32],
        protocol: ProtocolCode,
        orig_request_id: [u8; 16],
        payload: Vec<u8>,
        id_gen: &TimeOrderedId128,
    ) -> Self {
        let length = payload.len() as u32;
        Self {
            sender_id,
            message_id: id_gen.next(),
            request_id: orig_request_id,
            req_res_flag: ReqResFlag::Response as u8,
            protocol_type: protocol.as_u32(),
            length,
            version: 1,
            payload,
        }
    }

    pub fn new_normal(sender_id: [u8; 32], protocol: ProtocolCode, payload: Vec<u8>, id_gen: &TimeOrderedId128) -> Self {
        let length = payload.len() as u32;
        Self {
            sender_id,
            message_id: id_gen.next(),
            request_id: zero_id(),
            req_res_flag: ReqResFlag::Request as u8,
            protocol_type: protocol.as_u32(),
            length,
            version: 1,
            payload,
        }
    }

    pub fn is_request(&self) -> bool {
        !is_zero_id(&self.request_id) && self.req_res_flag == ReqResFlag::Request as u8
    }

    pub fn is_response(&self) -> bool {
        !is_zero_id(&self.request_id) && self.req_res_flag == ReqResFlag::Response as u8
    }

    pub fn protocol_code(&self) -> Result<ProtocolCode, MessageError> {
        ProtocolCode::from_u32(self.protocol_type)
    }

    /// §4.6 "Validation on receive".
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.sender_id.len() != 32 {
            return Err(MessageError::BadSenderId(self.sender_id.len()));
        }
        if self.message_id.len() != 16 {
            return Err(MessageError::BadMessageId(self.message_id.len()));
        }
        if self.request_id.len() != 16 {
            return Err(MessageError::BadRequestId(self.request_id.len()));
        }
        if self.version < 1 {
            return Err(MessageError::BadVersion(self.version));
        }
        if self.length as usize != self.payload.len() {
            return Err(MessageError::LengthMismatch {
                declared: self.length,
                actual: self.payload.len(),
            });
        }
        self.protocol_code()?;
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        postcard::to_allocvec(self).map_err(|e| MessageError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let msg: P2PMessage =
            postcard::from_bytes(bytes).map_err(|e| MessageError::Codec(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }
}
