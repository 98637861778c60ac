//! Process-wide protocol-code -> handler registry (§4.6, §9 "state
//! machines, not interfaces"). Handler kinds are encoded as a tagged enum,
//! not trait objects, per the spec's explicit design note.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::DispatchError;
use crate::message::envelope::P2PMessage;
use crate::message::protocol::ProtocolCode;

pub type ResultHandlerFn = Arc<dyn Fn(&P2PMessage) -> Vec<u8> + Send + Sync>;
pub type VoidHandlerFn = Arc<dyn Fn(&P2PMessage) + Send + Sync>;

/// A handler is one of two kinds, never both (§4.6): a result handler MUST
/// return a non-empty byte response, a void handler returns nothing.
pub enum Handler {
    Result(ResultHandlerFn),
    Void(VoidHandlerFn),
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<u32, Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registration MUST refuse to bind a void handler to a protocol
    /// declared as having a response and vice versa (§4.6).
    pub fn register(&self, protocol: ProtocolCode, handler: Handler) -> Result<(), DispatchError> {
        let kind_matches = match (&handler, protocol.has_response()) {
            (Handler::Result(_), true) => true,
            (Handler::Void(_), false) => true,
            _ => false,
        };
        if !kind_matches {
            return Err(DispatchError::HandlerKindMismatch(protocol.as_u32()));
        }
        self.handlers
            .write()
            .expect("handler registry poisoned")
            .insert(protocol.as_u32(), handler);
        Ok(())
    }

    /// Looks up and dispatches by protocol code; unknown codes yield
    /// `NoHandler`. Result handlers that return an empty response are a
    /// contract violation (§4.6) and surface as `EmptyResponse`.
    pub fn dispatch(&self, message: &P2PMessage) -> Result<Option<Vec<u8>>, DispatchError> {
        let handlers = self.handlers.read().expect("handler registry poisoned");
        match handlers.get(&message.protocol_type) {
            None => Err(DispatchError::NoHandler(message.protocol_type)),
            Some(Handler::Void(f)) => {
                f(message);
                Ok(None)
            }
            Some(Handler::Result(f)) => {
                let response = f(message);
                if response.is_empty() {
                    return Err(DispatchError::EmptyResponse(message.protocol_type));
                }
                Ok(Some(response))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TimeOrderedId128;

    fn sample_message(protocol: ProtocolCode) -> P2PMessage {
        let id_gen = TimeOrderedId128::new();
        P2PMessage::new_request([1u8; 32], protocol, b"ping".to_vec(), &id_gen)
    }

    #[test]
    fn refuses_void_handler_on_response_protocol() {
        let registry = HandlerRegistry::new();
        let result = registry.register(ProtocolCode::TextV1, Handler::Void(Arc::new(|_| {})));
        assert!(matches!(result, Err(DispatchError::HandlerKindMismatch(_))));
    }

    #[test]
    fn refuses_result_handler_on_void_protocol() {
        let registry = HandlerRegistry::new();
        let result = registry.register(
            ProtocolCode::HeartbeatV1,
            Handler::Result(Arc::new(|_| b"x".to_vec())),
        );
        assert!(matches!(result, Err(DispatchError::HandlerKindMismatch(_))));
    }

    #[test]
    fn result_handler_dispatches_and_returns_payload() {
        let registry = HandlerRegistry::new();
        registry
            .register(
                ProtocolCode::TextV1,
                Handler::Result(Arc::new(|_| b"pong".to_vec())),
            )
            .unwrap();
        let response = registry.dispatch(&sample_message(ProtocolCode::TextV1)).unwrap();
        assert_eq!(response, Some(b"pong".to_vec()));
    }

    #[test]
    fn empty_response_is_a_contract_violation() {
        let registry = HandlerRegistry::new();
        registry
            .register(ProtocolCode::TextV1, Handler::Result(Arc::new(|_| Vec::new())))
            .unwrap();
        let result = registry.dispatch(&sample_message(ProtocolCode::TextV1));
        assert!(matches!(result, Err(DispatchError::EmptyResponse(_))));
    }

    #[test]
    fn unknown_protocol_yields_no_handler() {
        let registry = HandlerRegistry::new();
        let result = registry.dispatch(&sample_message(ProtocolCode::ZeroV1));
        assert!(matches!(result, Err(DispatchError::NoHandler(_))));
    }
}
