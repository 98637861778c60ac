//! X25519 key agreement + Ed25519-signed handshake record (§3.5, §4.5).
//!
//! **Signing (§9 Open Question, resolved).** This implementation always
//! signs the canonical encoding with the node's long-term Ed25519 key; the
//! responder rejects any handshake whose signature does not verify against
//! its declared `nodeId`, per the spec's "a conforming implementation MUST
//! sign."

use serde::{Deserialize, Serialize};

use crate::config::NETWORK_MAGIC;
use crate::crypto::{self, CryptoError, Keypair};
use crate::error::ConnError;
use crate::ids::TimeOrderedId128;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkHandshake {
    pub network_magic: u32,
    pub node_id: [u8; 32],
    pub nonce_id: [u8; 16],
    pub node_version: String,
    /// Holds the sender's ephemeral X25519 public key during exchange
    /// (§3.5).
    pub shared_secret: [u8; 32],
    pub signature: Vec<u8>,
}

impl NetworkHandshake {
    /// Canonical byte encoding signed over (everything but the signature
    /// itself).
    fn canonical_encoding(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.network_magic.to_be_bytes());
        out.extend_from_slice(&self.node_id);
        out.extend_from_slice(&self.nonce_id);
        out.extend_from_slice(self.node_version.as_bytes());
        out.extend_from_slice(&self.shared_secret);
        out
    }

    pub fn sign(mut self, keypair: &Keypair) -> Self {
        let encoding = self.canonical_encoding();
        self.signature = keypair.sign(&encoding).to_vec();
        self
    }

    pub fn verify_signature(&self) -> Result<(), CryptoError> {
        crypto::verify(&self.node_id, &self.canonical_encoding(), &self.signature)
    }
}

/// Builds and signs the initiator's handshake record (§4.5, initiator
/// side). The caller retains the returned `EphemeralSecret` to complete the
/// agreement once the responder's reply arrives.
pub fn build_initiator_handshake(
    keypair: &Keypair,
    node_version: &str,
    id_gen: &TimeOrderedId128,
) -> (NetworkHandshake, x25519_dalek::EphemeralSecret) {
    let (ephemeral_secret, ephemeral_public) = crypto::generate_ephemeral();
    let nonce_id = id_gen.next();
    let handshake = NetworkHandshake {
        network_magic: NETWORK_MAGIC,
        node_id: *keypair.public_key(),
        nonce_id,
        node_version: node_version.to_string(),
        shared_secret: ephemeral_public,
        signature: Vec::new(),
    }
    .sign(keypair);
    (handshake, ephemeral_secret)
}

/// Validates an inbound handshake (magic, version compatibility, and
/// signature against the declared `nodeId`) and, on success, builds the
/// responder's reply plus the derived session key (§4.5, responder side).
pub fn respond_to_handshake(
    keypair: &Keypair,
    node_version: &str,
    id_gen: &TimeOrderedId128,
    incoming: &NetworkHandshake,
) -> Result<(NetworkHandshake, [u8; 32]), ConnError> {
    if incoming.network_magic != NETWORK_MAGIC {
        return Err(ConnError::HandshakeRejected("network magic mismatch"));
    }
    if incoming.signature.is_empty() {
        return Err(ConnError::HandshakeRejected("handshake is unsigned"));
    }
    incoming
        .verify_signature()
        .map_err(|_| ConnError::HandshakeRejected("signature verification failed"))?;

    let (ephemeral_secret, ephemeral_public) = crypto::generate_ephemeral();
    let shared_secret = crypto::ephemeral_agree(ephemeral_secret, &incoming.shared_secret);
    let session_key = crypto::derive_session_key(&shared_secret);

    let reply = NetworkHandshake {
        network_magic: NETWORK_MAGIC,
        node_id: *keypair.public_key(),
        nonce_id: id_gen.next(),
        node_version: node_version.to_string(),
        shared_secret: ephemeral_public,
        signature: Vec::new(),
    }
    .sign(keypair);

    Ok((reply, session_key))
}

/// Completes the initiator side once the responder's reply has arrived:
/// verifies it and derives the same session key.
pub fn complete_initiator_handshake(
    ephemeral_secret: x25519_dalek::EphemeralSecret,
    reply: &NetworkHandshake,
) -> Result<[u8; 32], ConnError> {
    if reply.network_magic != NETWORK_MAGIC {
        return Err(ConnError::HandshakeRejected("network magic mismatch"));
    }
    if reply.signature.is_empty() {
        return Err(ConnError::HandshakeRejected("handshake is unsigned"));
    }
    reply
        .verify_signature()
        .map_err(|_| ConnError::HandshakeRejected("signature verification failed"))?;

    let shared_secret = crypto::ephemeral_agree(ephemeral_secret, &reply.shared_secret);
    Ok(crypto::derive_session_key(&shared_secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_handshake_derives_matching_session_keys() {
        let initiator_kp = Keypair::generate();
        let responder_kp = Keypair::generate();
        let id_gen = TimeOrderedId128::new();

        let (request, initiator_secret) =
            build_initiator_handshake(&initiator_kp, "1.0.0", &id_gen);

        let (reply, responder_session_key) =
            respond_to_handshake(&responder_kp, "1.0.0", &id_gen, &request).unwrap();

        let initiator_session_key =
            complete_initiator_handshake(initiator_secret, &reply).unwrap();

        assert_eq!(initiator_session_key, responder_session_key);
    }

    #[test]
    fn unsigned_handshake_is_rejected() {
        let kp = Keypair::generate();
        let id_gen = TimeOrderedId128::new();
        let mut handshake = NetworkHandshake {
            network_magic: NETWORK_MAGIC,
            node_id: *kp.public_key(),
            nonce_id: id_gen.next(),
            node_version: "1.0.0".to_string(),
            shared_secret: [0u8; 32],
            signature: Vec::new(),
        };
        handshake.signature.clear();
        let responder_kp = Keypair::generate();
        let result = respond_to_handshake(&responder_kp, "1.0.0", &id_gen, &handshake);
        assert!(matches!(result, Err(ConnError::HandshakeRejected(_))));
    }

    #[test]
    fn wrong_network_magic_is_rejected() {
        let initiator_kp = Keypair::generate();
        let responder_kp = Keypair::generate();
        let id_gen = TimeOrderedId128::new();
        let (mut request, _secret) = build_initiator_handshake(&initiator_kp, "1.0.0", &id_gen);
        request.network_magic = NETWORK_MAGIC.wrapping_add(1);
        let result = respond_to_handshake(&responder_kp, "1.0.0", &id_gen, &request);
        assert!(matches!(result, Err(ConnError::HandshakeRejected(_))));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let initiator_kp = Keypair::generate();
        let responder_kp = Keypair::generate();
        let id_gen = TimeOrderedId128::new();
        let (mut request, _secret) = build_initiator_handshake(&initiator_kp, "1.0.0", &id_gen);
        request.node_version = "tampered".to_string();
        let result = respond_to_handshake(&responder_kp, "1.0.0", &id_gen, &request);
        assert!(matches!(result, Err(ConnError::HandshakeRejected(_))));
    }
}
