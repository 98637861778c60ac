//! Cryptographic primitives used at the handshake and message-confidentiality
//! boundary (§3.5, §4.5, §4.6). Per the spec these are external
//! collaborators — Ed25519 signing, X25519 agreement, SHA-256, and AES-GCM
//! are "assumed available as pure functions" — so this module is a thin,
//! typed wrapper over the `ed25519-dalek` / `x25519-dalek` / `sha2` /
//! `hkdf` / `aes-gcm` crates rather than an implementation of its own.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signature as EdSignature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};

pub const ED25519_PUBKEY_SIZE: usize = 32;
pub const ED25519_SIGNATURE_SIZE: usize = 64;
pub const X25519_PUBKEY_SIZE: usize = 32;
pub const SHARED_SECRET_SIZE: usize = 32;
pub const AES_GCM_NONCE_SIZE: usize = 12;
pub const HKDF_INFO_LABEL: &[u8] = b"montana-p2p-session-key-v1";

pub type Hash = [u8; 32];

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("payload decryption failed")]
    DecryptionFailed,
    #[error("ciphertext shorter than nonce")]
    CiphertextTooShort,
}

/// Long-term Ed25519 identity keypair for a node. Stable for the node's
/// lifetime; signs handshake records (§4.5).
pub struct Keypair {
    signing_key: SigningKey,
    pub public: [u8; ED25519_PUBKEY_SIZE],
}

impl Keypair {
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let public = signing_key.verifying_key().to_bytes();
        Self {
            signing_key,
            public,
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let public = signing_key.verifying_key().to_bytes();
        Self {
            signing_key,
            public,
        }
    }

    pub fn sign(&self, message: &[u8]) -> [u8; ED25519_SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }

    pub fn public_key(&self) -> &[u8; ED25519_PUBKEY_SIZE] {
        &self.public
    }

    /// Raw signing-key bytes, for persisting the node's long-term identity
    /// to disk (`bin/node.rs`'s `load_or_generate_keypair`).
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

pub fn verify(
    pubkey: &[u8; ED25519_PUBKEY_SIZE],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let verifying_key =
        VerifyingKey::from_bytes(pubkey).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig_bytes: [u8; ED25519_SIGNATURE_SIZE] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    let signature = EdSignature::from_bytes(&sig_bytes);
    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Generates an ephemeral X25519 keypair for one handshake attempt. The
/// secret is consumed by [`ephemeral_agree`] and never persisted.
pub fn generate_ephemeral() -> (EphemeralSecret, [u8; X25519_PUBKEY_SIZE]) {
    let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let public = X25519PublicKey::from(&secret);
    (secret, public.to_bytes())
}

/// Derives the raw 32-byte shared secret from our ephemeral secret and the
/// peer's ephemeral public key (§3.5: `sharedSecret` field of the handshake
/// record carries the sender's ephemeral public key during exchange; this
/// is the X25519 output installed on [`crate::conn::Connection`] afterward).
pub fn ephemeral_agree(
    secret: EphemeralSecret,
    peer_public: &[u8; X25519_PUBKEY_SIZE],
) -> [u8; SHARED_SECRET_SIZE] {
    let peer = X25519PublicKey::from(*peer_public);
    secret.diffie_hellman(&peer).to_bytes()
}

/// Stable variant used for testing and for any path that needs to reuse a
/// static secret rather than consume an ephemeral one.
pub fn static_agree(
    secret: &StaticSecret,
    peer_public: &[u8; X25519_PUBKEY_SIZE],
) -> [u8; SHARED_SECRET_SIZE] {
    let peer = X25519PublicKey::from(*peer_public);
    secret.diffie_hellman(&peer).to_bytes()
}

/// Derives the per-connection AES-256-GCM key from the raw X25519 shared
/// secret via HKDF-SHA-256 with a fixed info label (§4.5).
pub fn derive_session_key(shared_secret: &[u8; SHARED_SECRET_SIZE]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO_LABEL, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA-256 output length");
    okm
}

/// Encrypts `plaintext` under `key`, prepending a freshly random 12-byte
/// nonce to the ciphertext (§4.6: "the 12-byte nonce is randomly chosen per
/// message and prepended to the ciphertext").
pub fn encrypt_payload(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new(key.into());
    let mut nonce_bytes = [0u8; AES_GCM_NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &[],
            },
        )
        .expect("AES-GCM encryption over a well-formed key/nonce never fails");
    let mut out = Vec::with_capacity(AES_GCM_NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

pub fn decrypt_payload(key: &[u8; 32], framed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if framed.len() < AES_GCM_NONCE_SIZE {
        return Err(CryptoError::CiphertextTooShort);
    }
    let (nonce_bytes, ciphertext) = framed.split_at(AES_GCM_NONCE_SIZE);
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: &[],
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}
