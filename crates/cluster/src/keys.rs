//! Peer identity and record signing.
//!
//! Peers are identified by their serialized public key; record signatures
//! are ECDSA over SHA-256 digests.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use secp256k1::{ecdsa, Message, PublicKey, SecretKey, SECP256K1};
use tessera_model::{
    hash::{hash_bytes, random_bytes},
    PeerId,
};

/// A peer's signing identity.
#[derive(Clone, Debug)]
pub struct Keypair {
    secret: SecretKey,
    public: PublicKey,
}

impl Keypair {
    /// A fresh random keypair.
    pub fn generate() -> Self {
        let secret = loop {
            // All-zero or >= curve order bytes are rejected; retry.
            if let Ok(secret) = SecretKey::from_slice(&random_bytes(32)) {
                break secret;
            }
        };
        let public = PublicKey::from_secret_key(SECP256K1, &secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, secp256k1::Error> {
        let secret = SecretKey::from_slice(bytes)?;
        let public = PublicKey::from_secret_key(SECP256K1, &secret);
        Ok(Self { secret, public })
    }

    /// The peer id: base64url of the compressed public key.
    pub fn peer_id(&self) -> PeerId {
        PeerId::new(self.public_key_base64url())
    }

    pub fn public_key_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.public.serialize())
    }

    /// Sign `bytes` (after hashing), returning the compact signature in
    /// base64url.
    pub fn sign(&self, bytes: &[u8]) -> String {
        let digest = hash_bytes(bytes);
        let message = Message::from_digest(
            digest
                .as_slice()
                .try_into()
                .expect("sha256 digest is 32 bytes"),
        );
        let signature = SECP256K1.sign_ecdsa(&message, &self.secret);
        URL_SAFE_NO_PAD.encode(signature.serialize_compact())
    }
}

/// Verify a base64url compact signature over `bytes` under a base64url
/// compressed public key.
pub fn verify_signature(public_key: &str, bytes: &[u8], signature: &str) -> bool {
    let Ok(key_bytes) = URL_SAFE_NO_PAD.decode(public_key) else {
        return false;
    };
    let Ok(public) = PublicKey::from_slice(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = URL_SAFE_NO_PAD.decode(signature) else {
        return false;
    };
    let Ok(signature) = ecdsa::Signature::from_compact(&sig_bytes) else {
        return false;
    };
    let digest = hash_bytes(bytes);
    let message = Message::from_digest(
        digest
            .as_slice()
            .try_into()
            .expect("sha256 digest is 32 bytes"),
    );
    SECP256K1.verify_ecdsa(&message, &signature, &public).is_ok()
}
