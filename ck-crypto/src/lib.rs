//! Ed25519 signing and BLAKE3 hashing: the primitives every receipt in the
//! clearing kernel is sealed with.
//!
//! Every function here is total over malformed hex input — verification in
//! particular must never panic, since it sits on the hot path of receipt
//! ingestion from untrusted callers.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid hex encoding")]
    InvalidHex,
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("invalid signature length: expected {expected} bytes, got {actual}")]
    InvalidSignatureLength { expected: usize, actual: usize },
    #[error("malformed private key")]
    MalformedPrivateKey,
    #[error("malformed public key")]
    MalformedPublicKey,
}

/// Generate a fresh Ed25519 keypair. Returns `(private_hex, public_hex)`.
pub fn generate_keypair() -> (String, String) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let private_hex = hex::encode(signing_key.to_bytes());
    let public_hex = hex::encode(signing_key.verifying_key().to_bytes());
    (private_hex, public_hex)
}

/// BLAKE3 hash of arbitrary bytes, returned as lowercase hex.
pub fn hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Sign a 32-byte hash (given as hex) with an Ed25519 private key (hex).
/// Signs the raw hash bytes, not the hex string.
pub fn sign(message_hash_hex: &str, private_hex: &str) -> Result<String, CryptoError> {
    let hash_bytes = decode_hash(message_hash_hex)?;
    let signing_key = decode_private_key(private_hex)?;
    let signature = signing_key.sign(&hash_bytes);
    Ok(hex::encode(signature.to_bytes()))
}

/// Verify a signature over a 32-byte hash (hex) under a public key (hex).
/// Total: any malformed input yields `false`, never a panic.
pub fn verify(message_hash_hex: &str, signature_hex: &str, public_hex: &str) -> bool {
    let (hash_bytes, signature, verifying_key) = match (
        decode_hash(message_hash_hex),
        decode_signature(signature_hex),
        decode_public_key(public_hex),
    ) {
        (Ok(h), Ok(s), Ok(k)) => (h, s, k),
        _ => return false,
    };
    verifying_key.verify(&hash_bytes, &signature).is_ok()
}

fn decode_hash(hex_str: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = hex::decode(hex_str).map_err(|_| CryptoError::InvalidHex)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: len,
        })
}

fn decode_private_key(private_hex: &str) -> Result<SigningKey, CryptoError> {
    let bytes = decode_hash(private_hex)?;
    Ok(SigningKey::from_bytes(&bytes))
}

fn decode_public_key(public_hex: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = decode_hash(public_hex)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::MalformedPublicKey)
}

fn decode_signature(signature_hex: &str) -> Result<Signature, CryptoError> {
    let bytes = hex::decode(signature_hex).map_err(|_| CryptoError::InvalidHex)?;
    let len = bytes.len();
    let array: [u8; 64] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidSignatureLength {
            expected: 64,
            actual: len,
        })?;
    Ok(Signature::from_bytes(&array))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let (private_hex, public_hex) = generate_keypair();
        let digest = hash(b"settle 100 between agent-a and agent-b");
        let signature = sign(&digest, &private_hex).expect("sign should succeed");
        assert!(verify(&digest, &signature, &public_hex));
    }

    #[test]
    fn verify_rejects_tampered_hash() {
        let (private_hex, public_hex) = generate_keypair();
        let digest = hash(b"original payload");
        let signature = sign(&digest, &private_hex).expect("sign should succeed");
        let other_digest = hash(b"tampered payload");
        assert!(!verify(&other_digest, &signature, &public_hex));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let (private_hex, _public_hex) = generate_keypair();
        let (_other_private, other_public) = generate_keypair();
        let digest = hash(b"payload");
        let signature = sign(&digest, &private_hex).expect("sign should succeed");
        assert!(!verify(&digest, &signature, &other_public));
    }

    #[test]
    fn verify_never_panics_on_garbage_input() {
        assert!(!verify("not-hex", "also-not-hex", "nope"));
        assert!(!verify("", "", ""));
        assert!(!verify(&"ab".repeat(32), &"cd".repeat(64), &"ef".repeat(16)));
    }

    #[test]
    fn sign_rejects_malformed_hash() {
        let (private_hex, _) = generate_keypair();
        assert!(sign("zz", &private_hex).is_err());
        assert!(sign(&"ab".repeat(31), &private_hex).is_err());
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash(b"same input"), hash(b"same input"));
        assert_ne!(hash(b"same input"), hash(b"different input"));
    }

    proptest::proptest! {
        #[test]
        fn verify_is_total_over_arbitrary_strings(
            a in ".{0,80}", b in ".{0,80}", c in ".{0,80}"
        ) {
            let _ = verify(&a, &b, &c);
        }
    }
}
