//! Canonical encoding, hashing, and ECDSA P-256 signing/verification.
//!
//! Signatures are deterministic (RFC 6979) so identical canonical encodings
//! always produce bit-identical signatures; this keeps tests stable and
//! simplifies ledger auditing.

use ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors raised by canonicalization, signing, or verification.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("value is not a JSON object")]
    NotAnObject,
    #[error("invalid PEM-encoded P-256 private key: {0}")]
    InvalidPrivateKey(String),
    #[error("invalid PEM-encoded P-256 public key: {0}")]
    InvalidPublicKey(String),
    #[error("invalid hex signature: {0}")]
    InvalidSignatureEncoding(String),
    #[error("merkle root must be exactly 32 bytes, got {0}")]
    InvalidRootLength(usize),
}

/// Canonicalize a JSON value into the exact byte sequence that is hashed and
/// signed: object keys sorted lexicographically, no whitespace, `,`/`:`
/// separators. Mirrors `json.dumps(value, sort_keys=True, separators=(',', ':'))`.
pub fn canonicalize(value: &serde_json::Value) -> Result<Vec<u8>, CryptoError> {
    let sorted = sort_keys(value);
    serde_json::to_vec(&sorted).map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))
}

fn sort_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for k in keys {
                sorted.insert(k.clone(), sort_keys(&map[k]));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sort_keys).collect())
        }
        other => other.clone(),
    }
}

/// SHA-256 of the canonical JSON encoding of `value`.
pub fn canonical_hash(value: &serde_json::Value) -> Result<[u8; 32], CryptoError> {
    let bytes = canonicalize(value)?;
    Ok(Sha256::digest(bytes).into())
}

/// Sign the canonical encoding of `value` with a PEM-encoded P-256 private key.
/// Returns a hex-encoded signature.
pub fn sign_value(value: &serde_json::Value, private_key_pem: &str) -> Result<String, CryptoError> {
    let signing_key = SigningKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
    let hash = canonical_hash(value)?;
    let signature: Signature = signing_key.sign(&hash);
    Ok(hex::encode(signature.to_der().as_bytes()))
}

/// Verify a hex-encoded signature over the canonical encoding of `value`.
/// Fail-closed: any malformed input (bad key, bad hex, wrong curve) returns
/// `false` rather than propagating an error.
pub fn verify_value(value: &serde_json::Value, signature_hex: &str, public_key_pem: &str) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_public_key_pem(public_key_pem) else {
        return false;
    };
    let Ok(hash) = canonical_hash(value) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::from_der(&sig_bytes) else {
        return false;
    };
    verifying_key.verify(&hash, &signature).is_ok()
}

/// Sign a raw 32-byte Merkle root directly (no canonicalization, no extra hash).
pub fn sign_merkle_root(root: &[u8; 32], private_key_pem: &str) -> Result<String, CryptoError> {
    let signing_key = SigningKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
    let signature: Signature = signing_key.sign(root);
    Ok(hex::encode(signature.to_der().as_bytes()))
}

/// Verify a signature over a raw 32-byte Merkle root. Fail-closed like [`verify_value`].
pub fn verify_merkle_root(root: &[u8; 32], signature_hex: &str, public_key_pem: &str) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_public_key_pem(public_key_pem) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::from_der(&sig_bytes) else {
        return false;
    };
    verifying_key.verify(root, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::pkcs8::EncodePrivateKey;

    fn test_keypair() -> (String, String) {
        let signing_key = SigningKey::random(&mut rand_core_compat());
        let private_pem = signing_key
            .to_pkcs8_pem(Default::default())
            .unwrap()
            .to_string();
        let public_pem = VerifyingKey::from(&signing_key)
            .to_public_key_pem(Default::default())
            .unwrap();
        (private_pem, public_pem)
    }

    // p256's `SigningKey::random` wants an `rand_core` RNG; pull in the
    // version p256 re-exports so tests don't need a direct `rand` dependency.
    fn rand_core_compat() -> impl rand_core::CryptoRngCore {
        rand_core::OsRng
    }

    #[test]
    fn canonicalize_sorts_keys_and_strips_whitespace() {
        let value = serde_json::json!({"b": 1, "a": 2});
        let bytes = canonicalize(&value).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn sign_then_verify_roundtrip() {
        let (priv_pem, pub_pem) = test_keypair();
        let value = serde_json::json!({"mandate_id": "abc", "action_scope": ["read"]});
        let sig = sign_value(&value, &priv_pem).unwrap();
        assert!(verify_value(&value, &sig, &pub_pem));
    }

    #[test]
    fn verify_fails_when_signed_field_mutated() {
        let (priv_pem, pub_pem) = test_keypair();
        let value = serde_json::json!({"mandate_id": "abc"});
        let sig = sign_value(&value, &priv_pem).unwrap();
        let mutated = serde_json::json!({"mandate_id": "abd"});
        assert!(!verify_value(&mutated, &sig, &pub_pem));
    }

    #[test]
    fn verify_fails_closed_on_garbage_signature() {
        let (_priv_pem, pub_pem) = test_keypair();
        let value = serde_json::json!({"mandate_id": "abc"});
        assert!(!verify_value(&value, "not-hex!", &pub_pem));
    }

    #[test]
    fn verify_fails_closed_on_garbage_public_key() {
        let value = serde_json::json!({"mandate_id": "abc"});
        assert!(!verify_value(&value, "00", "not a pem key"));
    }

    #[test]
    fn signing_is_deterministic() {
        let (priv_pem, _pub_pem) = test_keypair();
        let value = serde_json::json!({"mandate_id": "abc"});
        let sig1 = sign_value(&value, &priv_pem).unwrap();
        let sig2 = sign_value(&value, &priv_pem).unwrap();
        assert_eq!(sig1, sig2, "RFC 6979 signing must be deterministic");
    }

    #[test]
    fn merkle_root_sign_verify_roundtrip() {
        let (priv_pem, pub_pem) = test_keypair();
        let root = Sha256::digest(b"leaf-data").into();
        let sig = sign_merkle_root(&root, &priv_pem).unwrap();
        assert!(verify_merkle_root(&root, &sig, &pub_pem));

        let mut tampered = root;
        tampered[0] ^= 0xFF;
        assert!(!verify_merkle_root(&tampered, &sig, &pub_pem));
    }
}
