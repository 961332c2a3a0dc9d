// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ed25519 signing over entry hashes, and PEM key handling.
//!
//! Signatures cover the raw bytes of the hex-decoded `entry_hash`, not
//! the entry text: the hash already pins the canonical form. Keys are
//! opaque to the engine; absence of a key simply means unsigned entries.

use std::path::{Path, PathBuf};

use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::spki::{DecodePublicKey, EncodePublicKey};
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::LedgerError;

/// Generate a fresh Ed25519 signing key.
#[must_use]
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Write a keypair as PEM: PKCS#8 private key and SPKI public key.
///
/// Returns the two paths written (`<stem>.pem`, `<stem>.pub.pem`).
///
/// # Errors
///
/// [`LedgerError::Io`] on write failure, [`LedgerError::Signing`] if the
/// key cannot be PEM-encoded.
pub fn write_keypair_pem(
    key: &SigningKey,
    dir: &Path,
    stem: &str,
) -> Result<(PathBuf, PathBuf), LedgerError> {
    let private_pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| LedgerError::Signing {
            reason: format!("encode private key: {e}"),
        })?;
    let public_pem = key
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| LedgerError::Signing {
            reason: format!("encode public key: {e}"),
        })?;

    std::fs::create_dir_all(dir)?;
    let private_path = dir.join(format!("{stem}.pem"));
    let public_path = dir.join(format!("{stem}.pub.pem"));
    std::fs::write(&private_path, private_pem.as_bytes())?;
    std::fs::write(&public_path, public_pem.as_bytes())?;
    Ok((private_path, public_path))
}

/// Load a PKCS#8 PEM private key.
///
/// # Errors
///
/// [`LedgerError::Io`] if the file is unreadable, [`LedgerError::Signing`]
/// if it is not a valid Ed25519 PKCS#8 PEM.
pub fn load_signing_key(path: &Path) -> Result<SigningKey, LedgerError> {
    let pem = std::fs::read_to_string(path)?;
    SigningKey::from_pkcs8_pem(&pem).map_err(|e| LedgerError::Signing {
        reason: format!("decode private key {}: {e}", path.display()),
    })
}

/// Load an SPKI PEM public key.
///
/// # Errors
///
/// [`LedgerError::Io`] if the file is unreadable, [`LedgerError::Signing`]
/// if it is not a valid Ed25519 SPKI PEM.
pub fn load_verifying_key(path: &Path) -> Result<VerifyingKey, LedgerError> {
    let pem = std::fs::read_to_string(path)?;
    VerifyingKey::from_public_key_pem(&pem).map_err(|e| LedgerError::Signing {
        reason: format!("decode public key {}: {e}", path.display()),
    })
}

/// Sign a hex entry hash; returns the signature as lowercase hex.
///
/// # Errors
///
/// [`LedgerError::Signing`] if the hash is not valid hex.
pub fn sign_entry_hash(key: &SigningKey, entry_hash: &str) -> Result<String, LedgerError> {
    let digest = hex::decode(entry_hash).map_err(|e| LedgerError::Signing {
        reason: format!("entry hash is not hex: {e}"),
    })?;
    let signature = key.sign(&digest);
    Ok(hex::encode(signature.to_bytes()))
}

/// Verify a hex signature over a hex entry hash.
///
/// Returns `false` for malformed hex or signature bytes rather than
/// erroring; a malformed signature is simply an invalid one.
#[must_use]
pub fn verify_entry_hash(key: &VerifyingKey, entry_hash: &str, signature_hex: &str) -> bool {
    let Ok(digest) = hex::decode(entry_hash) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(sig_array) = <[u8; 64]>::try_from(sig_bytes) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_array);
    key.verify(&digest, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let key = generate_signing_key();
        let hash = "ab".repeat(32);
        let sig = sign_entry_hash(&key, &hash).unwrap();
        assert!(verify_entry_hash(&key.verifying_key(), &hash, &sig));
    }

    #[test]
    fn wrong_key_rejects() {
        let key = generate_signing_key();
        let other = generate_signing_key();
        let hash = "cd".repeat(32);
        let sig = sign_entry_hash(&key, &hash).unwrap();
        assert!(!verify_entry_hash(&other.verifying_key(), &hash, &sig));
    }

    #[test]
    fn malformed_signature_rejects() {
        let key = generate_signing_key();
        let hash = "ef".repeat(32);
        assert!(!verify_entry_hash(&key.verifying_key(), &hash, "zz"));
        assert!(!verify_entry_hash(&key.verifying_key(), &hash, "abcd"));
    }

    #[test]
    fn pem_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_signing_key();
        let (private_path, public_path) =
            write_keypair_pem(&key, dir.path(), "toolgate-signing").unwrap();

        let loaded = load_signing_key(&private_path).unwrap();
        assert_eq!(loaded.to_bytes(), key.to_bytes());

        let public = load_verifying_key(&public_path).unwrap();
        let sig = sign_entry_hash(&loaded, &"12".repeat(32)).unwrap();
        assert!(verify_entry_hash(&public, &"12".repeat(32), &sig));
    }
}
