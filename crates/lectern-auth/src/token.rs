// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Token and password material.
//!
//! Tokens are 256 bits of OS randomness, URL-safe base64 encoded.  At rest
//! only the hex SHA-256 digest exists; verification compares digests with
//! [`subtle::ConstantTimeEq`] to prevent timing oracles.

use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// A freshly generated raw token.  Exists only in the issuing response.
pub struct RawToken(String);

impl RawToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn digest_hex(&self) -> String {
        digest_hex(&self.0)
    }
}

/// Hex SHA-256 of a token string.
pub fn digest_hex(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Constant-time check of a presented token against a stored digest.
pub fn verify_digest(token: &str, stored_digest_hex: &str) -> bool {
    let Ok(stored) = hex::decode(stored_digest_hex) else {
        return false;
    };
    let computed = Sha256::digest(token.as_bytes());
    computed.as_slice().ct_eq(&stored).into()
}

/// Random per-user password salt, hex encoded.
pub fn generate_salt() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hex SHA-256 of `salt || password`.
pub fn hash_password(password: &str, salt_hex: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt_hex.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time password check.
pub fn verify_password(password: &str, salt_hex: &str, stored_digest_hex: &str) -> bool {
    let computed = hash_password(password, salt_hex);
    computed.as_bytes().ct_eq(stored_digest_hex.as_bytes()).into()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_unique_and_urlsafe() {
        let a = RawToken::generate();
        let b = RawToken::generate();
        assert_ne!(a.as_str(), b.as_str());
        assert!(!a.as_str().contains('+') && !a.as_str().contains('/'));
        // 32 bytes → 43 base64url chars without padding.
        assert_eq!(a.as_str().len(), 43);
    }

    #[test]
    fn digest_verifies_the_original_token_only() {
        let t = RawToken::generate();
        let digest = t.digest_hex();
        assert!(verify_digest(t.as_str(), &digest));
        assert!(!verify_digest("some-other-token", &digest));
    }

    #[test]
    fn malformed_stored_digest_never_verifies() {
        assert!(!verify_digest("token", "not-hex!"));
    }

    #[test]
    fn password_round_trip() {
        let salt = generate_salt();
        let digest = hash_password("hunter2", &salt);
        assert!(verify_password("hunter2", &salt, &digest));
        assert!(!verify_password("hunter3", &salt, &digest));
    }

    #[test]
    fn same_password_different_salt_differs() {
        let a = hash_password("pw", &generate_salt());
        let b = hash_password("pw", &generate_salt());
        assert_ne!(a, b);
    }
}
