//! Signature tokens.
//!
//! A token is the standard Base64 encoding of SHA-256 over the UTF-8
//! payload. There is no key or salt: a token proves that a record and its
//! stored signing context still match each other, not that the stored
//! signer is who actually signed.
//!
//! File attachments are hashed the same way, streamed from disk.

use std::fs::File;
use std::io;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Label stored alongside every token.
pub const ALGORITHM: &str = "SHA-256";

/// Length of a Base64 SHA-256 token.
pub const TOKEN_LEN: usize = 44;

/// A computed signature token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureDigest {
    /// Base64 token.
    pub hash: String,
    /// Digest algorithm label.
    pub algorithm: &'static str,
}

/// Computes and checks signature tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureComputer;

impl SignatureComputer {
    /// Hashes a canonical payload.
    #[must_use]
    pub fn compute_signature(payload: &str) -> SignatureDigest {
        let digest = Sha256::digest(payload.as_bytes());
        SignatureDigest {
            hash: STANDARD.encode(digest),
            algorithm: ALGORITHM,
        }
    }

    /// Hashes the contents of a file without loading it into memory.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be opened or read.
    pub fn compute_file_signature(path: impl AsRef<Path>) -> io::Result<SignatureDigest> {
        let mut file = File::open(path.as_ref())?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(SignatureDigest {
            hash: STANDARD.encode(hasher.finalize()),
            algorithm: ALGORITHM,
        })
    }

    /// Returns `true` if `payload` hashes to `expected`.
    #[must_use]
    pub fn verify_digest(payload: &str, expected: &str) -> bool {
        tokens_match(&Self::compute_signature(payload).hash, expected)
    }
}

/// Constant-time token comparison.
#[must_use]
pub fn tokens_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        let digest = SignatureComputer::compute_signature("abc");
        assert_eq!(digest.hash, "ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=");
        assert_eq!(digest.hash.len(), TOKEN_LEN);
        assert_eq!(digest.algorithm, "SHA-256");
    }

    #[test]
    fn verify_detects_any_change() {
        let token = SignatureComputer::compute_signature("sig-v1|parts|1|A").hash;
        assert!(SignatureComputer::verify_digest("sig-v1|parts|1|A", &token));
        assert!(!SignatureComputer::verify_digest("sig-v1|parts|1|B", &token));
    }

    #[test]
    fn file_hash_matches_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        std::fs::write(&path, "abc").unwrap();

        let digest = SignatureComputer::compute_file_signature(&path).unwrap();
        assert_eq!(digest, SignatureComputer::compute_signature("abc"));

        let missing = SignatureComputer::compute_file_signature(dir.path().join("gone.txt"));
        assert_eq!(missing.unwrap_err().kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn tokens_of_different_length_never_match() {
        assert!(!tokens_match("abc", "abcd"));
        assert!(tokens_match("", ""));
    }
}
