//! PKCE verifier and S256 challenge generation.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use sha2::{Digest, Sha256};

/// Bounds RFC 7636 places on the verifier length.
pub const MIN_VERIFIER_LEN: usize = 43;
pub const MAX_VERIFIER_LEN: usize = 128;

/// `length` characters drawn uniformly from `[A-Za-z0-9]` using the OS CSPRNG.
pub fn generate_verifier(length: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Unpadded URL-safe base64 of the SHA-256 digest of `verifier`.
pub fn derive_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    pub fn generate(length: usize) -> Self {
        let verifier = generate_verifier(length);
        let challenge = derive_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}
