//! API key check for the deployment endpoints

use axum::http::HeaderMap;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// A configured API key. Only its SHA-256 digest is kept.
#[derive(Clone)]
pub struct ApiKey {
    digest: [u8; 32],
}

impl ApiKey {
    /// `None` if the secret is empty
    pub fn new(secret: &SecretString) -> Option<Self> {
        let key = secret.expose_secret();
        if key.is_empty() {
            return None;
        }
        Some(Self {
            digest: digest(key),
        })
    }

    pub fn verify(&self, presented: &str) -> bool {
        // Digests have a fixed length, so the comparison does not leak the key length
        digest(presented)
            .iter()
            .zip(self.digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Check the key header of a request
    pub fn verify_headers(&self, headers: &HeaderMap) -> bool {
        headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|presented| self.verify(presented))
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}
