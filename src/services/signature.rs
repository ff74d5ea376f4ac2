use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::{distributions::Alphanumeric, Rng};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Length of the per-request nonce.
const NONCE_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signing secret is empty")]
    EmptySecret,
}

/// Produces the per-request nonce and HMAC signature the gateway uses to
/// authenticate outbound calls.
///
/// The nonce is the replay defense: a fresh one must be drawn for every
/// request and never reused.
#[derive(Clone)]
pub struct SignatureGenerator {
    secret: String,
}

impl std::fmt::Debug for SignatureGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        f.debug_struct("SignatureGenerator").finish_non_exhaustive()
    }
}

impl SignatureGenerator {
    /// Fails fast on an empty secret so an unsigned request can never be
    /// produced at runtime.
    pub fn new(secret: impl Into<String>) -> Result<Self, SignatureError> {
        let secret = secret.into();
        if secret.trim().is_empty() {
            return Err(SignatureError::EmptySecret);
        }
        Ok(Self { secret })
    }

    /// Draws a fresh cryptographically random nonce of fixed length.
    pub fn generate_nonce(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect()
    }

    /// Signature = base64(HMAC-SHA256(key = secret, msg = secret || nonce || body)).
    /// Deterministic for equal (secret, nonce, body).
    pub fn sign(&self, nonce: &str, body: &str) -> String {
        let message = format!("{}{}{}", self.secret, nonce, body);
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(message.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }
}
