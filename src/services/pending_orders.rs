use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::cache::{CacheBackend, CacheError};
use crate::services::gateway::RedirectUrls;

/// AES-GCM nonce size in bytes; prepended to the ciphertext.
const GCM_NONCE_LEN: usize = 12;

const KEY_PREFIX: &str = "pending_order";

/// Order context parked between the request-payment call and the payer's
/// return from the gateway. Everything the confirm step needs that is not
/// yet durable lives here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingOrder {
    pub order_id: String,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub transaction_id: String,
    pub redirect_urls: RedirectUrls,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingOrder {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

#[derive(Debug, Error)]
pub enum PendingOrderError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Encryption failed")]
    Encryption,
}

/// Encrypted custody of pending orders keyed by opaque session key.
///
/// Values are AES-256-GCM sealed before they reach the backend, so a
/// shared or external cache never holds order context in the clear. The
/// cipher key is derived from the configured session encryption key.
pub struct PendingOrderStore {
    cache: Arc<dyn CacheBackend>,
    cipher: Aes256Gcm,
    ttl: Duration,
}

impl PendingOrderStore {
    pub fn new(cache: Arc<dyn CacheBackend>, encryption_key: &str, ttl: Duration) -> Self {
        let digest = Sha256::digest(encryption_key.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());
        Self {
            cache,
            cipher: Aes256Gcm::new(key),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn cache_key(session_key: &str) -> String {
        format!("{}:{}", KEY_PREFIX, session_key)
    }

    fn seal(&self, order: &PendingOrder) -> Result<String, PendingOrderError> {
        let plaintext = serde_json::to_vec(order)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| PendingOrderError::Encryption)?;

        let mut blob = Vec::with_capacity(GCM_NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    fn open(&self, sealed: &str) -> Option<PendingOrder> {
        let blob = BASE64.decode(sealed).ok()?;
        if blob.len() <= GCM_NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = blob.split_at(GCM_NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .ok()?;
        serde_json::from_slice(&plaintext).ok()
    }

    /// Stamps expiry from the configured TTL, seals and stores the order.
    #[instrument(skip(self, order), fields(order_id = %order.order_id))]
    pub async fn put(
        &self,
        session_key: &str,
        mut order: PendingOrder,
    ) -> Result<PendingOrder, PendingOrderError> {
        order.expires_at = order.created_at
            + ChronoDuration::seconds(self.ttl.as_secs().min(i64::MAX as u64) as i64);

        let sealed = self.seal(&order)?;
        self.cache
            .set(&Self::cache_key(session_key), &sealed, Some(self.ttl))
            .await?;

        debug!("pending order stored");
        Ok(order)
    }

    /// One-shot retrieval: the entry is deleted whether or not it opens,
    /// so a session key cannot be replayed through the confirm flow.
    /// Tampered, undecodable or expired entries read as absent.
    #[instrument(skip(self))]
    pub async fn take(&self, session_key: &str) -> Result<Option<PendingOrder>, PendingOrderError> {
        let key = Self::cache_key(session_key);
        let Some(sealed) = self.cache.get(&key).await? else {
            return Ok(None);
        };
        self.cache.delete(&key).await?;

        let Some(order) = self.open(&sealed) else {
            warn!("pending order entry failed authentication; discarding");
            return Ok(None);
        };

        if order.is_expired() {
            debug!(order_id = %order.order_id, "pending order expired");
            return Ok(None);
        }

        Ok(Some(order))
    }
}
