//! Per-repository access keys and the HMAC signatures they authorize.

use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use sha1::Sha1;
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::db::Collection;
use crate::deployment::allocator::repository_key_id;
use crate::deployment::service::validate_repository;
use crate::error::{EngineError, EngineResult};

pub const SHA1_PREFIX: &str = "sha1=";
pub const SHA256_PREFIX: &str = "sha256=";

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// 64 random alphanumeric characters.
#[must_use]
pub fn generate_secret_key() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect()
}

fn hex_mac(mut mac: impl Mac, body: &[u8]) -> String {
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// `sha1=<hex HMAC-SHA1(secret, body)>`.
#[must_use]
pub fn sign_sha1(secret: &str, body: &[u8]) -> String {
    let digest = HmacSha1::new_from_slice(secret.as_bytes())
        .map(|mac| hex_mac(mac, body))
        .unwrap_or_default();
    format!("{SHA1_PREFIX}{digest}")
}

/// `sha256=<hex HMAC-SHA256(secret, body)>`.
#[must_use]
pub fn sign_sha256(secret: &str, body: &[u8]) -> String {
    let digest = HmacSha256::new_from_slice(secret.as_bytes())
        .map(|mac| hex_mac(mac, body))
        .unwrap_or_default();
    format!("{SHA256_PREFIX}{digest}")
}

/// Expected header value for the algorithm named by the header's prefix.
#[must_use]
pub fn expected_signature(signature_header: &str, secret: &str, body: &[u8]) -> Option<String> {
    if signature_header.starts_with(SHA256_PREFIX) {
        Some(sign_sha256(secret, body))
    } else if signature_header.starts_with(SHA1_PREFIX) {
        Some(sign_sha1(secret, body))
    } else {
        None
    }
}

/// Exact comparison of the full header, prefix included.
#[must_use]
pub fn verify_signature(signature_header: &str, secret: &str, body: &[u8]) -> bool {
    if secret.is_empty() {
        return false;
    }

    expected_signature(signature_header, secret, body).is_some_and(|expected| {
        subtle_compare(expected.as_bytes(), signature_header.trim().as_bytes())
    })
}

fn subtle_compare(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut mismatch = 0_u8;
    for (left_value, right_value) in left.iter().zip(right.iter()) {
        mismatch |= left_value ^ right_value;
    }
    mismatch == 0
}

/// Access keys by repository. Writes are serialized in-process, and creation is a
/// conditional insert so a second process sharing the database cannot overwrite a key.
#[derive(Debug)]
pub struct KeyRegistry {
    keys: Collection<String>,
    write_lock: Mutex<()>,
}

impl KeyRegistry {
    #[must_use]
    pub fn new(keys: Collection<String>) -> Self {
        Self {
            keys,
            write_lock: Mutex::new(()),
        }
    }

    /// Issues a key for `repository`. Repository existence is checked by the caller.
    ///
    /// # Errors
    /// Returns [`EngineError::Conflict`] when the repository already has a key.
    pub async fn create_key(&self, repository: &str) -> EngineResult<String> {
        validate_repository(repository)?;
        let _guard = self.write_lock.lock().await;
        self.keys.reload().await?;

        let id = repository_key_id(repository);
        let secret = generate_secret_key();
        if self.keys.has(&id).await || !self.keys.insert_new(&id, secret.clone()).await? {
            return Err(EngineError::conflict("access key", repository));
        }

        info!("created access key for {repository}");
        Ok(secret)
    }

    /// # Errors
    /// Returns [`EngineError::NotFound`] when the repository has no key.
    pub async fn get_key(&self, repository: &str) -> EngineResult<String> {
        self.keys.reload().await?;
        self.keys
            .get(&repository_key_id(repository))
            .await
            .ok_or_else(|| EngineError::not_found("access key", repository))
    }

    /// # Errors
    /// Returns [`EngineError::NotFound`] when the repository has no key.
    pub async fn delete_key(&self, repository: &str) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        self.keys.reload().await?;
        if self.keys.delete(&repository_key_id(repository)).await? {
            info!("deleted access key for {repository}");
            Ok(())
        } else {
            Err(EngineError::not_found("access key", repository))
        }
    }

    /// Checks a webhook signature against the repository's key.
    ///
    /// # Errors
    /// Returns [`EngineError::Unauthorized`] when the repository has no key or the signature
    /// does not match.
    pub async fn verify(
        &self,
        repository: &str,
        signature_header: &str,
        body: &[u8],
    ) -> EngineResult<()> {
        let secret = match self.get_key(repository).await {
            Ok(secret) => secret,
            Err(EngineError::NotFound { .. }) => {
                warn!("rejected webhook for {repository}: no access key");
                return Err(EngineError::Unauthorized(format!(
                    "no access key for {repository}"
                )));
            }
            Err(error) => return Err(error),
        };

        if verify_signature(signature_header, &secret, body) {
            return Ok(());
        }

        warn!(
            "rejected webhook for {repository}: received {signature_header:?}, expected {:?}",
            expected_signature(signature_header, &secret, body).unwrap_or_default()
        );
        Err(EngineError::Unauthorized(format!(
            "signature mismatch for {repository}"
        )))
    }
}
