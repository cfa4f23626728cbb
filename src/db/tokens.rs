//! OAuth token persistence with optional encryption at rest.
//!
//! Tokens are stored per `(provider, channel)`. The [`TokenStore`] trait keeps
//! the storage pluggable; [`EncryptingTokenStore`] wraps any store and
//! transparently encrypts the secret fields with AES-256-GCM, tagging each
//! record with an `encryption_version` byte (0 = plaintext, 1 = AES-256-GCM)
//! so plaintext records written before a key was configured still read back.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sqlx::FromRow;
use std::sync::Arc;

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::Database;

/// Record version for plaintext secret fields
pub const ENCRYPTION_NONE: i64 = 0;
/// Record version for AES-256-GCM encrypted secret fields
pub const ENCRYPTION_AES_GCM: i64 = 1;

/// AES-GCM nonce length in bytes
const NONCE_LEN: usize = 12;

/// One stored credential for an upstream or destination platform
#[derive(Debug, Clone, FromRow)]
pub struct TokenRecord {
    /// Platform identifier (e.g., "upstream", "destination")
    pub provider: String,
    /// Channel scoping key
    pub channel: String,
    /// OAuth access token
    pub access_token: String,
    /// OAuth refresh token
    pub refresh_token: String,
    /// Unix timestamp when the access token expires
    pub expires_at: i64,
    /// Raw token response for fields the typed columns don't cover
    pub raw: String,
    /// Granted scopes
    pub scope: String,
    /// Secret-field encoding: 0 = plaintext, 1 = AES-256-GCM
    pub encryption_version: i64,
    /// Unix timestamp of the last write
    pub updated_at: i64,
}

/// Pluggable credential storage
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Insert or replace the credential for `(provider, channel)`
    async fn upsert(&self, record: &TokenRecord) -> Result<()>;

    /// Fetch the credential for `(provider, channel)`
    async fn get(&self, provider: &str, channel: &str) -> Result<Option<TokenRecord>>;

    /// Whether any credential exists for the channel (readiness probe)
    async fn any_present(&self, channel: &str) -> Result<bool>;
}

impl Database {
    /// Insert or replace an OAuth token row
    pub async fn token_upsert(&self, record: &TokenRecord) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO oauth_tokens (
                provider, channel, access_token, refresh_token, expires_at,
                raw, scope, encryption_version, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(provider, channel) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                raw = excluded.raw,
                scope = excluded.scope,
                encryption_version = excluded.encryption_version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.provider)
        .bind(&record.channel)
        .bind(&record.access_token)
        .bind(&record.refresh_token)
        .bind(record.expires_at)
        .bind(&record.raw)
        .bind(&record.scope)
        .bind(record.encryption_version)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to upsert token: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Fetch an OAuth token row
    pub async fn token_get(&self, provider: &str, channel: &str) -> Result<Option<TokenRecord>> {
        let row = sqlx::query_as::<_, TokenRecord>(
            r#"
            SELECT provider, channel, access_token, refresh_token, expires_at,
                   raw, scope, encryption_version, updated_at
            FROM oauth_tokens
            WHERE provider = ? AND channel = ?
            "#,
        )
        .bind(provider)
        .bind(channel)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get token: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Whether any token row exists for the channel
    pub async fn token_any(&self, channel: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM oauth_tokens WHERE channel = ?")
            .bind(channel)
            .fetch_one(self.pool())
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count tokens: {}",
                    e
                )))
            })?;

        Ok(count > 0)
    }
}

/// Plaintext token store backed by the SQLite database
pub struct SqliteTokenStore {
    db: Arc<Database>,
}

impl SqliteTokenStore {
    /// Create a store over the shared database handle
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn upsert(&self, record: &TokenRecord) -> Result<()> {
        self.db.token_upsert(record).await
    }

    async fn get(&self, provider: &str, channel: &str) -> Result<Option<TokenRecord>> {
        self.db.token_get(provider, channel).await
    }

    async fn any_present(&self, channel: &str) -> Result<bool> {
        self.db.token_any(channel).await
    }
}

/// Token store wrapper that encrypts secret fields at rest.
///
/// Each secret field is sealed independently with AES-256-GCM under a fresh
/// 12-byte random nonce and stored as `base64(nonce || ciphertext)`; the
/// 16-byte authentication tag rides at the end of the ciphertext. Reads of
/// version-0 records pass through untouched.
pub struct EncryptingTokenStore {
    inner: Arc<dyn TokenStore>,
    cipher: Aes256Gcm,
}

impl EncryptingTokenStore {
    /// Wrap `inner` with a 32-byte AES-256 key
    pub fn new(inner: Arc<dyn TokenStore>, key: [u8; 32]) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Self { inner, cipher }
    }

    /// Wrap `inner` with a base64-encoded key, validating its length
    pub fn from_base64_key(inner: Arc<dyn TokenStore>, encoded: &str) -> Result<Self> {
        let decoded = BASE64.decode(encoded).map_err(|e| Error::Config {
            message: format!("encryption key is not valid base64: {e}"),
            key: Some("ENCRYPTION_KEY".into()),
        })?;
        let key: [u8; 32] = decoded.try_into().map_err(|v: Vec<u8>| Error::Config {
            message: format!("encryption key must be 32 bytes, got {}", v.len()),
            key: Some("ENCRYPTION_KEY".into()),
        })?;
        Ok(Self::new(inner, key))
    }

    fn seal(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| Error::Crypto(format!("token encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    fn open(&self, sealed: &str) -> Result<String> {
        if sealed.is_empty() {
            return Ok(String::new());
        }

        let raw = BASE64
            .decode(sealed)
            .map_err(|e| Error::Crypto(format!("sealed token is not valid base64: {e}")))?;
        if raw.len() <= NONCE_LEN {
            return Err(Error::Crypto("sealed token too short".into()));
        }

        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| Error::Crypto(format!("token decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| Error::Crypto(format!("decrypted token is not UTF-8: {e}")))
    }
}

#[async_trait]
impl TokenStore for EncryptingTokenStore {
    async fn upsert(&self, record: &TokenRecord) -> Result<()> {
        let sealed = TokenRecord {
            provider: record.provider.clone(),
            channel: record.channel.clone(),
            access_token: self.seal(&record.access_token)?,
            refresh_token: self.seal(&record.refresh_token)?,
            expires_at: record.expires_at,
            raw: self.seal(&record.raw)?,
            scope: record.scope.clone(),
            encryption_version: ENCRYPTION_AES_GCM,
            updated_at: record.updated_at,
        };
        self.inner.upsert(&sealed).await
    }

    async fn get(&self, provider: &str, channel: &str) -> Result<Option<TokenRecord>> {
        let Some(record) = self.inner.get(provider, channel).await? else {
            return Ok(None);
        };

        match record.encryption_version {
            ENCRYPTION_NONE => Ok(Some(record)),
            ENCRYPTION_AES_GCM => Ok(Some(TokenRecord {
                access_token: self.open(&record.access_token)?,
                refresh_token: self.open(&record.refresh_token)?,
                raw: self.open(&record.raw)?,
                encryption_version: ENCRYPTION_NONE,
                ..record
            })),
            other => Err(Error::Crypto(format!(
                "unknown token encryption version {other}"
            ))),
        }
    }

    async fn any_present(&self, channel: &str) -> Result<bool> {
        self.inner.any_present(channel).await
    }
}
