//! Key-pair token signing.
//!
//! [`CredentialSigner`] turns a long-lived RSA private key into short-lived
//! RS256 assertions of the form
//!
//! ```text
//! iss = ACCOUNT.USER.SHA256:<base64 sha256 of the public key DER>
//! sub = ACCOUNT.USER
//! ```
//!
//! and caches the result until less than the refresh margin remains.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use rsa::RsaPrivateKey;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{KeySource, SignerConfig};

/// Errors raised while loading key material or signing a token.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no private key configured; set QUARRY_PRIVATE_KEY or QUARRY_PRIVATE_KEY_PATH")]
    MissingKey,

    #[error("private key is encrypted but no passphrase is configured")]
    MissingPassphrase,

    #[error("failed to read private key from {path}")]
    KeyRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse private key: {0}")]
    KeyParse(String),

    #[error("failed to sign access token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

/// A signed token and the instant it stops being accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// `true` while more than `margin` of the token's lifetime remains at `now`.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, margin: std::time::Duration) -> bool {
        self.expires_at - now > chrono::Duration::seconds(margin.as_secs() as i64)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Claims {
    pub iss: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Parsed key material plus its public-key fingerprint.
struct Credential {
    encoding_key: EncodingKey,
    fingerprint: String,
}

struct SignerState {
    token: Option<AccessToken>,
    /// sha256(key PEM bytes) → public-key fingerprint.
    fingerprints: HashMap<Vec<u8>, String>,
}

/// Issues and caches key-pair access tokens.
pub struct CredentialSigner {
    config: SignerConfig,
    state: Mutex<SignerState>,
    rotations: AtomicU64,
}

impl std::fmt::Debug for CredentialSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSigner")
            .field("account", &self.config.account)
            .field("user", &self.config.user)
            .field("rotations", &self.rotations.load(Ordering::Relaxed))
            .finish()
    }
}

impl CredentialSigner {
    pub fn new(config: SignerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SignerState {
                token: None,
                fingerprints: HashMap::new(),
            }),
            rotations: AtomicU64::new(0),
        }
    }

    /// `ACCOUNT.USER`, with any region suffix stripped from the account.
    pub fn qualified_user(&self) -> String {
        let account = self
            .config
            .account
            .split('.')
            .next()
            .unwrap_or_default()
            .to_uppercase();
        format!("{}.{}", account, self.config.user.to_uppercase())
    }

    /// Number of tokens signed since construction.
    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    /// Return a token valid for at least the refresh margin.
    pub async fn get_token(&self) -> Result<AccessToken, CredentialError> {
        self.token_at(Utc::now()).await
    }

    /// [`Self::get_token`] with an explicit clock.
    pub async fn token_at(&self, now: DateTime<Utc>) -> Result<AccessToken, CredentialError> {
        let mut state = self.state.lock().await;

        if let Some(token) = &state.token {
            if token.is_fresh_at(now, self.config.refresh_margin) {
                return Ok(token.clone());
            }
            debug!(expires_at = %token.expires_at, "access token inside refresh margin; rotating");
        }

        let credential = self.load_credential(&mut state.fingerprints).await?;
        let subject = self.qualified_user();
        let ttl = chrono::Duration::seconds(self.config.token_ttl.as_secs() as i64);
        let expires_at = now + ttl;

        let claims = Claims {
            iss: format!("{subject}.SHA256:{}", credential.fingerprint),
            sub: subject,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::RS256), &claims, &credential.encoding_key)?;

        let token = AccessToken { token, expires_at };
        state.token = Some(token.clone());
        self.rotations.fetch_add(1, Ordering::Relaxed);
        info!(sub = %claims.sub, %expires_at, "signed new access token");
        Ok(token)
    }

    async fn load_credential(
        &self,
        fingerprints: &mut HashMap<Vec<u8>, String>,
    ) -> Result<Credential, CredentialError> {
        let pem = match &self.config.private_key {
            None => return Err(CredentialError::MissingKey),
            Some(KeySource::Inline(pem)) => pem.replace("\\n", "\n"),
            Some(KeySource::File(path)) => tokio::fs::read_to_string(path).await.map_err(|source| {
                CredentialError::KeyRead {
                    path: path.display().to_string(),
                    source,
                }
            })?,
        };
        if pem.trim().is_empty() {
            return Err(CredentialError::MissingKey);
        }

        let private = parse_private_key(&pem, self.config.passphrase.as_deref())?;

        let key_digest = Sha256::digest(pem.as_bytes()).to_vec();
        let fingerprint = match fingerprints.get(&key_digest) {
            Some(fp) => fp.clone(),
            None => {
                let fp = public_key_fingerprint(&private)?;
                fingerprints.insert(key_digest, fp.clone());
                fp
            }
        };

        let der = private
            .to_pkcs1_der()
            .map_err(|e| CredentialError::KeyParse(e.to_string()))?;
        Ok(Credential {
            encoding_key: EncodingKey::from_rsa_der(der.as_bytes()),
            fingerprint,
        })
    }
}

/// Parse PKCS#8 (plain or encrypted) or PKCS#1 PEM.
fn parse_private_key(pem: &str, passphrase: Option<&str>) -> Result<RsaPrivateKey, CredentialError> {
    let pem = pem.trim();
    let parsed = if pem.contains("BEGIN ENCRYPTED PRIVATE KEY") {
        let passphrase = passphrase.ok_or(CredentialError::MissingPassphrase)?;
        RsaPrivateKey::from_pkcs8_encrypted_pem(pem, passphrase.as_bytes())
            .map_err(|e| e.to_string())
    } else if pem.contains("BEGIN RSA PRIVATE KEY") {
        RsaPrivateKey::from_pkcs1_pem(pem).map_err(|e| e.to_string())
    } else {
        RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| e.to_string())
    };
    parsed.map_err(CredentialError::KeyParse)
}

/// base64(sha256(DER SubjectPublicKeyInfo)).
fn public_key_fingerprint(private: &RsaPrivateKey) -> Result<String, CredentialError> {
    let der = private
        .to_public_key()
        .to_public_key_der()
        .map_err(|e| CredentialError::KeyParse(e.to_string()))?;
    Ok(BASE64.encode(Sha256::digest(der.as_bytes())))
}

// ── Tests ──────────────────────────────────────────────────────────────────────
