//! Handshake authentication.
//!
//! One strategy is configured per processor and applied to every handshake.
//! App secrets are compared as SHA-256 hashes so plaintext secrets never need
//! to be stored in configuration.

use crate::config::AuthConfig;
use crate::error::ServerError;
use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use sfn_client::credential::{signing_message, PUBLIC_KEY_PAYLOAD_LEN};
use sfn_protocol::{AuthType, HandshakeFrame};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Result of checking a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted,
    Rejected(String),
}

impl AuthOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AuthOutcome::Accepted)
    }

    fn reject(reason: impl Into<String>) -> Self {
        AuthOutcome::Rejected(reason.into())
    }
}

/// Configured authentication strategy.
#[derive(Debug, Clone)]
pub enum Authentication {
    /// Accept every handshake.
    None,
    /// Shared app secret, stored as SHA-256 hex hashes.
    AppKey {
        app_id: String,
        secret_hashes: HashSet<String>,
    },
    /// Peer proves possession of one of the trusted Ed25519 keys.
    ///
    /// The payload is the key followed by a signature over
    /// `name || 0x00 || app_id`. Nothing in it is chosen by the server, so a
    /// captured payload authenticates the same name and app id again on any
    /// later connection. It is only as confidential as the TLS session that
    /// carries it; it does not bind the peer to one connection.
    PublicKey { trusted: Vec<VerifyingKey> },
    /// Peer presents the public half of the key held by this processor.
    PrivateKey { key: SigningKey },
}

impl Authentication {
    /// Builds the strategy named by `config.mode`.
    pub fn from_config(config: &AuthConfig) -> Result<Self, ServerError> {
        match config.mode {
            AuthType::None => Ok(Authentication::None),
            AuthType::AppKey => Ok(Authentication::AppKey {
                app_id: config.app_id.clone(),
                secret_hashes: config
                    .app_secret_hashes
                    .iter()
                    .map(|h| h.trim().to_ascii_lowercase())
                    .collect(),
            }),
            AuthType::PublicKey => {
                let trusted = config
                    .trusted_public_keys
                    .iter()
                    .map(|k| parse_verifying_key(k))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Authentication::PublicKey { trusted })
            }
            AuthType::PrivateKey => {
                let seed = config.private_key.as_deref().ok_or_else(|| {
                    ServerError::AuthFailed("private_key auth without a key".to_string())
                })?;
                Ok(Authentication::PrivateKey {
                    key: SigningKey::from_bytes(&decode_key_bytes(seed)?),
                })
            }
        }
    }

    pub fn auth_type(&self) -> AuthType {
        match self {
            Authentication::None => AuthType::None,
            Authentication::AppKey { .. } => AuthType::AppKey,
            Authentication::PublicKey { .. } => AuthType::PublicKey,
            Authentication::PrivateKey { .. } => AuthType::PrivateKey,
        }
    }

    /// Checks a handshake against this strategy.
    pub fn authenticate(&self, handshake: &HandshakeFrame) -> AuthOutcome {
        if let Authentication::None = self {
            return AuthOutcome::Accepted;
        }

        if handshake.auth_type != self.auth_type() {
            return AuthOutcome::reject(format!(
                "expected {} credentials, got {}",
                self.auth_type(),
                handshake.auth_type
            ));
        }

        match self {
            Authentication::None => AuthOutcome::Accepted,
            Authentication::AppKey {
                app_id,
                secret_hashes,
            } => {
                if handshake.app_id != *app_id {
                    return AuthOutcome::reject(format!("unknown app id '{}'", handshake.app_id));
                }
                if secret_hashes.contains(&hash_secret(&handshake.auth_payload)) {
                    AuthOutcome::Accepted
                } else {
                    AuthOutcome::reject("invalid app secret")
                }
            }
            Authentication::PublicKey { trusted } => verify_signature(trusted, handshake),
            Authentication::PrivateKey { key } => {
                if handshake.auth_payload.as_ref() == key.verifying_key().as_bytes() {
                    AuthOutcome::Accepted
                } else {
                    AuthOutcome::reject("key does not match")
                }
            }
        }
    }
}

fn verify_signature(trusted: &[VerifyingKey], handshake: &HandshakeFrame) -> AuthOutcome {
    let payload = handshake.auth_payload.as_ref();
    if payload.len() != PUBLIC_KEY_PAYLOAD_LEN {
        return AuthOutcome::reject(format!(
            "public key payload must be {} bytes, got {}",
            PUBLIC_KEY_PAYLOAD_LEN,
            payload.len()
        ));
    }

    let (key_bytes, sig_bytes) = payload.split_at(32);
    let Some(key) = trusted.iter().find(|k| k.as_bytes() == key_bytes) else {
        return AuthOutcome::reject("untrusted public key");
    };
    let signature = match Signature::from_slice(sig_bytes) {
        Ok(sig) => sig,
        Err(_) => return AuthOutcome::reject("malformed signature"),
    };

    let message = signing_message(&handshake.name, &handshake.app_id);
    match key.verify(&message, &signature) {
        Ok(()) => AuthOutcome::Accepted,
        Err(_) => AuthOutcome::reject("signature verification failed"),
    }
}

/// Hashes a secret using SHA-256, returning a lowercase hex string.
pub fn hash_secret(secret: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hex::encode(hasher.finalize())
}

fn decode_key_bytes(hex_key: &str) -> Result<[u8; 32], ServerError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| ServerError::AuthFailed(format!("invalid key hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| ServerError::AuthFailed("key must be 32 bytes".to_string()))
}

fn parse_verifying_key(hex_key: &str) -> Result<VerifyingKey, ServerError> {
    VerifyingKey::from_bytes(&decode_key_bytes(hex_key)?)
        .map_err(|e| ServerError::AuthFailed(format!("invalid public key: {}", e)))
}
