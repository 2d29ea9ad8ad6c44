//! Handshake credentials.
//!
//! A [`Credential`] decides the `AuthType` and `AuthPayload` a client puts in
//! its handshake. Credentials parse from `kind:value` strings:
//!
//! | string                 | auth type     | payload                                   |
//! |------------------------|---------------|-------------------------------------------|
//! | `none`                 | `None`        | empty                                     |
//! | `app_key:<secret>`     | `AppKey`      | the secret bytes                          |
//! | `public_key:<seed>`    | `PublicKey`   | verifying key (32) ‖ signature (64)       |
//! | `private_key:<seed>`   | `PrivateKey`  | verifying key derived from the seed (32)  |
//!
//! Seeds are 32-byte Ed25519 secrets in hex.

use crate::error::ClientError;
use bytes::Bytes;
use ed25519_dalek::{Signer, SigningKey};
use sfn_protocol::AuthType;
use std::fmt;
use std::str::FromStr;

/// Length of a `PublicKey` auth payload: verifying key then signature.
pub const PUBLIC_KEY_PAYLOAD_LEN: usize = 32 + 64;

/// Bytes signed for `PublicKey` authentication.
pub fn signing_message(name: &str, app_id: &str) -> Vec<u8> {
    let mut message = Vec::with_capacity(name.len() + 1 + app_id.len());
    message.extend_from_slice(name.as_bytes());
    message.push(0x00);
    message.extend_from_slice(app_id.as_bytes());
    message
}

/// Credential presented in the handshake.
#[derive(Clone, Default)]
pub enum Credential {
    #[default]
    None,
    /// Shared app secret.
    AppKey(String),
    /// Signs the peer identity with an Ed25519 key.
    Signing(SigningKey),
    /// Presents the public half of a key the server also holds.
    PairedKey([u8; 32]),
}

impl Credential {
    pub fn auth_type(&self) -> AuthType {
        match self {
            Credential::None => AuthType::None,
            Credential::AppKey(_) => AuthType::AppKey,
            Credential::Signing(_) => AuthType::PublicKey,
            Credential::PairedKey(_) => AuthType::PrivateKey,
        }
    }

    /// Auth payload for a handshake from `name` in app `app_id`.
    pub fn payload(&self, name: &str, app_id: &str) -> Bytes {
        match self {
            Credential::None => Bytes::new(),
            Credential::AppKey(secret) => Bytes::copy_from_slice(secret.as_bytes()),
            Credential::Signing(key) => {
                let signature = key.sign(&signing_message(name, app_id));
                let mut payload = Vec::with_capacity(PUBLIC_KEY_PAYLOAD_LEN);
                payload.extend_from_slice(key.verifying_key().as_bytes());
                payload.extend_from_slice(&signature.to_bytes());
                Bytes::from(payload)
            }
            Credential::PairedKey(seed) => Bytes::copy_from_slice(
                SigningKey::from_bytes(seed).verifying_key().as_bytes(),
            ),
        }
    }
}

impl FromStr for Credential {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = s.split_once(':').unwrap_or((s, ""));
        match kind.parse::<AuthType>().map_err(ClientError::InvalidCredential)? {
            AuthType::None => Ok(Credential::None),
            AuthType::AppKey if value.is_empty() => Err(ClientError::InvalidCredential(
                "app_key credential without a secret".to_string(),
            )),
            AuthType::AppKey => Ok(Credential::AppKey(value.to_string())),
            AuthType::PublicKey => Ok(Credential::Signing(SigningKey::from_bytes(&parse_seed(
                value,
            )?))),
            AuthType::PrivateKey => Ok(Credential::PairedKey(parse_seed(value)?)),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::None => f.write_str("None"),
            Credential::AppKey(_) => f.write_str("AppKey(***)"),
            Credential::Signing(key) => f
                .debug_tuple("Signing")
                .field(&hex::encode(key.verifying_key().as_bytes()))
                .finish(),
            Credential::PairedKey(_) => f.write_str("PairedKey(***)"),
        }
    }
}

fn parse_seed(value: &str) -> Result<[u8; 32], ClientError> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| ClientError::InvalidCredential(format!("invalid key hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| ClientError::InvalidCredential("key must be 32 bytes".to_string()))
}
