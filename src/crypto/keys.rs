use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    cipher::{generate_salt, Cipher, KdfParams, SymmetricKey},
    CryptoError, StoreError,
};

pub const ACTIVE_KEY: &str = "encryption:active_key";
pub const KEY_DESCRIPTOR_PREFIX: &str = "encryption:key:";

pub fn descriptor_key(key_id: &str) -> String {
    format!("{KEY_DESCRIPTOR_PREFIX}{key_id}")
}

/// How the key material of a descriptor is obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum KeySource {
    /// Random key stored as-is.
    #[serde(rename_all = "camelCase")]
    Generated { material: String },
    /// Key derived from the user's passphrase. Only the salt and a fingerprint are stored.
    #[serde(rename_all = "camelCase")]
    Passphrase {
        salt: String,
        params: KdfParams,
        fingerprint: String,
    },
}

/// Persisted description of one encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDescriptor {
    pub id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub source: KeySource,
}

impl KeyDescriptor {
    /// Creates a new descriptor and its cipher. A passphrase selects derived keys, otherwise a
    /// random key is generated.
    pub fn create(
        passphrase: Option<&str>,
        params: &KdfParams,
        now: DateTime<Utc>,
    ) -> Result<(Self, Cipher), CryptoError> {
        let id = Uuid::new_v4().simple().to_string();
        let (source, key) = match passphrase {
            Some(passphrase) => {
                let salt = generate_salt();
                let key = SymmetricKey::from_passphrase(passphrase, &salt, params)?;
                let source = KeySource::Passphrase {
                    salt: BASE64.encode(&salt),
                    params: *params,
                    fingerprint: key.fingerprint(),
                };
                (source, key)
            }
            None => {
                let key = SymmetricKey::generate();
                let source = KeySource::Generated {
                    material: BASE64.encode(key.as_bytes()),
                };
                (source, key)
            }
        };
        let cipher = Cipher::new(id.clone(), &key)?;
        Ok((
            Self {
                id,
                created_at: now,
                source,
            },
            cipher,
        ))
    }

    /// Rebuilds the cipher. Passphrase keys fail hard when no passphrase is configured or the
    /// passphrase doesn't reproduce the stored fingerprint.
    pub fn restore(&self, passphrase: Option<&str>) -> Result<Cipher, StoreError> {
        let key = match &self.source {
            KeySource::Generated { material } => {
                let bytes = BASE64
                    .decode(material)
                    .map_err(|e| CryptoError::Malformed(format!("key material: {e}")))?;
                SymmetricKey::from_bytes(&bytes)?
            }
            KeySource::Passphrase {
                salt,
                params,
                fingerprint,
            } => {
                let passphrase = passphrase.ok_or(StoreError::PassphraseRequired)?;
                let salt = BASE64
                    .decode(salt)
                    .map_err(|e| CryptoError::Malformed(format!("key salt: {e}")))?;
                let key = SymmetricKey::from_passphrase(passphrase, &salt, params)?;
                if key.fingerprint() != *fingerprint {
                    return Err(StoreError::WrongPassphrase);
                }
                key
            }
        };
        Ok(Cipher::new(self.id.clone(), &key)?)
    }

    /// Salt and parameters another device needs to derive this key from the passphrase.
    pub fn derivation(&self) -> Option<(String, KdfParams)> {
        match &self.source {
            KeySource::Passphrase { salt, params, .. } => Some((salt.clone(), *params)),
            KeySource::Generated { .. } => None,
        }
    }
}
