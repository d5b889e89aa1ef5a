use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{daemon::storage::kv::KeyValueStore, utils::clock::Clock};

use super::{
    cipher::{Cipher, KdfParams, SymmetricKey},
    hash::hash_value,
    keys::{descriptor_key, KeyDescriptor, ACTIVE_KEY, KEY_DESCRIPTOR_PREFIX},
    CryptoError, StoreError,
};

pub const DATA_VERSION_KEY: &str = "data_version";
const ENVELOPE_ALG: &str = "A256GCM";

/// Keys holding store metadata. Everything else is sealed.
pub fn is_metadata_key(key: &str) -> bool {
    key.starts_with("encryption:") || key == DATA_VERSION_KEY
}

/// On-disk form of a sealed value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SealedEnvelope {
    alg: String,
    key_id: String,
    nonce: String,
    ciphertext: String,
    integrity_hash: String,
}

impl SealedEnvelope {
    fn parse(raw: &Value) -> Option<Self> {
        serde_json::from_value::<Self>(raw.clone())
            .ok()
            .filter(|v| v.alg == ENVELOPE_ALG)
    }
}

/// Ciphertext that can leave the device. Carries what another device holding the passphrase
/// needs to derive the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedDocument {
    pub key_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf: Option<KdfParams>,
    pub nonce: String,
    pub ciphertext: String,
    pub integrity_hash: String,
}

#[derive(Default)]
pub struct KeyOptions {
    pub passphrase: Option<String>,
    pub kdf: KdfParams,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub previous_key: String,
    pub new_key: String,
    pub resealed: usize,
    pub discarded: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct ResealStats {
    resealed: usize,
    discarded: usize,
}

/// Value read back from storage.
pub(crate) enum StoredValue {
    Sealed(Value),
    /// Written before values were encrypted. Only migrations should see these.
    Plain(Value),
}

struct KeyRing {
    active: Arc<Cipher>,
    active_descriptor: KeyDescriptor,
    retired: HashMap<String, Arc<Cipher>>,
}

impl KeyRing {
    fn cipher(&self, key_id: &str) -> Option<&Arc<Cipher>> {
        if self.active.key_id() == key_id {
            Some(&self.active)
        } else {
            self.retired.get(key_id)
        }
    }
}

/// Sealed access to a [KeyValueStore]. Owns the key material: nothing else reads or writes the
/// `encryption:` keys.
pub struct EncryptedStore {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    options: KeyOptions,
    ring: RwLock<KeyRing>,
    derived: Mutex<HashMap<String, Arc<Cipher>>>,
}

fn associated_data(storage_key: &str, key_id: &str) -> Vec<u8> {
    format!("{storage_key}\n{key_id}").into_bytes()
}

fn decode(field: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64
        .decode(value)
        .map_err(|e| CryptoError::Malformed(format!("{field}: {e}")))
}

fn seal_value(cipher: &Cipher, storage_key: &str, value: &Value) -> Result<SealedEnvelope, CryptoError> {
    let plaintext = serde_json::to_vec(value)?;
    let sealed = cipher.seal(&plaintext, &associated_data(storage_key, cipher.key_id()))?;
    Ok(SealedEnvelope {
        alg: ENVELOPE_ALG.into(),
        key_id: cipher.key_id().into(),
        nonce: BASE64.encode(sealed.nonce),
        ciphertext: BASE64.encode(sealed.ciphertext),
        integrity_hash: hash_value(value),
    })
}

fn open_envelope(
    ring: &KeyRing,
    storage_key: &str,
    envelope: &SealedEnvelope,
) -> Result<Value, CryptoError> {
    let cipher = ring
        .cipher(&envelope.key_id)
        .ok_or_else(|| CryptoError::UnknownKey(envelope.key_id.clone()))?;
    let plaintext = cipher.open(
        &decode("nonce", &envelope.nonce)?,
        &decode("ciphertext", &envelope.ciphertext)?,
        &associated_data(storage_key, &envelope.key_id),
    )?;
    Ok(serde_json::from_slice(&plaintext)?)
}

fn verify_integrity(expected: &str, value: &Value) -> Result<(), CryptoError> {
    let actual = hash_value(value);
    if actual == expected {
        Ok(())
    } else {
        Err(CryptoError::IntegrityMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

impl EncryptedStore {
    /// Restores the key ring, creating a key on first run, and finishes a rotation that was
    /// interrupted.
    pub async fn open(
        kv: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        options: KeyOptions,
    ) -> Result<Self, StoreError> {
        let ring = Self::load_ring(kv.as_ref(), clock.as_ref(), &options).await?;
        let store = Self {
            kv,
            clock,
            options,
            ring: RwLock::new(ring),
            derived: Mutex::new(HashMap::new()),
        };
        store.finish_pending_rotation().await?;
        Ok(store)
    }

    async fn read_descriptor(
        kv: &dyn KeyValueStore,
        key_id: &str,
    ) -> Result<Option<KeyDescriptor>, StoreError> {
        let Some(raw) = kv.get(&descriptor_key(key_id)).await? else {
            return Ok(None);
        };
        let descriptor = serde_json::from_value(raw)
            .map_err(|e| CryptoError::Malformed(format!("key descriptor {key_id}: {e}")))?;
        Ok(Some(descriptor))
    }

    async fn load_ring(
        kv: &dyn KeyValueStore,
        clock: &dyn Clock,
        options: &KeyOptions,
    ) -> Result<KeyRing, StoreError> {
        let active_id = kv
            .get(ACTIVE_KEY)
            .await?
            .and_then(|v| v.as_str().map(str::to_string));

        let Some(active_id) = active_id else {
            let (descriptor, cipher) =
                KeyDescriptor::create(options.passphrase.as_deref(), &options.kdf, clock.time())?;
            kv.set(
                &descriptor_key(&descriptor.id),
                serde_json::to_value(&descriptor).map_err(CryptoError::from)?,
            )
            .await?;
            kv.set(ACTIVE_KEY, Value::String(descriptor.id.clone()))
                .await?;
            info!("Created encryption key {}", descriptor.id);
            return Ok(KeyRing {
                active: Arc::new(cipher),
                active_descriptor: descriptor,
                retired: HashMap::new(),
            });
        };

        let descriptor = Self::read_descriptor(kv, &active_id)
            .await?
            .ok_or_else(|| StoreError::MissingKey(active_id.clone()))?;
        let active = Arc::new(descriptor.restore(options.passphrase.as_deref())?);
        if options.passphrase.is_some() && descriptor.derivation().is_none() {
            warn!("A passphrase is configured but the active key is random; rotate the key to use it");
        }

        let mut retired = HashMap::new();
        for key in kv.keys().await? {
            let Some(id) = key.strip_prefix(KEY_DESCRIPTOR_PREFIX) else {
                continue;
            };
            if id == active_id {
                continue;
            }
            let restored = match Self::read_descriptor(kv, id).await {
                Ok(Some(descriptor)) => descriptor.restore(options.passphrase.as_deref()),
                Ok(None) => continue,
                Err(e) => Err(e),
            };
            match restored {
                Ok(cipher) => {
                    retired.insert(id.to_string(), Arc::new(cipher));
                }
                Err(e) => warn!("Can't restore retired key {id}: {e}"),
            }
        }

        debug!("Loaded key ring with active key {active_id} and {} retired", retired.len());
        Ok(KeyRing {
            active,
            active_descriptor: descriptor,
            retired,
        })
    }

    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    pub async fn active_key_id(&self) -> String {
        self.ring.read().await.active.key_id().to_string()
    }

    /// Reads and decrypts a value. Undecryptable values are discarded and read as absent; an
    /// integrity mismatch is only logged.
    pub(crate) async fn read_stored(&self, key: &str) -> Result<Option<StoredValue>> {
        let ring = self.ring.read().await;
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(None);
        };
        let Some(envelope) = SealedEnvelope::parse(&raw) else {
            return Ok(Some(StoredValue::Plain(raw)));
        };
        match open_envelope(&ring, key, &envelope) {
            Ok(value) => {
                if let Err(e) = verify_integrity(&envelope.integrity_hash, &value) {
                    warn!("Value under {key} failed integrity check: {e}");
                }
                Ok(Some(StoredValue::Sealed(value)))
            }
            Err(e) => {
                drop(ring);
                warn!("Discarding undecryptable value under {key}: {e}");
                self.kv.remove(key).await?;
                Ok(None)
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read_stored(key).await? {
            Some(StoredValue::Sealed(value)) => match serde_json::from_value(value) {
                Ok(v) => Ok(Some(v)),
                Err(e) => {
                    warn!("Value under {key} has an unexpected shape: {e}");
                    Ok(None)
                }
            },
            Some(StoredValue::Plain(_)) => {
                warn!("Value under {key} isn't sealed yet, ignoring it until migration runs");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub(crate) async fn put_value(&self, key: &str, value: &Value) -> Result<()> {
        let ring = self.ring.read().await;
        let envelope = seal_value(&ring.active, key, value)?;
        self.kv.set(key, serde_json::to_value(envelope)?).await
    }

    pub async fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.put_value(key, &serde_json::to_value(value)?).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.kv.remove(key).await
    }

    pub async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .kv
            .keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    /// Seals a value for another device. `context` is authenticated and must be reproduced by
    /// the reader.
    pub async fn seal_document<T: Serialize + ?Sized>(
        &self,
        context: &str,
        value: &T,
    ) -> Result<SealedDocument, CryptoError> {
        let ring = self.ring.read().await;
        let value = serde_json::to_value(value)?;
        let envelope = seal_value(&ring.active, context, &value)?;
        let (salt, kdf) = match ring.active_descriptor.derivation() {
            Some((salt, kdf)) => (Some(salt), Some(kdf)),
            None => (None, None),
        };
        Ok(SealedDocument {
            key_id: envelope.key_id,
            salt,
            kdf,
            nonce: envelope.nonce,
            ciphertext: envelope.ciphertext,
            integrity_hash: envelope.integrity_hash,
        })
    }

    /// Opens a document sealed by any device sharing the passphrase (or this device's key).
    /// Integrity mismatches are errors here.
    pub async fn open_document<T: DeserializeOwned>(
        &self,
        context: &str,
        document: &SealedDocument,
    ) -> Result<T, CryptoError> {
        let cipher = self.cipher_for_document(document).await?;
        let plaintext = cipher.open(
            &decode("nonce", &document.nonce)?,
            &decode("ciphertext", &document.ciphertext)?,
            &associated_data(context, &document.key_id),
        )?;
        let value: Value = serde_json::from_slice(&plaintext)?;
        verify_integrity(&document.integrity_hash, &value)?;
        Ok(serde_json::from_value(value)?)
    }

    async fn cipher_for_document(&self, document: &SealedDocument) -> Result<Arc<Cipher>, CryptoError> {
        if let Some(cipher) = self.ring.read().await.cipher(&document.key_id) {
            return Ok(cipher.clone());
        }
        let mut derived = self.derived.lock().await;
        if let Some(cipher) = derived.get(&document.key_id) {
            return Ok(cipher.clone());
        }
        let (Some(salt), Some(kdf), Some(passphrase)) = (
            document.salt.as_deref(),
            document.kdf,
            self.options.passphrase.clone(),
        ) else {
            return Err(CryptoError::UnknownKey(document.key_id.clone()));
        };
        // Cost parameters come from the remote, they are bounded before any work is done.
        if !kdf.fits_within(&self.options.kdf.max(&KdfParams::DOCUMENT_CEILING)) {
            return Err(CryptoError::KdfTooCostly(kdf));
        }
        let salt = decode("salt", salt)?;
        let key = tokio::task::spawn_blocking(move || {
            SymmetricKey::from_passphrase(&passphrase, &salt, &kdf)
        })
        .await
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))??;
        let cipher = Arc::new(Cipher::new(document.key_id.clone(), &key)?);
        derived.insert(document.key_id.clone(), cipher.clone());
        Ok(cipher)
    }

    /// Replaces the active key.
    ///
    /// Every step leaves storage readable: the new descriptor is written first, values are
    /// resealed one by one (each envelope names its key), the active pointer flips, and only then
    /// are retired descriptors removed. [EncryptedStore::open] completes whatever was
    /// interrupted.
    pub async fn rotate_key(&self) -> Result<RotationReport, StoreError> {
        let mut ring = self.ring.write().await;
        let (descriptor, cipher) = KeyDescriptor::create(
            self.options.passphrase.as_deref(),
            &self.options.kdf,
            self.clock.time(),
        )?;
        let cipher = Arc::new(cipher);
        self.kv
            .set(
                &descriptor_key(&descriptor.id),
                serde_json::to_value(&descriptor).map_err(CryptoError::from)?,
            )
            .await?;
        ring.retired.insert(descriptor.id.clone(), cipher.clone());

        let stats = self.reseal_all(&ring, &cipher).await?;

        self.kv
            .set(ACTIVE_KEY, Value::String(descriptor.id.clone()))
            .await?;
        ring.retired.remove(&descriptor.id);
        let previous = std::mem::replace(&mut ring.active, cipher);
        ring.retired
            .insert(previous.key_id().to_string(), previous.clone());
        ring.active_descriptor = descriptor;

        self.prune_retired(&mut ring).await?;
        self.derived.lock().await.clear();

        let report = RotationReport {
            previous_key: previous.key_id().to_string(),
            new_key: ring.active.key_id().to_string(),
            resealed: stats.resealed,
            discarded: stats.discarded,
        };
        info!("Rotated encryption key {report:?}");
        Ok(report)
    }

    async fn finish_pending_rotation(&self) -> Result<(), StoreError> {
        let mut ring = self.ring.write().await;
        let active_id = ring.active.key_id().to_string();
        let pending = self
            .kv
            .keys()
            .await?
            .iter()
            .filter_map(|k| k.strip_prefix(KEY_DESCRIPTOR_PREFIX))
            .any(|id| id != active_id);
        if !pending {
            return Ok(());
        }

        warn!("Found retired key descriptors, finishing an interrupted key rotation");
        let active = ring.active.clone();
        let stats = self.reseal_all(&ring, &active).await?;
        let pruned = self.prune_retired(&mut ring).await?;
        info!(
            "Recovered rotation: resealed {}, discarded {}, pruned {pruned} descriptors",
            stats.resealed, stats.discarded
        );
        Ok(())
    }

    async fn reseal_all(&self, ring: &KeyRing, target: &Cipher) -> Result<ResealStats> {
        let mut stats = ResealStats::default();
        for key in self.kv.keys().await? {
            if is_metadata_key(&key) {
                continue;
            }
            let Some(raw) = self.kv.get(&key).await? else {
                continue;
            };
            let Some(envelope) = SealedEnvelope::parse(&raw) else {
                continue;
            };
            if envelope.key_id == target.key_id() {
                continue;
            }
            match open_envelope(ring, &key, &envelope) {
                Ok(value) => {
                    let resealed = seal_value(target, &key, &value)?;
                    self.kv.set(&key, serde_json::to_value(resealed)?).await?;
                    stats.resealed += 1;
                }
                Err(e) => {
                    warn!("Discarding undecryptable value under {key} while resealing: {e}");
                    self.kv.remove(&key).await?;
                    stats.discarded += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn prune_retired(&self, ring: &mut KeyRing) -> Result<usize> {
        let active_id = ring.active.key_id().to_string();
        let mut pruned = 0;
        for key in self.kv.keys().await? {
            let Some(id) = key.strip_prefix(KEY_DESCRIPTOR_PREFIX) else {
                continue;
            };
            if id == active_id {
                continue;
            }
            self.kv.remove(&key).await?;
            ring.retired.remove(id);
            pruned += 1;
        }
        Ok(pruned)
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Arc;

    use crate::{
        crypto::cipher::KdfParams,
        daemon::storage::kv::{KeyValueStore, MemoryKeyValueStore},
        utils::clock::{testing::ManualClock, Clock},
    };

    use super::{EncryptedStore, KeyOptions};

    pub fn light_options(passphrase: Option<&str>) -> KeyOptions {
        KeyOptions {
            passphrase: passphrase.map(str::to_string),
            kdf: KdfParams::minimal(),
        }
    }

    pub async fn memory_store(clock: &ManualClock) -> (Arc<MemoryKeyValueStore>, Arc<EncryptedStore>) {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let store = EncryptedStore::open(
            kv.clone() as Arc<dyn KeyValueStore>,
            Arc::new(clock.clone()) as Arc<dyn Clock>,
            light_options(None),
        )
        .await
        .unwrap();
        (kv, Arc::new(store))
    }
}
