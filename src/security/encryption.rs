//! Authenticated encryption with per-call key derivation.
//!
//! Every [`EncryptionService::encrypt`] call draws a fresh random salt and
//! a fresh 96-bit nonce, derives a 256-bit key from the master key, the
//! salt and a caller-supplied *context* label, and seals the plaintext with
//! an AEAD cipher. The context is bound twice: it is mixed into the key
//! derivation input and passed as associated data, so a value encrypted
//! under `"api_keys"` cannot be opened under any other label.
//!
//! # Key derivation input
//!
//! ```text
//! key = KDF(password = master_key, salt = salt ‖ 0x00 ‖ context)
//! ```
//!
//! Derived keys are cached per `(salt, context, kdf, iterations)` in an LRU
//! cache that
//! also evicts on idle time and absolute age. Cached key bytes are wrapped
//! in [`Zeroizing`] and overwritten when evicted.
//!
//! # Secure memory
//!
//! Secrets that must stay resident (tokens fetched at start-up, for
//! example) can be parked with [`EncryptionService::store_secret`]. They are
//! held encrypted under the master key and re-wrapped by
//! [`EncryptionService::rotate_keys`].

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use argon2::Argon2;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::ChaCha20Poly1305;
use hmac::{Hmac, Mac};
use lru::LruCache;
use rand::RngExt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::Instant;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use super::error::{DecryptionError, EncryptionError};
use super::policy::{EncryptionPolicy, MIN_PBKDF2_ITERATIONS};

type HmacSha256 = Hmac<Sha256>;

/// Derived key length for every supported cipher.
pub const KEY_LEN: usize = 32;
/// AEAD nonce length (96 bits) for every supported cipher.
pub const NONCE_LEN: usize = 12;
/// AEAD tag length for every supported cipher.
pub const TAG_LEN: usize = 16;

const MAC_KEY_LABEL: &[u8] = b"warden/mac/v1";
const HASH_PREFIX: &str = "pbkdf2-sha256";
const HASH_SALT_LEN: usize = 16;
const MAX_HASH_ITERATIONS: u32 = 10_000_000;

// scrypt cost: N = 2^15, r = 8, p = 1 (32 MiB)
const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// Supported AEAD ciphers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherAlgorithm {
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

/// Supported key-derivation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyDerivation {
    #[serde(rename = "pbkdf2-sha256")]
    Pbkdf2Sha256,
    #[serde(rename = "scrypt")]
    Scrypt,
    #[serde(rename = "argon2id")]
    Argon2id,
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CipherAlgorithm::Aes256Gcm => "aes-256-gcm",
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305",
        })
    }
}

impl FromStr for CipherAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aes-256-gcm" => Ok(CipherAlgorithm::Aes256Gcm),
            "chacha20-poly1305" => Ok(CipherAlgorithm::ChaCha20Poly1305),
            other => Err(format!("unknown cipher '{}'", other)),
        }
    }
}

impl fmt::Display for KeyDerivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyDerivation::Pbkdf2Sha256 => "pbkdf2-sha256",
            KeyDerivation::Scrypt => "scrypt",
            KeyDerivation::Argon2id => "argon2id",
        })
    }
}

/// Output of [`EncryptionService::encrypt`].
///
/// Serializes to JSON with every binary field as base64 text:
/// `{ciphertext, iv, tag, salt, algorithm, kdf, iterations}`. `tag` also accepts the
/// `authTag` spelling on input. The fields are opaque outside this module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedValue {
    #[serde(with = "b64")]
    pub(crate) ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub(crate) iv: Vec<u8>,
    #[serde(with = "b64", alias = "authTag")]
    pub(crate) tag: Vec<u8>,
    #[serde(with = "b64")]
    pub(crate) salt: Vec<u8>,
    pub(crate) algorithm: CipherAlgorithm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) kdf: Option<KeyDerivation>,
    /// PBKDF2 iteration count used at encryption time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) iterations: Option<u32>,
}

impl EncryptedValue {
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    pub fn tag(&self) -> &[u8] {
        &self.tag
    }
}

mod b64 {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Process-wide master secret. Never printed, serialized or logged.
#[derive(Clone)]
pub struct MasterKey(Zeroizing<Vec<u8>>);

impl MasterKey {
    /// Shortest accepted master secret.
    pub const MIN_LEN: usize = 16;

    pub fn new(bytes: Vec<u8>) -> Result<Self, EncryptionError> {
        let bytes = Zeroizing::new(bytes);
        if bytes.len() < Self::MIN_LEN {
            return Err(EncryptionError::MasterKeyTooShort(Self::MIN_LEN));
        }
        Ok(Self(bytes))
    }

    /// Fresh random 32-byte key. Only for callers that own persistence of it.
    pub fn generate() -> Self {
        Self(Zeroizing::new(random_bytes(KEY_LEN)))
    }

    /// Read the master secret from an environment variable.
    ///
    /// Returns `Ok(None)` when the variable is unset or empty.
    pub fn from_env(var: &str) -> Result<Option<Self>, EncryptionError> {
        match std::env::var(var) {
            Ok(value) if !value.is_empty() => Self::new(value.into_bytes()).map(Some),
            _ => Ok(None),
        }
    }

    pub(crate) fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Master key plus the MAC sub-key derived from it.
struct KeyMaterial {
    master: MasterKey,
    mac_key: Zeroizing<[u8; KEY_LEN]>,
}

impl KeyMaterial {
    fn new(master: MasterKey) -> Result<Self, EncryptionError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(master.expose())
            .map_err(|_| EncryptionError::KeyDerivation)?;
        mac.update(MAC_KEY_LABEL);
        let mut mac_key = Zeroizing::new([0u8; KEY_LEN]);
        mac_key.copy_from_slice(&mac.finalize().into_bytes());
        Ok(Self { master, mac_key })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    salt: Vec<u8>,
    context: String,
    kdf: KeyDerivation,
    iterations: u32,
}

struct CachedKey {
    key: Zeroizing<[u8; KEY_LEN]>,
    created_at: Instant,
    last_used_at: Instant,
    use_count: u64,
}

/// Result of a master-key rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RotationReport {
    /// Secure-memory entries re-encrypted under the new key.
    pub rewrapped: usize,
    /// Entries that could not be re-wrapped and were discarded.
    pub dropped: usize,
}

/// Authenticated encryption, key derivation, MACs and salted hashing.
pub struct EncryptionService {
    policy: RwLock<EncryptionPolicy>,
    keys: RwLock<Option<KeyMaterial>>,
    /// Bumped on every master key change; derived keys from an older
    /// generation never enter the cache.
    key_generation: AtomicU64,
    cache: Mutex<LruCache<CacheKey, CachedKey>>,
    secrets: Mutex<HashMap<String, EncryptedValue>>,
}

impl EncryptionService {
    /// Create the service. A missing master key is allowed; every keyed
    /// operation then fails with [`EncryptionError::MasterKeyUnavailable`].
    pub fn new(
        policy: EncryptionPolicy,
        master: Option<MasterKey>,
    ) -> Result<Self, EncryptionError> {
        let keys = master.map(KeyMaterial::new).transpose()?;
        let capacity = cache_capacity(&policy);
        Ok(Self {
            policy: RwLock::new(policy),
            keys: RwLock::new(keys),
            key_generation: AtomicU64::new(0),
            cache: Mutex::new(LruCache::new(capacity)),
            secrets: Mutex::new(HashMap::new()),
        })
    }

    pub fn has_master_key(&self) -> bool {
        read(&self.keys).is_some()
    }

    pub fn policy(&self) -> EncryptionPolicy {
        read(&self.policy).clone()
    }

    /// Replace the policy. Cached derived keys are discarded.
    pub fn apply_policy(&self, policy: EncryptionPolicy) {
        let capacity = cache_capacity(&policy);
        *write(&self.policy) = policy;
        let mut cache = lock(&self.cache);
        cache.clear();
        cache.resize(capacity);
        debug!("Encryption policy updated; derived key cache cleared");
    }

    /// Encrypt `plaintext` under `context`.
    pub fn encrypt(&self, plaintext: &str, context: &str) -> Result<EncryptedValue, EncryptionError> {
        self.encrypt_bytes(plaintext.as_bytes(), context)
    }

    /// Decrypt a value produced by [`encrypt`](Self::encrypt) under the same context.
    pub fn decrypt(&self, value: &EncryptedValue, context: &str) -> Result<String, DecryptionError> {
        let plaintext = self.decrypt_bytes(value, context)?;
        String::from_utf8(plaintext.to_vec()).map_err(|e| {
            let mut bytes = e.into_bytes();
            secure_erase(&mut bytes);
            DecryptionError
        })
    }

    pub(crate) fn encrypt_bytes(
        &self,
        plaintext: &[u8],
        context: &str,
    ) -> Result<EncryptedValue, EncryptionError> {
        let policy = self.policy();
        let salt = random_bytes(policy.salt_length);
        let iv = random_bytes(NONCE_LEN);
        let iterations = policy.pbkdf2_iterations;
        let key = self.derived_key(&salt, context, policy.key_derivation, iterations, &policy)?;

        let mut sealed = seal(policy.algorithm, &key[..], &iv, plaintext, context.as_bytes())
            .ok_or(EncryptionError::Cipher)?;
        if sealed.len() < TAG_LEN {
            return Err(EncryptionError::Cipher);
        }
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(EncryptedValue {
            ciphertext: sealed,
            iv,
            tag,
            salt,
            algorithm: policy.algorithm,
            kdf: Some(policy.key_derivation),
            iterations: (policy.key_derivation == KeyDerivation::Pbkdf2Sha256).then_some(iterations),
        })
    }

    pub(crate) fn decrypt_bytes(
        &self,
        value: &EncryptedValue,
        context: &str,
    ) -> Result<Zeroizing<Vec<u8>>, DecryptionError> {
        if value.iv.len() != NONCE_LEN || value.tag.len() != TAG_LEN {
            return Err(DecryptionError);
        }
        let policy = self.policy();
        let kdf = value.kdf.unwrap_or(policy.key_derivation);
        let iterations = value.iterations.unwrap_or(policy.pbkdf2_iterations);
        if !(MIN_PBKDF2_ITERATIONS..=MAX_HASH_ITERATIONS).contains(&iterations) {
            return Err(DecryptionError);
        }
        let key = self
            .derived_key(&value.salt, context, kdf, iterations, &policy)
            .map_err(|_| DecryptionError)?;

        let mut sealed = Vec::with_capacity(value.ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(&value.ciphertext);
        sealed.extend_from_slice(&value.tag);

        open(value.algorithm, &key[..], &value.iv, &sealed, context.as_bytes())
            .map(Zeroizing::new)
            .ok_or(DecryptionError)
    }

    /// Salted slow hash for secrets that only ever need comparing.
    ///
    /// Format: `pbkdf2-sha256$<iterations>$<salt b64>$<hash b64>`.
    /// Does not depend on the master key.
    pub fn hash(&self, data: &str, salt: Option<&[u8]>) -> String {
        let iterations = self.policy().pbkdf2_iterations;
        let salt = salt
            .map(|s| s.to_vec())
            .unwrap_or_else(|| random_bytes(HASH_SALT_LEN));
        let mut out = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2::pbkdf2_hmac::<Sha256>(data.as_bytes(), &salt, iterations, &mut out[..]);
        format!(
            "{}${}${}${}",
            HASH_PREFIX,
            iterations,
            STANDARD.encode(&salt),
            STANDARD.encode(&out[..])
        )
    }

    /// Constant-time check of `data` against a string from [`hash`](Self::hash).
    pub fn verify_hash(&self, data: &str, encoded: &str) -> bool {
        let parts: Vec<&str> = encoded.split('$').collect();
        let [prefix, iterations, salt, expected] = parts.as_slice() else {
            return false;
        };
        if *prefix != HASH_PREFIX {
            return false;
        }
        let Ok(iterations) = iterations.parse::<u32>() else {
            return false;
        };
        if !(MIN_PBKDF2_ITERATIONS..=MAX_HASH_ITERATIONS).contains(&iterations) {
            return false;
        }
        let (Ok(salt), Ok(expected)) = (STANDARD.decode(salt), STANDARD.decode(expected)) else {
            return false;
        };

        let mut out = Zeroizing::new(vec![0u8; expected.len().max(1)]);
        pbkdf2::pbkdf2_hmac::<Sha256>(data.as_bytes(), &salt, iterations, &mut out[..]);
        out.as_slice().ct_eq(expected.as_slice()).into()
    }

    /// Hex HMAC-SHA256 of `data` under the MAC sub-key.
    pub fn create_mac(&self, data: &str) -> Result<String, EncryptionError> {
        let keys = read(&self.keys);
        let material = keys.as_ref().ok_or(EncryptionError::MasterKeyUnavailable)?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&material.mac_key[..])
            .map_err(|_| EncryptionError::KeyDerivation)?;
        mac.update(data.as_bytes());
        Ok(hex_encode(&mac.finalize().into_bytes()))
    }

    /// Constant-time MAC check. False when no master key is loaded.
    pub fn verify_mac(&self, data: &str, mac_hex: &str) -> bool {
        let Some(expected) = hex_decode(mac_hex) else {
            return false;
        };
        let keys = read(&self.keys);
        let Some(material) = keys.as_ref() else {
            return false;
        };
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(&material.mac_key[..]) else {
            return false;
        };
        mac.update(data.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }

    /// Replace the master key.
    ///
    /// Clears the derived-key cache and re-wraps every secure-memory entry
    /// under the new key. An entry that fails to re-wrap is discarded; the
    /// service itself keeps working.
    pub fn rotate_keys(&self, new_master: MasterKey) -> Result<RotationReport, EncryptionError> {
        let new_material = KeyMaterial::new(new_master)?;
        let mut secrets = lock(&self.secrets);
        let mut report = RotationReport::default();

        let mut recovered = Vec::with_capacity(secrets.len());
        for (name, value) in secrets.drain() {
            match self.decrypt_bytes(&value, &secret_context(&name)) {
                Ok(plain) => recovered.push((name, plain)),
                Err(_) => {
                    warn!("Secure memory entry '{}' could not be unwrapped; dropping", name);
                    report.dropped += 1;
                }
            }
        }

        {
            let mut keys = write(&self.keys);
            *keys = Some(new_material);
            self.key_generation.fetch_add(1, Ordering::AcqRel);
        }
        lock(&self.cache).clear();

        for (name, plain) in recovered {
            match self.encrypt_bytes(&plain, &secret_context(&name)) {
                Ok(value) => {
                    secrets.insert(name, value);
                    report.rewrapped += 1;
                }
                Err(_) => {
                    warn!("Secure memory entry '{}' could not be re-wrapped; dropping", name);
                    report.dropped += 1;
                }
            }
        }

        info!(
            "Master key rotated ({} entries re-wrapped, {} dropped)",
            report.rewrapped, report.dropped
        );
        Ok(report)
    }

    /// Park a secret in memory, encrypted under the master key.
    pub fn store_secret(&self, name: &str, secret: &[u8]) -> Result<(), EncryptionError> {
        let value = self.encrypt_bytes(secret, &secret_context(name))?;
        lock(&self.secrets).insert(name.to_string(), value);
        Ok(())
    }

    /// Retrieve a parked secret. The returned buffer is erased on drop.
    pub fn load_secret(&self, name: &str) -> Option<Zeroizing<Vec<u8>>> {
        let value = lock(&self.secrets).get(name).cloned()?;
        self.decrypt_bytes(&value, &secret_context(name)).ok()
    }

    pub fn remove_secret(&self, name: &str) -> bool {
        lock(&self.secrets).remove(name).is_some()
    }

    /// Drop cached keys that are idle too long or older than the rotation
    /// interval. Returns the number evicted.
    pub fn evict_expired_keys(&self) -> usize {
        self.evict_expired_keys_at(Instant::now())
    }

    pub(crate) fn evict_expired_keys_at(&self, now: Instant) -> usize {
        let policy = self.policy();
        let mut cache = lock(&self.cache);
        let expired: Vec<CacheKey> = cache
            .iter()
            .filter(|(_, entry)| is_expired(entry, &policy, now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            cache.pop(key);
        }
        if !expired.is_empty() {
            debug!("Evicted {} derived keys", expired.len());
        }
        expired.len()
    }

    pub fn cached_key_count(&self) -> usize {
        lock(&self.cache).len()
    }

    fn derived_key(
        &self,
        salt: &[u8],
        context: &str,
        kdf: KeyDerivation,
        iterations: u32,
        policy: &EncryptionPolicy,
    ) -> Result<Zeroizing<[u8; KEY_LEN]>, EncryptionError> {
        let cache_key = CacheKey {
            salt: salt.to_vec(),
            context: context.to_string(),
            kdf,
            iterations,
        };
        let now = Instant::now();

        {
            let mut cache = lock(&self.cache);
            if let Some(entry) = cache.get_mut(&cache_key) {
                if !is_expired(entry, policy, now) {
                    entry.last_used_at = now;
                    entry.use_count += 1;
                    return Ok(entry.key.clone());
                }
                cache.pop(&cache_key);
            }
        }

        let (key, generation) = {
            let keys = read(&self.keys);
            let material = keys.as_ref().ok_or(EncryptionError::MasterKeyUnavailable)?;
            let generation = self.key_generation.load(Ordering::Acquire);
            let key = derive_key(kdf, material.master.expose(), salt, context, iterations)?;
            (key, generation)
        };

        let mut cache = lock(&self.cache);
        if self.key_generation.load(Ordering::Acquire) == generation {
            cache.push(
                cache_key,
                CachedKey {
                    key: key.clone(),
                    created_at: now,
                    last_used_at: now,
                    use_count: 1,
                },
            );
        }
        Ok(key)
    }
}

fn is_expired(entry: &CachedKey, policy: &EncryptionPolicy, now: Instant) -> bool {
    now.duration_since(entry.last_used_at) > policy.key_idle_timeout
        || now.duration_since(entry.created_at) > policy.key_rotation_interval
}

fn cache_capacity(policy: &EncryptionPolicy) -> NonZeroUsize {
    NonZeroUsize::new(policy.key_cache_size).unwrap_or(NonZeroUsize::MIN)
}

fn secret_context(name: &str) -> String {
    format!("secure-memory:{}", name)
}

fn derive_key(
    kdf: KeyDerivation,
    master: &[u8],
    salt: &[u8],
    context: &str,
    iterations: u32,
) -> Result<Zeroizing<[u8; KEY_LEN]>, EncryptionError> {
    let mut input = Zeroizing::new(Vec::with_capacity(salt.len() + 1 + context.len()));
    input.extend_from_slice(salt);
    input.push(0);
    input.extend_from_slice(context.as_bytes());

    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    match kdf {
        KeyDerivation::Pbkdf2Sha256 => {
            pbkdf2::pbkdf2_hmac::<Sha256>(master, &input, iterations, &mut out[..]);
        }
        KeyDerivation::Scrypt => {
            let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
                .map_err(|_| EncryptionError::KeyDerivation)?;
            scrypt::scrypt(master, &input, &params, &mut out[..])
                .map_err(|_| EncryptionError::KeyDerivation)?;
        }
        KeyDerivation::Argon2id => {
            Argon2::default()
                .hash_password_into(master, &input, &mut out[..])
                .map_err(|_| EncryptionError::KeyDerivation)?;
        }
    }
    Ok(out)
}

fn seal(
    algorithm: CipherAlgorithm,
    key: &[u8],
    iv: &[u8],
    msg: &[u8],
    aad: &[u8],
) -> Option<Vec<u8>> {
    let payload = Payload { msg, aad };
    let nonce = GenericArray::from_slice(iv);
    match algorithm {
        CipherAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .ok()?
            .encrypt(nonce, payload)
            .ok(),
        CipherAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
            .ok()?
            .encrypt(nonce, payload)
            .ok(),
    }
}

fn open(
    algorithm: CipherAlgorithm,
    key: &[u8],
    iv: &[u8],
    sealed: &[u8],
    aad: &[u8],
) -> Option<Vec<u8>> {
    let payload = Payload { msg: sealed, aad };
    let nonce = GenericArray::from_slice(iv);
    match algorithm {
        CipherAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .ok()?
            .decrypt(nonce, payload)
            .ok(),
        CipherAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
            .ok()?
            .decrypt(nonce, payload)
            .ok(),
    }
}

/// Overwrite a buffer that held key material or plaintext.
pub fn secure_erase(buffer: &mut [u8]) {
    buffer.zeroize();
}

pub(crate) fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rng().fill(buf.as_mut_slice());
    buf
}

/// Hex-encode a byte slice.
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}
