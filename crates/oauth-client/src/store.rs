//! Encrypted credential storage
//!
//! Two records live in a namespaced directory: the token pair and the cached
//! user profile. Each record is JSON sealed with AES-256-GCM; the file holds
//! `nonce || ciphertext || tag`, and the record key is bound in as associated
//! data so a blob cannot be swapped between slots.
//!
//! The encryption key comes from a `KeyProvider` (the platform's secure key
//! facility). It is acquired on first use and cached for the life of the
//! store. Writes are serialized by a tokio Mutex and land via temp-file +
//! rename, so concurrent readers never observe a torn blob.
//!
//! Corrupt or undecryptable records load as absent: a damaged store reads as
//! "logged out" rather than an error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::Secret;
use rand::RngExt;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::constants::{TOKENS_KEY, USER_KEY};
use crate::error::{Error, Result};
use crate::types::{TokenPair, UserProfile};

/// Length of the AES-256 key in bytes.
pub const KEY_LEN: usize = 32;

/// Source of the store's encryption key.
///
/// Implementations return the same key on every call for a given install,
/// creating it on first use.
pub trait KeyProvider: Send + Sync {
    fn load_or_create_key(&self) -> Result<Secret<[u8; KEY_LEN]>>;

    /// Name of this key source, for logs.
    fn name(&self) -> &str;
}

/// Key kept in a 0600 file beside the store.
///
/// Fallback for hosts without a system keychain.
#[derive(Debug, Clone)]
pub struct FileKeyProvider {
    path: PathBuf,
}

impl FileKeyProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl KeyProvider for FileKeyProvider {
    fn load_or_create_key(&self) -> Result<Secret<[u8; KEY_LEN]>> {
        if self.path.exists() {
            let bytes = std::fs::read(&self.path)
                .map_err(|e| Error::Storage(format!("reading key file: {e}")))?;
            let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
                Error::Storage(format!(
                    "key file {} has {} bytes, expected {KEY_LEN}",
                    self.path.display(),
                    bytes.len()
                ))
            })?;
            return Ok(Secret::new(key));
        }

        if let Some(dir) = self.path.parent() {
            create_private_dir(dir)?;
        }
        let key = random_key();
        write_private_file(&self.path, key.expose())?;
        info!(path = %self.path.display(), "generated credential encryption key");
        Ok(key)
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// Key kept in the OS keychain (macOS Keychain, Secret Service, Windows
/// Credential Manager), stored base64-encoded.
#[cfg(feature = "keyring")]
#[derive(Debug, Clone)]
pub struct KeyringKeyProvider {
    service: String,
    user: String,
}

#[cfg(feature = "keyring")]
impl KeyringKeyProvider {
    pub fn new(service: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            user: user.into(),
        }
    }
}

#[cfg(feature = "keyring")]
impl KeyProvider for KeyringKeyProvider {
    fn load_or_create_key(&self) -> Result<Secret<[u8; KEY_LEN]>> {
        use base64::Engine;
        use base64::engine::general_purpose::STANDARD;

        let entry = keyring::Entry::new(&self.service, &self.user)
            .map_err(|e| Error::Storage(format!("opening keychain entry: {e}")))?;
        match entry.get_password() {
            Ok(encoded) => {
                let bytes = STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| Error::Storage(format!("decoding keychain key: {e}")))?;
                let key: [u8; KEY_LEN] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage("keychain key has wrong length".into()))?;
                Ok(Secret::new(key))
            }
            Err(keyring::Error::NoEntry) => {
                let key = random_key();
                entry
                    .set_password(&STANDARD.encode(key.expose()))
                    .map_err(|e| Error::Storage(format!("saving keychain key: {e}")))?;
                info!(service = %self.service, "generated credential encryption key in keychain");
                Ok(key)
            }
            Err(e) => Err(Error::Storage(format!("reading keychain key: {e}"))),
        }
    }

    fn name(&self) -> &str {
        "keyring"
    }
}

/// Persisted form of a `TokenPair`.
#[derive(Serialize, Deserialize)]
struct StoredTokens {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    /// Unix milliseconds
    issued_at: u64,
}

impl From<&TokenPair> for StoredTokens {
    fn from(pair: &TokenPair) -> Self {
        Self {
            access_token: pair.access_token().to_string(),
            refresh_token: pair.refresh_token().to_string(),
            expires_in: pair.expires_in(),
            issued_at: pair.issued_at_millis(),
        }
    }
}

impl From<StoredTokens> for TokenPair {
    fn from(stored: StoredTokens) -> Self {
        TokenPair::issued_at(
            stored.access_token,
            stored.refresh_token,
            stored.expires_in,
            std::time::UNIX_EPOCH + std::time::Duration::from_millis(stored.issued_at),
        )
    }
}

/// Encrypted token/profile store.
pub struct TokenStore {
    dir: PathBuf,
    keys: Arc<dyn KeyProvider>,
    key: OnceCell<LessSafeKey>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("dir", &self.dir)
            .field("keys", &self.keys.name())
            .finish_non_exhaustive()
    }
}

impl TokenStore {
    /// Store rooted at `dir` (the namespace directory) with the given key source.
    pub fn new(dir: impl Into<PathBuf>, keys: Arc<dyn KeyProvider>) -> Self {
        Self {
            dir: dir.into(),
            keys,
            key: OnceCell::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store whose key lives in `.store.key` inside `dir`.
    pub fn with_file_key(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let keys = Arc::new(FileKeyProvider::new(dir.join(".store.key")));
        Self::new(dir, keys)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist the token pair and profile, replacing both prior records.
    /// A `None` profile removes any cached one.
    pub async fn save(&self, tokens: &TokenPair, user: Option<&UserProfile>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        // The previous profile must never sit next to new tokens
        remove_if_exists(&self.record_path(USER_KEY)).await?;
        self.write_record(TOKENS_KEY, &StoredTokens::from(tokens))
            .await?;
        if let Some(user) = user {
            self.write_record(USER_KEY, user).await?;
        }
        debug!(dir = %self.dir.display(), "saved session");
        Ok(())
    }

    /// Replace only the token record (after a refresh).
    pub async fn save_tokens(&self, tokens: &TokenPair) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_record(TOKENS_KEY, &StoredTokens::from(tokens))
            .await
    }

    /// Replace only the cached profile (after a profile refresh).
    pub async fn save_user(&self, user: &UserProfile) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_record(USER_KEY, user).await
    }

    /// Whatever was last saved. Missing, corrupt, or undecryptable records
    /// come back as `None`.
    pub async fn load(&self) -> (Option<TokenPair>, Option<UserProfile>) {
        let tokens = self
            .read_record::<StoredTokens>(TOKENS_KEY)
            .await
            .map(TokenPair::from);
        let user = self.read_record::<UserProfile>(USER_KEY).await;
        (tokens, user)
    }

    /// Remove both records. Idempotent.
    ///
    /// Both removals are attempted even if the first fails; the first error
    /// is returned.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let tokens = remove_if_exists(&self.record_path(TOKENS_KEY)).await;
        let user = remove_if_exists(&self.record_path(USER_KEY)).await;
        debug!(dir = %self.dir.display(), "cleared session");
        tokens.and(user)
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.enc"))
    }

    async fn cipher(&self) -> Result<&LessSafeKey> {
        self.key
            .get_or_try_init(|| async {
                let key = self.keys.load_or_create_key()?;
                let unbound = UnboundKey::new(&AES_256_GCM, key.expose())
                    .map_err(|_| Error::Storage("invalid encryption key".into()))?;
                debug!(source = self.keys.name(), "loaded credential encryption key");
                Ok::<_, Error>(LessSafeKey::new(unbound))
            })
            .await
    }

    async fn write_record<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let plaintext = serde_json::to_vec(value)
            .map_err(|e| Error::Storage(format!("serializing {key}: {e}")))?;
        let blob = seal(self.cipher().await?, key, plaintext)?;

        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || create_private_dir(&dir))
            .await
            .map_err(|e| Error::Storage(format!("creating store directory: {e}")))??;
        write_atomic(&self.record_path(key), &blob).await
    }

    async fn read_record<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        let path = self.record_path(key);
        let blob = match tokio::fs::read(&path).await {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable record, treating as absent");
                return None;
            }
        };

        let cipher = match self.cipher().await {
            Ok(cipher) => cipher,
            Err(e) => {
                warn!(error = %e, "encryption key unavailable, treating store as empty");
                return None;
            }
        };

        let plaintext = match open(cipher, key, blob) {
            Some(plaintext) => plaintext,
            None => {
                warn!(path = %path.display(), "record failed to decrypt, treating as absent");
                return None;
            }
        };

        match serde_json::from_slice(&plaintext) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "record failed to decode, treating as absent");
                None
            }
        }
    }
}

fn random_key() -> Secret<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    rand::rng().fill(&mut key);
    Secret::new(key)
}

/// `nonce || ciphertext || tag`, with the record key as associated data.
fn seal(cipher: &LessSafeKey, key: &str, mut plaintext: Vec<u8>) -> Result<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rng().fill(&mut nonce_bytes);
    cipher
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(key.as_bytes()),
            &mut plaintext,
        )
        .map_err(|_| Error::Storage(format!("encrypting {key}")))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + plaintext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&plaintext);
    Ok(blob)
}

fn open(cipher: &LessSafeKey, key: &str, mut blob: Vec<u8>) -> Option<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return None;
    }
    let mut sealed = blob.split_off(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(&blob).ok()?;
    let plaintext = cipher
        .open_in_place(nonce, Aad::from(key.as_bytes()), &mut sealed)
        .ok()?;
    Some(plaintext.to_vec())
}

fn create_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::Storage(format!("creating {}: {e}", dir.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| Error::Storage(format!("setting store directory permissions: {e}")))?;
    }
    Ok(())
}

fn write_private_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).map_err(|e| Error::Storage(format!("writing key file: {e}")))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::Storage(format!("setting key file permissions: {e}")))?;
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Storage(format!("removing {}: {e}", path.display()))),
    }
}

/// Write a record atomically.
///
/// Writes to a temporary file in the same directory with 0600 permissions,
/// then renames it over the target.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Storage("record path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| Error::Storage(format!("writing temp record: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Storage(format!("setting record permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Storage(format!("renaming temp record: {e}")))?;

    debug!(path = %path.display(), "persisted record");
    Ok(())
}
