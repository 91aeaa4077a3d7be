//! Credential vault
//!
//! Connection profiles encrypted at rest. Two files live under the vault
//! directory:
//!
//! - `vault.key`: the raw 256-bit key, generated on first open
//! - `profiles.enc`: the sealed JSON mapping `{name: profile}`; each
//!   profile's `password` field is itself sealed and base64-encoded
//!
//! Losing the key file makes the data file permanently unreadable.
//!
//! Public operations never return errors: failures are logged and reported
//! as `bool` / `Option`. [`Vault::status`] tells a caller why the mapping
//! looks empty.

pub mod cipher;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use cipher::{CipherError, VaultCipher};

const KEY_FILE: &str = "vault.key";
const DATA_FILE: &str = "profiles.enc";

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Key file {path} is unusable: {reason}")]
    KeyFile { path: PathBuf, reason: String },

    #[error("Vault data is corrupt: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<CipherError> for VaultError {
    fn from(e: CipherError) -> Self {
        VaultError::Corrupt(e.to_string())
    }
}

type Result<T> = std::result::Result<T, VaultError>;

/// A connection profile. `secret` is plaintext in memory only.
#[derive(Clone, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    pub description: String,
    pub created: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

impl Profile {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: 22,
            username: username.into(),
            secret: secret.into(),
            description: String::new(),
            created: None,
            last_used: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl std::fmt::Debug for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profile")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .field("description", &self.description)
            .field("created", &self.created)
            .field("last_used", &self.last_used)
            .finish()
    }
}

/// On-disk form of a profile
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredProfile {
    name: String,
    host: String,
    username: String,
    /// Sealed secret, base64
    password: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    description: String,
    #[serde(default)]
    created: Option<DateTime<Utc>>,
    #[serde(default)]
    last_used: Option<DateTime<Utc>>,
}

fn default_port() -> u16 {
    22
}

impl StoredProfile {
    fn recency(&self) -> Option<DateTime<Utc>> {
        self.last_used.or(self.created)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOrder {
    /// Order in which names were first saved
    Insertion,
    /// Most recently used first (last_used, else created); undated entries last
    Recent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultStatus {
    /// No data file yet
    Empty,
    /// Data file readable, holding this many profiles
    Loaded(usize),
    /// Data file present but unreadable
    Corrupt(String),
}

pub struct Vault {
    dir: PathBuf,
    data_path: PathBuf,
    cipher: VaultCipher,
    /// Serializes read-modify-write cycles on the data file
    write_lock: Mutex<()>,
}

impl Vault {
    /// Open the vault in `dir`, creating the directory and key as needed.
    ///
    /// Fails if an existing key file cannot be read or has the wrong size.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let key_path = dir.join(KEY_FILE);
        let cipher = if key_path.exists() {
            let key = fs::read(&key_path).map_err(|e| VaultError::KeyFile {
                path: key_path.clone(),
                reason: e.to_string(),
            })?;
            VaultCipher::from_key(&key).map_err(|e| VaultError::KeyFile {
                path: key_path.clone(),
                reason: e.to_string(),
            })?
        } else {
            let key = cipher::generate_key();
            write_private(&key_path, &key)?;
            info!("Generated new vault key at {}", key_path.display());
            VaultCipher::from_key(&key)?
        };

        Ok(Self {
            data_path: dir.join(DATA_FILE),
            dir,
            cipher,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn read_mapping(&self) -> Result<Map<String, Value>> {
        read_sealed(&self.cipher, &self.data_path)
    }

    /// The mapping, or empty if missing or corrupt.
    fn mapping_or_empty(&self) -> Map<String, Value> {
        match self.read_mapping() {
            Ok(mapping) => mapping,
            Err(e) => {
                warn!("Vault unreadable, treating as empty: {}", e);
                Map::new()
            }
        }
    }

    /// Seal and atomically replace the data file.
    fn write_mapping(&self, mapping: &Map<String, Value>) -> Result<()> {
        write_sealed(&self.cipher, &self.data_path, mapping)
    }

    /// Read-modify-write under the writer lock. `f` returns whether to write.
    fn modify<F>(&self, op: &str, f: F) -> bool
    where
        F: FnOnce(&mut Map<String, Value>) -> Result<bool>,
    {
        let _guard = self.lock();
        let result = self.read_mapping().and_then(|mut mapping| {
            if f(&mut mapping)? {
                self.write_mapping(&mapping)?;
                Ok(true)
            } else {
                Ok(false)
            }
        });
        match result {
            Ok(changed) => changed,
            Err(e) => {
                warn!("Vault {} failed: {}", op, e);
                false
            }
        }
    }

    /// Save `profile`, replacing any entry with the same name.
    ///
    /// An existing entry's `last_used` survives unless `profile.last_used`
    /// is set. Refuses to write over a corrupt data file.
    pub fn save(&self, profile: &Profile) -> bool {
        let saved = self.modify("save", |mapping| {
            let previous_last_used = mapping
                .get(&profile.name)
                .and_then(|v| serde_json::from_value::<StoredProfile>(v.clone()).ok())
                .and_then(|p| p.last_used);

            let stored = StoredProfile {
                name: profile.name.clone(),
                host: profile.host.clone(),
                username: profile.username.clone(),
                password: self.cipher.seal_text(&profile.secret)?,
                port: profile.port,
                description: profile.description.clone(),
                created: profile.created.or_else(|| Some(Utc::now())),
                last_used: profile.last_used.or(previous_last_used),
            };
            mapping.insert(profile.name.clone(), serde_json::to_value(stored)?);
            Ok(true)
        });
        if saved {
            debug!("Saved profile {}", profile.name);
        }
        saved
    }

    /// Load one profile with its secret decrypted.
    ///
    /// A damaged entry yields `None` without affecting the others.
    pub fn load(&self, name: &str) -> Option<Profile> {
        let mapping = self.mapping_or_empty();
        let value = mapping.get(name)?;
        let stored: StoredProfile = match serde_json::from_value(value.clone()) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Profile {} is malformed: {}", name, e);
                return None;
            }
        };
        let secret = match self.cipher.open_text(&stored.password) {
            Ok(secret) => secret,
            Err(e) => {
                warn!("Secret for profile {} is corrupt: {}", name, e);
                return None;
            }
        };
        Some(Profile {
            name: stored.name,
            host: stored.host,
            port: stored.port,
            username: stored.username,
            secret,
            description: stored.description,
            created: stored.created,
            last_used: stored.last_used,
        })
    }

    pub fn list(&self, order: ListOrder) -> Vec<String> {
        let mapping = self.mapping_or_empty();
        match order {
            ListOrder::Insertion => mapping.keys().cloned().collect(),
            ListOrder::Recent => {
                let mut dated: Vec<(String, Option<DateTime<Utc>>)> = mapping
                    .iter()
                    .map(|(name, value)| {
                        let recency = serde_json::from_value::<StoredProfile>(value.clone())
                            .ok()
                            .and_then(|p| p.recency());
                        (name.clone(), recency)
                    })
                    .collect();
                // None sorts below Some, so descending puts undated entries last
                dated.sort_by(|a, b| b.1.cmp(&a.1));
                dated.into_iter().map(|(name, _)| name).collect()
            }
        }
    }

    /// Name of the most recently used profile
    pub fn most_recent(&self) -> Option<String> {
        self.list(ListOrder::Recent).into_iter().next()
    }

    pub fn delete(&self, name: &str) -> bool {
        self.modify("delete", |mapping| Ok(mapping.shift_remove(name).is_some()))
    }

    /// Stamp `last_used` with the current time.
    pub fn mark_used(&self, name: &str) -> bool {
        self.modify("mark_used", |mapping| {
            let Some(entry) = mapping.get_mut(name).and_then(Value::as_object_mut) else {
                return Ok(false);
            };
            entry.insert("last_used".to_string(), serde_json::to_value(Utc::now())?);
            Ok(true)
        })
    }

    /// Write the whole mapping, sealed with this vault's key, to `path`.
    pub fn export(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let result = self
            .read_mapping()
            .and_then(|mapping| write_sealed(&self.cipher, path, &mapping));
        match result {
            Ok(()) => {
                info!("Exported profiles to {}", path.display());
                true
            }
            Err(e) => {
                warn!("Vault export failed: {}", e);
                false
            }
        }
    }

    /// Merge a file written by [`export`](Self::export). Imported entries
    /// replace same-named ones.
    pub fn import(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let imported = match read_sealed(&self.cipher, path) {
            Ok(mapping) if path.exists() => mapping,
            Ok(_) => {
                warn!("Vault import failed: {} does not exist", path.display());
                return false;
            }
            Err(e) => {
                warn!("Vault import failed: {}", e);
                return false;
            }
        };
        let count = imported.len();
        let merged = self.modify("import", |mapping| {
            for (name, value) in imported {
                mapping.insert(name, value);
            }
            Ok(true)
        });
        if merged {
            info!("Imported {} profiles from {}", count, path.display());
        }
        merged
    }

    pub fn status(&self) -> VaultStatus {
        if !self.data_path.exists() {
            return VaultStatus::Empty;
        }
        match self.read_mapping() {
            Ok(mapping) => VaultStatus::Loaded(mapping.len()),
            Err(e) => VaultStatus::Corrupt(e.to_string()),
        }
    }

    /// Delete the data file. The key is kept.
    pub fn reset(&self) -> bool {
        let _guard = self.lock();
        match fs::remove_file(&self.data_path) {
            Ok(()) => {
                info!("Vault data reset");
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!("Vault reset failed: {}", e);
                false
            }
        }
    }
}

/// Missing file is an empty mapping.
fn read_sealed(cipher: &VaultCipher, path: &Path) -> Result<Map<String, Value>> {
    let blob = match fs::read(path) {
        Ok(blob) => blob,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => return Err(e.into()),
    };
    let plain = cipher.open(&blob)?;
    match serde_json::from_slice::<Value>(&plain) {
        Ok(Value::Object(mapping)) => Ok(mapping),
        Ok(_) => Err(VaultError::Corrupt("mapping is not an object".to_string())),
        Err(e) => Err(VaultError::Corrupt(e.to_string())),
    }
}

fn write_sealed(cipher: &VaultCipher, path: &Path, mapping: &Map<String, Value>) -> Result<()> {
    let json = serde_json::to_vec_pretty(mapping)?;
    let blob = cipher.seal(&json)?;

    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    write_private(&tmp_path, &blob)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Write a file readable by the owner only.
fn write_private(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn vault() -> (TempDir, Vault) {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        (dir, vault)
    }

    fn profile(name: &str) -> Profile {
        Profile::new(name, format!("{}.example.com", name), "deploy", format!("pw-{}", name))
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_dir, vault) = vault();
        let saved = profile("web").with_port(2222).with_description("frontend");
        assert!(vault.save(&saved));

        let loaded = vault.load("web").unwrap();
        assert_eq!(loaded.secret, "pw-web");
        assert_eq!(loaded.host, "web.example.com");
        assert_eq!(loaded.port, 2222);
        assert_eq!(loaded.username, "deploy");
        assert_eq!(loaded.description, "frontend");
        assert!(loaded.created.is_some());
        assert_eq!(loaded.last_used, None);
        assert!(vault.load("missing").is_none());
    }

    #[test]
    fn test_secret_not_stored_in_plaintext() {
        let (dir, vault) = vault();
        vault.save(&profile("web"));
        let raw = fs::read(dir.path().join(DATA_FILE)).unwrap();
        assert!(!raw.windows(6).any(|w| w == b"pw-web"));
        assert!(!raw.windows(15).any(|w| w == b"web.example.com"));
    }

    #[test]
    fn test_reopen_uses_same_key() {
        let dir = TempDir::new().unwrap();
        Vault::open(dir.path()).unwrap().save(&profile("db"));
        let reopened = Vault::open(dir.path()).unwrap();
        assert_eq!(reopened.load("db").unwrap().secret, "pw-db");
    }

    #[test]
    fn test_bad_key_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(KEY_FILE), b"short").unwrap();
        assert!(matches!(Vault::open(dir.path()), Err(VaultError::KeyFile { .. })));
    }

    #[test]
    fn test_save_preserves_last_used() {
        let (_dir, vault) = vault();
        vault.save(&profile("web"));
        assert!(vault.mark_used("web"));
        let used = vault.load("web").unwrap().last_used;
        assert!(used.is_some());

        let updated = Profile::new("web", "new.example.com", "root", "changed");
        assert!(vault.save(&updated));
        let loaded = vault.load("web").unwrap();
        assert_eq!(loaded.host, "new.example.com");
        assert_eq!(loaded.secret, "changed");
        assert_eq!(loaded.last_used, used);

        // Explicit last_used wins
        let stamp = Utc::now() - Duration::days(3);
        let mut explicit = updated.clone();
        explicit.last_used = Some(stamp);
        vault.save(&explicit);
        assert_eq!(vault.load("web").unwrap().last_used, Some(stamp));
    }

    #[test]
    fn test_list_tracks_saves_and_deletes() {
        let (_dir, vault) = vault();
        for name in ["c", "a", "b"] {
            vault.save(&profile(name));
        }
        vault.save(&profile("a"));
        assert_eq!(vault.list(ListOrder::Insertion), vec!["c", "a", "b"]);

        assert!(vault.delete("a"));
        assert!(!vault.delete("a"));
        assert_eq!(vault.list(ListOrder::Insertion), vec!["c", "b"]);

        vault.save(&profile("a"));
        assert_eq!(vault.list(ListOrder::Insertion), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_list_by_recent() {
        let (_dir, vault) = vault();
        let now = Utc::now();
        let mut old = profile("old");
        old.created = Some(now - Duration::days(10));
        let mut used = profile("used");
        used.created = Some(now - Duration::days(20));
        used.last_used = Some(now - Duration::days(1));
        let mut fresh = profile("fresh");
        fresh.created = Some(now - Duration::days(5));

        vault.save(&old);
        vault.save(&used);
        vault.save(&fresh);
        assert_eq!(vault.list(ListOrder::Recent), vec!["used", "fresh", "old"]);
        assert_eq!(vault.most_recent().as_deref(), Some("used"));

        assert!(vault.mark_used("old"));
        assert_eq!(vault.most_recent().as_deref(), Some("old"));
        assert!(!vault.mark_used("nobody"));
    }

    #[test]
    fn test_undated_entries_sort_last() {
        let (_dir, vault) = vault();
        vault.save(&profile("dated"));
        let undated = serde_json::json!({
            "name": "undated",
            "host": "h",
            "username": "u",
            "password": vault.cipher.seal_text("x").unwrap(),
        });
        let mut mapping = Map::new();
        mapping.insert("undated".to_string(), undated);
        mapping.extend(vault.read_mapping().unwrap());
        vault.write_mapping(&mapping).unwrap();

        assert_eq!(vault.list(ListOrder::Insertion), vec!["undated", "dated"]);
        assert_eq!(vault.list(ListOrder::Recent), vec!["dated", "undated"]);
        assert_eq!(vault.load("undated").unwrap().port, 22);
    }

    #[test]
    fn test_flipped_byte_fails_gracefully() {
        let (dir, vault) = vault();
        vault.save(&profile("web"));
        let path = dir.path().join(DATA_FILE);
        let mut raw = fs::read(&path).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0xff;
        fs::write(&path, &raw).unwrap();

        assert!(vault.load("web").is_none());
        assert!(vault.list(ListOrder::Insertion).is_empty());
        assert!(matches!(vault.status(), VaultStatus::Corrupt(_)));
        // Corrupt data is not silently replaced
        assert!(!vault.save(&profile("db")));
        assert_eq!(fs::read(&path).unwrap(), raw);

        assert!(vault.reset());
        assert_eq!(vault.status(), VaultStatus::Empty);
        assert!(vault.save(&profile("db")));
        assert_eq!(vault.status(), VaultStatus::Loaded(1));
    }

    #[test]
    fn test_corrupt_secret_isolated_per_entry() {
        let (_dir, vault) = vault();
        vault.save(&profile("good"));
        vault.save(&profile("bad"));

        let mut mapping = vault.read_mapping().unwrap();
        let bad = mapping.get_mut("bad").and_then(Value::as_object_mut).unwrap();
        bad.insert("password".to_string(), Value::String("AAAA".to_string()));
        vault.write_mapping(&mapping).unwrap();

        assert!(vault.load("bad").is_none());
        assert_eq!(vault.load("good").unwrap().secret, "pw-good");
        assert_eq!(vault.list(ListOrder::Insertion), vec!["good", "bad"]);
    }

    #[test]
    fn test_export_import_merges() {
        let (_dir_a, a) = vault();
        a.save(&profile("shared"));
        a.save(&profile("only-a"));

        let export_dir = TempDir::new().unwrap();
        let export_path = export_dir.path().join("profiles.export");
        assert!(a.export(&export_path));

        // Same key directory, different data
        let dir_b = TempDir::new().unwrap();
        fs::copy(_dir_a.path().join(KEY_FILE), dir_b.path().join(KEY_FILE)).unwrap();
        let b = Vault::open(dir_b.path()).unwrap();
        let mut local = profile("shared");
        local.secret = "local".to_string();
        b.save(&local);
        b.save(&profile("only-b"));

        assert!(b.import(&export_path));
        assert_eq!(b.list(ListOrder::Insertion), vec!["shared", "only-b", "only-a"]);
        assert_eq!(b.load("shared").unwrap().secret, "pw-shared");

        assert!(!b.import(export_dir.path().join("missing")));
    }

    #[test]
    fn test_import_with_foreign_key_rejected() {
        let (_dir_a, a) = vault();
        a.save(&profile("x"));
        let export_dir = TempDir::new().unwrap();
        let export_path = export_dir.path().join("profiles.export");
        a.export(&export_path);

        let (_dir_b, b) = vault();
        assert!(!b.import(&export_path));
        assert_eq!(b.status(), VaultStatus::Empty);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", profile("web"));
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("pw-web"));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, _vault) = vault();
        let mode = fs::metadata(dir.path().join(KEY_FILE)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
