use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::redaction::mask_secret;

const KEYRING_SERVICE: &str = "loom-ai";

/// A single stored API key, persisted (without `key_value` masked) to
/// `keys.json` under the configured directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyInfo {
    pub provider: String,
    pub key_id: String,
    pub key_value: String,
    #[serde(default = "default_key_type")]
    pub key_type: String,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default = "default_is_active")]
    pub is_active: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_key_type() -> String {
    "api_key".to_string()
}

fn default_is_active() -> bool {
    true
}

impl ApiKeyInfo {
    pub fn masked(&self) -> String {
        mask_secret(&self.key_value)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyFile {
    keys: Vec<ApiKeyInfo>,
    updated_at: Option<DateTime<Utc>>,
}

/// Manages provider API keys with three layers of precedence, matching the
/// BYOK (bring-your-own-key) design this is grounded on: environment
/// variable, then the on-disk store (`keys.json`), then the OS keyring.
pub struct KeyStore {
    config_dir: PathBuf,
    keys: HashMap<String, ApiKeyInfo>,
}

impl KeyStore {
    pub fn new(config_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let config_dir = config_dir.into();
        std::fs::create_dir_all(&config_dir)?;
        let mut store = Self {
            config_dir,
            keys: HashMap::new(),
        };
        store.load()?;
        Ok(store)
    }

    fn key_file_path(&self) -> PathBuf {
        self.config_dir.join("keys.json")
    }

    fn load(&mut self) -> std::io::Result<()> {
        let path = self.key_file_path();
        if !path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(&path)?;
        match serde_json::from_str::<KeyFile>(&raw) {
            Ok(file) => {
                for key in file.keys {
                    self.keys.insert(key.key_id.clone(), key);
                }
                info!("loaded {} keys from {:?}", self.keys.len(), path);
            }
            Err(e) => warn!("failed to parse key store at {:?}: {}", path, e),
        }
        Ok(())
    }

    fn save(&self) -> std::io::Result<()> {
        let path = self.key_file_path();
        let file = KeyFile {
            keys: self.keys.values().cloned().collect(),
            updated_at: Some(Utc::now()),
        };
        let serialized = serde_json::to_string_pretty(&file)?;
        std::fs::write(&path, serialized)?;
        set_owner_only_permissions(&path)?;
        debug!("saved {} keys to {:?}", self.keys.len(), path);
        Ok(())
    }

    fn generate_key_id(provider: &str, key_value: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(provider.as_bytes());
        hasher.update(b":");
        hasher.update(key_value.as_bytes());
        let digest = hasher.finalize();
        hex::encode(digest)[..16].to_string()
    }

    /// Add or update a key for `provider`, persisting to disk and
    /// best-effort mirroring into the OS keyring.
    pub fn add_key(&mut self, provider: &str, key_value: &str) -> std::io::Result<String> {
        let key_id = Self::generate_key_id(provider, key_value);
        match self.keys.get_mut(&key_id) {
            Some(existing) => {
                existing.key_value = key_value.to_string();
                existing.last_used = Some(Utc::now());
                existing.is_active = true;
            }
            None => {
                self.keys.insert(
                    key_id.clone(),
                    ApiKeyInfo {
                        provider: provider.to_string(),
                        key_id: key_id.clone(),
                        key_value: key_value.to_string(),
                        key_type: default_key_type(),
                        created_at: Utc::now(),
                        last_used: None,
                        usage_count: 0,
                        is_active: true,
                        metadata: HashMap::new(),
                    },
                );
            }
        }
        self.save()?;
        self.save_to_keyring(provider, key_value);
        Ok(key_id)
    }

    fn save_to_keyring(&self, provider: &str, key_value: &str) {
        match keyring::Entry::new(KEYRING_SERVICE, provider) {
            Ok(entry) => {
                if let Err(e) = entry.set_password(key_value) {
                    warn!("failed to save key for {} to system keyring: {}", provider, e);
                }
            }
            Err(e) => warn!("failed to open keyring entry for {}: {}", provider, e),
        }
    }

    /// Look up a key for `provider`: environment variable first
    /// (`<PROVIDER>_API_KEY`), then the on-disk store, then the OS keyring.
    pub fn get_key(&mut self, provider: &str) -> Option<String> {
        let env_var = format!("{}_API_KEY", provider.to_uppercase());
        if let Ok(value) = std::env::var(&env_var) {
            if !value.is_empty() {
                debug!("using key for {} from environment", provider);
                return Some(value);
            }
        }

        let matching_id = self
            .keys
            .values()
            .filter(|k| k.provider == provider && k.is_active)
            .max_by_key(|k| k.last_used.unwrap_or(k.created_at))
            .map(|k| k.key_id.clone());

        if let Some(key_id) = matching_id {
            if let Some(key) = self.keys.get_mut(&key_id) {
                key.last_used = Some(Utc::now());
                key.usage_count += 1;
                let value = key.key_value.clone();
                let _ = self.save();
                return Some(value);
            }
        }

        match keyring::Entry::new(KEYRING_SERVICE, provider) {
            Ok(entry) => match entry.get_password() {
                Ok(value) => {
                    debug!("using key for {} from system keyring", provider);
                    Some(value)
                }
                Err(_) => {
                    warn!("no active key found for provider {}", provider);
                    None
                }
            },
            Err(_) => None,
        }
    }

    pub fn disable_key(&mut self, key_id: &str) -> std::io::Result<bool> {
        if let Some(key) = self.keys.get_mut(key_id) {
            key.is_active = false;
            self.save()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn list_keys(&self, provider: Option<&str>) -> Vec<&ApiKeyInfo> {
        let mut keys: Vec<&ApiKeyInfo> = self
            .keys
            .values()
            .filter(|k| provider.map(|p| p == k.provider).unwrap_or(true))
            .collect();
        keys.sort_by_key(|k| std::cmp::Reverse(k.last_used.unwrap_or(k.created_at)));
        keys
    }
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_get_key_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = KeyStore::new(dir.path()).unwrap();
        store.add_key("openai", "sk-test-value-123").unwrap();
        assert_eq!(store.get_key("openai"), Some("sk-test-value-123".to_string()));
    }

    #[test]
    fn env_var_takes_precedence_over_stored_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = KeyStore::new(dir.path()).unwrap();
        store.add_key("openai", "sk-stored").unwrap();
        std::env::set_var("OPENAI_API_KEY", "sk-from-env");
        let key = store.get_key("openai");
        std::env::remove_var("OPENAI_API_KEY");
        assert_eq!(key, Some("sk-from-env".to_string()));
    }

    #[test]
    fn disabled_key_is_not_returned() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = KeyStore::new(dir.path()).unwrap();
        let key_id = store.add_key("openai", "sk-disable-me").unwrap();
        store.disable_key(&key_id).unwrap();
        assert_eq!(store.get_key("openai"), None);
    }

    #[test]
    #[cfg(unix)]
    fn key_file_has_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let mut store = KeyStore::new(dir.path()).unwrap();
        store.add_key("openai", "sk-perm-check").unwrap();
        let meta = std::fs::metadata(dir.path().join("keys.json")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
