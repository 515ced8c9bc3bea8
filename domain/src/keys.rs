//! API key management: authentication, issuance, partial updates, and the
//! root key bootstrap.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use uuid::Uuid;

use crate::{ApiKey, AuthContext, Clock, CoreError, Field, KeyRepository, MAX_KEY_NAME_LEN, ROOT_KEY_NAME};

/// Partial update of a key. Absent fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyUpdate {
    pub name: Field<String>,
    pub is_active: Field<bool>,
    pub is_admin: Field<bool>,
}

/// Outcome of [`KeyStore::bootstrap_root`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bootstrap {
    Existing,
    Created,
}

/// 32 random bytes, URL-safe base64 without padding.
pub fn secret_token() -> String {
    let mut buf = [0u8; 32];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

fn placeholder_name() -> String {
    let mut buf = [0u8; 6];
    OsRng.fill_bytes(&mut buf);
    format!("User {}", URL_SAFE_NO_PAD.encode(buf))
}

fn check_name_len(name: &str) -> Result<(), CoreError> {
    if name.chars().count() > MAX_KEY_NAME_LEN {
        return Err(CoreError::InvalidKeyName("new key name is too long".into()));
    }
    Ok(())
}

/// Redact a secret for logs: first four characters only.
pub fn redact(secret: &str) -> String {
    let head: String = secret.chars().take(4).collect();
    format!("{head}…")
}

pub struct KeyStore<K: KeyRepository, C: Clock> {
    repo: K,
    clock: C,
}

impl<K: KeyRepository, C: Clock> KeyStore<K, C> {
    pub fn new(repo: K, clock: C) -> Self {
        Self { repo, clock }
    }

    /// Resolve a raw key presented by a caller. Unknown and inactive keys are
    /// both `Unauthorized`. Stamps `last_used_at` on success.
    pub fn authenticate(&self, raw: &str) -> Result<AuthContext, CoreError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CoreError::Unauthorized);
        }
        let key = match self.repo.find_by_key(raw)? {
            Some(k) if k.is_active => k,
            _ => return Err(CoreError::Unauthorized),
        };
        self.repo.touch_key(key.id, self.clock.now())?;
        Ok(AuthContext {
            key_id: key.id,
            key: key.key,
            name: key.name,
            is_admin: key.is_admin,
        })
    }

    pub fn find_by_key(&self, raw: &str) -> Result<ApiKey, CoreError> {
        self.repo.find_by_key(raw)?.ok_or(CoreError::NotFound)
    }

    pub fn find_by_name(&self, name: &str) -> Result<ApiKey, CoreError> {
        self.repo.find_by_name(name)?.ok_or(CoreError::NotFound)
    }

    pub fn list(&self) -> Result<Vec<ApiKey>, CoreError> {
        self.repo.list_keys()
    }

    /// Issue a new key. An empty name gets a random `User xxxxxxxx` placeholder.
    pub fn create(&self, name: &str, is_admin: bool) -> Result<ApiKey, CoreError> {
        check_name_len(name)?;
        if name == ROOT_KEY_NAME {
            return Err(CoreError::KeyNameTaken);
        }
        let name = if name.is_empty() {
            placeholder_name()
        } else {
            name.to_string()
        };
        if self.repo.find_by_name(&name)?.is_some() {
            return Err(CoreError::KeyNameTaken);
        }

        let now = self.clock.now();
        let key = ApiKey {
            id: Uuid::new_v4(),
            key: secret_token(),
            name,
            is_admin,
            is_active: true,
            created_at: now,
            updated_at: now,
            last_used_at: None,
        };
        match self.repo.insert_key(key.clone()) {
            Ok(()) => Ok(key),
            Err(CoreError::AlreadyExists) => Err(CoreError::KeyNameTaken),
            Err(e) => Err(e),
        }
    }

    /// Apply a partial update to the key whose secret is `target`.
    ///
    /// The root key can never be updated. An update that changes nothing
    /// fails with `NoFieldsToUpdate`.
    pub fn update(&self, target: &str, fields: KeyUpdate) -> Result<ApiKey, CoreError> {
        let mut key = self.find_by_key(target)?;
        if key.is_root() {
            return Err(CoreError::RootKeyProtected);
        }

        let mut changed = false;
        if let Field::Present(name) = fields.name {
            if name != key.name {
                if name.is_empty() {
                    return Err(CoreError::InvalidKeyName("key name required".into()));
                }
                check_name_len(&name)?;
                if name == ROOT_KEY_NAME || self.repo.find_by_name(&name)?.is_some() {
                    return Err(CoreError::KeyNameTaken);
                }
                key.name = name;
                changed = true;
            }
        }
        if let Field::Present(active) = fields.is_active {
            changed |= active != key.is_active;
            key.is_active = active;
        }
        if let Field::Present(admin) = fields.is_admin {
            changed |= admin != key.is_admin;
            key.is_admin = admin;
        }
        if !changed {
            return Err(CoreError::NoFieldsToUpdate);
        }

        key.updated_at = self.clock.now();
        match self.repo.update_key(&key) {
            Ok(()) => Ok(key),
            Err(CoreError::AlreadyExists) => Err(CoreError::KeyNameTaken),
            Err(e) => Err(e),
        }
    }

    /// Delete the key whose secret is `target`.
    pub fn delete(&self, target: &str) -> Result<(), CoreError> {
        let key = self.find_by_key(target)?;
        self.delete_record(&key)
    }

    pub fn delete_by_name(&self, name: &str) -> Result<(), CoreError> {
        let key = self.find_by_name(name)?;
        self.delete_record(&key)
    }

    fn delete_record(&self, key: &ApiKey) -> Result<(), CoreError> {
        if key.is_root() {
            return Err(CoreError::RootKeyProtected);
        }
        self.repo.delete_key(key.id)
    }

    /// Ensure the root key exists, creating it from `secret` if needed.
    pub fn bootstrap_root(&self, secret: Option<&str>) -> Result<Bootstrap, CoreError> {
        if self.repo.find_by_name(ROOT_KEY_NAME)?.is_some() {
            return Ok(Bootstrap::Existing);
        }
        let secret = secret
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(CoreError::MissingRootSecret)?;

        let now = self.clock.now();
        self.repo.insert_key(ApiKey {
            id: Uuid::new_v4(),
            key: secret.to_string(),
            name: ROOT_KEY_NAME.to_string(),
            is_admin: true,
            is_active: true,
            created_at: now,
            updated_at: now,
            last_used_at: None,
        })?;
        Ok(Bootstrap::Created)
    }
}
