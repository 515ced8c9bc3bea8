//! Storage selection: one enum over the available repositories, so the rest of
//! the server stays non-generic.

use std::sync::Arc;
use std::time::SystemTime;

use domain::adapters::memory_repo::InMemoryRepo;
use domain::{
    ApiKey, CoreError, KeyId, KeyRepository, Link, LinkId, LinkRepository, LinkVisit, ShortToken,
};

use crate::config::{Config, StorageProvider};

pub enum Store {
    Memory(InMemoryRepo),
    #[cfg(feature = "sqlite")]
    Sqlite(sqlite_adapter::SqliteRepo),
}

pub type SharedStore = Arc<Store>;

/// Forward a call to whichever repository is active.
macro_rules! dispatch {
    ($self:ident, $r:ident => $call:expr) => {
        match $self {
            Store::Memory($r) => $call,
            #[cfg(feature = "sqlite")]
            Store::Sqlite($r) => $call,
        }
    };
}

impl Store {
    pub fn memory() -> Self {
        Self::Memory(InMemoryRepo::new())
    }

    pub fn from_config(cfg: &Config) -> Result<Self, CoreError> {
        match cfg.storage_provider {
            #[cfg(feature = "sqlite")]
            StorageProvider::Sqlite => Ok(Self::Sqlite(sqlite_adapter::SqliteRepo::new(&cfg.db_path)?)),
            #[cfg(not(feature = "sqlite"))]
            StorageProvider::Sqlite => {
                tracing::warn!("built without the sqlite feature; using in-memory storage");
                Ok(Self::memory())
            }
            StorageProvider::Memory => Ok(Self::memory()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Store::Memory(_) => "memory",
            #[cfg(feature = "sqlite")]
            Store::Sqlite(_) => "sqlite",
        }
    }
}

impl KeyRepository for Store {
    fn find_by_key(&self, key: &str) -> Result<Option<ApiKey>, CoreError> {
        dispatch!(self, r => r.find_by_key(key))
    }
    fn find_by_name(&self, name: &str) -> Result<Option<ApiKey>, CoreError> {
        dispatch!(self, r => r.find_by_name(name))
    }
    fn find_by_id(&self, id: KeyId) -> Result<Option<ApiKey>, CoreError> {
        dispatch!(self, r => r.find_by_id(id))
    }
    fn list_keys(&self) -> Result<Vec<ApiKey>, CoreError> {
        dispatch!(self, r => r.list_keys())
    }
    fn insert_key(&self, key: ApiKey) -> Result<(), CoreError> {
        dispatch!(self, r => r.insert_key(key))
    }
    fn update_key(&self, key: &ApiKey) -> Result<(), CoreError> {
        dispatch!(self, r => r.update_key(key))
    }
    fn delete_key(&self, id: KeyId) -> Result<(), CoreError> {
        dispatch!(self, r => r.delete_key(id))
    }
    fn touch_key(&self, id: KeyId, at: SystemTime) -> Result<(), CoreError> {
        dispatch!(self, r => r.touch_key(id, at))
    }
}

impl LinkRepository for Store {
    fn get(&self, shortened: &ShortToken) -> Result<Option<Link>, CoreError> {
        dispatch!(self, r => r.get(shortened))
    }
    fn get_active(&self, shortened: &ShortToken) -> Result<Option<Link>, CoreError> {
        dispatch!(self, r => r.get_active(shortened))
    }
    fn insert(&self, link: Link) -> Result<(), CoreError> {
        dispatch!(self, r => r.insert(link))
    }
    fn update(&self, current: &ShortToken, link: &Link) -> Result<(), CoreError> {
        dispatch!(self, r => r.update(current, link))
    }
    fn delete(&self, id: LinkId) -> Result<(), CoreError> {
        dispatch!(self, r => r.delete(id))
    }
    fn list_all(&self) -> Result<Vec<Link>, CoreError> {
        dispatch!(self, r => r.list_all())
    }
    fn list_by_owner(&self, owner: KeyId) -> Result<Vec<Link>, CoreError> {
        dispatch!(self, r => r.list_by_owner(owner))
    }
    fn record_visit(&self, visit: LinkVisit) -> Result<(), CoreError> {
        dispatch!(self, r => r.record_visit(visit))
    }
    fn list_visits(&self, link_id: LinkId) -> Result<Vec<LinkVisit>, CoreError> {
        dispatch!(self, r => r.list_visits(link_id))
    }
    fn sweep_expired(
        &self,
        now: SystemTime,
        stale_before: SystemTime,
        prefix: &str,
    ) -> Result<usize, CoreError> {
        dispatch!(self, r => r.sweep_expired(now, stale_before, prefix))
    }
}
