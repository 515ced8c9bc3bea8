//! Domain library for the URL Shortener.
//!
//! Holds the domain types, ports (traits), and error definitions, plus the
//! services that drive the link lifecycle: key management, short-token
//! allocation, link CRUD with ownership checks, and the expiration sweep.
//! Keep adapters and IO concerns out of this crate.

use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;
use uuid::Uuid;

/// Name of the bootstrapped administrative key. Exactly one key carries it.
pub const ROOT_KEY_NAME: &str = "Root User";
/// Upper bound on API key names.
pub const MAX_KEY_NAME_LEN: usize = 100;
/// Upper bound on stored short tokens (including tombstoned ones).
pub const MAX_TOKEN_LEN: usize = 100;
/// Upper bound on normalized redirect targets.
pub const MAX_URL_LEN: usize = 2048;

pub type KeyId = Uuid;
pub type LinkId = Uuid;

/// A stored short token identifying a link.
///
/// User-supplied tokens are purely alphanumeric (see [`token::validate_custom`]);
/// tokens rewritten by the expiration sweep also carry `_` and `-`, so the
/// stored form accepts those characters as well.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShortToken(String);

impl ShortToken {
    pub fn new<S: Into<String>>(s: S) -> Result<Self, CoreError> {
        let val = s.into();
        if val.is_empty() {
            return Err(CoreError::InvalidToken("empty".into()));
        }
        if val.len() > MAX_TOKEN_LEN {
            return Err(CoreError::InvalidToken("too long".into()));
        }
        if !val
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CoreError::InvalidToken("invalid characters".into()));
        }
        Ok(Self(val))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShortToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An API key record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiKey {
    pub id: KeyId,
    /// The secret token presented by callers.
    pub key: String,
    pub name: String,
    pub is_admin: bool,
    pub is_active: bool,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    /// Last successful authentication with this key.
    pub last_used_at: Option<SystemTime>,
}

impl ApiKey {
    pub fn is_root(&self) -> bool {
        self.name == ROOT_KEY_NAME
    }
}

/// Stored short link mapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub id: LinkId,
    pub redirect_to: String,
    pub shortened: ShortToken,
    pub expires_at: Option<SystemTime>,
    /// Owning key id.
    pub created_by: KeyId,
    pub visits: u64,
    pub last_visited_at: Option<SystemTime>,
    /// Inactive links never resolve.
    pub is_active: bool,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl Link {
    /// Create a new active, never-visited link.
    pub fn new(
        shortened: ShortToken,
        redirect_to: String,
        expires_at: Option<SystemTime>,
        created_by: KeyId,
        now: SystemTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            redirect_to,
            shortened,
            expires_at,
            created_by,
            visits: 0,
            last_visited_at: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the link has expired based on the given current time.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|exp| exp < now)
    }

    /// A link is stale once its last visit is older than `stale_before`.
    /// Never-visited links are never stale.
    pub fn is_stale(&self, stale_before: SystemTime) -> bool {
        self.last_visited_at.is_some_and(|t| t < stale_before)
    }

    /// Whether the expiration sweep should deactivate this link.
    pub fn is_sweepable(&self, now: SystemTime, stale_before: SystemTime) -> bool {
        self.is_active && (self.is_expired(now) || self.is_stale(stale_before))
    }
}

/// A single recorded redirect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkVisit {
    pub id: Uuid,
    pub link_id: LinkId,
    pub visited_at: SystemTime,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub referrer: Option<String>,
}

/// Request metadata captured when a redirect resolves.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Visitor {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub referrer: Option<String>,
}

/// Resolved identity of the caller, produced by [`keys::KeyStore::authenticate`]
/// and handed explicitly to every authorized operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthContext {
    pub key_id: KeyId,
    pub key: String,
    pub name: String,
    pub is_admin: bool,
}

impl AuthContext {
    pub fn require_admin(&self) -> Result<(), CoreError> {
        if self.is_admin {
            Ok(())
        } else {
            Err(CoreError::Forbidden)
        }
    }
}

/// A partial-update field: either left untouched or replaced with a value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Field<T> {
    Absent,
    Present(T),
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Absent
    }
}

impl<T> From<Option<T>> for Field<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Field::Present(v),
            None => Field::Absent,
        }
    }
}

/// Time source abstraction to make code testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Source of candidate short tokens; availability is checked by the caller.
pub trait TokenGenerator: Send + Sync {
    fn next_token(&self) -> String;
}

/// Repository port for API keys.
pub trait KeyRepository: Send + Sync {
    fn find_by_key(&self, key: &str) -> Result<Option<ApiKey>, CoreError>;
    fn find_by_name(&self, name: &str) -> Result<Option<ApiKey>, CoreError>;
    fn find_by_id(&self, id: KeyId) -> Result<Option<ApiKey>, CoreError>;
    fn list_keys(&self) -> Result<Vec<ApiKey>, CoreError>;
    /// Insert a new key. Fails with `AlreadyExists` on a duplicate key or name.
    fn insert_key(&self, key: ApiKey) -> Result<(), CoreError>;
    /// Persist name/flags/updated_at of an existing key.
    fn update_key(&self, key: &ApiKey) -> Result<(), CoreError>;
    fn delete_key(&self, id: KeyId) -> Result<(), CoreError>;
    /// Stamp `last_used_at`.
    fn touch_key(&self, id: KeyId, at: SystemTime) -> Result<(), CoreError>;
}

/// Repository port for persisting and loading links and their visits.
pub trait LinkRepository: Send + Sync {
    fn get(&self, shortened: &ShortToken) -> Result<Option<Link>, CoreError>;
    /// Match `shortened` among active links only. Expiry is not filtered.
    fn get_active(&self, shortened: &ShortToken) -> Result<Option<Link>, CoreError>;
    /// Insert a new link. Fails with `AlreadyExists` when the token is taken.
    fn insert(&self, link: Link) -> Result<(), CoreError>;
    /// Persist every mutable column of the link with `link.id`, provided it
    /// still carries the token `current`. A row renamed or retired by a
    /// sweep since it was read gives `NotFound`.
    fn update(&self, current: &ShortToken, link: &Link) -> Result<(), CoreError>;
    fn delete(&self, id: LinkId) -> Result<(), CoreError>;
    fn list_all(&self) -> Result<Vec<Link>, CoreError>;
    fn list_by_owner(&self, owner: KeyId) -> Result<Vec<Link>, CoreError>;
    /// Insert the visit and bump the link's counter and `last_visited_at`
    /// in one transaction.
    fn record_visit(&self, visit: LinkVisit) -> Result<(), CoreError>;
    fn list_visits(&self, link_id: LinkId) -> Result<Vec<LinkVisit>, CoreError>;
    /// Deactivate every active link that expired before `now` or was last
    /// visited before `stale_before`, rewriting its token to
    /// `prefix + id`. Runs in one transaction; returns the number of rows.
    fn sweep_expired(
        &self,
        now: SystemTime,
        stale_before: SystemTime,
        prefix: &str,
    ) -> Result<usize, CoreError>;
}

impl<T: KeyRepository + ?Sized> KeyRepository for Arc<T> {
    fn find_by_key(&self, key: &str) -> Result<Option<ApiKey>, CoreError> {
        (**self).find_by_key(key)
    }
    fn find_by_name(&self, name: &str) -> Result<Option<ApiKey>, CoreError> {
        (**self).find_by_name(name)
    }
    fn find_by_id(&self, id: KeyId) -> Result<Option<ApiKey>, CoreError> {
        (**self).find_by_id(id)
    }
    fn list_keys(&self) -> Result<Vec<ApiKey>, CoreError> {
        (**self).list_keys()
    }
    fn insert_key(&self, key: ApiKey) -> Result<(), CoreError> {
        (**self).insert_key(key)
    }
    fn update_key(&self, key: &ApiKey) -> Result<(), CoreError> {
        (**self).update_key(key)
    }
    fn delete_key(&self, id: KeyId) -> Result<(), CoreError> {
        (**self).delete_key(id)
    }
    fn touch_key(&self, id: KeyId, at: SystemTime) -> Result<(), CoreError> {
        (**self).touch_key(id, at)
    }
}

impl<T: LinkRepository + ?Sized> LinkRepository for Arc<T> {
    fn get(&self, shortened: &ShortToken) -> Result<Option<Link>, CoreError> {
        (**self).get(shortened)
    }
    fn get_active(&self, shortened: &ShortToken) -> Result<Option<Link>, CoreError> {
        (**self).get_active(shortened)
    }
    fn insert(&self, link: Link) -> Result<(), CoreError> {
        (**self).insert(link)
    }
    fn update(&self, current: &ShortToken, link: &Link) -> Result<(), CoreError> {
        (**self).update(current, link)
    }
    fn delete(&self, id: LinkId) -> Result<(), CoreError> {
        (**self).delete(id)
    }
    fn list_all(&self) -> Result<Vec<Link>, CoreError> {
        (**self).list_all()
    }
    fn list_by_owner(&self, owner: KeyId) -> Result<Vec<Link>, CoreError> {
        (**self).list_by_owner(owner)
    }
    fn record_visit(&self, visit: LinkVisit) -> Result<(), CoreError> {
        (**self).record_visit(visit)
    }
    fn list_visits(&self, link_id: LinkId) -> Result<Vec<LinkVisit>, CoreError> {
        (**self).list_visits(link_id)
    }
    fn sweep_expired(
        &self,
        now: SystemTime,
        stale_before: SystemTime,
        prefix: &str,
    ) -> Result<usize, CoreError> {
        (**self).sweep_expired(now, stale_before, prefix)
    }
}

/// Broad classification used by the HTTP layer to pick a status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Unauthorized,
    Forbidden,
    Conflict,
    GenerationExhausted,
    Store,
}

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("protocol {0} is not allowed")]
    DisallowedScheme(String),
    #[error("cannot redirect to link shortener")]
    SelfReferential,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("custom url is already in use, or is reserved")]
    TokenTaken,
    #[error("new shortened url already exists")]
    Conflict,
    #[error("invalid key name: {0}")]
    InvalidKeyName(String),
    #[error("key name already exists")]
    KeyNameTaken,
    #[error("no fields to update")]
    NoFieldsToUpdate,
    #[error("cannot update root user key")]
    RootKeyProtected,
    #[error("root key secret is not configured")]
    MissingRootSecret,
    #[error("resource already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("admin access required")]
    Forbidden,
    #[error("failed to generate a unique short url after {0} attempts")]
    GenerationExhausted(usize),
    #[error("invalid redirect")]
    InvalidRedirect,
    #[error("repository error: {0}")]
    Repository(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidUrl(_)
            | CoreError::DisallowedScheme(_)
            | CoreError::SelfReferential
            | CoreError::InvalidToken(_)
            | CoreError::TokenTaken
            | CoreError::InvalidKeyName(_)
            | CoreError::KeyNameTaken
            | CoreError::NoFieldsToUpdate
            | CoreError::MissingRootSecret => ErrorKind::Validation,
            CoreError::NotFound => ErrorKind::NotFound,
            CoreError::Unauthorized | CoreError::RootKeyProtected => ErrorKind::Unauthorized,
            CoreError::Forbidden => ErrorKind::Forbidden,
            CoreError::Conflict | CoreError::AlreadyExists => ErrorKind::Conflict,
            CoreError::GenerationExhausted(_) => ErrorKind::GenerationExhausted,
            CoreError::InvalidRedirect | CoreError::Repository(_) => ErrorKind::Store,
        }
    }
}

pub mod adapters;
pub mod base62;
pub mod expiry;
pub mod keys;
pub mod service;
pub mod token;
pub mod validate;
