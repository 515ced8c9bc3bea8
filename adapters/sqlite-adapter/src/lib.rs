//! sqlite-adapter — SQLite implementation of the `KeyRepository` and
//! `LinkRepository` ports.
//!
//! Notes
//! - Uses `rusqlite` with the `bundled` feature for portability.
//! - Stores timestamps as seconds since UNIX_EPOCH and ids as hyphenated
//!   UUID text.
//! - UNIQUE constraints on `api_keys.key`, `api_keys.name` and
//!   `links.shortened` are the final arbiter for races; violations surface as
//!   `CoreError::AlreadyExists`.
//! - Visit rows are not cascaded on link deletion; history outlives the link.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use domain::{
    ApiKey, CoreError, KeyId, KeyRepository, Link, LinkId, LinkRepository, LinkVisit, ShortToken,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

/// SQLite-backed store for keys, links and visits.
pub struct SqliteRepo {
    conn: Mutex<Connection>,
}

impl SqliteRepo {
    /// Open (or create) a SQLite database at the given path and ensure schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, CoreError> {
        if let Some(dir) = path.as_ref().parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(map_sqerr)?;
            }
        }
        let conn = Connection::open(path).map_err(map_sqerr)?;
        init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Private in-memory database, mostly for tests.
    pub fn in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory().map_err(map_sqerr)?;
        init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CoreError> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }
}

fn init_schema(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS api_keys (
            id TEXT PRIMARY KEY,
            key TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL UNIQUE,
            is_admin INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_used_at INTEGER
        );
        CREATE TABLE IF NOT EXISTS links (
            id TEXT PRIMARY KEY,
            redirect_to TEXT NOT NULL,
            shortened TEXT NOT NULL UNIQUE,
            expires_at INTEGER,
            created_by TEXT NOT NULL,
            visits INTEGER NOT NULL DEFAULT 0,
            last_visited_at INTEGER,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_links_created_by ON links(created_by);
        CREATE INDEX IF NOT EXISTS idx_links_expires_at ON links(expires_at);
        CREATE INDEX IF NOT EXISTS idx_links_active ON links(is_active);
        CREATE TABLE IF NOT EXISTS link_visits (
            id TEXT PRIMARY KEY,
            link_id TEXT NOT NULL,
            visited_at INTEGER NOT NULL,
            user_agent TEXT,
            ip_address TEXT,
            referrer TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_link_visits_link_id ON link_visits(link_id);
        CREATE INDEX IF NOT EXISTS idx_link_visits_visited_at ON link_visits(visited_at);
        "#,
    )
    .map_err(map_sqerr)
}

fn map_sqerr<E: std::fmt::Display>(e: E) -> CoreError {
    CoreError::Repository(format!("sqlite error: {e}"))
}

/// Unique-constraint violations become `AlreadyExists`; everything else is a
/// repository error.
fn map_write_err(e: rusqlite::Error) -> CoreError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            return CoreError::AlreadyExists;
        }
    }
    map_sqerr(e)
}

fn to_secs(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64
}

fn from_secs(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

fn parse_id(s: &str) -> Result<Uuid, CoreError> {
    Uuid::parse_str(s).map_err(|e| CoreError::Repository(format!("bad id in db: {e}")))
}

const KEY_COLUMNS: &str =
    "id, key, name, is_admin, is_active, created_at, updated_at, last_used_at";

const LINK_COLUMNS: &str = "id, redirect_to, shortened, expires_at, created_by, visits, \
     last_visited_at, is_active, created_at, updated_at";

fn row_to_key(row: &Row) -> Result<ApiKey, CoreError> {
    let id: String = row.get(0).map_err(map_sqerr)?;
    let last_used_at: Option<i64> = row.get(7).map_err(map_sqerr)?;
    Ok(ApiKey {
        id: parse_id(&id)?,
        key: row.get(1).map_err(map_sqerr)?,
        name: row.get(2).map_err(map_sqerr)?,
        is_admin: row.get::<_, i64>(3).map_err(map_sqerr)? != 0,
        is_active: row.get::<_, i64>(4).map_err(map_sqerr)? != 0,
        created_at: from_secs(row.get(5).map_err(map_sqerr)?),
        updated_at: from_secs(row.get(6).map_err(map_sqerr)?),
        last_used_at: last_used_at.map(from_secs),
    })
}

fn row_to_link(row: &Row) -> Result<Link, CoreError> {
    let id: String = row.get(0).map_err(map_sqerr)?;
    let shortened: String = row.get(2).map_err(map_sqerr)?;
    let expires_at: Option<i64> = row.get(3).map_err(map_sqerr)?;
    let created_by: String = row.get(4).map_err(map_sqerr)?;
    let visits: i64 = row.get(5).map_err(map_sqerr)?;
    let last_visited_at: Option<i64> = row.get(6).map_err(map_sqerr)?;
    Ok(Link {
        id: parse_id(&id)?,
        redirect_to: row.get(1).map_err(map_sqerr)?,
        shortened: ShortToken::new(shortened)
            .map_err(|e| CoreError::Repository(format!("bad token in db: {e}")))?,
        expires_at: expires_at.map(from_secs),
        created_by: parse_id(&created_by)?,
        visits: visits.max(0) as u64,
        last_visited_at: last_visited_at.map(from_secs),
        is_active: row.get::<_, i64>(7).map_err(map_sqerr)? != 0,
        created_at: from_secs(row.get(8).map_err(map_sqerr)?),
        updated_at: from_secs(row.get(9).map_err(map_sqerr)?),
    })
}

fn row_to_visit(row: &Row) -> Result<LinkVisit, CoreError> {
    let id: String = row.get(0).map_err(map_sqerr)?;
    let link_id: String = row.get(1).map_err(map_sqerr)?;
    Ok(LinkVisit {
        id: parse_id(&id)?,
        link_id: parse_id(&link_id)?,
        visited_at: from_secs(row.get(2).map_err(map_sqerr)?),
        user_agent: row.get(3).map_err(map_sqerr)?,
        ip_address: row.get(4).map_err(map_sqerr)?,
        referrer: row.get(5).map_err(map_sqerr)?,
    })
}

/// Run a query and collect every row through `f`.
fn collect<T, P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    f: fn(&Row) -> Result<T, CoreError>,
) -> Result<Vec<T>, CoreError> {
    let mut stmt = conn.prepare(sql).map_err(map_sqerr)?;
    let mut rows = stmt.query(params).map_err(map_sqerr)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(map_sqerr)? {
        out.push(f(row)?);
    }
    Ok(out)
}

fn first<T, P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    f: fn(&Row) -> Result<T, CoreError>,
) -> Result<Option<T>, CoreError> {
    Ok(collect(conn, sql, params, f)?.into_iter().next())
}

impl KeyRepository for SqliteRepo {
    fn find_by_key(&self, key: &str) -> Result<Option<ApiKey>, CoreError> {
        let conn = self.lock()?;
        first(
            &conn,
            &format!("SELECT {KEY_COLUMNS} FROM api_keys WHERE key = ?1"),
            params![key],
            row_to_key,
        )
    }

    fn find_by_name(&self, name: &str) -> Result<Option<ApiKey>, CoreError> {
        let conn = self.lock()?;
        first(
            &conn,
            &format!("SELECT {KEY_COLUMNS} FROM api_keys WHERE name = ?1"),
            params![name],
            row_to_key,
        )
    }

    fn find_by_id(&self, id: KeyId) -> Result<Option<ApiKey>, CoreError> {
        let conn = self.lock()?;
        first(
            &conn,
            &format!("SELECT {KEY_COLUMNS} FROM api_keys WHERE id = ?1"),
            params![id.to_string()],
            row_to_key,
        )
    }

    fn list_keys(&self) -> Result<Vec<ApiKey>, CoreError> {
        let conn = self.lock()?;
        collect(
            &conn,
            &format!("SELECT {KEY_COLUMNS} FROM api_keys ORDER BY created_at, name"),
            [],
            row_to_key,
        )
    }

    fn insert_key(&self, key: ApiKey) -> Result<(), CoreError> {
        let conn = self.lock()?;
        conn.execute(
            &format!("INSERT INTO api_keys({KEY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                key.id.to_string(),
                key.key,
                key.name,
                key.is_admin as i64,
                key.is_active as i64,
                to_secs(key.created_at),
                to_secs(key.updated_at),
                key.last_used_at.map(to_secs),
            ],
        )
        .map_err(map_write_err)?;
        Ok(())
    }

    fn update_key(&self, key: &ApiKey) -> Result<(), CoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE api_keys SET name = ?1, is_admin = ?2, is_active = ?3, updated_at = ?4 WHERE id = ?5",
                params![
                    key.name,
                    key.is_admin as i64,
                    key.is_active as i64,
                    to_secs(key.updated_at),
                    key.id.to_string(),
                ],
            )
            .map_err(map_write_err)?;
        if changed == 0 {
            Err(CoreError::NotFound)
        } else {
            Ok(())
        }
    }

    fn delete_key(&self, id: KeyId) -> Result<(), CoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute("DELETE FROM api_keys WHERE id = ?1", params![id.to_string()])
            .map_err(map_sqerr)?;
        if changed == 0 {
            Err(CoreError::NotFound)
        } else {
            Ok(())
        }
    }

    fn touch_key(&self, id: KeyId, at: SystemTime) -> Result<(), CoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
                params![to_secs(at), id.to_string()],
            )
            .map_err(map_sqerr)?;
        if changed == 0 {
            Err(CoreError::NotFound)
        } else {
            Ok(())
        }
    }
}

impl LinkRepository for SqliteRepo {
    fn get(&self, shortened: &ShortToken) -> Result<Option<Link>, CoreError> {
        let conn = self.lock()?;
        first(
            &conn,
            &format!("SELECT {LINK_COLUMNS} FROM links WHERE shortened = ?1"),
            params![shortened.as_str()],
            row_to_link,
        )
    }

    fn get_active(&self, shortened: &ShortToken) -> Result<Option<Link>, CoreError> {
        let conn = self.lock()?;
        first(
            &conn,
            &format!("SELECT {LINK_COLUMNS} FROM links WHERE shortened = ?1 AND is_active = 1"),
            params![shortened.as_str()],
            row_to_link,
        )
    }

    fn insert(&self, link: Link) -> Result<(), CoreError> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO links({LINK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                link.id.to_string(),
                link.redirect_to,
                link.shortened.as_str(),
                link.expires_at.map(to_secs),
                link.created_by.to_string(),
                link.visits as i64,
                link.last_visited_at.map(to_secs),
                link.is_active as i64,
                to_secs(link.created_at),
                to_secs(link.updated_at),
            ],
        )
        .map_err(map_write_err)?;
        Ok(())
    }

    fn update(&self, current: &ShortToken, link: &Link) -> Result<(), CoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE links SET redirect_to = ?1, shortened = ?2, expires_at = ?3, is_active = ?4, updated_at = ?5 \
                 WHERE id = ?6 AND shortened = ?7",
                params![
                    link.redirect_to,
                    link.shortened.as_str(),
                    link.expires_at.map(to_secs),
                    link.is_active as i64,
                    to_secs(link.updated_at),
                    link.id.to_string(),
                    current.as_str(),
                ],
            )
            .map_err(map_write_err)?;
        if changed == 0 {
            Err(CoreError::NotFound)
        } else {
            Ok(())
        }
    }

    fn delete(&self, id: LinkId) -> Result<(), CoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute("DELETE FROM links WHERE id = ?1", params![id.to_string()])
            .map_err(map_sqerr)?;
        if changed == 0 {
            Err(CoreError::NotFound)
        } else {
            Ok(())
        }
    }

    fn list_all(&self) -> Result<Vec<Link>, CoreError> {
        let conn = self.lock()?;
        collect(
            &conn,
            &format!("SELECT {LINK_COLUMNS} FROM links ORDER BY created_at, shortened"),
            [],
            row_to_link,
        )
    }

    fn list_by_owner(&self, owner: KeyId) -> Result<Vec<Link>, CoreError> {
        let conn = self.lock()?;
        collect(
            &conn,
            &format!(
                "SELECT {LINK_COLUMNS} FROM links WHERE created_by = ?1 ORDER BY created_at, shortened"
            ),
            params![owner.to_string()],
            row_to_link,
        )
    }

    fn record_visit(&self, visit: LinkVisit) -> Result<(), CoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().map_err(map_sqerr)?;
        let at = to_secs(visit.visited_at);
        let changed = tx
            .execute(
                "UPDATE links SET visits = visits + 1, last_visited_at = ?1 WHERE id = ?2",
                params![at, visit.link_id.to_string()],
            )
            .map_err(map_sqerr)?;
        if changed == 0 {
            return Err(CoreError::NotFound);
        }
        tx.execute(
            "INSERT INTO link_visits(id, link_id, visited_at, user_agent, ip_address, referrer) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                visit.id.to_string(),
                visit.link_id.to_string(),
                at,
                visit.user_agent,
                visit.ip_address,
                visit.referrer,
            ],
        )
        .map_err(map_sqerr)?;
        tx.commit().map_err(map_sqerr)
    }

    fn list_visits(&self, link_id: LinkId) -> Result<Vec<LinkVisit>, CoreError> {
        let conn = self.lock()?;
        collect(
            &conn,
            "SELECT id, link_id, visited_at, user_agent, ip_address, referrer FROM link_visits WHERE link_id = ?1 ORDER BY visited_at",
            params![link_id.to_string()],
            row_to_visit,
        )
    }

    fn sweep_expired(
        &self,
        now: SystemTime,
        stale_before: SystemTime,
        prefix: &str,
    ) -> Result<usize, CoreError> {
        const MATCHING: &str = "is_active = 1 AND ( \
             (expires_at IS NOT NULL AND expires_at < ?1) OR \
             (last_visited_at IS NOT NULL AND last_visited_at < ?2))";

        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().map_err(map_sqerr)?;
        let (now, stale_before) = (to_secs(now), to_secs(stale_before));

        let count: i64 = tx
            .query_row(
                &format!("SELECT COUNT(*) FROM links WHERE {MATCHING}"),
                params![now, stale_before],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqerr)?
            .unwrap_or(0);
        if count == 0 {
            return Ok(0);
        }

        let swept = tx
            .execute(
                &format!(
                    "UPDATE links SET is_active = 0, shortened = ?3 || id, updated_at = ?1 WHERE {MATCHING}"
                ),
                params![now, stale_before, prefix],
            )
            .map_err(map_write_err)?;
        tx.commit().map_err(map_sqerr)?;
        Ok(swept)
    }
}
