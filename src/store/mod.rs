//! Credential store
//!
//! A single SQLite file holds users, sessions, API keys, OIDC state, runtime
//! settings, secrets, the audit log, discovered-app overrides and user
//! preferences. The pool is capped at one connection, so every read is fully
//! materialised before the next statement is issued.

mod api_keys;
mod audit;
mod oidc_state;
mod overrides;
mod preferences;
mod sessions;
mod settings;
mod users;

pub use api_keys::{ApiKey, NewApiKey};
pub use audit::AuditEntry;
pub use oidc_state::{OIDC_STATE_TTL_SECS, OidcState};
pub use overrides::DiscoveredOverride;
pub use sessions::{Session, SessionUser};
pub use users::{ExternalUser, NewUser, User, UserUpdate};

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Audit rows kept by [`Store::prune_audit`]
pub const AUDIT_RETENTION: i64 = 10_000;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        email TEXT UNIQUE,
        display_name TEXT NOT NULL DEFAULT '',
        groups TEXT NOT NULL DEFAULT '[]',
        password_hash TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        token TEXT NOT NULL UNIQUE,
        expires_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at)",
    "CREATE TABLE IF NOT EXISTS api_keys (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        key_hash TEXT NOT NULL,
        key_prefix TEXT NOT NULL,
        username TEXT NOT NULL,
        groups TEXT NOT NULL DEFAULT '[]',
        permissions TEXT NOT NULL DEFAULT '[]',
        expires_at INTEGER,
        last_used_at INTEGER,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_api_keys_prefix ON api_keys(key_prefix)",
    "CREATE TABLE IF NOT EXISTS oidc_states (
        state TEXT PRIMARY KEY,
        redirect_to TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS system_settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS system_secrets (
        name TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at INTEGER NOT NULL,
        actor TEXT NOT NULL,
        action TEXT NOT NULL,
        detail TEXT NOT NULL DEFAULT '',
        source_ip TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS discovered_overrides (
        url TEXT PRIMARY KEY,
        name TEXT,
        new_url TEXT,
        icon TEXT,
        description TEXT,
        category TEXT,
        groups TEXT NOT NULL DEFAULT '[]',
        hidden INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS user_preferences (
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (user_id, key)
    )",
];

/// Additive migrations; re-running one fails with "duplicate column", which is expected.
const MIGRATIONS: &[&str] = &[
    "ALTER TABLE oidc_states ADD COLUMN code_verifier TEXT NOT NULL DEFAULT ''",
];

/// Current time as Unix seconds
#[must_use]
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Handle to the embedded database
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database file and initialise the schema.
    ///
    /// The parent directory is created with mode 0700 and the file is
    /// restricted to 0600.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_private_dir(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        restrict_file(path)?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(path = %path.display(), "Database ready");
        Ok(store)
    }

    /// Private in-memory database (tests and dry runs)
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        for migration in MIGRATIONS {
            match sqlx::query(migration).execute(&self.pool).await {
                Ok(_) => debug!(migration, "Applied migration"),
                Err(sqlx::Error::Database(e)) if e.message().contains("duplicate column") => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Start a transaction for multi-statement writes
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Underlying pool
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Delete expired sessions and stale OIDC states, prune the audit log.
    pub async fn sweep(&self) -> Result<()> {
        let now = now_secs();
        let sessions = self.delete_expired_sessions(now).await?;
        let states = self.delete_stale_oidc_states(now).await?;
        let audit = self.prune_audit(AUDIT_RETENTION).await?;
        if sessions + states + audit > 0 {
            info!(sessions, states, audit, "Swept expired rows");
        }
        Ok(())
    }

    /// Close the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn decode_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(error = %e, "Malformed list column; treating as empty");
        Vec::new()
    })
}

pub(crate) fn encode_list(items: &[String]) -> Result<String> {
    Ok(serde_json::to_string(items)?)
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    if !dir.exists() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(|e| Error::Config(format!("Cannot create {}: {e}", dir.display())))?;
    } else if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)) {
        warn!(dir = %dir.display(), error = %e, "Could not restrict database directory");
    }
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::Config(format!("Cannot create {}: {e}", dir.display())))
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> Result<()> {
    Ok(())
}
