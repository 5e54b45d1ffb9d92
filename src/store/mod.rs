// src/store/mod.rs

//! Store lifecycle and per-entity handles
//!
//! A [`Store`] wraps one SQLite database file: it creates the file and its
//! parent directories, applies the configured pragmas, and bootstraps the
//! shared tables (version ledger, audit log, list mappings) exactly once.
//! [`Store::entity`] hands out a typed [`EntityStore`] after making sure
//! the entity's table and indexes exist; generated DDL is parsed through
//! the crate's SQL parser before execution so malformed schemas fail with
//! a validation error instead of a backend error.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::audit;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::schema::{self, EntitySchema, ddl};
use crate::sql;
use crate::transaction::TransactionScope;
use crate::version;

pub mod batch;
pub mod crud;
pub mod list;
pub mod query;

/// SQLite journal mode applied at open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    Wal,
    Delete,
    Truncate,
    Memory,
}

impl JournalMode {
    fn pragma_value(self) -> &'static str {
        match self {
            JournalMode::Wal => "WAL",
            JournalMode::Delete => "DELETE",
            JournalMode::Truncate => "TRUNCATE",
            JournalMode::Memory => "MEMORY",
        }
    }
}

/// Store configuration; the connection string itself is just the file path
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub journal_mode: JournalMode,
    /// PRAGMA cache_size, in pages (negative means KiB per SQLite rules)
    pub cache_size: Option<i64>,
    /// Busy timeout applied to every connection
    pub command_timeout: Duration,
    pub enable_foreign_keys: bool,
    pub retry: RetryPolicy,
    /// Sub-batch size for batch write operations
    pub batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::Wal,
            cache_size: None,
            command_timeout: Duration::from_secs(5),
            enable_foreign_keys: true,
            retry: RetryPolicy::default(),
            batch_size: 500,
        }
    }
}

/// One SQLite-backed entity store
pub struct Store {
    path: PathBuf,
    config: StoreConfig,
    /// Entity types whose table DDL has been applied on this store
    bootstrapped: Mutex<HashSet<&'static str>>,
}

impl Store {
    /// Open (creating if needed) a store at the given path
    ///
    /// Creates parent directories, applies pragmas, and bootstraps the
    /// shared ledger, audit, and list-mapping tables. Idempotent.
    pub fn open<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Store> {
        let path = path.as_ref().to_path_buf();
        debug!("Opening store at: {}", path.display());

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::InitError(format!("Failed to create store directory: {}", e))
            })?;
        }

        let store = Store {
            path,
            config,
            bootstrapped: Mutex::new(HashSet::new()),
        };

        let conn = store.connection()?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};
             PRAGMA synchronous = NORMAL;",
            store.config.journal_mode.pragma_value()
        ))?;
        if let Some(cache_size) = store.config.cache_size {
            conn.execute_batch(&format!("PRAGMA cache_size = {};", cache_size))?;
        }

        store.execute_checked_ddl(&conn, version::LEDGER_TABLE_SQL)?;
        for statement in audit::table_ddl() {
            store.execute_checked_ddl(&conn, statement)?;
        }
        for statement in list::mapping_ddl() {
            store.execute_checked_ddl(&conn, statement)?;
        }

        info!("Store initialized at {}", store.path.display());
        Ok(store)
    }

    /// Open a fresh connection with per-connection pragmas applied
    ///
    /// Reads use a fresh connection each time; writes open one connection
    /// per operation and run a single transaction on it.
    pub(crate) fn connection(&self) -> Result<Connection> {
        self.config.retry.run("open connection", || {
            let conn = Connection::open(&self.path)?;
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = {};
                 PRAGMA busy_timeout = {};",
                if self.config.enable_foreign_keys { "ON" } else { "OFF" },
                self.config.command_timeout.as_millis()
            ))?;
            Ok(conn)
        })
    }

    /// Raw connection for callers that need to step outside the typed
    /// surface (diagnostics, ad-hoc queries, audit inspection)
    pub fn raw_connection(&self) -> Result<Connection> {
        self.connection()
    }

    /// Begin a write transaction
    ///
    /// BEGIN IMMEDIATE takes the write lock up front so concurrent
    /// writers queue on the busy timeout instead of failing with a
    /// snapshot conflict when a deferred transaction upgrades.
    pub(crate) fn begin_write<'c>(
        &self,
        conn: &'c Connection,
    ) -> Result<rusqlite::Transaction<'c>> {
        let tx = rusqlite::Transaction::new_unchecked(
            conn,
            rusqlite::TransactionBehavior::Immediate,
        )?;
        Ok(tx)
    }

    /// Dedicated connection for audit writes
    ///
    /// Audit never shares the primary operation's connection or
    /// transaction, so an audit failure cannot corrupt primary state.
    pub(crate) fn audit_connection(&self) -> Result<Connection> {
        self.connection()
    }

    /// Parse generated DDL through the restricted SQL parser, then run it
    ///
    /// A schema that renders unparseable DDL is a bug in the declaration;
    /// surfacing it as `ValidationFailed` keeps it distinct from backend
    /// failures.
    fn execute_checked_ddl(&self, conn: &Connection, statement: &str) -> Result<()> {
        sql::parse(statement).map_err(|e| {
            Error::ValidationFailed(format!("Generated DDL failed to parse: {}", e))
        })?;
        conn.execute(statement, [])?;
        Ok(())
    }

    /// Typed handle for one entity type, creating its table if needed
    pub fn entity<T: Entity>(&self) -> Result<EntityStore<'_, T>> {
        let entity_schema = T::schema();
        let mut bootstrapped = self
            .bootstrapped
            .lock()
            .map_err(|_| Error::InitError("Store bootstrap lock poisoned".to_string()))?;
        if !bootstrapped.contains(T::entity_type()) {
            let conn = self.connection()?;
            self.execute_checked_ddl(&conn, &ddl::create_table_sql(entity_schema))?;
            for index_sql in ddl::create_index_sql(entity_schema) {
                self.execute_checked_ddl(&conn, &index_sql)?;
            }
            schema::register(T::entity_type(), entity_schema);
            bootstrapped.insert(T::entity_type());
            debug!(entity = T::entity_type(), "entity table ensured");
        }
        drop(bootstrapped);

        Ok(EntityStore {
            store: self,
            schema: entity_schema,
            _marker: PhantomData,
        })
    }

    /// Start a deferred multi-statement transaction scope
    pub fn transaction_scope(&self) -> TransactionScope<'_> {
        TransactionScope::new(self)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Release the store; connections are per-operation, so there is no
    /// pool to flush
    pub fn close(self) {
        debug!("Store closed: {}", self.path.display());
    }
}

/// Typed operation surface for one entity type
///
/// CRUD, batch, list, query, and bulk operations are implemented in the
/// sibling modules; all of them borrow the parent [`Store`].
pub struct EntityStore<'s, T: Entity> {
    pub(crate) store: &'s Store,
    pub(crate) schema: &'static EntitySchema,
    _marker: PhantomData<T>,
}

impl<T: Entity> EntityStore<'_, T> {
    pub fn schema(&self) -> &'static EntitySchema {
        self.schema
    }

    pub(crate) fn store(&self) -> &Store {
        self.store
    }

    /// Fail unless the schema carries the given flag
    pub(crate) fn require_flag(&self, enabled: bool, flag: &str) -> Result<()> {
        if enabled {
            Ok(())
        } else {
            Err(Error::NotSupported(format!(
                "'{}' flag is disabled for entity '{}'",
                flag,
                T::entity_type()
            )))
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/deep/store.db");
        let store = Store::open(&path, StoreConfig::default()).unwrap();
        assert!(path.exists());
        store.close();
    }

    #[test]
    fn test_open_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        Store::open(&path, StoreConfig::default()).unwrap();
        let store = Store::open(&path, StoreConfig::default()).unwrap();

        let conn = store.connection().unwrap();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        assert!(tables.contains(&"Version".to_string()));
        assert!(tables.contains(&"AuditRecords".to_string()));
        assert!(tables.contains(&"EntryListMapping".to_string()));
    }

    #[test]
    fn test_pragmas_applied() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("store.db"), StoreConfig::default()).unwrap();
        let conn = store.connection().unwrap();

        let journal: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal.to_lowercase(), "wal");

        let foreign_keys: i32 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(foreign_keys, 1);
    }
}
