// src/entity.rs

//! Entity trait and per-operation context
//!
//! Entities are plain structs that declare their table shape through a
//! [`crate::schema::SchemaBuilder`] and map themselves to and from rows.
//! The engine never reflects over fields: it asks the schema for column
//! names and the entity for column values, and hands result rows to the
//! entity's `from_row`.

use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::schema::EntitySchema;
use crate::value::Value;

/// A persistable entity type
///
/// Base properties (`Id`, `Version`, `CreatedTime`, `LastWriteTime`) are
/// exposed through accessors so the engine can stamp them during writes.
/// Flag-gated properties default to inert implementations; entities whose
/// schema enables soft-delete, expiry, or archive must override the
/// matching pair.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + 'static {
    /// Stable type name, used for audit records and the schema registry
    fn entity_type() -> &'static str;

    /// Schema describing the backing table; built once and cached
    fn schema() -> &'static EntitySchema;

    /// Logical key (the stored form of the `Id` column)
    fn key(&self) -> String;

    fn version(&self) -> i64;
    fn set_version(&mut self, version: i64);

    fn created_time(&self) -> DateTime<Utc>;
    fn set_created_time(&mut self, t: DateTime<Utc>);

    fn last_write_time(&self) -> DateTime<Utc>;
    fn set_last_write_time(&mut self, t: DateTime<Utc>);

    fn is_deleted(&self) -> bool {
        false
    }
    fn set_is_deleted(&mut self, _deleted: bool) {}

    fn absolute_expiration(&self) -> Option<DateTime<Utc>> {
        None
    }
    fn set_absolute_expiration(&mut self, _t: Option<DateTime<Utc>>) {}

    fn is_archived(&self) -> bool {
        false
    }
    fn set_is_archived(&mut self, _archived: bool) {}

    /// Value of a user column by name, used for parameter binding.
    /// Base columns are bound by the engine through the accessors above.
    fn column_value(&self, column: &str) -> Value;

    /// Map a result row back to an entity. Columns appear in the schema's
    /// canonical select order: `Id`, `Version`, `CreatedTime`,
    /// `LastWriteTime`, flag columns, then user columns.
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self>;

    /// Build an entity from column-keyed values decoded by the bulk
    /// engine (JSON or CSV records). Missing columns default to type-zero
    /// through the [`ValueMap`] accessors.
    fn from_values(values: &crate::value::ValueMap) -> Result<Self>;
}

/// Caller context attached to writes and audit records
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallerInfo {
    pub file: String,
    pub member: String,
    pub line: u32,
    pub user_id: Option<String>,
}

impl CallerInfo {
    /// Capture the invoking source location
    #[track_caller]
    pub fn current() -> Self {
        let loc = Location::caller();
        Self {
            file: loc.file().to_string(),
            member: String::new(),
            line: loc.line(),
            user_id: None,
        }
    }

    /// Capture the invoking source location with an explicit member name
    #[track_caller]
    pub fn named(member: &str) -> Self {
        let mut caller = Self::current();
        caller.member = member.to_string();
        caller
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }
}

/// Cooperative cancellation signal checked between suspension points
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token; in-flight operations abort at their next check
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail with [`Error::Cancelled`] if the token has been tripped
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Per-operation context: caller identity plus a cancellation signal
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    pub caller: CallerInfo,
    pub cancel: CancelToken,
}

impl OpContext {
    /// Context capturing the invoking source location
    #[track_caller]
    pub fn new() -> Self {
        Self {
            caller: CallerInfo::current(),
            cancel: CancelToken::new(),
        }
    }

    /// Context bound to an existing cancellation token
    #[track_caller]
    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self {
            caller: CallerInfo::current(),
            cancel,
        }
    }
}
