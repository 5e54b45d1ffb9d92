// src/store/testutil.rs

//! Shared test entities and fixtures for store and bulk tests

use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::entity::Entity;
use crate::schema::{EntitySchema, LogicalType, SchemaBuilder};
use crate::value::{Value, now, read_timestamp, read_timestamp_opt};

use super::{Store, StoreConfig};

/// Soft-delete + audit + list-sync entity used by most write-path tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub version: i64,
    pub created_time: DateTime<Utc>,
    pub last_write_time: DateTime<Utc>,
    pub is_deleted: bool,
    pub order_number: String,
    pub status: String,
    pub total_amount: f64,
}

impl Order {
    pub fn new(id: &str, order_number: &str, status: &str, total_amount: f64) -> Self {
        let t = now();
        Self {
            id: id.to_string(),
            version: 0,
            created_time: t,
            last_write_time: t,
            is_deleted: false,
            order_number: order_number.to_string(),
            status: status.to_string(),
            total_amount,
        }
    }
}

impl Entity for Order {
    fn entity_type() -> &'static str {
        "Order"
    }

    fn schema() -> &'static EntitySchema {
        static SCHEMA: OnceLock<EntitySchema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            SchemaBuilder::new("Orders")
                .soft_delete()
                .audit()
                .sync_with_list()
                .column("OrderNumber", LogicalType::String)
                .column("Status", LogicalType::String)
                .column("TotalAmount", LogicalType::Decimal)
                .index("idx_orders_status", &["Status"], false)
                .build()
                .expect("order schema")
        })
    }

    fn key(&self) -> String {
        self.id.clone()
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn created_time(&self) -> DateTime<Utc> {
        self.created_time
    }

    fn set_created_time(&mut self, t: DateTime<Utc>) {
        self.created_time = t;
    }

    fn last_write_time(&self) -> DateTime<Utc> {
        self.last_write_time
    }

    fn set_last_write_time(&mut self, t: DateTime<Utc>) {
        self.last_write_time = t;
    }

    fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    fn set_is_deleted(&mut self, deleted: bool) {
        self.is_deleted = deleted;
    }

    fn column_value(&self, column: &str) -> Value {
        match column {
            "OrderNumber" => Value::from(self.order_number.as_str()),
            "Status" => Value::from(self.status.as_str()),
            "TotalAmount" => Value::from(self.total_amount),
            other => panic!("unknown Order column {other}"),
        }
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            version: row.get(1)?,
            created_time: read_timestamp(row, 2)?,
            last_write_time: read_timestamp(row, 3)?,
            is_deleted: row.get::<_, i64>(4)? != 0,
            order_number: row.get(5)?,
            status: row.get(6)?,
            total_amount: row.get(7)?,
        })
    }

    fn from_values(values: &crate::value::ValueMap) -> crate::error::Result<Self> {
        Ok(Self {
            id: values.text("Id"),
            version: values.i64("Version"),
            created_time: values.timestamp("CreatedTime"),
            last_write_time: values.timestamp("LastWriteTime"),
            is_deleted: values.bool("IsDeleted"),
            order_number: values.text("OrderNumber"),
            status: values.text("Status"),
            total_amount: values.f64("TotalAmount"),
        })
    }
}

/// Plain entity (no flags) used for in-place updates and hard deletes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub version: i64,
    pub created_time: DateTime<Utc>,
    pub last_write_time: DateTime<Utc>,
    pub name: String,
    pub price: f64,
}

impl Product {
    pub fn new(id: &str, name: &str, price: f64) -> Self {
        let t = now();
        Self {
            id: id.to_string(),
            version: 0,
            created_time: t,
            last_write_time: t,
            name: name.to_string(),
            price,
        }
    }
}

impl Entity for Product {
    fn entity_type() -> &'static str {
        "Product"
    }

    fn schema() -> &'static EntitySchema {
        static SCHEMA: OnceLock<EntitySchema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            SchemaBuilder::new("Products")
                .column("Name", LogicalType::String)
                .column("Price", LogicalType::Decimal)
                .build()
                .expect("product schema")
        })
    }

    fn key(&self) -> String {
        self.id.clone()
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn created_time(&self) -> DateTime<Utc> {
        self.created_time
    }

    fn set_created_time(&mut self, t: DateTime<Utc>) {
        self.created_time = t;
    }

    fn last_write_time(&self) -> DateTime<Utc> {
        self.last_write_time
    }

    fn set_last_write_time(&mut self, t: DateTime<Utc>) {
        self.last_write_time = t;
    }

    fn column_value(&self, column: &str) -> Value {
        match column {
            "Name" => Value::from(self.name.as_str()),
            "Price" => Value::from(self.price),
            other => panic!("unknown Product column {other}"),
        }
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            version: row.get(1)?,
            created_time: read_timestamp(row, 2)?,
            last_write_time: read_timestamp(row, 3)?,
            name: row.get(4)?,
            price: row.get(5)?,
        })
    }

    fn from_values(values: &crate::value::ValueMap) -> crate::error::Result<Self> {
        Ok(Self {
            id: values.text("Id"),
            version: values.i64("Version"),
            created_time: values.timestamp("CreatedTime"),
            last_write_time: values.timestamp("LastWriteTime"),
            name: values.text("Name"),
            price: values.f64("Price"),
        })
    }
}

/// Soft-delete + expiry + archive entity used by purge tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheItem {
    pub id: String,
    pub version: i64,
    pub created_time: DateTime<Utc>,
    pub last_write_time: DateTime<Utc>,
    pub is_deleted: bool,
    pub absolute_expiration: Option<DateTime<Utc>>,
    pub is_archived: bool,
    pub payload: String,
}

impl CacheItem {
    pub fn new(id: &str, payload: &str) -> Self {
        let t = now();
        Self {
            id: id.to_string(),
            version: 0,
            created_time: t,
            last_write_time: t,
            is_deleted: false,
            absolute_expiration: None,
            is_archived: false,
            payload: payload.to_string(),
        }
    }
}

impl Entity for CacheItem {
    fn entity_type() -> &'static str {
        "CacheItem"
    }

    fn schema() -> &'static EntitySchema {
        static SCHEMA: OnceLock<EntitySchema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            SchemaBuilder::new("CacheItems")
                .soft_delete()
                .expiry(Some(Duration::hours(1)))
                .archive()
                .column("Payload", LogicalType::String)
                .build()
                .expect("cache item schema")
        })
    }

    fn key(&self) -> String {
        self.id.clone()
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn created_time(&self) -> DateTime<Utc> {
        self.created_time
    }

    fn set_created_time(&mut self, t: DateTime<Utc>) {
        self.created_time = t;
    }

    fn last_write_time(&self) -> DateTime<Utc> {
        self.last_write_time
    }

    fn set_last_write_time(&mut self, t: DateTime<Utc>) {
        self.last_write_time = t;
    }

    fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    fn set_is_deleted(&mut self, deleted: bool) {
        self.is_deleted = deleted;
    }

    fn absolute_expiration(&self) -> Option<DateTime<Utc>> {
        self.absolute_expiration
    }

    fn set_absolute_expiration(&mut self, t: Option<DateTime<Utc>>) {
        self.absolute_expiration = t;
    }

    fn is_archived(&self) -> bool {
        self.is_archived
    }

    fn set_is_archived(&mut self, archived: bool) {
        self.is_archived = archived;
    }

    fn column_value(&self, column: &str) -> Value {
        match column {
            "Payload" => Value::from(self.payload.as_str()),
            other => panic!("unknown CacheItem column {other}"),
        }
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            version: row.get(1)?,
            created_time: read_timestamp(row, 2)?,
            last_write_time: read_timestamp(row, 3)?,
            is_deleted: row.get::<_, i64>(4)? != 0,
            absolute_expiration: read_timestamp_opt(row, 5)?,
            is_archived: row.get::<_, i64>(6)? != 0,
            payload: row.get(7)?,
        })
    }

    fn from_values(values: &crate::value::ValueMap) -> crate::error::Result<Self> {
        Ok(Self {
            id: values.text("Id"),
            version: values.i64("Version"),
            created_time: values.timestamp("CreatedTime"),
            last_write_time: values.timestamp("LastWriteTime"),
            is_deleted: values.bool("IsDeleted"),
            absolute_expiration: values.timestamp_opt("AbsoluteExpiration"),
            is_archived: values.bool("IsArchived"),
            payload: values.text("Payload"),
        })
    }
}

/// Fresh store in a temp directory
pub fn test_store() -> (TempDir, Store) {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = Store::open(dir.path().join("test.db"), StoreConfig::default()).expect("store");
    (dir, store)
}
