// src/query/mod.rs

//! Predicate-to-SQL translation

pub mod translate;

pub use translate::{SqlFragment, translate_order_by, translate_where};
