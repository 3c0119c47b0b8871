//! Database module: work-queue storage on SQLite.
//!
//! - `model`: maps stored rows back into domain types.
//! - `repo`: SQL-only functions over the `queue_items` table.
//!
//! Callers use `crate::db::*`; queue semantics (notification, allowed
//! transitions) are layered on top in `crate::queue`.

pub mod model;
pub mod repo;

pub use repo::*;
