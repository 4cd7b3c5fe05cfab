//! Store backends.
//!
//! `in_memory` is always available and is what tests and single-process runs
//! use. `rocksdb` persists everything on disk and is compiled only with the
//! `storage-rocksdb` feature.

pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
