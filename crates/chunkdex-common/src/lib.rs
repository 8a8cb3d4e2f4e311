//! chunkdex common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all chunkdex components.

pub mod addr;
pub mod config;
pub mod error;

pub use addr::{ADDR_SIZE, FileAddr, UNDEFINED_ADDR};
pub use config::{BTreeConfig, Bt2Config, IndexConfig, StorageConfig};
pub use error::{ChunkdexError, Result};
