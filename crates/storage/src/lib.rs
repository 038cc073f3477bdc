//! Key/value stores backing the storage task.
//!
//! This crate provides a trait-based store interface with an in-memory and a
//! JSON file implementation.

#![warn(missing_docs)]

pub mod trait_;
pub mod memory;
pub mod json_storage;

pub use trait_::{Store, StoreError, Result};
pub use memory::MemoryStore;
pub use json_storage::JsonFileStore;
