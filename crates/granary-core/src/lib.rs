//! # granary-core
//!
//! Core abstractions for the granary warehouse-ingestion service.
//!
//! This crate provides the foundational types and traits used across all
//! granary components:
//!
//! - **Error Types**: Shared error definitions with the retryable/permanent
//!   taxonomy used by the load workers
//! - **Version Cache**: The process-wide mirror of `(table -> schema version)`
//! - **Storage Backend**: Abstract object-storage interface for manifest
//!   documents and configuration objects
//! - **Load Status**: The contract between the metadata store and the
//!   warehouse's transaction-log probe
//!
//! ## Crate Boundary
//!
//! `granary-core` is the **only** crate allowed to define shared primitives.
//! The metadata store and the warehouse adapter both depend on it and never
//! on each other; cross-component interaction happens through the traits
//! defined here.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]

pub mod error;
pub mod load_status;
pub mod observability;
pub mod storage;
pub mod versions;

pub use error::{Error, Result};
pub use load_status::{LoadChecker, LoadStatus};
pub use observability::{init_logging, LogFormat};
pub use storage::{backend_from_location, FsBackend, MemoryBackend, StorageBackend};
pub use versions::VersionCache;
