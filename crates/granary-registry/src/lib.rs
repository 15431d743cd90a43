//! # granary-registry
//!
//! Clients for the two external sources of schema truth:
//!
//! - the schema registry, which publishes the ordered DDL operations that
//!   take a table to a target version, and
//! - the ingest allow-list, a JSON document in object storage naming the
//!   tables eligible for warehouse loading.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod allowlist;
pub mod client;

pub use allowlist::{MetadataLoader, TableMetadata};
pub use client::{HttpRegistryClient, RegistryClient, StaticRegistry};
