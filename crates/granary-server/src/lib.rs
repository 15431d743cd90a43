//! # granary-server
//!
//! The loader process: a worker pool draining ready manifests into the
//! warehouse, the schema migrator, and the localhost control surface.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod control;
pub mod metrics;
pub mod migrator;
pub mod worker;

pub use control::{control_router, ControlState};
pub use migrator::{IncrementError, Migrator, MigratorConfig, VersionIncrement};
pub use worker::spawn_workers;
