//! # granary-ingest
//!
//! The deduplicating ingress: pulls fragment announcements from the message
//! queue, drops replayed deliveries through a bounded LRU filter, admits
//! tables via the registry allow-list, and persists fragment pointers into
//! the metadata store.
//!
//! The queue SDK sits behind [`QueueConsumer`]; [`MemoryQueue`] backs the
//! tests and [`SqsQueue`] talks to an SQS-compatible endpoint.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod dedup;
pub mod listener;
pub mod metrics;
pub mod queue;
pub mod request;
pub mod sqs;

pub use dedup::DedupFilter;
pub use listener::{Ingress, ListenerConfig};
pub use queue::{MemoryQueue, QueueConsumer, QueueMessage};
pub use request::{HmacVerifier, PermissiveVerifier, RequestVerifier, RowCopyRequest};
pub use sqs::{SqsConfig, SqsQueue};
