#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Weft Storage
//!
//! The durable store is the single source of truth for running processes.
//! Every state change arrives as one [`Transition`](weft_execution::Transition)
//! and is applied atomically under an optimistic version check.
//!
//! - [`ProcessStore`]: the storage trait used by the engine
//! - [`MemoryStore`]: in-process backend for tests and embedding
//! - `PgStore`: PostgreSQL backend (feature `postgres`)

pub mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::{PgStore, PgStoreConfig};
pub use store::{FiberRef, ProcessStore};
