#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Weft Core
//!
//! Fundamental building blocks shared by every Weft crate:
//!
//! - **Identifiers**: [`InstanceId`], [`FiberId`], [`IncidentId`] (UUID newtypes)
//! - **Symbolic keys**: [`NodeKey`], the validated id of a process node
//! - **Flag values**: [`Value`], the scalar stored in an instance's flag set
//! - **Time**: the [`Clock`] abstraction with [`SystemClock`] and [`ManualClock`]
//! - **Digests**: SHA-256 helpers used for payload and program hashing

pub mod clock;
pub mod digest;
pub mod id;
pub mod keys;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock, after};
pub use digest::{json_digest, sha256_hex};
pub use id::*;
pub use keys::{NodeKey, NodeKeyError};
pub use value::Value;
