#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Weft VM
//!
//! A stack-machine interpreter for Weft bytecode. One process instance is
//! executed by one or more fibers, stepped one at a time inside a [`Batch`]
//! so that every effect of a step lands in a single
//! [`Transition`](weft_execution::Transition).
//!
//! - [`Vm`]: runs ready fibers, delivers wake signals, resumes jobs
//! - [`Batch`]: the per-step working set
//! - [`Delivery`] and [`RunReport`]: outcomes reported to the engine

pub mod batch;
pub mod error;
pub mod machine;

pub use batch::Batch;
pub use error::VmError;
pub use machine::{DEFAULT_MAX_STEPS, Delivery, RunReport, Vm};
