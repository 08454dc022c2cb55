#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Weft Execution
//!
//! The durable model of running processes. This crate holds data and pure
//! rules only; the interpreter lives in `weft-vm` and orchestration in
//! `weft-engine`. It defines:
//!
//! - [`ProcessInstance`] and [`InstanceStatus`]
//! - [`Fiber`] and its [`WaitState`]
//! - [`JoinBarrier`] and the [`join`] arrival rules
//! - [`Job`], [`JobKey`], and the [`RetryPolicy`] backoff schedule
//! - [`Incident`] and [`DeadLetter`] records
//! - [`RuntimeEvent`], the append-only event log payload
//! - [`WakeSignal`], the external wake-up input
//! - [`InstanceState`] and [`Transition`], the unit of atomic persistence
//! - status state machines validated by the [`transition`] module

pub mod dead_letter;
pub mod error;
pub mod event;
pub mod fiber;
pub mod incident;
pub mod instance;
pub mod job;
pub mod join;
pub mod retry;
pub mod signal;
pub mod state;
pub mod status;
pub mod transition;

pub use dead_letter::DeadLetter;
pub use error::ExecutionError;
pub use event::{EventRecord, RuntimeEvent};
pub use fiber::{ArmWait, ArmWaitTrigger, Fiber, JoinTicket, WaitState, Watch};
pub use incident::{ErrorClass, Incident, IncidentStatus};
pub use instance::ProcessInstance;
pub use job::{CompletionRecord, FailureKind, Job, JobCompletion, JobFailure, JobKey, JobStatus};
pub use join::{Arrival, JoinBarrier};
pub use retry::RetryPolicy;
pub use signal::{WakeKind, WakeSignal};
pub use state::{InstanceState, JobWrite, Transition};
pub use status::InstanceStatus;
