#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Weft Engine
//!
//! The runtime around the VM: deploys programs, starts and drives
//! instances, and is the only writer of durable state.
//!
//! - [`Engine`]: deploy, start, cancel, inspect and recover instances
//! - job dispatch: [`Engine::activate_jobs`], [`Engine::complete_job`],
//!   [`Engine::fail_job`] with backoff retries and dead-lettering
//! - incidents and the dead-letter queue: resolve, requeue, cancel, purge
//! - wake signals: [`Engine::signal`], [`Engine::correlate_message`],
//!   [`Engine::fire_due_timers`]
//! - [`WorkerPool`]: background run workers and the runnable sweep
//!
//! Every operation loads one instance, applies its effect, runs ready
//! fibers and commits the result as a single transition.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod incidents;
pub mod pool;
pub mod signals;

pub use config::EngineConfig;
pub use dispatcher::{CompletionOutcome, FailureOutcome};
pub use engine::Engine;
pub use error::EngineError;
pub use pool::WorkerPool;
pub use weft_vm::Delivery;
