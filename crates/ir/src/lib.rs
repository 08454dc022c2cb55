#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Weft IR
//!
//! The typed graph a front-end hands to the compiler, and the checks that
//! decide whether it is executable. It includes:
//!
//! - [`Node`] and [`NodeKind`], the closed set of process elements
//! - [`Edge`] and [`Condition`] for sequence flows, defaults and error routes
//! - [`ProcessGraph`] (a `petgraph` wrapper) with canonical successor order
//! - [`ProcessBuilder`] for fluent construction
//! - [`verify`] and [`VerifiedGraph`], the only door into lowering

pub mod builder;
pub mod condition;
pub mod edge;
pub mod error;
pub mod graph;
pub mod node;
pub mod verify;

pub use builder::ProcessBuilder;
pub use condition::Condition;
pub use edge::Edge;
pub use error::{IrError, StructuralError};
pub use graph::ProcessGraph;
pub use node::{GatewayDirection, GatewayKind, Node, NodeKind, RaceArm, RaceTrigger};
pub use verify::{GatewayPair, VerifiedGraph, verify};
pub use weft_core::NodeKey;
