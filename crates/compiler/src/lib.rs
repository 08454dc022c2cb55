#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Weft Compiler
//!
//! Turns a [`ProcessGraph`](weft_ir::ProcessGraph) into a content-hashed
//! [`Program`](weft_bytecode::Program):
//!
//! - [`compile`] runs verification then lowering and reports failures with
//!   their [`CompileStage`]
//! - [`lower`] is the lowering step alone; it only accepts a
//!   [`VerifiedGraph`](weft_ir::VerifiedGraph)
//!
//! Lowering is deterministic: equal graphs, whatever order their nodes and
//! flows were inserted in, produce byte-identical programs.

mod assembler;
pub mod error;
pub mod lower;
pub mod pipeline;

pub use error::{CompileError, CompileStage, LoweringError};
pub use lower::lower;
pub use pipeline::compile;
