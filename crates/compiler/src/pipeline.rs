//! The verify-then-lower entry point.

use weft_bytecode::Program;
use weft_ir::{ProcessGraph, VerifiedGraph};

use crate::error::CompileError;
use crate::lower::lower;

/// Verify and lower `graph`.
///
/// Structural problems are all reported together under
/// [`CompileStage::Verify`](crate::CompileStage::Verify); lowering never runs
/// on a graph that failed verification.
pub fn compile(graph: &ProcessGraph) -> Result<Program, CompileError> {
    let verified = VerifiedGraph::new(graph.clone()).map_err(|errors| {
        tracing::debug!(errors = errors.len(), "process graph failed verification");
        CompileError::from(errors)
    })?;
    let program = lower(&verified)?;
    tracing::info!(hash = %program.hash().short(), "compiled process");
    Ok(program)
}
