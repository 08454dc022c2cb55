//! Compiler error types.

use std::fmt;

use weft_bytecode::BytecodeError;
use weft_ir::{NodeKey, StructuralError};

/// An internal invariant broken while lowering already-verified input.
///
/// Any of these indicates a defect in the verifier or the lowerer, never a
/// problem with the user's graph.
#[derive(Debug, thiserror::Error)]
pub enum LoweringError {
    /// A diverging gateway has no recorded join partner.
    #[error("gateway {0} has no paired join")]
    UnpairedGateway(NodeKey),

    /// A jump refers to a node that was never emitted.
    #[error("label for node {0} was never placed")]
    UnplacedLabel(NodeKey),

    /// A node expected to have a flow has none.
    #[error("node {0} has no outgoing flow")]
    MissingFlow(NodeKey),

    /// A race has more message arms than the fiber has registers.
    #[error("race {race} needs {needed} correlation registers, only {available} exist")]
    TooManyArms {
        /// The race node.
        race: NodeKey,
        /// Registers required.
        needed: usize,
        /// Registers available.
        available: usize,
    },

    /// A symbol table rejected a name.
    #[error("could not intern symbol {0:?}")]
    Symbol(String),

    /// The assembled program failed validation.
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),
}

/// The compiler phase a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileStage {
    /// Structural verification.
    Verify,
    /// Lowering to bytecode.
    Lower,
}

impl fmt::Display for CompileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Verify => "verify",
            Self::Lower => "lower",
        })
    }
}

/// A failed compile call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{stage} failed: {}", messages.join("; "))]
pub struct CompileError {
    /// Where it failed.
    pub stage: CompileStage,
    /// One message per problem.
    pub messages: Vec<String>,
}

impl From<Vec<StructuralError>> for CompileError {
    fn from(errors: Vec<StructuralError>) -> Self {
        Self {
            stage: CompileStage::Verify,
            messages: errors.iter().map(ToString::to_string).collect(),
        }
    }
}

impl From<LoweringError> for CompileError {
    fn from(error: LoweringError) -> Self {
        Self {
            stage: CompileStage::Lower,
            messages: vec![error.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_display_joins_messages() {
        let err = CompileError::from(vec![
            StructuralError::MissingStart,
            StructuralError::EmptyRace(NodeKey::new("r").unwrap()),
        ]);
        assert_eq!(err.stage, CompileStage::Verify);
        assert_eq!(err.messages.len(), 2);
        assert!(err.to_string().starts_with("verify failed: process has no start node; "));
    }

    #[test]
    fn lowering_error_maps_to_lower_stage() {
        let err = CompileError::from(LoweringError::UnpairedGateway(NodeKey::new("g").unwrap()));
        assert_eq!(err.stage, CompileStage::Lower);
        assert_eq!(err.messages, vec!["gateway g has no paired join".to_owned()]);
    }
}
