//! Bytecode error types.

use crate::instr::Addr;
use crate::program::SymbolKind;

/// Errors raised while assembling, validating or loading a program.
#[derive(Debug, thiserror::Error)]
pub enum BytecodeError {
    /// The program has no instructions.
    #[error("program has no instructions")]
    Empty,

    /// A jump or branch target lies outside the program.
    #[error("instruction at {at} targets {target}, past the end of the program ({len} instructions)")]
    TargetOutOfRange {
        /// Address of the offending instruction.
        at: Addr,
        /// The bad target.
        target: Addr,
        /// Program length.
        len: usize,
    },

    /// An instruction references a symbol index that is not interned.
    #[error("unknown {kind} symbol #{index}")]
    UnknownSymbol {
        /// Which table was consulted.
        kind: SymbolKind,
        /// The missing index.
        index: u32,
    },

    /// The stored hash does not match the recomputed one.
    #[error("program hash mismatch: stored {stored}, computed {computed}")]
    HashMismatch {
        /// Hash carried by the program.
        stored: String,
        /// Hash recomputed from its contents.
        computed: String,
    },

    /// A string is not a well-formed program hash.
    #[error("invalid program hash: {0:?}")]
    InvalidHash(String),

    /// Canonical encoding failed.
    #[error("encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}
