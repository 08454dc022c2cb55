//! VM errors.
//!
//! Apart from [`VmError::ProgramMismatch`], these never escape a run: the
//! machine converts them into a `VmFault` incident on the faulting fiber.

use thiserror::Error;
use weft_bytecode::{Addr, BytecodeError, ProgramHash};
use weft_core::FiberId;
use weft_execution::ExecutionError;

/// Errors raised while interpreting bytecode.
#[derive(Debug, Error)]
pub enum VmError {
    /// The batch's instance is pinned to another program.
    #[error("instance runs program {expected}, machine loaded {found}")]
    ProgramMismatch {
        /// The instance's pinned program.
        expected: ProgramHash,
        /// The program given to the machine.
        found: ProgramHash,
    },

    /// The program counter points past the end of the program.
    #[error("no instruction at {pc:04}")]
    PcOutOfRange {
        /// The program counter.
        pc: Addr,
    },

    /// An instruction popped an empty stack.
    #[error("stack underflow at {pc:04}")]
    StackUnderflow {
        /// Faulting address.
        pc: Addr,
    },

    /// An operand had the wrong type.
    #[error("type mismatch at {pc:04}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Faulting address.
        pc: Addr,
        /// Expected type name.
        expected: &'static str,
        /// Actual type name.
        found: &'static str,
    },

    /// A register index is out of range.
    #[error("register r{reg} out of range at {pc:04}")]
    BadRegister {
        /// Faulting address.
        pc: Addr,
        /// Register index.
        reg: u8,
    },

    /// A fork has no branches.
    #[error("fork without branches at {pc:04}")]
    EmptyFork {
        /// Faulting address.
        pc: Addr,
    },

    /// The fiber being stepped no longer exists.
    #[error("fiber {0} not found")]
    MissingFiber(FiberId),

    /// A symbol operand could not be resolved.
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),

    /// An execution-model rule was violated.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// A payload could not be hashed.
    #[error("payload: {0}")]
    Payload(#[from] serde_json::Error),
}
