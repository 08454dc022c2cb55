#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Weft Bytecode
//!
//! The executable form of a process. It includes:
//!
//! - [`Instr`], the closed instruction set interpreted by the fiber VM
//! - [`Program`], instructions plus a [`SymbolTable`], addressed by a
//!   [`ProgramHash`] over its canonical encoding
//! - [`ProgramCache`], an explicit hash-keyed cache owned by the embedder
//! - [`Program::disassemble`] for human-readable listings

pub mod cache;
pub mod error;
pub mod instr;
pub mod program;

pub use cache::ProgramCache;
pub use error::BytecodeError;
pub use instr::{REGISTER_COUNT, Addr, ArmTrigger, Correlation, ErrorRoute, FaultReason, Instr, RaceArmInstr};
pub use program::{FORMAT_VERSION, Program, ProgramHash, SymbolKind, SymbolTable};
