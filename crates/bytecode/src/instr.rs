//! The instruction set.
//!
//! Symbol operands (`flag`, `counter`, `node`, ...) are indices into the
//! program's [`SymbolTable`](crate::SymbolTable); `target` operands are
//! instruction addresses.

use serde::{Deserialize, Serialize};
use weft_core::Value;

/// An instruction address.
pub type Addr = u32;

/// Registers per fiber.
pub const REGISTER_COUNT: usize = 8;

/// Where a message wait takes its correlation value from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum Correlation {
    /// The instance's correlation id.
    Instance,
    /// A fiber register, filled by the preceding instructions.
    Register {
        /// Register index.
        reg: u8,
    },
}

/// A business error code and the address handling it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRoute {
    /// Error code reported by the executor.
    pub code: String,
    /// Handler address.
    pub target: Addr,
}

/// The wake condition of one race arm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArmTrigger {
    /// Fires after `ms` milliseconds.
    Timer {
        /// Delay in milliseconds.
        ms: u64,
    },
    /// Fires on a correlated message.
    Message {
        /// Message symbol.
        message: u32,
        /// Correlation source.
        correlation: Correlation,
    },
}

/// One arm of a [`Instr::Race`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceArmInstr {
    /// What wakes the arm.
    pub trigger: ArmTrigger,
    /// Where the winning arm continues.
    pub target: Addr,
}

/// Why a fiber faulted on purpose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FaultReason {
    /// An exclusive gateway without a default found no true condition.
    NoRoute {
        /// The gateway's node symbol.
        gateway: u32,
    },
    /// An inclusive gateway without a default selected no branch.
    NoBranch {
        /// The gateway's node symbol.
        gateway: u32,
    },
}

/// A single VM instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instr {
    // -- stack and data ------------------------------------------------------
    /// Push a constant.
    Push {
        /// The constant.
        value: Value,
    },
    /// Discard the top of stack.
    Pop,
    /// Push an instance flag (`Bool(false)` when unset).
    LoadFlag {
        /// Flag symbol.
        flag: u32,
    },
    /// Pop into an instance flag.
    StoreFlag {
        /// Flag symbol.
        flag: u32,
    },
    /// Push a fiber register.
    LoadReg {
        /// Register index.
        reg: u8,
    },
    /// Pop into a fiber register.
    StoreReg {
        /// Register index.
        reg: u8,
    },
    /// Push an instance counter (`0` when unset).
    LoadCounter {
        /// Counter symbol.
        counter: u32,
    },
    /// Increment an instance counter and the fiber's loop epoch.
    IncCounter {
        /// Counter symbol.
        counter: u32,
    },
    /// Pop two values, push whether they are equal.
    Eq,
    /// Pop `b` then `a` (integers), push `a < b`.
    Lt,
    /// Pop a value, push the negation of its truthiness.
    Not,
    /// Pop two values, push the conjunction of their truthiness.
    And,
    /// Pop two values, push the disjunction of their truthiness.
    Or,

    // -- control flow --------------------------------------------------------
    /// Unconditional jump.
    Jump {
        /// Destination.
        target: Addr,
    },
    /// Pop; jump when truthy.
    BrIf {
        /// Destination.
        target: Addr,
    },
    /// Pop; jump when falsy.
    BrIfNot {
        /// Destination.
        target: Addr,
    },

    // -- external work and waits ---------------------------------------------
    /// Create a job and park until it completes; resumes at the next address.
    Dispatch {
        /// Task-type symbol.
        task_type: u32,
        /// The ServiceTask's node symbol.
        node: u32,
        /// Retries after the first attempt.
        retries: u32,
        /// Business error handlers.
        error_routes: Vec<ErrorRoute>,
    },
    /// Park until `ms` milliseconds have passed.
    WaitTimer {
        /// Delay in milliseconds.
        ms: u64,
    },
    /// Park until a correlated message arrives.
    WaitMessage {
        /// Message symbol.
        message: u32,
        /// Correlation source.
        correlation: Correlation,
    },
    /// Park until a human task is completed.
    WaitHuman {
        /// Human task symbol.
        task: u32,
    },
    /// Register every arm and park; the first arm to fire wins.
    Race {
        /// The race's node symbol.
        race: u32,
        /// Arms in canonical order.
        arms: Vec<RaceArmInstr>,
    },
    /// Attach a boundary timer watchdog to the current fiber.
    Watch {
        /// The boundary's node symbol.
        boundary: u32,
        /// Delay in milliseconds.
        ms: u64,
        /// Whether firing cancels the host.
        interrupting: bool,
        /// Boundary target address.
        target: Addr,
    },
    /// Detach the watchdog if it has not fired.
    Unwatch {
        /// The boundary's node symbol.
        boundary: u32,
    },

    // -- concurrency ---------------------------------------------------------
    /// Spawn one fiber per target and expect all of them at `join`.
    Fork {
        /// The paired join's node symbol.
        join: u32,
        /// Branch entry addresses.
        targets: Vec<Addr>,
    },
    /// Pop one condition per target (the last target's on top), spawn a
    /// fiber for each true one and expect exactly that many at `join`.
    ForkInclusive {
        /// The paired join's node symbol.
        join: u32,
        /// Branch entry addresses.
        targets: Vec<Addr>,
        /// Taken alone when no condition holds.
        default: Option<Addr>,
        /// The split's node symbol, for fault reporting.
        gateway: u32,
    },
    /// Arrive at a join; the last arrival continues at the next address.
    Join {
        /// The join's node symbol.
        join: u32,
    },

    // -- termination ---------------------------------------------------------
    /// Finish this fiber.
    End,
    /// Finish every fiber of the instance.
    EndTerminate,
    /// Raise an incident on this fiber.
    Fault {
        /// Why.
        reason: FaultReason,
    },
}

impl Instr {
    /// Short lowercase name, as used in listings.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Self::Push { .. } => "push",
            Self::Pop => "pop",
            Self::LoadFlag { .. } => "load_flag",
            Self::StoreFlag { .. } => "store_flag",
            Self::LoadReg { .. } => "load_reg",
            Self::StoreReg { .. } => "store_reg",
            Self::LoadCounter { .. } => "load_counter",
            Self::IncCounter { .. } => "inc_counter",
            Self::Eq => "eq",
            Self::Lt => "lt",
            Self::Not => "not",
            Self::And => "and",
            Self::Or => "or",
            Self::Jump { .. } => "jump",
            Self::BrIf { .. } => "br_if",
            Self::BrIfNot { .. } => "br_if_not",
            Self::Dispatch { .. } => "dispatch",
            Self::WaitTimer { .. } => "wait_timer",
            Self::WaitMessage { .. } => "wait_message",
            Self::WaitHuman { .. } => "wait_human",
            Self::Race { .. } => "race",
            Self::Watch { .. } => "watch",
            Self::Unwatch { .. } => "unwatch",
            Self::Fork { .. } => "fork",
            Self::ForkInclusive { .. } => "fork_inclusive",
            Self::Join { .. } => "join",
            Self::End => "end",
            Self::EndTerminate => "end_terminate",
            Self::Fault { .. } => "fault",
        }
    }

    /// Every address this instruction may transfer control to, excluding
    /// plain fall-through.
    #[must_use]
    pub fn targets(&self) -> Vec<Addr> {
        let mut out = Vec::new();
        match self {
            Self::Jump { target } | Self::BrIf { target } | Self::BrIfNot { target } => out.push(*target),
            Self::Watch { target, .. } => out.push(*target),
            Self::Dispatch { error_routes, .. } => out.extend(error_routes.iter().map(|r| r.target)),
            Self::Race { arms, .. } => out.extend(arms.iter().map(|a| a.target)),
            Self::Fork { targets, .. } => out.extend(targets.iter().copied()),
            Self::ForkInclusive { targets, default, .. } => {
                out.extend(targets.iter().copied());
                out.extend(default.iter().copied());
            }
            _ => {}
        }
        out
    }

    /// Mutable access to every target operand, for label patching.
    pub fn targets_mut(&mut self) -> Vec<&mut Addr> {
        match self {
            Self::Jump { target } | Self::BrIf { target } | Self::BrIfNot { target } => vec![target],
            Self::Watch { target, .. } => vec![target],
            Self::Dispatch { error_routes, .. } => error_routes.iter_mut().map(|r| &mut r.target).collect(),
            Self::Race { arms, .. } => arms.iter_mut().map(|a| &mut a.target).collect(),
            Self::Fork { targets, .. } => targets.iter_mut().collect(),
            Self::ForkInclusive { targets, default, .. } => {
                targets.iter_mut().chain(default.iter_mut()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Whether the fiber parks after executing this instruction.
    #[must_use]
    pub fn suspends(&self) -> bool {
        matches!(
            self,
            Self::Dispatch { .. }
                | Self::WaitTimer { .. }
                | Self::WaitMessage { .. }
                | Self::WaitHuman { .. }
                | Self::Race { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_uses_snake_case_op_tag() {
        let json = serde_json::to_value(Instr::BrIfNot { target: 7 }).unwrap();
        assert_eq!(json["op"], "br_if_not");
        assert_eq!(json["target"], 7);
    }

    #[test]
    fn targets_mut_patches_every_operand() {
        let mut instr = Instr::ForkInclusive {
            join: 0,
            targets: vec![1, 2],
            default: Some(3),
            gateway: 1,
        };
        for t in instr.targets_mut() {
            *t += 10;
        }
        assert_eq!(instr.targets(), vec![11, 12, 13]);
    }

    #[test]
    fn dispatch_targets_are_error_routes() {
        let instr = Instr::Dispatch {
            task_type: 0,
            node: 0,
            retries: 2,
            error_routes: vec![ErrorRoute {
                code: "E".into(),
                target: 9,
            }],
        };
        assert_eq!(instr.targets(), vec![9]);
        assert!(instr.suspends());
    }

    #[test]
    fn mnemonic_matches_serde_tag() {
        for instr in [Instr::Pop, Instr::EndTerminate, Instr::Join { join: 0 }] {
            let json = serde_json::to_value(&instr).unwrap();
            assert_eq!(json["op"], instr.mnemonic());
        }
    }
}
