//! Programs, symbol tables and content hashes.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use weft_core::{NodeKey, json_digest};

use crate::error::BytecodeError;
use crate::instr::{Addr, ArmTrigger, Correlation, FaultReason, Instr};

/// Encoding version mixed into every hash. Bump on any change to the
/// instruction set or its serialisation.
pub const FORMAT_VERSION: u32 = 1;

/// The symbol tables of a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    /// Node keys.
    Node,
    /// Instance flags.
    Flag,
    /// Instance counters.
    Counter,
    /// ServiceTask task types.
    TaskType,
    /// Message names.
    Message,
    /// Human task names.
    HumanTask,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Node => "node",
            Self::Flag => "flag",
            Self::Counter => "counter",
            Self::TaskType => "task type",
            Self::Message => "message",
            Self::HumanTask => "human task",
        })
    }
}

/// Interned names referenced by instructions, plus the node entry map.
///
/// Indices are assigned in first-use order during lowering, which is itself
/// deterministic, so equal graphs produce equal tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolTable {
    /// Entry address of every lowered node.
    pub node_addr: BTreeMap<NodeKey, Addr>,
    /// Node symbols.
    pub nodes: Vec<NodeKey>,
    /// Flag symbols.
    pub flags: Vec<String>,
    /// Counter symbols.
    pub counters: Vec<String>,
    /// Task type symbols.
    pub task_types: Vec<String>,
    /// Message symbols.
    pub messages: Vec<String>,
    /// Human task symbols.
    pub human_tasks: Vec<String>,
}

impl SymbolTable {
    /// Intern a node key.
    pub fn intern_node(&mut self, key: &NodeKey) -> u32 {
        if let Some(pos) = self.nodes.iter().position(|k| k == key) {
            return pos as u32;
        }
        self.nodes.push(key.clone());
        (self.nodes.len() - 1) as u32
    }

    /// Intern a name in one of the string tables.
    ///
    /// Returns `None` for [`SymbolKind::Node`]; node keys go through
    /// [`intern_node`](Self::intern_node).
    pub fn intern(&mut self, kind: SymbolKind, name: &str) -> Option<u32> {
        let table = self.table_mut(kind)?;
        if let Some(pos) = table.iter().position(|n| n == name) {
            return Some(pos as u32);
        }
        table.push(name.to_owned());
        Some((table.len() - 1) as u32)
    }

    fn table_mut(&mut self, kind: SymbolKind) -> Option<&mut Vec<String>> {
        match kind {
            SymbolKind::Node => None,
            SymbolKind::Flag => Some(&mut self.flags),
            SymbolKind::Counter => Some(&mut self.counters),
            SymbolKind::TaskType => Some(&mut self.task_types),
            SymbolKind::Message => Some(&mut self.messages),
            SymbolKind::HumanTask => Some(&mut self.human_tasks),
        }
    }

    /// Resolve a node symbol.
    pub fn node(&self, index: u32) -> Result<&NodeKey, BytecodeError> {
        self.nodes
            .get(index as usize)
            .ok_or(BytecodeError::UnknownSymbol {
                kind: SymbolKind::Node,
                index,
            })
    }

    /// Resolve a symbol in any table to its name.
    pub fn resolve(&self, kind: SymbolKind, index: u32) -> Result<&str, BytecodeError> {
        let table = match kind {
            SymbolKind::Node => return self.node(index).map(NodeKey::as_str),
            SymbolKind::Flag => &self.flags,
            SymbolKind::Counter => &self.counters,
            SymbolKind::TaskType => &self.task_types,
            SymbolKind::Message => &self.messages,
            SymbolKind::HumanTask => &self.human_tasks,
        };
        table
            .get(index as usize)
            .map(String::as_str)
            .ok_or(BytecodeError::UnknownSymbol { kind, index })
    }

    /// The node whose block starts at `addr`, if any.
    #[must_use]
    pub fn node_at(&self, addr: Addr) -> Option<&NodeKey> {
        self.node_addr.iter().find(|(_, a)| **a == addr).map(|(k, _)| k)
    }

    /// The node whose block contains `addr`: the one with the greatest
    /// entry address not after it.
    #[must_use]
    pub fn node_containing(&self, addr: Addr) -> Option<&NodeKey> {
        self.node_addr
            .iter()
            .filter(|(_, a)| **a <= addr)
            .max_by_key(|(_, a)| **a)
            .map(|(k, _)| k)
    }
}

/// A 256-bit content hash, rendered as 64 lowercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProgramHash(String);

impl ProgramHash {
    /// Parse and validate a hex hash.
    pub fn parse(s: &str) -> Result<Self, BytecodeError> {
        let valid = s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(s.to_owned()))
        } else {
            Err(BytecodeError::InvalidHash(s.to_owned()))
        }
    }

    /// The full hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first twelve digits, for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ProgramHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProgramHash {
    type Err = BytecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ProgramHash {
    type Error = BytecodeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ProgramHash> for String {
    fn from(hash: ProgramHash) -> Self {
        hash.0
    }
}

#[derive(Serialize)]
struct HashInput<'a> {
    format: u32,
    instructions: &'a [Instr],
    symbols: &'a SymbolTable,
}

/// An executable, content-addressed program.
///
/// Two programs with the same hash have identical instructions and symbols.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    instructions: Vec<Instr>,
    symbols: SymbolTable,
    hash: ProgramHash,
}

impl Program {
    /// Validate the instruction stream and compute its hash.
    pub fn new(instructions: Vec<Instr>, symbols: SymbolTable) -> Result<Self, BytecodeError> {
        let hash = compute_hash(&instructions, &symbols)?;
        let program = Self {
            instructions,
            symbols,
            hash,
        };
        program.validate()?;
        Ok(program)
    }

    /// Decode a stored program, rejecting it if its hash does not match.
    pub fn from_json(json: &str) -> Result<Self, BytecodeError> {
        let program: Self = serde_json::from_str(json)?;
        program.validate()?;
        program.verify_hash()?;
        Ok(program)
    }

    /// Encode for storage.
    pub fn to_json(&self) -> Result<String, BytecodeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The content hash.
    #[must_use]
    pub fn hash(&self) -> &ProgramHash {
        &self.hash
    }

    /// All instructions in address order.
    #[must_use]
    pub fn instructions(&self) -> &[Instr] {
        &self.instructions
    }

    /// The instruction at `addr`.
    #[must_use]
    pub fn get(&self, addr: Addr) -> Option<&Instr> {
        self.instructions.get(addr as usize)
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Whether the program has no instructions. Never true for a
    /// validated program.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Symbol tables.
    #[must_use]
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Entry address of a node.
    #[must_use]
    pub fn address_of(&self, node: &NodeKey) -> Option<Addr> {
        self.symbols.node_addr.get(node).copied()
    }

    /// Recompute the hash and compare it with the stored one.
    pub fn verify_hash(&self) -> Result<(), BytecodeError> {
        let computed = compute_hash(&self.instructions, &self.symbols)?;
        if computed == self.hash {
            Ok(())
        } else {
            Err(BytecodeError::HashMismatch {
                stored: self.hash.to_string(),
                computed: computed.to_string(),
            })
        }
    }

    /// Check every target and symbol operand.
    pub fn validate(&self) -> Result<(), BytecodeError> {
        if self.instructions.is_empty() {
            return Err(BytecodeError::Empty);
        }
        let len = self.instructions.len();
        for (at, instr) in self.instructions.iter().enumerate() {
            for target in instr.targets() {
                if target as usize >= len {
                    return Err(BytecodeError::TargetOutOfRange {
                        at: at as Addr,
                        target,
                        len,
                    });
                }
            }
            for (kind, index) in symbol_operands(instr) {
                self.symbols.resolve(kind, index)?;
            }
        }
        for addr in self.symbols.node_addr.values() {
            if *addr as usize >= len {
                return Err(BytecodeError::TargetOutOfRange {
                    at: *addr,
                    target: *addr,
                    len,
                });
            }
        }
        Ok(())
    }

    /// Render a listing: one line per instruction, with node labels.
    #[must_use]
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "; program {} ({} instructions)", self.hash, self.len());
        for (addr, instr) in self.instructions.iter().enumerate() {
            let addr = addr as Addr;
            for (key, _) in self.symbols.node_addr.iter().filter(|(_, a)| **a == addr) {
                let _ = writeln!(out, "{key}:");
            }
            let _ = writeln!(out, "  {addr:04}  {}", self.render(instr));
        }
        out
    }

    fn render(&self, instr: &Instr) -> String {
        let sym = |kind, index| {
            self.symbols
                .resolve(kind, index)
                .map_or_else(|_| format!("#{index}?"), str::to_owned)
        };
        let corr = |c: &Correlation| match c {
            Correlation::Instance => "instance".to_owned(),
            Correlation::Register { reg } => format!("r{reg}"),
        };
        let op = instr.mnemonic();
        match instr {
            Instr::Push { value } => format!("{op} {value:?}"),
            Instr::LoadFlag { flag } | Instr::StoreFlag { flag } => format!("{op} {}", sym(SymbolKind::Flag, *flag)),
            Instr::LoadReg { reg } | Instr::StoreReg { reg } => format!("{op} r{reg}"),
            Instr::LoadCounter { counter } | Instr::IncCounter { counter } => {
                format!("{op} {}", sym(SymbolKind::Counter, *counter))
            }
            Instr::Jump { target } | Instr::BrIf { target } | Instr::BrIfNot { target } => format!("{op} {target:04}"),
            Instr::Dispatch {
                task_type,
                node,
                retries,
                error_routes,
            } => {
                let mut s = format!(
                    "{op} {} type={} retries={retries}",
                    sym(SymbolKind::Node, *node),
                    sym(SymbolKind::TaskType, *task_type)
                );
                for route in error_routes {
                    let _ = write!(s, " on {}->{:04}", route.code, route.target);
                }
                s
            }
            Instr::WaitTimer { ms } => format!("{op} {ms}ms"),
            Instr::WaitMessage { message, correlation } => {
                format!("{op} {} corr={}", sym(SymbolKind::Message, *message), corr(correlation))
            }
            Instr::WaitHuman { task } => format!("{op} {}", sym(SymbolKind::HumanTask, *task)),
            Instr::Race { race, arms } => {
                let mut s = format!("{op} {}", sym(SymbolKind::Node, *race));
                for arm in arms {
                    match &arm.trigger {
                        ArmTrigger::Timer { ms } => {
                            let _ = write!(s, " [timer {ms}ms->{:04}]", arm.target);
                        }
                        ArmTrigger::Message { message, correlation } => {
                            let _ = write!(
                                s,
                                " [message {} corr={}->{:04}]",
                                sym(SymbolKind::Message, *message),
                                corr(correlation),
                                arm.target
                            );
                        }
                    }
                }
                s
            }
            Instr::Watch {
                boundary,
                ms,
                interrupting,
                target,
            } => format!(
                "{op} {} {ms}ms {} ->{target:04}",
                sym(SymbolKind::Node, *boundary),
                if *interrupting { "interrupting" } else { "non-interrupting" }
            ),
            Instr::Unwatch { boundary } => format!("{op} {}", sym(SymbolKind::Node, *boundary)),
            Instr::Fork { join, targets } => format!(
                "{op} join={} {}",
                sym(SymbolKind::Node, *join),
                addr_list(targets)
            ),
            Instr::ForkInclusive {
                join, targets, default, ..
            } => {
                let mut s = format!("{op} join={} {}", sym(SymbolKind::Node, *join), addr_list(targets));
                if let Some(d) = default {
                    let _ = write!(s, " default={d:04}");
                }
                s
            }
            Instr::Join { join } => format!("{op} {}", sym(SymbolKind::Node, *join)),
            Instr::Fault { reason } => match reason {
                FaultReason::NoRoute { gateway } => format!("{op} no_route {}", sym(SymbolKind::Node, *gateway)),
                FaultReason::NoBranch { gateway } => format!("{op} no_branch {}", sym(SymbolKind::Node, *gateway)),
            },
            Instr::Pop | Instr::Eq | Instr::Lt | Instr::Not | Instr::And | Instr::Or | Instr::End | Instr::EndTerminate => {
                op.to_owned()
            }
        }
    }
}

fn addr_list(addrs: &[Addr]) -> String {
    let parts: Vec<String> = addrs.iter().map(|a| format!("{a:04}")).collect();
    format!("[{}]", parts.join(", "))
}

fn compute_hash(instructions: &[Instr], symbols: &SymbolTable) -> Result<ProgramHash, BytecodeError> {
    let digest = json_digest(&HashInput {
        format: FORMAT_VERSION,
        instructions,
        symbols,
    })?;
    ProgramHash::parse(&digest)
}

fn symbol_operands(instr: &Instr) -> Vec<(SymbolKind, u32)> {
    let mut out = Vec::new();
    match instr {
        Instr::LoadFlag { flag } | Instr::StoreFlag { flag } => out.push((SymbolKind::Flag, *flag)),
        Instr::LoadCounter { counter } | Instr::IncCounter { counter } => out.push((SymbolKind::Counter, *counter)),
        Instr::Dispatch { task_type, node, .. } => {
            out.push((SymbolKind::TaskType, *task_type));
            out.push((SymbolKind::Node, *node));
        }
        Instr::WaitMessage { message, .. } => out.push((SymbolKind::Message, *message)),
        Instr::WaitHuman { task } => out.push((SymbolKind::HumanTask, *task)),
        Instr::Race { race, arms } => {
            out.push((SymbolKind::Node, *race));
            for arm in arms {
                if let ArmTrigger::Message { message, .. } = &arm.trigger {
                    out.push((SymbolKind::Message, *message));
                }
            }
        }
        Instr::Watch { boundary, .. } | Instr::Unwatch { boundary } => out.push((SymbolKind::Node, *boundary)),
        Instr::Fork { join, .. } | Instr::Join { join } => out.push((SymbolKind::Node, *join)),
        Instr::ForkInclusive { join, gateway, .. } => {
            out.push((SymbolKind::Node, *join));
            out.push((SymbolKind::Node, *gateway));
        }
        Instr::Fault { reason } => match reason {
            FaultReason::NoRoute { gateway } | FaultReason::NoBranch { gateway } => {
                out.push((SymbolKind::Node, *gateway));
            }
        },
        _ => {}
    }
    out
}
