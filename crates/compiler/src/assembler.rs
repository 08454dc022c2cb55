//! Instruction buffer with symbolic labels.

use std::collections::BTreeMap;

use weft_bytecode::{Addr, Instr, Program, SymbolKind, SymbolTable};
use weft_ir::NodeKey;

use crate::error::LoweringError;

/// A jump destination that may not have an address yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Label {
    /// The first instruction of a node's block.
    Node(NodeKey),
    /// A back-edge stub, by allocation order.
    Stub(usize),
}

/// Collects instructions, interns symbols, and patches labels at the end.
#[derive(Debug, Default)]
pub(crate) struct Assembler {
    code: Vec<Instr>,
    symbols: SymbolTable,
    /// Instruction address and its labels, in `targets_mut` order.
    fixups: Vec<(usize, Vec<Label>)>,
    stubs: BTreeMap<usize, Addr>,
}

impl Assembler {
    /// Address the next instruction will get.
    pub(crate) fn here(&self) -> Addr {
        self.code.len() as Addr
    }

    /// Mark the start of a node's block.
    pub(crate) fn place_node(&mut self, key: &NodeKey) {
        let addr = self.here();
        self.symbols.node_addr.insert(key.clone(), addr);
    }

    /// Mark the start of a stub.
    pub(crate) fn place_stub(&mut self, stub: usize) {
        let addr = self.here();
        self.stubs.insert(stub, addr);
    }

    /// Append an instruction without target operands.
    pub(crate) fn emit(&mut self, instr: Instr) {
        self.code.push(instr);
    }

    /// Append an instruction whose targets are resolved later.
    pub(crate) fn emit_with(&mut self, instr: Instr, labels: Vec<Label>) {
        self.fixups.push((self.code.len(), labels));
        self.code.push(instr);
    }

    pub(crate) fn node(&mut self, key: &NodeKey) -> u32 {
        self.symbols.intern_node(key)
    }

    pub(crate) fn symbol(&mut self, kind: SymbolKind, name: &str) -> Result<u32, LoweringError> {
        self.symbols
            .intern(kind, name)
            .ok_or_else(|| LoweringError::Symbol(name.to_owned()))
    }

    /// Patch every label and build the program.
    pub(crate) fn finish(mut self) -> Result<Program, LoweringError> {
        for (at, labels) in std::mem::take(&mut self.fixups) {
            let mut addrs = Vec::with_capacity(labels.len());
            for label in labels {
                addrs.push(self.resolve(&label)?);
            }
            if let Some(instr) = self.code.get_mut(at) {
                for (slot, addr) in instr.targets_mut().into_iter().zip(addrs) {
                    *slot = addr;
                }
            }
        }
        Ok(Program::new(self.code, self.symbols)?)
    }

    fn resolve(&self, label: &Label) -> Result<Addr, LoweringError> {
        match label {
            Label::Node(key) => self
                .symbols
                .node_addr
                .get(key)
                .copied()
                .ok_or_else(|| LoweringError::UnplacedLabel(key.clone())),
            Label::Stub(n) => self
                .stubs
                .get(n)
                .copied()
                .ok_or_else(|| LoweringError::Symbol(format!("stub {n}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> NodeKey {
        NodeKey::new(s).unwrap()
    }

    #[test]
    fn forward_labels_are_patched() {
        let mut asm = Assembler::default();
        asm.place_node(&key("a"));
        asm.emit_with(Instr::Jump { target: 0 }, vec![Label::Node(key("b"))]);
        asm.emit(Instr::Pop);
        asm.place_node(&key("b"));
        asm.emit(Instr::End);
        let program = asm.finish().unwrap();
        assert_eq!(program.get(0), Some(&Instr::Jump { target: 2 }));
    }

    #[test]
    fn missing_label_is_an_error() {
        let mut asm = Assembler::default();
        asm.emit_with(Instr::Jump { target: 0 }, vec![Label::Node(key("nowhere"))]);
        assert!(matches!(asm.finish(), Err(LoweringError::UnplacedLabel(k)) if k == key("nowhere")));
    }
}
