//! Control-flow recovery: turning raw bytes into functions and branches.

use std::collections::HashMap;

use crate::{Data, Disassembler, Instruction, CARTRIDGE_BASE};

/// Index of a [`Branch`] within its owning [`Function`].
///
/// Conditional instructions reference their successors by index instead of by
/// pointer, which keeps the (potentially cyclic) branch graph in one flat
/// arena inside the function.
pub type BranchId = usize;

/// One element of a branch: a plain instruction, or a conditional branch with
/// its two successor edges.
#[derive(Clone, Debug)]
pub enum BranchInstruction {
    Plain(Instruction),
    Conditional {
        instruction: Instruction,
        /// Branch taken when the condition holds.
        truthy: BranchId,
        /// Fall-through branch.
        falsy: BranchId,
    },
}

impl BranchInstruction {
    pub fn instruction(&self) -> &Instruction {
        match self {
            BranchInstruction::Plain(instruction) => instruction,
            BranchInstruction::Conditional { instruction, .. } => instruction,
        }
    }
}

/// A straight-line instruction sequence ending in a branching instruction.
#[derive(Clone, Debug)]
pub struct Branch {
    start: u16,
    elements: Vec<(u16, BranchInstruction)>,
}

impl Branch {
    fn new(start: u16) -> Self {
        Self { start, elements: Vec::new() }
    }

    /// Start address of this branch.
    pub fn start(&self) -> u16 {
        self.start
    }

    /// The `(address, instruction)` elements in program order.
    pub fn elements(&self) -> &[(u16, BranchInstruction)] {
        &self.elements
    }
}

/// A recovered function: every branch reachable from its entry address,
/// bounded by branching instructions.
///
/// Branches are stored in discovery order; the root branch is always the
/// first one, which compiler back-ends rely on for fall-through placement.
#[derive(Clone, Debug)]
pub struct Function {
    tag: u64,
    entry: u16,
    cacheable: bool,
    branches: Vec<Branch>,
    index: HashMap<u16, BranchId>,
}

impl Function {
    fn new(tag: u64, entry: u16, cacheable: bool) -> Self {
        Self { tag, entry, cacheable, branches: Vec::new(), index: HashMap::new() }
    }

    /// Memory-configuration tag this function was recovered under.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Entry address of the function.
    pub fn entry(&self) -> u16 {
        self.entry
    }

    /// May compiled artifacts of this function be cached?
    pub fn cacheable(&self) -> bool {
        self.cacheable
    }

    /// All branches, in discovery order (root first).
    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn branch(&self, id: BranchId) -> &Branch {
        &self.branches[id]
    }

    /// The branch starting at the entry address.
    pub fn root(&self) -> &Branch {
        &self.branches[0]
    }

    /// Looks up a branch by start address.
    pub fn branch_at(&self, address: u16) -> Option<BranchId> {
        self.index.get(&address).copied()
    }

    /// Symbol name used for generated code backing this function.
    pub fn native_name(&self) -> String {
        format!("dynarec6502_{:016x}_{:04x}", self.tag, self.entry)
    }

    fn add_branch(&mut self, start: u16) -> BranchId {
        let id = self.branches.len();
        self.branches.push(Branch::new(start));
        self.index.insert(start, id);
        id
    }
}

/// Recovers [`Function`]s from a [`Data`] source.
pub struct FunctionDisassembler<'a> {
    data: &'a mut dyn Data,
}

impl<'a> FunctionDisassembler<'a> {
    pub fn new(data: &'a mut dyn Data) -> Self {
        Self { data }
    }

    /// Recovers the function entered at `entry`.
    ///
    /// Functions entered below the cartridge area are marked non-cacheable:
    /// their bytes live in RAM and can change without the mapper tag
    /// noticing.
    pub fn disassemble(&mut self, entry: u16) -> Function {
        let cacheable = entry >= CARTRIDGE_BASE;
        let mut function = Function::new(self.data.tag(), entry, cacheable);

        self.branch_at(&mut function, entry);
        function
    }

    fn branch_at(&mut self, function: &mut Function, address: u16) -> BranchId {
        if let Some(id) = function.branch_at(address) {
            return id;
        }

        // Register the branch before walking it, so a cycle back to this
        // address resolves instead of recursing forever.
        let id = function.add_branch(address);
        let elements = self.walk(function, address);
        function.branches[id].elements = elements;
        id
    }

    fn walk(&mut self, function: &mut Function, address: u16) -> Vec<(u16, BranchInstruction)> {
        let mut elements = Vec::new();
        let mut position = u32::from(address);

        loop {
            let instr_addr = position as u16;
            let instr = {
                let mut disasm = Disassembler::new(self.data, position);
                let instr = disasm.next();
                position = disasm.position();
                instr
            };

            if instr.is_conditional_branching() {
                let next_addr = position as u16;
                let falsy = self.branch_at(function, next_addr);
                let truthy = self.branch_at(function, instr.destination_address(next_addr));

                elements.push((instr_addr, BranchInstruction::Conditional {
                    instruction: instr,
                    truthy,
                    falsy,
                }));
            } else {
                elements.push((instr_addr, BranchInstruction::Plain(instr)));
            }

            if instr.is_branching() {
                return elements;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Command;

    struct Rom {
        bytes: Vec<u8>,
        base: u16,
    }

    impl Rom {
        fn at(base: u16, bytes: &[u8]) -> Self {
            Self { bytes: bytes.to_vec(), base }
        }
    }

    impl Data for Rom {
        fn tag(&self) -> u64 {
            0xAA
        }

        fn read(&mut self, address: u16) -> u8 {
            let offset = address.wrapping_sub(self.base) as usize;
            self.bytes.get(offset).copied().unwrap_or(0x02) // Unknown filler
        }

        fn write(&mut self, _address: u16, _value: u8) {}
    }

    fn disassemble(rom: &mut Rom) -> Function {
        let base = rom.base;
        FunctionDisassembler::new(rom).disassemble(base)
    }

    #[test]
    fn straight_line_ends_at_rts() {
        // LDA #$01 / RTS
        let mut rom = Rom::at(0x8000, &[0xA9, 0x01, 0x60]);
        let function = disassemble(&mut rom);

        assert_eq!(function.entry(), 0x8000);
        assert_eq!(function.tag(), 0xAA);
        assert!(function.cacheable());
        assert_eq!(function.branches().len(), 1);

        let root = function.root();
        assert_eq!(root.start(), 0x8000);
        assert_eq!(root.elements().len(), 2);
        assert_eq!(root.elements()[1].1.instruction().command, Command::Rts);
    }

    #[test]
    fn conditional_splits_into_three_branches() {
        // 8000: BNE +1  -> truthy 8003, falsy 8002
        // 8002: RTS
        // 8003: RTS
        let mut rom = Rom::at(0x8000, &[0xD0, 0x01, 0x60, 0x60]);
        let function = disassemble(&mut rom);

        assert_eq!(function.branches().len(), 3);
        let root = function.root();
        match &root.elements()[0].1 {
            BranchInstruction::Conditional { truthy, falsy, .. } => {
                assert_eq!(function.branch(*falsy).start(), 0x8002);
                assert_eq!(function.branch(*truthy).start(), 0x8003);
            }
            other => panic!("expected a conditional, got {other:?}"),
        }
    }

    #[test]
    fn branch_graph_is_closed() {
        // A small loop: 8000: LDX #$10 / 8002: DEX / 8003: BNE 8002 / 8005: RTS
        let mut rom = Rom::at(0x8000, &[0xA2, 0x10, 0xCA, 0xD0, 0xFD, 0x60]);
        let function = disassemble(&mut rom);

        for branch in function.branches() {
            for (_, element) in branch.elements() {
                if let BranchInstruction::Conditional { truthy, falsy, .. } = element {
                    assert!(*truthy < function.branches().len());
                    assert!(*falsy < function.branches().len());
                }
            }
        }
    }

    #[test]
    fn cyclic_branches_terminate() {
        // 8000: BNE 8000 -- the truthy edge points at its own branch.
        let mut rom = Rom::at(0x8000, &[0xD0, 0xFE, 0x60]);
        let function = disassemble(&mut rom);

        let root = function.root();
        match &root.elements()[0].1 {
            BranchInstruction::Conditional { truthy, .. } => {
                assert_eq!(function.branch(*truthy).start(), 0x8000);
                assert_eq!(*truthy, 0);
            }
            other => panic!("expected a conditional, got {other:?}"),
        }
    }

    #[test]
    fn ram_functions_are_not_cacheable() {
        let mut rom = Rom::at(0x0200, &[0x60]);
        let function = FunctionDisassembler::new(&mut rom).disassemble(0x0200);
        assert!(!function.cacheable());

        let mut rom = Rom::at(0x4018, &[0x60]);
        let function = FunctionDisassembler::new(&mut rom).disassemble(0x4018);
        assert!(function.cacheable());
    }

    #[test]
    fn native_name_format() {
        let mut rom = Rom::at(0x8000, &[0x60]);
        let function = disassemble(&mut rom);
        assert_eq!(function.native_name(), "dynarec6502_00000000000000aa_8000");
    }
}
