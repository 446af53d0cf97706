//! Whole-function compilation and the native artifact.

use std::cell::RefCell;
use std::rc::Rc;

use asm_amd64::{Assembler, Linker, MemReg, MemoryManager, SymbolRegistry};
use cpu_6502::{Branch, CpuState, Function};

use super::consts::instruction_section_name;
use super::core::call_guest;
use super::translate::InstructionTranslator;

/// Translates a recovered function section by section.
///
/// Every instruction gets its own named section; after non-branching
/// instructions an explicit `JMP instr_<next>` makes the flow independent of
/// section layout. The linker then places the entry section first.
#[derive(Default)]
pub struct FunctionTranslator {
    assembler: Assembler,
}

impl FunctionTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the sections of one branch. Addresses already translated via
    /// another branch are skipped.
    pub fn add_branch(&mut self, function: &Function, branch: &Branch) {
        for (address, element) in branch.elements() {
            let name = instruction_section_name(*address);
            if self.assembler.has_section(&name) {
                continue;
            }

            let section = self.assembler.section(&name);
            let fall_through = InstructionTranslator::new(section).translate(*address, element, function);

            if let Some(next) = fall_through {
                let next_name = instruction_section_name(next);
                self.assembler
                    .section(&name)
                    .emit_jmp(&MemReg::symbol(&next_name));
            }
        }
    }

    /// Links everything into executable memory and returns the entry
    /// pointer.
    pub fn link(
        self,
        entry: u16,
        symbols: &SymbolRegistry,
        memory: &mut MemoryManager,
    ) -> Result<*const u8, String> {
        let mut linker = Linker::new(&instruction_section_name(entry));
        linker.add(&self.assembler);
        linker.link(symbols, memory)
    }
}

/// A compiled guest function living in executable memory.
///
/// The artifact owns its slice of the executable block: dropping it returns
/// the bytes to the manager, which eventually releases idle pages.
pub struct NativeFunction {
    entry: *const u8,
    manager: Rc<RefCell<MemoryManager>>,
}

impl NativeFunction {
    pub fn new(entry: *const u8, manager: Rc<RefCell<MemoryManager>>) -> Self {
        Self { entry, manager }
    }

    /// Runs the function; the trampoline moves the state into the pinned
    /// guest registers and back.
    pub fn call(&self, state: &mut CpuState) {
        // SAFETY: `entry` points at code linked for exactly this state
        // layout, alive as long as the manager holds its block.
        unsafe {
            call_guest(self.entry, state);
        }
    }
}

impl Drop for NativeFunction {
    fn drop(&mut self) {
        self.manager.borrow_mut().remove(self.entry);
    }
}
