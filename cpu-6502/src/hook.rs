//! Instruction-observing hooks.

use crate::state::{FLAG_B, FLAG_C, FLAG_D, FLAG_I, FLAG_N, FLAG_V, FLAG_Z};
use crate::{CpuState, Instruction};

/// Observer for executed instructions.
///
/// An optional feature of execution cores; the reference interpreter honours
/// it, the compiling back-ends do not (they have their own compile-time trace
/// switches instead).
pub trait Hook {
    /// Called before an instruction executes. `state.pc` already points past
    /// the instruction.
    fn before_instruction(&mut self, instruction: &Instruction, state: &CpuState) {
        let _ = (instruction, state);
    }

    /// Called after an instruction executed.
    fn after_instruction(&mut self, instruction: &Instruction, state: &CpuState) {
        let _ = (instruction, state);
    }
}

/// Hook that dumps every executed instruction to stderr.
#[derive(Default)]
pub struct DumpHook;

impl Hook for DumpHook {
    fn before_instruction(&mut self, instruction: &Instruction, state: &CpuState) {
        let address = { state.pc }.wrapping_sub(instruction.length());
        let flag = |bit: u8, on: char, off: char| if state.flag(bit) { on } else { off };

        eprintln!(
            "[{:04x}] {} {} {:04x}  A {:02x} X {:02x} Y {:02x} S {:02x} P {:02x} [{}{}{}{}{}{}{}]",
            address,
            instruction.command_name(),
            instruction.addressing_name(),
            { instruction.operand },
            state.a,
            state.x,
            state.y,
            state.s,
            state.p,
            flag(FLAG_C, 'C', 'c'),
            flag(FLAG_Z, 'Z', 'z'),
            flag(FLAG_I, 'I', 'i'),
            flag(FLAG_D, 'D', 'd'),
            flag(FLAG_B, 'B', 'b'),
            flag(FLAG_V, 'V', 'v'),
            flag(FLAG_N, 'N', 'n'),
        );
    }
}
