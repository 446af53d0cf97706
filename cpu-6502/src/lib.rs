//! MOS 6502 CPU core building blocks.
//!
//! This crate holds everything about the 6502 that is independent of the
//! machine around it and of the chosen execution back-end:
//!
//! - the [`Data`] bus trait (an addressable byte store with a version tag),
//! - instruction decoding ([`Instruction`]) and the streaming [`Disassembler`],
//! - control-flow recovery into [`Function`]/[`Branch`] graphs,
//! - the tag-and-address keyed LRU [`Repository`] for compiled artifacts,
//! - the reference [`Interpreter`],
//! - the shared [`CpuState`]/[`ExitReason`] contract all back-ends speak.
//!
//! Compiling back-ends (native recompiler, Lua transpiler) live with the
//! machine that hosts them; they consume the recovered functions and the
//! state contract from here.

mod analysis;
mod data;
mod disassembler;
mod hook;
mod instruction;
mod interpret;
mod repository;
mod state;

pub use analysis::{Branch, BranchId, BranchInstruction, Function, FunctionDisassembler};
pub use data::Data;
pub use disassembler::Disassembler;
pub use hook::{DumpHook, Hook};
pub use instruction::{Addressing, Command, Instruction};
pub use interpret::Interpreter;
pub use repository::{Fetched, Repository};
pub use state::{
    flag_mask, CpuState, ExitReason, Interrupt, FLAG_B, FLAG_C, FLAG_D, FLAG_I, FLAG_N, FLAG_U,
    FLAG_V, FLAG_Z, STATE_A, STATE_CYCLES, STATE_P, STATE_PC, STATE_REASON, STATE_S, STATE_X,
    STATE_Y,
};

/// Size of the internal RAM, starting at address $0000.
pub const RAM_SIZE: usize = 2048;

/// Addresses below this one always resolve to internal RAM (after mirroring).
pub const RAM_BARRIER: u16 = 0x2000;

/// First address belonging to the cartridge. Functions entered at or above
/// this address are cacheable; everything below lives in writable memory
/// whose changes the cache cannot observe.
pub const CARTRIDGE_BASE: u16 = 0x4018;

/// Base address of the hardware stack page.
pub const STACK_BASE: u16 = 0x0100;

/// Size of a memory page ("bank") as used by OAM DMA.
pub const PAGE_SIZE: usize = 256;
