//! The fixed host register assignment of generated code.
//!
//! Guest registers live in callee-saved host registers so they survive
//! CALLs into the bus helpers without spilling. The scratch registers are
//! caller-saved ones the helpers may clobber anyway.

use asm_amd64::Register;

// Guest registers, pinned for the lifetime of a generated function.
/// Accumulator.
pub const A: Register = Register::BL;
/// X index register; the upper byte of the same host register as A.
pub const X: Register = Register::BH;
/// Y index register.
pub const Y: Register = Register::R12B;
/// Y as a 16-bit operand (upper byte zero).
pub const YX: Register = Register::R12W;
/// Stack pointer.
pub const S: Register = Register::R13B;
/// S widened for indexed stack addressing (upper bits zero).
pub const SR: Register = Register::R13;
/// Processor status word.
pub const P: Register = Register::R14B;
/// P as a 16-bit operand for BT.
pub const PX: Register = Register::R14W;
/// Remaining cycle budget (signed).
pub const CYCLES: Register = Register::R15D;

// Exit registers; only written right before returning to the host.
/// Program counter handed back to the host.
pub const PC: Register = Register::CX;
/// Exit reason handed back to the host.
pub const REASON: Register = Register::AL;

// Scratch registers.
pub const UX: Register = Register::CX;
pub const UH: Register = Register::CH;
pub const UL: Register = Register::CL;
pub const VL: Register = Register::R8B;
pub const WL: Register = Register::R9B;
pub const WX: Register = Register::R9W;

// Memory access scratch. MEM aliases RAX so helper results need no move.
pub const MEML: Register = Register::AL;
pub const MEMH: Register = Register::AH;
pub const MEMX: Register = Register::AX;

// The resolved-address register must survive the read helper of a
// read-modify-write sequence, so it lives in a callee-saved register the
// generated code otherwise leaves alone.
pub const ADDR: Register = Register::BP;
pub const ADDRR: Register = Register::RBP;

// System V argument registers for the bus helpers.
/// First argument: the memory handle.
pub const ARG_1: Register = Register::RDI;
/// Second argument: the 16-bit address.
pub const ARG_2: Register = Register::SI;
/// Second argument, full width, for masking.
pub const ARG_2R: Register = Register::RSI;
/// Third argument: the value byte.
pub const ARG_3: Register = Register::DL;
/// 8-bit helper results.
pub const RESULT8: Register = Register::AL;
/// 16-bit helper results.
pub const RESULT16: Register = Register::AX;

/// Name of the section translating the instruction at `address`.
pub fn instruction_section_name(address: u16) -> String {
    format!("instr_{address}")
}
