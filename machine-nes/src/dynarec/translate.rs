//! Translation of single 6502 instructions into x86-64 emits.

use asm_amd64::{Condition, MemReg, Section};
use cpu_6502::{
    flag_mask, BranchInstruction, Command, ExitReason, Function, Instruction, FLAG_B, FLAG_C,
    FLAG_D, FLAG_I, FLAG_N, FLAG_U, FLAG_V, FLAG_Z,
};

use super::consts::*;
use super::memtranslate::MemoryTranslator;

/// Prepend a `MOV imm16, AX` marker carrying the guest address to every
/// translated instruction; makes disassembly dumps navigable.
const MARK_INSTRUCTIONS: bool = false;

/// Emits the translation of one instruction into its section.
pub struct InstructionTranslator<'a> {
    section: &'a mut Section,
}

/// Merges the host SF/ZF of the *immediately preceding* arithmetic into the
/// guest P at the Negative/Zero positions. `add_mask` names further guest
/// flag bits to clear along the way (for ops that deliver them separately).
fn set_nz(section: &mut Section, add_mask: u8) {
    let not_nz = !(flag_mask(FLAG_N) | flag_mask(FLAG_Z) | add_mask);

    section.emit_setcc(Condition::Sign, UL); // Copy Sign and...
    section.emit_setcc(Condition::Zero, UH); // ...Zero out of RFLAGS.
    section.emit_shl(FLAG_N, UL); // Move both to their guest positions.
    section.emit_shl(FLAG_Z, UH);
    section.emit_or(UH, UL);
    section.emit_and_imm(u32::from(not_nz), P); // Clear NZ (+ extras) in P.
    section.emit_or(UL, P); // And apply.
}

/// Sets or clears a guest flag bit in P.
fn update_flag(section: &mut Section, flag: u8, set: bool) {
    let mask = flag_mask(flag);

    if set {
        section.emit_or_imm(u32::from(mask), P);
    } else {
        section.emit_and_imm(u32::from(!mask), P);
    }
}

/// Moves the 0/1 value in `reg` into the guest flag position `flag`.
fn update_flag_from(section: &mut Section, flag: u8, reg: asm_amd64::Register, already_masked: bool) {
    section.emit_mov(reg, WL);
    if flag > 0 {
        section.emit_shl(flag, WL);
    }
    if !already_masked {
        section.emit_and_imm(u32::from(!flag_mask(flag)), P);
    }
    section.emit_or(WL, P);
}

/// The shared ADC path: guest carry in, host OF/CF rescued into scratch
/// registers across the NZ update, then merged back into P.
fn adc(section: &mut Section, value: asm_amd64::Register) {
    let clear = flag_mask(FLAG_C) | flag_mask(FLAG_V);

    section.emit_bt(FLAG_C, PX); // Guest carry into the host carry.
    section.emit_add(value, A, true); // ADC
    section.emit_setcc(Condition::Overflow, VL); // Rescue before set_nz.
    section.emit_setcc(Condition::Carry, WL);
    set_nz(section, clear);
    section.emit_shl(FLAG_V, VL); // Overflow to bit 6; carry is bit 0 already.
    section.emit_or(WL, P);
    section.emit_or(VL, P);
}

/// The 6502 compare: carry is borrow-inverted relative to the host.
fn compare(section: &mut Section, reg: asm_amd64::Register, operand: asm_amd64::Register) {
    section.emit_cmp(operand, reg); // Computes reg - operand.
    section.emit_setcc(Condition::NotCarry, VL); // Guest C = !host borrow.
    set_nz(section, flag_mask(FLAG_C));
    section.emit_or(VL, P); // Carry already sits at bit 0.
}

fn return_to_host(section: &mut Section, reason: ExitReason, pc: asm_amd64::Register) {
    if pc != PC {
        section.emit_mov(pc, PC);
    }
    section.emit_mov_imm(u64::from(reason as u8), REASON);
    section.emit_ret(0);
}

impl<'a> InstructionTranslator<'a> {
    pub fn new(section: &'a mut Section) -> Self {
        Self { section }
    }

    /// A memory translator borrowing the section for one emit sequence.
    fn memory(&mut self) -> MemoryTranslator<'_> {
        MemoryTranslator::new(self.section)
    }

    /// Translates one branch element. Returns the fall-through address when
    /// the caller must append a `JMP` to the next instruction's section.
    pub fn translate(
        &mut self,
        address: u16,
        element: &BranchInstruction,
        function: &Function,
    ) -> Option<u16> {
        match element {
            BranchInstruction::Plain(instr) => self.instruction(address, instr),
            BranchInstruction::Conditional { instruction, truthy, falsy } => {
                self.conditional(
                    address,
                    instruction,
                    function.branch(*truthy).start(),
                    function.branch(*falsy).start(),
                );
                None
            }
        }
    }

    fn mark(&mut self, address: u16) {
        if MARK_INSTRUCTIONS {
            self.section.emit_mov_imm(u64::from(address), RESULT16);
        }
    }

    fn count_cycles(&mut self, cycles: u32) {
        self.section.emit_sub_imm(cycles as i32, CYCLES, false);
    }

    fn conditional(&mut self, address: u16, instr: &Instruction, truthy: u16, falsy: u16) {
        let (flag, expected) = match instr.command {
            Command::Bcc => (FLAG_C, false),
            Command::Bcs => (FLAG_C, true),
            Command::Beq => (FLAG_Z, true),
            Command::Bne => (FLAG_Z, false),
            Command::Bmi => (FLAG_N, true),
            Command::Bpl => (FLAG_N, false),
            Command::Bvs => (FLAG_V, true),
            Command::Bvc => (FLAG_V, false),
            other => unreachable!("{other:?} is not a conditional branch"),
        };

        self.mark(address);

        // Budget check: bail out before this instruction is charged, so a
        // resume re-runs it.
        self.section
            .emit_mov_imm(u64::from(ExitReason::CyclesExhausted as u8), REASON);
        self.section.emit_mov_imm(u64::from(address), PC);
        self.section.emit_cmp_imm(CYCLES, 0);
        self.section.emit_jcc_disp(Condition::GREATER_OR_EQUAL, 1);
        self.section.emit_ret(0); // Skipped by the Jcc above.

        self.count_cycles(instr.cycles);

        // The actual branch: the tested guest bit lands in the host carry.
        self.section.emit_bt(flag, PX);
        let condition = if expected { Condition::Carry } else { Condition::NotCarry };
        self.section
            .emit_jcc(condition, &MemReg::symbol(&instruction_section_name(truthy)));
        self.section
            .emit_jmp(&MemReg::symbol(&instruction_section_name(falsy)));
    }

    fn instruction(&mut self, address: u16, instr: &Instruction) -> Option<u16> {
        let next_addr = address.wrapping_add(instr.length());

        self.mark(address);
        self.count_cycles(instr.cycles);

        match instr.command {
            Command::Adc => {
                let value = self.memory().read(instr);
                adc(self.section, value);
            }
            Command::And => {
                let value = self.memory().read(instr);
                self.section.emit_and(value, A);
                set_nz(self.section, 0);
            }
            Command::Asl => {
                self.memory().rmw(instr, |section, reg| {
                    section.emit_shl(1, reg);
                    section.emit_setcc(Condition::Carry, VL); // Rescue carry.
                    section.emit_or(reg, reg);
                    set_nz(section, flag_mask(FLAG_C));
                    section.emit_or(VL, P);
                    reg
                });
            }
            Command::Bit => {
                let z = flag_mask(FLAG_Z);
                let nv = flag_mask(FLAG_N) | flag_mask(FLAG_V);
                let mask = nv | z;

                let reg = self.memory().read(instr);
                self.section.emit_and_imm(u32::from(!mask), P);
                self.section.emit_test(reg, A); // (value & A) == 0?
                self.section.emit_setcc(Condition::Zero, UL);
                self.section.emit_shl(FLAG_Z, UL);
                self.section.emit_or(UL, P);
                // The tested value's top two bits are exactly N and V in
                // guest order; mask and merge them directly.
                self.section.emit_and_imm(u32::from(nv), reg);
                self.section.emit_or(reg, P);
            }
            Command::Brk => {
                self.section.emit_mov_imm(u64::from(next_addr), PC);
                return_to_host(self.section, ExitReason::Break, PC);
                return None;
            }
            Command::Clc => update_flag(self.section, FLAG_C, false),
            Command::Cld => update_flag(self.section, FLAG_D, false),
            Command::Cli => update_flag(self.section, FLAG_I, false),
            Command::Clv => update_flag(self.section, FLAG_V, false),
            Command::Cmp => {
                let value = self.memory().read(instr);
                compare(self.section, A, value);
            }
            Command::Cpx => {
                let value = self.memory().read(instr);
                compare(self.section, X, value);
            }
            Command::Cpy => {
                let value = self.memory().read(instr);
                compare(self.section, Y, value);
            }
            Command::Dec | Command::Dex | Command::Dey => {
                self.memory().rmw(instr, |section, reg| {
                    section.emit_dec(reg);
                    set_nz(section, 0);
                    reg
                });
            }
            Command::Eor => {
                let value = self.memory().read(instr);
                self.section.emit_xor(value, A);
                set_nz(self.section, 0);
            }
            Command::Inc | Command::Inx | Command::Iny => {
                self.memory().rmw(instr, |section, reg| {
                    section.emit_inc(reg);
                    set_nz(section, 0);
                    reg
                });
            }
            Command::Jmp => {
                self.memory().resolve(instr, PC);
                self.section
                    .emit_mov_imm(u64::from(ExitReason::Jump as u8), REASON);

                // Infinite-loop detection without a branch: the reason
                // value is simply incremented when the target is this very
                // instruction, which turns Jump into InfiniteLoop.
                self.section.emit_cmp_imm(PC, i32::from(address));
                self.section.emit_setcc(Condition::EQUAL, VL);
                self.section.emit_add(VL, REASON, false);

                self.section.emit_ret(0);
                return None;
            }
            Command::Jsr => {
                self.section
                    .emit_mov_imm(u64::from(next_addr.wrapping_sub(1)), WX);
                self.memory().push16(WX);
                self.section.emit_mov_imm(u64::from(instr.operand), PC);
                return_to_host(self.section, ExitReason::Jump, PC);
                return None;
            }
            Command::Lda => {
                let value = self.memory().read(instr);
                self.section.emit_mov(value, A);
                self.section.emit_or(A, A); // MOV updates no flags; OR does.
                set_nz(self.section, 0);
            }
            Command::Ldx => {
                let value = self.memory().read(instr);
                self.section.emit_mov(value, X);
                self.section.emit_or(X, X);
                set_nz(self.section, 0);
            }
            Command::Ldy => {
                let value = self.memory().read(instr);
                self.section.emit_mov(value, Y);
                self.section.emit_or(Y, Y);
                set_nz(self.section, 0);
            }
            Command::Lsr => {
                self.memory().rmw(instr, |section, reg| {
                    section.emit_shr(1, reg);
                    section.emit_setcc(Condition::Carry, VL);
                    set_nz(section, flag_mask(FLAG_C));
                    update_flag_from(section, FLAG_C, VL, true);
                    reg
                });
            }
            Command::Nop => {}
            Command::Ora => {
                let value = self.memory().read(instr);
                self.section.emit_or(value, A);
                set_nz(self.section, 0);
            }
            Command::Pha => self.memory().push8(A),
            Command::Php => {
                let mask = flag_mask(FLAG_B) | flag_mask(FLAG_U);
                self.section.emit_mov(P, UL);
                self.section.emit_or_imm(u32::from(mask), UL);
                self.memory().push8(UL);
            }
            Command::Pla => {
                self.memory().pull8(A);
                // The pull can't guarantee RFLAGS reflect the value; run it
                // through a no-op OR first.
                self.section.emit_or(A, A);
                set_nz(self.section, 0);
            }
            Command::Plp => {
                self.memory().pull8(P);
                self.section
                    .emit_or_imm(u32::from(flag_mask(FLAG_U)), P);
            }
            Command::Rol => {
                // RCL/RCR leave SF/ZF untouched (unlike SHL/SHR), so the
                // rotate needs a flag-producing OR before the NZ update.
                self.memory().rmw(instr, |section, reg| {
                    section.emit_bt(FLAG_C, PX); // Guest carry in.
                    section.emit_rcl(1, reg);
                    section.emit_setcc(Condition::Carry, VL);
                    section.emit_or(reg, reg);
                    set_nz(section, flag_mask(FLAG_C));
                    update_flag_from(section, FLAG_C, VL, true);
                    reg
                });
            }
            Command::Ror => {
                self.memory().rmw(instr, |section, reg| {
                    section.emit_bt(FLAG_C, PX);
                    section.emit_rcr(1, reg);
                    section.emit_setcc(Condition::Carry, VL);
                    section.emit_or(reg, reg);
                    set_nz(section, flag_mask(FLAG_C));
                    update_flag_from(section, FLAG_C, VL, true);
                    reg
                });
            }
            Command::Rti => {
                self.memory().pull8(P);
                self.section
                    .emit_or_imm(u32::from(flag_mask(FLAG_U)), P);
                self.memory().pull16(PC);
                return_to_host(self.section, ExitReason::Return, PC);
                return None;
            }
            Command::Rts => {
                self.memory().pull16(PC);
                self.section.emit_inc(PC); // JSR stacks the address short by one.
                return_to_host(self.section, ExitReason::Return, PC);
                return None;
            }
            Command::Sbc => {
                // One's complement; the carry supplies the borrow.
                let value = self.memory().read(instr);
                self.section.emit_xor_imm(0xFF, value);
                adc(self.section, value);
            }
            Command::Sec => update_flag(self.section, FLAG_C, true),
            Command::Sed => update_flag(self.section, FLAG_D, true),
            Command::Sei => update_flag(self.section, FLAG_I, true),
            Command::Sta => self.memory().write(instr, A),
            Command::Stx => self.memory().write(instr, X),
            Command::Sty => self.memory().write(instr, Y),
            Command::Tax => {
                self.section.emit_mov(A, X);
                self.section.emit_or(X, X);
                set_nz(self.section, 0);
            }
            Command::Tay => {
                self.section.emit_mov(A, Y);
                self.section.emit_or(Y, Y);
                set_nz(self.section, 0);
            }
            Command::Tsx => {
                // S and X can't meet in one instruction (REX vs upper-byte
                // register); bounce through a scratch byte.
                self.section.emit_mov(S, UL);
                self.section.emit_mov(UL, X);
                self.section.emit_or(X, X);
                set_nz(self.section, 0);
            }
            Command::Txa => {
                self.section.emit_mov(X, A);
                self.section.emit_or(A, A);
                set_nz(self.section, 0);
            }
            Command::Txs => {
                // Same detour as TSX; and TXS updates no flags.
                self.section.emit_mov(X, UL);
                self.section.emit_mov(UL, S);
            }
            Command::Tya => {
                self.section.emit_mov(Y, A);
                self.section.emit_or(A, A);
                set_nz(self.section, 0);
            }
            Command::Unknown => {
                self.section.emit_mov_imm(u64::from(address), PC);
                return_to_host(self.section, ExitReason::UnknownInstruction, PC);
                return None;
            }
            other => unreachable!("{other:?} must be translated as a conditional"),
        }

        Some(next_addr)
    }
}
