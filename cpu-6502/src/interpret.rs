//! Direct-execution reference core.
//!
//! The interpreter is the semantic yardstick for the compiling back-ends:
//! all three share the exit-reason contract and must agree bit-exactly on
//! registers, flags and memory traffic. To keep that equivalence observable,
//! the interpreter uses the same block-granular cycle accounting the
//! recompilers are forced into: the budget is only checked at conditional
//! branches (before charging them), and every non-conditional branching
//! instruction hands control back to the dispatcher with an exit reason.

use crate::state::{flag_mask, FLAG_B, FLAG_C, FLAG_D, FLAG_I, FLAG_N, FLAG_U, FLAG_V, FLAG_Z};
use crate::{
    Addressing, Command, CpuState, Data, Disassembler, ExitReason, Hook, Instruction, STACK_BASE,
};

enum Flow {
    Continue,
    Exit(ExitReason),
}

/// The reference interpreter core.
#[derive(Default)]
pub struct Interpreter;

impl Interpreter {
    pub fn new() -> Self {
        Self
    }

    /// Executes from `state.pc` until an exit reason occurs, updating the
    /// state in place. The caller owns the dispatch loop (interrupts, budget
    /// refill, reaction to the reason).
    pub fn run_until_exit(
        &mut self,
        state: &mut CpuState,
        data: &mut dyn Data,
        mut hook: Option<&mut dyn Hook>,
    ) {
        let mut position = u32::from(state.pc);

        loop {
            let instr_addr = position as u16;
            let instr = {
                let mut disasm = Disassembler::new(data, position);
                let instr = disasm.next();
                position = disasm.position();
                instr
            };

            // Budget check happens at conditional branches only, before the
            // branch is charged, so a resume re-executes it exactly once.
            if instr.is_conditional_branching() && state.cycles <= 0 {
                state.pc = instr_addr;
                state.reason = ExitReason::CyclesExhausted;
                return;
            }

            state.pc = position as u16;
            state.cycles -= instr.cycles as i32;

            if let Some(hook) = hook.as_mut() {
                hook.before_instruction(&instr, state);
            }

            let flow = execute(state, data, instr_addr, instr, &mut position);

            if let Some(hook) = hook.as_mut() {
                hook.after_instruction(&instr, state);
            }

            if let Flow::Exit(reason) = flow {
                state.reason = reason;
                return;
            }
        }
    }
}

/// Updates the Negative and Zero flags and returns `value`.
fn set_nz(state: &mut CpuState, value: u8) -> u8 {
    state.set_flag(FLAG_N, value >= 0x80);
    state.set_flag(FLAG_Z, value == 0);
    value
}

/// Updates the Carry flag from a 9-bit result and passes on to `set_nz`.
fn set_nzc(state: &mut CpuState, value: u16) -> u8 {
    state.set_flag(FLAG_C, value > 0xFF);
    set_nz(state, value as u8)
}

/// Updates the Overflow flag from the addition of `left` and `right` with
/// the 9-bit result `value`, then passes on to `set_nzc`.
fn set_nvzc(state: &mut CpuState, left: u8, right: u8, value: u16) -> u8 {
    // This is how the 6502 derives its overflow bit.
    let overflow = !(left ^ right) & (left ^ (value as u8)) & 0x80;
    state.set_flag(FLAG_V, overflow != 0);
    set_nzc(state, value)
}

/// Shared implementation of ADC; SBC feeds it the one's complement.
fn adc(state: &mut CpuState, rhs: u8) {
    let left = u16::from(state.a);
    let right = u16::from(rhs);
    let carry = u16::from(state.flag(FLAG_C));

    state.a = set_nvzc(state, state.a, rhs, left + right + carry);
}

fn compare(state: &mut CpuState, reg: u8, operand: u8) {
    state.set_flag(FLAG_C, reg >= operand);
    set_nz(state, reg.wrapping_sub(operand));
}

/// Resolves an addressing mode to an absolute bus address.
fn resolve(state: &CpuState, data: &mut dyn Data, mode: Addressing, operand: u16) -> u16 {
    let op8 = operand as u8;

    match mode {
        Addressing::Rel => state.pc.wrapping_add(op8 as i8 as u16),
        Addressing::Zp => operand & 0x00FF,
        Addressing::ZpX => u16::from(op8.wrapping_add(state.x)),
        Addressing::ZpY => u16::from(op8.wrapping_add(state.y)),
        Addressing::Abs => operand,
        Addressing::AbsX => operand.wrapping_add(u16::from(state.x)),
        Addressing::AbsY => operand.wrapping_add(u16::from(state.y)),
        Addressing::Ind => data.read16(operand),
        Addressing::IndX => data.read16(u16::from(op8.wrapping_add(state.x))),
        Addressing::IndY => data.read16(u16::from(op8)).wrapping_add(u16::from(state.y)),
        // Register and immediate modes carry no address.
        _ => 0,
    }
}

/// Reads the byte the instruction points at, register or memory.
fn read(state: &CpuState, data: &mut dyn Data, instr: &Instruction) -> u8 {
    match instr.addressing {
        Addressing::Acc => state.a,
        Addressing::X => state.x,
        Addressing::Y => state.y,
        Addressing::S => state.s,
        Addressing::P => state.p,
        Addressing::Imm | Addressing::Imp | Addressing::Rel => instr.operand8(),
        mode => {
            let address = resolve(state, data, mode, instr.operand);
            data.read(address)
        }
    }
}

/// Writes `value` into what the instruction points at.
fn write(state: &mut CpuState, data: &mut dyn Data, instr: &Instruction, value: u8) {
    match instr.addressing {
        Addressing::Acc => state.a = value,
        Addressing::X => state.x = value,
        Addressing::Y => state.y = value,
        Addressing::S => state.s = value,
        Addressing::P => state.p = value,
        Addressing::Imm | Addressing::Imp | Addressing::Rel => {
            unreachable!("write through an operand-less addressing mode")
        }
        mode => {
            let address = resolve(state, data, mode, instr.operand);
            data.write(address, value);
        }
    }
}

/// Read-modify-write through the instruction's target.
fn rmw(
    state: &mut CpuState,
    data: &mut dyn Data,
    instr: &Instruction,
    proc: impl FnOnce(&mut CpuState, u8) -> u8,
) {
    match instr.addressing {
        Addressing::Acc => {
            let value = proc(state, state.a);
            state.a = value;
        }
        Addressing::X => {
            let value = proc(state, state.x);
            state.x = value;
        }
        Addressing::Y => {
            let value = proc(state, state.y);
            state.y = value;
        }
        Addressing::S => {
            let value = proc(state, state.s);
            state.s = value;
        }
        Addressing::P => {
            let value = proc(state, state.p);
            state.p = value;
        }
        Addressing::Imm => {
            let value = proc(state, instr.operand8());
            state.a = value;
        }
        Addressing::Rel | Addressing::Imp => {
            unreachable!("read-modify-write through an operand-less addressing mode")
        }
        mode => {
            let address = resolve(state, data, mode, instr.operand);
            let value = data.read(address);
            let result = proc(state, value);
            data.write(address, result);
        }
    }
}

fn push(state: &mut CpuState, data: &mut dyn Data, value: u8) {
    data.write(STACK_BASE + u16::from(state.s), value);
    state.s = state.s.wrapping_sub(1);
}

fn push16(state: &mut CpuState, data: &mut dyn Data, value: u16) {
    push(state, data, (value >> 8) as u8);
    push(state, data, value as u8);
}

fn pull(state: &mut CpuState, data: &mut dyn Data) -> u8 {
    state.s = state.s.wrapping_add(1);
    data.read(STACK_BASE + u16::from(state.s))
}

fn pull16(state: &mut CpuState, data: &mut dyn Data) -> u16 {
    let lo = u16::from(pull(state, data));
    let hi = u16::from(pull(state, data));
    (hi << 8) | lo
}

/// Takes a conditional branch by rewriting the decode position.
fn branch_if(state: &CpuState, position: &mut u32, instr: &Instruction, condition: bool) {
    if condition {
        *position = u32::from(instr.destination_address(state.pc));
    }
}

fn execute(
    state: &mut CpuState,
    data: &mut dyn Data,
    instr_addr: u16,
    instr: Instruction,
    position: &mut u32,
) -> Flow {
    match instr.command {
        Command::Adc => {
            let value = read(state, data, &instr);
            adc(state, value);
        }
        Command::And => {
            let value = state.a & read(state, data, &instr);
            state.a = set_nz(state, value);
        }
        Command::Asl => rmw(state, data, &instr, |state, v| {
            state.set_flag(FLAG_C, v >= 0x80);
            set_nz(state, v << 1)
        }),
        Command::Bcc => branch_if(state, position, &instr, !state.flag(FLAG_C)),
        Command::Bcs => branch_if(state, position, &instr, state.flag(FLAG_C)),
        Command::Beq => branch_if(state, position, &instr, state.flag(FLAG_Z)),
        Command::Bit => {
            let value = read(state, data, &instr);
            state.set_flag(FLAG_Z, (state.a & value) == 0);
            state.set_flag(FLAG_V, value & flag_mask(FLAG_V) != 0);
            state.set_flag(FLAG_N, value & flag_mask(FLAG_N) != 0);
        }
        Command::Bmi => branch_if(state, position, &instr, state.flag(FLAG_N)),
        Command::Bne => branch_if(state, position, &instr, !state.flag(FLAG_Z)),
        Command::Bpl => branch_if(state, position, &instr, !state.flag(FLAG_N)),
        Command::Brk => {
            // PC already points past the opcode and its padding byte.
            return Flow::Exit(ExitReason::Break);
        }
        Command::Bvc => branch_if(state, position, &instr, !state.flag(FLAG_V)),
        Command::Bvs => branch_if(state, position, &instr, state.flag(FLAG_V)),
        Command::Clc => state.set_flag(FLAG_C, false),
        Command::Cld => state.set_flag(FLAG_D, false),
        Command::Cli => state.set_flag(FLAG_I, false),
        Command::Clv => state.set_flag(FLAG_V, false),
        Command::Cmp => {
            let value = read(state, data, &instr);
            compare(state, state.a, value);
        }
        Command::Cpx => {
            let value = read(state, data, &instr);
            compare(state, state.x, value);
        }
        Command::Cpy => {
            let value = read(state, data, &instr);
            compare(state, state.y, value);
        }
        Command::Dec | Command::Dex | Command::Dey => rmw(state, data, &instr, |state, v| {
            set_nz(state, v.wrapping_sub(1))
        }),
        Command::Eor => {
            let value = state.a ^ read(state, data, &instr);
            state.a = set_nz(state, value);
        }
        Command::Inc | Command::Inx | Command::Iny => rmw(state, data, &instr, |state, v| {
            set_nz(state, v.wrapping_add(1))
        }),
        Command::Jmp => {
            let target = resolve(state, data, instr.addressing, instr.operand);
            state.pc = target;

            return if target == instr_addr {
                Flow::Exit(ExitReason::InfiniteLoop)
            } else {
                Flow::Exit(ExitReason::Jump)
            };
        }
        Command::Jsr => {
            // The return address is stacked one byte short; RTS adjusts.
            push16(state, data, state.pc.wrapping_sub(1));
            state.pc = instr.operand;
            return Flow::Exit(ExitReason::Jump);
        }
        Command::Lda => {
            let value = read(state, data, &instr);
            state.a = set_nz(state, value);
        }
        Command::Ldx => {
            let value = read(state, data, &instr);
            state.x = set_nz(state, value);
        }
        Command::Ldy => {
            let value = read(state, data, &instr);
            state.y = set_nz(state, value);
        }
        Command::Lsr => rmw(state, data, &instr, |state, v| {
            state.set_flag(FLAG_C, v & 1 == 1);
            set_nz(state, v >> 1)
        }),
        Command::Nop => {}
        Command::Ora => {
            let value = state.a | read(state, data, &instr);
            state.a = set_nz(state, value);
        }
        Command::Pha => push(state, data, state.a),
        Command::Php => {
            let psw = state.p | flag_mask(FLAG_B) | flag_mask(FLAG_U);
            push(state, data, psw);
        }
        Command::Pla => {
            let value = pull(state, data);
            state.a = set_nz(state, value);
        }
        Command::Plp => {
            state.p = pull(state, data) | flag_mask(FLAG_U);
        }
        Command::Rol => rmw(state, data, &instr, |state, v| {
            let carry = u8::from(state.flag(FLAG_C));
            state.set_flag(FLAG_C, v >= 0x80);
            set_nz(state, (v << 1) | carry)
        }),
        Command::Ror => rmw(state, data, &instr, |state, v| {
            let carry = if state.flag(FLAG_C) { 0x80 } else { 0 };
            state.set_flag(FLAG_C, v & 1 == 1);
            set_nz(state, (v >> 1) | carry)
        }),
        Command::Rti => {
            state.p = pull(state, data) | flag_mask(FLAG_U);
            state.pc = pull16(state, data);
            return Flow::Exit(ExitReason::Return);
        }
        Command::Rts => {
            state.pc = pull16(state, data).wrapping_add(1);
            return Flow::Exit(ExitReason::Return);
        }
        Command::Sbc => {
            // One's complement; the carry supplies the borrow adjustment.
            let value = read(state, data, &instr);
            adc(state, value ^ 0xFF);
        }
        Command::Sec => state.set_flag(FLAG_C, true),
        Command::Sed => state.set_flag(FLAG_D, true),
        Command::Sei => state.set_flag(FLAG_I, true),
        Command::Sta => write(state, data, &instr, state.a),
        Command::Stx => write(state, data, &instr, state.x),
        Command::Sty => write(state, data, &instr, state.y),
        Command::Tax => state.x = set_nz(state, state.a),
        Command::Tay => state.y = set_nz(state, state.a),
        Command::Tsx => state.x = set_nz(state, state.s),
        Command::Txa => state.a = set_nz(state, state.x),
        Command::Txs => state.s = state.x,
        Command::Tya => state.a = set_nz(state, state.y),
        Command::Unknown => {
            state.pc = instr_addr;
            return Flow::Exit(ExitReason::UnknownInstruction);
        }
    }

    Flow::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ram(Vec<u8>);

    impl Ram {
        fn with_program(base: u16, program: &[u8]) -> Self {
            let mut bytes = vec![0u8; 0x10000];
            bytes[base as usize..base as usize + program.len()].copy_from_slice(program);
            Self(bytes)
        }
    }

    impl Data for Ram {
        fn tag(&self) -> u64 {
            0
        }

        fn read(&mut self, address: u16) -> u8 {
            self.0[address as usize]
        }

        fn write(&mut self, address: u16, value: u8) {
            self.0[address as usize] = value;
        }
    }

    /// Minimal dispatch loop: keep running through jumps and returns until
    /// the budget runs out or something noteworthy happens.
    fn run(state: &mut CpuState, ram: &mut Ram, cycles: i32) {
        state.cycles = cycles;
        let mut interpreter = Interpreter::new();

        while state.cycles > 0 {
            interpreter.run_until_exit(state, ram, None);
            match state.reason {
                ExitReason::Return | ExitReason::Jump => continue,
                _ => break,
            }
        }
    }

    fn fresh(pc: u16) -> CpuState {
        let mut state = CpuState::new();
        state.p = 0;
        state.s = 0xFD;
        state.pc = pc;
        state
    }

    #[test]
    fn adc_sets_overflow_crossing_sign() {
        // A=$3C, ADC #$5A => A=$96, C=0 Z=0 V=1 N=1
        let mut ram = Ram::with_program(0x0600, &[0x69, 0x5A, 0x00]);
        let mut state = fresh(0x0600);
        state.a = 0x3C;

        run(&mut state, &mut ram, 10);

        assert_eq!(state.a, 0x96);
        assert!(!state.flag(FLAG_C));
        assert!(!state.flag(FLAG_Z));
        assert!(state.flag(FLAG_V));
        assert!(state.flag(FLAG_N));
    }

    #[test]
    fn sbc_borrows_through_carry() {
        // A=$80, C=1, SBC #$01 => A=$7F, C=1 V=1 Z=0 N=0
        let mut ram = Ram::with_program(0x0600, &[0xE9, 0x01, 0x00]);
        let mut state = fresh(0x0600);
        state.a = 0x80;
        state.set_flag(FLAG_C, true);

        run(&mut state, &mut ram, 10);

        assert_eq!(state.a, 0x7F);
        assert!(state.flag(FLAG_C));
        assert!(state.flag(FLAG_V));
        assert!(!state.flag(FLAG_Z));
        assert!(!state.flag(FLAG_N));
    }

    #[test]
    fn php_plp_round_trip_sets_break_bits() {
        // With B and U clear, PHP;PLP yields P | $30.
        let mut ram = Ram::with_program(0x0600, &[0x08, 0x28, 0x00]);
        let mut state = fresh(0x0600);
        state.p = 0x01;

        run(&mut state, &mut ram, 10);

        assert_eq!(state.p, 0x31);
    }

    #[test]
    fn pha_pla_is_identity_on_a() {
        let mut ram = Ram::with_program(0x0600, &[0x48, 0xA9, 0x00, 0x68, 0x00]);
        let mut state = fresh(0x0600);
        state.a = 0x5C;

        run(&mut state, &mut ram, 20);

        assert_eq!(state.a, 0x5C);
        assert!(!state.flag(FLAG_Z));
    }

    #[test]
    fn jsr_rts_returns_past_the_call() {
        // 0600: JSR $0610 / 0603: LDA #$77 / 0605: BRK
        // 0610: RTS
        let mut ram = Ram::with_program(0x0600, &[0x20, 0x10, 0x06, 0xA9, 0x77, 0x00]);
        ram.write(0x0610, 0x60);
        let mut state = fresh(0x0600);

        run(&mut state, &mut ram, 40);

        assert_eq!(state.a, 0x77);
        assert_eq!({ state.pc }, 0x0607); // Past BRK and its padding byte.
        assert_eq!(state.reason, ExitReason::Break);
    }

    #[test]
    fn indirect_jmp_page_crossing_bug() {
        // JMP ($02FF): low byte from $02FF, high byte from $0200 (not $0300).
        let mut ram = Ram::with_program(0x0600, &[0x6C, 0xFF, 0x02]);
        ram.write(0x02FF, 0x34);
        ram.write(0x0200, 0x12);
        ram.write(0x0300, 0x99);
        let mut state = fresh(0x0600);

        state.cycles = 10;
        Interpreter::new().run_until_exit(&mut state, &mut ram, None);

        assert_eq!({ state.pc }, 0x1234);
        assert_eq!(state.reason, ExitReason::Jump);
    }

    #[test]
    fn indexed_indirect_wraps_in_zero_page() {
        // X=$FF, LDA ($80,X): pointer from $7F with page-wrap rule.
        let mut ram = Ram::with_program(0x0600, &[0xA1, 0x80, 0x00]);
        ram.write(0x007F, 0x40);
        ram.write(0x0080, 0x02);
        ram.write(0x0240, 0xAB);
        let mut state = fresh(0x0600);
        state.x = 0xFF;

        run(&mut state, &mut ram, 10);

        assert_eq!(state.a, 0xAB);
    }

    #[test]
    fn stack_pull_wraps_within_the_stack_page() {
        // S=$00: RTS pulls from $0101 and $0102.
        let mut ram = Ram::with_program(0x0600, &[0x60]);
        ram.write(0x0101, 0x33);
        ram.write(0x0102, 0x07);
        let mut state = fresh(0x0600);
        state.s = 0x00;

        state.cycles = 10;
        Interpreter::new().run_until_exit(&mut state, &mut ram, None);

        assert_eq!({ state.pc }, 0x0734);
        assert_eq!(state.s, 0x02);
        assert_eq!(state.reason, ExitReason::Return);
    }

    #[test]
    fn exhaustion_stops_at_the_conditional_itself() {
        // 0600: LDA #$00 (2 cycles) / 0602: BEQ -> taken
        // With a 2-cycle budget, the branch must not run: the core exits
        // with CyclesExhausted and PC at the branch, ready to resume.
        let mut ram = Ram::with_program(0x0600, &[0xA9, 0x00, 0xF0, 0x10, 0x00]);
        let mut state = fresh(0x0600);

        state.cycles = 2;
        Interpreter::new().run_until_exit(&mut state, &mut ram, None);

        assert_eq!(state.reason, ExitReason::CyclesExhausted);
        assert_eq!({ state.pc }, 0x0602);
        assert_eq!({ state.cycles }, 0);
    }

    #[test]
    fn jmp_to_self_reports_infinite_loop() {
        let mut ram = Ram::with_program(0x0600, &[0x4C, 0x00, 0x06]);
        let mut state = fresh(0x0600);

        state.cycles = 100;
        Interpreter::new().run_until_exit(&mut state, &mut ram, None);

        assert_eq!(state.reason, ExitReason::InfiniteLoop);
        assert_eq!({ state.pc }, 0x0600);
    }

    #[test]
    fn unknown_opcode_reports_itself() {
        let mut ram = Ram::with_program(0x0600, &[0xEA, 0x02]);
        let mut state = fresh(0x0600);

        state.cycles = 10;
        Interpreter::new().run_until_exit(&mut state, &mut ram, None);

        assert_eq!(state.reason, ExitReason::UnknownInstruction);
        assert_eq!({ state.pc }, 0x0601);
    }

    #[test]
    fn compare_sets_carry_on_greater_equal() {
        let mut ram = Ram::with_program(0x0600, &[0xC9, 0x10, 0x00]);
        let mut state = fresh(0x0600);
        state.a = 0x10;

        run(&mut state, &mut ram, 10);

        assert!(state.flag(FLAG_C));
        assert!(state.flag(FLAG_Z));
        assert!(!state.flag(FLAG_N));
    }

    #[test]
    fn rol_ror_move_bits_through_carry() {
        // SEC / ROL A: A = (A << 1) | 1, carry out of bit 7.
        let mut ram = Ram::with_program(0x0600, &[0x38, 0x2A, 0x00]);
        let mut state = fresh(0x0600);
        state.a = 0x80;

        run(&mut state, &mut ram, 10);

        assert_eq!(state.a, 0x01);
        assert!(state.flag(FLAG_C));
    }
}
