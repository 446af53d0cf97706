//! 6502 addressing emitted as x86-64.
//!
//! Accesses that provably land in internal RAM (`Zp*` always, `Abs`/`AbsX`/
//! `AbsY` when the whole reachable range sits below the RAM barrier) are
//! emitted as direct loads and stores through the precomputed `Ram` base
//! pointer, masked for mirroring. Everything else calls the `read`/`read16`/
//! `write` bus helpers.

use asm_amd64::{MemReg, Register, Section};
use cpu_6502::{Addressing, Instruction, RAM_BARRIER, RAM_SIZE};

use super::consts::*;

/// Emits memory accesses for one instruction into its section.
pub struct MemoryTranslator<'a> {
    section: &'a mut Section,
}

/// Is this access guaranteed to stay in internal RAM?
fn guaranteed_in_ram(mode: Addressing, address: u16) -> bool {
    match mode {
        // Always within the zero page.
        Addressing::Zp | Addressing::ZpX | Addressing::ZpY => true,
        Addressing::Abs => address < RAM_BARRIER,
        // The index adds at most 0xFF.
        Addressing::AbsX | Addressing::AbsY => address.wrapping_add(0xFF) < RAM_BARRIER,
        // Indirect accesses could stay in RAM too, but they are rare and
        // carry extra wrap rules; keep them on the slow path.
        _ => false,
    }
}

fn indirect_call(section: &mut Section, symbol: &str) {
    section.emit_mov_from_mem(&MemReg::value(symbol), Register::RAX);
    section.emit_call_reg(Register::RAX);
}

impl<'a> MemoryTranslator<'a> {
    pub fn new(section: &'a mut Section) -> Self {
        Self { section }
    }

    /// Emits code leaving the absolute address of `instr` in `destination`
    /// (a 16-bit register).
    pub fn resolve(&mut self, instr: &Instruction, destination: Register) {
        self.resolve_mode(instr.addressing, instr.operand, destination);
    }

    pub fn resolve_mode(&mut self, mode: Addressing, address: u16, destination: Register) {
        let address8 = address as u8;

        match mode {
            Addressing::Zp => {
                self.section.emit_mov_imm(u64::from(address & 0x00FF), destination);
            }
            Addressing::ZpX => {
                self.section.emit_movzx(X, UX);
                self.section.emit_mov(UX, destination);
                self.section.emit_add_imm(i32::from(address8), destination, false);
                self.section.emit_and_imm(0x00FF, destination);
            }
            Addressing::ZpY => {
                self.section.emit_movzx(Y, destination);
                self.section.emit_add_imm(i32::from(address8), destination, false);
                self.section.emit_and_imm(0x00FF, destination);
            }
            Addressing::Abs => {
                self.section.emit_mov_imm(u64::from(address), destination);
            }
            Addressing::AbsX => {
                self.section.emit_mov_imm(u64::from(address), destination);
                self.section.emit_movzx(X, UX);
                self.section.emit_add(UX, destination, false);
            }
            Addressing::AbsY => {
                self.section.emit_mov_imm(u64::from(address), destination);
                self.section.emit_add(YX, destination, false);
            }
            Addressing::Ind => {
                self.section.emit_mov_from_mem(&MemReg::value("Memory"), ARG_1);
                self.section.emit_mov_imm(u64::from(address), ARG_2);
                indirect_call(self.section, "read16");
                if destination != RESULT16 {
                    self.section.emit_mov(RESULT16, destination);
                }
            }
            Addressing::IndX => {
                self.section.emit_movzx(X, ARG_2);
                self.section.emit_add_imm(i32::from(address8), ARG_2, false);
                self.section.emit_and_imm(0x00FF, ARG_2);
                self.section.emit_mov_from_mem(&MemReg::value("Memory"), ARG_1);
                indirect_call(self.section, "read16");
                if destination != RESULT16 {
                    self.section.emit_mov(RESULT16, destination);
                }
            }
            Addressing::IndY => {
                self.section.emit_mov_from_mem(&MemReg::value("Memory"), ARG_1);
                self.section.emit_mov_imm(u64::from(address8), ARG_2);
                indirect_call(self.section, "read16");
                self.section.emit_add(YX, RESULT16, false);
                if destination != RESULT16 {
                    self.section.emit_mov(RESULT16, destination);
                }
            }
            other => unreachable!("{other:?} does not resolve to a memory address"),
        }
    }

    /// Emits the read of `instr`'s operand and names the register holding
    /// the byte.
    pub fn read(&mut self, instr: &Instruction) -> Register {
        match instr.addressing {
            Addressing::Acc => A,
            Addressing::X => X,
            Addressing::Y => Y,
            Addressing::S => S,
            Addressing::P => P,
            Addressing::Imm | Addressing::Imp | Addressing::Rel => {
                self.section.emit_mov_imm(u64::from(instr.operand8()), MEML);
                MEML
            }
            mode => {
                self.resolve_mode(mode, instr.operand, ARG_2);

                if guaranteed_in_ram(mode, instr.operand) {
                    self.section.emit_mov_from_mem(&MemReg::value("Ram"), ARG_1);
                    self.section.emit_and_imm(RAM_SIZE as u32 - 1, ARG_2R);
                    self.section
                        .emit_mov_from_mem(&MemReg::base_index(ARG_1, ARG_2R), MEML);
                    MEML
                } else {
                    self.section.emit_mov_from_mem(&MemReg::value("Memory"), ARG_1);
                    indirect_call(self.section, "read");
                    RESULT8
                }
            }
        }
    }

    /// Emits the write of `source` into `instr`'s operand.
    pub fn write(&mut self, instr: &Instruction, source: Register) {
        match instr.addressing {
            Addressing::Acc => {
                if source != A {
                    self.section.emit_mov(source, A);
                }
            }
            Addressing::X => {
                if source != X {
                    self.section.emit_mov(source, X);
                }
            }
            Addressing::Y => {
                if source != Y {
                    self.section.emit_mov(source, Y);
                }
            }
            Addressing::S => {
                if source != S {
                    self.section.emit_mov(source, S);
                }
            }
            Addressing::P => {
                if source != P {
                    self.section.emit_mov(source, P);
                }
            }
            Addressing::Imm | Addressing::Imp | Addressing::Rel => {
                unreachable!("write through an operand-less addressing mode")
            }
            mode => {
                self.resolve_mode(mode, instr.operand, ARG_2);

                if guaranteed_in_ram(mode, instr.operand) {
                    self.section.emit_mov_from_mem(&MemReg::value("Ram"), ARG_1);
                    self.section.emit_and_imm(RAM_SIZE as u32 - 1, ARG_2R);
                    self.section
                        .emit_mov_to_mem(source, &MemReg::base_index(ARG_1, ARG_2R));
                } else {
                    self.section.emit_mov_from_mem(&MemReg::value("Memory"), ARG_1);
                    if source != ARG_3 {
                        self.section.emit_mov(source, ARG_3);
                    }
                    indirect_call(self.section, "write");
                }
            }
        }
    }

    /// Read-modify-write. `proc` emits the modification on the named
    /// register and returns the register holding the result.
    pub fn rmw(
        &mut self,
        instr: &Instruction,
        proc: impl FnOnce(&mut Section, Register) -> Register,
    ) {
        let (source, destination) = match instr.addressing {
            Addressing::Acc => (A, A),
            Addressing::X => (X, X),
            Addressing::Y => (Y, Y),
            Addressing::S => (S, S),
            Addressing::P => (P, P),
            Addressing::Imm => {
                self.section.emit_mov_imm(u64::from(instr.operand8()), MEML);
                (MEML, A)
            }
            Addressing::Rel | Addressing::Imp => {
                unreachable!("read-modify-write through an operand-less addressing mode")
            }
            mode => {
                self.resolve_mode(mode, instr.operand, ADDR);

                if guaranteed_in_ram(mode, instr.operand) {
                    self.section.emit_mov_from_mem(&MemReg::value("Ram"), ARG_1);
                    self.section.emit_and_imm(RAM_SIZE as u32 - 1, ADDRR);
                    self.section
                        .emit_mov_from_mem(&MemReg::base_index(ARG_1, ADDRR), MEML);

                    let result = proc(self.section, MEML);

                    self.section.emit_mov_from_mem(&MemReg::value("Ram"), ARG_1);
                    self.section
                        .emit_mov_to_mem(result, &MemReg::base_index(ARG_1, ADDRR));
                } else {
                    self.section.emit_mov(ADDR, ARG_2);
                    self.section.emit_mov_from_mem(&MemReg::value("Memory"), ARG_1);
                    indirect_call(self.section, "read");

                    let result = proc(self.section, RESULT8);

                    self.section.emit_mov_from_mem(&MemReg::value("Memory"), ARG_1);
                    self.section.emit_mov(ADDR, ARG_2);
                    if result != ARG_3 {
                        self.section.emit_mov(result, ARG_3);
                    }
                    indirect_call(self.section, "write");
                }

                return;
            }
        };

        // Register (or immediate) targets need no memory traffic.
        let result = proc(self.section, source);
        if result != destination {
            self.section.emit_mov(result, destination);
        }
    }

    /// Pushes a byte onto the guest stack; S decrements after the store.
    pub fn push8(&mut self, source: Register) {
        self.section.emit_mov_from_mem(&MemReg::value("Stack"), ADDRR);
        self.section
            .emit_mov_to_mem(source, &MemReg::base_index(ADDRR, SR));
        self.section.emit_dec(S);
    }

    /// Pushes a 16-bit value, high byte first.
    pub fn push16(&mut self, source: Register) {
        if source != WX {
            self.section.emit_mov(source, WX);
        }
        self.section.emit_mov_from_mem(&MemReg::value("Stack"), ADDRR);

        self.section.emit_ror(8, WX); // High byte first.
        self.section
            .emit_mov_to_mem(WL, &MemReg::base_index(ADDRR, SR));
        self.section.emit_dec(S);

        self.section.emit_shr(8, WX); // Low byte second.
        self.section
            .emit_mov_to_mem(WL, &MemReg::base_index(ADDRR, SR));
        self.section.emit_dec(S);
    }

    /// Pulls a byte from the guest stack; S increments before the load.
    pub fn pull8(&mut self, destination: Register) {
        self.section.emit_inc(S);
        self.section.emit_mov_from_mem(&MemReg::value("Stack"), ADDRR);
        self.section
            .emit_mov_from_mem(&MemReg::base_index(ADDRR, SR), destination);
    }

    /// Pulls a 16-bit value byte-wise, preserving the wrap-around when S
    /// crosses the page boundary.
    pub fn pull16(&mut self, destination: Register) {
        self.section.emit_mov_from_mem(&MemReg::value("Stack"), ADDRR);

        self.section.emit_inc(S);
        self.section
            .emit_mov_from_mem(&MemReg::base_index(ADDRR, SR), MEML); // Low byte.

        self.section.emit_inc(S);
        self.section.emit_mov(MEML, MEMH);
        self.section
            .emit_mov_from_mem(&MemReg::base_index(ADDRR, SR), MEML); // High byte.
        self.section.emit_ror(8, MEMX);

        if destination != MEMX {
            self.section.emit_mov(MEMX, destination);
        }
    }
}
