//! Translation of recovered functions into Lua source text.
//!
//! One guest function becomes one Lua chunk of the shape
//! `return function(a, x, y, s, p, cycles) ... end` returning
//! `(a, x, y, s, p, cycles, pc, reason)`. The processor status word is
//! unpacked into boolean locals on entry and repacked on every exit path.
//! Every guest address gets a `::instr_<addr>::` label; straight-line flow is
//! made explicit with `goto` so interleaved branches can't fall into each
//! other. Memory access goes through the host-provided `read`, `read16` and
//! `write` globals.

use std::collections::HashSet;
use std::fmt::Write;

use cpu_6502::{
    flag_mask, Addressing, BranchInstruction, Command, ExitReason, Function, Instruction, FLAG_B,
    FLAG_C, FLAG_D, FLAG_I, FLAG_N, FLAG_U, FLAG_V, FLAG_Z,
};

/// Generates the Lua chunk implementing `function`.
pub fn translate(function: &Function) -> String {
    let mut generator = Generator { out: String::new(), seen: HashSet::new() };
    generator.function(function);
    generator.out
}

struct Generator {
    out: String,
    seen: HashSet<u16>,
}

impl Generator {
    fn line(&mut self, text: &str) {
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn linef(&mut self, arguments: std::fmt::Arguments) {
        // Writing into a String cannot fail.
        let _ = self.out.write_fmt(arguments);
        self.out.push('\n');
    }

    fn function(&mut self, function: &Function) {
        self.line("return function(a, x, y, s, p, cycles)");
        self.line("local pc, reason = 0, 0");
        self.line("local t, u, w, addr");
        self.line("local C, Z, I, D, B, U, V, N");
        self.unpack_psw();

        // Branches are stored root-first, so the entry point leads.
        for branch in function.branches() {
            self.branch(function, branch);
        }

        self.line("::eof::");
        self.pack_psw();
        self.line("return a, x, y, s, p, cycles, pc, reason");
        self.line("end");
    }

    fn unpack_psw(&mut self) {
        for (name, flag) in Self::FLAG_LOCALS {
            let mask = flag_mask(flag);
            self.linef(format_args!("{name} = ((p & {mask}) == {mask})"));
        }
    }

    fn pack_psw(&mut self) {
        self.line("p = 0");
        for (name, flag) in Self::FLAG_LOCALS {
            let mask = flag_mask(flag);
            self.linef(format_args!("p = (p | ({name} and {mask} or 0))"));
        }
    }

    const FLAG_LOCALS: [(&'static str, u8); 8] = [
        ("C", FLAG_C),
        ("Z", FLAG_Z),
        ("I", FLAG_I),
        ("D", FLAG_D),
        ("B", FLAG_B),
        ("U", FLAG_U),
        ("V", FLAG_V),
        ("N", FLAG_N),
    ];

    fn branch(&mut self, function: &Function, branch: &cpu_6502::Branch) {
        for (address, element) in branch.elements() {
            // Interleaved branches revisit addresses; emit each only once.
            if !self.seen.insert(*address) {
                continue;
            }

            self.linef(format_args!("::instr_{address}::"));

            match element {
                BranchInstruction::Plain(instr) => {
                    self.linef(format_args!(
                        "-- {} {} {}",
                        instr.command_name(),
                        instr.addressing_name(),
                        { instr.operand }
                    ));
                    self.instruction(*address, instr);

                    if !instr.is_branching() {
                        let next = address.wrapping_add(instr.length());
                        self.linef(format_args!("goto instr_{next}"));
                    }
                }
                BranchInstruction::Conditional { instruction, truthy, falsy } => {
                    self.conditional(
                        *address,
                        instruction,
                        function.branch(*truthy).start(),
                        function.branch(*falsy).start(),
                    );
                }
            }
        }
    }

    fn conditional(&mut self, address: u16, instr: &Instruction, truthy: u16, falsy: u16) {
        let condition = match instr.command {
            Command::Bcc => "(C == false)",
            Command::Bcs => "(C == true)",
            Command::Beq => "(Z == true)",
            Command::Bne => "(Z == false)",
            Command::Bmi => "(N == true)",
            Command::Bpl => "(N == false)",
            Command::Bvs => "(V == true)",
            Command::Bvc => "(V == false)",
            other => unreachable!("{other:?} is not a conditional branch"),
        };

        // The budget check precedes the charge, so a resume at this address
        // re-runs the branch exactly once.
        self.line("if cycles <= 0 then");
        self.linef(format_args!("  pc = {address}"));
        self.linef(format_args!("  reason = {}", ExitReason::CyclesExhausted as u8));
        self.line("  goto eof");
        self.line("end");
        self.reduce_cycles(instr.cycles);

        self.linef(format_args!(
            "if {condition} then goto instr_{truthy} else goto instr_{falsy} end"
        ));
    }

    fn reduce_cycles(&mut self, cycles: u32) {
        self.linef(format_args!("cycles = cycles - {cycles}"));
    }

    fn set_nz(&mut self, name: &str) {
        self.linef(format_args!("N = ({name} >= 0x80)"));
        self.linef(format_args!("Z = ({name} == 0x0)"));
    }

    fn return_to_host(&mut self, pc: &str, reason: ExitReason) {
        self.linef(format_args!("pc = {pc}"));
        self.linef(format_args!("reason = {}", reason as u8));
        self.line("goto eof");
    }

    fn compare(&mut self, register: &str, operand: &str) {
        self.linef(format_args!("t = {operand}"));
        self.linef(format_args!("u = (({register} - t) & 0xFF)"));
        self.linef(format_args!("C = ({register} >= t)"));
        self.set_nz("u");
    }

    fn push8(&mut self, value: &str) {
        self.linef(format_args!("write(s + 0x100, {value})"));
        self.line("s = ((s - 1) & 0xFF)");
    }

    fn pull8(&mut self, into: &str) {
        self.line("s = ((s + 1) & 0xFF)");
        self.linef(format_args!("{into} = read(s + 0x100)"));
    }

    /// Byte-wise 16-bit pull, preserving the wrap-around when S crosses the
    /// page boundary.
    fn pull16(&mut self, into: &str) {
        self.line("s = ((s + 1) & 0xFF)");
        self.line("t = read(s + 0x100)");
        self.line("s = ((s + 1) & 0xFF)");
        self.linef(format_args!("{into} = ((read(s + 0x100) << 8) | t)"));
    }

    fn adc(&mut self, operand: &str) {
        self.linef(format_args!("t = {operand}")); // t = operand
        self.line("w = a + (C and 1 or 0)"); // w = a + carry-in
        self.line("u = w + t"); // u = a + operand + carry
        self.line("V = (((~(a ~ t)) & (a ~ u) & 0x80) ~= 0)");
        self.line("C = (u > 0xFF)");
        self.line("a = (u & 0xFF)");
        self.set_nz("a");
    }

    /// Resolves an addressing mode to an absolute address expression.
    fn resolve(&mut self, mode: Addressing, operand: u16) -> String {
        let op8 = operand as u8;

        match mode {
            Addressing::Zp => format!("{op8}"),
            Addressing::ZpX => format!("(({operand} + x) & 0xFF)"),
            Addressing::ZpY => format!("(({operand} + y) & 0xFF)"),
            Addressing::Abs => format!("{operand}"),
            Addressing::AbsX => format!("(({operand} + x) & 0xFFFF)"),
            Addressing::AbsY => format!("(({operand} + y) & 0xFFFF)"),
            Addressing::Ind => format!("read16({operand})"),
            Addressing::IndX => format!("read16((({op8} + x) & 0xFF))"),
            Addressing::IndY => format!("((read16({op8}) + y) & 0xFFFF)"),
            other => unreachable!("{other:?} does not resolve to an address"),
        }
    }

    /// The byte an instruction reads, register or memory.
    fn read(&mut self, instr: &Instruction) -> String {
        match instr.addressing {
            Addressing::Acc => "a".to_string(),
            Addressing::X => "x".to_string(),
            Addressing::Y => "y".to_string(),
            Addressing::S => "s".to_string(),
            Addressing::P => "p".to_string(),
            Addressing::Imm | Addressing::Imp | Addressing::Rel => {
                format!("{}", instr.operand8())
            }
            mode => {
                let address = self.resolve(mode, instr.operand);
                format!("read({address})")
            }
        }
    }

    fn write(&mut self, instr: &Instruction, value: &str) {
        match instr.addressing {
            Addressing::Acc => self.linef(format_args!("a = {value}")),
            Addressing::X => self.linef(format_args!("x = {value}")),
            Addressing::Y => self.linef(format_args!("y = {value}")),
            Addressing::S => self.linef(format_args!("s = {value}")),
            Addressing::P => {
                self.linef(format_args!("p = {value}"));
                self.unpack_psw();
            }
            Addressing::Imm | Addressing::Imp | Addressing::Rel => {
                unreachable!("write through an operand-less addressing mode")
            }
            mode => {
                let address = self.resolve(mode, instr.operand);
                self.linef(format_args!("write({address}, {value})"));
            }
        }
    }

    /// Read-modify-write: `proc` emits the modification and names the result
    /// expression.
    fn rmw(&mut self, instr: &Instruction, proc: impl FnOnce(&mut Self, &str) -> String) {
        match instr.addressing {
            Addressing::Acc => {
                let result = proc(self, "a");
                self.linef(format_args!("a = {result}"));
            }
            Addressing::X => {
                let result = proc(self, "x");
                self.linef(format_args!("x = {result}"));
            }
            Addressing::Y => {
                let result = proc(self, "y");
                self.linef(format_args!("y = {result}"));
            }
            Addressing::S => {
                let result = proc(self, "s");
                self.linef(format_args!("s = {result}"));
            }
            Addressing::P => {
                let result = proc(self, "p");
                self.linef(format_args!("p = {result}"));
                self.unpack_psw();
            }
            Addressing::Imm => {
                let operand = format!("{}", instr.operand8());
                let result = proc(self, &operand);
                self.linef(format_args!("a = {result}"));
            }
            Addressing::Rel | Addressing::Imp => {
                unreachable!("read-modify-write through an operand-less addressing mode")
            }
            mode => {
                let address = self.resolve(mode, instr.operand);
                self.linef(format_args!("addr = {address}"));
                let result = proc(self, "read(addr)");
                self.linef(format_args!("write(addr, {result})"));
            }
        }
    }

    fn instruction(&mut self, address: u16, instr: &Instruction) {
        let next_addr = address.wrapping_add(instr.length());
        self.reduce_cycles(instr.cycles);

        match instr.command {
            Command::Adc => {
                let operand = self.read(instr);
                self.adc(&operand);
            }
            Command::And => {
                let operand = self.read(instr);
                self.linef(format_args!("a = (a & {operand})"));
                self.set_nz("a");
            }
            Command::Asl => self.rmw(instr, |this, value| {
                this.linef(format_args!("t = {value}"));
                this.line("C = (t >= 0x80)");
                this.line("u = ((t << 1) & 0xFF)");
                this.set_nz("u");
                "u".to_string()
            }),
            Command::Bit => {
                let operand = self.read(instr);
                let v = flag_mask(FLAG_V);
                let n = flag_mask(FLAG_N);
                self.linef(format_args!("t = {operand}"));
                self.line("Z = ((a & t) == 0)");
                self.linef(format_args!("V = ((t & {v}) == {v})"));
                self.linef(format_args!("N = ((t & {n}) == {n})"));
            }
            Command::Brk => {
                self.return_to_host(&format!("{next_addr}"), ExitReason::Break);
            }
            Command::Clc => self.line("C = false"),
            Command::Cld => self.line("D = false"),
            Command::Cli => self.line("I = false"),
            Command::Clv => self.line("V = false"),
            Command::Cmp => {
                let operand = self.read(instr);
                self.compare("a", &operand);
            }
            Command::Cpx => {
                let operand = self.read(instr);
                self.compare("x", &operand);
            }
            Command::Cpy => {
                let operand = self.read(instr);
                self.compare("y", &operand);
            }
            Command::Dec | Command::Dex | Command::Dey => self.rmw(instr, |this, value| {
                this.linef(format_args!("t = (({value} - 1) & 0xFF)"));
                this.set_nz("t");
                "t".to_string()
            }),
            Command::Eor => {
                let operand = self.read(instr);
                self.linef(format_args!("a = (a ~ {operand})"));
                self.set_nz("a");
            }
            Command::Inc | Command::Inx | Command::Iny => self.rmw(instr, |this, value| {
                this.linef(format_args!("t = (({value} + 1) & 0xFF)"));
                this.set_nz("t");
                "t".to_string()
            }),
            Command::Jmp => {
                let target = self.resolve(instr.addressing, instr.operand);
                self.linef(format_args!("pc = {target}"));
                self.linef(format_args!("if pc == {address} then"));
                self.linef(format_args!("  reason = {}", ExitReason::InfiniteLoop as u8));
                self.line("else");
                self.linef(format_args!("  reason = {}", ExitReason::Jump as u8));
                self.line("end");
                self.line("goto eof");
            }
            Command::Jsr => {
                let target = next_addr.wrapping_sub(1);
                let high = target >> 8;
                let low = target & 0xFF;

                self.push8(&format!("{high}"));
                self.push8(&format!("{low}"));
                self.return_to_host(&format!("{}", { instr.operand }), ExitReason::Jump);
            }
            Command::Lda => {
                let operand = self.read(instr);
                self.linef(format_args!("a = {operand}"));
                self.set_nz("a");
            }
            Command::Ldx => {
                let operand = self.read(instr);
                self.linef(format_args!("x = {operand}"));
                self.set_nz("x");
            }
            Command::Ldy => {
                let operand = self.read(instr);
                self.linef(format_args!("y = {operand}"));
                self.set_nz("y");
            }
            Command::Lsr => self.rmw(instr, |this, value| {
                this.linef(format_args!("t = {value}"));
                this.line("C = ((t & 1) == 1)");
                this.line("u = (t >> 1)");
                this.set_nz("u");
                "u".to_string()
            }),
            Command::Nop => {}
            Command::Ora => {
                let operand = self.read(instr);
                self.linef(format_args!("a = (a | {operand})"));
                self.set_nz("a");
            }
            Command::Pha => self.push8("a"),
            Command::Php => {
                // The pushed copy always carries Break and AlwaysOne.
                self.pack_psw();
                self.push8(&format!("(p | {})", flag_mask(FLAG_B) | flag_mask(FLAG_U)));
            }
            Command::Pla => {
                self.pull8("a");
                self.set_nz("a");
            }
            Command::Plp => {
                self.pull8("p");
                self.linef(format_args!("p = (p | {})", flag_mask(FLAG_U)));
                self.unpack_psw();
            }
            Command::Rol => self.rmw(instr, |this, value| {
                this.linef(format_args!("t = {value}"));
                this.line("u = (C and 1 or 0)");
                this.line("C = ((t & 0x80) == 0x80)");
                this.line("u = ((u | (t << 1)) & 0xFF)");
                this.set_nz("u");
                "u".to_string()
            }),
            Command::Ror => self.rmw(instr, |this, value| {
                this.linef(format_args!("t = {value}"));
                this.line("u = (C and 0x80 or 0)");
                this.line("C = ((t & 1) == 1)");
                this.line("u = ((u | (t >> 1)) & 0xFF)");
                this.set_nz("u");
                "u".to_string()
            }),
            Command::Rti => {
                self.pull8("p");
                self.linef(format_args!("p = (p | {})", flag_mask(FLAG_U)));
                self.unpack_psw();
                self.pull16("addr");
                self.return_to_host("addr", ExitReason::Return);
            }
            Command::Rts => {
                self.pull16("addr");
                self.return_to_host("((addr + 1) & 0xFFFF)", ExitReason::Return);
            }
            Command::Sbc => {
                // One's complement; the carry supplies the borrow.
                let operand = self.read(instr);
                self.adc(&format!("({operand} ~ 0xFF)"));
            }
            Command::Sec => self.line("C = true"),
            Command::Sed => self.line("D = true"),
            Command::Sei => self.line("I = true"),
            Command::Sta => self.write(instr, "a"),
            Command::Stx => self.write(instr, "x"),
            Command::Sty => self.write(instr, "y"),
            Command::Tax => {
                self.line("x = a");
                self.set_nz("x");
            }
            Command::Tay => {
                self.line("y = a");
                self.set_nz("y");
            }
            Command::Tsx => {
                self.line("x = s");
                self.set_nz("x");
            }
            Command::Txa => {
                self.line("a = x");
                self.set_nz("a");
            }
            Command::Txs => self.line("s = x"),
            Command::Tya => {
                self.line("a = y");
                self.set_nz("a");
            }
            Command::Unknown => {
                self.return_to_host(&format!("{address}"), ExitReason::UnknownInstruction);
            }
            _ => unreachable!("conditional branches are emitted separately"),
        }
    }
}
