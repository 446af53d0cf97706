//! 6502 instruction decoding.

/// Memory addressing modes.
///
/// The register "modes" (`Acc`, `X`, `Y`, `S`, `P`) are not real hardware
/// addressing modes; they let register-targeting instructions (`TAX`, `PHA`,
/// `INX`, ...) share the generic read/write/modify paths of the cores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Addressing {
    /// Accumulator.
    Acc,
    /// X register.
    X,
    /// Y register.
    Y,
    /// Stack pointer.
    S,
    /// Processor status word.
    P,
    /// Immediate: `#$nn`.
    Imm,
    /// Implied, no operand.
    Imp,
    /// Relative branch offset (signed 8-bit).
    Rel,
    /// Zero page: `$nn`.
    Zp,
    /// Zero page indexed: `$nn,X` (wraps within page zero).
    ZpX,
    /// Zero page indexed: `$nn,Y` (wraps within page zero).
    ZpY,
    /// Absolute: `$nnnn`.
    Abs,
    /// Absolute indexed: `$nnnn,X`.
    AbsX,
    /// Absolute indexed: `$nnnn,Y`.
    AbsY,
    /// Indirect: `($nnnn)`, JMP only, with the page-wrap quirk.
    Ind,
    /// Indexed indirect: `($nn,X)`.
    IndX,
    /// Indirect indexed: `($nn),Y`.
    IndY,
}

/// The 6502 instruction set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Unmapped opcode.
    Unknown,
    Adc,
    And,
    Asl,
    Bcc,
    Bcs,
    Beq,
    Bit,
    Bmi,
    Bne,
    Bpl,
    Brk,
    Bvc,
    Bvs,
    Clc,
    Cld,
    Cli,
    Clv,
    Cmp,
    Cpx,
    Cpy,
    Dec,
    Dex,
    Dey,
    Eor,
    Inc,
    Inx,
    Iny,
    Jmp,
    Jsr,
    Lda,
    Ldx,
    Ldy,
    Lsr,
    Nop,
    Ora,
    Pha,
    Php,
    Pla,
    Plp,
    Rol,
    Ror,
    Rti,
    Rts,
    Sbc,
    Sec,
    Sed,
    Sei,
    Sta,
    Stx,
    Sty,
    Tax,
    Tay,
    Tsx,
    Txa,
    Txs,
    Tya,
}

/// A decoded 6502 instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub command: Command,
    pub addressing: Addressing,
    /// Base cycle count. Page-cross penalties are not modelled.
    pub cycles: u32,
    /// Operand value; 8-bit operands live in the low byte.
    pub operand: u16,
}

impl Instruction {
    pub const fn new(command: Command, addressing: Addressing, cycles: u32) -> Self {
        Self { command, addressing, cycles, operand: 0 }
    }

    /// Size of the operand in bytes (0, 1 or 2), a function of the
    /// addressing mode alone.
    pub fn operand_size(&self) -> u16 {
        match self.addressing {
            Addressing::Acc
            | Addressing::X
            | Addressing::Y
            | Addressing::S
            | Addressing::P
            | Addressing::Imp => 0,
            Addressing::Imm
            | Addressing::Rel
            | Addressing::Zp
            | Addressing::ZpX
            | Addressing::ZpY
            | Addressing::IndX
            | Addressing::IndY => 1,
            Addressing::Abs | Addressing::AbsX | Addressing::AbsY | Addressing::Ind => 2,
        }
    }

    /// Total encoded length including the opcode byte.
    pub fn length(&self) -> u16 {
        1 + self.operand_size()
    }

    /// The operand as an 8-bit value.
    pub fn operand8(&self) -> u8 {
        self.operand as u8
    }

    /// Does this instruction end a straight-line branch?
    pub fn is_branching(&self) -> bool {
        matches!(
            self.command,
            Command::Bcc
                | Command::Bcs
                | Command::Beq
                | Command::Bmi
                | Command::Bne
                | Command::Bpl
                | Command::Brk
                | Command::Bvc
                | Command::Bvs
                | Command::Jmp
                | Command::Rti
                | Command::Rts
                | Command::Jsr
                | Command::Unknown
        )
    }

    /// Is this one of the eight conditional branches?
    pub fn is_conditional_branching(&self) -> bool {
        matches!(
            self.command,
            Command::Bcc
                | Command::Bcs
                | Command::Beq
                | Command::Bmi
                | Command::Bne
                | Command::Bpl
                | Command::Bvc
                | Command::Bvs
        )
    }

    /// Branch target of a taken conditional branch. `base` is the address of
    /// the *following* instruction; the offset is always signed.
    pub fn destination_address(&self, base: u16) -> u16 {
        base.wrapping_add(self.operand8() as i8 as u16)
    }

    /// Mnemonic, for tracing.
    pub fn command_name(&self) -> &'static str {
        match self.command {
            Command::Unknown => "???",
            Command::Adc => "ADC",
            Command::And => "AND",
            Command::Asl => "ASL",
            Command::Bcc => "BCC",
            Command::Bcs => "BCS",
            Command::Beq => "BEQ",
            Command::Bit => "BIT",
            Command::Bmi => "BMI",
            Command::Bne => "BNE",
            Command::Bpl => "BPL",
            Command::Brk => "BRK",
            Command::Bvc => "BVC",
            Command::Bvs => "BVS",
            Command::Clc => "CLC",
            Command::Cld => "CLD",
            Command::Cli => "CLI",
            Command::Clv => "CLV",
            Command::Cmp => "CMP",
            Command::Cpx => "CPX",
            Command::Cpy => "CPY",
            Command::Dec => "DEC",
            Command::Dex => "DEX",
            Command::Dey => "DEY",
            Command::Eor => "EOR",
            Command::Inc => "INC",
            Command::Inx => "INX",
            Command::Iny => "INY",
            Command::Jmp => "JMP",
            Command::Jsr => "JSR",
            Command::Lda => "LDA",
            Command::Ldx => "LDX",
            Command::Ldy => "LDY",
            Command::Lsr => "LSR",
            Command::Nop => "NOP",
            Command::Ora => "ORA",
            Command::Pha => "PHA",
            Command::Php => "PHP",
            Command::Pla => "PLA",
            Command::Plp => "PLP",
            Command::Rol => "ROL",
            Command::Ror => "ROR",
            Command::Rti => "RTI",
            Command::Rts => "RTS",
            Command::Sbc => "SBC",
            Command::Sec => "SEC",
            Command::Sed => "SED",
            Command::Sei => "SEI",
            Command::Sta => "STA",
            Command::Stx => "STX",
            Command::Sty => "STY",
            Command::Tax => "TAX",
            Command::Tay => "TAY",
            Command::Tsx => "TSX",
            Command::Txa => "TXA",
            Command::Txs => "TXS",
            Command::Tya => "TYA",
        }
    }

    /// Addressing mode name, for tracing.
    pub fn addressing_name(&self) -> &'static str {
        match self.addressing {
            Addressing::Acc => "Acc",
            Addressing::X => "X",
            Addressing::Y => "Y",
            Addressing::S => "S",
            Addressing::P => "P",
            Addressing::Imm => "Imm",
            Addressing::Imp => "Imp",
            Addressing::Rel => "Rel",
            Addressing::Zp => "Zp",
            Addressing::ZpX => "ZpX",
            Addressing::ZpY => "ZpY",
            Addressing::Abs => "Abs",
            Addressing::AbsX => "AbsX",
            Addressing::AbsY => "AbsY",
            Addressing::Ind => "Ind",
            Addressing::IndX => "IndX",
            Addressing::IndY => "IndY",
        }
    }

    /// Decodes `opcode` into an instruction without its operand.
    ///
    /// "Illegal" opcodes are not supported; a handful that are plain aliases
    /// of documented instructions (extra NOPs, $EB = SBC) decode to their
    /// documented twin. Everything else becomes `Unknown`, which the cores
    /// surface as an [`ExitReason::UnknownInstruction`] at run time.
    ///
    /// [`ExitReason::UnknownInstruction`]: crate::ExitReason::UnknownInstruction
    pub fn decode(opcode: u8) -> Instruction {
        use Addressing::*;
        use Command::*;

        match opcode {
            0x18 => Instruction::new(Clc, Imp, 2),
            0x38 => Instruction::new(Sec, Imp, 2),
            0x58 => Instruction::new(Cli, Imp, 2),
            0x78 => Instruction::new(Sei, Imp, 2),
            0xB8 => Instruction::new(Clv, Imp, 2),
            0xD8 => Instruction::new(Cld, Imp, 2),
            0xF8 => Instruction::new(Sed, Imp, 2),

            0x10 => Instruction::new(Bpl, Rel, 2),
            0x30 => Instruction::new(Bmi, Rel, 2),
            0x50 => Instruction::new(Bvc, Rel, 2),
            0x70 => Instruction::new(Bvs, Rel, 2),
            0x90 => Instruction::new(Bcc, Rel, 2),
            0xB0 => Instruction::new(Bcs, Rel, 2),
            0xD0 => Instruction::new(Bne, Rel, 2),
            0xF0 => Instruction::new(Beq, Rel, 2),

            0xAA => Instruction::new(Tax, X, 2),
            0x8A => Instruction::new(Txa, Acc, 2),
            0xCA => Instruction::new(Dex, X, 2),
            0xE8 => Instruction::new(Inx, X, 2),
            0xA8 => Instruction::new(Tay, Y, 2),
            0x98 => Instruction::new(Tya, Acc, 2),
            0x88 => Instruction::new(Dey, Y, 2),
            0xC8 => Instruction::new(Iny, Y, 2),
            0x9A => Instruction::new(Txs, S, 2),
            0xBA => Instruction::new(Tsx, X, 2),

            0x48 => Instruction::new(Pha, Acc, 3),
            0x68 => Instruction::new(Pla, Acc, 4),
            0x08 => Instruction::new(Php, P, 3),
            0x28 => Instruction::new(Plp, P, 4),

            0x4C => Instruction::new(Jmp, Abs, 3),
            0x6C => Instruction::new(Jmp, Ind, 5),

            0x69 => Instruction::new(Adc, Imm, 2),
            0x65 => Instruction::new(Adc, Zp, 3),
            0x75 => Instruction::new(Adc, ZpX, 4),
            0x6D => Instruction::new(Adc, Abs, 4),
            0x7D => Instruction::new(Adc, AbsX, 4),
            0x79 => Instruction::new(Adc, AbsY, 4),
            0x61 => Instruction::new(Adc, IndX, 6),
            0x71 => Instruction::new(Adc, IndY, 5),

            0x29 => Instruction::new(And, Imm, 2),
            0x25 => Instruction::new(And, Zp, 3),
            0x35 => Instruction::new(And, ZpX, 4),
            0x2D => Instruction::new(And, Abs, 4),
            0x3D => Instruction::new(And, AbsX, 4),
            0x39 => Instruction::new(And, AbsY, 4),
            0x21 => Instruction::new(And, IndX, 6),
            0x31 => Instruction::new(And, IndY, 5),

            0x0A => Instruction::new(Asl, Acc, 2),
            0x06 => Instruction::new(Asl, Zp, 5),
            0x16 => Instruction::new(Asl, ZpX, 6),
            0x0E => Instruction::new(Asl, Abs, 6),
            0x1E => Instruction::new(Asl, AbsX, 7),

            0x24 => Instruction::new(Bit, Zp, 3),
            0x2C => Instruction::new(Bit, Abs, 4),

            // BRK carries a padding byte; decode it as the operand so the
            // stacked return address lands behind it.
            0x00 => Instruction::new(Brk, Imm, 7),

            0xC9 => Instruction::new(Cmp, Imm, 2),
            0xC5 => Instruction::new(Cmp, Zp, 3),
            0xD5 => Instruction::new(Cmp, ZpX, 4),
            0xCD => Instruction::new(Cmp, Abs, 4),
            0xDD => Instruction::new(Cmp, AbsX, 4),
            0xD9 => Instruction::new(Cmp, AbsY, 4),
            0xC1 => Instruction::new(Cmp, IndX, 6),
            0xD1 => Instruction::new(Cmp, IndY, 5),

            0xE0 => Instruction::new(Cpx, Imm, 2),
            0xE4 => Instruction::new(Cpx, Zp, 3),
            0xEC => Instruction::new(Cpx, Abs, 4),

            0xC0 => Instruction::new(Cpy, Imm, 2),
            0xC4 => Instruction::new(Cpy, Zp, 3),
            0xCC => Instruction::new(Cpy, Abs, 4),

            0xC6 => Instruction::new(Dec, Zp, 5),
            0xD6 => Instruction::new(Dec, ZpX, 6),
            0xCE => Instruction::new(Dec, Abs, 6),
            0xDE => Instruction::new(Dec, AbsX, 7),

            0x49 => Instruction::new(Eor, Imm, 2),
            0x45 => Instruction::new(Eor, Zp, 3),
            0x55 => Instruction::new(Eor, ZpX, 4),
            0x4D => Instruction::new(Eor, Abs, 4),
            0x5D => Instruction::new(Eor, AbsX, 4),
            0x59 => Instruction::new(Eor, AbsY, 4),
            0x41 => Instruction::new(Eor, IndX, 6),
            0x51 => Instruction::new(Eor, IndY, 5),

            0xE6 => Instruction::new(Inc, Zp, 5),
            0xF6 => Instruction::new(Inc, ZpX, 6),
            0xEE => Instruction::new(Inc, Abs, 6),
            0xFE => Instruction::new(Inc, AbsX, 7),

            0x20 => Instruction::new(Jsr, Abs, 6),

            0xA9 => Instruction::new(Lda, Imm, 2),
            0xA5 => Instruction::new(Lda, Zp, 3),
            0xB5 => Instruction::new(Lda, ZpX, 4),
            0xAD => Instruction::new(Lda, Abs, 4),
            0xBD => Instruction::new(Lda, AbsX, 4),
            0xB9 => Instruction::new(Lda, AbsY, 4),
            0xA1 => Instruction::new(Lda, IndX, 6),
            0xB1 => Instruction::new(Lda, IndY, 5),

            0xA2 => Instruction::new(Ldx, Imm, 2),
            0xA6 => Instruction::new(Ldx, Zp, 3),
            0xB6 => Instruction::new(Ldx, ZpY, 4),
            0xAE => Instruction::new(Ldx, Abs, 4),
            0xBE => Instruction::new(Ldx, AbsY, 4),

            0xA0 => Instruction::new(Ldy, Imm, 2),
            0xA4 => Instruction::new(Ldy, Zp, 3),
            0xB4 => Instruction::new(Ldy, ZpX, 4),
            0xAC => Instruction::new(Ldy, Abs, 4),
            0xBC => Instruction::new(Ldy, AbsX, 4),

            0x4A => Instruction::new(Lsr, Acc, 2),
            0x46 => Instruction::new(Lsr, Zp, 5),
            0x56 => Instruction::new(Lsr, ZpX, 6),
            0x4E => Instruction::new(Lsr, Abs, 6),
            0x5E => Instruction::new(Lsr, AbsX, 7),

            // $EA plus the undocumented single-byte NOP aliases.
            0x1A | 0x3A | 0x5A | 0x7A | 0xDA | 0xFA | 0xEA => Instruction::new(Nop, Imp, 2),

            0x09 => Instruction::new(Ora, Imm, 2),
            0x05 => Instruction::new(Ora, Zp, 3),
            0x15 => Instruction::new(Ora, ZpX, 4),
            0x0D => Instruction::new(Ora, Abs, 4),
            0x1D => Instruction::new(Ora, AbsX, 4),
            0x19 => Instruction::new(Ora, AbsY, 4),
            0x01 => Instruction::new(Ora, IndX, 6),
            0x11 => Instruction::new(Ora, IndY, 5),

            0x2A => Instruction::new(Rol, Acc, 2),
            0x26 => Instruction::new(Rol, Zp, 5),
            0x36 => Instruction::new(Rol, ZpX, 6),
            0x2E => Instruction::new(Rol, Abs, 6),
            0x3E => Instruction::new(Rol, AbsX, 7),

            0x6A => Instruction::new(Ror, Acc, 2),
            0x66 => Instruction::new(Ror, Zp, 5),
            0x76 => Instruction::new(Ror, ZpX, 6),
            0x6E => Instruction::new(Ror, Abs, 6),
            0x7E => Instruction::new(Ror, AbsX, 7),

            0x40 => Instruction::new(Rti, Imp, 6),
            0x60 => Instruction::new(Rts, Imp, 6),

            // $EB is an undocumented alias of SBC #imm.
            0xEB | 0xE9 => Instruction::new(Sbc, Imm, 2),
            0xE5 => Instruction::new(Sbc, Zp, 3),
            0xF5 => Instruction::new(Sbc, ZpX, 4),
            0xED => Instruction::new(Sbc, Abs, 4),
            0xFD => Instruction::new(Sbc, AbsX, 4),
            0xF9 => Instruction::new(Sbc, AbsY, 4),
            0xE1 => Instruction::new(Sbc, IndX, 6),
            0xF1 => Instruction::new(Sbc, IndY, 5),

            0x85 => Instruction::new(Sta, Zp, 3),
            0x95 => Instruction::new(Sta, ZpX, 4),
            0x8D => Instruction::new(Sta, Abs, 4),
            0x9D => Instruction::new(Sta, AbsX, 5),
            0x99 => Instruction::new(Sta, AbsY, 5),
            0x81 => Instruction::new(Sta, IndX, 6),
            0x91 => Instruction::new(Sta, IndY, 6),

            0x86 => Instruction::new(Stx, Zp, 3),
            0x96 => Instruction::new(Stx, ZpY, 4),
            0x8E => Instruction::new(Stx, Abs, 4),

            0x84 => Instruction::new(Sty, Zp, 3),
            0x94 => Instruction::new(Sty, ZpX, 4),
            0x8C => Instruction::new(Sty, Abs, 4),

            _ => Instruction::new(Unknown, Imp, 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_reference_cases() {
        let jmp = Instruction::decode(0x4C);
        assert_eq!(jmp.command, Command::Jmp);
        assert_eq!(jmp.addressing, Addressing::Abs);
        assert_eq!(jmp.cycles, 3);
        assert_eq!(jmp.operand_size(), 2);

        let nop = Instruction::decode(0xEA);
        assert_eq!(nop.command, Command::Nop);
        assert_eq!(nop.addressing, Addressing::Imp);
        assert_eq!(nop.cycles, 2);
        assert_eq!(nop.operand_size(), 0);

        let ind = Instruction::decode(0x6C);
        assert_eq!(ind.command, Command::Jmp);
        assert_eq!(ind.addressing, Addressing::Ind);
        assert_eq!(ind.cycles, 5);
        assert_eq!(ind.operand_size(), 2);

        let unknown = Instruction::decode(0x02);
        assert_eq!(unknown.command, Command::Unknown);
        assert_eq!(unknown.addressing, Addressing::Imp);
        assert_eq!(unknown.cycles, 1);
    }

    #[test]
    fn every_opcode_decodes() {
        for opcode in 0..=255u8 {
            let instr = Instruction::decode(opcode);
            assert!(instr.operand_size() <= 2);
            if instr.command == Command::Unknown {
                assert!(instr.is_branching());
            }
        }
    }

    #[test]
    fn branching_partition() {
        for opcode in 0..=255u8 {
            let instr = Instruction::decode(opcode);
            if instr.is_conditional_branching() {
                assert!(instr.is_branching());
                assert_eq!(instr.addressing, Addressing::Rel);
            }
        }
    }

    #[test]
    fn branch_destination_is_signed() {
        let mut bne = Instruction::decode(0xD0);
        bne.operand = 0xFE; // -2
        assert_eq!(bne.destination_address(0x8002), 0x8000);

        bne.operand = 0x10;
        assert_eq!(bne.destination_address(0x8002), 0x8012);
    }
}
