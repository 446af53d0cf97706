//! Streaming instruction decoder.

use crate::{Data, Instruction};

/// Sequentially decodes instructions out of a [`Data`] source.
///
/// The position is kept wider than an address so that it can step past
/// `$FFFF` instead of silently wrapping mid-instruction; reads truncate
/// to the 16-bit bus.
pub struct Disassembler<'a> {
    data: &'a mut dyn Data,
    position: u32,
}

impl<'a> Disassembler<'a> {
    pub fn new(data: &'a mut dyn Data, position: u32) -> Self {
        Self { data, position }
    }

    /// Decodes the instruction at the current position and advances past it.
    pub fn next(&mut self) -> Instruction {
        let mut instr = Instruction::decode(self.next_byte());

        match instr.operand_size() {
            1 => instr.operand = u16::from(self.next_byte()),
            2 => instr.operand = self.next_word(),
            _ => {}
        }

        instr
    }

    /// Current position, in bytes.
    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn set_position(&mut self, position: u32) {
        self.position = position;
    }

    fn next_byte(&mut self) -> u8 {
        let byte = self.data.read(self.position as u16);
        self.position += 1;
        byte
    }

    fn next_word(&mut self) -> u16 {
        let lo = u16::from(self.next_byte());
        let hi = u16::from(self.next_byte());
        (hi << 8) | lo
    }
}
