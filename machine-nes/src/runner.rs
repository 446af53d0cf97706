//! The frame runner driving CPU and PPU in lock-step.

use std::cell::RefCell;
use std::rc::Rc;

use cpu_6502::Interrupt;

use crate::cartridge::{create_mapper, InesFile};
use crate::cpu::{CoreKind, Cpu};
use crate::memory::{CpuBus, CpuMemory};
use crate::ppu::{FrameSink, PpuMemory, Renderer};

/// CPU cycles per video frame.
const TOTAL_CYCLES: i32 = 29781;

/// Scan lines the budget is divided over.
const SCAN_LINES: i32 = 260;

/// Budget slice per scan line.
const PER_LINE: i32 = TOTAL_CYCLES / SCAN_LINES;

/// Rounding remainder, paid once per frame.
const LEFTOVER: i32 = TOTAL_CYCLES - PER_LINE * SCAN_LINES;

/// Owns the machine and advances it one frame at a time.
pub struct Runner {
    cpu: Cpu,
    renderer: Renderer,
    vram: Rc<RefCell<PpuMemory>>,
    bus: CpuBus,
    cycles: i32,
}

impl Runner {
    /// Wires up a machine for the given ROM and core selection.
    pub fn new(ines: &InesFile, kind: CoreKind) -> Result<Self, String> {
        let mapper = create_mapper(ines)?;
        let vram = Rc::new(RefCell::new(PpuMemory::new(Rc::clone(&mapper))));
        let bus = CpuBus::new(CpuMemory::new(Rc::clone(&vram), mapper));
        let cpu = Cpu::new(kind, bus.clone())?;
        let renderer = Renderer::new(Rc::clone(&vram));

        let mut runner = Self { cpu, renderer, vram, bus, cycles: 0 };
        runner.reset(true);
        Ok(runner)
    }

    /// Resets the machine; a hard reset also clears the RAM.
    pub fn reset(&mut self, hard: bool) {
        if hard {
            self.bus.memory().reset();
        }

        self.vram.borrow_mut().reset();
        self.renderer.reset();
        self.cpu.jump_to_vector(Interrupt::Reset);
    }

    /// Runs one full video frame: 260 scan-line slices of CPU time, each
    /// followed by one rendered line, with the VBlank NMI delivered in
    /// between.
    pub fn tick(&mut self, sink: &mut dyn FrameSink) -> Result<(), String> {
        self.cycles += LEFTOVER;

        loop {
            self.cycles = self.cpu.run(self.cycles + PER_LINE)?;

            let line = self.renderer.draw_scan_line(sink);
            if line.nmi {
                self.cpu.interrupt(Interrupt::NonMaskable, false);
            }
            if line.frame_done {
                return Ok(());
            }
        }
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn bus(&self) -> &CpuBus {
        &self.bus
    }

    /// Reads a PPU bus address, for inspection.
    pub fn ppu_peek(&self, address: u16) -> u8 {
        self.vram.borrow_mut().read(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_split_covers_the_frame() {
        assert_eq!(PER_LINE, 114);
        assert_eq!(PER_LINE * SCAN_LINES + LEFTOVER, TOTAL_CYCLES);
        assert_eq!(LEFTOVER, 141);
    }
}
