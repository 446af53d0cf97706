//! The CPU facade over the interchangeable execution cores.

use cpu_6502::{
    flag_mask, CpuState, ExitReason, Hook, Interpreter, Interrupt, FLAG_B, FLAG_I, FLAG_U,
    STACK_BASE,
};

use crate::lua::LuaCore;
use crate::memory::CpuBus;

#[cfg(target_arch = "x86_64")]
use crate::dynarec::Amd64Core;

/// The selectable execution cores. Configuration selects them by string
/// identifier; `dynarec` is accepted as an alias for the native recompiler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoreKind {
    /// Reference interpreter.
    Interpret,
    /// Dynamic recompiler emitting x86-64 (x86-64 hosts only).
    Amd64,
    /// Transpiler emitting Lua.
    Lua,
}

impl CoreKind {
    /// Parses a configuration identifier.
    pub fn from_name(name: &str) -> Result<CoreKind, String> {
        match name {
            "interpret" => Ok(CoreKind::Interpret),
            "amd64" | "dynarec" => Ok(CoreKind::Amd64),
            "lua" => Ok(CoreKind::Lua),
            other => Err(format!("Unknown CPU implementation '{other}'")),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CoreKind::Interpret => "interpret",
            CoreKind::Amd64 => "amd64",
            CoreKind::Lua => "lua",
        }
    }

    /// The identifiers accepted by [`CoreKind::from_name`].
    pub fn available() -> &'static [&'static str] {
        &["interpret", "amd64", "dynarec", "lua"]
    }
}

enum Backend {
    Interpret(Interpreter),
    #[cfg(target_arch = "x86_64")]
    Amd64(Box<Amd64Core>),
    Lua(Box<LuaCore>),
}

/// The guest CPU: state, bus and the selected execution core, plus the
/// interrupt and stack machinery every core shares.
pub struct Cpu {
    state: CpuState,
    bus: CpuBus,
    backend: Backend,
    hook: Option<Box<dyn Hook>>,
}

impl Cpu {
    /// Builds a CPU driven by the given core.
    pub fn new(kind: CoreKind, bus: CpuBus) -> Result<Self, String> {
        let backend = match kind {
            CoreKind::Interpret => Backend::Interpret(Interpreter::new()),
            #[cfg(target_arch = "x86_64")]
            CoreKind::Amd64 => Backend::Amd64(Box::new(Amd64Core::new(bus.clone()))),
            #[cfg(not(target_arch = "x86_64"))]
            CoreKind::Amd64 => {
                return Err("CPU implementation 'amd64' requires an x86-64 host".to_string())
            }
            CoreKind::Lua => Backend::Lua(Box::new(LuaCore::new(bus.clone())?)),
        };

        Ok(Self { state: CpuState::new(), bus, backend, hook: None })
    }

    /// Builds a CPU from a configuration identifier.
    pub fn by_name(name: &str, bus: CpuBus) -> Result<Self, String> {
        Self::new(CoreKind::from_name(name)?, bus)
    }

    pub fn state(&self) -> &CpuState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut CpuState {
        &mut self.state
    }

    pub fn bus(&self) -> &CpuBus {
        &self.bus
    }

    /// Installs an instruction hook. Only the interpreter core honours it.
    pub fn set_hook(&mut self, hook: Option<Box<dyn Hook>>) {
        self.hook = hook;
    }

    /// Replaces the program counter.
    pub fn jump(&mut self, address: u16) {
        self.state.pc = address;
    }

    /// Jumps through an interrupt vector, like `JMP (VECTOR)`.
    pub fn jump_to_vector(&mut self, interrupt: Interrupt) {
        let target = self.bus.memory().read16(interrupt.vector_address());
        self.jump(target);
    }

    /// Delivers `interrupt`: unless masked, stacks PC and PSW and jumps
    /// through the vector. The Break flag of the stacked PSW tells software
    /// interrupts apart from hardware ones.
    pub fn interrupt(&mut self, interrupt: Interrupt, force: bool) {
        if !force && interrupt.is_maskable() && self.state.flag(FLAG_I) {
            return;
        }

        let mut psw = self.state.p | flag_mask(FLAG_U);
        if interrupt == Interrupt::Break {
            psw |= flag_mask(FLAG_B);
        } else {
            psw &= !flag_mask(FLAG_B);
        }

        let pc = self.state.pc;
        self.push16(pc);
        self.push8(psw);

        self.state.p |= flag_mask(FLAG_I);
        self.jump_to_vector(interrupt);
    }

    /// Advances the guest by at least `cycles` cycles and returns the
    /// remainder (which may be negative).
    ///
    /// This is the dispatch loop shared by all cores: the active core runs
    /// until an exit reason, which decides whether to deliver a break
    /// interrupt, stop the frame, or keep going.
    pub fn run(&mut self, cycles: i32) -> Result<i32, String> {
        self.state.cycles = cycles;

        let mut running = true;
        while running && { self.state.cycles } > 0 {
            self.run_backend()?;

            match self.state.reason {
                ExitReason::Break => {
                    // Jump to the IRQ handler in the BRK context.
                    self.interrupt(Interrupt::Break, true);
                }
                ExitReason::CyclesExhausted => {
                    // The loop condition handles this one.
                }
                ExitReason::Return | ExitReason::Jump => {
                    // The guest already updated its own PC.
                }
                ExitReason::InfiniteLoop => {
                    // No point burning host cycles; claim the budget is gone.
                    self.state.cycles = 0;
                    running = false;
                }
                ExitReason::UnknownInstruction => {
                    return Err(format!(
                        "Unknown 6502 instruction at {:04x}",
                        { self.state.pc }
                    ));
                }
            }
        }

        Ok(self.state.cycles)
    }

    fn run_backend(&mut self) -> Result<(), String> {
        match &mut self.backend {
            Backend::Interpret(interpreter) => {
                let hook: Option<&mut dyn Hook> = match &mut self.hook {
                    Some(h) => Some(h.as_mut()),
                    None => None,
                };
                interpreter.run_until_exit(&mut self.state, &mut self.bus, hook);
                Ok(())
            }
            #[cfg(target_arch = "x86_64")]
            Backend::Amd64(core) => core.run_until_exit(&mut self.state),
            Backend::Lua(core) => core.run_until_exit(&mut self.state),
        }
    }

    fn push8(&mut self, value: u8) {
        let address = STACK_BASE + u16::from(self.state.s);
        self.bus.memory().write(address, value);
        self.state.s = self.state.s.wrapping_sub(1);
    }

    fn push16(&mut self, value: u16) {
        self.push8((value >> 8) as u8);
        self.push8(value as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::{create_mapper, InesFile, CHR_BANK_SIZE, PRG_BANK_SIZE};
    use crate::memory::CpuMemory;
    use crate::ppu::PpuMemory;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// A bus whose last PRG bytes carry the interrupt vectors.
    fn bus_with_program(program: &[u8], vectors: [u16; 3]) -> CpuBus {
        let mut rom = vec![0u8; 16 + PRG_BANK_SIZE + CHR_BANK_SIZE];
        rom[0..4].copy_from_slice(b"NES\x1A");
        rom[4] = 1;
        rom[5] = 1;
        rom[16..16 + program.len()].copy_from_slice(program);

        // One 16 KiB bank mirrors $8000 to $C000; the vectors at
        // $FFFA/$FFFC/$FFFE land at the end of the bank.
        let end = 16 + PRG_BANK_SIZE;
        rom[end - 6..end - 4].copy_from_slice(&vectors[0].to_le_bytes());
        rom[end - 4..end - 2].copy_from_slice(&vectors[1].to_le_bytes());
        rom[end - 2..end].copy_from_slice(&vectors[2].to_le_bytes());

        let ines = InesFile::load(&rom).unwrap();
        let mapper = create_mapper(&ines).unwrap();
        let vram = Rc::new(RefCell::new(PpuMemory::new(Rc::clone(&mapper))));
        CpuBus::new(CpuMemory::new(vram, mapper))
    }

    #[test]
    fn core_names_resolve() {
        assert_eq!(CoreKind::from_name("interpret").unwrap(), CoreKind::Interpret);
        assert_eq!(CoreKind::from_name("amd64").unwrap(), CoreKind::Amd64);
        assert_eq!(CoreKind::from_name("dynarec").unwrap(), CoreKind::Amd64);
        assert_eq!(CoreKind::from_name("lua").unwrap(), CoreKind::Lua);
        assert!(CoreKind::from_name("z80").is_err());
    }

    #[test]
    fn reset_vector_is_taken() {
        let bus = bus_with_program(&[], [0x9000, 0x8123, 0x9100]);
        let mut cpu = Cpu::new(CoreKind::Interpret, bus).unwrap();

        cpu.jump_to_vector(Interrupt::Reset);
        assert_eq!({ cpu.state().pc }, 0x8123);
    }

    #[test]
    fn brk_enters_the_service_routine() {
        // $8000: BRK; IRQ vector -> $8010.
        let bus = bus_with_program(&[0x00], [0x9000, 0x8000, 0x8010]);
        let mut cpu = Cpu::new(CoreKind::Interpret, bus).unwrap();
        cpu.state_mut().p = 0;
        cpu.state_mut().s = 0xFD;
        cpu.jump(0x8000);

        // Exactly the BRK's cycles: the dispatch loop delivers the break
        // interrupt and then runs out of budget.
        cpu.run(7).unwrap();

        assert_eq!({ cpu.state().pc }, 0x8010);
        assert!(cpu.state().flag(FLAG_I));

        let mut memory = cpu.bus().memory();
        assert_eq!(memory.read(0x01FD), 0x80); // Return address high...
        assert_eq!(memory.read(0x01FC), 0x02); // ...and low: past the pad.
        assert_eq!(memory.read(0x01FB), 0x30); // PSW with Break|AlwaysOne.
    }

    #[test]
    fn maskable_interrupts_respect_the_flag() {
        let bus = bus_with_program(&[], [0x9000, 0x8000, 0x9100]);
        let mut cpu = Cpu::new(CoreKind::Interpret, bus).unwrap();
        cpu.state_mut().p = flag_mask(FLAG_I);
        cpu.state_mut().s = 0xFD;
        cpu.jump(0x8000);

        cpu.interrupt(Interrupt::Service, false);
        assert_eq!({ cpu.state().pc }, 0x8000); // Ignored.

        cpu.interrupt(Interrupt::NonMaskable, false);
        assert_eq!({ cpu.state().pc }, 0x9000); // NMI always lands.
    }

    #[test]
    fn interrupt_stacks_pc_and_psw() {
        let bus = bus_with_program(&[], [0x9000, 0x8000, 0x9100]);
        let mut cpu = Cpu::new(CoreKind::Interpret, bus).unwrap();
        cpu.state_mut().p = 0x01;
        cpu.state_mut().s = 0xFD;
        cpu.jump(0x8234);

        cpu.interrupt(Interrupt::Break, true);

        let mut memory = cpu.bus().memory();
        assert_eq!(memory.read(0x01FD), 0x82); // PC high.
        assert_eq!(memory.read(0x01FC), 0x34); // PC low.
        // PSW with Break and AlwaysOne set.
        assert_eq!(memory.read(0x01FB), 0x01 | 0x10 | 0x20);
        drop(memory);
        assert_eq!(cpu.state().s, 0xFA);
        assert_eq!({ cpu.state().pc }, 0x9100);
    }
}
