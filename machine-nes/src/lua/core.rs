//! Execution core backed by the Lua transpiler.

use std::rc::Rc;

use mlua::{Function as LuaChunk, Lua, RegistryKey};

use cpu_6502::{CpuState, ExitReason, Fetched, Repository};

use crate::lua::codegen;
use crate::memory::CpuBus;

/// A compiled guest function: a Lua function held in the registry.
/// Dropping it releases the registry slot.
pub struct LuaFunction {
    key: RegistryKey,
}

/// The Lua transpiler core.
///
/// Each recovered guest function is translated to Lua source once, compiled
/// by the interpreter and kept in the registry; dispatching a function is a
/// single Lua call passing the register file in and out.
pub struct LuaCore {
    lua: Rc<Lua>,
    repository: Repository<LuaFunction>,
    bus: CpuBus,
}

impl LuaCore {
    pub fn new(bus: CpuBus) -> Result<Self, String> {
        let lua = Rc::new(Lua::new());
        let globals = lua.globals();

        // The guest's memory accessors, closing over the shared bus.
        let read_bus = bus.clone();
        let read = lua
            .create_function(move |_, address: u16| Ok(read_bus.memory().read(address)))
            .map_err(|error| error.to_string())?;
        globals.set("read", read).map_err(|error| error.to_string())?;

        let read16_bus = bus.clone();
        let read16 = lua
            .create_function(move |_, address: u16| Ok(read16_bus.memory().read16(address)))
            .map_err(|error| error.to_string())?;
        globals.set("read16", read16).map_err(|error| error.to_string())?;

        let write_bus = bus.clone();
        let write = lua
            .create_function(move |_, (address, value): (u16, u8)| {
                write_bus.memory().write(address, value);
                Ok(())
            })
            .map_err(|error| error.to_string())?;
        globals.set("write", write).map_err(|error| error.to_string())?;

        let log = lua
            .create_function(|_, message: String| {
                eprintln!("{message}");
                Ok(())
            })
            .map_err(|error| error.to_string())?;
        globals.set("log", log).map_err(|error| error.to_string())?;

        drop(globals);

        Ok(Self { lua, repository: Repository::new(), bus })
    }

    /// Runs from `state.pc` until the compiled function exits.
    pub fn run_until_exit(&mut self, state: &mut CpuState) -> Result<(), String> {
        let Self { lua, repository, bus } = self;

        let fetched = repository.get(bus, { state.pc }, |function| {
            let code = codegen::translate(function);

            let chunk: LuaChunk = lua
                .load(&code)
                .set_name(function.native_name())
                .eval()
                .map_err(|error| format!("Lua compile error: {error}"))?;

            let key = lua
                .create_registry_value(chunk)
                .map_err(|error| format!("Lua registry error: {error}"))?;

            Ok(LuaFunction { key })
        })?;

        let chunk: LuaChunk = lua
            .registry_value(&fetched.key)
            .map_err(|error| format!("Lua registry error: {error}"))?;

        let (a, x, y, s, p, cycles, pc, reason): (u8, u8, u8, u8, u8, i32, u16, u8) = chunk
            .call((state.a, state.x, state.y, state.s, state.p, { state.cycles }))
            .map_err(|error| format!("Lua call error: {error}"))?;

        state.a = a;
        state.x = x;
        state.y = y;
        state.s = s;
        state.p = p;
        state.cycles = cycles;
        state.pc = pc;
        state.reason = ExitReason::from_u8(reason)
            .ok_or_else(|| format!("Lua function returned invalid exit reason {reason}"))?;

        // Non-cacheable functions die here; their registry slot goes with
        // them.
        if let Fetched::Transient(function) = fetched {
            drop(function);
        }

        Ok(())
    }

    /// Drops every compiled function.
    pub fn clear(&mut self) {
        self.repository.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::{create_mapper, InesFile, CHR_BANK_SIZE, PRG_BANK_SIZE};
    use crate::memory::CpuMemory;
    use crate::ppu::PpuMemory;
    use std::cell::RefCell;

    /// Builds a bus whose cartridge maps `program` at $8000.
    fn bus_with_program(program: &[u8]) -> CpuBus {
        let mut rom = vec![0u8; 16 + PRG_BANK_SIZE + CHR_BANK_SIZE];
        rom[0..4].copy_from_slice(b"NES\x1A");
        rom[4] = 1;
        rom[5] = 1;
        rom[16..16 + program.len()].copy_from_slice(program);

        let ines = InesFile::load(&rom).unwrap();
        let mapper = create_mapper(&ines).unwrap();
        let vram = Rc::new(RefCell::new(PpuMemory::new(Rc::clone(&mapper))));
        CpuBus::new(CpuMemory::new(vram, mapper))
    }

    fn fresh(pc: u16) -> CpuState {
        let mut state = CpuState::new();
        state.p = 0;
        state.s = 0xFD;
        state.pc = pc;
        state
    }

    #[test]
    fn adc_matches_the_reference_case() {
        // LDA #$3C / ADC #$5A / RTS (returns to garbage, but exits first).
        let bus = bus_with_program(&[0xA9, 0x3C, 0x69, 0x5A, 0x60]);
        let mut core = LuaCore::new(bus).unwrap();

        let mut state = fresh(0x8000);
        state.cycles = 100;
        core.run_until_exit(&mut state).unwrap();

        assert_eq!(state.a, 0x96);
        assert_eq!(state.reason, ExitReason::Return);
        assert!(state.flag(cpu_6502::FLAG_V));
        assert!(state.flag(cpu_6502::FLAG_N));
        assert!(!state.flag(cpu_6502::FLAG_C));
    }

    #[test]
    fn jmp_to_self_reports_infinite_loop() {
        let bus = bus_with_program(&[0x4C, 0x00, 0x80]);
        let mut core = LuaCore::new(bus).unwrap();

        let mut state = fresh(0x8000);
        state.cycles = 50;
        core.run_until_exit(&mut state).unwrap();

        assert_eq!(state.reason, ExitReason::InfiniteLoop);
        assert_eq!({ state.pc }, 0x8000);
    }

    #[test]
    fn memory_traffic_reaches_the_bus() {
        // LDA #$77 / STA $0200 / BRK
        let bus = bus_with_program(&[0xA9, 0x77, 0x8D, 0x00, 0x02, 0x00]);
        let mut core = LuaCore::new(bus.clone()).unwrap();

        let mut state = fresh(0x8000);
        state.cycles = 100;
        core.run_until_exit(&mut state).unwrap();

        assert_eq!(state.reason, ExitReason::Break);
        assert_eq!({ state.pc }, 0x8007);
        assert_eq!(bus.memory().read(0x0200), 0x77);
    }

    #[test]
    fn cycle_budget_stops_at_conditionals() {
        // LDA #$00 / BEQ +0 -> exits with CyclesExhausted at the branch.
        let bus = bus_with_program(&[0xA9, 0x00, 0xF0, 0x00, 0x60]);
        let mut core = LuaCore::new(bus).unwrap();

        let mut state = fresh(0x8000);
        state.cycles = 2;
        core.run_until_exit(&mut state).unwrap();

        assert_eq!(state.reason, ExitReason::CyclesExhausted);
        assert_eq!({ state.pc }, 0x8002);
        assert_eq!({ state.cycles }, 0);
    }

    #[test]
    fn functions_are_compiled_once() {
        let bus = bus_with_program(&[0x4C, 0x00, 0x80]);
        let mut core = LuaCore::new(bus).unwrap();

        let mut state = fresh(0x8000);
        state.cycles = 10;
        core.run_until_exit(&mut state).unwrap();
        let cached = core.repository.len();

        state.pc = 0x8000;
        core.run_until_exit(&mut state).unwrap();
        assert_eq!(core.repository.len(), cached);
    }
}
