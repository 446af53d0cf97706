//! The recompiler core: symbols, bus helpers, trampoline, dispatch.

use std::cell::RefCell;
use std::rc::Rc;

use asm_amd64::{MemoryManager, SymbolRegistry};
use cpu_6502::{CpuState, Fetched, Repository, STACK_BASE};

use super::compile::{FunctionTranslator, NativeFunction};
use crate::memory::{CpuBus, CpuMemory};

// Bus helpers called from generated code. Plain C ABI; the generated
// caller keeps its guest state in callee-saved registers.

extern "C" fn mem_read(memory: *mut CpuMemory, address: u16) -> u8 {
    // SAFETY: generated code only runs while the bus it was linked against
    // is alive, and no Rust borrow of the memory is active during the call.
    unsafe { (*memory).read(address) }
}

extern "C" fn mem_read16(memory: *mut CpuMemory, address: u16) -> u16 {
    // SAFETY: see `mem_read`.
    unsafe { (*memory).read16(address) }
}

extern "C" fn mem_write(memory: *mut CpuMemory, address: u16, value: u8) {
    // SAFETY: see `mem_read`.
    unsafe { (*memory).write(address, value) }
}

// The guest-call trampoline. Generated functions don't use the host ABI;
// they expect (and return) the guest state in pinned registers:
//
//      A in BL, X in BH, Y in R12B, S in R13B, P in R14B, cycles in R15D;
//      on return additionally reason in AL and PC in CX.
//
// The trampoline loads those from the packed `CpuState` (offsets pinned by
// the assertions in cpu-6502), keeps the stack 16-byte aligned for the bus
// helpers the guest CALLs, and stores everything back afterwards. S and P
// are zero-extended because generated code indexes memory through their
// full host registers.
std::arch::global_asm!(
    ".text",
    ".balign 16",
    ".globl nes_dynarec_call_guest",
    "nes_dynarec_call_guest:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "push rsi",
    "sub rsp, 8",
    "movzx ebx, word ptr [rsi]",      // A | X << 8
    "movzx r12d, byte ptr [rsi + 2]", // Y
    "movzx r13d, byte ptr [rsi + 3]", // S
    "movzx r14d, byte ptr [rsi + 4]", // P
    "mov r15d, dword ptr [rsi + 5]",  // cycles
    "call rdi",
    "add rsp, 8",
    "pop rsi",
    "mov word ptr [rsi], bx",
    "mov byte ptr [rsi + 2], r12b",
    "mov byte ptr [rsi + 3], r13b",
    "mov byte ptr [rsi + 4], r14b",
    "mov dword ptr [rsi + 5], r15d",
    "mov word ptr [rsi + 9], cx",  // PC
    "mov byte ptr [rsi + 11], al", // reason
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

extern "C" {
    fn nes_dynarec_call_guest(entry: *const u8, state: *mut CpuState);
}

/// Enters generated code with `state`.
///
/// # Safety
///
/// `entry` must point at a function produced by [`FunctionTranslator`] whose
/// backing memory is still executable.
pub(super) unsafe fn call_guest(entry: *const u8, state: *mut CpuState) {
    nes_dynarec_call_guest(entry, state);
}

/// The native x86-64 recompiler core.
pub struct Amd64Core {
    repository: Repository<NativeFunction>,
    manager: Rc<RefCell<MemoryManager>>,
    symbols: SymbolRegistry,
    bus: CpuBus,
}

impl Amd64Core {
    pub fn new(bus: CpuBus) -> Self {
        let mut symbols = SymbolRegistry::new();

        let memory_ptr = bus.memory_ptr();
        // SAFETY: the pointer comes from the live bus; taking the RAM base
        // creates no lasting borrow.
        let ram = unsafe { (*memory_ptr).ram_ptr() };

        symbols.add_pointer("Memory", memory_ptr as *const ());
        symbols.add_pointer("Ram", ram as *const ());
        // SAFETY: the stack page lies within the RAM array.
        symbols.add_pointer("Stack", unsafe { ram.add(STACK_BASE as usize) } as *const ());
        symbols.add_pointer("read", mem_read as usize as *const ());
        symbols.add_pointer("read16", mem_read16 as usize as *const ());
        symbols.add_pointer("write", mem_write as usize as *const ());

        Self {
            repository: Repository::new(),
            manager: Rc::new(RefCell::new(MemoryManager::new())),
            symbols,
            bus,
        }
    }

    /// Runs from `state.pc` until the compiled function exits.
    pub fn run_until_exit(&mut self, state: &mut CpuState) -> Result<(), String> {
        let Self { repository, manager, symbols, bus } = self;

        let fetched = repository.get(bus, { state.pc }, |function| {
            let mut translator = FunctionTranslator::new();
            for branch in function.branches() {
                translator.add_branch(function, branch);
            }

            let entry = translator.link(function.entry(), symbols, &mut manager.borrow_mut())?;
            Ok(NativeFunction::new(entry, Rc::clone(manager)))
        })?;

        fetched.call(state);

        // A transient (non-cacheable) function frees its code right here.
        if let Fetched::Transient(function) = fetched {
            drop(function);
        }

        Ok(())
    }

    /// Drops every compiled function and its executable memory.
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
    use cpu_6502::ExitReason;

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
    fn immediate_load_and_break() {
        // LDA #$42 / BRK
        let bus = bus_with_program(&[0xA9, 0x42, 0x00]);
        let mut core = Amd64Core::new(bus);

        let mut state = fresh(0x8000);
        state.cycles = 100;
        core.run_until_exit(&mut state).unwrap();

        assert_eq!(state.a, 0x42);
        assert_eq!(state.reason, ExitReason::Break);
        assert_eq!({ state.pc }, 0x8004);
        assert_eq!({ state.cycles }, 100 - 2 - 7);
    }

    #[test]
    fn adc_matches_the_reference_case() {
        // LDA #$3C / ADC #$5A / BRK
        let bus = bus_with_program(&[0xA9, 0x3C, 0x69, 0x5A, 0x00]);
        let mut core = Amd64Core::new(bus);

        let mut state = fresh(0x8000);
        state.cycles = 100;
        core.run_until_exit(&mut state).unwrap();

        assert_eq!(state.a, 0x96);
        assert!(state.flag(cpu_6502::FLAG_V));
        assert!(state.flag(cpu_6502::FLAG_N));
        assert!(!state.flag(cpu_6502::FLAG_C));
        assert!(!state.flag(cpu_6502::FLAG_Z));
    }

    #[test]
    fn fast_path_store_hits_ram() {
        // LDA #$77 / STA $0200 / BRK
        let bus = bus_with_program(&[0xA9, 0x77, 0x8D, 0x00, 0x02, 0x00]);
        let mut core = Amd64Core::new(bus.clone());

        let mut state = fresh(0x8000);
        state.cycles = 100;
        core.run_until_exit(&mut state).unwrap();

        assert_eq!(bus.memory().read(0x0200), 0x77);
    }

    #[test]
    fn jmp_to_self_reports_infinite_loop() {
        let bus = bus_with_program(&[0x4C, 0x00, 0x80]);
        let mut core = Amd64Core::new(bus);

        let mut state = fresh(0x8000);
        state.cycles = 50;
        core.run_until_exit(&mut state).unwrap();

        assert_eq!(state.reason, ExitReason::InfiniteLoop);
        assert_eq!({ state.pc }, 0x8000);
    }

    #[test]
    fn conditional_branches_and_budget() {
        // LDX #$02 / loop: DEX / BNE loop / BRK
        let bus = bus_with_program(&[0xA2, 0x02, 0xCA, 0xD0, 0xFD, 0x00]);
        let mut core = Amd64Core::new(bus);

        let mut state = fresh(0x8000);
        state.cycles = 100;
        core.run_until_exit(&mut state).unwrap();

        assert_eq!(state.x, 0);
        assert_eq!(state.reason, ExitReason::Break);

        // Rerun with a budget that dies at the branch.
        let mut state = fresh(0x8000);
        state.cycles = 4; // LDX (2) + DEX (2), branch unaffordable.
        core.run_until_exit(&mut state).unwrap();

        assert_eq!(state.reason, ExitReason::CyclesExhausted);
        assert_eq!({ state.pc }, 0x8003); // At the BNE itself.
    }

    #[test]
    fn subroutine_call_and_return() {
        // JSR $8010 / BRK ... $8010: LDA #$11 / RTS
        let mut program = vec![0x20, 0x10, 0x80, 0x00];
        program.resize(0x10, 0xEA);
        program.extend_from_slice(&[0xA9, 0x11, 0x60]);
        let bus = bus_with_program(&program);
        let mut core = Amd64Core::new(bus);

        let mut state = fresh(0x8000);
        state.cycles = 100;
        core.run_until_exit(&mut state).unwrap();
        assert_eq!(state.reason, ExitReason::Jump);
        assert_eq!({ state.pc }, 0x8010);

        core.run_until_exit(&mut state).unwrap();
        assert_eq!(state.reason, ExitReason::Return);
        assert_eq!({ state.pc }, 0x8003); // Back past the JSR.
        assert_eq!(state.a, 0x11);
    }
}
