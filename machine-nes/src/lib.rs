//! Nintendo Entertainment System machine emulation.
//!
//! This crate wires the 6502 core material into a NES: iNES cartridge
//! loading with NROM/MMC1 mappers, the CPU-side memory decoder, PPU memory
//! and scan-line renderer, gamepads, and the frame [`Runner`].
//!
//! Its centrepiece is the [`Cpu`] facade over three interchangeable
//! execution cores sharing one register/flag/memory contract:
//!
//! - `interpret` -- the reference interpreter,
//! - `lua` -- a transpiler emitting Lua source, compiled once per function,
//! - `amd64` (alias `dynarec`) -- a dynamic recompiler emitting x86-64
//!   machine code into executable memory (x86-64 hosts only).
//!
//! The core is selected by a configuration string; see [`CoreKind`].

mod cartridge;
mod config;
mod controller;
mod cpu;
mod lua;
mod memory;
mod ppu;
mod runner;

#[cfg(target_arch = "x86_64")]
mod dynarec;

pub use cartridge::{create_mapper, InesFile, Mapper, Mirroring, MapperHandle};
pub use config::Configuration;
pub use controller::Gamepad;
pub use cpu::{CoreKind, Cpu};
pub use memory::{CpuBus, CpuMemory};
pub use ppu::{FrameSink, PpuMemory, Renderer, ScanLine, DISPLAY_HEIGHT, DISPLAY_WIDTH};
pub use runner::Runner;
