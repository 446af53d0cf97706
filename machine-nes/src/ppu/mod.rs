//! Picture processing unit: register file, VRAM and the scan-line renderer.

mod memory;
mod renderer;

pub use memory::PpuMemory;
pub use renderer::{FrameSink, Renderer, ScanLine, DISPLAY_HEIGHT, DISPLAY_WIDTH};
