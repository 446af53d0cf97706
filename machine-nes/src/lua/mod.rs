//! The Lua transpiler core.

mod codegen;
mod core;

pub use codegen::translate;
pub use self::core::LuaCore;
