// Immediate backend: per-frame state setting over glow.

pub mod buffer;
pub mod core;
pub mod shader;
pub mod vertex_array;

pub use self::core::ImmediateCore;
