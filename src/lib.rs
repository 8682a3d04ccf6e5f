// 2D rendering engine with swappable backends.
//
// `core::RenderCore` is the public entry point; `vulkan` and `gl` hold
// the explicit and immediate backends behind it, and `ownership` is the
// parent/child registry both lean on for teardown ordering.

pub mod config;
pub mod core;
pub mod gl;
pub mod ownership;
pub mod vulkan;

pub use crate::core::{BackendKind, DrawUniforms, RenderCore, Vertex2D};
pub use ownership::{ChildResource, ParentResource};
