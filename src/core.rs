// Rendering core façade. Callers talk to `RenderCore` and never learn
// which backend is underneath; the backend is picked once at setup and
// every later call dispatches over the sum type.

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec4};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::path::Path;

use crate::config::Config;
use crate::gl::ImmediateCore;
use crate::vulkan::VulkanCore;

/// One 2D vertex as both backends consume it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex2D {
    pub position: Vec2,
    pub color: Vec4,
}

/// Per-draw uniform block, push constants on the explicit backend and
/// named uniforms on the immediate one.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DrawUniforms {
    pub transform: Mat4,
    pub color: Vec4,
}

impl Default for DrawUniforms {
    fn default() -> Self {
        Self {
            transform: Mat4::IDENTITY,
            color: Vec4::ONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Vulkan: explicit resource and lifecycle management.
    Explicit,
    /// OpenGL: immediate per-frame state setting.
    Immediate,
}

impl BackendKind {
    /// Resolves a configured backend name. `auto` prefers the explicit
    /// backend when a Vulkan loader is present on the system.
    pub fn from_config(name: &str) -> Result<Self> {
        match name {
            "vulkan" => Ok(BackendKind::Explicit),
            "opengl" => Ok(BackendKind::Immediate),
            "auto" => {
                if unsafe { ash::Entry::load() }.is_ok() {
                    log::info!("Backend auto-selection: Vulkan loader found");
                    Ok(BackendKind::Explicit)
                } else {
                    log::info!("Backend auto-selection: no Vulkan loader, using OpenGL");
                    Ok(BackendKind::Immediate)
                }
            }
            other => anyhow::bail!("Unknown backend: {other:?} (expected vulkan, opengl or auto)"),
        }
    }
}

pub enum Backend {
    Explicit(Box<VulkanCore>),
    Immediate(Box<ImmediateCore>),
    #[cfg(test)]
    Null(NullBackend),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Explicit(_) => BackendKind::Explicit,
            Backend::Immediate(_) => BackendKind::Immediate,
            #[cfg(test)]
            Backend::Null(_) => BackendKind::Immediate,
        }
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct NullBackend {
    pub swaps: u32,
}

/// The façade. Starts empty; `setup_*` installs a backend exactly once,
/// and `shutdown` (or drop) drains and releases it.
#[derive(Default)]
pub struct RenderCore {
    backend: Option<Backend>,
}

impl RenderCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(Backend::kind)
    }

    /// Installs a backend. Calling this while a backend is live is a
    /// programming error; the installed backend is left untouched.
    pub fn setup_core(&mut self, backend: Backend) -> Result<()> {
        if self.backend.is_some() {
            log::error!("Rendering core set up twice without a shutdown in between");
            anyhow::bail!("Rendering core is already set up");
        }
        log::info!("Rendering core ready: {:?} backend", backend.kind());
        self.backend = Some(backend);
        Ok(())
    }

    /// Sets up the explicit backend against a native window.
    pub fn setup_explicit(
        &mut self,
        display: RawDisplayHandle,
        window: RawWindowHandle,
        width: u32,
        height: u32,
        config: &Config,
    ) -> Result<()> {
        let core = VulkanCore::new(display, window, width, height, config)?;
        self.setup_core(Backend::Explicit(Box::new(core)))
    }

    /// Sets up the immediate backend over an already-current GL context.
    pub fn setup_immediate(
        &mut self,
        loader: impl FnMut(&str) -> *const std::ffi::c_void,
        swap: Box<dyn FnMut() -> Result<()>>,
        width: u32,
        height: u32,
        config: &Config,
    ) -> Result<()> {
        let core = ImmediateCore::new(loader, swap, width, height, config.graphics.clear_color)?;
        self.setup_core(Backend::Immediate(Box::new(core)))
    }

    fn backend_mut(&mut self) -> Result<&mut Backend> {
        self.backend
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Rendering core is not set up"))
    }

    pub fn create_pipeline(&mut self, vertex: &Path, fragment: &Path) -> Result<()> {
        match self.backend_mut()? {
            Backend::Explicit(core) => core.create_pipeline(vertex, fragment),
            Backend::Immediate(core) => core.create_pipeline(
                &vertex.to_string_lossy(),
                &fragment.to_string_lossy(),
            ),
            #[cfg(test)]
            Backend::Null(_) => Ok(()),
        }
    }

    pub fn upload_mesh(&mut self, vertices: &[Vertex2D], indices: &[u32]) -> Result<()> {
        match self.backend_mut()? {
            Backend::Explicit(core) => core.upload_mesh(vertices, indices),
            Backend::Immediate(core) => core.upload_mesh(vertices, indices),
            #[cfg(test)]
            Backend::Null(_) => Ok(()),
        }
    }

    pub fn set_uniforms(&mut self, uniforms: DrawUniforms) -> Result<()> {
        match self.backend_mut()? {
            Backend::Explicit(core) => {
                core.set_uniforms(uniforms);
                Ok(())
            }
            Backend::Immediate(core) => {
                core.set_uniforms(uniforms);
                Ok(())
            }
            #[cfg(test)]
            Backend::Null(_) => Ok(()),
        }
    }

    pub fn framebuffer_resized(&mut self, width: u32, height: u32) -> Result<()> {
        match self.backend_mut()? {
            Backend::Explicit(core) => {
                core.framebuffer_resized(width, height);
                Ok(())
            }
            Backend::Immediate(core) => {
                core.framebuffer_resized(width, height);
                Ok(())
            }
            #[cfg(test)]
            Backend::Null(_) => Ok(()),
        }
    }

    /// Presents one frame.
    pub fn swap_buffers(&mut self) -> Result<()> {
        match self.backend_mut()? {
            Backend::Explicit(core) => core.swap_buffers(),
            Backend::Immediate(core) => core.swap_buffers(),
            #[cfg(test)]
            Backend::Null(null) => {
                null.swaps += 1;
                Ok(())
            }
        }
    }

    /// Releases the backend. In-flight GPU work is drained as part of the
    /// backend's own teardown, so this is safe at any point.
    pub fn shutdown(&mut self) {
        if self.backend.take().is_some() {
            log::info!("Rendering core shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_without_a_backend() {
        let mut core = RenderCore::new();
        assert!(!core.is_ready());
        assert!(core.backend_kind().is_none());
        assert!(core.swap_buffers().is_err());
    }

    #[test]
    fn double_setup_is_an_error_not_a_crash() {
        let mut core = RenderCore::new();
        core.setup_core(Backend::Null(NullBackend::default())).unwrap();

        let err = core
            .setup_core(Backend::Null(NullBackend::default()))
            .unwrap_err();
        assert!(err.to_string().contains("already set up"));

        // The original backend is untouched.
        assert!(core.is_ready());
        core.swap_buffers().unwrap();
    }

    #[test]
    fn shutdown_allows_a_fresh_setup() {
        let mut core = RenderCore::new();
        core.setup_core(Backend::Null(NullBackend::default())).unwrap();
        core.shutdown();
        assert!(!core.is_ready());
        core.setup_core(Backend::Null(NullBackend::default())).unwrap();
        assert!(core.is_ready());
    }

    #[test]
    fn backend_names_resolve() {
        assert_eq!(
            BackendKind::from_config("vulkan").unwrap(),
            BackendKind::Explicit
        );
        assert_eq!(
            BackendKind::from_config("opengl").unwrap(),
            BackendKind::Immediate
        );
        assert!(BackendKind::from_config("metal").is_err());
    }

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex2D>(), 24);
        assert_eq!(std::mem::offset_of!(Vertex2D, position), 0);
        assert_eq!(std::mem::offset_of!(Vertex2D, color), 8);
        // Push-constant block: one mat4 and one vec4.
        assert_eq!(std::mem::size_of::<DrawUniforms>(), 80);
    }
}
