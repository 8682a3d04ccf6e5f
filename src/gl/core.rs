// Immediate-backend core over glow. State is set every frame rather than
// baked into objects, so there is no swapchain lifecycle to manage; the
// windowing layer's swap callback is the whole presentation step.

use anyhow::{Context, Result};
use glow::HasContext;
use std::sync::Arc;

use crate::core::{DrawUniforms, Vertex2D};
use crate::gl::shader::GlShader;
use crate::gl::vertex_array::VertexArray;

pub struct ImmediateCore {
    gl: Arc<glow::Context>,
    swap: Box<dyn FnMut() -> Result<()>>,
    shader: Option<GlShader>,
    mesh: Option<VertexArray>,
    uniforms: DrawUniforms,
    clear_color: [f32; 4],
}

impl ImmediateCore {
    /// Builds a core over an already-current GL context. `loader` resolves
    /// GL symbols and `swap` presents the window's back buffer.
    pub fn new(
        loader: impl FnMut(&str) -> *const std::ffi::c_void,
        swap: Box<dyn FnMut() -> Result<()>>,
        width: u32,
        height: u32,
        clear_color: [f32; 4],
    ) -> Result<Self> {
        let mut loader = loader;
        let gl = unsafe { glow::Context::from_loader_function(|s| loader(s)) };

        let version = gl.version();
        log::info!(
            "Created GL context: {}.{}{}",
            version.major,
            version.minor,
            if version.is_embedded { " ES" } else { "" }
        );

        unsafe {
            gl.viewport(0, 0, width as i32, height as i32);
            gl.enable(glow::BLEND);
            gl.blend_func(glow::SRC_ALPHA, glow::ONE_MINUS_SRC_ALPHA);
        }

        Ok(Self {
            gl: Arc::new(gl),
            swap,
            shader: None,
            mesh: None,
            uniforms: DrawUniforms::default(),
            clear_color,
        })
    }

    pub fn create_pipeline(&mut self, vertex_path: &str, fragment_path: &str) -> Result<()> {
        let vertex_source = std::fs::read_to_string(vertex_path)
            .with_context(|| format!("Failed to read vertex shader: {vertex_path}"))?;
        let fragment_source = std::fs::read_to_string(fragment_path)
            .with_context(|| format!("Failed to read fragment shader: {fragment_path}"))?;

        let shader = GlShader::from_source(&self.gl, &vertex_source, &fragment_source)?;
        self.shader = Some(shader);
        self.rewire_mesh()
    }

    pub fn upload_mesh(&mut self, vertices: &[Vertex2D], indices: &[u32]) -> Result<()> {
        self.mesh = Some(VertexArray::new(&self.gl, vertices, indices)?);
        self.rewire_mesh()
    }

    // Attribute locations belong to the program, so the mesh is rewired
    // whenever either side changes.
    fn rewire_mesh(&mut self) -> Result<()> {
        let (Some(shader), Some(mesh)) = (self.shader.as_mut(), self.mesh.as_ref()) else {
            return Ok(());
        };
        let position = shader
            .attribute_location("a_position")
            .context("Vertex shader has no a_position attribute")?;
        let color = shader
            .attribute_location("a_color")
            .context("Vertex shader has no a_color attribute")?;
        mesh.enable_attributes(position, color);
        Ok(())
    }

    pub fn set_uniforms(&mut self, uniforms: DrawUniforms) {
        self.uniforms = uniforms;
    }

    pub fn framebuffer_resized(&mut self, width: u32, height: u32) {
        unsafe { self.gl.viewport(0, 0, width as i32, height as i32) };
    }

    /// Clears, draws the mesh if one is uploaded, and swaps.
    pub fn swap_buffers(&mut self) -> Result<()> {
        unsafe {
            let [r, g, b, a] = self.clear_color;
            self.gl.clear_color(r, g, b, a);
            self.gl.clear(glow::COLOR_BUFFER_BIT);
        }

        if let (Some(shader), Some(mesh)) = (self.shader.as_mut(), self.mesh.as_ref()) {
            shader.bind();
            shader.set_mat4("u_transform", &self.uniforms.transform);
            shader.set_vec4("u_color", self.uniforms.color);
            mesh.draw();
        }

        (self.swap)()
    }
}
