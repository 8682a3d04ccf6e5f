// Vertex array object tying a 2D mesh's buffers to shader attributes.

use anyhow::{Context, Result};
use glow::HasContext;
use std::mem::{offset_of, size_of};
use std::sync::Arc;

use crate::core::Vertex2D;
use crate::gl::buffer::Buffer;

pub struct VertexArray {
    gl: Arc<glow::Context>,
    vao: glow::VertexArray,
    _vertices: Buffer<Vertex2D>,
    elements: Buffer<u32>,
}

impl VertexArray {
    pub fn new(
        gl: &Arc<glow::Context>,
        vertices: &[Vertex2D],
        indices: &[u32],
    ) -> Result<Self> {
        anyhow::ensure!(!vertices.is_empty(), "Mesh has no vertices");
        anyhow::ensure!(!indices.is_empty(), "Mesh has no indices");

        let vao = unsafe {
            let vao = gl
                .create_vertex_array()
                .map_err(anyhow::Error::msg)
                .context("Failed to create vertex array")?;
            gl.bind_vertex_array(Some(vao));
            vao
        };

        // Created while the VAO is bound so the element binding sticks to it.
        let vertex_buffer = Buffer::with_data(gl, glow::ARRAY_BUFFER, vertices, glow::STATIC_DRAW)?;
        let element_buffer =
            Buffer::with_data(gl, glow::ELEMENT_ARRAY_BUFFER, indices, glow::STATIC_DRAW)?;

        unsafe { gl.bind_vertex_array(None) };

        Ok(Self {
            gl: Arc::clone(gl),
            vao,
            _vertices: vertex_buffer,
            elements: element_buffer,
        })
    }

    /// Wires the position and color attributes at the given locations.
    pub fn enable_attributes(&self, position_location: u32, color_location: u32) {
        let stride = size_of::<Vertex2D>() as i32;
        unsafe {
            self.gl.bind_vertex_array(Some(self.vao));

            self.gl.enable_vertex_attrib_array(position_location);
            self.gl.vertex_attrib_pointer_f32(
                position_location,
                2,
                glow::FLOAT,
                false,
                stride,
                offset_of!(Vertex2D, position) as i32,
            );

            self.gl.enable_vertex_attrib_array(color_location);
            self.gl.vertex_attrib_pointer_f32(
                color_location,
                4,
                glow::FLOAT,
                false,
                stride,
                offset_of!(Vertex2D, color) as i32,
            );

            self.gl.bind_vertex_array(None);
        }
    }

    pub fn draw(&self) {
        unsafe {
            self.gl.bind_vertex_array(Some(self.vao));
            self.gl.draw_elements(
                glow::TRIANGLES,
                self.elements.len() as i32,
                glow::UNSIGNED_INT,
                0,
            );
            self.gl.bind_vertex_array(None);
        }
    }
}

impl Drop for VertexArray {
    fn drop(&mut self) {
        unsafe { self.gl.delete_vertex_array(self.vao) };
    }
}
