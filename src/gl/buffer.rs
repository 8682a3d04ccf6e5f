// Typed wrapper over a GL buffer object.

use anyhow::{Context, Result};
use bytemuck::Pod;
use glow::HasContext;
use std::marker::PhantomData;
use std::sync::Arc;

pub struct Buffer<T: Pod> {
    gl: Arc<glow::Context>,
    buffer: glow::Buffer,
    target: u32,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> Buffer<T> {
    /// Creates a buffer bound to `target` (for example `glow::ARRAY_BUFFER`)
    /// and uploads `data` with the given usage hint.
    pub fn with_data(
        gl: &Arc<glow::Context>,
        target: u32,
        data: &[T],
        usage: u32,
    ) -> Result<Self> {
        let buffer = unsafe {
            let buffer = gl
                .create_buffer()
                .map_err(anyhow::Error::msg)
                .context("Failed to create buffer")?;
            gl.bind_buffer(target, Some(buffer));
            gl.buffer_data_u8_slice(target, bytemuck::cast_slice(data), usage);
            buffer
        };

        Ok(Self {
            gl: Arc::clone(gl),
            buffer,
            target,
            len: data.len(),
            _marker: PhantomData,
        })
    }

    /// Replaces the contents in place. Matching lengths reuse the existing
    /// storage; a different length reallocates.
    pub fn update(&mut self, data: &[T]) {
        unsafe {
            self.gl.bind_buffer(self.target, Some(self.buffer));
            if data.len() == self.len {
                self.gl
                    .buffer_sub_data_u8_slice(self.target, 0, bytemuck::cast_slice(data));
            } else {
                self.gl.buffer_data_u8_slice(
                    self.target,
                    bytemuck::cast_slice(data),
                    glow::DYNAMIC_DRAW,
                );
                self.len = data.len();
            }
        }
    }

    pub fn bind(&self) {
        unsafe { self.gl.bind_buffer(self.target, Some(self.buffer)) };
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl<T: Pod> Drop for Buffer<T> {
    fn drop(&mut self) {
        unsafe { self.gl.delete_buffer(self.buffer) };
    }
}
