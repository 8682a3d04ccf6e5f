// GLSL program wrapper with name-addressed uniform and attribute lookup.

use anyhow::{Context, Result};
use glow::HasContext;
use std::collections::HashMap;
use std::sync::Arc;

/// Memoizes name-to-location lookups. Lookups that miss are cached too,
/// so a typo'd uniform name costs one driver query, not one per frame.
pub struct LocationCache<T: Clone> {
    map: HashMap<String, Option<T>>,
}

impl<T: Clone> LocationCache<T> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn get_or_insert_with(
        &mut self,
        name: &str,
        lookup: impl FnOnce(&str) -> Option<T>,
    ) -> Option<T> {
        if let Some(cached) = self.map.get(name) {
            return cached.clone();
        }
        let location = lookup(name);
        self.map.insert(name.to_owned(), location.clone());
        location
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

impl<T: Clone> Default for LocationCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct GlShader {
    gl: Arc<glow::Context>,
    program: glow::Program,
    uniforms: LocationCache<glow::UniformLocation>,
    attributes: LocationCache<u32>,
}

impl GlShader {
    pub fn from_source(
        gl: &Arc<glow::Context>,
        vertex_source: &str,
        fragment_source: &str,
    ) -> Result<Self> {
        let vertex = compile_stage(gl, glow::VERTEX_SHADER, "vertex", vertex_source)?;
        let fragment = match compile_stage(gl, glow::FRAGMENT_SHADER, "fragment", fragment_source)
        {
            Ok(fragment) => fragment,
            Err(e) => {
                // The vertex stage object has no owner yet; release it here.
                unsafe { gl.delete_shader(vertex) };
                return Err(e);
            }
        };

        let program = unsafe {
            let program = match gl.create_program() {
                Ok(program) => program,
                Err(e) => {
                    gl.delete_shader(vertex);
                    gl.delete_shader(fragment);
                    return Err(anyhow::Error::msg(e))
                        .context("Failed to create shader program");
                }
            };
            gl.attach_shader(program, vertex);
            gl.attach_shader(program, fragment);
            gl.link_program(program);

            // Stage objects are no longer needed once linked.
            gl.detach_shader(program, vertex);
            gl.detach_shader(program, fragment);
            gl.delete_shader(vertex);
            gl.delete_shader(fragment);

            if !gl.get_program_link_status(program) {
                let info = gl.get_program_info_log(program);
                gl.delete_program(program);
                anyhow::bail!("Failed to link shader program: {info}");
            }
            program
        };

        Ok(Self {
            gl: Arc::clone(gl),
            program,
            uniforms: LocationCache::new(),
            attributes: LocationCache::new(),
        })
    }

    pub fn bind(&self) {
        unsafe { self.gl.use_program(Some(self.program)) };
    }

    pub fn attribute_location(&mut self, name: &str) -> Option<u32> {
        let gl = &self.gl;
        let program = self.program;
        self.attributes
            .get_or_insert_with(name, |name| unsafe { gl.get_attrib_location(program, name) })
    }

    fn uniform_location(&mut self, name: &str) -> Option<glow::UniformLocation> {
        let gl = &self.gl;
        let program = self.program;
        let location = self.uniforms.get_or_insert_with(name, |name| unsafe {
            gl.get_uniform_location(program, name)
        });
        if location.is_none() {
            log::warn!("Uniform not found in program: {name}");
        }
        location
    }

    pub fn set_mat4(&mut self, name: &str, value: &glam::Mat4) {
        if let Some(location) = self.uniform_location(name) {
            unsafe {
                self.gl.uniform_matrix_4_f32_slice(
                    Some(&location),
                    false,
                    &value.to_cols_array(),
                );
            }
        }
    }

    pub fn set_vec4(&mut self, name: &str, value: glam::Vec4) {
        if let Some(location) = self.uniform_location(name) {
            unsafe {
                self.gl
                    .uniform_4_f32(Some(&location), value.x, value.y, value.z, value.w);
            }
        }
    }

    pub fn set_vec2(&mut self, name: &str, value: glam::Vec2) {
        if let Some(location) = self.uniform_location(name) {
            unsafe { self.gl.uniform_2_f32(Some(&location), value.x, value.y) };
        }
    }

    pub fn set_f32(&mut self, name: &str, value: f32) {
        if let Some(location) = self.uniform_location(name) {
            unsafe { self.gl.uniform_1_f32(Some(&location), value) };
        }
    }
}

impl Drop for GlShader {
    fn drop(&mut self) {
        unsafe { self.gl.delete_program(self.program) };
    }
}

fn compile_stage(
    gl: &glow::Context,
    stage: u32,
    stage_name: &str,
    source: &str,
) -> Result<glow::Shader> {
    unsafe {
        let shader = gl
            .create_shader(stage)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Failed to create {stage_name} shader"))?;
        gl.shader_source(shader, source);
        gl.compile_shader(shader);

        if !gl.get_shader_compile_status(shader) {
            let info = gl.get_shader_info_log(shader);
            gl.delete_shader(shader);
            anyhow::bail!("Failed to compile {stage_name} shader: {info}");
        }
        Ok(shader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn cache_stores_hits_and_misses() {
        let mut cache: LocationCache<u32> = LocationCache::new();
        let lookups = Cell::new(0);

        let mut lookup = |name: &str| {
            lookups.set(lookups.get() + 1);
            if name == "u_transform" {
                Some(3)
            } else {
                None
            }
        };

        assert_eq!(cache.get_or_insert_with("u_transform", &mut lookup), Some(3));
        assert_eq!(cache.get_or_insert_with("u_transform", &mut lookup), Some(3));
        assert_eq!(cache.get_or_insert_with("u_missing", &mut lookup), None);
        assert_eq!(cache.get_or_insert_with("u_missing", &mut lookup), None);

        // One driver roundtrip per distinct name, hit or miss.
        assert_eq!(lookups.get(), 2);
        assert_eq!(cache.len(), 2);
    }
}
