// SPIR-V shader modules, loaded from precompiled .spv files.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CString;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use crate::ownership::ChildResource;
use crate::vulkan::device::VulkanDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

pub struct Shader {
    module: vk::ShaderModule,
    stage: ShaderStage,
    entry_point: CString,
    _child: ChildResource<VulkanDevice>,
}

impl Shader {
    /// Loads a SPIR-V binary from disk and wraps it in a shader module.
    pub fn from_file(
        device: &Arc<VulkanDevice>,
        path: impl AsRef<Path>,
        stage: ShaderStage,
    ) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {:?} shader: {:?}", stage, path))?;
        let code = ash::util::read_spv(&mut Cursor::new(&bytes))
            .with_context(|| format!("Invalid SPIR-V in {:?} shader: {:?}", stage, path))?;

        Self::from_spirv(device, &code, stage)
    }

    pub fn from_spirv(
        device: &Arc<VulkanDevice>,
        code: &[u32],
        stage: ShaderStage,
    ) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .with_context(|| format!("Failed to create {:?} shader module", stage))?;

        let child = {
            let raw_device = device.device.clone();
            device.children.register(move || unsafe {
                raw_device.destroy_shader_module(module, None);
            })
        };

        // CString::new never fails on a literal without interior NULs.
        let entry_point = CString::new("main").unwrap_or_default();

        Ok(Self {
            module,
            stage,
            entry_point,
            _child: child,
        })
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// Stage description for pipeline creation. Valid while `self` lives,
    /// since the entry point name is borrowed from it.
    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(self.stage.to_vk())
            .module(self.module)
            .name(&self.entry_point)
            .build()
    }
}
