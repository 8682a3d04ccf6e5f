// Device memory allocations
//
// One DeviceMemory is one vkAllocateMemory, exclusively owned by whichever
// buffer or image requested it. It registers as a child of the device so the
// allocation can never outlive the logical device it came from.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use crate::ownership::ChildResource;
use crate::vulkan::device::VulkanDevice;

pub struct DeviceMemory {
    memory: vk::DeviceMemory,
    _child: ChildResource<VulkanDevice>,
}

impl DeviceMemory {
    /// Allocates memory satisfying the requirements with the requested
    /// property flags.
    pub fn new(
        device: &Arc<VulkanDevice>,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let memory_type_index =
            device.find_memory_type(requirements.memory_type_bits, properties)?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe { device.device.allocate_memory(&alloc_info, None) }
            .context("Failed to allocate device memory")?;

        let raw_device = device.device.clone();
        let child = device.children.register(move || unsafe {
            raw_device.free_memory(memory, None);
        });

        Ok(Self {
            memory,
            _child: child,
        })
    }

    pub fn handle(&self) -> vk::DeviceMemory {
        self.memory
    }
}
