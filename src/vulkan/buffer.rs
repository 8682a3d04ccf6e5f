// Host-visible vertex and index buffers for 2D meshes.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use crate::core::Vertex2D;
use crate::ownership::ChildResource;
use crate::vulkan::device::VulkanDevice;
use crate::vulkan::memory::DeviceMemory;

/// A vertex buffer and an index buffer backed by host-visible memory.
///
/// Host-visible coherent memory keeps uploads to a single memcpy, which
/// is the right trade for small 2D meshes that change rarely.
pub struct MeshBuffer {
    vertex_buffer: vk::Buffer,
    index_buffer: vk::Buffer,
    index_count: u32,
    // Memory is registered before each buffer's teardown hook and declared
    // after it, so both the cascade and plain drops destroy the buffer
    // before freeing its memory.
    _vertex_child: ChildResource<VulkanDevice>,
    _vertex_memory: DeviceMemory,
    _index_child: ChildResource<VulkanDevice>,
    _index_memory: DeviceMemory,
}

impl MeshBuffer {
    pub fn new(
        device: &Arc<VulkanDevice>,
        vertices: &[Vertex2D],
        indices: &[u32],
    ) -> Result<Self> {
        anyhow::ensure!(!vertices.is_empty(), "Mesh has no vertices");
        anyhow::ensure!(!indices.is_empty(), "Mesh has no indices");

        let (vertex_buffer, vertex_memory, vertex_child) = create_buffer_with_data(
            device,
            bytemuck::cast_slice(vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )
        .context("Failed to create vertex buffer")?;

        let (index_buffer, index_memory, index_child) = create_buffer_with_data(
            device,
            bytemuck::cast_slice(indices),
            vk::BufferUsageFlags::INDEX_BUFFER,
        )
        .context("Failed to create index buffer")?;

        log::debug!(
            "Uploaded mesh: {} vertices, {} indices",
            vertices.len(),
            indices.len()
        );

        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
            _vertex_memory: vertex_memory,
            _vertex_child: vertex_child,
            _index_memory: index_memory,
            _index_child: index_child,
        })
    }

    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.vertex_buffer
    }

    pub fn index_buffer(&self) -> vk::Buffer {
        self.index_buffer
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}

/// Creates a buffer, backs it with freshly allocated host-visible memory
/// and copies `data` into it.
fn create_buffer_with_data(
    device: &Arc<VulkanDevice>,
    data: &[u8],
    usage: vk::BufferUsageFlags,
) -> Result<(vk::Buffer, DeviceMemory, ChildResource<VulkanDevice>)> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(data.len() as vk::DeviceSize)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
        .context("Failed to create buffer")?;

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

    let memory = DeviceMemory::new(
        device,
        requirements,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )
    .context("Failed to allocate buffer memory")?;

    unsafe {
        device
            .device
            .bind_buffer_memory(buffer, memory.handle(), 0)
            .context("Failed to bind buffer memory")?;

        let mapped = device
            .device
            .map_memory(
                memory.handle(),
                0,
                data.len() as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )
            .context("Failed to map buffer memory")?;
        std::ptr::copy_nonoverlapping(data.as_ptr(), mapped as *mut u8, data.len());
        device.device.unmap_memory(memory.handle());
    }

    let child = {
        let raw_device = device.device.clone();
        device.children.register(move || unsafe {
            raw_device.destroy_buffer(buffer, None);
        })
    };

    Ok((buffer, memory, child))
}
