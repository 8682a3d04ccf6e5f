// Per-frame synchronization primitives.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use crate::ownership::ChildResource;
use crate::vulkan::device::VulkanDevice;

/// Semaphores and fence serializing one frame in flight.
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    _child: ChildResource<VulkanDevice>,
}

impl FrameSync {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Signaled so the first frame's fence wait returns immediately.
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let (image_available, render_finished, in_flight_fence) = unsafe {
            (
                device
                    .device
                    .create_semaphore(&semaphore_info, None)
                    .context("Failed to create image-available semaphore")?,
                device
                    .device
                    .create_semaphore(&semaphore_info, None)
                    .context("Failed to create render-finished semaphore")?,
                device
                    .device
                    .create_fence(&fence_info, None)
                    .context("Failed to create in-flight fence")?,
            )
        };

        let child = {
            let raw_device = device.device.clone();
            device.children.register(move || unsafe {
                raw_device.destroy_semaphore(image_available, None);
                raw_device.destroy_semaphore(render_finished, None);
                raw_device.destroy_fence(in_flight_fence, None);
            })
        };

        Ok(Self {
            image_available,
            render_finished,
            in_flight_fence,
            _child: child,
        })
    }
}
