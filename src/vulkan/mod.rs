// Explicit backend: device ownership, swapchain lifecycle and command
// recording over ash.

pub mod buffer;
pub mod core;
pub mod device;
pub mod memory;
pub mod pipeline;
pub mod queues;
pub mod shader;
pub mod support;
pub mod swapchain;
pub mod sync;

pub use self::core::VulkanCore;
pub use device::VulkanDevice;
pub use swapchain::{PresentOutcome, SwapchainState};
