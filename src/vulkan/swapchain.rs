// Swapchain - presentable image chain and its recreation protocol
//
// The swapchain is a child of the device and itself a parent: per-image
// views and framebuffers live and die with it, and extent-dependent
// pipelines register in its registry so recreation can account for them.
//
// Recreation is driven by an explicit state machine rather than ad-hoc
// flags, so every transition can be exercised without real GPU timing.

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::ownership::{ChildResource, ParentResource};
use crate::vulkan::device::VulkanDevice;
use crate::vulkan::support::SurfaceSupport;

/// Lifecycle of one swapchain generation.
///
/// `Uninitialized -> Live(0) -> Invalidated -> Recreating -> Live(1) -> ...
/// -> Destroyed`. Invalid transitions are programming-contract violations
/// and are reported as errors instead of corrupting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    Live { generation: u64 },
    Invalidated { generation: u64 },
    Recreating { generation: u64 },
    Destroyed,
}

/// Result of an acquire or present call, normalized across the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Frame presented, swapchain still matches the surface.
    Presented,
    /// Frame presented but the surface has drifted; recreate soon.
    Suboptimal,
    /// Swapchain no longer matches the surface; recreate before presenting.
    OutOfDate,
    /// The surface itself is gone. Not recoverable.
    SurfaceLost,
}

impl SwapchainState {
    pub fn initialize(&mut self) -> Result<()> {
        match *self {
            SwapchainState::Uninitialized => {
                *self = SwapchainState::Live { generation: 0 };
                Ok(())
            }
            state => Err(contract_violation("initialize", state)),
        }
    }

    /// Folds a present/acquire outcome into the state. Surface loss is
    /// fatal and surfaces as an error.
    pub fn note_outcome(&mut self, outcome: PresentOutcome) -> Result<()> {
        match outcome {
            PresentOutcome::Presented => Ok(()),
            PresentOutcome::Suboptimal | PresentOutcome::OutOfDate => self.invalidate(),
            PresentOutcome::SurfaceLost => {
                anyhow::bail!("Surface lost; cannot present")
            }
        }
    }

    /// Marks the current generation stale (resize notification or an
    /// out-of-date signal). Idempotent while already invalidated.
    pub fn invalidate(&mut self) -> Result<()> {
        match *self {
            SwapchainState::Live { generation } => {
                *self = SwapchainState::Invalidated { generation };
                Ok(())
            }
            SwapchainState::Invalidated { .. } => Ok(()),
            state => Err(contract_violation("invalidate", state)),
        }
    }

    pub fn begin_recreation(&mut self) -> Result<u64> {
        match *self {
            SwapchainState::Invalidated { generation } => {
                *self = SwapchainState::Recreating { generation };
                Ok(generation)
            }
            state => Err(contract_violation("begin_recreation", state)),
        }
    }

    /// Completes recreation; the new generation is live.
    pub fn finish_recreation(&mut self) -> Result<u64> {
        match *self {
            SwapchainState::Recreating { generation } => {
                let next = generation + 1;
                *self = SwapchainState::Live { generation: next };
                Ok(next)
            }
            state => Err(contract_violation("finish_recreation", state)),
        }
    }

    /// Terminal. Valid from any state so teardown paths never fail.
    pub fn destroy(&mut self) {
        *self = SwapchainState::Destroyed;
    }

    pub fn is_live(&self) -> bool {
        matches!(self, SwapchainState::Live { .. })
    }

    pub fn needs_recreation(&self) -> bool {
        matches!(self, SwapchainState::Invalidated { .. })
    }

    pub fn generation(&self) -> Option<u64> {
        match *self {
            SwapchainState::Live { generation }
            | SwapchainState::Invalidated { generation }
            | SwapchainState::Recreating { generation } => Some(generation),
            _ => None,
        }
    }
}

fn contract_violation(operation: &str, state: SwapchainState) -> anyhow::Error {
    log::error!("Invalid swapchain transition: {} in state {:?}", operation, state);
    anyhow::anyhow!("Invalid swapchain transition: {} in state {:?}", operation, state)
}

/// Native handles for one generation, destroyed together exactly once.
struct SwapchainHandles {
    swapchain: vk::SwapchainKHR,
    image_views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
}

pub struct Swapchain {
    // Declared before `_child` so pipeline children cascade before the
    // native handles are released.
    pub children: ParentResource<Swapchain>,

    loader: ash::extensions::khr::Swapchain,
    handles: Arc<Mutex<Option<SwapchainHandles>>>,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,

    device: Arc<VulkanDevice>,
    _child: ChildResource<VulkanDevice>,
}

impl Swapchain {
    /// Builds a swapchain for the current surface state. During recreation
    /// the previous generation's handle is passed as `old_swapchain` so the
    /// driver can recycle in-flight images.
    pub fn new(
        device: &Arc<VulkanDevice>,
        support: &SurfaceSupport,
        preferred_present_mode: vk::PresentModeKHR,
        width: u32,
        height: u32,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let surface_format = support.choose_format()?;
        let present_mode = support.choose_present_mode(preferred_present_mode);
        let extent = support.choose_extent(width, height);
        let image_count = support.choose_image_count();

        log::info!("Present mode: {:?}", present_mode);

        let loader =
            ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or_else(vk::SwapchainKHR::null));

        // When graphics and present come from different families the images
        // must be shareable between their queues.
        let family_indices = [
            device.queue_indices.graphics_family.context("Missing graphics family")?,
            device.queue_indices.present_family.context("Missing present family")?,
        ];
        if family_indices[0] != family_indices[1] {
            create_info = create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices);
        } else {
            create_info = create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE);
        }

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let handles = Arc::new(Mutex::new(Some(SwapchainHandles {
            swapchain,
            image_views: Vec::new(),
            framebuffers: Vec::new(),
        })));

        // The teardown hook owns destruction; it runs once, from either the
        // device cascade or this struct's drop. Registered before the view
        // loop so a failure mid-construction unwinds through it and releases
        // the swapchain plus every view built so far.
        let child = {
            let raw_device = device.device.clone();
            let loader = loader.clone();
            let handles = Arc::clone(&handles);
            device.children.register(move || {
                if let Some(handles) = handles.lock().take() {
                    unsafe {
                        for framebuffer in handles.framebuffers {
                            raw_device.destroy_framebuffer(framebuffer, None);
                        }
                        for view in handles.image_views {
                            raw_device.destroy_image_view(view, None);
                        }
                        loader.destroy_swapchain(handles.swapchain, None);
                    }
                }
            })
        };

        let images = unsafe { loader.get_swapchain_images(swapchain) }?;
        log::info!("Created swapchain with {} images", images.len());

        for &image in &images {
            let view = Self::create_image_view(device, image, surface_format.format)?;
            if let Some(handles) = handles.lock().as_mut() {
                handles.image_views.push(view);
            }
        }

        Ok(Self {
            children: ParentResource::new(),
            loader,
            handles,
            images,
            format: surface_format.format,
            extent,
            device: Arc::clone(device),
            _child: child,
        })
    }

    fn create_image_view(
        device: &VulkanDevice,
        image: vk::Image,
        format: vk::Format,
    ) -> Result<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe { device.device.create_image_view(&create_info, None) }
            .context("Failed to create image view")
    }

    /// Builds one framebuffer per swapchain image for the given render
    /// pass, replacing any previous set.
    pub fn create_framebuffers(&self, render_pass: vk::RenderPass) -> Result<()> {
        let mut guard = self.handles.lock();
        let handles = guard
            .as_mut()
            .context("Swapchain already destroyed")?;

        for framebuffer in handles.framebuffers.drain(..) {
            unsafe { self.device.device.destroy_framebuffer(framebuffer, None) };
        }

        // Pushed one at a time so the teardown hook covers framebuffers
        // already built if a later one fails.
        for i in 0..handles.image_views.len() {
            let attachments = [handles.image_views[i]];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);

            let framebuffer =
                unsafe { self.device.device.create_framebuffer(&framebuffer_info, None) }
                    .context("Failed to create framebuffer")?;
            handles.framebuffers.push(framebuffer);
        }

        Ok(())
    }

    pub fn framebuffer(&self, index: usize) -> Result<vk::Framebuffer> {
        let guard = self.handles.lock();
        let handles = guard.as_ref().context("Swapchain already destroyed")?;
        handles
            .framebuffers
            .get(index)
            .copied()
            .with_context(|| format!("No framebuffer for image index {}", index))
    }

    pub fn framebuffer_count(&self) -> usize {
        self.handles
            .lock()
            .as_ref()
            .map_or(0, |handles| handles.framebuffers.len())
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Raw handle, needed as `old_swapchain` during recreation.
    pub fn handle(&self) -> Result<vk::SwapchainKHR> {
        let guard = self.handles.lock();
        Ok(guard
            .as_ref()
            .context("Swapchain already destroyed")?
            .swapchain)
    }

    /// Acquire the next presentable image. Blocking up to `timeout`.
    pub fn acquire_next_image(
        &self,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, PresentOutcome)> {
        let swapchain = self.handle()?;
        let result = unsafe {
            self.loader
                .acquire_next_image(swapchain, timeout, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, false)) => Ok((index, PresentOutcome::Presented)),
            Ok((index, true)) => Ok((index, PresentOutcome::Suboptimal)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok((0, PresentOutcome::OutOfDate)),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => Ok((0, PresentOutcome::SurfaceLost)),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Enqueue presentation of `image_index` on the device's present queue.
    /// This is the one intentional blocking point of the frame loop.
    pub fn present(
        &self,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        let swapchains = [self.handle()?];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.loader
                .queue_present(self.device.present_queue, &present_info)
        };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => Ok(PresentOutcome::SurfaceLost),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_lifecycle_advances_generations() {
        let mut state = SwapchainState::Uninitialized;
        state.initialize().unwrap();
        assert!(state.is_live());
        assert_eq!(state.generation(), Some(0));

        state.invalidate().unwrap();
        assert!(state.needs_recreation());

        assert_eq!(state.begin_recreation().unwrap(), 0);
        assert_eq!(state.finish_recreation().unwrap(), 1);
        assert!(state.is_live());
        assert_eq!(state.generation(), Some(1));

        state.destroy();
        assert_eq!(state, SwapchainState::Destroyed);
    }

    #[test]
    fn out_of_date_and_suboptimal_invalidate() {
        for outcome in [PresentOutcome::OutOfDate, PresentOutcome::Suboptimal] {
            let mut state = SwapchainState::Uninitialized;
            state.initialize().unwrap();
            state.note_outcome(outcome).unwrap();
            assert!(state.needs_recreation());
        }
    }

    #[test]
    fn successful_present_keeps_state_live() {
        let mut state = SwapchainState::Uninitialized;
        state.initialize().unwrap();
        state.note_outcome(PresentOutcome::Presented).unwrap();
        assert!(state.is_live());
        assert_eq!(state.generation(), Some(0));
    }

    #[test]
    fn surface_loss_is_fatal() {
        let mut state = SwapchainState::Uninitialized;
        state.initialize().unwrap();
        let err = state.note_outcome(PresentOutcome::SurfaceLost).unwrap_err();
        assert!(err.to_string().contains("Surface lost"));
    }

    #[test]
    fn invalidation_is_idempotent() {
        let mut state = SwapchainState::Uninitialized;
        state.initialize().unwrap();
        state.invalidate().unwrap();
        state.invalidate().unwrap();
        assert!(state.needs_recreation());
    }

    #[test]
    fn recreation_replaces_per_image_resources_wholesale() {
        use crate::ownership::ParentResource;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        // Per-image resources (views, framebuffers) belong to one swapchain
        // generation. Recreation must release every resource of the old
        // generation exactly once and leave the successor holding only what
        // was registered against it.
        let freed = Arc::new(AtomicUsize::new(0));
        let counting_hook = |freed: &Arc<AtomicUsize>| {
            let freed = Arc::clone(freed);
            move || {
                freed.fetch_add(1, Ordering::SeqCst);
            }
        };

        let mut state = SwapchainState::Uninitialized;
        state.initialize().unwrap();

        let old_registry: ParentResource<Swapchain> = ParentResource::new();
        let old_children: Vec<_> = (0..3).map(|_| old_registry.register(counting_hook(&freed))).collect();
        assert_eq!(old_registry.child_count(), 3);

        // Resize lands; the old generation retires and a successor comes up
        // with a different image count.
        state.invalidate().unwrap();
        assert_eq!(state.begin_recreation().unwrap(), 0);
        old_registry.free_children();

        let new_registry: ParentResource<Swapchain> = ParentResource::new();
        let new_children: Vec<_> = (0..5).map(|_| new_registry.register(counting_hook(&freed))).collect();
        assert_eq!(state.finish_recreation().unwrap(), 1);

        assert_eq!(old_registry.child_count(), 0);
        assert!(old_children.iter().all(|child| child.is_freed()));
        assert_eq!(freed.load(Ordering::SeqCst), 3);
        assert_eq!(new_registry.child_count(), 5);
        assert!(new_children.iter().all(|child| !child.is_freed()));

        // Stale guards dropping later must not re-run their hooks.
        drop(old_children);
        assert_eq!(freed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn invalid_transitions_are_reported() {
        let mut state = SwapchainState::Uninitialized;
        assert!(state.invalidate().is_err());
        assert!(state.begin_recreation().is_err());
        assert!(state.finish_recreation().is_err());

        state.initialize().unwrap();
        // Double-initialize is a contract violation.
        assert!(state.initialize().is_err());
        // Recreation without invalidation is a contract violation.
        assert!(state.begin_recreation().is_err());

        state.destroy();
        assert!(state.invalidate().is_err());
        assert_eq!(state.generation(), None);
    }
}
