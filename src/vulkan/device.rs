// Vulkan device - root owner of the explicit backend's resource graph
//
// Responsibilities:
// - Instance creation with the window's required surface extensions
// - Physical device selection (graphics + present + swapchain support)
// - Logical device + queue creation from the deduplicated family indices
// - Child registry: everything created from this device registers here

use std::ffi::{CStr, CString};

use anyhow::{Context, Result};
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use crate::ownership::ParentResource;
use crate::vulkan::queues::QueueFamilyIndices;
use crate::vulkan::support::SurfaceSupport;

/// Device extensions every candidate must support. Presentation is the whole
/// point of this renderer, so a device without swapchain support disqualifies.
fn required_device_extensions() -> [&'static CStr; 1] {
    [ash::extensions::khr::Swapchain::name()]
}

/// Vulkan device wrapper. Root owner for swapchains, shader modules, memory
/// allocations and buffers; its teardown cascades through the child registry
/// before any of its own handles are released.
pub struct VulkanDevice {
    /// Registry of live child resources. Declared for explicit cascade in
    /// Drop, never mutated outside child registration/deregistration.
    pub children: ParentResource<VulkanDevice>,

    pub device: ash::Device,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_indices: QueueFamilyIndices,

    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::extensions::khr::Surface,

    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub instance: ash::Instance,
    _entry: Entry,
}

/// Everything selection needs to know about one physical device, captured as
/// plain data so the policy is testable without a driver.
pub struct DeviceCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub queue_indices: QueueFamilyIndices,
    pub has_required_extensions: bool,
    pub surface_adequate: bool,
}

impl DeviceCandidate {
    fn qualifies(&self) -> bool {
        self.queue_indices.is_complete() && self.has_required_extensions && self.surface_adequate
    }

    fn score(&self) -> u32 {
        // Tie-break only; any qualifying device is correct.
        match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 1,
        }
    }
}

/// Picks the best qualifying candidate. There is no renderer without a
/// device, so an empty or fully-disqualified list is fatal.
pub fn select_device(candidates: &[DeviceCandidate]) -> Result<usize> {
    let mut best: Option<(usize, u32)> = None;
    for (i, candidate) in candidates.iter().enumerate() {
        if !candidate.qualifies() {
            log::debug!(
                "Skipping GPU '{}': complete queues={}, extensions={}, surface={}",
                candidate.name,
                candidate.queue_indices.is_complete(),
                candidate.has_required_extensions,
                candidate.surface_adequate
            );
            continue;
        }
        let score = candidate.score();
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((i, score));
        }
    }
    best.map(|(i, _)| i)
        .context("No suitable GPU found (graphics + present + swapchain support required)")
}

impl VulkanDevice {
    /// Creates the instance, surface and logical device for the given window
    /// handles. Fails fatally when no physical device qualifies.
    pub fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance = Self::create_instance(&entry, app_name, display_handle, enable_validation)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);
        let surface = create_surface(&entry, &instance, display_handle, window_handle)?;

        let (physical_device, queue_indices) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let (device, graphics_queue, present_queue) =
            Self::create_logical_device(&instance, physical_device, &queue_indices)?;

        Ok(Arc::new(Self {
            children: ParentResource::new(),
            device,
            graphics_queue,
            present_queue,
            queue_indices,
            physical_device,
            properties,
            memory_properties,
            surface,
            surface_loader,
            debug_utils,
            instance,
            _entry: entry,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        display_handle: RawDisplayHandle,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("ember2d")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let mut extensions: Vec<*const i8> = required_instance_extensions(display_handle)?
            .iter()
            .map(|ext| ext.as_ptr())
            .collect();
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger =
            unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    /// Enumerates physical devices, builds a candidate description for each
    /// and applies the pure selection policy.
    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;
        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let mut candidates = Vec::with_capacity(devices.len());
        for &device in &devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                .to_string_lossy()
                .into_owned();

            let queue_indices = QueueFamilyIndices::query(instance, device, surface_loader, surface)?;
            let has_required_extensions = Self::check_device_extensions(instance, device)?;
            // Swapchain queries are only valid once the extension is present.
            let surface_adequate = has_required_extensions
                && SurfaceSupport::query(surface_loader, device, surface)?.is_adequate();

            candidates.push(DeviceCandidate {
                name,
                device_type: props.device_type,
                queue_indices,
                has_required_extensions,
                surface_adequate,
            });
        }

        let chosen = select_device(&candidates)?;
        Ok((devices[chosen], candidates[chosen].queue_indices.clone()))
    }

    fn check_device_extensions(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
    ) -> Result<bool> {
        let available = unsafe { instance.enumerate_device_extension_properties(device) }?;
        Ok(required_device_extensions().iter().all(|required| {
            available.iter().any(|ext| {
                (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }) == *required
            })
        }))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_indices: &QueueFamilyIndices,
    ) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
        let priorities = [1.0f32];
        // One queue per unique family; graphics and present often share one.
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_indices
            .unique_indices()
            .into_iter()
            .map(|index| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(index)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<*const i8> = required_device_extensions()
            .iter()
            .map(|ext| ext.as_ptr())
            .collect();

        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_family = queue_indices
            .graphics_family
            .context("Missing graphics queue family")?;
        let present_family = queue_indices
            .present_family
            .context("Missing present queue family")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_family, 0) };

        Ok((device, graphics_queue, present_queue))
    }

    /// Memory type index matching the filter and property flags.
    pub fn find_memory_type(
        &self,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        find_memory_type_index(&self.memory_properties, type_filter, properties)
            .context("Failed to find suitable memory type")
    }

    /// Waits for all queues to go idle. Called before any teardown so no
    /// resource is destroyed underneath in-flight GPU work.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Drain pending GPU work, then children before our own handles.
        let _ = self.wait_idle();
        self.children.free_children();

        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

pub(crate) fn find_memory_type_index(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = memory_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);
        has_type && has_properties
    })
}

/// Instance extensions the platform's surface requires, derived from the
/// display handle the window hands us.
pub fn required_instance_extensions(display: RawDisplayHandle) -> Result<Vec<&'static CStr>> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => ash::extensions::khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => ash::extensions::khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => ash::extensions::khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => ash::extensions::khr::WaylandSurface::name(),
        _ => anyhow::bail!("Unsupported display platform for Vulkan surface creation"),
    };
    Ok(vec![ash::extensions::khr::Surface::name(), platform])
}

/// Platform surface creation from raw window handles.
fn create_surface(
    entry: &Entry,
    instance: &ash::Instance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    let surface = match (display, window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance = handle
                .hinstance
                .map(|h| h.get())
                .unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            let loader = ash::extensions::khr::Win32Surface::new(entry, instance);
            unsafe { loader.create_win32_surface(&create_info, None) }
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let dpy = display
                .display
                .map(|d| d.as_ptr())
                .unwrap_or(std::ptr::null_mut());
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy as *mut _)
                .window(handle.window);
            let loader = ash::extensions::khr::XlibSurface::new(entry, instance);
            unsafe { loader.create_xlib_surface(&create_info, None) }
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
            let connection = display
                .connection
                .map(|c| c.as_ptr())
                .unwrap_or(std::ptr::null_mut());
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection)
                .window(handle.window.get());
            let loader = ash::extensions::khr::XcbSurface::new(entry, instance);
            unsafe { loader.create_xcb_surface(&create_info, None) }
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr())
                .surface(handle.surface.as_ptr());
            let loader = ash::extensions::khr::WaylandSurface::new(entry, instance);
            unsafe { loader.create_wayland_surface(&create_info, None) }
        }
        _ => anyhow::bail!("Unsupported window handle type"),
    };

    surface.context("Failed to create window surface")
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(
        name: &str,
        device_type: vk::PhysicalDeviceType,
        complete: bool,
        extensions: bool,
        adequate: bool,
    ) -> DeviceCandidate {
        let queue_indices = QueueFamilyIndices {
            graphics_family: Some(0),
            present_family: if complete { Some(0) } else { None },
        };
        DeviceCandidate {
            name: name.to_string(),
            device_type,
            queue_indices,
            has_required_extensions: extensions,
            surface_adequate: adequate,
        }
    }

    #[test]
    fn single_qualifying_device_is_selected() {
        let candidates = vec![candidate(
            "gpu0",
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            true,
            true,
            true,
        )];
        assert_eq!(select_device(&candidates).unwrap(), 0);
    }

    #[test]
    fn empty_candidate_list_is_fatal() {
        let err = select_device(&[]).unwrap_err();
        assert!(err.to_string().contains("No suitable GPU"));
    }

    #[test]
    fn fully_disqualified_list_is_fatal() {
        let candidates = vec![
            candidate("no-present", vk::PhysicalDeviceType::DISCRETE_GPU, false, true, true),
            candidate("no-swapchain", vk::PhysicalDeviceType::DISCRETE_GPU, true, false, true),
            candidate("no-formats", vk::PhysicalDeviceType::DISCRETE_GPU, true, true, false),
        ];
        assert!(select_device(&candidates).is_err());
    }

    #[test]
    fn discrete_gpu_preferred_over_integrated() {
        let candidates = vec![
            candidate("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, true, true, true),
            candidate("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU, true, true, true),
        ];
        assert_eq!(select_device(&candidates).unwrap(), 1);
    }

    #[test]
    fn disqualified_discrete_gpu_loses_to_qualifying_integrated() {
        let candidates = vec![
            candidate("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU, true, false, true),
            candidate("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, true, true, true),
        ];
        assert_eq!(select_device(&candidates).unwrap(), 1);
    }

    #[test]
    fn memory_type_index_matches_filter_and_flags() {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            ..Default::default()
        };
        memory_properties.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        memory_properties.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        // Type 1 matches the host-visible request.
        assert_eq!(
            find_memory_type_index(
                &memory_properties,
                0b11,
                vk::MemoryPropertyFlags::HOST_VISIBLE
            ),
            Some(1)
        );
        // Filter excludes type 1: no match.
        assert_eq!(
            find_memory_type_index(
                &memory_properties,
                0b01,
                vk::MemoryPropertyFlags::HOST_VISIBLE
            ),
            None
        );
    }
}
