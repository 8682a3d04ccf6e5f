// Surface support details
//
// Capabilities, formats and present modes for a (physical device, surface)
// pair. A stale instance is never patched in place: re-query after any
// surface or device change, the old values describe a surface that no
// longer exists.

use anyhow::{Context, Result};
use ash::vk;

pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(
        surface_loader: &ash::extensions::khr::Surface,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        let capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)
        }
        .context("Failed to query surface capabilities")?;

        let formats =
            unsafe { surface_loader.get_physical_device_surface_formats(physical_device, surface) }
                .context("Failed to query surface formats")?;

        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)
        }
        .context("Failed to query surface present modes")?;

        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }

    /// A device is usable for presentation only if it exposes at least one
    /// format and one present mode for the surface.
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }

    /// Prefer SRGB B8G8R8A8; otherwise take the first supported format.
    pub fn choose_format(&self) -> Result<vk::SurfaceFormatKHR> {
        self.formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| self.formats.first())
            .copied()
            .context("No supported surface formats")
    }

    /// Preferred mode if the surface supports it, else MAILBOX (non-blocking,
    /// no tearing), else FIFO which every implementation must support.
    pub fn choose_present_mode(&self, preferred: vk::PresentModeKHR) -> vk::PresentModeKHR {
        if self.present_modes.contains(&preferred) {
            return preferred;
        }
        if self.present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
            return vk::PresentModeKHR::MAILBOX;
        }
        vk::PresentModeKHR::FIFO
    }

    /// Swap extent for the requested framebuffer size, clamped into the
    /// surface's supported range. When the surface reports a fixed extent
    /// (anything but u32::MAX) that value is mandatory.
    pub fn choose_extent(&self, width: u32, height: u32) -> vk::Extent2D {
        if self.capabilities.current_extent.width != u32::MAX {
            return self.capabilities.current_extent;
        }
        vk::Extent2D {
            width: width.clamp(
                self.capabilities.min_image_extent.width,
                self.capabilities.max_image_extent.width,
            ),
            height: height.clamp(
                self.capabilities.min_image_extent.height,
                self.capabilities.max_image_extent.height,
            ),
        }
    }

    /// Requested image count: one above the minimum for latency headroom,
    /// capped by the maximum when the surface declares one.
    pub fn choose_image_count(&self) -> u32 {
        let mut count = self.capabilities.min_image_count + 1;
        if self.capabilities.max_image_count > 0 && count > self.capabilities.max_image_count {
            count = self.capabilities.max_image_count;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    fn support_with(
        formats: Vec<vk::SurfaceFormatKHR>,
        present_modes: Vec<vk::PresentModeKHR>,
    ) -> SurfaceSupport {
        SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR::default(),
            formats,
            present_modes,
        }
    }

    #[test]
    fn prefers_srgb_bgra_format() {
        let support = support_with(
            vec![
                format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
                format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            ],
            vec![vk::PresentModeKHR::FIFO],
        );
        let chosen = support.choose_format().unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_first_supported_format() {
        let support = support_with(
            vec![format(
                vk::Format::R8G8B8A8_UNORM,
                vk::ColorSpaceKHR::SRGB_NONLINEAR,
            )],
            vec![vk::PresentModeKHR::FIFO],
        );
        let chosen = support.choose_format().unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn no_formats_is_an_error_and_inadequate() {
        let support = support_with(vec![], vec![vk::PresentModeKHR::FIFO]);
        assert!(!support.is_adequate());
        assert!(support.choose_format().is_err());
    }

    #[test]
    fn present_mode_fallback_chain() {
        let support = support_with(
            vec![],
            vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        );
        // Preferred available.
        assert_eq!(
            support.choose_present_mode(vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        // Preferred missing, MAILBOX supported.
        assert_eq!(
            support.choose_present_mode(vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::MAILBOX
        );

        let fifo_only = support_with(vec![], vec![vk::PresentModeKHR::FIFO]);
        assert_eq!(
            fifo_only.choose_present_mode(vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_is_clamped_to_surface_range() {
        let mut support = support_with(vec![], vec![]);
        support.capabilities.current_extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        support.capabilities.min_image_extent = vk::Extent2D {
            width: 100,
            height: 100,
        };
        support.capabilities.max_image_extent = vk::Extent2D {
            width: 2000,
            height: 1000,
        };

        let extent = support.choose_extent(4096, 50);
        assert_eq!(extent.width, 2000);
        assert_eq!(extent.height, 100);
    }

    #[test]
    fn fixed_current_extent_is_mandatory() {
        let mut support = support_with(vec![], vec![]);
        support.capabilities.current_extent = vk::Extent2D {
            width: 640,
            height: 480,
        };

        let extent = support.choose_extent(1920, 1080);
        assert_eq!(extent.width, 640);
        assert_eq!(extent.height, 480);
    }

    #[test]
    fn image_count_respects_surface_maximum() {
        let mut support = support_with(vec![], vec![]);
        support.capabilities.min_image_count = 2;
        support.capabilities.max_image_count = 0; // unlimited
        assert_eq!(support.choose_image_count(), 3);

        support.capabilities.max_image_count = 2;
        assert_eq!(support.choose_image_count(), 2);
    }
}
