// Queue family discovery
//
// Maps the logical roles (graphics, present) to queue family indices for a
// physical device + surface pair. Resolved once, immutable afterwards.

use std::collections::BTreeSet;

use anyhow::Result;
use ash::vk;

#[derive(Debug, Clone, Default)]
pub struct QueueFamilyIndices {
    pub graphics_family: Option<u32>,
    pub present_family: Option<u32>,
}

impl QueueFamilyIndices {
    /// Resolves indices from queue family properties plus a present-support
    /// predicate. Pure over its inputs so candidate scoring is testable.
    pub fn from_families(
        families: &[vk::QueueFamilyProperties],
        mut supports_present: impl FnMut(u32) -> bool,
    ) -> Self {
        let mut indices = Self::default();
        for (i, family) in families.iter().enumerate() {
            let i = i as u32;
            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                indices.graphics_family.get_or_insert(i);
            }
            if indices.present_family.is_none() && supports_present(i) {
                indices.present_family = Some(i);
            }
            if indices.is_complete() {
                break;
            }
        }
        indices
    }

    /// Resolves indices against a real device/surface pair.
    pub fn query(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        let mut present_support = Vec::with_capacity(families.len());
        for i in 0..families.len() as u32 {
            let supported = unsafe {
                surface_loader.get_physical_device_surface_support(physical_device, i, surface)
            }?;
            present_support.push(supported);
        }

        Ok(Self::from_families(&families, |i| {
            present_support[i as usize]
        }))
    }

    pub fn is_complete(&self) -> bool {
        self.graphics_family.is_some() && self.present_family.is_some()
    }

    /// The deduplicated set of family indices. A single family often serves
    /// both roles; creating one queue per unique index avoids requesting
    /// duplicate queues from the driver.
    pub fn unique_indices(&self) -> BTreeSet<u32> {
        let mut set = BTreeSet::new();
        if let Some(i) = self.graphics_family {
            set.insert(i);
        }
        if let Some(i) = self.present_family {
            set.insert(i);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn shared_family_yields_single_unique_index() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)];
        let indices = QueueFamilyIndices::from_families(&families, |_| true);

        assert!(indices.is_complete());
        assert_eq!(indices.graphics_family, Some(0));
        assert_eq!(indices.present_family, Some(0));
        assert_eq!(indices.unique_indices().len(), 1);
    }

    #[test]
    fn distinct_families_yield_both_indices() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
        ];
        // Only the second family can present.
        let indices = QueueFamilyIndices::from_families(&families, |i| i == 1);

        assert!(indices.is_complete());
        assert_eq!(indices.graphics_family, Some(0));
        assert_eq!(indices.present_family, Some(1));

        let unique = indices.unique_indices();
        assert_eq!(unique.len(), 2);
        assert!(unique.contains(&0) && unique.contains(&1));
    }

    #[test]
    fn incomplete_when_no_present_family() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let indices = QueueFamilyIndices::from_families(&families, |_| false);

        assert!(!indices.is_complete());
        assert_eq!(indices.unique_indices().len(), 1);
    }

    #[test]
    fn empty_family_list_is_incomplete() {
        let indices = QueueFamilyIndices::from_families(&[], |_| true);
        assert!(!indices.is_complete());
        assert!(indices.unique_indices().is_empty());
    }
}
