//! Ray tracing capability detection.
//!
//! A physical device qualifies when it runs Vulkan 1.3, exposes buffer device
//! addresses and carries every extension in [`REQUIRED_RAY_TRACING_EXTENSIONS`].
//! Qualifying devices are ranked by [`GpuCapabilities::selection_score`].

use std::ffi::CStr;

use ash::vk;

/// Device extensions a ray tracing device must expose.
pub const REQUIRED_RAY_TRACING_EXTENSIONS: [&str; 3] = [
    "VK_KHR_acceleration_structure",
    "VK_KHR_ray_tracing_pipeline",
    "VK_KHR_deferred_host_operations",
];

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    #[must_use]
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            other => Self::Other(other),
        }
    }
}

/// Ray tracing pipeline limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RayTracingCapabilities {
    /// Size of a shader group handle (the record header).
    pub shader_group_handle_size: u32,
    /// Required alignment of record strides.
    pub shader_group_handle_alignment: u32,
    /// Required alignment of each table region's base address.
    pub shader_group_base_alignment: u32,
    /// Largest permitted record stride.
    pub max_shader_group_stride: u32,
    /// Deepest recursion of trace calls.
    pub max_ray_recursion_depth: u32,
}

/// What a physical device offers the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    /// Packed Vulkan API version.
    pub api_version: u32,
    pub buffer_device_address: bool,
    /// Required extensions the device lacks.
    pub missing_extensions: Vec<&'static str>,
    /// Ray tracing limits, zeroed when the extensions are missing.
    pub ray_tracing: RayTracingCapabilities,
    pub device_local_memory_mb: u64,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    #[must_use]
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory = instance.get_physical_device_memory_properties(physical_device);
        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();
        let has_extension = |wanted: &str| {
            extensions.iter().any(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr()).to_bytes() == wanted.as_bytes()
            })
        };

        let missing_extensions: Vec<&'static str> = REQUIRED_RAY_TRACING_EXTENSIONS
            .into_iter()
            .filter(|ext| !has_extension(ext))
            .collect();

        let ray_tracing = if missing_extensions.is_empty() {
            let mut rt = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
            let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut rt);
            instance.get_physical_device_properties2(physical_device, &mut properties2);
            RayTracingCapabilities {
                shader_group_handle_size: rt.shader_group_handle_size,
                shader_group_handle_alignment: rt.shader_group_handle_alignment,
                shader_group_base_alignment: rt.shader_group_base_alignment,
                max_shader_group_stride: rt.max_shader_group_stride,
                max_ray_recursion_depth: rt.max_ray_recursion_depth,
            }
        } else {
            RayTracingCapabilities::default()
        };

        let device_local_memory_mb = memory
            .memory_heaps
            .iter()
            .take(memory.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size >> 20)
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name: CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned(),
            device_type: properties.device_type,
            api_version: properties.api_version,
            buffer_device_address: api_at_least_1_3(properties.api_version)
                || has_extension("VK_KHR_buffer_device_address"),
            missing_extensions,
            ray_tracing,
            device_local_memory_mb,
        }
    }

    /// Why this device cannot run the pipeline, or `None` if it can.
    #[must_use]
    pub fn rejection_reason(&self) -> Option<String> {
        if !api_at_least_1_3(self.api_version) {
            return Some(format!(
                "Vulkan {}.{} is older than 1.3",
                vk::api_version_major(self.api_version),
                vk::api_version_minor(self.api_version)
            ));
        }
        if !self.missing_extensions.is_empty() {
            return Some(format!("missing {}", self.missing_extensions.join(", ")));
        }
        if !self.buffer_device_address {
            return Some("no buffer device address support".to_string());
        }
        if self.ray_tracing.max_ray_recursion_depth == 0 {
            return Some("ray recursion depth is zero".to_string());
        }
        None
    }

    /// Rank among qualifying devices: discrete first, then by memory.
    #[must_use]
    pub fn selection_score(&self) -> u64 {
        let class = match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 3,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
            _ => 0,
        };
        (class << 32) | self.device_local_memory_mb.min(u64::from(u32::MAX))
    }

    /// One-line description for logs.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, Vulkan {}.{}, {} MB, {} byte record headers)",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            self.device_local_memory_mb,
            self.ray_tracing.shader_group_handle_size,
        )
    }
}

const fn api_at_least_1_3(version: u32) -> bool {
    let major = vk::api_version_major(version);
    major > 1 || (major == 1 && vk::api_version_minor(version) >= 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtx_card() -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Nvidia,
            device_name: "test".to_string(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: vk::make_api_version(0, 1, 3, 0),
            buffer_device_address: true,
            missing_extensions: Vec::new(),
            ray_tracing: RayTracingCapabilities {
                shader_group_handle_size: 32,
                shader_group_handle_alignment: 32,
                shader_group_base_alignment: 64,
                max_shader_group_stride: 4096,
                max_ray_recursion_depth: 31,
            },
            device_local_memory_mb: 8192,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn rejection_names_the_gap() {
        assert_eq!(rtx_card().rejection_reason(), None);

        let old = GpuCapabilities {
            api_version: vk::make_api_version(0, 1, 2, 0),
            ..rtx_card()
        };
        assert!(old.rejection_reason().is_some_and(|r| r.contains("1.2")));

        let no_rt = GpuCapabilities {
            missing_extensions: vec!["VK_KHR_ray_tracing_pipeline"],
            ..rtx_card()
        };
        assert!(no_rt
            .rejection_reason()
            .is_some_and(|r| r.contains("VK_KHR_ray_tracing_pipeline")));
    }

    #[test]
    fn discrete_outranks_larger_integrated() {
        let integrated = GpuCapabilities {
            device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
            device_local_memory_mb: 65536,
            ..rtx_card()
        };
        assert!(rtx_card().selection_score() > integrated.selection_score());

        let bigger = GpuCapabilities {
            device_local_memory_mb: 16384,
            ..rtx_card()
        };
        assert!(bigger.selection_score() > rtx_card().selection_score());
    }
}
