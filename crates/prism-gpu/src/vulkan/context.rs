//! Device context: instance, logical device, allocator and command stream.

use std::ffi::c_char;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::command::CommandStream;
use super::instance::{create_instance, select_physical_device};
use super::memory::GpuAllocator;
use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};

/// Vulkan objects shared by every operation of a [`super::VulkanDevice`].
///
/// Fields drop in reverse creation order through [`Drop`].
pub struct VulkanContext {
    _entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Mutex<GpuAllocator>,
    pub(crate) stream: CommandStream,
    pub(crate) as_loader: ash::khr::acceleration_structure::Device,
    pub(crate) rt_loader: ash::khr::ray_tracing_pipeline::Device,
}

impl VulkanContext {
    #[must_use]
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    #[must_use]
    pub const fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    #[must_use]
    pub const fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Block until the device has no pending work.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }

    /// Record and run a one-shot command buffer, waiting for completion.
    pub(crate) fn submit_and_wait<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        unsafe { self.stream.run(&self.device, record) }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.stream.destroy(&self.device);
            self.allocator.lock().shutdown();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for a Vulkan ray tracing device.
#[derive(Clone, Debug)]
pub struct VulkanDeviceBuilder {
    app_name: String,
    validation: bool,
    device_index: Option<usize>,
}

impl Default for VulkanDeviceBuilder {
    fn default() -> Self {
        Self {
            app_name: "Prism".to_string(),
            validation: cfg!(debug_assertions),
            device_index: None,
        }
    }
}

impl VulkanDeviceBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable the Khronos validation layer.
    #[must_use]
    pub const fn validation(mut self, enable: bool) -> Self {
        self.validation = enable;
        self
    }

    /// Only consider the physical device at this enumeration index.
    #[must_use]
    pub const fn device_index(mut self, index: usize) -> Self {
        self.device_index = Some(index);
        self
    }

    pub(crate) fn build_context(self) -> Result<VulkanContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;
        let instance = unsafe { create_instance(&entry, &self.app_name, self.validation) }?;

        // The instance is the only object so far; release it on any failure.
        let opened = unsafe { open_device(&instance, self.device_index) };
        let (physical_device, capabilities, device, stream) = match opened {
            Ok(parts) => parts,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };
        tracing::info!("Selected GPU: {}", capabilities.summary());

        let device = Arc::new(device);
        let allocator = unsafe { GpuAllocator::new(&instance, Arc::clone(&device), physical_device) }?;
        let as_loader = ash::khr::acceleration_structure::Device::new(&instance, &device);
        let rt_loader = ash::khr::ray_tracing_pipeline::Device::new(&instance, &device);

        Ok(VulkanContext {
            _entry: entry,
            instance,
            physical_device,
            device,
            capabilities,
            allocator: Mutex::new(allocator),
            stream,
            as_loader,
            rt_loader,
        })
    }
}

/// Select a physical device, create the logical device and its stream.
unsafe fn open_device(
    instance: &ash::Instance,
    device_index: Option<usize>,
) -> Result<(vk::PhysicalDevice, GpuCapabilities, ash::Device, CommandStream)> {
    let (physical_device, capabilities) = select_physical_device(instance, device_index)?;

    // Ray tracing commands go to any compute-capable family
    let queue_family = instance
        .get_physical_device_queue_family_properties(physical_device)
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .ok_or(GpuError::NoSuitableDevice)? as u32;

    let device = create_device(instance, physical_device, queue_family)?;
    match CommandStream::new(&device, queue_family) {
        Ok(stream) => Ok((physical_device, capabilities, device, stream)),
        Err(e) => {
            device.destroy_device(None);
            Err(e)
        }
    }
}

/// Create the logical device with the ray tracing feature chain enabled.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<ash::Device> {
    let priority = [1.0_f32];
    let queue_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&priority);

    let extensions: [*const c_char; 3] = [
        ash::khr::acceleration_structure::NAME.as_ptr(),
        ash::khr::ray_tracing_pipeline::NAME.as_ptr(),
        ash::khr::deferred_host_operations::NAME.as_ptr(),
    ];

    let mut vulkan_13 = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .maintenance4(true);
    let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .scalar_block_layout(true);
    let mut accel_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
    let mut pipeline_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);
    let mut features = vk::PhysicalDeviceFeatures2::default()
        .features(vk::PhysicalDeviceFeatures::default().shader_int64(true))
        .push_next(&mut vulkan_13)
        .push_next(&mut vulkan_12)
        .push_next(&mut accel_features)
        .push_next(&mut pipeline_features);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_info))
        .enabled_extension_names(&extensions)
        .push_next(&mut features);

    Ok(instance.create_device(physical_device, &create_info, None)?)
}
