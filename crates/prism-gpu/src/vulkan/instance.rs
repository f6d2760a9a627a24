//! Instance creation and physical device selection.

use std::ffi::{CStr, CString};

use ash::vk;

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Create a Vulkan 1.3 instance without any surface extensions.
///
/// A requested validation layer the loader does not know is skipped with a
/// warning.
///
/// # Safety
/// `entry` must be a loaded Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .engine_name(c"Prism")
        .api_version(vk::API_VERSION_1_3);

    let mut layers: Vec<*const std::ffi::c_char> = Vec::new();
    if validation {
        let known = entry
            .enumerate_instance_layer_properties()?
            .iter()
            .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == VALIDATION_LAYER);
        if known {
            layers.push(VALIDATION_LAYER.as_ptr());
        } else {
            tracing::warn!("{} requested but not installed", VALIDATION_LAYER.to_string_lossy());
        }
    }

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&layers);
    Ok(entry.create_instance(&create_info, None)?)
}

/// Pick the best ray tracing capable physical device.
///
/// With `only_index` set, every other enumerated device is ignored.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    only_index: Option<usize>,
) -> Result<(vk::PhysicalDevice, GpuCapabilities)> {
    instance
        .enumerate_physical_devices()?
        .into_iter()
        .enumerate()
        .filter(|(index, _)| only_index.map_or(true, |only| only == *index))
        .filter_map(|(index, device)| {
            let capabilities = GpuCapabilities::query(instance, device);
            match capabilities.rejection_reason() {
                Some(reason) => {
                    tracing::debug!("GPU {index} ({}) rejected: {reason}", capabilities.device_name);
                    None
                }
                None => Some((device, capabilities)),
            }
        })
        .max_by_key(|(_, capabilities)| capabilities.selection_score())
        .ok_or(GpuError::NoSuitableDevice)
}
