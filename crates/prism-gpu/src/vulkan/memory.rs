//! Host-visible buffers with device addresses, backed by `gpu-allocator`.
//!
//! Every buffer the device hands out is addressable from shaders and mapped
//! on the host, so transfers are plain memory copies.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocatorDebugSettings, MemoryLocation};

use crate::error::{GpuError, Result};

/// Alignment of every buffer base address.
///
/// Acceleration structure storage needs 256; table regions need less.
pub const MIN_BUFFER_ALIGNMENT: u64 = 256;

/// Owns the `gpu-allocator` instance for one logical device.
pub struct GpuAllocator {
    inner: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// # Safety
    /// All three handles must be valid and belong together.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let inner = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: AllocatorDebugSettings {
                log_leaks_on_shutdown: true,
                ..AllocatorDebugSettings::default()
            },
            buffer_device_address: true,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            inner: Some(inner),
            device,
        })
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.inner
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("allocator already shut down".to_string()))
    }

    /// Create a buffer of `size` bytes whose address shaders can use.
    ///
    /// A zero `size` still gets a small backing allocation so the buffer has
    /// a valid address.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        let device = Arc::clone(&self.device);
        let info = vk::BufferCreateInfo::default()
            .size(size.max(16))
            .usage(usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&info, None) }?;

        let bound = (|| -> Result<(Allocation, vk::DeviceAddress)> {
            let mut requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
            requirements.alignment = requirements.alignment.max(MIN_BUFFER_ALIGNMENT);
            let allocation = self
                .inner()?
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| GpuError::AllocationFailed(format!("{name}: {e}")))?;
            if let Err(e) =
                unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
            {
                let _ = self.inner()?.free(allocation);
                return Err(e.into());
            }
            let address = unsafe {
                device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
            };
            Ok((allocation, address))
        })();

        match bound {
            Ok((allocation, address)) => Ok(GpuBuffer {
                buffer,
                allocation: Some(allocation),
                size,
                address,
            }),
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                Err(e)
            }
        }
    }

    /// Return the memory of `buffer` and destroy it. Safe to call twice.
    pub fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }
        if buffer.buffer != vk::Buffer::null() {
            unsafe { self.device.destroy_buffer(buffer.buffer, None) };
            buffer.buffer = vk::Buffer::null();
        }
        Ok(())
    }

    /// Drop the allocator. Must happen before the logical device is destroyed.
    pub fn shutdown(&mut self) {
        self.inner = None;
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A mapped buffer and its shader-visible address.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
    pub address: vk::DeviceAddress,
}

impl GpuBuffer {
    /// Whether `[address, address + len)` lies inside this buffer.
    #[must_use]
    pub fn contains(&self, address: vk::DeviceAddress, len: u64) -> bool {
        address >= self.address
            && address
                .checked_add(len)
                .is_some_and(|end| end <= self.address + self.size)
    }

    /// Host pointer to `len` bytes at `offset`, bounds checked.
    fn span(&self, offset: u64, len: usize) -> Result<*mut u8> {
        if !self.contains(self.address + offset, len as u64) {
            return Err(GpuError::OutOfBounds {
                address: self.address + offset,
                len,
            });
        }
        let base = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .ok_or_else(|| GpuError::InvalidState("buffer is not host mapped".to_string()))?;
        Ok(unsafe { base.as_ptr().cast::<u8>().add(offset as usize) })
    }

    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let dst = self.span(offset, data.len())?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let src = self.span(offset, out.len())?;
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
        Ok(())
    }
}
