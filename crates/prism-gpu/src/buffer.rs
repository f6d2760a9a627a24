//! Device buffer with explicit lifetime management.

use bytemuck::Pod;

use crate::device::RayTracingDevice;
use crate::error::{GpuError, Result};
use crate::handle::{DevicePtr, RawBuffer};

/// A block of device memory owned by host code.
///
/// The buffer does not release memory on drop: the owner calls
/// [`DeviceBuffer::free`] with the device that allocated it. Freeing is
/// idempotent, so teardown paths can call it unconditionally.
#[derive(Debug)]
pub struct DeviceBuffer {
    raw: Option<RawBuffer>,
    label: String,
}

impl DeviceBuffer {
    /// Create an unallocated buffer.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            raw: None,
            label: label.into(),
        }
    }

    /// Debug label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Size of the current allocation, 0 when unallocated.
    #[must_use]
    pub fn size_in_bytes(&self) -> u64 {
        self.raw.map_or(0, |raw| raw.size)
    }

    /// Device address of the current allocation, null when unallocated.
    #[must_use]
    pub fn device_ptr(&self) -> DevicePtr {
        self.raw.map_or(DevicePtr::NULL, |raw| raw.ptr)
    }

    /// The underlying allocation.
    #[must_use]
    pub fn raw(&self) -> Option<&RawBuffer> {
        self.raw.as_ref()
    }

    /// Whether memory is currently reserved.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.raw.is_some()
    }

    /// The underlying allocation, or an error naming the buffer.
    pub fn require_raw(&self) -> Result<&RawBuffer> {
        self.raw.as_ref().ok_or_else(|| {
            GpuError::InvalidState(format!("buffer '{}' is not allocated", self.label))
        })
    }

    /// Reserve `bytes` of device memory, releasing any previous allocation.
    pub fn alloc<D: RayTracingDevice + ?Sized>(&mut self, device: &D, bytes: u64) -> Result<()> {
        self.free(device)?;
        let raw = device.alloc(bytes, &self.label)?;
        tracing::trace!("Allocated '{}': {} bytes at {}", self.label, bytes, raw.ptr);
        self.raw = Some(raw);
        Ok(())
    }

    /// Allocate exactly `size_of_val(data)` bytes and copy `data` in.
    pub fn alloc_and_upload<D, T>(&mut self, device: &D, data: &[T]) -> Result<()>
    where
        D: RayTracingDevice + ?Sized,
        T: Pod,
    {
        self.alloc(device, std::mem::size_of_val(data) as u64)?;
        self.upload(device, data)
    }

    /// Copy `data` to the start of the buffer.
    pub fn upload<D, T>(&self, device: &D, data: &[T]) -> Result<()>
    where
        D: RayTracingDevice + ?Sized,
        T: Pod,
    {
        let raw = self.require_raw()?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as u64 > raw.size {
            return Err(GpuError::InvalidState(format!(
                "upload of {} bytes into '{}' of {} bytes",
                bytes.len(),
                self.label,
                raw.size
            )));
        }
        device.write(raw.ptr, bytes)
    }

    /// Fill `out` from the start of the buffer.
    pub fn download<D, T>(&self, device: &D, out: &mut [T]) -> Result<()>
    where
        D: RayTracingDevice + ?Sized,
        T: Pod,
    {
        let raw = self.require_raw()?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
        if bytes.len() as u64 > raw.size {
            return Err(GpuError::InvalidState(format!(
                "download of {} bytes from '{}' of {} bytes",
                bytes.len(),
                self.label,
                raw.size
            )));
        }
        device.read(raw.ptr, bytes)
    }

    /// Reallocate to `bytes` unless the buffer already has exactly that size.
    ///
    /// Returns `true` when new memory was allocated. Contents are not
    /// preserved across a reallocation.
    pub fn resize<D: RayTracingDevice + ?Sized>(&mut self, device: &D, bytes: u64) -> Result<bool> {
        if self.raw.is_some_and(|raw| raw.size == bytes) {
            return Ok(false);
        }
        self.alloc(device, bytes)?;
        Ok(true)
    }

    /// Release the allocation, if any.
    pub fn free<D: RayTracingDevice + ?Sized>(&mut self, device: &D) -> Result<()> {
        if let Some(raw) = self.raw.take() {
            device.free(raw)?;
            tracing::trace!("Freed '{}'", self.label);
        }
        Ok(())
    }
}
