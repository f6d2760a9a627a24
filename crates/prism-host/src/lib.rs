//! CPU reference device for the Prism ray tracer.
//!
//! [`HostDevice`] implements [`prism_gpu::RayTracingDevice`] entirely in
//! process memory. It builds binned-SAH BVHs for triangle inputs, binds the
//! built-in radiance programs by entry point name and runs launches row by
//! row on the rayon thread pool. It is the backend used by tests and by
//! machines without ray tracing hardware.

pub mod bvh;
pub mod device;
pub mod memory;
pub mod programs;
pub mod shading;

pub use device::{HostDevice, HostStats, SBT_HEADER_SIZE, SBT_RECORD_ALIGNMENT};
pub use memory::HostMemory;

#[cfg(test)]
mod tests {
    use super::*;
    use prism_gpu::{DeviceBuffer, GpuError};

    #[test]
    fn buffer_upload_download() {
        let device = HostDevice::new();
        let mut buffer = DeviceBuffer::new("values");
        assert!(!buffer.is_allocated());
        assert!(buffer.device_ptr().is_null());

        buffer.alloc_and_upload(&device, &[1u32, 2, 3, 4]).unwrap();
        assert_eq!(buffer.size_in_bytes(), 16);

        let mut out = [0u32; 4];
        buffer.download(&device, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        let mut partial = [0u32; 2];
        buffer.download(&device, &mut partial).unwrap();
        assert_eq!(partial, [1, 2]);
    }

    #[test]
    fn buffer_rejects_oversized_transfers() {
        let device = HostDevice::new();
        let mut buffer = DeviceBuffer::new("small");
        buffer.alloc(&device, 8).unwrap();

        assert!(matches!(
            buffer.upload(&device, &[0u32; 3]),
            Err(GpuError::InvalidState(_))
        ));
        let mut out = [0u64; 2];
        assert!(matches!(
            buffer.download(&device, &mut out),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn unallocated_buffer_transfers_fail() {
        let device = HostDevice::new();
        let buffer = DeviceBuffer::new("empty");
        assert!(buffer.upload(&device, &[1u8]).is_err());
    }

    #[test]
    fn resize_skips_same_size() {
        let device = HostDevice::new();
        let mut buffer = DeviceBuffer::new("frame");

        assert!(buffer.resize(&device, 64).unwrap());
        let ptr = buffer.device_ptr();
        assert!(!buffer.resize(&device, 64).unwrap());
        assert_eq!(buffer.device_ptr(), ptr);

        assert!(buffer.resize(&device, 128).unwrap());
        assert_ne!(buffer.device_ptr(), ptr);
        assert_eq!(device.allocation_count(), 1);
    }

    #[test]
    fn free_is_idempotent() {
        let device = HostDevice::new();
        let mut buffer = DeviceBuffer::new("scratch");
        buffer.alloc(&device, 32).unwrap();
        assert_eq!(device.allocation_count(), 1);

        buffer.free(&device).unwrap();
        buffer.free(&device).unwrap();
        assert!(!buffer.is_allocated());
        assert_eq!(buffer.size_in_bytes(), 0);
        assert_eq!(device.allocation_count(), 0);
    }

    #[test]
    fn fresh_allocations_are_zeroed() {
        let device = HostDevice::new();
        let mut buffer = DeviceBuffer::new("zeroed");
        buffer.alloc(&device, 16).unwrap();
        let mut out = [0xffu8; 16];
        buffer.download(&device, &mut out).unwrap();
        assert_eq!(out, [0; 16]);
    }
}
