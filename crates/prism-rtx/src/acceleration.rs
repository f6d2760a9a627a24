//! Acceleration structure construction.
//!
//! The scene is one merged triangle mesh. Its geometry is uploaded once, built
//! into a bottom-level structure with compaction enabled and then compacted
//! into a buffer of exactly the reported size. Only the compacted structure
//! and the geometry buffers outlive the build.

use prism_core::{Aabb, TriangleMesh};
use prism_gpu::{
    AccelBuildOptions, DeviceBuffer, DevicePtr, RayTracingDevice, TraversableHandle,
    TriangleArrayInput,
};

use crate::error::Result;

/// Compacted acceleration structure over the scene mesh.
#[derive(Debug)]
pub struct AccelerationStructure {
    handle: TraversableHandle,
    /// Backing memory of the compacted structure.
    buffer: DeviceBuffer,
    vertex_buffer: DeviceBuffer,
    index_buffer: DeviceBuffer,
    triangle_count: u32,
    bounds: Aabb,
}

impl AccelerationStructure {
    /// Upload `mesh` and build a compacted structure over it.
    ///
    /// Blocks until the device has finished the build and the compaction.
    pub fn build<D: RayTracingDevice + ?Sized>(device: &D, mesh: &TriangleMesh) -> Result<Self> {
        mesh.validate()?;
        if mesh.is_empty() {
            return Err(prism_core::Error::InvalidData("scene has no triangles".to_string()).into());
        }

        // 1. Upload geometry
        let mut vertex_buffer = DeviceBuffer::new("scene_vertices");
        vertex_buffer.alloc_and_upload(device, &mesh.vertices)?;
        let mut index_buffer = DeviceBuffer::new("scene_indices");
        index_buffer.alloc_and_upload(device, &mesh.indices)?;

        // 2. One triangle input, one shading slot, compaction enabled
        let input = TriangleArrayInput::packed(
            vertex_buffer.device_ptr(),
            mesh.vertex_count() as u32,
            index_buffer.device_ptr(),
            mesh.triangle_count() as u32,
        );
        let options = AccelBuildOptions {
            allow_compaction: true,
            prefer_fast_trace: true,
        };

        // 3. Size and allocate build buffers
        let sizes = device.accel_compute_memory_usage(&options, &input)?;
        let mut temp_buffer = DeviceBuffer::new("accel_temp");
        temp_buffer.alloc(device, sizes.temp_size_in_bytes)?;
        let mut output_buffer = DeviceBuffer::new("accel_uncompacted");
        output_buffer.alloc(device, sizes.output_size_in_bytes)?;
        let mut compacted_size_buffer = DeviceBuffer::new("accel_compacted_size");
        compacted_size_buffer.alloc(device, std::mem::size_of::<u64>() as u64)?;

        // 4. Build, emitting the compacted size
        let uncompacted = device.accel_build(
            &options,
            &input,
            temp_buffer.require_raw()?,
            output_buffer.require_raw()?,
            Some(compacted_size_buffer.device_ptr()),
        )?;

        // 5. Wait and read the compacted size back
        device.synchronize()?;
        let mut compacted_size = [0u64; 1];
        compacted_size_buffer.download(device, &mut compacted_size)?;
        let compacted_size = compacted_size[0];

        // 6. Compact into an exactly sized buffer
        let mut buffer = DeviceBuffer::new("accel_compacted");
        buffer.alloc(device, compacted_size)?;
        let handle = device.accel_compact(uncompacted, buffer.require_raw()?)?;
        device.synchronize()?;

        // 7. Release everything the build needed
        device.accel_destroy(uncompacted)?;
        output_buffer.free(device)?;
        temp_buffer.free(device)?;
        compacted_size_buffer.free(device)?;

        tracing::info!(
            "Built acceleration structure: {} triangles, {} of {} bytes after compaction",
            mesh.triangle_count(),
            compacted_size,
            sizes.output_size_in_bytes
        );

        Ok(Self {
            handle,
            buffer,
            vertex_buffer,
            index_buffer,
            triangle_count: mesh.triangle_count() as u32,
            bounds: mesh.bounds(),
        })
    }

    /// Traversable handle of the compacted structure.
    #[must_use]
    pub const fn handle(&self) -> TraversableHandle {
        self.handle
    }

    /// Size of the compacted structure.
    #[must_use]
    pub fn compacted_size(&self) -> u64 {
        self.buffer.size_in_bytes()
    }

    /// Device address of the uploaded vertex positions.
    #[must_use]
    pub fn vertex_ptr(&self) -> DevicePtr {
        self.vertex_buffer.device_ptr()
    }

    /// Device address of the uploaded index triples.
    #[must_use]
    pub fn index_ptr(&self) -> DevicePtr {
        self.index_buffer.device_ptr()
    }

    #[must_use]
    pub const fn triangle_count(&self) -> u32 {
        self.triangle_count
    }

    /// Bounds of the scene geometry.
    #[must_use]
    pub const fn bounds(&self) -> Aabb {
        self.bounds
    }

    /// Destroy the structure and free its buffers.
    ///
    /// Calling this twice is harmless.
    pub fn destroy<D: RayTracingDevice + ?Sized>(&mut self, device: &D) -> Result<()> {
        let forget = if self.buffer.is_allocated() {
            let result = device.accel_destroy(self.handle);
            self.handle = TraversableHandle::NULL;
            result
        } else {
            Ok(())
        };
        let results = [
            forget,
            self.buffer.free(device),
            self.index_buffer.free(device),
            self.vertex_buffer.free(device),
        ];
        results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec3;
    use prism_host::HostDevice;

    fn scene() -> TriangleMesh {
        let mut mesh = TriangleMesh::new();
        mesh.add_cube(Vec3::new(0.0, -1.5, 0.0), Vec3::new(10.0, 0.1, 10.0));
        mesh.add_cube(Vec3::ZERO, Vec3::splat(2.0));
        mesh
    }

    #[test]
    fn build_leaves_only_compacted_and_geometry_buffers() {
        let device = HostDevice::new();
        let accel = AccelerationStructure::build(&device, &scene()).unwrap();

        assert!(!accel.handle().is_null());
        assert_eq!(accel.triangle_count(), 24);
        assert!(accel.compacted_size() > 0);
        assert_eq!(device.allocation_count(), 3);
        assert_eq!(device.traversable_count(), 1);
        let bounds = accel.bounds();
        assert_relative_eq!(bounds.min.y, -1.55, epsilon = 1e-5);
        assert_relative_eq!(bounds.max.x, 5.0, epsilon = 1e-5);
    }

    #[test]
    fn compacted_size_is_below_worst_case() {
        let device = HostDevice::new();
        let mesh = scene();
        let accel = AccelerationStructure::build(&device, &mesh).unwrap();

        let input = TriangleArrayInput::packed(
            accel.vertex_ptr(),
            mesh.vertex_count() as u32,
            accel.index_ptr(),
            mesh.triangle_count() as u32,
        );
        let sizes = device
            .accel_compute_memory_usage(&AccelBuildOptions::default(), &input)
            .unwrap();
        assert!(accel.compacted_size() <= sizes.output_size_in_bytes);
    }

    #[test]
    fn geometry_stays_resident() {
        let device = HostDevice::new();
        let mesh = scene();
        let accel = AccelerationStructure::build(&device, &mesh).unwrap();

        let mut first = [0f32; 3];
        device
            .read(accel.vertex_ptr(), bytemuck::cast_slice_mut(&mut first))
            .unwrap();
        assert_eq!(Vec3::from(first), mesh.vertices[0]);
    }

    #[test]
    fn destroy_releases_everything() {
        let device = HostDevice::new();
        let mut accel = AccelerationStructure::build(&device, &scene()).unwrap();
        accel.destroy(&device).unwrap();
        accel.destroy(&device).unwrap();

        assert_eq!(device.allocation_count(), 0);
        assert_eq!(device.traversable_count(), 0);
        assert!(accel.handle().is_null());
    }

    #[test]
    fn rejects_empty_and_invalid_meshes() {
        let device = HostDevice::new();
        assert!(AccelerationStructure::build(&device, &TriangleMesh::new()).is_err());

        let mut mesh = scene();
        mesh.indices.push(glam::UVec3::new(0, 1, 99));
        assert!(AccelerationStructure::build(&device, &mesh).is_err());
        assert_eq!(device.allocation_count(), 0);
    }
}
