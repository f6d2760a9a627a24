//! Acceleration structure helpers for the Vulkan backend.
//!
//! The device interface hands out one traversable per triangle structure.
//! Vulkan only traces against top-level structures, so every bottom-level
//! structure is wrapped in a single-instance TLAS and the TLAS address serves
//! as the traversable handle.

use ash::vk;
use gpu_allocator::MemoryLocation;

use super::command::accel_write_barrier;
use super::context::VulkanContext;
use super::memory::GpuBuffer;
use crate::device::{AccelBuildOptions, TriangleArrayInput, INDEX_TRIPLE_STRIDE};
use crate::error::{GpuError, Result};

/// Top-level structure holding a single identity instance.
pub(crate) struct Tlas {
    pub acceleration_structure: vk::AccelerationStructureKHR,
    pub buffer: GpuBuffer,
    pub instance_buffer: GpuBuffer,
    pub device_address: vk::DeviceAddress,
}

/// Build flags for a bottom-level structure.
pub(crate) fn build_flags(options: &AccelBuildOptions) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut flags = vk::BuildAccelerationStructureFlagsKHR::empty();
    if options.prefer_fast_trace {
        flags |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
    }
    if options.allow_compaction {
        flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
    }
    flags
}

/// Describe a triangle array input as Vulkan geometry.
pub(crate) fn triangle_geometry(
    input: &TriangleArrayInput,
) -> Result<vk::AccelerationStructureGeometryKHR<'static>> {
    if input.num_sbt_records() != 1 {
        return Err(GpuError::AccelBuild(format!(
            "expected exactly one shading slot, got {}",
            input.num_sbt_records()
        )));
    }
    if input.index_stride != INDEX_TRIPLE_STRIDE {
        return Err(GpuError::AccelBuild(format!(
            "index triples must be tightly packed, got stride {}",
            input.index_stride
        )));
    }

    let slot = input.flags[0];
    let mut flags = vk::GeometryFlagsKHR::empty();
    if slot.disable_anyhit {
        flags |= vk::GeometryFlagsKHR::OPAQUE;
    }
    if slot.single_anyhit_call {
        flags |= vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION;
    }

    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
        .vertex_format(vk::Format::R32G32B32_SFLOAT)
        .vertex_data(vk::DeviceOrHostAddressConstKHR {
            device_address: input.vertex_buffer.as_u64(),
        })
        .vertex_stride(u64::from(input.vertex_stride))
        .max_vertex(input.num_vertices.saturating_sub(1))
        .index_type(vk::IndexType::UINT32)
        .index_data(vk::DeviceOrHostAddressConstKHR {
            device_address: input.index_buffer.as_u64(),
        });

    Ok(vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .flags(flags)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles }))
}

/// Create a bottom-level structure object over the start of `buffer`.
///
/// # Safety
/// The context must be valid and `buffer` must outlive the structure.
pub(crate) unsafe fn create_blas(
    ctx: &VulkanContext,
    buffer: &GpuBuffer,
    size: u64,
) -> Result<vk::AccelerationStructureKHR> {
    let create_info = vk::AccelerationStructureCreateInfoKHR::default()
        .buffer(buffer.buffer)
        .offset(0)
        .size(size)
        .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);

    Ok(ctx.as_loader.create_acceleration_structure(&create_info, None)?)
}

/// Wrap a built bottom-level structure in a single-instance TLAS.
///
/// # Safety
/// The context must be valid and `blas` fully built.
pub(crate) unsafe fn build_tlas(
    ctx: &VulkanContext,
    blas: vk::AccelerationStructureKHR,
) -> Result<Tlas> {
    let blas_address = ctx.as_loader.get_acceleration_structure_device_address(
        &vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(blas),
    );

    // Identity transform (row-major 3x4 matrix)
    let transform = vk::TransformMatrixKHR {
        matrix: [
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0,
        ],
    };

    let instance = vk::AccelerationStructureInstanceKHR {
        transform,
        instance_custom_index_and_mask: vk::Packed24_8::new(0, 0xFF),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
            0,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: blas_address,
        },
    };

    let instance_size = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>();
    let mut allocator = ctx.allocator.lock();

    let mut instance_buffer = allocator.create_buffer(
        instance_size as u64,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        MemoryLocation::CpuToGpu,
        "tlas_instance_buffer",
    )?;

    let bytes = std::slice::from_raw_parts(std::ptr::addr_of!(instance).cast::<u8>(), instance_size);
    if let Err(e) = instance_buffer.write_bytes(0, bytes) {
        allocator.free_buffer(&mut instance_buffer)?;
        return Err(e);
    }

    let geometry = vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .flags(vk::GeometryFlagsKHR::empty())
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: instance_buffer.address,
                }),
        });

    let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(std::slice::from_ref(&geometry));

    let mut build_sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    ctx.as_loader.get_acceleration_structure_build_sizes(
        vk::AccelerationStructureBuildTypeKHR::DEVICE,
        &build_info,
        &[1],
        &mut build_sizes,
    );

    let mut buffer = allocator.create_buffer(
        build_sizes.acceleration_structure_size,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
        MemoryLocation::GpuOnly,
        "tlas_buffer",
    )?;
    let mut scratch = allocator.create_buffer(
        build_sizes.build_scratch_size,
        vk::BufferUsageFlags::STORAGE_BUFFER,
        MemoryLocation::GpuOnly,
        "tlas_scratch_buffer",
    )?;
    drop(allocator);

    let create_info = vk::AccelerationStructureCreateInfoKHR::default()
        .buffer(buffer.buffer)
        .offset(0)
        .size(build_sizes.acceleration_structure_size)
        .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL);
    let acceleration_structure = ctx.as_loader.create_acceleration_structure(&create_info, None)?;

    build_info = build_info
        .dst_acceleration_structure(acceleration_structure)
        .scratch_data(vk::DeviceOrHostAddressKHR {
            device_address: scratch.address,
        });

    let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(1);

    let result = ctx.submit_and_wait(|cmd| {
        ctx.as_loader.cmd_build_acceleration_structures(
            cmd,
            std::slice::from_ref(&build_info),
            &[std::slice::from_ref(&build_range)],
        );
    });

    let mut allocator = ctx.allocator.lock();
    allocator.free_buffer(&mut scratch)?;
    if let Err(e) = result {
        ctx.as_loader
            .destroy_acceleration_structure(acceleration_structure, None);
        allocator.free_buffer(&mut buffer)?;
        allocator.free_buffer(&mut instance_buffer)?;
        return Err(e);
    }

    let device_address = ctx.as_loader.get_acceleration_structure_device_address(
        &vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(acceleration_structure),
    );

    Ok(Tlas {
        acceleration_structure,
        buffer,
        instance_buffer,
        device_address,
    })
}

/// Record a bottom-level build, optionally followed by a compacted size query
/// copied into `emit` (buffer, offset).
///
/// # Safety
/// The command buffer must be in recording state and every handle valid.
pub(crate) unsafe fn record_blas_build(
    ctx: &VulkanContext,
    cmd: vk::CommandBuffer,
    build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
    primitive_count: u32,
    emit: Option<(vk::QueryPool, vk::Buffer, u64)>,
) {
    let build_range =
        vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(primitive_count);

    if let Some((pool, _, _)) = emit {
        ctx.device.cmd_reset_query_pool(cmd, pool, 0, 1);
    }

    ctx.as_loader.cmd_build_acceleration_structures(
        cmd,
        std::slice::from_ref(build_info),
        &[std::slice::from_ref(&build_range)],
    );

    if let Some((pool, buffer, offset)) = emit {
        accel_write_barrier(&ctx.device, cmd);
        ctx.as_loader.cmd_write_acceleration_structures_properties(
            cmd,
            &[build_info.dst_acceleration_structure],
            vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
            pool,
            0,
        );
        ctx.device.cmd_copy_query_pool_results(
            cmd,
            pool,
            0,
            1,
            buffer,
            offset,
            std::mem::size_of::<u64>() as u64,
            vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
        );
    }
}

/// Destroy a TLAS and its buffers.
///
/// # Safety
/// The TLAS must not be in use.
pub(crate) unsafe fn destroy_tlas(ctx: &VulkanContext, mut tlas: Tlas) -> Result<()> {
    ctx.as_loader
        .destroy_acceleration_structure(tlas.acceleration_structure, None);
    let mut allocator = ctx.allocator.lock();
    allocator.free_buffer(&mut tlas.buffer)?;
    allocator.free_buffer(&mut tlas.instance_buffer)?;
    Ok(())
}
