//! Shader binding table construction.
//!
//! Every record is a device-written header followed by a stage payload:
//! - Ray generation: empty placeholder
//! - Miss: empty placeholder
//! - Hit group: vertex and index addresses plus the mesh color
//!
//! Each stage gets its own device buffer. Record strides are the header plus
//! payload rounded up to the device's record alignment.

use bytemuck::Pod;
use glam::Vec3;
use prism_gpu::{
    DeviceBuffer, GpuError, ProgramGroupHandle, RayTracingDevice, SbtRecordLayout,
    ShaderBindingTable,
};
use prism_shaders::abi::{EmptyRecordData, HitgroupData};

use crate::acceleration::AccelerationStructure;
use crate::error::Result;
use crate::pipeline::ProgramGroups;

/// Header size the record payloads are laid out after.
pub const RECORD_HEADER_SIZE: usize = 32;

const _: () = assert!(std::mem::size_of::<EmptyRecordData>() == 8);
const _: () = assert!(std::mem::size_of::<HitgroupData>() == 32);

/// Round `value` up to a power-of-two `alignment`.
const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Check the device's record layout against the one the payloads assume.
fn check_layout(layout: SbtRecordLayout) -> Result<()> {
    if layout.header_size != RECORD_HEADER_SIZE {
        return Err(GpuError::RecordLayout(format!(
            "device record header is {} bytes, payloads are laid out after {RECORD_HEADER_SIZE}",
            layout.header_size
        ))
        .into());
    }
    if !layout.record_alignment.is_power_of_two() {
        return Err(GpuError::RecordLayout(format!(
            "record alignment {} is not a power of two",
            layout.record_alignment
        ))
        .into());
    }
    Ok(())
}

/// Record stride for a payload of type `T`.
#[must_use]
pub const fn record_stride<T>(layout: SbtRecordLayout) -> usize {
    align_up(
        layout.header_size + std::mem::size_of::<T>(),
        layout.record_alignment,
    )
}

/// Pack one record: header from the device, then `payload`, then zero padding.
fn pack_record<D, T>(
    device: &D,
    layout: SbtRecordLayout,
    group: ProgramGroupHandle,
    payload: &T,
) -> Result<Vec<u8>>
where
    D: RayTracingDevice + ?Sized,
    T: Pod,
{
    let stride = record_stride::<T>(layout);
    let mut record = vec![0u8; stride];
    let (header, rest) = record.split_at_mut(layout.header_size);
    device.sbt_record_pack_header(group, header)?;
    rest[..std::mem::size_of::<T>()].copy_from_slice(bytemuck::bytes_of(payload));
    Ok(record)
}

/// Device-resident records of every stage and the table describing them.
#[derive(Debug)]
pub struct DispatchTable {
    raygen_records: DeviceBuffer,
    miss_records: DeviceBuffer,
    hitgroup_records: DeviceBuffer,
    table: ShaderBindingTable,
}

impl DispatchTable {
    /// Pack and upload one record per program group.
    ///
    /// The hit group record points at the geometry buffers of `accel` and
    /// carries `color`.
    pub fn build<D: RayTracingDevice + ?Sized>(
        device: &D,
        groups: &ProgramGroups,
        accel: &AccelerationStructure,
        color: Vec3,
    ) -> Result<Self> {
        let layout = device.sbt_record_layout();
        check_layout(layout)?;

        let empty = EmptyRecordData::default();
        let mut raygen_records = DeviceBuffer::new("sbt_raygen");
        raygen_records.alloc_and_upload(device, &pack_record(device, layout, groups.raygen, &empty)?)?;

        let mut miss_records = DeviceBuffer::new("sbt_miss");
        miss_records.alloc_and_upload(device, &pack_record(device, layout, groups.miss, &empty)?)?;

        let hit_data = HitgroupData::new(
            accel.vertex_ptr().as_u64(),
            accel.index_ptr().as_u64(),
            color.to_array(),
        );
        let mut hitgroup_records = DeviceBuffer::new("sbt_hitgroup");
        hitgroup_records.alloc_and_upload(
            device,
            &pack_record(device, layout, groups.hitgroup, &hit_data)?,
        )?;

        let table = ShaderBindingTable {
            raygen_record: raygen_records.device_ptr(),
            miss_record_base: miss_records.device_ptr(),
            miss_record_stride_in_bytes: record_stride::<EmptyRecordData>(layout) as u32,
            miss_record_count: 1,
            hitgroup_record_base: hitgroup_records.device_ptr(),
            hitgroup_record_stride_in_bytes: record_stride::<HitgroupData>(layout) as u32,
            hitgroup_record_count: 1,
        };
        tracing::debug!(
            "Shader binding table: miss stride {}, hit group stride {}",
            table.miss_record_stride_in_bytes,
            table.hitgroup_record_stride_in_bytes
        );

        Ok(Self {
            raygen_records,
            miss_records,
            hitgroup_records,
            table,
        })
    }

    /// Table handed to every launch.
    #[must_use]
    pub const fn table(&self) -> &ShaderBindingTable {
        &self.table
    }

    /// Free the record buffers.
    pub fn destroy<D: RayTracingDevice + ?Sized>(&mut self, device: &D) -> Result<()> {
        let results = [
            self.raygen_records.free(device),
            self.miss_records.free(device),
            self.hitgroup_records.free(device),
        ];
        self.table = ShaderBindingTable::default();
        results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RendererConfig;
    use crate::pipeline::RayTracingPipeline;
    use prism_core::TriangleMesh;
    use prism_host::HostDevice;
    use prism_shaders::ProgramBlob;

    #[test]
    fn align_up_test() {
        assert_eq!(align_up(40, 16), 48);
        assert_eq!(align_up(64, 16), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(1, 4), 4);
    }

    #[test]
    fn strides_follow_layout() {
        let host = SbtRecordLayout {
            header_size: 32,
            record_alignment: 16,
        };
        assert_eq!(record_stride::<EmptyRecordData>(host), 48);
        assert_eq!(record_stride::<HitgroupData>(host), 64);

        let wide = SbtRecordLayout {
            header_size: 32,
            record_alignment: 64,
        };
        assert_eq!(record_stride::<EmptyRecordData>(wide), 64);
    }

    #[test]
    fn mismatched_header_is_a_layout_error() {
        let layout = SbtRecordLayout {
            header_size: 16,
            record_alignment: 16,
        };
        assert!(matches!(
            check_layout(layout),
            Err(crate::RenderError::Gpu(GpuError::RecordLayout(_)))
        ));
    }

    #[test]
    fn records_carry_headers_and_payloads() {
        let device = HostDevice::new();
        let mut mesh = TriangleMesh::new().with_color(Vec3::new(0.2, 0.8, 0.2));
        mesh.add_cube(Vec3::ZERO, Vec3::splat(2.0));
        let accel = AccelerationStructure::build(&device, &mesh).unwrap();
        let pipeline = RayTracingPipeline::assemble(
            &device,
            &RendererConfig::default(),
            &ProgramBlob::host_reference(),
        )
        .unwrap();

        let mut dispatch = DispatchTable::build(&device, pipeline.groups(), &accel, mesh.color).unwrap();
        let table = *dispatch.table();
        assert_eq!(table.miss_record_count, 1);
        assert_eq!(table.hitgroup_record_stride_in_bytes, 64);

        let mut record = [0u8; 64];
        device.read(table.hitgroup_record_base, &mut record).unwrap();
        let mut expected_header = [0u8; RECORD_HEADER_SIZE];
        device
            .sbt_record_pack_header(pipeline.groups().hitgroup, &mut expected_header)
            .unwrap();
        assert_eq!(&record[..RECORD_HEADER_SIZE], &expected_header[..]);

        let data: HitgroupData = bytemuck::pod_read_unaligned(&record[RECORD_HEADER_SIZE..]);
        assert_eq!(data.vertex, accel.vertex_ptr().as_u64());
        assert_eq!(data.index, accel.index_ptr().as_u64());
        assert_eq!(data.color, [0.2, 0.8, 0.2]);

        let before = device.allocation_count();
        dispatch.destroy(&device).unwrap();
        assert_eq!(device.allocation_count(), before - 3);
        assert!(dispatch.table().raygen_record.is_null());
    }
}
