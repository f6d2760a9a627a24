//! [`RayTracingDevice`] implementation running on the CPU.

use std::sync::atomic::{AtomicU64, Ordering};

use glam::Vec3;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use prism_gpu::{
    AccelBufferSizes, AccelBuildOptions, BufferId, DevicePtr, GpuError, LaunchDims,
    ModuleCompileOptions, ModuleHandle, PipelineCompileOptions, PipelineHandle,
    PipelineLinkOptions, ProgramGroupDesc, ProgramGroupHandle, ProgramGroupKind, RawBuffer,
    RayTracingDevice, Result, SbtRecordLayout, ShaderBindingTable, StackSizes, TraversableHandle,
    TriangleArrayInput, INDEX_TRIPLE_STRIDE, VERTEX_STRIDE,
};
use prism_shaders::LaunchParams;
use rayon::prelude::*;

use crate::bvh::{self, Bvh, BvhView};
use crate::memory::HostMemory;
use crate::programs::{BoundGroup, Manifest};
use crate::shading::{HitRecord, LaunchContext, ProgramRecord, ResolvedSbt, RowOutput};

/// Bytes of device-written header at the start of every record.
pub const SBT_HEADER_SIZE: usize = 32;
/// Alignment of record bases and strides.
pub const SBT_RECORD_ALIGNMENT: usize = 16;

/// Header bytes: group id, then group kind.
const HEADER_GROUP_RANGE: std::ops::Range<usize> = 0..8;
const HEADER_KIND_RANGE: std::ops::Range<usize> = 8..12;

/// Launch counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostStats {
    pub launches: u64,
    pub rays_traced: u64,
}

#[derive(Debug)]
struct Traversable {
    buffer: BufferId,
    size: u64,
}

#[derive(Debug)]
struct Pipeline {
    groups: HashSet<u64>,
    max_trace_depth: u32,
    stack_sizes: Option<StackSizes>,
}

#[derive(Debug, Default)]
struct Registry {
    modules: HashMap<u64, Manifest>,
    groups: HashMap<u64, BoundGroup>,
    pipelines: HashMap<u64, Pipeline>,
    /// Keyed by the address of the structure.
    traversables: HashMap<u64, Traversable>,
    next_id: u64,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// CPU device: device memory is host memory, built-in programs run on the
/// `rayon` thread pool.
///
/// Lock order: registry, then memory.
pub struct HostDevice {
    memory: RwLock<HostMemory>,
    registry: Mutex<Registry>,
    launches: AtomicU64,
    rays_traced: AtomicU64,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    #[must_use]
    pub fn new() -> Self {
        Self {
            memory: RwLock::new(HostMemory::new()),
            registry: Mutex::new(Registry::default()),
            launches: AtomicU64::new(0),
            rays_traced: AtomicU64::new(0),
        }
    }

    /// Launch counters since creation.
    #[must_use]
    pub fn stats(&self) -> HostStats {
        HostStats {
            launches: self.launches.load(Ordering::Relaxed),
            rays_traced: self.rays_traced.load(Ordering::Relaxed),
        }
    }

    /// Number of live allocations.
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.memory.read().allocation_count()
    }

    /// Bytes held by live allocations.
    #[must_use]
    pub fn bytes_allocated(&self) -> u64 {
        self.memory.read().bytes_allocated()
    }

    /// Number of live traversables.
    #[must_use]
    pub fn traversable_count(&self) -> usize {
        self.registry.lock().traversables.len()
    }

    /// Number of live modules, program groups and pipelines.
    #[must_use]
    pub fn program_object_count(&self) -> usize {
        let registry = self.registry.lock();
        registry.modules.len() + registry.groups.len() + registry.pipelines.len()
    }

    /// Stack sizes last set on `pipeline`.
    #[must_use]
    pub fn pipeline_stack_sizes(&self, pipeline: PipelineHandle) -> Option<StackSizes> {
        self.registry
            .lock()
            .pipelines
            .get(&pipeline.as_raw())
            .and_then(|p| p.stack_sizes)
    }

    /// Read the triangles of a build input out of device memory.
    fn gather_triangles(memory: &HostMemory, input: &TriangleArrayInput) -> Result<Vec<[Vec3; 3]>> {
        (0..u64::from(input.num_index_triplets))
            .map(|i| -> Result<[Vec3; 3]> {
                let triple: [u32; 3] = memory
                    .read_pod(input.index_buffer.offset(i * u64::from(input.index_stride)))?;
                let mut corners = [Vec3::ZERO; 3];
                for (corner, &vertex) in corners.iter_mut().zip(&triple) {
                    if vertex >= input.num_vertices {
                        return Err(GpuError::AccelBuild(format!(
                            "triangle {i} references vertex {vertex} of {}",
                            input.num_vertices
                        )));
                    }
                    let position: [f32; 3] = memory.read_pod(
                        input
                            .vertex_buffer
                            .offset(u64::from(vertex) * u64::from(input.vertex_stride)),
                    )?;
                    *corner = Vec3::from(position);
                }
                Ok(corners)
            })
            .collect()
    }

    fn check_input(input: &TriangleArrayInput) -> Result<()> {
        if input.num_sbt_records() != 1 {
            return Err(GpuError::AccelBuild(format!(
                "expected exactly one shading slot, got {}",
                input.num_sbt_records()
            )));
        }
        if input.vertex_stride < VERTEX_STRIDE || input.index_stride < INDEX_TRIPLE_STRIDE {
            return Err(GpuError::AccelBuild(format!(
                "strides too small: vertex {} index {}",
                input.vertex_stride, input.index_stride
            )));
        }
        let null_buffer = input.vertex_buffer.is_null() || input.index_buffer.is_null();
        if input.num_index_triplets > 0 && null_buffer {
            return Err(GpuError::AccelBuild("null geometry buffer".to_string()));
        }
        Ok(())
    }

    /// Resolve every record header of `sbt` against the pipeline's groups.
    fn resolve_sbt(
        registry: &Registry,
        memory: &HostMemory,
        pipeline: &Pipeline,
        sbt: &ShaderBindingTable,
    ) -> Result<ResolvedSbt> {
        let launch_error = GpuError::Launch;
        let group_at = |record: DevicePtr| -> Result<BoundGroup> {
            if record.as_u64() % SBT_RECORD_ALIGNMENT as u64 != 0 {
                return Err(launch_error(format!(
                    "record {record} is not {SBT_RECORD_ALIGNMENT}-byte aligned"
                )));
            }
            let header = memory.slice(record, SBT_HEADER_SIZE)?;
            let id = u64::from_le_bytes(header[HEADER_GROUP_RANGE].try_into().unwrap_or_default());
            if !pipeline.groups.contains(&id) {
                return Err(launch_error(format!(
                    "record {record} holds a group outside the pipeline"
                )));
            }
            registry
                .groups
                .get(&id)
                .copied()
                .ok_or_else(|| launch_error(format!("record {record} holds a destroyed group")))
        };
        let records = |base: DevicePtr, stride: u32, count: u32| -> Result<Vec<DevicePtr>> {
            if count > 0 && (stride as usize) < SBT_HEADER_SIZE {
                return Err(launch_error(format!("record stride {stride} below header size")));
            }
            if stride as usize % SBT_RECORD_ALIGNMENT != 0 {
                return Err(launch_error(format!("record stride {stride} is not aligned")));
            }
            Ok((0..u64::from(count))
                .map(|i| base.offset(i * u64::from(stride)))
                .collect())
        };
        let payload = |record: DevicePtr| record.offset(SBT_HEADER_SIZE as u64);

        let raygen = match group_at(sbt.raygen_record)? {
            BoundGroup::Raygen(program) => ProgramRecord {
                program,
                data: payload(sbt.raygen_record),
            },
            other => {
                return Err(launch_error(format!(
                    "{:?} group in the raygen record",
                    other.kind()
                )))
            }
        };

        let miss_records = records(
            sbt.miss_record_base,
            sbt.miss_record_stride_in_bytes,
            sbt.miss_record_count,
        )?;
        let mut miss = Vec::with_capacity(miss_records.len());
        for record in miss_records {
            match group_at(record)? {
                BoundGroup::Miss(program) => miss.push(ProgramRecord {
                    program,
                    data: payload(record),
                }),
                other => {
                    return Err(launch_error(format!(
                        "{:?} group in a miss record",
                        other.kind()
                    )))
                }
            }
        }

        let hit_records = records(
            sbt.hitgroup_record_base,
            sbt.hitgroup_record_stride_in_bytes,
            sbt.hitgroup_record_count,
        )?;
        let mut hitgroups = Vec::with_capacity(hit_records.len());
        for record in hit_records {
            match group_at(record)? {
                BoundGroup::Hitgroup {
                    closest_hit,
                    any_hit,
                } => hitgroups.push(HitRecord {
                    closest_hit,
                    any_hit,
                    data: payload(record),
                }),
                other => {
                    return Err(launch_error(format!(
                        "{:?} group in a hit group record",
                        other.kind()
                    )))
                }
            }
        }

        Ok(ResolvedSbt {
            raygen,
            miss,
            hitgroups,
        })
    }
}

impl RayTracingDevice for HostDevice {
    fn name(&self) -> &str {
        "host reference device"
    }

    fn alloc(&self, bytes: u64, label: &str) -> Result<RawBuffer> {
        self.memory.write().alloc(bytes, label)
    }

    fn free(&self, buffer: RawBuffer) -> Result<()> {
        let mut registry = self.registry.lock();
        self.memory.write().free(buffer)?;
        registry.traversables.retain(|address, traversable| {
            let keep = traversable.buffer != buffer.id;
            if !keep {
                tracing::debug!("Releasing traversable {address:#x} with its buffer");
            }
            keep
        });
        Ok(())
    }

    fn write(&self, dst: DevicePtr, data: &[u8]) -> Result<()> {
        self.memory.write().write(dst, data)
    }

    fn read(&self, src: DevicePtr, out: &mut [u8]) -> Result<()> {
        self.memory.read().read(src, out)
    }

    fn accel_compute_memory_usage(
        &self,
        _options: &AccelBuildOptions,
        input: &TriangleArrayInput,
    ) -> Result<AccelBufferSizes> {
        Self::check_input(input)?;
        Ok(AccelBufferSizes {
            output_size_in_bytes: bvh::worst_case_size(input.num_index_triplets),
            temp_size_in_bytes: bvh::temp_size(input.num_index_triplets),
        })
    }

    fn accel_build(
        &self,
        options: &AccelBuildOptions,
        input: &TriangleArrayInput,
        temp: &RawBuffer,
        output: &RawBuffer,
        emit_compacted_size: Option<DevicePtr>,
    ) -> Result<TraversableHandle> {
        let required = self.accel_compute_memory_usage(options, input)?;
        if temp.size < required.temp_size_in_bytes || output.size < required.output_size_in_bytes {
            return Err(GpuError::AccelBuild(format!(
                "buffers too small: temp {} < {} or output {} < {}",
                temp.size, required.temp_size_in_bytes, output.size, required.output_size_in_bytes
            )));
        }
        if emit_compacted_size.is_some() && !options.allow_compaction {
            return Err(GpuError::AccelBuild(
                "compacted size requested without allowing compaction".to_string(),
            ));
        }

        let mut registry = self.registry.lock();
        let mut memory = self.memory.write();
        if !memory.is_live(temp) || !memory.is_live(output) {
            return Err(GpuError::InvalidHandle("build buffer was freed".to_string()));
        }

        let triangles = Self::gather_triangles(&memory, input)?;
        let bvh = Bvh::build(&triangles);
        let bytes = bvh.serialize(&triangles);
        memory.write(output.ptr, &bytes)?;
        if let Some(emit) = emit_compacted_size {
            memory.write(emit, &bvh.serialized_size().to_le_bytes())?;
        }

        tracing::debug!(
            "Built BVH: {} triangles, {} nodes, {} of {} bytes used",
            triangles.len(),
            bvh.nodes().len(),
            bytes.len(),
            output.size
        );

        registry.traversables.insert(
            output.ptr.as_u64(),
            Traversable {
                buffer: output.id,
                size: bytes.len() as u64,
            },
        );
        Ok(TraversableHandle(output.ptr.as_u64()))
    }

    fn accel_compact(
        &self,
        source: TraversableHandle,
        output: &RawBuffer,
    ) -> Result<TraversableHandle> {
        let mut registry = self.registry.lock();
        let size = registry
            .traversables
            .get(&source.0)
            .map(|t| t.size)
            .ok_or_else(|| GpuError::InvalidHandle(format!("traversable {:#x}", source.0)))?;
        if output.size < size {
            return Err(GpuError::AccelBuild(format!(
                "compaction target holds {} bytes, structure needs {size}",
                output.size
            )));
        }

        let mut memory = self.memory.write();
        if !memory.is_live(output) {
            return Err(GpuError::InvalidHandle("compaction buffer was freed".to_string()));
        }
        let bytes = memory.slice(DevicePtr(source.0), size as usize)?.to_vec();
        memory.write(output.ptr, &bytes)?;

        registry.traversables.insert(
            output.ptr.as_u64(),
            Traversable {
                buffer: output.id,
                size,
            },
        );
        tracing::debug!("Compacted traversable {:#x} into {size} bytes", source.0);
        Ok(TraversableHandle(output.ptr.as_u64()))
    }

    fn accel_destroy(&self, handle: TraversableHandle) -> Result<()> {
        self.registry
            .lock()
            .traversables
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| GpuError::InvalidHandle(format!("traversable {:#x}", handle.0)))
    }

    fn module_create(
        &self,
        module_options: &ModuleCompileOptions,
        pipeline_options: &PipelineCompileOptions,
        blob: &[u8],
    ) -> Result<(ModuleHandle, String)> {
        let compile_error = |log: String| GpuError::ModuleCompilation {
            message: "host program manifest rejected".to_string(),
            log,
        };
        let manifest = Manifest::parse(blob).map_err(compile_error)?;
        manifest.check_options(pipeline_options).map_err(compile_error)?;

        let log = format!(
            "host manifest: {} entry points bound to '{}' (register budget {} ignored)",
            manifest.entries.len(),
            manifest.params_symbol,
            module_options.max_register_count
        );

        let mut registry = self.registry.lock();
        let id = registry.next_id();
        registry.modules.insert(id, manifest);
        Ok((ModuleHandle::from_raw(id), log))
    }

    fn module_destroy(&self, module: ModuleHandle) -> Result<()> {
        self.registry
            .lock()
            .modules
            .remove(&module.as_raw())
            .map(|_| ())
            .ok_or_else(|| GpuError::InvalidHandle(format!("module {}", module.as_raw())))
    }

    fn program_group_create(&self, desc: &ProgramGroupDesc) -> Result<(ProgramGroupHandle, String)> {
        let mut registry = self.registry.lock();
        let manifest = registry
            .modules
            .get(&desc.module().as_raw())
            .ok_or_else(|| GpuError::InvalidHandle(format!("module {}", desc.module().as_raw())))?;

        let group = BoundGroup::bind(desc, manifest).map_err(|log| GpuError::ProgramGroupCreation {
            message: format!("cannot bind {:?} group", desc.kind()),
            log,
        })?;

        let id = registry.next_id();
        registry.groups.insert(id, group);
        Ok((ProgramGroupHandle::from_raw(id), String::new()))
    }

    fn program_group_destroy(&self, group: ProgramGroupHandle) -> Result<()> {
        self.registry
            .lock()
            .groups
            .remove(&group.as_raw())
            .map(|_| ())
            .ok_or_else(|| GpuError::InvalidHandle(format!("program group {}", group.as_raw())))
    }

    fn pipeline_create(
        &self,
        _pipeline_options: &PipelineCompileOptions,
        link_options: &PipelineLinkOptions,
        groups: &[ProgramGroupHandle],
    ) -> Result<(PipelineHandle, String)> {
        let mut registry = self.registry.lock();

        let mut kinds = Vec::with_capacity(groups.len());
        for group in groups {
            let bound = registry.groups.get(&group.as_raw()).ok_or_else(|| {
                GpuError::InvalidHandle(format!("program group {}", group.as_raw()))
            })?;
            kinds.push(bound.kind());
        }
        if !kinds.contains(&ProgramGroupKind::Raygen) {
            return Err(GpuError::PipelineCreation {
                message: "pipeline has no ray generation group".to_string(),
                log: format!("linked groups: {kinds:?}"),
            });
        }

        let log = format!(
            "linked {} groups, max trace depth {}",
            groups.len(),
            link_options.max_trace_depth
        );
        let id = registry.next_id();
        registry.pipelines.insert(
            id,
            Pipeline {
                groups: groups.iter().map(|g| g.as_raw()).collect(),
                max_trace_depth: link_options.max_trace_depth,
                stack_sizes: None,
            },
        );
        Ok((PipelineHandle::from_raw(id), log))
    }

    fn pipeline_set_stack_size(&self, pipeline: PipelineHandle, sizes: &StackSizes) -> Result<()> {
        let mut registry = self.registry.lock();
        let entry = registry
            .pipelines
            .get_mut(&pipeline.as_raw())
            .ok_or_else(|| GpuError::InvalidHandle(format!("pipeline {}", pipeline.as_raw())))?;
        if sizes.max_traversable_graph_depth == 0 {
            return Err(GpuError::InvalidState(
                "traversable graph depth must be at least 1".to_string(),
            ));
        }
        entry.stack_sizes = Some(*sizes);
        Ok(())
    }

    fn pipeline_destroy(&self, pipeline: PipelineHandle) -> Result<()> {
        self.registry
            .lock()
            .pipelines
            .remove(&pipeline.as_raw())
            .map(|_| ())
            .ok_or_else(|| GpuError::InvalidHandle(format!("pipeline {}", pipeline.as_raw())))
    }

    fn sbt_record_layout(&self) -> SbtRecordLayout {
        SbtRecordLayout {
            header_size: SBT_HEADER_SIZE,
            record_alignment: SBT_RECORD_ALIGNMENT,
        }
    }

    fn sbt_record_pack_header(&self, group: ProgramGroupHandle, header: &mut [u8]) -> Result<()> {
        if header.len() != SBT_HEADER_SIZE {
            return Err(GpuError::RecordLayout(format!(
                "header slice of {} bytes, expected {SBT_HEADER_SIZE}",
                header.len()
            )));
        }
        let registry = self.registry.lock();
        let bound = registry
            .groups
            .get(&group.as_raw())
            .ok_or_else(|| GpuError::InvalidHandle(format!("program group {}", group.as_raw())))?;

        let kind: u32 = match bound.kind() {
            ProgramGroupKind::Raygen => 1,
            ProgramGroupKind::Miss => 2,
            ProgramGroupKind::Hitgroup => 3,
        };
        header.fill(0);
        header[HEADER_GROUP_RANGE].copy_from_slice(&group.as_raw().to_le_bytes());
        header[HEADER_KIND_RANGE].copy_from_slice(&kind.to_le_bytes());
        Ok(())
    }

    fn launch(
        &self,
        pipeline: PipelineHandle,
        params: DevicePtr,
        params_size: usize,
        sbt: &ShaderBindingTable,
        dims: LaunchDims,
    ) -> Result<()> {
        if params_size != std::mem::size_of::<LaunchParams>() {
            return Err(GpuError::Launch(format!(
                "parameter block of {params_size} bytes, programs expect {}",
                std::mem::size_of::<LaunchParams>()
            )));
        }

        let registry = self.registry.lock();
        let pipeline = registry
            .pipelines
            .get(&pipeline.as_raw())
            .ok_or_else(|| GpuError::InvalidHandle(format!("pipeline {}", pipeline.as_raw())))?;

        let stores = {
            let memory = self.memory.read();
            let launch_params: LaunchParams = memory.read_pod(params)?;
            let resolved = Self::resolve_sbt(&registry, &memory, pipeline, sbt)?;

            let scene = match launch_params.traversable {
                0 => None,
                address => {
                    let traversable = registry.traversables.get(&address).ok_or_else(|| {
                        GpuError::Launch(format!("unknown traversable {address:#x}"))
                    })?;
                    let bytes = memory.slice(DevicePtr(address), traversable.size as usize)?;
                    Some(BvhView::parse(bytes)?)
                }
            };

            let context = LaunchContext {
                memory: &memory,
                params: launch_params,
                sbt: &resolved,
                scene,
                max_trace_depth: pipeline.max_trace_depth,
            };

            let rows: Vec<(u32, u32)> = (0..dims.depth)
                .flat_map(|z| (0..dims.height).map(move |y| (y, z)))
                .collect();
            let outputs = rows
                .into_par_iter()
                .map(|(y, z)| context.run_row(dims.width, y, z))
                .collect::<Result<Vec<RowOutput>>>()?;

            let rays: u64 = outputs.iter().map(|row| row.rays).sum();
            self.rays_traced.fetch_add(rays, Ordering::Relaxed);
            outputs
        };
        drop(registry);

        let mut memory = self.memory.write();
        for store in stores.iter().flat_map(|row| &row.stores) {
            memory.write(DevicePtr(store.address), store.data())?;
        }
        self.launches.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("Launched {}x{}x{}", dims.width, dims.height, dims.depth);
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        // Launches complete before returning
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use prism_core::TriangleMesh;
    use prism_shaders::abi::{CameraParams, EmptyRecordData, FrameParams, HitParams, HitgroupData};
    use prism_shaders::ProgramBlob;

    struct Scene {
        device: HostDevice,
        vertices: RawBuffer,
        indices: RawBuffer,
        input: TriangleArrayInput,
    }

    fn upload(device: &HostDevice, data: &[u8], label: &str) -> RawBuffer {
        let buffer = device.alloc(data.len() as u64, label).unwrap();
        device.write(buffer.ptr, data).unwrap();
        buffer
    }

    fn cube_scene() -> Scene {
        let device = HostDevice::new();
        let mut mesh = TriangleMesh::new();
        mesh.add_cube(Vec3::ZERO, Vec3::splat(2.0));

        let vertices = upload(&device, bytemuck::cast_slice(&mesh.vertices), "vertices");
        let indices = upload(&device, bytemuck::cast_slice(&mesh.indices), "indices");
        let input = TriangleArrayInput::packed(
            vertices.ptr,
            mesh.vertices.len() as u32,
            indices.ptr,
            mesh.indices.len() as u32,
        );
        Scene {
            device,
            vertices,
            indices,
            input,
        }
    }

    fn build(scene: &Scene) -> (TraversableHandle, RawBuffer, u64) {
        let device = &scene.device;
        let options = AccelBuildOptions::default();
        let sizes = device.accel_compute_memory_usage(&options, &scene.input).unwrap();
        let temp = device.alloc(sizes.temp_size_in_bytes, "temp").unwrap();
        let output = device.alloc(sizes.output_size_in_bytes, "output").unwrap();
        let emit = device.alloc(8, "compacted size").unwrap();

        let handle = device
            .accel_build(&options, &scene.input, &temp, &output, Some(emit.ptr))
            .unwrap();
        let mut size = [0u8; 8];
        device.read(emit.ptr, &mut size).unwrap();
        device.free(temp).unwrap();
        device.free(emit).unwrap();
        (handle, output, u64::from_le_bytes(size))
    }

    fn record(device: &HostDevice, group: ProgramGroupHandle, payload: &[u8], stride: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; stride];
        device
            .sbt_record_pack_header(group, &mut bytes[..SBT_HEADER_SIZE])
            .unwrap();
        bytes[SBT_HEADER_SIZE..SBT_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        bytes
    }

    struct Frame {
        pipeline: PipelineHandle,
        params: RawBuffer,
        colors: RawBuffer,
        hits: RawBuffer,
        sbt: ShaderBindingTable,
    }

    /// Program, pipeline and dispatch table setup for an 8x8 frame looking
    /// down +Z from z = -5.
    fn frame(scene: &Scene, traversable: TraversableHandle) -> Frame {
        const SIZE: i32 = 8;
        let device = &scene.device;
        let pipeline_options = PipelineCompileOptions::default();
        let (module, _) = device
            .module_create(
                &ModuleCompileOptions::default(),
                &pipeline_options,
                ProgramBlob::host_reference().bytes(),
            )
            .unwrap();
        let (raygen, _) = device
            .program_group_create(&ProgramGroupDesc::Raygen {
                module,
                entry: prism_shaders::RAYGEN_ENTRY.to_string(),
            })
            .unwrap();
        let (miss, _) = device
            .program_group_create(&ProgramGroupDesc::Miss {
                module,
                entry: prism_shaders::MISS_ENTRY.to_string(),
            })
            .unwrap();
        let (hit, _) = device
            .program_group_create(&ProgramGroupDesc::Hitgroup {
                module,
                closest_hit: Some(prism_shaders::CLOSEST_HIT_ENTRY.to_string()),
                any_hit: Some(prism_shaders::ANY_HIT_ENTRY.to_string()),
            })
            .unwrap();
        let (pipeline, _) = device
            .pipeline_create(
                &pipeline_options,
                &PipelineLinkOptions::default(),
                &[raygen, miss, hit],
            )
            .unwrap();

        let empty = EmptyRecordData::default();
        let raygen_record = upload(device, &record(device, raygen, bytemuck::bytes_of(&empty), 48), "raygen");
        let miss_record = upload(device, &record(device, miss, bytemuck::bytes_of(&empty), 48), "miss");
        let data = HitgroupData::new(scene.vertices.ptr.as_u64(), scene.indices.ptr.as_u64(), [0.2, 0.8, 0.2]);
        let hit_record = upload(device, &record(device, hit, bytemuck::bytes_of(&data), 64), "hitgroup");

        let pixels = (SIZE * SIZE) as u64;
        let colors = device.alloc(pixels * 4, "colors").unwrap();
        let hits = device.alloc(pixels * 12, "hits").unwrap();
        let launch_params = LaunchParams {
            frame: FrameParams {
                color_buffer: colors.ptr.as_u64(),
                size: [SIZE, SIZE],
            },
            hits: HitParams {
                hit_buffer: hits.ptr.as_u64(),
                size: [SIZE, SIZE],
            },
            camera: CameraParams {
                position: [0.0, 0.0, -5.0],
                direction: [0.0, 0.0, 1.0],
                horizontal: [0.66, 0.0, 0.0],
                vertical: [0.0, 0.66, 0.0],
            },
            traversable: traversable.0,
        };
        let params = upload(device, bytemuck::bytes_of(&launch_params), "params");

        Frame {
            pipeline,
            params,
            colors,
            hits,
            sbt: ShaderBindingTable {
                raygen_record: raygen_record.ptr,
                miss_record_base: miss_record.ptr,
                miss_record_stride_in_bytes: 48,
                miss_record_count: 1,
                hitgroup_record_base: hit_record.ptr,
                hitgroup_record_stride_in_bytes: 64,
                hitgroup_record_count: 1,
            },
        }
    }

    fn launch(scene: &Scene, frame: &Frame, dims: LaunchDims) -> Result<()> {
        scene.device.launch(
            frame.pipeline,
            frame.params.ptr,
            std::mem::size_of::<LaunchParams>(),
            &frame.sbt,
            dims,
        )
    }

    #[test]
    fn build_emits_compacted_size() {
        let scene = cube_scene();
        let (handle, output, compacted) = build(&scene);

        assert_eq!(handle, TraversableHandle(output.ptr.as_u64()));
        assert!(compacted > 0);
        assert!(compacted <= output.size);
        assert_eq!(scene.device.traversable_count(), 1);
    }

    #[test]
    fn compaction_copies_used_prefix() {
        let scene = cube_scene();
        let device = &scene.device;
        let (handle, output, compacted) = build(&scene);

        let target = device.alloc(compacted, "compacted").unwrap();
        let compact = device.accel_compact(handle, &target).unwrap();
        assert_ne!(compact, handle);

        device.accel_destroy(handle).unwrap();
        device.free(output).unwrap();
        assert_eq!(device.traversable_count(), 1);

        let too_small = device.alloc(compacted - 1, "too small").unwrap();
        assert!(matches!(
            device.accel_compact(compact, &too_small),
            Err(GpuError::AccelBuild(_))
        ));
        assert!(device.accel_destroy(handle).is_err());
    }

    #[test]
    fn freeing_output_releases_traversable() {
        let scene = cube_scene();
        let (_, output, _) = build(&scene);
        scene.device.free(output).unwrap();
        assert_eq!(scene.device.traversable_count(), 0);
    }

    #[test]
    fn build_rejects_dangling_index_and_small_buffers() {
        let scene = cube_scene();
        let device = &scene.device;
        let options = AccelBuildOptions::default();
        let sizes = device.accel_compute_memory_usage(&options, &scene.input).unwrap();
        let temp = device.alloc(sizes.temp_size_in_bytes, "temp").unwrap();
        let output = device.alloc(sizes.output_size_in_bytes, "output").unwrap();

        let mut input = scene.input.clone();
        input.num_vertices = 4;
        assert!(matches!(
            device.accel_build(&options, &input, &temp, &output, None),
            Err(GpuError::AccelBuild(_))
        ));

        let small = device.alloc(sizes.output_size_in_bytes - 1, "small").unwrap();
        assert!(device
            .accel_build(&options, &scene.input, &temp, &small, None)
            .is_err());

        let no_compaction = AccelBuildOptions {
            allow_compaction: false,
            ..options
        };
        assert!(device
            .accel_build(&no_compaction, &scene.input, &temp, &output, Some(temp.ptr))
            .is_err());
    }

    #[test]
    fn module_checks_launch_symbol() {
        let device = HostDevice::new();
        let options = PipelineCompileOptions {
            launch_params_variable_name: "params".to_string(),
            ..Default::default()
        };
        let err = device
            .module_create(
                &ModuleCompileOptions::default(),
                &options,
                ProgramBlob::host_reference().bytes(),
            )
            .unwrap_err();
        assert!(matches!(err, GpuError::ModuleCompilation { .. }));
        assert!(err.log().is_some_and(|log| log.contains("optixLaunchParams")));
    }

    #[test]
    fn header_must_match_layout() {
        let device = HostDevice::new();
        let mut header = [0u8; 16];
        assert!(matches!(
            device.sbt_record_pack_header(ProgramGroupHandle::from_raw(1), &mut header),
            Err(GpuError::RecordLayout(_))
        ));
        assert_eq!(device.sbt_record_layout().header_size, SBT_HEADER_SIZE);
    }

    #[test]
    fn pipeline_needs_raygen() {
        let device = HostDevice::new();
        let options = PipelineCompileOptions::default();
        let (module, _) = device
            .module_create(
                &ModuleCompileOptions::default(),
                &options,
                ProgramBlob::host_reference().bytes(),
            )
            .unwrap();
        let (miss, _) = device
            .program_group_create(&ProgramGroupDesc::Miss {
                module,
                entry: prism_shaders::MISS_ENTRY.to_string(),
            })
            .unwrap();
        assert!(matches!(
            device.pipeline_create(&options, &PipelineLinkOptions::default(), &[miss]),
            Err(GpuError::PipelineCreation { .. })
        ));
    }

    #[test]
    fn launch_shades_cube_and_background() {
        let scene = cube_scene();
        let (handle, _, _) = build(&scene);
        let frame = frame(&scene, handle);
        launch(&scene, &frame, LaunchDims::new_2d(8, 8)).unwrap();

        let mut pixels = [0u32; 64];
        scene
            .device
            .read(frame.colors.ptr, bytemuck::cast_slice_mut(&mut pixels))
            .unwrap();
        assert_eq!(pixels[0], 0xffff_ffff);
        assert_eq!(pixels[63], 0xffff_ffff);

        let [r, g, b, a] = pixels[4 * 8 + 4].to_le_bytes();
        assert_eq!(a, 255);
        assert_eq!(r, b);
        assert!((48..=51).contains(&r));
        assert!((195..=204).contains(&g));

        let mut hits = [[0f32; 3]; 64];
        scene
            .device
            .read(frame.hits.ptr, bytemuck::cast_slice_mut(&mut hits))
            .unwrap();
        assert_eq!(hits[0], [0.0; 3]);
        assert_relative_eq!(hits[4 * 8 + 4][2], -1.0, epsilon = 1e-4);

        let stats = scene.device.stats();
        assert_eq!(stats.launches, 1);
        assert_eq!(stats.rays_traced, 64);
    }

    #[test]
    fn launch_checks_parameter_size() {
        let scene = cube_scene();
        let (handle, _, _) = build(&scene);
        let frame = frame(&scene, handle);
        let result = scene.device.launch(
            frame.pipeline,
            frame.params.ptr,
            std::mem::size_of::<LaunchParams>() - 8,
            &frame.sbt,
            LaunchDims::new_2d(8, 8),
        );
        assert!(matches!(result, Err(GpuError::Launch(_))));
        assert_eq!(scene.device.stats().launches, 0);
    }

    #[test]
    fn empty_grid_runs_no_programs() {
        let scene = cube_scene();
        let (handle, _, _) = build(&scene);
        let frame = frame(&scene, handle);
        launch(&scene, &frame, LaunchDims::new_2d(0, 8)).unwrap();
        assert_eq!(scene.device.stats().rays_traced, 0);
    }

    #[test]
    fn launch_rejects_freed_traversable() {
        let scene = cube_scene();
        let (handle, output, _) = build(&scene);
        let frame = frame(&scene, handle);
        scene.device.free(output).unwrap();
        assert!(launch(&scene, &frame, LaunchDims::new_2d(8, 8)).is_err());
    }

    #[test]
    fn stack_sizes_are_recorded() {
        let scene = cube_scene();
        let (handle, _, _) = build(&scene);
        let frame = frame(&scene, handle);
        let sizes = StackSizes::default();
        scene
            .device
            .pipeline_set_stack_size(frame.pipeline, &sizes)
            .unwrap();
        assert_eq!(scene.device.pipeline_stack_sizes(frame.pipeline), Some(sizes));
    }
}
