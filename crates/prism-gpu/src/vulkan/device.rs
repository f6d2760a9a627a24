//! [`RayTracingDevice`] implementation on `VK_KHR_ray_tracing_pipeline`.

use std::collections::BTreeMap;
use std::ffi::CString;

use ash::vk;
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;
use parking_lot::Mutex;

use super::accel::{self, Tlas};
use super::context::{VulkanContext, VulkanDeviceBuilder};
use super::memory::GpuBuffer;
use crate::device::{
    AccelBufferSizes, AccelBuildOptions, LaunchDims, ModuleCompileOptions, PipelineCompileOptions,
    PipelineLinkOptions, ProgramGroupDesc, RayTracingDevice, SbtRecordLayout, ShaderBindingTable,
    StackSizes, TriangleArrayInput,
};
use crate::error::{GpuError, Result};
use crate::handle::{
    BufferId, DevicePtr, ModuleHandle, PipelineHandle, ProgramGroupHandle, RawBuffer,
    TraversableHandle,
};
use crate::spirv::{ExecutionModel, SpirvModule};

/// Usage of every buffer allocated through the device interface.
///
/// The interface has no notion of buffer roles, so each allocation can serve
/// as build input, structure storage, shader binding table or storage buffer.
const GENERAL_BUFFER_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw()
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR.as_raw()
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR.as_raw()
        | vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR.as_raw(),
);

/// Stages that can read the launch parameter push constant.
const PUSH_CONSTANT_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
        | vk::ShaderStageFlags::MISS_KHR.as_raw()
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::ANY_HIT_KHR.as_raw(),
);

/// Push constant block: the device address of the launch parameters.
const PUSH_CONSTANT_SIZE: u32 = std::mem::size_of::<u64>() as u32;

struct BufferEntry {
    id: BufferId,
    buffer: GpuBuffer,
}

struct AccelEntry {
    blas: vk::AccelerationStructureKHR,
    blas_buffer: BufferId,
    tlas: Tlas,
}

struct ModuleEntry {
    shader: vk::ShaderModule,
    spirv: SpirvModule,
}

struct PipelineEntry {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    groups: Vec<ProgramGroupHandle>,
    group_handles: Vec<u8>,
    stack_size: Option<u32>,
}

#[derive(Default)]
struct State {
    /// Live buffers keyed by device address.
    buffers: BTreeMap<u64, BufferEntry>,
    /// Traversables keyed by TLAS address.
    accels: HashMap<u64, AccelEntry>,
    modules: HashMap<u64, ModuleEntry>,
    groups: HashMap<u64, ProgramGroupDesc>,
    pipelines: HashMap<u64, PipelineEntry>,
    next_id: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Buffer holding `[address, address + len)` and the offset into it.
    fn locate(&self, address: u64, len: u64) -> Result<(&BufferEntry, u64)> {
        self.buffers
            .range(..=address)
            .next_back()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.buffer.contains(address, len))
            .map(|entry| (entry, address - entry.buffer.address))
            .ok_or(GpuError::OutOfBounds {
                address,
                len: len as usize,
            })
    }

    fn buffer(&self, raw: &RawBuffer) -> Result<&BufferEntry> {
        self.buffers
            .get(&raw.ptr.as_u64())
            .filter(|entry| entry.id == raw.id)
            .ok_or_else(|| GpuError::InvalidHandle(format!("buffer {:?}", raw.id)))
    }
}

/// Vulkan hardware ray tracing device.
pub struct VulkanDevice {
    state: Mutex<State>,
    ctx: VulkanContext,
    name: String,
}

impl VulkanDevice {
    /// Create a device with default settings.
    pub fn new() -> Result<Self> {
        VulkanDeviceBuilder::new().build()
    }

    /// Underlying Vulkan context.
    #[must_use]
    pub fn context(&self) -> &VulkanContext {
        &self.ctx
    }

    fn rt_limits(&self) -> crate::capabilities::RayTracingCapabilities {
        self.ctx.capabilities.ray_tracing
    }

    unsafe fn destroy_accel(&self, entry: AccelEntry) -> Result<()> {
        accel::destroy_tlas(&self.ctx, entry.tlas)?;
        self.ctx
            .as_loader
            .destroy_acceleration_structure(entry.blas, None);
        Ok(())
    }

    /// Register a built bottom-level structure behind a fresh TLAS.
    unsafe fn register_accel(
        &self,
        state: &mut State,
        blas: vk::AccelerationStructureKHR,
        blas_buffer: BufferId,
    ) -> Result<TraversableHandle> {
        let tlas = match accel::build_tlas(&self.ctx, blas) {
            Ok(tlas) => tlas,
            Err(e) => {
                self.ctx.as_loader.destroy_acceleration_structure(blas, None);
                return Err(e);
            }
        };
        let handle = TraversableHandle(tlas.device_address);
        state.accels.insert(
            tlas.device_address,
            AccelEntry {
                blas,
                blas_buffer,
                tlas,
            },
        );
        Ok(handle)
    }
}

impl VulkanDeviceBuilder {
    /// Build the device.
    pub fn build(self) -> Result<VulkanDevice> {
        let ctx = self.build_context()?;
        let name = ctx.capabilities.device_name.clone();
        Ok(VulkanDevice {
            state: Mutex::new(State::default()),
            ctx,
            name,
        })
    }
}

impl RayTracingDevice for VulkanDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn alloc(&self, bytes: u64, label: &str) -> Result<RawBuffer> {
        let buffer = self.ctx.allocator.lock().create_buffer(
            bytes,
            GENERAL_BUFFER_USAGE,
            MemoryLocation::CpuToGpu,
            label,
        )?;

        let mut state = self.state.lock();
        let id = BufferId(state.next_id());
        let raw = RawBuffer {
            id,
            ptr: DevicePtr(buffer.address),
            size: bytes,
        };
        state
            .buffers
            .insert(buffer.address, BufferEntry { id, buffer });
        Ok(raw)
    }

    fn free(&self, raw: RawBuffer) -> Result<()> {
        let mut state = self.state.lock();
        state.buffer(&raw)?;
        let Some(mut entry) = state.buffers.remove(&raw.ptr.as_u64()) else {
            return Err(GpuError::InvalidHandle(format!("buffer {:?}", raw.id)));
        };

        // Structures living in this buffer die with it
        let stale: Vec<u64> = state
            .accels
            .iter()
            .filter(|(_, accel)| accel.blas_buffer == raw.id)
            .map(|(&key, _)| key)
            .collect();
        for key in stale {
            if let Some(accel) = state.accels.remove(&key) {
                tracing::debug!("Releasing traversable {key:#x} with its buffer");
                unsafe { self.destroy_accel(accel)? };
            }
        }

        self.ctx.allocator.lock().free_buffer(&mut entry.buffer)
    }

    fn write(&self, dst: DevicePtr, data: &[u8]) -> Result<()> {
        let state = self.state.lock();
        let (entry, offset) = state.locate(dst.as_u64(), data.len() as u64)?;
        entry.buffer.write_bytes(offset, data)
    }

    fn read(&self, src: DevicePtr, out: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        let (entry, offset) = state.locate(src.as_u64(), out.len() as u64)?;
        entry.buffer.read_bytes(offset, out)
    }

    fn accel_compute_memory_usage(
        &self,
        options: &AccelBuildOptions,
        input: &TriangleArrayInput,
    ) -> Result<AccelBufferSizes> {
        let geometry = accel::triangle_geometry(input)?;
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(accel::build_flags(options))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry));

        let mut build_sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.ctx.as_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[input.num_index_triplets],
                &mut build_sizes,
            );
        }

        Ok(AccelBufferSizes {
            output_size_in_bytes: build_sizes.acceleration_structure_size,
            temp_size_in_bytes: build_sizes.build_scratch_size,
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
        if temp.size < required.temp_size_in_bytes || output.size < required.output_size_in_bytes
        {
            return Err(GpuError::AccelBuild(format!(
                "buffers too small: temp {} < {} or output {} < {}",
                temp.size,
                required.temp_size_in_bytes,
                output.size,
                required.output_size_in_bytes
            )));
        }
        if emit_compacted_size.is_some() && !options.allow_compaction {
            return Err(GpuError::AccelBuild(
                "compacted size requested without allowing compaction".to_string(),
            ));
        }

        let geometry = accel::triangle_geometry(input)?;
        let mut state = self.state.lock();
        state.buffer(temp)?;

        unsafe {
            let blas = accel::create_blas(&self.ctx, &state.buffer(output)?.buffer, output.size)?;

            let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                .flags(accel::build_flags(options))
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .dst_acceleration_structure(blas)
                .geometries(std::slice::from_ref(&geometry))
                .scratch_data(vk::DeviceOrHostAddressKHR {
                    device_address: temp.ptr.as_u64(),
                });

            let emit = match emit_compacted_size {
                Some(ptr) => {
                    let (entry, offset) = state.locate(ptr.as_u64(), 8)?;
                    let pool_info = vk::QueryPoolCreateInfo::default()
                        .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
                        .query_count(1);
                    let pool = self.ctx.device.create_query_pool(&pool_info, None)?;
                    Some((pool, entry.buffer.buffer, offset))
                }
                None => None,
            };

            let result = self.ctx.submit_and_wait(|cmd| {
                accel::record_blas_build(&self.ctx, cmd, &build_info, input.num_index_triplets, emit);
            });

            if let Some((pool, _, _)) = emit {
                self.ctx.device.destroy_query_pool(pool, None);
            }
            if let Err(e) = result {
                self.ctx.as_loader.destroy_acceleration_structure(blas, None);
                return Err(GpuError::AccelBuild(format!("build submission failed: {e}")));
            }

            tracing::debug!(
                "Built BLAS over {} triangles into {} bytes",
                input.num_index_triplets,
                output.size
            );
            self.register_accel(&mut state, blas, output.id)
        }
    }

    fn accel_compact(
        &self,
        source: TraversableHandle,
        output: &RawBuffer,
    ) -> Result<TraversableHandle> {
        let mut state = self.state.lock();
        let src_blas = state
            .accels
            .get(&source.0)
            .map(|entry| entry.blas)
            .ok_or_else(|| GpuError::InvalidHandle(format!("traversable {:#x}", source.0)))?;

        unsafe {
            let blas = accel::create_blas(&self.ctx, &state.buffer(output)?.buffer, output.size)?;

            let copy_info = vk::CopyAccelerationStructureInfoKHR::default()
                .src(src_blas)
                .dst(blas)
                .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);

            if let Err(e) = self.ctx.submit_and_wait(|cmd| {
                self.ctx
                    .as_loader
                    .cmd_copy_acceleration_structure(cmd, &copy_info);
            }) {
                self.ctx.as_loader.destroy_acceleration_structure(blas, None);
                return Err(GpuError::AccelBuild(format!("compaction failed: {e}")));
            }

            tracing::debug!("Compacted BLAS into {} bytes", output.size);
            self.register_accel(&mut state, blas, output.id)
        }
    }

    fn accel_destroy(&self, handle: TraversableHandle) -> Result<()> {
        let entry = self
            .state
            .lock()
            .accels
            .remove(&handle.0)
            .ok_or_else(|| GpuError::InvalidHandle(format!("traversable {:#x}", handle.0)))?;
        unsafe { self.destroy_accel(entry) }
    }

    fn module_create(
        &self,
        module_options: &ModuleCompileOptions,
        pipeline_options: &PipelineCompileOptions,
        blob: &[u8],
    ) -> Result<(ModuleHandle, String)> {
        let spirv = SpirvModule::parse(blob).map_err(|log| GpuError::ModuleCompilation {
            message: "program blob is not SPIR-V".to_string(),
            log,
        })?;

        let mut log = format!(
            "SPIR-V module: {} words, {} entry points (register budget {}, {:?}/{:?})",
            spirv.words.len(),
            spirv.entry_points.len(),
            module_options.max_register_count,
            module_options.opt_level,
            module_options.debug_level,
        );
        if !spirv
            .debug_names
            .contains(&pipeline_options.launch_params_variable_name)
        {
            // Stripped modules lose their names; parameters still arrive by push constant
            tracing::warn!(
                "Program blob does not name '{}'",
                pipeline_options.launch_params_variable_name
            );
            log.push_str(&format!(
                "\nwarning: no debug name for '{}'",
                pipeline_options.launch_params_variable_name
            ));
        }

        let create_info = vk::ShaderModuleCreateInfo::default().code(&spirv.words);
        let shader = unsafe { self.ctx.device.create_shader_module(&create_info, None) }
            .map_err(|e| GpuError::ModuleCompilation {
                message: format!("vkCreateShaderModule: {e}"),
                log: log.clone(),
            })?;

        let mut state = self.state.lock();
        let id = state.next_id();
        state.modules.insert(id, ModuleEntry { shader, spirv });
        Ok((ModuleHandle::from_raw(id), log))
    }

    fn module_destroy(&self, module: ModuleHandle) -> Result<()> {
        let entry = self
            .state
            .lock()
            .modules
            .remove(&module.as_raw())
            .ok_or_else(|| GpuError::InvalidHandle(format!("module {}", module.as_raw())))?;
        unsafe { self.ctx.device.destroy_shader_module(entry.shader, None) };
        Ok(())
    }

    fn program_group_create(&self, desc: &ProgramGroupDesc) -> Result<(ProgramGroupHandle, String)> {
        let mut state = self.state.lock();
        let module = state.modules.get(&desc.module().as_raw()).ok_or_else(|| {
            GpuError::InvalidHandle(format!("module {}", desc.module().as_raw()))
        })?;

        let expected: Vec<(&str, ExecutionModel)> = match desc {
            ProgramGroupDesc::Raygen { entry, .. } => {
                vec![(entry.as_str(), ExecutionModel::RayGeneration)]
            }
            ProgramGroupDesc::Miss { entry, .. } => vec![(entry.as_str(), ExecutionModel::Miss)],
            ProgramGroupDesc::Hitgroup {
                closest_hit,
                any_hit,
                ..
            } => closest_hit
                .iter()
                .map(|e| (e.as_str(), ExecutionModel::ClosestHit))
                .chain(any_hit.iter().map(|e| (e.as_str(), ExecutionModel::AnyHit)))
                .collect(),
        };

        for (entry, model) in &expected {
            match module.spirv.entry_point(entry) {
                Some(found) if found == *model => {}
                Some(found) => {
                    return Err(GpuError::ProgramGroupCreation {
                        message: format!("entry point '{entry}' has the wrong stage"),
                        log: format!("expected {model:?}, module declares {found:?}"),
                    })
                }
                None => {
                    return Err(GpuError::ProgramGroupCreation {
                        message: format!("entry point '{entry}' not found"),
                        log: format!(
                            "module declares: {}",
                            module
                                .spirv
                                .entry_points
                                .iter()
                                .map(|e| e.name.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        ),
                    })
                }
            }
        }

        let id = state.next_id();
        state.groups.insert(id, desc.clone());
        Ok((ProgramGroupHandle::from_raw(id), String::new()))
    }

    fn program_group_destroy(&self, group: ProgramGroupHandle) -> Result<()> {
        self.state
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
        let mut state = self.state.lock();

        let link_error = |message: String| GpuError::PipelineCreation {
            message,
            log: String::new(),
        };

        // Entry names must outlive the create call
        let mut names: Vec<CString> = Vec::new();
        let mut stage_sources: Vec<(vk::ShaderStageFlags, vk::ShaderModule)> = Vec::new();
        let mut shader_groups = Vec::with_capacity(groups.len());

        for group in groups {
            let desc = state
                .groups
                .get(&group.as_raw())
                .ok_or_else(|| GpuError::InvalidHandle(format!("program group {}", group.as_raw())))?;
            let shader = state
                .modules
                .get(&desc.module().as_raw())
                .map(|m| m.shader)
                .ok_or_else(|| link_error("program group outlived its module".to_string()))?;

            let mut add_stage = |stage: vk::ShaderStageFlags, entry: &str| -> Result<u32> {
                let name = CString::new(entry)
                    .map_err(|e| link_error(format!("invalid entry name '{entry}': {e}")))?;
                names.push(name);
                stage_sources.push((stage, shader));
                Ok(stage_sources.len() as u32 - 1)
            };

            let info = match desc {
                ProgramGroupDesc::Raygen { entry, .. } => {
                    let index = add_stage(vk::ShaderStageFlags::RAYGEN_KHR, entry)?;
                    general_group(index)
                }
                ProgramGroupDesc::Miss { entry, .. } => {
                    let index = add_stage(vk::ShaderStageFlags::MISS_KHR, entry)?;
                    general_group(index)
                }
                ProgramGroupDesc::Hitgroup {
                    closest_hit,
                    any_hit,
                    ..
                } => {
                    let closest = match closest_hit {
                        Some(entry) => add_stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR, entry)?,
                        None => vk::SHADER_UNUSED_KHR,
                    };
                    let any = match any_hit {
                        Some(entry) => add_stage(vk::ShaderStageFlags::ANY_HIT_KHR, entry)?,
                        None => vk::SHADER_UNUSED_KHR,
                    };
                    vk::RayTracingShaderGroupCreateInfoKHR::default()
                        .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                        .general_shader(vk::SHADER_UNUSED_KHR)
                        .closest_hit_shader(closest)
                        .any_hit_shader(any)
                        .intersection_shader(vk::SHADER_UNUSED_KHR)
                }
            };
            shader_groups.push(info);
        }

        let stages: Vec<vk::PipelineShaderStageCreateInfo> = stage_sources
            .iter()
            .zip(&names)
            .map(|(&(stage, module), name)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(module)
                    .name(name)
            })
            .collect();

        let max_depth = self.rt_limits().max_ray_recursion_depth;
        let recursion = link_options.max_trace_depth.min(max_depth);
        let mut log = format!(
            "{} stages in {} groups, trace depth {}",
            stages.len(),
            shader_groups.len(),
            recursion
        );
        if recursion < link_options.max_trace_depth {
            log.push_str(&format!(
                "\nwarning: trace depth clamped from {} to device limit {}",
                link_options.max_trace_depth, max_depth
            ));
        }

        let push_constant_range = vk::PushConstantRange::default()
            .stage_flags(PUSH_CONSTANT_STAGES)
            .offset(0)
            .size(PUSH_CONSTANT_SIZE);
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .push_constant_ranges(std::slice::from_ref(&push_constant_range));
        let layout = unsafe { self.ctx.device.create_pipeline_layout(&layout_info, None) }?;

        let dynamic_states = [vk::DynamicState::RAY_TRACING_PIPELINE_STACK_SIZE_KHR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&shader_groups)
            .max_pipeline_ray_recursion_depth(recursion)
            .dynamic_state(&dynamic_state)
            .layout(layout);

        let pipelines = unsafe {
            self.ctx.rt_loader.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(&pipeline_info),
                None,
            )
        };
        let pipeline = match pipelines {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { self.ctx.device.destroy_pipeline_layout(layout, None) };
                return Err(GpuError::PipelineCreation {
                    message: format!("vkCreateRayTracingPipelinesKHR: {e}"),
                    log,
                });
            }
        };

        let handle_size = self.rt_limits().shader_group_handle_size as usize;
        let group_handles = unsafe {
            self.ctx.rt_loader.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                groups.len() as u32,
                handle_size * groups.len(),
            )
        };
        let group_handles = match group_handles {
            Ok(handles) => handles,
            Err(e) => {
                unsafe {
                    self.ctx.device.destroy_pipeline(pipeline, None);
                    self.ctx.device.destroy_pipeline_layout(layout, None);
                }
                return Err(GpuError::PipelineCreation {
                    message: format!("shader group handles: {e}"),
                    log,
                });
            }
        };

        let id = state.next_id();
        state.pipelines.insert(
            id,
            PipelineEntry {
                pipeline,
                layout,
                groups: groups.to_vec(),
                group_handles,
                stack_size: None,
            },
        );
        Ok((PipelineHandle::from_raw(id), log))
    }

    fn pipeline_set_stack_size(&self, pipeline: PipelineHandle, sizes: &StackSizes) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .pipelines
            .get_mut(&pipeline.as_raw())
            .ok_or_else(|| GpuError::InvalidHandle(format!("pipeline {}", pipeline.as_raw())))?;

        entry.stack_size = Some(combined_stack_size(sizes));
        Ok(())
    }

    fn pipeline_destroy(&self, pipeline: PipelineHandle) -> Result<()> {
        let entry = self
            .state
            .lock()
            .pipelines
            .remove(&pipeline.as_raw())
            .ok_or_else(|| GpuError::InvalidHandle(format!("pipeline {}", pipeline.as_raw())))?;
        unsafe {
            self.ctx.device.destroy_pipeline(entry.pipeline, None);
            self.ctx.device.destroy_pipeline_layout(entry.layout, None);
        }
        Ok(())
    }

    fn sbt_record_layout(&self) -> SbtRecordLayout {
        let limits = self.rt_limits();
        SbtRecordLayout {
            header_size: limits.shader_group_handle_size as usize,
            record_alignment: limits.shader_group_handle_alignment as usize,
        }
    }

    fn sbt_record_pack_header(&self, group: ProgramGroupHandle, header: &mut [u8]) -> Result<()> {
        let handle_size = self.rt_limits().shader_group_handle_size as usize;
        if header.len() != handle_size {
            return Err(GpuError::RecordLayout(format!(
                "header slice of {} bytes, device handles are {handle_size} bytes",
                header.len()
            )));
        }

        // Handles exist only once a group is linked; use the newest pipeline holding it
        let state = self.state.lock();
        let (entry, index) = state
            .pipelines
            .iter()
            .filter_map(|(&id, entry)| {
                entry
                    .groups
                    .iter()
                    .position(|&g| g == group)
                    .map(|index| (id, entry, index))
            })
            .max_by_key(|(id, _, _)| *id)
            .map(|(_, entry, index)| (entry, index))
            .ok_or_else(|| {
                GpuError::InvalidState(format!(
                    "program group {} is not linked into a pipeline",
                    group.as_raw()
                ))
            })?;

        let start = index * handle_size;
        header.copy_from_slice(&entry.group_handles[start..start + handle_size]);
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
        let state = self.state.lock();
        let entry = state
            .pipelines
            .get(&pipeline.as_raw())
            .ok_or_else(|| GpuError::InvalidHandle(format!("pipeline {}", pipeline.as_raw())))?;

        state
            .locate(params.as_u64(), params_size as u64)
            .map_err(|e| GpuError::Launch(format!("launch parameters: {e}")))?;

        // Ray generation regions must have size == stride: use the rest of its buffer
        let (raygen_buffer, raygen_offset) = state
            .locate(sbt.raygen_record.as_u64(), 1)
            .map_err(|e| GpuError::Launch(format!("raygen record: {e}")))?;
        let raygen_size = raygen_buffer.buffer.size - raygen_offset;

        let region = |base: DevicePtr, stride: u32, count: u32| vk::StridedDeviceAddressRegionKHR {
            device_address: base.as_u64(),
            stride: u64::from(stride),
            size: u64::from(stride) * u64::from(count),
        };
        let raygen_region = vk::StridedDeviceAddressRegionKHR {
            device_address: sbt.raygen_record.as_u64(),
            stride: raygen_size,
            size: raygen_size,
        };
        let miss_region = region(
            sbt.miss_record_base,
            sbt.miss_record_stride_in_bytes,
            sbt.miss_record_count,
        );
        let hit_region = region(
            sbt.hitgroup_record_base,
            sbt.hitgroup_record_stride_in_bytes,
            sbt.hitgroup_record_count,
        );
        let callable_region = vk::StridedDeviceAddressRegionKHR::default();

        let stack_size = entry
            .stack_size
            .unwrap_or_else(|| combined_stack_size(&StackSizes::default()));
        let push_constants = params.as_u64().to_ne_bytes();

        self.ctx
            .submit_and_wait(|cmd| unsafe {
                let device = &self.ctx.device;
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, entry.pipeline);
                device.cmd_push_constants(cmd, entry.layout, PUSH_CONSTANT_STAGES, 0, &push_constants);
                self.ctx
                    .rt_loader
                    .cmd_set_ray_tracing_pipeline_stack_size(cmd, stack_size);
                self.ctx.rt_loader.cmd_trace_rays(
                    cmd,
                    &raygen_region,
                    &miss_region,
                    &hit_region,
                    &callable_region,
                    dims.width,
                    dims.height,
                    dims.depth,
                );
            })
            .map_err(|e| GpuError::Launch(e.to_string()))
    }

    fn synchronize(&self) -> Result<()> {
        self.ctx.wait_idle()
    }
}

/// One stack covers the deepest continuation plus the larger callable stack.
fn combined_stack_size(sizes: &StackSizes) -> u32 {
    sizes.continuation
        + sizes
            .direct_callable_from_traversal
            .max(sizes.direct_callable_from_state)
}

fn general_group(index: u32) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
    vk::RayTracingShaderGroupCreateInfoKHR::default()
        .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
        .general_shader(index)
        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR)
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let _ = self.ctx.wait_idle();
        let mut state = self.state.lock();

        for (_, entry) in state.pipelines.drain() {
            unsafe {
                self.ctx.device.destroy_pipeline(entry.pipeline, None);
                self.ctx.device.destroy_pipeline_layout(entry.layout, None);
            }
        }
        for (_, entry) in state.modules.drain() {
            unsafe { self.ctx.device.destroy_shader_module(entry.shader, None) };
        }
        let accels: Vec<AccelEntry> = state.accels.drain().map(|(_, entry)| entry).collect();
        for entry in accels {
            if let Err(e) = unsafe { self.destroy_accel(entry) } {
                tracing::warn!("Failed to release traversable: {e}");
            }
        }
        let buffers = std::mem::take(&mut state.buffers);
        if !buffers.is_empty() {
            tracing::warn!("{} device buffers still allocated at shutdown", buffers.len());
        }
        let mut allocator = self.ctx.allocator.lock();
        for (_, mut entry) in buffers {
            let _ = allocator.free_buffer(&mut entry.buffer);
        }
    }
}
