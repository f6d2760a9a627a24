//! The ray tracing device interface.
//!
//! [`RayTracingDevice`] is the seam between the renderer and a concrete
//! backend. It is shaped after the OptiX host API: raw device memory addressed
//! by [`DevicePtr`], acceleration structures built into caller-owned buffers,
//! program modules compiled from an opaque blob, and launches described by a
//! [`ShaderBindingTable`] plus a launch parameter block in device memory.
//!
//! Every call is synchronous from the caller's point of view unless noted
//! otherwise; [`RayTracingDevice::synchronize`] drains anything a backend
//! still has in flight.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::handle::{
    DevicePtr, ModuleHandle, PipelineHandle, ProgramGroupHandle, RawBuffer, TraversableHandle,
};

/// Size of one vertex in a triangle build input (three `f32`).
pub const VERTEX_STRIDE: u32 = 12;
/// Size of one index triple in a triangle build input (three `u32`).
pub const INDEX_TRIPLE_STRIDE: u32 = 12;

/// Compiler optimization level for device modules.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizationLevel {
    /// Let the device pick.
    #[default]
    Default,
    Level0,
    Level1,
    Level2,
    Level3,
}

/// Amount of debug information compiled into device modules.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugLevel {
    #[default]
    None,
    Minimal,
    Full,
}

/// Shapes of acceleration structure graph a pipeline is allowed to trace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraversableGraph {
    /// Exactly one geometry structure, no instancing.
    #[default]
    SingleGeometry,
    /// One level of instances over geometry structures.
    SingleLevelInstancing,
    /// Anything.
    Any,
}

/// Options applied when compiling a device module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleCompileOptions {
    /// Upper bound on registers per thread, 0 for no limit.
    pub max_register_count: u32,
    pub opt_level: OptimizationLevel,
    pub debug_level: DebugLevel,
}

impl Default for ModuleCompileOptions {
    fn default() -> Self {
        Self {
            max_register_count: 50,
            opt_level: OptimizationLevel::Default,
            debug_level: DebugLevel::None,
        }
    }
}

/// Options shared by every module and program group of one pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCompileOptions {
    pub uses_motion_blur: bool,
    pub traversable_graph: TraversableGraph,
    /// 32-bit payload slots carried by a ray.
    pub num_payload_values: u32,
    /// 32-bit attribute slots reported by an intersection.
    pub num_attribute_values: u32,
    /// Name of the launch parameter block as the device programs declare it.
    pub launch_params_variable_name: String,
}

impl Default for PipelineCompileOptions {
    fn default() -> Self {
        Self {
            uses_motion_blur: false,
            traversable_graph: TraversableGraph::SingleGeometry,
            num_payload_values: 5,
            num_attribute_values: 2,
            launch_params_variable_name: "optixLaunchParams".to_string(),
        }
    }
}

/// Options for linking program groups into a pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineLinkOptions {
    /// Deepest nesting of trace calls, 1 meaning only ray generation traces.
    pub max_trace_depth: u32,
    pub debug_level: DebugLevel,
}

impl Default for PipelineLinkOptions {
    fn default() -> Self {
        Self {
            max_trace_depth: 2,
            debug_level: DebugLevel::None,
        }
    }
}

/// Execution stack limits of a linked pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSizes {
    /// Direct callables invoked from intersection or any-hit programs.
    pub direct_callable_from_traversal: u32,
    /// Direct callables invoked from ray generation, miss or closest-hit.
    pub direct_callable_from_state: u32,
    /// Continuation stack for trace calls.
    pub continuation: u32,
    /// Depth of the traversable graph.
    pub max_traversable_graph_depth: u32,
}

impl Default for StackSizes {
    fn default() -> Self {
        Self {
            direct_callable_from_traversal: 2 * 1024,
            direct_callable_from_state: 2 * 1024,
            continuation: 2 * 1024,
            max_traversable_graph_depth: 1,
        }
    }
}

/// Stage a program group is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProgramGroupKind {
    Raygen,
    Miss,
    Hitgroup,
}

/// Description of one program group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgramGroupDesc {
    /// Ray generation entry point.
    Raygen { module: ModuleHandle, entry: String },
    /// Miss entry point.
    Miss { module: ModuleHandle, entry: String },
    /// Closest-hit and any-hit pair for built-in triangles.
    Hitgroup {
        module: ModuleHandle,
        closest_hit: Option<String>,
        any_hit: Option<String>,
    },
}

impl ProgramGroupDesc {
    /// Stage of this group.
    #[must_use]
    pub const fn kind(&self) -> ProgramGroupKind {
        match self {
            Self::Raygen { .. } => ProgramGroupKind::Raygen,
            Self::Miss { .. } => ProgramGroupKind::Miss,
            Self::Hitgroup { .. } => ProgramGroupKind::Hitgroup,
        }
    }

    /// Module the entry points live in.
    #[must_use]
    pub const fn module(&self) -> ModuleHandle {
        match self {
            Self::Raygen { module, .. } | Self::Miss { module, .. } | Self::Hitgroup { module, .. } => {
                *module
            }
        }
    }

    /// Every entry point name this group references.
    #[must_use]
    pub fn entry_points(&self) -> Vec<&str> {
        match self {
            Self::Raygen { entry, .. } | Self::Miss { entry, .. } => vec![entry.as_str()],
            Self::Hitgroup {
                closest_hit,
                any_hit,
                ..
            } => closest_hit
                .iter()
                .chain(any_hit.iter())
                .map(String::as_str)
                .collect(),
        }
    }
}

/// Flags applied to one build input's shading slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeometryFlags {
    /// Skip any-hit programs for this geometry.
    pub disable_anyhit: bool,
    /// Invoke any-hit at most once per primitive.
    pub single_anyhit_call: bool,
}

/// One triangle array build input in device memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriangleArrayInput {
    pub vertex_buffer: DevicePtr,
    pub num_vertices: u32,
    pub vertex_stride: u32,
    pub index_buffer: DevicePtr,
    /// Number of triangles (index triples).
    pub num_index_triplets: u32,
    pub index_stride: u32,
    /// One entry per shading table record this input uses.
    pub flags: Vec<GeometryFlags>,
}

impl TriangleArrayInput {
    /// Tightly packed `f32x3` vertices and `u32x3` triangles with one shading slot.
    #[must_use]
    pub fn packed(
        vertex_buffer: DevicePtr,
        num_vertices: u32,
        index_buffer: DevicePtr,
        num_index_triplets: u32,
    ) -> Self {
        Self {
            vertex_buffer,
            num_vertices,
            vertex_stride: VERTEX_STRIDE,
            index_buffer,
            num_index_triplets,
            index_stride: INDEX_TRIPLE_STRIDE,
            flags: vec![GeometryFlags::default()],
        }
    }

    /// Number of shading table records.
    #[must_use]
    pub fn num_sbt_records(&self) -> usize {
        self.flags.len()
    }
}

/// Acceleration structure build options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccelBuildOptions {
    pub allow_compaction: bool,
    pub prefer_fast_trace: bool,
}

impl Default for AccelBuildOptions {
    fn default() -> Self {
        Self {
            allow_compaction: true,
            prefer_fast_trace: true,
        }
    }
}

/// Buffer sizes a build needs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccelBufferSizes {
    /// Size of the uncompacted output buffer.
    pub output_size_in_bytes: u64,
    /// Size of the temporary buffer used only during the build.
    pub temp_size_in_bytes: u64,
}

/// Record layout rules of a device's shader binding table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SbtRecordLayout {
    /// Bytes of device-written header at the start of every record.
    pub header_size: usize,
    /// Alignment of record bases and strides.
    pub record_alignment: usize,
}

/// Where a launch finds its records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShaderBindingTable {
    pub raygen_record: DevicePtr,
    pub miss_record_base: DevicePtr,
    pub miss_record_stride_in_bytes: u32,
    pub miss_record_count: u32,
    pub hitgroup_record_base: DevicePtr,
    pub hitgroup_record_stride_in_bytes: u32,
    pub hitgroup_record_count: u32,
}

/// Launch grid dimensions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct LaunchDims {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl LaunchDims {
    /// A single-layer 2D grid.
    #[must_use]
    pub const fn new_2d(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            depth: 1,
        }
    }

    /// Total number of work items.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }

    /// True when the grid has no work items.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A device able to build acceleration structures and launch ray tracing
/// pipelines.
///
/// Methods take `&self`; implementations synchronize internally. Handles
/// passed in must have been created by the same device.
pub trait RayTracingDevice {
    /// Human-readable device name.
    fn name(&self) -> &str;

    // Memory

    /// Reserve `bytes` of device memory.
    fn alloc(&self, bytes: u64, label: &str) -> Result<RawBuffer>;

    /// Release an allocation.
    fn free(&self, buffer: RawBuffer) -> Result<()>;

    /// Copy host bytes to device memory at `dst`.
    fn write(&self, dst: DevicePtr, data: &[u8]) -> Result<()>;

    /// Copy device memory at `src` into `out`.
    fn read(&self, src: DevicePtr, out: &mut [u8]) -> Result<()>;

    // Acceleration structures

    /// Buffer sizes needed to build `input`.
    fn accel_compute_memory_usage(
        &self,
        options: &AccelBuildOptions,
        input: &TriangleArrayInput,
    ) -> Result<AccelBufferSizes>;

    /// Build an acceleration structure into `output`.
    ///
    /// When `emit_compacted_size` is set and compaction is allowed, the
    /// compacted size is written there as a `u64`.
    fn accel_build(
        &self,
        options: &AccelBuildOptions,
        input: &TriangleArrayInput,
        temp: &RawBuffer,
        output: &RawBuffer,
        emit_compacted_size: Option<DevicePtr>,
    ) -> Result<TraversableHandle>;

    /// Copy a built structure into `output`, which must hold at least the
    /// emitted compacted size.
    fn accel_compact(
        &self,
        source: TraversableHandle,
        output: &RawBuffer,
    ) -> Result<TraversableHandle>;

    /// Forget a traversable. The backing buffer stays owned by the caller.
    fn accel_destroy(&self, handle: TraversableHandle) -> Result<()>;

    // Programs

    /// Compile a program blob. Returns the module and the compile log.
    fn module_create(
        &self,
        module_options: &ModuleCompileOptions,
        pipeline_options: &PipelineCompileOptions,
        blob: &[u8],
    ) -> Result<(ModuleHandle, String)>;

    fn module_destroy(&self, module: ModuleHandle) -> Result<()>;

    /// Create a program group. Returns the group and the device log.
    fn program_group_create(&self, desc: &ProgramGroupDesc) -> Result<(ProgramGroupHandle, String)>;

    fn program_group_destroy(&self, group: ProgramGroupHandle) -> Result<()>;

    /// Link program groups into a pipeline. Returns the pipeline and the link log.
    fn pipeline_create(
        &self,
        pipeline_options: &PipelineCompileOptions,
        link_options: &PipelineLinkOptions,
        groups: &[ProgramGroupHandle],
    ) -> Result<(PipelineHandle, String)>;

    /// Set the execution stack limits of a linked pipeline.
    fn pipeline_set_stack_size(&self, pipeline: PipelineHandle, sizes: &StackSizes) -> Result<()>;

    fn pipeline_destroy(&self, pipeline: PipelineHandle) -> Result<()>;

    /// Header size and alignment of shader binding table records.
    fn sbt_record_layout(&self) -> SbtRecordLayout;

    /// Write the device header identifying `group` into `header`.
    ///
    /// `header` must be exactly [`SbtRecordLayout::header_size`] bytes.
    fn sbt_record_pack_header(&self, group: ProgramGroupHandle, header: &mut [u8]) -> Result<()>;

    // Execution

    /// Run `pipeline` over `dims` with the parameter block at `params`.
    fn launch(
        &self,
        pipeline: PipelineHandle,
        params: DevicePtr,
        params_size: usize,
        sbt: &ShaderBindingTable,
        dims: LaunchDims,
    ) -> Result<()>;

    /// Wait until all submitted work has finished.
    fn synchronize(&self) -> Result<()>;
}

/// A shared device, so several owners can drive one backend.
impl<D: RayTracingDevice + ?Sized> RayTracingDevice for std::sync::Arc<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn alloc(&self, bytes: u64, label: &str) -> Result<RawBuffer> {
        (**self).alloc(bytes, label)
    }

    fn free(&self, buffer: RawBuffer) -> Result<()> {
        (**self).free(buffer)
    }

    fn write(&self, dst: DevicePtr, data: &[u8]) -> Result<()> {
        (**self).write(dst, data)
    }

    fn read(&self, src: DevicePtr, out: &mut [u8]) -> Result<()> {
        (**self).read(src, out)
    }

    fn accel_compute_memory_usage(
        &self,
        options: &AccelBuildOptions,
        input: &TriangleArrayInput,
    ) -> Result<AccelBufferSizes> {
        (**self).accel_compute_memory_usage(options, input)
    }

    fn accel_build(
        &self,
        options: &AccelBuildOptions,
        input: &TriangleArrayInput,
        temp: &RawBuffer,
        output: &RawBuffer,
        emit_compacted_size: Option<DevicePtr>,
    ) -> Result<TraversableHandle> {
        (**self).accel_build(options, input, temp, output, emit_compacted_size)
    }

    fn accel_compact(
        &self,
        source: TraversableHandle,
        output: &RawBuffer,
    ) -> Result<TraversableHandle> {
        (**self).accel_compact(source, output)
    }

    fn accel_destroy(&self, handle: TraversableHandle) -> Result<()> {
        (**self).accel_destroy(handle)
    }

    fn module_create(
        &self,
        module_options: &ModuleCompileOptions,
        pipeline_options: &PipelineCompileOptions,
        blob: &[u8],
    ) -> Result<(ModuleHandle, String)> {
        (**self).module_create(module_options, pipeline_options, blob)
    }

    fn module_destroy(&self, module: ModuleHandle) -> Result<()> {
        (**self).module_destroy(module)
    }

    fn program_group_create(&self, desc: &ProgramGroupDesc) -> Result<(ProgramGroupHandle, String)> {
        (**self).program_group_create(desc)
    }

    fn program_group_destroy(&self, group: ProgramGroupHandle) -> Result<()> {
        (**self).program_group_destroy(group)
    }

    fn pipeline_create(
        &self,
        pipeline_options: &PipelineCompileOptions,
        link_options: &PipelineLinkOptions,
        groups: &[ProgramGroupHandle],
    ) -> Result<(PipelineHandle, String)> {
        (**self).pipeline_create(pipeline_options, link_options, groups)
    }

    fn pipeline_set_stack_size(&self, pipeline: PipelineHandle, sizes: &StackSizes) -> Result<()> {
        (**self).pipeline_set_stack_size(pipeline, sizes)
    }

    fn pipeline_destroy(&self, pipeline: PipelineHandle) -> Result<()> {
        (**self).pipeline_destroy(pipeline)
    }

    fn sbt_record_layout(&self) -> SbtRecordLayout {
        (**self).sbt_record_layout()
    }

    fn sbt_record_pack_header(&self, group: ProgramGroupHandle, header: &mut [u8]) -> Result<()> {
        (**self).sbt_record_pack_header(group, header)
    }

    fn launch(
        &self,
        pipeline: PipelineHandle,
        params: DevicePtr,
        params_size: usize,
        sbt: &ShaderBindingTable,
        dims: LaunchDims,
    ) -> Result<()> {
        (**self).launch(pipeline, params, params_size, sbt, dims)
    }

    fn synchronize(&self) -> Result<()> {
        (**self).synchronize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_reference_pipeline() {
        let module = ModuleCompileOptions::default();
        assert_eq!(module.max_register_count, 50);

        let pipeline = PipelineCompileOptions::default();
        assert_eq!(pipeline.num_payload_values, 5);
        assert_eq!(pipeline.num_attribute_values, 2);
        assert_eq!(pipeline.launch_params_variable_name, "optixLaunchParams");

        assert_eq!(PipelineLinkOptions::default().max_trace_depth, 2);

        let stack = StackSizes::default();
        assert_eq!(stack.continuation, 2048);
        assert_eq!(stack.max_traversable_graph_depth, 1);
    }

    #[test]
    fn hitgroup_lists_present_entry_points() {
        let module = ModuleHandle::from_raw(1);
        let desc = ProgramGroupDesc::Hitgroup {
            module,
            closest_hit: Some("__closesthit__radiance".to_string()),
            any_hit: None,
        };
        assert_eq!(desc.kind(), ProgramGroupKind::Hitgroup);
        assert_eq!(desc.module(), module);
        assert_eq!(desc.entry_points(), vec!["__closesthit__radiance"]);
    }

    #[test]
    fn launch_dims_count_work_items() {
        assert_eq!(LaunchDims::new_2d(512, 512).len(), 262_144);
        assert!(LaunchDims::new_2d(0, 4).is_empty());
    }

    #[test]
    fn packed_input_uses_tight_strides() {
        let input = TriangleArrayInput::packed(DevicePtr(0x100), 8, DevicePtr(0x200), 12);
        assert_eq!(input.vertex_stride, 12);
        assert_eq!(input.index_stride, 12);
        assert_eq!(input.num_sbt_records(), 1);
    }
}
