//! Renderer configuration.

use prism_core::constants::COS_FOVY;
use prism_gpu::{
    DebugLevel, ModuleCompileOptions, OptimizationLevel, PipelineCompileOptions,
    PipelineLinkOptions, StackSizes,
};
use serde::{Deserialize, Serialize};

/// Entry point names the pipeline binds its program groups to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoints {
    pub raygen: String,
    pub miss: String,
    pub closest_hit: String,
    pub any_hit: String,
}

impl Default for EntryPoints {
    fn default() -> Self {
        Self {
            raygen: prism_shaders::RAYGEN_ENTRY.to_string(),
            miss: prism_shaders::MISS_ENTRY.to_string(),
            closest_hit: prism_shaders::CLOSEST_HIT_ENTRY.to_string(),
            any_hit: prism_shaders::ANY_HIT_ENTRY.to_string(),
        }
    }
}

/// Configuration fixed at renderer construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RendererConfig {
    /// Options for compiling the program blob.
    pub module: ModuleCompileOptions,
    /// Options shared by every program group of the pipeline.
    pub pipeline: PipelineCompileOptions,
    /// Options for linking the pipeline.
    pub link: PipelineLinkOptions,
    /// Execution stack limits applied after linking.
    pub stack_sizes: StackSizes,
    /// Entry point names inside the blob.
    pub entry_points: EntryPoints,
    /// Field-of-view factor scaling the camera basis.
    pub cos_fovy: f32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            module: ModuleCompileOptions::default(),
            pipeline: PipelineCompileOptions::default(),
            link: PipelineLinkOptions::default(),
            stack_sizes: StackSizes::default(),
            entry_points: EntryPoints::default(),
            cos_fovy: COS_FOVY,
        }
    }
}

impl RendererConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-thread register budget of the module.
    #[must_use]
    pub fn with_max_register_count(mut self, count: u32) -> Self {
        self.module.max_register_count = count;
        self
    }

    /// Set the module optimization level.
    #[must_use]
    pub fn with_opt_level(mut self, level: OptimizationLevel) -> Self {
        self.module.opt_level = level;
        self
    }

    /// Set the debug level of both the module and the pipeline link.
    #[must_use]
    pub fn with_debug_level(mut self, level: DebugLevel) -> Self {
        self.module.debug_level = level;
        self.link.debug_level = level;
        self
    }

    /// Set the number of 32-bit payload values.
    #[must_use]
    pub fn with_payload_values(mut self, count: u32) -> Self {
        self.pipeline.num_payload_values = count;
        self
    }

    /// Set the name of the launch parameter block.
    #[must_use]
    pub fn with_launch_params_name(mut self, name: impl Into<String>) -> Self {
        self.pipeline.launch_params_variable_name = name.into();
        self
    }

    /// Set the maximum trace depth.
    #[must_use]
    pub fn with_max_trace_depth(mut self, depth: u32) -> Self {
        self.link.max_trace_depth = depth;
        self
    }

    /// Set the execution stack limits.
    #[must_use]
    pub fn with_stack_sizes(mut self, sizes: StackSizes) -> Self {
        self.stack_sizes = sizes;
        self
    }

    /// Set the entry point names.
    #[must_use]
    pub fn with_entry_points(mut self, entry_points: EntryPoints) -> Self {
        self.entry_points = entry_points;
        self
    }

    /// Set the field-of-view factor.
    #[must_use]
    pub fn with_cos_fovy(mut self, cos_fovy: f32) -> Self {
        self.cos_fovy = cos_fovy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_pipeline() {
        let config = RendererConfig::default();
        assert_eq!(config.module.max_register_count, 50);
        assert_eq!(config.pipeline.num_payload_values, 5);
        assert_eq!(config.pipeline.num_attribute_values, 2);
        assert_eq!(
            config.pipeline.launch_params_variable_name,
            prism_shaders::LAUNCH_PARAMS_SYMBOL
        );
        assert_eq!(config.link.max_trace_depth, 2);
        assert_eq!(config.stack_sizes.continuation, 2048);
        assert_eq!(config.stack_sizes.max_traversable_graph_depth, 1);
        assert_eq!(config.entry_points.raygen, "__raygen__renderFrame");
        assert!((config.cos_fovy - 0.66).abs() < f32::EPSILON);
    }

    #[test]
    fn builder_sets_fields() {
        let config = RendererConfig::new()
            .with_max_register_count(0)
            .with_debug_level(DebugLevel::Full)
            .with_max_trace_depth(1)
            .with_launch_params_name("params")
            .with_cos_fovy(0.5);

        assert_eq!(config.module.max_register_count, 0);
        assert_eq!(config.module.debug_level, DebugLevel::Full);
        assert_eq!(config.link.debug_level, DebugLevel::Full);
        assert_eq!(config.link.max_trace_depth, 1);
        assert_eq!(config.pipeline.launch_params_variable_name, "params");
        assert!((config.cos_fovy - 0.5).abs() < f32::EPSILON);
    }
}
