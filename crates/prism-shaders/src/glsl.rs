//! GLSL sources of the radiance programs for the Vulkan backend.
//!
//! The Vulkan backend expects a single SPIR-V module whose entry points carry
//! the stage-prefixed names. Compile each stage with its entry renamed, then
//! link:
//!
//! ```text
//! glslangValidator --target-env vulkan1.3 -e __raygen__renderFrame --source-entrypoint main -o rg.spv raygen.rgen
//! glslangValidator --target-env vulkan1.3 -e __miss__radiance --source-entrypoint main -o ms.spv miss.rmiss
//! glslangValidator --target-env vulkan1.3 -e __closesthit__radiance --source-entrypoint main -o ch.spv closesthit.rchit
//! glslangValidator --target-env vulkan1.3 -e __anyhit__radiance --source-entrypoint main -o ah.spv anyhit.rahit
//! spirv-link rg.spv ms.spv ch.spv ah.spv -o radiance.spv
//! ```

use crate::ProgramStage;

/// Declarations shared by every stage.
pub const COMMON: &str = include_str!("../glsl/common.glsl");

/// One stage source.
#[derive(Clone, Copy, Debug)]
pub struct GlslSource {
    pub stage: ProgramStage,
    /// Entry point name after renaming.
    pub entry: &'static str,
    pub file_name: &'static str,
    pub source: &'static str,
}

/// Every stage source, in pipeline group order.
pub const SOURCES: [GlslSource; 4] = [
    GlslSource {
        stage: ProgramStage::Raygen,
        entry: crate::RAYGEN_ENTRY,
        file_name: "raygen.rgen",
        source: include_str!("../glsl/raygen.rgen"),
    },
    GlslSource {
        stage: ProgramStage::Miss,
        entry: crate::MISS_ENTRY,
        file_name: "miss.rmiss",
        source: include_str!("../glsl/miss.rmiss"),
    },
    GlslSource {
        stage: ProgramStage::ClosestHit,
        entry: crate::CLOSEST_HIT_ENTRY,
        file_name: "closesthit.rchit",
        source: include_str!("../glsl/closesthit.rchit"),
    },
    GlslSource {
        stage: ProgramStage::AnyHit,
        entry: crate::ANY_HIT_ENTRY,
        file_name: "anyhit.rahit",
        source: include_str!("../glsl/anyhit.rahit"),
    },
];
