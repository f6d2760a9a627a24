//! Program manifests and the built-in programs they bind.

use prism_gpu::{PipelineCompileOptions, ProgramGroupDesc, ProgramGroupKind};
use prism_shaders::{ProgramStage, HOST_MANIFEST_HEADER};

/// Payload slots the built-in radiance programs use: one per color channel.
pub const REQUIRED_PAYLOAD_VALUES: u32 = 3;
/// Attribute slots of built-in triangles: two barycentrics.
pub const REQUIRED_ATTRIBUTE_VALUES: u32 = 2;

/// A parsed program manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub params_symbol: String,
    pub entries: Vec<(String, ProgramStage)>,
}

impl Manifest {
    /// Parse manifest text. Errors are returned as a compile log.
    ///
    /// Blank lines and lines starting with `#` are ignored.
    pub fn parse(blob: &[u8]) -> Result<Self, String> {
        let text = std::str::from_utf8(blob)
            .map_err(|e| format!("manifest is not UTF-8: {e}"))?;
        let mut lines = text
            .lines()
            .map(str::trim)
            .enumerate()
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

        match lines.next() {
            Some((_, header)) if header == HOST_MANIFEST_HEADER => {}
            Some((n, header)) => {
                return Err(format!(
                    "line {}: expected '{HOST_MANIFEST_HEADER}', found '{header}'",
                    n + 1
                ))
            }
            None => return Err("empty manifest".to_string()),
        }

        let mut params_symbol = None;
        let mut entries: Vec<(String, ProgramStage)> = Vec::new();
        for (n, line) in lines {
            let line_no = n + 1;
            let (keyword, value) = line
                .split_once(char::is_whitespace)
                .map(|(k, v)| (k, v.trim()))
                .ok_or_else(|| format!("line {line_no}: expected '<keyword> <value>'"))?;

            match keyword {
                "params" => {
                    if params_symbol.replace(value.to_string()).is_some() {
                        return Err(format!("line {line_no}: duplicate params declaration"));
                    }
                }
                "entry" => {
                    let stage = ProgramStage::from_entry_name(value).ok_or_else(|| {
                        format!("line {line_no}: entry '{value}' has no stage prefix")
                    })?;
                    if entries.iter().any(|(name, _)| name == value) {
                        return Err(format!("line {line_no}: duplicate entry '{value}'"));
                    }
                    entries.push((value.to_string(), stage));
                }
                other => return Err(format!("line {line_no}: unknown keyword '{other}'")),
            }
        }

        let params_symbol =
            params_symbol.ok_or_else(|| "missing params declaration".to_string())?;
        Ok(Self {
            params_symbol,
            entries,
        })
    }

    /// Stage of a declared entry point.
    #[must_use]
    pub fn stage_of(&self, entry: &str) -> Option<ProgramStage> {
        self.entries
            .iter()
            .find(|(name, _)| name == entry)
            .map(|&(_, stage)| stage)
    }

    /// Check the manifest against pipeline-wide compile options.
    pub fn check_options(&self, options: &PipelineCompileOptions) -> Result<(), String> {
        if self.params_symbol != options.launch_params_variable_name {
            return Err(format!(
                "launch parameter symbol '{}' does not match pipeline option '{}'",
                self.params_symbol, options.launch_params_variable_name
            ));
        }
        if options.num_payload_values < REQUIRED_PAYLOAD_VALUES {
            return Err(format!(
                "{} payload values configured, radiance programs need {REQUIRED_PAYLOAD_VALUES}",
                options.num_payload_values
            ));
        }
        if options.num_attribute_values < REQUIRED_ATTRIBUTE_VALUES {
            return Err(format!(
                "{} attribute values configured, triangles need {REQUIRED_ATTRIBUTE_VALUES}",
                options.num_attribute_values
            ));
        }
        Ok(())
    }
}

/// Programs the host device executes, bound by entry point name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuiltinProgram {
    /// One primary radiance ray per pixel.
    RenderFrame,
    /// White background.
    RadianceMiss,
    /// Facing-ratio shading of the mesh color.
    RadianceClosestHit,
    /// Accepts every candidate.
    RadianceAnyHit,
}

impl BuiltinProgram {
    #[must_use]
    pub fn for_entry(entry: &str) -> Option<Self> {
        match entry {
            prism_shaders::RAYGEN_ENTRY => Some(Self::RenderFrame),
            prism_shaders::MISS_ENTRY => Some(Self::RadianceMiss),
            prism_shaders::CLOSEST_HIT_ENTRY => Some(Self::RadianceClosestHit),
            prism_shaders::ANY_HIT_ENTRY => Some(Self::RadianceAnyHit),
            _ => None,
        }
    }

    #[must_use]
    pub const fn stage(self) -> ProgramStage {
        match self {
            Self::RenderFrame => ProgramStage::Raygen,
            Self::RadianceMiss => ProgramStage::Miss,
            Self::RadianceClosestHit => ProgramStage::ClosestHit,
            Self::RadianceAnyHit => ProgramStage::AnyHit,
        }
    }
}

/// Programs bound to one group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundGroup {
    Raygen(BuiltinProgram),
    Miss(BuiltinProgram),
    Hitgroup {
        closest_hit: Option<BuiltinProgram>,
        any_hit: Option<BuiltinProgram>,
    },
}

impl BoundGroup {
    #[must_use]
    pub const fn kind(&self) -> ProgramGroupKind {
        match self {
            Self::Raygen(_) => ProgramGroupKind::Raygen,
            Self::Miss(_) => ProgramGroupKind::Miss,
            Self::Hitgroup { .. } => ProgramGroupKind::Hitgroup,
        }
    }

    /// Bind a group description against its module's manifest.
    pub fn bind(desc: &ProgramGroupDesc, manifest: &Manifest) -> Result<Self, String> {
        let resolve = |entry: &str, stage: ProgramStage| -> Result<BuiltinProgram, String> {
            match manifest.stage_of(entry) {
                None => return Err(format!("entry '{entry}' is not declared by the module")),
                Some(declared) if declared != stage => {
                    return Err(format!(
                        "entry '{entry}' is a {declared:?} program, expected {stage:?}"
                    ))
                }
                Some(_) => {}
            }
            BuiltinProgram::for_entry(entry)
                .ok_or_else(|| format!("no host implementation for entry '{entry}'"))
        };

        match desc {
            ProgramGroupDesc::Raygen { entry, .. } => {
                resolve(entry, ProgramStage::Raygen).map(Self::Raygen)
            }
            ProgramGroupDesc::Miss { entry, .. } => resolve(entry, ProgramStage::Miss).map(Self::Miss),
            ProgramGroupDesc::Hitgroup {
                closest_hit,
                any_hit,
                ..
            } => Ok(Self::Hitgroup {
                closest_hit: closest_hit
                    .as_deref()
                    .map(|entry| resolve(entry, ProgramStage::ClosestHit))
                    .transpose()?,
                any_hit: any_hit
                    .as_deref()
                    .map(|entry| resolve(entry, ProgramStage::AnyHit))
                    .transpose()?,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_gpu::ModuleHandle;
    use prism_shaders::ProgramBlob;

    fn reference_manifest() -> Manifest {
        Manifest::parse(ProgramBlob::host_reference().bytes()).unwrap()
    }

    #[test]
    fn parses_reference_manifest() {
        let manifest = reference_manifest();
        assert_eq!(manifest.params_symbol, "optixLaunchParams");
        assert_eq!(manifest.entries.len(), 4);
        assert_eq!(
            manifest.stage_of("__closesthit__radiance"),
            Some(ProgramStage::ClosestHit)
        );
        assert!(manifest.check_options(&PipelineCompileOptions::default()).is_ok());
    }

    #[test]
    fn rejects_bad_manifests() {
        assert!(Manifest::parse(b"").is_err());
        assert!(Manifest::parse(b"\x7fELF").is_err());
        assert!(Manifest::parse(b"PRISM-HOST-PROGRAMS 1\nentry __raygen__a\n")
            .unwrap_err()
            .contains("missing params"));
        assert!(
            Manifest::parse(b"PRISM-HOST-PROGRAMS 1\nparams p\nentry renderFrame\n")
                .unwrap_err()
                .contains("line 3")
        );
        assert!(
            Manifest::parse(b"PRISM-HOST-PROGRAMS 1\nparams p\nentry __miss__a\nentry __miss__a\n")
                .is_err()
        );
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let manifest =
            Manifest::parse(b"# programs\n\nPRISM-HOST-PROGRAMS 1\n  params p  \n\nentry __miss__x\n")
                .unwrap();
        assert_eq!(manifest.params_symbol, "p");
        assert_eq!(manifest.entries, vec![("__miss__x".to_string(), ProgramStage::Miss)]);
    }

    #[test]
    fn option_mismatches_are_reported() {
        let manifest = reference_manifest();
        let options = PipelineCompileOptions {
            launch_params_variable_name: "params".to_string(),
            ..Default::default()
        };
        assert!(manifest.check_options(&options).unwrap_err().contains("symbol"));

        let options = PipelineCompileOptions {
            num_payload_values: 2,
            ..Default::default()
        };
        assert!(manifest.check_options(&options).unwrap_err().contains("payload"));
    }

    #[test]
    fn binds_groups_by_entry_name() {
        let manifest = reference_manifest();
        let module = ModuleHandle::from_raw(1);

        let raygen = ProgramGroupDesc::Raygen {
            module,
            entry: prism_shaders::RAYGEN_ENTRY.to_string(),
        };
        assert_eq!(
            BoundGroup::bind(&raygen, &manifest),
            Ok(BoundGroup::Raygen(BuiltinProgram::RenderFrame))
        );

        let hit = ProgramGroupDesc::Hitgroup {
            module,
            closest_hit: Some(prism_shaders::CLOSEST_HIT_ENTRY.to_string()),
            any_hit: None,
        };
        assert_eq!(
            BoundGroup::bind(&hit, &manifest).map(|g| g.kind()),
            Ok(ProgramGroupKind::Hitgroup)
        );
    }

    #[test]
    fn bind_rejects_wrong_stage_and_unknown_entries() {
        let manifest = reference_manifest();
        let module = ModuleHandle::from_raw(1);

        let wrong_stage = ProgramGroupDesc::Miss {
            module,
            entry: prism_shaders::RAYGEN_ENTRY.to_string(),
        };
        assert!(BoundGroup::bind(&wrong_stage, &manifest).is_err());

        let missing = ProgramGroupDesc::Raygen {
            module,
            entry: "__raygen__other".to_string(),
        };
        assert!(BoundGroup::bind(&missing, &manifest)
            .unwrap_err()
            .contains("not declared"));

        let custom = Manifest::parse(b"PRISM-HOST-PROGRAMS 1\nparams p\nentry __raygen__other\n")
            .unwrap();
        assert!(BoundGroup::bind(&missing, &custom)
            .unwrap_err()
            .contains("no host implementation"));
    }
}
