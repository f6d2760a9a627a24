//! Command-line configuration.

use std::path::PathBuf;

use anyhow::{bail, Context};
use prism_core::scene::{camera_for_bounds, standard_camera, two_boxes};
use prism_core::{Camera, TriangleMesh};

/// Device the frame is rendered on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Backend {
    /// CPU reference device.
    #[default]
    Host,
    /// Vulkan ray tracing pipeline.
    Vulkan,
}

impl std::str::FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "host" => Ok(Self::Host),
            "vulkan" => Ok(Self::Vulkan),
            other => bail!("unknown backend '{other}', expected 'host' or 'vulkan'"),
        }
    }
}

/// Viewer options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewerConfig {
    pub width: u32,
    pub height: u32,
    /// PNG written after the frame.
    pub output: PathBuf,
    /// Compiled program blob; the host device falls back to its built-in
    /// manifest.
    pub blob: Option<PathBuf>,
    /// OBJ scene to render instead of the stock two boxes.
    pub model: Option<PathBuf>,
    pub backend: Backend,
    /// Optional text dump of per-pixel hit positions.
    pub hits: Option<PathBuf>,
    pub help: bool,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            width: 1200,
            height: 1024,
            output: PathBuf::from("prism.png"),
            blob: None,
            model: None,
            backend: Backend::Host,
            hits: None,
            help: false,
        }
    }
}

impl ViewerConfig {
    /// Parse from the process arguments.
    pub fn from_args() -> anyhow::Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        Self::parse_args(&args)
    }

    /// Parse from a slice of arguments, the first being the program name.
    pub fn parse_args(args: &[String]) -> anyhow::Result<Self> {
        let mut config = Self::default();
        let mut iter = args.iter().skip(1);

        while let Some(arg) = iter.next() {
            let mut value = || {
                iter.next()
                    .with_context(|| format!("missing value for {arg}"))
            };
            match arg.as_str() {
                "-W" | "--width" => config.width = parse_dimension(arg, value()?)?,
                "-H" | "--height" => config.height = parse_dimension(arg, value()?)?,
                "-o" | "--output" => config.output = PathBuf::from(value()?),
                "-b" | "--blob" => config.blob = Some(PathBuf::from(value()?)),
                "-m" | "--model" => config.model = Some(PathBuf::from(value()?)),
                "--backend" => config.backend = value()?.parse()?,
                "--hits" => config.hits = Some(PathBuf::from(value()?)),
                "-h" | "--help" => config.help = true,
                other => bail!("unknown argument '{other}'"),
            }
        }
        Ok(config)
    }

    /// The scene to render and a camera framing it.
    ///
    /// Without `--model` this is the stock scene and its camera.
    pub fn scene(&self) -> anyhow::Result<(TriangleMesh, Camera)> {
        match &self.model {
            Some(path) => {
                let mesh = TriangleMesh::load_obj(path)
                    .with_context(|| format!("failed to load model {}", path.display()))?;
                let camera = camera_for_bounds(&mesh.bounds());
                Ok((mesh, camera))
            }
            None => Ok((two_boxes(), standard_camera())),
        }
    }
}

fn parse_dimension(flag: &str, value: &str) -> anyhow::Result<u32> {
    let parsed: u32 = value
        .parse()
        .with_context(|| format!("{flag} expects a pixel count, got '{value}'"))?;
    if parsed == 0 {
        bail!("{flag} must be greater than zero");
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("prism-viewer")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_without_arguments() {
        let config = ViewerConfig::parse_args(&args(&[])).unwrap();
        assert_eq!(config, ViewerConfig::default());
    }

    #[test]
    fn parses_every_flag() {
        let config = ViewerConfig::parse_args(&args(&[
            "--width", "640", "-H", "480", "-o", "out.png", "--blob", "radiance.spv",
            "--backend", "vulkan", "--hits", "hits.txt", "--model", "sponza.obj",
        ]))
        .unwrap();
        assert_eq!(config.width, 640);
        assert_eq!(config.height, 480);
        assert_eq!(config.output, PathBuf::from("out.png"));
        assert_eq!(config.blob, Some(PathBuf::from("radiance.spv")));
        assert_eq!(config.backend, Backend::Vulkan);
        assert_eq!(config.hits, Some(PathBuf::from("hits.txt")));
        assert_eq!(config.model, Some(PathBuf::from("sponza.obj")));
    }

    #[test]
    fn stock_scene_without_model() {
        let (mesh, camera) = ViewerConfig::default().scene().unwrap();
        assert_eq!(mesh, two_boxes());
        assert_eq!(camera, standard_camera());
    }

    #[test]
    fn model_scene_is_loaded_and_framed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tri.obj");
        std::fs::write(&path, "v 0 0 0\nv 4 0 0\nv 0 4 0\nf 1 2 3\n").unwrap();

        let config = ViewerConfig::parse_args(&args(&["-m", path.to_str().unwrap()])).unwrap();
        let (mesh, camera) = config.scene().unwrap();
        assert_eq!(mesh.triangle_count(), 1);
        assert_eq!(camera.at, mesh.bounds().center());

        let missing = ViewerConfig {
            model: Some(dir.path().join("absent.obj")),
            ..ViewerConfig::default()
        };
        assert!(missing.scene().is_err());
    }

    #[test]
    fn rejects_bad_input() {
        assert!(ViewerConfig::parse_args(&args(&["--width"])).is_err());
        assert!(ViewerConfig::parse_args(&args(&["--width", "0"])).is_err());
        assert!(ViewerConfig::parse_args(&args(&["--height", "tall"])).is_err());
        assert!(ViewerConfig::parse_args(&args(&["--backend", "metal"])).is_err());
        assert!(ViewerConfig::parse_args(&args(&["--fullscreen"])).is_err());
    }
}
