//! Wavefront OBJ loading.
//!
//! Every object in the file is triangulated and merged into one
//! [`TriangleMesh`]. Only positions are kept, so corners that differ only in
//! texture coordinate or normal collapse into one vertex.

use std::path::Path;

use glam::{UVec3, Vec3};
use hashbrown::hash_map::{Entry, HashMap};

use crate::error::{Error, Result};
use crate::mesh::TriangleMesh;
use crate::scene::SCENE_COLOR;

impl TriangleMesh {
    /// Load and merge every object of an OBJ file.
    ///
    /// The surface color is the diffuse color of the first material any
    /// object uses, or [`SCENE_COLOR`] when the file has none. A missing or
    /// broken material library is not an error.
    pub fn load_obj(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = tobj::LoadOptions {
            triangulate: true,
            ignore_points: true,
            ignore_lines: true,
            ..Default::default()
        };
        let (models, materials) = tobj::load_obj(path, &options).map_err(|e| Error::ModelLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let materials = materials.unwrap_or_else(|e| {
            tracing::warn!("Ignoring materials of {}: {e}", path.display());
            Vec::new()
        });

        let mut mesh = Self::new().with_color(SCENE_COLOR);
        // (object, position index) -> merged vertex index
        let mut known: HashMap<(usize, u32), u32> = HashMap::new();

        for (object, model) in models.iter().enumerate() {
            let source = &model.mesh;
            if source.indices.len() % 3 != 0 {
                return Err(Error::InvalidData(format!(
                    "object '{}' has {} indices after triangulation",
                    model.name,
                    source.indices.len()
                )));
            }

            for triangle in source.indices.chunks_exact(3) {
                let mut corners = [0u32; 3];
                for (corner, &index) in corners.iter_mut().zip(triangle) {
                    *corner = match known.entry((object, index)) {
                        Entry::Occupied(entry) => *entry.get(),
                        Entry::Vacant(entry) => {
                            let start = index as usize * 3;
                            let position =
                                source.positions.get(start..start + 3).ok_or_else(|| {
                                    Error::InvalidData(format!(
                                        "object '{}' references missing position {index}",
                                        model.name
                                    ))
                                })?;
                            let merged = mesh.vertices.len() as u32;
                            mesh.vertices.push(Vec3::from_slice(position));
                            *entry.insert(merged)
                        }
                    };
                }
                mesh.indices.push(UVec3::from_array(corners));
            }
        }

        if mesh.is_empty() {
            return Err(Error::InvalidData(format!(
                "{} contains no triangles",
                path.display()
            )));
        }

        if let Some(diffuse) = models
            .iter()
            .filter_map(|model| model.mesh.material_id)
            .filter_map(|id| materials.get(id))
            .find_map(|material| material.diffuse)
        {
            mesh.color = Vec3::from_array(diffuse);
        }

        tracing::info!(
            "Loaded {}: {} objects, {} vertices, {} triangles",
            path.display(),
            models.len(),
            mesh.vertex_count(),
            mesh.triangle_count()
        );
        Ok(mesh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::fs;
    use tempfile::TempDir;

    fn write_obj(dir: &TempDir, name: &str, text: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn quad_is_triangulated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_obj(
            &dir,
            "quad.obj",
            "v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nf 1 2 3 4\n",
        );
        let mesh = TriangleMesh::load_obj(&path).unwrap();
        assert_eq!(mesh.triangle_count(), 2);
        assert_eq!(mesh.vertex_count(), 4);
        assert!(mesh.validate().is_ok());
        assert_eq!(mesh.color, SCENE_COLOR);
    }

    #[test]
    fn corners_sharing_a_position_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        // Both triangles use positions 1 and 3 with different normals and uvs
        let path = write_obj(
            &dir,
            "split.obj",
            "v 0 0 0\nv 2 0 0\nv 2 2 0\nv 0 2 0\n\
             vt 0 0\nvt 1 0\nvt 1 1\nvt 0 1\n\
             vn 0 0 1\nvn 0 0 -1\n\
             f 1/1/1 2/2/1 3/3/1\n\
             f 1/4/2 3/1/2 4/2/2\n",
        );
        let mesh = TriangleMesh::load_obj(&path).unwrap();
        assert_eq!(mesh.triangle_count(), 2);
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.indices[0].x, mesh.indices[1].x);
        assert_eq!(mesh.indices[0].z, mesh.indices[1].y);
    }

    #[test]
    fn unreferenced_positions_are_dropped_and_indices_stay_in_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_obj(
            &dir,
            "sparse.obj",
            "v 9 9 9\nv 0 0 0\nv 1 0 0\nv 0 1 0\nv 8 8 8\nf 2 3 4\n",
        );
        let mesh = TriangleMesh::load_obj(&path).unwrap();
        assert_eq!(mesh.vertex_count(), 3);
        assert!(mesh.validate().is_ok());
        assert!(mesh
            .indices
            .iter()
            .all(|tri| tri.max_element() < mesh.vertex_count() as u32));

        let bounds = mesh.bounds();
        assert_eq!(bounds.min, Vec3::ZERO);
        assert_eq!(bounds.max, Vec3::new(1.0, 1.0, 0.0));
    }

    #[test]
    fn objects_are_merged_into_one_mesh() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_obj(
            &dir,
            "two.obj",
            "o a\nv 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n\
             o b\nv 0 0 5\nv 1 0 5\nv 0 1 5\nf 4 5 6\n",
        );
        let mesh = TriangleMesh::load_obj(&path).unwrap();
        assert_eq!(mesh.triangle_count(), 2);
        assert_eq!(mesh.vertex_count(), 6);
        assert!(mesh.validate().is_ok());
        assert_relative_eq!(mesh.bounds().max.z, 5.0);
    }

    #[test]
    fn diffuse_color_comes_from_the_material_library() {
        let dir = tempfile::tempdir().unwrap();
        write_obj(&dir, "paint.mtl", "newmtl red\nKd 0.9 0.1 0.1\n");
        let path = write_obj(
            &dir,
            "painted.obj",
            "mtllib paint.mtl\nv 0 0 0\nv 1 0 0\nv 0 1 0\nusemtl red\nf 1 2 3\n",
        );
        let mesh = TriangleMesh::load_obj(&path).unwrap();
        assert_relative_eq!(mesh.color.x, 0.9);
        assert_relative_eq!(mesh.color.y, 0.1);
        assert_relative_eq!(mesh.color.z, 0.1);
    }

    #[test]
    fn missing_material_library_keeps_default_color() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_obj(
            &dir,
            "lost.obj",
            "mtllib nowhere.mtl\nv 0 0 0\nv 1 0 0\nv 0 1 0\nusemtl red\nf 1 2 3\n",
        );
        let mesh = TriangleMesh::load_obj(&path).unwrap();
        assert_eq!(mesh.color, SCENE_COLOR);
    }

    #[test]
    fn file_without_faces_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_obj(&dir, "points.obj", "v 0 0 0\nv 1 0 0\n");
        assert!(matches!(
            TriangleMesh::load_obj(&path),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.obj");
        match TriangleMesh::load_obj(&path) {
            Err(Error::ModelLoad { path: reported, .. }) => {
                assert!(reported.ends_with("absent.obj"));
            }
            other => panic!("expected a load error, got {other:?}"),
        }
    }
}
