// Mesh data and OBJ loading

use anyhow::{ensure, Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use std::mem::offset_of;
use std::path::Path;

/// Interleaved vertex as the vertex shader reads it
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub const POSITION_OFFSET: usize = offset_of!(Vertex, position);
    pub const COLOR_OFFSET: usize = offset_of!(Vertex, color);
    pub const UV_OFFSET: usize = offset_of!(Vertex, uv);
}

#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    /// Load every model in an OBJ file into one mesh
    pub fn load_obj(path: &Path) -> Result<Self> {
        let (models, _materials) = tobj::load_obj(path, &Self::load_options())
            .with_context(|| format!("Failed to load OBJ {:?}", path))?;

        let mesh = Self::from_models(&models)?;
        log::info!(
            "Loaded {:?}: {} models, {} vertices, {} triangles",
            path,
            models.len(),
            mesh.vertices.len(),
            mesh.indices.len() / 3
        );
        Ok(mesh)
    }

    /// Load the OBJ at `path`, or fall back to a unit cube when it is missing
    pub fn load_or_cube(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_obj(path)
        } else {
            log::warn!("Model {:?} not found, drawing a cube instead", path);
            Ok(Self::cube())
        }
    }

    fn load_options() -> tobj::LoadOptions {
        tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        }
    }

    /// Concatenate tobj models, offsetting each model's indices
    pub fn from_models(models: &[tobj::Model]) -> Result<Self> {
        let mut mesh = Mesh::default();

        for model in models {
            let source = &model.mesh;
            let base = mesh.vertices.len() as u32;
            let vertex_count = source.positions.len() / 3;
            let has_uv = source.texcoords.len() / 2 == vertex_count;
            let has_color = source.vertex_color.len() / 3 == vertex_count;

            mesh.vertices.extend((0..vertex_count).map(|i| Vertex {
                position: [
                    source.positions[3 * i],
                    source.positions[3 * i + 1],
                    source.positions[3 * i + 2],
                ],
                color: if has_color {
                    [
                        source.vertex_color[3 * i],
                        source.vertex_color[3 * i + 1],
                        source.vertex_color[3 * i + 2],
                    ]
                } else {
                    [1.0, 1.0, 1.0]
                },
                // OBJ puts v=0 at the bottom, Vulkan samples top-down
                uv: if has_uv {
                    [source.texcoords[2 * i], 1.0 - source.texcoords[2 * i + 1]]
                } else {
                    [0.0, 0.0]
                },
            }));

            ensure!(
                source.indices.iter().all(|&i| (i as usize) < vertex_count),
                "Model '{}' indexes past its {} vertices",
                model.name,
                vertex_count
            );
            mesh.indices.extend(source.indices.iter().map(|&i| base + i));
        }

        ensure!(!mesh.indices.is_empty(), "Mesh has no triangles");
        Ok(mesh)
    }

    /// Unit cube centered on the origin, one color and full uv square per face
    pub fn cube() -> Self {
        // (outward normal, u axis, v axis) with u x v = normal, so the
        // corner order below winds counter-clockwise seen from outside
        let faces: [(Vec3, Vec3, Vec3, [f32; 3]); 6] = [
            (Vec3::X, Vec3::Y, Vec3::Z, [0.9, 0.3, 0.3]),
            (Vec3::NEG_X, Vec3::Z, Vec3::Y, [0.3, 0.9, 0.3]),
            (Vec3::Y, Vec3::Z, Vec3::X, [0.3, 0.3, 0.9]),
            (Vec3::NEG_Y, Vec3::X, Vec3::Z, [0.9, 0.9, 0.3]),
            (Vec3::Z, Vec3::X, Vec3::Y, [0.9, 0.3, 0.9]),
            (Vec3::NEG_Z, Vec3::Y, Vec3::X, [0.3, 0.9, 0.9]),
        ];
        let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

        let mut mesh = Mesh::default();
        for (normal, u, v, color) in faces {
            let base = mesh.vertices.len() as u32;
            for (su, sv) in corners {
                let position = (normal + u * su + v * sv) * 0.5;
                mesh.vertices.push(Vertex {
                    position: position.to_array(),
                    color,
                    uv: [(su + 1.0) * 0.5, 1.0 - (sv + 1.0) * 0.5],
                });
            }
            mesh.indices
                .extend([0u32, 1, 2, 2, 3, 0].iter().map(|&i| base + i));
        }
        mesh
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const TWO_OBJECTS: &str = "\
o first
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vt 0 0
vt 1 0
vt 1 1
vt 0 1
f 1/1 2/2 3/3 4/4
o second
v 0 0 1
v 1 0 1
v 0 1 1
f 5/1 6/2 7/4
";

    fn parse(source: &str) -> Vec<tobj::Model> {
        let (models, _) = tobj::load_obj_buf(
            &mut Cursor::new(source),
            &Mesh::load_options(),
            |_| Ok(Default::default()),
        )
        .unwrap();
        models
    }

    #[test]
    fn models_are_concatenated_with_index_offsets() {
        let mesh = Mesh::from_models(&parse(TWO_OBJECTS)).unwrap();

        assert_eq!(mesh.vertices.len(), 7);
        // Quad triangulates into two triangles, plus one triangle
        assert_eq!(mesh.index_count(), 9);
        assert!(mesh.indices[..6].iter().all(|&i| i < 4));
        assert!(mesh.indices[6..].iter().all(|&i| (4..7).contains(&i)));
    }

    #[test]
    fn v_coordinate_is_flipped() {
        let mesh = Mesh::from_models(&parse(TWO_OBJECTS)).unwrap();

        let corner = mesh
            .vertices
            .iter()
            .find(|v| v.position == [1.0, 1.0, 0.0])
            .unwrap();
        assert_eq!(corner.uv, [1.0, 0.0]);
        assert_eq!(corner.color, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn empty_obj_is_rejected() {
        assert!(Mesh::from_models(&parse("v 0 0 0\n")).is_err());
    }

    #[test]
    fn cube_faces_wind_counter_clockwise_from_outside() {
        let cube = Mesh::cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.index_count(), 36);

        for triangle in cube.indices.chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|k| Vec3::from(cube.vertices[triangle[k] as usize].position));
            let face_normal = (b - a).cross(c - a);
            let centroid = (a + b + c) / 3.0;
            assert!(face_normal.dot(centroid) > 0.0);
        }
    }

    #[test]
    fn missing_model_falls_back_to_cube() {
        let mesh = Mesh::load_or_cube(Path::new("does/not/exist.obj")).unwrap();
        assert_eq!(mesh.index_count(), 36);
    }
}
