//! Mesh slots and the host-side geometry that fills them.

use std::ops::{Index, IndexMut};
use std::path::{Path, PathBuf};

use glam::Vec3;

/// One of the two geometry sources in the scene. The discriminant is the
/// TLAS instance index, so the order is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshSlot {
    Ground = 0,
    Model = 1,
}

impl MeshSlot {
    pub const COUNT: usize = 2;
    pub const ALL: [MeshSlot; MeshSlot::COUNT] = [MeshSlot::Ground, MeshSlot::Model];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            MeshSlot::Ground => "Ground",
            MeshSlot::Model => "Model",
        }
    }
}

/// Fixed-length map from [`MeshSlot`] to `T`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotArray<T>([T; MeshSlot::COUNT]);

impl<T> SlotArray<T> {
    pub fn from_fn(mut f: impl FnMut(MeshSlot) -> T) -> Self {
        Self([f(MeshSlot::Ground), f(MeshSlot::Model)])
    }

    /// Like [`SlotArray::from_fn`] but stops at the first error.
    pub fn try_from_fn<E>(mut f: impl FnMut(MeshSlot) -> Result<T, E>) -> Result<Self, E> {
        Ok(Self([f(MeshSlot::Ground)?, f(MeshSlot::Model)?]))
    }

    pub fn iter(&self) -> impl Iterator<Item = (MeshSlot, &T)> {
        MeshSlot::ALL.into_iter().zip(self.0.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (MeshSlot, &mut T)> {
        MeshSlot::ALL.into_iter().zip(self.0.iter_mut())
    }

    pub fn map<U>(&self, mut f: impl FnMut(MeshSlot, &T) -> U) -> SlotArray<U> {
        SlotArray::from_fn(|slot| f(slot, &self[slot]))
    }

    pub fn as_slice(&self) -> &[T] {
        &self.0
    }
}

impl<T> Index<MeshSlot> for SlotArray<T> {
    type Output = T;

    fn index(&self, slot: MeshSlot) -> &T {
        &self.0[slot.index()]
    }
}

impl<T> IndexMut<MeshSlot> for SlotArray<T> {
    fn index_mut(&mut self, slot: MeshSlot) -> &mut T {
        &mut self.0[slot.index()]
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

impl Vertex {
    pub const STRIDE: u32 = std::mem::size_of::<Vertex>() as u32;

    fn new(position: [f32; 3], normal: [f32; 3]) -> Self {
        Self { position, normal }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("mesh file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: tobj::LoadError,
    },

    #[error("{0} contains no triangles")]
    Empty(String),

    #[error("{name}: index count {count} is not a multiple of 3")]
    PartialTriangle { name: String, count: usize },

    #[error("{name}: index {index} out of range for {vertex_count} vertices")]
    IndexOutOfRange {
        name: String,
        index: u32,
        vertex_count: usize,
    },
}

/// Indexed triangle list with position + normal vertices.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshData {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn validate(&self) -> Result<(), MeshError> {
        if self.indices.is_empty() || self.vertices.is_empty() {
            return Err(MeshError::Empty(self.name.clone()));
        }
        if self.indices.len() % 3 != 0 {
            return Err(MeshError::PartialTriangle {
                name: self.name.clone(),
                count: self.indices.len(),
            });
        }
        if let Some(&index) = self
            .indices
            .iter()
            .find(|&&i| i as usize >= self.vertices.len())
        {
            return Err(MeshError::IndexOutOfRange {
                name: self.name.clone(),
                index,
                vertex_count: self.vertices.len(),
            });
        }
        Ok(())
    }

    /// Replaces every normal with the area-weighted average of the faces
    /// sharing the vertex. Fails on the same meshes [`MeshData::validate`]
    /// rejects, leaving the normals untouched.
    pub fn recompute_normals(&mut self) -> Result<(), MeshError> {
        self.validate()?;
        let mut accum = vec![Vec3::ZERO; self.vertices.len()];
        for tri in self.indices.chunks_exact(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| i as usize);
            let pa = Vec3::from(self.vertices[a].position);
            let pb = Vec3::from(self.vertices[b].position);
            let pc = Vec3::from(self.vertices[c].position);
            // Unnormalized, so larger faces weigh more
            let face = (pb - pa).cross(pc - pa);
            accum[a] += face;
            accum[b] += face;
            accum[c] += face;
        }
        for (vertex, n) in self.vertices.iter_mut().zip(accum) {
            vertex.normal = n.normalize_or_zero().into();
        }
        Ok(())
    }
}

/// Unit cube used for the ground slot, each face carrying its own normal.
pub fn ground_cube() -> MeshData {
    let faces: [([f32; 3], [[f32; 3]; 4]); 6] = [
        (
            [0.0, 1.0, 0.0],
            [[-1.0, 1.0, -1.0], [1.0, 1.0, -1.0], [1.0, 1.0, 1.0], [-1.0, 1.0, 1.0]],
        ),
        (
            [0.0, -1.0, 0.0],
            [[-1.0, -1.0, -1.0], [1.0, -1.0, -1.0], [1.0, -1.0, 1.0], [-1.0, -1.0, 1.0]],
        ),
        (
            [-1.0, 0.0, 0.0],
            [[-1.0, -1.0, 1.0], [-1.0, -1.0, -1.0], [-1.0, 1.0, -1.0], [-1.0, 1.0, 1.0]],
        ),
        (
            [1.0, 0.0, 0.0],
            [[1.0, -1.0, 1.0], [1.0, -1.0, -1.0], [1.0, 1.0, -1.0], [1.0, 1.0, 1.0]],
        ),
        (
            [0.0, 0.0, -1.0],
            [[-1.0, -1.0, -1.0], [1.0, -1.0, -1.0], [1.0, 1.0, -1.0], [-1.0, 1.0, -1.0]],
        ),
        (
            [0.0, 0.0, 1.0],
            [[-1.0, -1.0, 1.0], [1.0, -1.0, 1.0], [1.0, 1.0, 1.0], [-1.0, 1.0, 1.0]],
        ),
    ];

    let vertices = faces
        .iter()
        .flat_map(|(normal, corners)| corners.iter().map(|&p| Vertex::new(p, *normal)))
        .collect();

    #[rustfmt::skip]
    let indices = vec![
        3, 1, 0,
        2, 1, 3,

        6, 4, 5,
        7, 4, 6,

        11, 9, 8,
        10, 9, 11,

        14, 12, 13,
        15, 12, 14,

        19, 17, 16,
        18, 17, 19,

        22, 20, 21,
        23, 20, 22,
    ];

    MeshData {
        name: MeshSlot::Ground.name().to_string(),
        vertices,
        indices,
    }
}

/// Imports a Wavefront OBJ file, merging all of its shapes into one mesh.
/// Normals are always recomputed from the triangles.
pub fn load_obj<P: AsRef<Path>>(path: P) -> Result<MeshData, MeshError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(MeshError::NotFound(path.to_path_buf()));
    }

    let (models, _materials) = tobj::load_obj(
        path,
        &tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        },
    )
    .map_err(|source| MeshError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut mesh = MeshData {
        name: path.display().to_string(),
        vertices: Vec::new(),
        indices: Vec::new(),
    };
    for model in &models {
        let base = mesh.vertices.len() as u32;
        mesh.vertices.extend(
            model
                .mesh
                .positions
                .chunks_exact(3)
                .map(|p| Vertex::new([p[0], p[1], p[2]], [0.0; 3])),
        );
        mesh.indices
            .extend(model.mesh.indices.iter().map(|&i| base + i));
    }

    mesh.recompute_normals()?;

    log::info!(
        "Imported {}: {} vertices, {} triangles ({} shapes)",
        mesh.name,
        mesh.vertices.len(),
        mesh.triangle_count(),
        models.len()
    );
    Ok(mesh)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TETRAHEDRON: &str = "\
o tetra
v 0.0 0.0 0.0
v 1.0 0.0 0.0
v 0.0 1.0 0.0
v 0.0 0.0 1.0
f 1 3 2
f 1 2 4
f 1 4 3
f 2 3 4
";

    #[test]
    fn test_ground_cube_layout() {
        let cube = ground_cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        assert_eq!(cube.triangle_count(), 12);
        assert!(cube.validate().is_ok());
        assert_eq!(cube.vertices[0].normal, [0.0, 1.0, 0.0]);
        assert_eq!(cube.vertices[23].normal, [0.0, 0.0, 1.0]);
        assert_eq!(cube.vertex_bytes().len(), 24 * Vertex::STRIDE as usize);
    }

    #[test]
    fn test_vertex_stride() {
        assert_eq!(Vertex::STRIDE, 24);
    }

    #[test]
    fn test_validate_rejects_out_of_range_index() {
        let mut mesh = ground_cube();
        mesh.indices[5] = 24;
        assert!(matches!(
            mesh.validate(),
            Err(MeshError::IndexOutOfRange { index: 24, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_partial_triangle() {
        let mut mesh = ground_cube();
        mesh.indices.pop();
        assert!(matches!(
            mesh.validate(),
            Err(MeshError::PartialTriangle { count: 35, .. })
        ));
    }

    #[test]
    fn test_recompute_normals_flat_quad() {
        let mut mesh = MeshData {
            name: "quad".to_string(),
            vertices: vec![
                Vertex::new([0.0, 0.0, 0.0], [0.0; 3]),
                Vertex::new([1.0, 0.0, 0.0], [0.0; 3]),
                Vertex::new([1.0, 0.0, 1.0], [0.0; 3]),
                Vertex::new([0.0, 0.0, 1.0], [0.0; 3]),
            ],
            indices: vec![0, 2, 1, 0, 3, 2],
        };
        mesh.recompute_normals().unwrap();
        for vertex in &mesh.vertices {
            assert_eq!(vertex.normal, [0.0, 1.0, 0.0]);
        }
    }

    #[test]
    fn test_recompute_normals_rejects_out_of_range_index() {
        let mut mesh = ground_cube();
        mesh.indices[5] = 99;
        assert!(matches!(
            mesh.recompute_normals(),
            Err(MeshError::IndexOutOfRange { index: 99, .. })
        ));
        assert_eq!(mesh.vertices[0].normal, [0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_load_obj_tetrahedron() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tetra.obj");
        std::fs::write(&path, TETRAHEDRON).unwrap();

        let mesh = load_obj(&path).unwrap();
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.triangle_count(), 4);
        for vertex in &mesh.vertices {
            let n = Vec3::from(vertex.normal);
            assert!((n.length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_load_obj_missing_file() {
        let err = load_obj("/nonexistent/model.obj").unwrap_err();
        assert!(matches!(err, MeshError::NotFound(_)));
    }

    #[test]
    fn test_load_obj_without_faces_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("points.obj");
        std::fs::write(&path, "v 0 0 0\nv 1 0 0\n").unwrap();
        assert!(matches!(load_obj(&path), Err(MeshError::Empty(_))));
    }

    #[test]
    fn test_slot_array_indexing() {
        let mut slots = SlotArray::from_fn(|slot| slot.index() * 10);
        assert_eq!(slots[MeshSlot::Ground], 0);
        assert_eq!(slots[MeshSlot::Model], 10);
        slots[MeshSlot::Model] = 7;
        let doubled = slots.map(|_, v| v * 2);
        assert_eq!(doubled.as_slice(), &[0, 14]);
        assert_eq!(
            slots.iter().map(|(s, _)| s).collect::<Vec<_>>(),
            MeshSlot::ALL.to_vec()
        );
    }
}
