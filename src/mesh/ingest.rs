//! Vertex and triangle ingestion.
//!
//! During a preparation pass the mesh accumulates raw interleaved vertex
//! bytes and whole-triangle records in [`PreparationData`]. Each vertex
//! is tagged with [`SourceFlags`] describing which optional tangent-space
//! attributes arrived with usable values; the derivation stage later
//! fills in the rest.

use bitflags::bitflags;

use crate::error::MeshError;
use crate::layout::{VertexAttributeSemantic, VertexLayout};
use crate::mesh::subset::MaterialHandle;

bitflags! {
    /// Which optional attributes a source vertex supplied with valid data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SourceFlags: u8 {
        /// The vertex arrived with a usable normal.
        const NORMAL = 1 << 0;
        /// The vertex arrived with a usable binormal.
        const BINORMAL = 1 << 1;
        /// The vertex arrived with a usable tangent.
        const TANGENT = 1 << 2;
    }
}

/// A single triangle as submitted during ingestion.
///
/// Triangles exist only while the mesh is open for preparation; at
/// finalize time they are decomposed into per-subset index ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Triangle {
    /// The three vertex indices, in submission winding order.
    pub indices: [u32; 3],
    /// Material assigned to this triangle.
    pub material: MaterialHandle,
    /// User-assigned data group, partitioning faces independently of material.
    pub data_group: u32,
}

impl Triangle {
    /// Create a new triangle record.
    pub fn new(indices: [u32; 3], material: MaterialHandle, data_group: u32) -> Self {
        Self {
            indices,
            material,
            data_group,
        }
    }
}

/// Mutable state of an open preparation pass.
#[derive(Debug, Default)]
pub(crate) struct PreparationData {
    /// Interleaved vertex bytes in the active layout.
    pub vertex_data: Vec<u8>,
    /// Per-vertex source flags, parallel to the vertex buffer.
    pub vertex_flags: Vec<SourceFlags>,
    /// Triangles submitted so far.
    pub triangles: Vec<Triangle>,
    /// Number of vertices ingested.
    pub vertex_count: u32,
}

impl PreparationData {
    /// Drop all accumulated data, keeping allocations.
    pub fn clear(&mut self) {
        self.vertex_data.clear();
        self.vertex_flags.clear();
        self.triangles.clear();
        self.vertex_count = 0;
    }

    /// Append raw interleaved vertices, returning how many were added.
    ///
    /// The data length must be a whole multiple of the layout stride.
    pub fn add_vertices(&mut self, layout: &VertexLayout, data: &[u8]) -> Result<u32, MeshError> {
        let stride = layout.stride as usize;
        if stride == 0 || data.len() % stride != 0 {
            return Err(MeshError::InvalidVertexData {
                len: data.len(),
                stride,
            });
        }
        let added = (data.len() / stride) as u32;
        let base = self.vertex_count as usize;
        self.vertex_data.extend_from_slice(data);
        self.vertex_count += added;

        for i in 0..added as usize {
            self.vertex_flags
                .push(source_flags(layout, &self.vertex_data, base + i));
        }
        Ok(added)
    }

    /// Append whole triangles referencing already-ingested vertices.
    ///
    /// Fails without appending anything when an index is out of range or
    /// the index count is not a multiple of three.
    pub fn add_triangles(
        &mut self,
        indices: &[u32],
        material: MaterialHandle,
        data_group: u32,
    ) -> Result<(), MeshError> {
        if indices.len() % 3 != 0 {
            return Err(MeshError::InvalidIndexCount(indices.len()));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.vertex_count) {
            return Err(MeshError::IndexOutOfRange {
                index: bad,
                vertex_count: self.vertex_count,
            });
        }
        for tri in indices.chunks_exact(3) {
            self.triangles
                .push(Triangle::new([tri[0], tri[1], tri[2]], material, data_group));
        }
        Ok(())
    }

    /// Duplicate a vertex (bytes and flags), returning the new index.
    ///
    /// Used by the bone palette builder when a vertex is referenced by
    /// faces assigned to different palettes.
    pub fn duplicate_vertex(&mut self, layout: &VertexLayout, vertex: u32) -> u32 {
        let stride = layout.stride as usize;
        let start = vertex as usize * stride;
        let copy: Vec<u8> = self.vertex_data[start..start + stride].to_vec();
        self.vertex_data.extend_from_slice(&copy);
        self.vertex_flags.push(self.vertex_flags[vertex as usize]);
        let new_index = self.vertex_count;
        self.vertex_count += 1;
        new_index
    }
}

/// Compute the source flags for one ingested vertex.
///
/// An attribute counts as supplied when the layout carries it and the
/// stored value is finite with a nonzero direction component.
fn source_flags(layout: &VertexLayout, data: &[u8], vertex: usize) -> SourceFlags {
    let mut flags = SourceFlags::empty();
    let usable = |v: Option<crate::math::Vec3>| {
        v.is_some_and(|v| v.x.is_finite() && v.y.is_finite() && v.z.is_finite() && v.norm_squared() > 1e-12)
    };

    if usable(layout.read_vec3(data, vertex, VertexAttributeSemantic::Normal)) {
        flags |= SourceFlags::NORMAL;
    }
    if usable(layout.read_vec3(data, vertex, VertexAttributeSemantic::Binormal)) {
        flags |= SourceFlags::BINORMAL;
    }
    if usable(layout.read_vec3(data, vertex, VertexAttributeSemantic::Tangent)) {
        flags |= SourceFlags::TANGENT;
    }
    flags
}
