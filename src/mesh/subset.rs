//! Subset batching.
//!
//! Finalized geometry is grouped into subsets so that all faces sharing
//! a (data group, material) pair occupy one contiguous index range and
//! draw with a single call. Subsets are ordered by data group first,
//! then material, and the compaction pass renumbers vertices in first
//! use order so each subset also owns a contiguous vertex range.

use std::collections::BTreeMap;

use crate::error::MeshError;
use crate::mesh::ingest::Triangle;

/// Opaque handle identifying a material.
///
/// The mesh never inspects materials beyond equality and ordering; the
/// handle is whatever identifier the surrounding engine hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MaterialHandle(u32);

impl MaterialHandle {
    /// Handle representing "no material assigned".
    pub const INVALID: MaterialHandle = MaterialHandle(u32::MAX);

    /// Create a handle from a raw identifier.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// The raw identifier.
    pub fn id(&self) -> u32 {
        self.0
    }

    /// Whether this handle refers to an actual material.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl Default for MaterialHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Structural key identifying a subset.
///
/// Field order doubles as sort order: subsets are laid out grouped by
/// data group, then by material within each group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubsetKey {
    /// Data group of the faces in this subset.
    pub data_group: u32,
    /// Material of the faces in this subset.
    pub material: MaterialHandle,
}

impl SubsetKey {
    /// Create a subset key.
    pub fn new(data_group: u32, material: MaterialHandle) -> Self {
        Self {
            data_group,
            material,
        }
    }
}

/// A contiguous batch of finalized geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshSubset {
    /// Key this subset was grouped under.
    pub key: SubsetKey,
    /// First face of the subset in the finalized index buffer.
    pub face_start: u32,
    /// Number of faces in the subset.
    pub face_count: u32,
    /// First vertex owned by the subset after compaction.
    pub vertex_start: u32,
    /// Number of vertices owned by the subset.
    pub vertex_count: u32,
}

/// Output of grouping the prepared triangles into subsets.
#[derive(Debug)]
pub(crate) struct SubsetBuild {
    /// Finalized index buffer, grouped by subset.
    pub indices: Vec<u32>,
    /// Subset key per finalized face, parallel to `indices / 3`.
    pub triangle_keys: Vec<SubsetKey>,
    /// Subsets in (data group, material) order.
    pub subsets: Vec<MeshSubset>,
    /// Old face index to finalized face index.
    pub face_remap: Vec<u32>,
}

/// Group triangles by subset key into contiguous index ranges.
///
/// Vertex ranges are left at zero; [`compact_vertices`] fills them in
/// after the optimizer has fixed the final face order.
pub(crate) fn build_subsets(
    triangles: &[Triangle],
    max_subsets: usize,
) -> Result<SubsetBuild, MeshError> {
    let mut groups: BTreeMap<SubsetKey, Vec<u32>> = BTreeMap::new();
    for (face, tri) in triangles.iter().enumerate() {
        groups
            .entry(SubsetKey::new(tri.data_group, tri.material))
            .or_default()
            .push(face as u32);
    }
    if groups.len() > max_subsets {
        return Err(MeshError::TooManySubsets {
            count: groups.len(),
            limit: max_subsets,
        });
    }

    let mut indices = Vec::with_capacity(triangles.len() * 3);
    let mut triangle_keys = Vec::with_capacity(triangles.len());
    let mut subsets = Vec::with_capacity(groups.len());
    let mut face_remap = vec![0u32; triangles.len()];

    for (key, faces) in groups {
        let face_start = triangle_keys.len() as u32;
        for &face in &faces {
            face_remap[face as usize] = triangle_keys.len() as u32;
            indices.extend_from_slice(&triangles[face as usize].indices);
            triangle_keys.push(key);
        }
        subsets.push(MeshSubset {
            key,
            face_start,
            face_count: faces.len() as u32,
            vertex_start: 0,
            vertex_count: 0,
        });
    }

    Ok(SubsetBuild {
        indices,
        triangle_keys,
        subsets,
        face_remap,
    })
}

/// Renumber vertices in first use order.
///
/// Rewrites the index buffer in place, fills in each subset's vertex
/// range, and returns the old-to-new vertex remap (`u32::MAX` marks a
/// vertex no finalized face references) plus the surviving count.
pub(crate) fn compact_vertices(
    indices: &mut [u32],
    subsets: &mut [MeshSubset],
    vertex_count: usize,
) -> (Vec<u32>, u32) {
    let mut remap = vec![u32::MAX; vertex_count];
    let mut next = 0u32;

    for subset in subsets.iter_mut() {
        let start = subset.face_start as usize * 3;
        let end = start + subset.face_count as usize * 3;
        subset.vertex_start = next;
        for index in &mut indices[start..end] {
            let slot = &mut remap[*index as usize];
            if *slot == u32::MAX {
                *slot = next;
                next += 1;
            }
            *index = *slot;
        }
        subset.vertex_count = next - subset.vertex_start;
    }
    (remap, next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tri(indices: [u32; 3], material: u32, data_group: u32) -> Triangle {
        Triangle::new(indices, MaterialHandle::new(material), data_group)
    }

    #[test]
    fn test_subsets_group_and_sort() {
        let triangles = [
            tri([0, 1, 2], 7, 1),
            tri([2, 3, 0], 2, 0),
            tri([3, 4, 0], 7, 1),
            tri([4, 5, 0], 2, 1),
        ];
        let build = build_subsets(&triangles, 64).unwrap();

        let keys: Vec<SubsetKey> = build.subsets.iter().map(|s| s.key).collect();
        assert_eq!(
            keys,
            vec![
                SubsetKey::new(0, MaterialHandle::new(2)),
                SubsetKey::new(1, MaterialHandle::new(2)),
                SubsetKey::new(1, MaterialHandle::new(7)),
            ]
        );
        // Faces of one key are contiguous and relative order is kept.
        assert_eq!(build.subsets[2].face_start, 2);
        assert_eq!(build.subsets[2].face_count, 2);
        assert_eq!(build.face_remap, vec![2, 0, 3, 1]);
        assert_eq!(&build.indices[6..9], &[0, 1, 2]);
        assert_eq!(build.triangle_keys.len(), 4);
    }

    #[test]
    fn test_subset_limit() {
        let triangles = [tri([0, 1, 2], 0, 0), tri([0, 1, 2], 1, 0)];
        let err = build_subsets(&triangles, 1).unwrap_err();
        assert!(matches!(
            err,
            MeshError::TooManySubsets { count: 2, limit: 1 }
        ));
    }

    #[test]
    fn test_compact_vertices_partitions() {
        let triangles = [
            tri([5, 1, 2], 0, 0),
            tri([2, 1, 7], 0, 0),
            tri([3, 4, 0], 1, 0),
        ];
        let mut build = build_subsets(&triangles, 64).unwrap();
        let (remap, count) = compact_vertices(&mut build.indices, &mut build.subsets, 8);

        assert_eq!(count, 7);
        // Vertex 6 was never referenced.
        assert_eq!(remap[6], u32::MAX);

        // Subset 0 owns vertices [0, 4), subset 1 owns [4, 7).
        assert_eq!(build.subsets[0].vertex_start, 0);
        assert_eq!(build.subsets[0].vertex_count, 4);
        assert_eq!(build.subsets[1].vertex_start, 4);
        assert_eq!(build.subsets[1].vertex_count, 3);

        // First use order inside subset 0.
        assert_eq!(&build.indices[..6], &[0, 1, 2, 2, 1, 3]);
        // Subset 1 indices all fall inside its vertex range.
        assert!(build.indices[6..].iter().all(|&i| (4..7).contains(&i)));
    }
}
