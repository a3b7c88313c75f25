//! Face adjacency over shared positions.
//!
//! Two faces are adjacent when they share an edge whose endpoint
//! positions match after quantization, regardless of which vertex
//! indices carry those positions. This lets the normal generator walk
//! across seams where texture coordinates split the index space.

use std::collections::HashMap;

use crate::layout::{VertexAttributeSemantic, VertexLayout};
use crate::mesh::ingest::Triangle;

/// Marker for an open (boundary) edge.
pub(crate) const NO_ADJACENT: u32 = u32::MAX;

/// Grid size used to match positions across split vertices.
const POSITION_QUANTUM: f32 = 1e-5;

pub(crate) type PositionKey = [i64; 3];

/// Quantize a vertex position for structural matching.
pub(crate) fn position_key(layout: &VertexLayout, data: &[u8], vertex: u32) -> PositionKey {
    let p = layout
        .read_vec3(data, vertex as usize, VertexAttributeSemantic::Position)
        .unwrap_or_default();
    [
        (p.x / POSITION_QUANTUM).round() as i64,
        (p.y / POSITION_QUANTUM).round() as i64,
        (p.z / POSITION_QUANTUM).round() as i64,
    ]
}

/// Quantized position key per ingested vertex.
pub(crate) fn position_keys(
    layout: &VertexLayout,
    data: &[u8],
    vertex_count: u32,
) -> Vec<PositionKey> {
    (0..vertex_count)
        .map(|v| position_key(layout, data, v))
        .collect()
}

/// Build the adjacency table for a triangle list.
///
/// The result holds one entry per face edge (`faces * 3`): entry
/// `f * 3 + e` is the face across edge `e` of face `f` (the edge from
/// corner `e` to corner `(e + 1) % 3`), or [`NO_ADJACENT`]. When more
/// than two faces meet at an edge the first registered face wins.
pub(crate) fn build_adjacency(keys: &[PositionKey], triangles: &[Triangle]) -> Vec<u32> {
    let mut edges: HashMap<(PositionKey, PositionKey), u32> =
        HashMap::with_capacity(triangles.len() * 3);

    for (face, tri) in triangles.iter().enumerate() {
        for e in 0..3 {
            let a = keys[tri.indices[e] as usize];
            let b = keys[tri.indices[(e + 1) % 3] as usize];
            if a == b {
                continue;
            }
            edges.entry((a, b)).or_insert(face as u32);
        }
    }

    let mut adjacency = vec![NO_ADJACENT; triangles.len() * 3];
    for (face, tri) in triangles.iter().enumerate() {
        for e in 0..3 {
            let a = keys[tri.indices[e] as usize];
            let b = keys[tri.indices[(e + 1) % 3] as usize];
            if a == b {
                continue;
            }
            // A neighbor with matching winding stores the reversed edge.
            if let Some(&other) = edges.get(&(b, a)) {
                if other != face as u32 {
                    adjacency[face * 3 + e] = other;
                }
            }
        }
    }
    adjacency
}
