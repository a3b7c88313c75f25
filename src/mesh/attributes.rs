//! Derivation of missing vertex attributes.
//!
//! Normals are averaged over the fan of faces reachable from each
//! corner through the position-based adjacency table, so a vertex
//! split across UV seams still receives a smooth normal while faces
//! separated by a boundary edge do not bleed into each other.
//! Tangent frames follow Lengyel's method: solve the 2x2 UV system per
//! face, accumulate per vertex, then Gram-Schmidt against the normal
//! with the handedness stored in the tangent w component.

use crate::layout::{VertexAttributeSemantic, VertexLayout};
use crate::math::{Vec2, Vec3, Vec4};
use crate::mesh::adjacency::{PositionKey, NO_ADJACENT};
use crate::mesh::ingest::{PreparationData, SourceFlags, Triangle};

/// Fallback normal for vertices with no valid face contribution.
const FALLBACK_NORMAL: Vec3 = Vec3::new(0.0, 1.0, 0.0);

/// Fill in normals for every vertex that did not supply one.
///
/// Supplied normals are left untouched. Contributions are weighted by
/// face area (the raw cross product), matching the usual smooth-shading
/// result for irregular triangulations.
pub(crate) fn generate_normals(
    layout: &VertexLayout,
    prep: &mut PreparationData,
    keys: &[PositionKey],
    adjacency: &[u32],
) {
    let face_normal = |tri: &Triangle, data: &[u8]| -> Vec3 {
        let read = |i: usize| {
            layout
                .read_vec3(data, tri.indices[i] as usize, VertexAttributeSemantic::Position)
                .unwrap_or_default()
        };
        let (p0, p1, p2) = (read(0), read(1), read(2));
        (p1 - p0).cross(&(p2 - p0))
    };

    // One derived normal per vertex, computed lazily at its first corner.
    let mut derived: Vec<Option<Vec3>> = vec![None; prep.vertex_count as usize];
    let mut fan = Vec::new();

    for face in 0..prep.triangles.len() {
        for corner in 0..3 {
            let vertex = prep.triangles[face].indices[corner] as usize;
            if prep.vertex_flags[vertex].contains(SourceFlags::NORMAL) {
                continue;
            }
            if derived[vertex].is_some() {
                continue;
            }

            collect_fan(face as u32, corner, &prep.triangles, keys, adjacency, &mut fan);
            let mut accum = Vec3::zeros();
            for &f in &fan {
                accum += face_normal(&prep.triangles[f as usize], &prep.vertex_data);
            }
            let normal = accum.try_normalize(1e-12).unwrap_or(FALLBACK_NORMAL);
            derived[vertex] = Some(normal);
        }
    }

    for (vertex, normal) in derived.iter().enumerate() {
        if let Some(n) = normal {
            layout.write_vec3(
                &mut prep.vertex_data,
                vertex,
                VertexAttributeSemantic::Normal,
                *n,
            );
            prep.vertex_flags[vertex] |= SourceFlags::NORMAL;
        }
    }
}

/// Gather the faces sharing the corner position of `start_face`,
/// walking the adjacency table in both directions until a boundary or
/// a full loop.
fn collect_fan(
    start_face: u32,
    corner: usize,
    triangles: &[Triangle],
    keys: &[PositionKey],
    adjacency: &[u32],
    out: &mut Vec<u32>,
) {
    let target = keys[triangles[start_face as usize].indices[corner] as usize];
    out.clear();
    out.push(start_face);

    // Edge `(corner + 2) % 3` enters the corner, edge `corner` leaves it.
    for &backward in &[true, false] {
        let mut face = start_face;
        let mut c = corner;
        loop {
            let edge = if backward { (c + 2) % 3 } else { c };
            let next = adjacency[face as usize * 3 + edge];
            if next == NO_ADJACENT || out.contains(&next) {
                break;
            }
            let Some(nc) = corner_of(&triangles[next as usize], keys, &target) else {
                break;
            };
            out.push(next);
            face = next;
            c = nc;
        }
    }
}

/// Find the corner of a face whose quantized position matches `key`.
fn corner_of(tri: &Triangle, keys: &[PositionKey], key: &PositionKey) -> Option<usize> {
    (0..3).find(|&c| keys[tri.indices[c] as usize] == *key)
}

/// Fill in tangents (and binormals when the layout carries them) for
/// vertices that did not supply them.
///
/// Returns the number of faces skipped for degenerate texture
/// coordinates; vertices touched only by skipped faces fall back to an
/// arbitrary frame orthogonal to the normal.
pub(crate) fn generate_tangents(layout: &VertexLayout, prep: &mut PreparationData) -> u32 {
    let vertex_count = prep.vertex_count as usize;
    let mut tan_accum = vec![Vec3::zeros(); vertex_count];
    let mut bitan_accum = vec![Vec3::zeros(); vertex_count];
    let mut skipped = 0u32;

    for tri in &prep.triangles {
        let read_pos = |i: usize| {
            layout
                .read_vec3(
                    &prep.vertex_data,
                    tri.indices[i] as usize,
                    VertexAttributeSemantic::Position,
                )
                .unwrap_or_default()
        };
        let read_uv = |i: usize| {
            layout
                .read_vec2(
                    &prep.vertex_data,
                    tri.indices[i] as usize,
                    VertexAttributeSemantic::TexCoord0,
                )
                .unwrap_or_default()
        };

        let (p0, p1, p2) = (read_pos(0), read_pos(1), read_pos(2));
        let (uv0, uv1, uv2) = (read_uv(0), read_uv(1), read_uv(2));

        let e1 = p1 - p0;
        let e2 = p2 - p0;
        let d1: Vec2 = uv1 - uv0;
        let d2: Vec2 = uv2 - uv0;

        let det = d1.x * d2.y - d2.x * d1.y;
        if det.abs() < 1e-12 {
            skipped += 1;
            continue;
        }
        let r = 1.0 / det;
        let tangent = (e1 * d2.y - e2 * d1.y) * r;
        let bitangent = (e2 * d1.x - e1 * d2.x) * r;

        for &index in &tri.indices {
            tan_accum[index as usize] += tangent;
            bitan_accum[index as usize] += bitangent;
        }
    }

    if skipped > 0 {
        log::warn!(
            "tangent generation: {} faces have degenerate texture coordinates",
            skipped
        );
    }

    let write_binormal = layout.has_semantic(VertexAttributeSemantic::Binormal);
    for vertex in 0..vertex_count {
        let flags = prep.vertex_flags[vertex];
        if flags.contains(SourceFlags::TANGENT)
            && (!write_binormal || flags.contains(SourceFlags::BINORMAL))
        {
            continue;
        }
        let normal = layout
            .read_vec3(&prep.vertex_data, vertex, VertexAttributeSemantic::Normal)
            .unwrap_or(FALLBACK_NORMAL);

        // Gram-Schmidt orthogonalization against the normal.
        let raw = tan_accum[vertex];
        let projected = raw - normal * normal.dot(&raw);
        let tangent = projected
            .try_normalize(1e-12)
            .unwrap_or_else(|| orthogonal_to(&normal));

        let handedness = if normal.cross(&tangent).dot(&bitan_accum[vertex]) < 0.0 {
            -1.0
        } else {
            1.0
        };

        if !flags.contains(SourceFlags::TANGENT) {
            layout.write_vec4(
                &mut prep.vertex_data,
                vertex,
                VertexAttributeSemantic::Tangent,
                Vec4::new(tangent.x, tangent.y, tangent.z, handedness),
            );
            prep.vertex_flags[vertex] |= SourceFlags::TANGENT;
        }
        if write_binormal && !flags.contains(SourceFlags::BINORMAL) {
            let binormal = normal.cross(&tangent) * handedness;
            layout.write_vec3(
                &mut prep.vertex_data,
                vertex,
                VertexAttributeSemantic::Binormal,
                binormal,
            );
            prep.vertex_flags[vertex] |= SourceFlags::BINORMAL;
        }
    }
    skipped
}

/// Any unit vector orthogonal to `v`.
fn orthogonal_to(v: &Vec3) -> Vec3 {
    let axis = if v.x.abs() < 0.9 { Vec3::x() } else { Vec3::y() };
    v.cross(&axis)
        .try_normalize(1e-12)
        .unwrap_or_else(Vec3::x)
}
