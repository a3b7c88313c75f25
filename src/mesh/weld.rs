//! Tolerance-based vertex welding.
//!
//! Vertices whose float attributes all lie within the configured
//! tolerance collapse into a single representative. Keys are built by
//! quantizing every compared component onto a grid of the tolerance
//! size, so candidate groups are found with one sort instead of a
//! pairwise sweep. Surviving vertices keep their original relative
//! order, which makes welding an already-welded mesh the identity.

use crate::layout::{VertexAttributeSemantic, VertexLayout};
use crate::mesh::ingest::{PreparationData, SourceFlags};

/// Result of a weld pass.
#[derive(Debug)]
pub(crate) struct WeldOutput {
    /// Old vertex index to new vertex index.
    pub remap: Vec<u32>,
    /// Vertices removed by merging.
    pub removed_vertices: u32,
    /// Triangles dropped because welding made them degenerate.
    pub dropped_faces: u32,
}

/// Attributes participating in weld comparison, with the flag that
/// gates them (optional attributes of absent flags compare as "absent").
const COMPARED: &[(VertexAttributeSemantic, Option<SourceFlags>)] = &[
    (VertexAttributeSemantic::Position, None),
    (VertexAttributeSemantic::Normal, Some(SourceFlags::NORMAL)),
    (VertexAttributeSemantic::Binormal, Some(SourceFlags::BINORMAL)),
    (VertexAttributeSemantic::Tangent, Some(SourceFlags::TANGENT)),
    (VertexAttributeSemantic::TexCoord0, None),
    (VertexAttributeSemantic::TexCoord1, None),
    (VertexAttributeSemantic::Color, None),
];

/// Sentinel key component for attributes a vertex did not supply.
const ABSENT: i64 = i64::MIN;

fn quantize(value: f32, tolerance: f32) -> i64 {
    (value / tolerance).round() as i64
}

/// Build the sort key for one vertex.
fn weld_key(
    layout: &VertexLayout,
    data: &[u8],
    flags: SourceFlags,
    vertex: usize,
    tolerance: f32,
    out: &mut Vec<i64>,
) {
    out.clear();
    out.push(flags.bits() as i64);
    let mut scratch = [0.0f32; 4];
    for &(semantic, gate) in COMPARED {
        let Some(attr) = layout.attribute(semantic) else {
            continue;
        };
        if !attr.format.is_float() {
            continue;
        }
        let count = attr.format.component_count();
        if gate.is_some_and(|flag| !flags.contains(flag)) {
            out.extend(std::iter::repeat(ABSENT).take(count));
            continue;
        }
        layout.read_floats(data, vertex, semantic, &mut scratch);
        out.extend(scratch[..count].iter().map(|&v| quantize(v, tolerance)));
    }
}

/// Collapse near-identical vertices in place and rewrite the triangle
/// list, dropping triangles that become degenerate.
pub(crate) fn weld_vertices(
    layout: &VertexLayout,
    prep: &mut PreparationData,
    tolerance: f32,
) -> WeldOutput {
    let vertex_count = prep.vertex_count as usize;

    let mut keys: Vec<Vec<i64>> = Vec::with_capacity(vertex_count);
    let mut key = Vec::new();
    for v in 0..vertex_count {
        weld_key(
            layout,
            &prep.vertex_data,
            prep.vertex_flags[v],
            v,
            tolerance,
            &mut key,
        );
        keys.push(key.clone());
    }

    let mut order: Vec<u32> = (0..vertex_count as u32).collect();
    order.sort_by(|&a, &b| {
        keys[a as usize]
            .cmp(&keys[b as usize])
            .then(a.cmp(&b))
    });

    // Scan sorted runs, merging each vertex into the run representative
    // when every compared attribute matches within tolerance.
    let mut parent: Vec<u32> = (0..vertex_count as u32).collect();
    let mut rep = u32::MAX;
    for &v in &order {
        if rep != u32::MAX && vertices_match(layout, prep, &keys, rep, v, tolerance) {
            parent[v as usize] = rep;
        } else {
            rep = v;
        }
    }

    // Representatives keep their original relative order.
    let mut remap = vec![u32::MAX; vertex_count];
    let mut kept = 0u32;
    for v in 0..vertex_count {
        if parent[v] == v as u32 {
            remap[v] = kept;
            kept += 1;
        }
    }
    for v in 0..vertex_count {
        if parent[v] != v as u32 {
            remap[v] = remap[parent[v] as usize];
        }
    }

    let stride = layout.stride as usize;
    let mut new_data = vec![0u8; kept as usize * stride];
    let mut new_flags = vec![SourceFlags::empty(); kept as usize];
    for v in 0..vertex_count {
        if parent[v] == v as u32 {
            let dst = remap[v] as usize;
            new_data[dst * stride..(dst + 1) * stride]
                .copy_from_slice(&prep.vertex_data[v * stride..(v + 1) * stride]);
            new_flags[dst] = prep.vertex_flags[v];
        }
    }

    let before_faces = prep.triangles.len();
    prep.triangles.retain_mut(|tri| {
        for i in &mut tri.indices {
            *i = remap[*i as usize];
        }
        tri.indices[0] != tri.indices[1]
            && tri.indices[1] != tri.indices[2]
            && tri.indices[0] != tri.indices[2]
    });
    let dropped_faces = (before_faces - prep.triangles.len()) as u32;

    let removed_vertices = vertex_count as u32 - kept;
    if removed_vertices > 0 || dropped_faces > 0 {
        log::trace!(
            "weld: merged {} vertices, dropped {} degenerate faces",
            removed_vertices,
            dropped_faces
        );
    }

    prep.vertex_data = new_data;
    prep.vertex_flags = new_flags;
    prep.vertex_count = kept;

    WeldOutput {
        remap,
        removed_vertices,
        dropped_faces,
    }
}

/// Exact tolerance comparison between a candidate and its run
/// representative. The quantized keys only group candidates; this is
/// the authoritative test.
fn vertices_match(
    layout: &VertexLayout,
    prep: &PreparationData,
    keys: &[Vec<i64>],
    rep: u32,
    vertex: u32,
    tolerance: f32,
) -> bool {
    if prep.vertex_flags[rep as usize] != prep.vertex_flags[vertex as usize] {
        return false;
    }
    if keys[rep as usize] != keys[vertex as usize] {
        return false;
    }
    let flags = prep.vertex_flags[rep as usize];
    let mut a = [0.0f32; 4];
    let mut b = [0.0f32; 4];
    for &(semantic, gate) in COMPARED {
        let Some(attr) = layout.attribute(semantic) else {
            continue;
        };
        if !attr.format.is_float() {
            continue;
        }
        if gate.is_some_and(|flag| !flags.contains(flag)) {
            continue;
        }
        let count = layout.read_floats(&prep.vertex_data, rep as usize, semantic, &mut a);
        layout.read_floats(&prep.vertex_data, vertex as usize, semantic, &mut b);
        for i in 0..count {
            if (a[i] - b[i]).abs() > tolerance {
                return false;
            }
        }
    }
    true
}
