//! Vertex cache optimization (Forsyth's linear-speed algorithm).
//!
//! Faces inside each subset are reordered so vertices recur while they
//! are still resident in the GPU's post-transform cache. The score
//! model favors vertices already near the front of a simulated FIFO
//! cache, with a valence boost that pulls in vertices with few unissued
//! triangles left so they retire early.

use std::collections::HashMap;

/// Score for vertices in the three most recent cache slots; kept flat
/// so the optimizer does not chain long triangle strips at the expense
/// of overall cache reuse.
const LAST_TRIANGLE_SCORE: f32 = 0.75;
/// Falloff exponent for positions deeper in the cache.
const CACHE_DECAY_POWER: f32 = 1.5;
/// Scale of the low-valence boost.
const VALENCE_BOOST_SCALE: f32 = 2.0;
/// Exponent of the low-valence boost.
const VALENCE_BOOST_POWER: f32 = 0.5;

#[derive(Debug)]
struct VertexInfo {
    /// Position in the simulated cache, or -1 when absent.
    cache_position: i32,
    score: f32,
    /// Triangles referencing this vertex that are not yet emitted.
    remaining: u32,
    triangles: Vec<u32>,
}

fn vertex_score(info: &VertexInfo, cache_size: usize) -> f32 {
    if info.remaining == 0 {
        return -1.0;
    }
    let base = match info.cache_position {
        p if p < 0 => 0.0,
        p if p < 3 => LAST_TRIANGLE_SCORE,
        p => {
            let scale = 1.0 - (p - 3) as f32 / (cache_size - 3) as f32;
            scale.clamp(0.0, 1.0).powf(CACHE_DECAY_POWER)
        }
    };
    base + VALENCE_BOOST_SCALE * (info.remaining as f32).powf(-VALENCE_BOOST_POWER)
}

/// Reorder the faces of one subset's index range for cache locality.
///
/// Returns the emission order as local face indices, so the caller can
/// remap any side tables that referenced the previous order. Ties are
/// broken toward earlier submission, which keeps the pass deterministic
/// and the identity on already-optimal single-strip input.
pub(crate) fn optimize_subset(indices: &mut [u32], cache_size: usize) -> Vec<u32> {
    debug_assert!(indices.len() % 3 == 0);
    // The score model needs the three last-triangle slots plus at
    // least one decaying position.
    let cache_size = cache_size.max(4);
    let face_count = indices.len() / 3;
    if face_count == 0 {
        return Vec::new();
    }

    // Densify the vertex ids used by this subset.
    let mut local: HashMap<u32, usize> = HashMap::new();
    let mut faces: Vec<[usize; 3]> = Vec::with_capacity(face_count);
    for tri in indices.chunks_exact(3) {
        let mut corners = [0usize; 3];
        for (slot, &index) in corners.iter_mut().zip(tri) {
            let next = local.len();
            *slot = *local.entry(index).or_insert(next);
        }
        faces.push(corners);
    }

    let mut vertices: Vec<VertexInfo> = (0..local.len())
        .map(|_| VertexInfo {
            cache_position: -1,
            score: 0.0,
            remaining: 0,
            triangles: Vec::new(),
        })
        .collect();
    for (face, corners) in faces.iter().enumerate() {
        for &v in corners {
            vertices[v].remaining += 1;
            vertices[v].triangles.push(face as u32);
        }
    }
    for info in &mut vertices {
        info.score = vertex_score(info, cache_size);
    }

    let mut face_score: Vec<f32> = faces
        .iter()
        .map(|corners| corners.iter().map(|&v| vertices[v].score).sum())
        .collect();
    let mut emitted = vec![false; face_count];
    let mut cache: Vec<usize> = Vec::with_capacity(cache_size + 3);
    let mut order: Vec<u32> = Vec::with_capacity(face_count);
    let mut fallback_cursor = 0usize;

    let mut best_face = best_by_score(&face_score, &emitted, 0..face_count as u32);

    while order.len() < face_count {
        let face = match best_face {
            Some(face) => face,
            None => {
                // Cache ran dry of candidates; rescan the remaining
                // faces for the best score.
                while emitted[fallback_cursor] {
                    fallback_cursor += 1;
                }
                best_by_score(
                    &face_score,
                    &emitted,
                    fallback_cursor as u32..face_count as u32,
                )
                .unwrap_or(fallback_cursor as u32)
            }
        };

        emitted[face as usize] = true;
        order.push(face);
        let corners = faces[face as usize];
        for &v in &corners {
            vertices[v].remaining -= 1;
        }

        // Push the face's vertices to the cache front, keeping the rest
        // in order and evicting past the modeled capacity.
        let mut new_cache: Vec<usize> = Vec::with_capacity(cache.len() + 3);
        for &v in &corners {
            if !new_cache.contains(&v) {
                new_cache.push(v);
            }
        }
        for &v in &cache {
            if !new_cache.contains(&v) {
                new_cache.push(v);
            }
        }

        let mut touched: Vec<usize> = new_cache.clone();
        new_cache.truncate(cache_size);
        for (position, &v) in new_cache.iter().enumerate() {
            vertices[v].cache_position = position as i32;
        }
        for &v in touched.iter().skip(new_cache.len()) {
            vertices[v].cache_position = -1;
        }
        cache = new_cache;

        touched.sort_unstable();
        touched.dedup();
        for &v in &touched {
            let new_score = vertex_score(&vertices[v], cache_size);
            let delta = new_score - vertices[v].score;
            vertices[v].score = new_score;
            for &f in &vertices[v].triangles {
                if !emitted[f as usize] {
                    face_score[f as usize] += delta;
                }
            }
        }

        // Next candidate: best-scoring unemitted triangle touching the cache.
        best_face = best_by_score(
            &face_score,
            &emitted,
            cache
                .iter()
                .flat_map(|&v| vertices[v].triangles.iter().copied()),
        );
    }

    // Rewrite the index range in emission order.
    let mut reordered = Vec::with_capacity(indices.len());
    for &face in &order {
        let corners = faces[face as usize];
        for &v in &corners {
            reordered.push(v);
        }
    }
    // Map dense local ids back to the original vertex indices.
    let mut reverse = vec![0u32; local.len()];
    for (&index, &dense) in &local {
        reverse[dense] = index;
    }
    for (slot, dense) in indices.iter_mut().zip(reordered) {
        *slot = reverse[dense];
    }
    order
}

fn best_by_score(
    face_score: &[f32],
    emitted: &[bool],
    candidates: impl Iterator<Item = u32>,
) -> Option<u32> {
    let mut best: Option<u32> = None;
    let mut best_score = f32::MIN;
    for face in candidates {
        if emitted[face as usize] {
            continue;
        }
        let score = face_score[face as usize];
        if score > best_score || (score == best_score && best.is_some_and(|b| face < b)) {
            best = Some(face);
            best_score = score;
        }
    }
    best
}

/// Count post-transform cache misses for an index stream against a
/// FIFO cache of the given size. One miss equals one vertex transform.
pub fn simulated_cache_misses(indices: &[u32], cache_size: usize) -> u32 {
    let mut cache: Vec<u32> = Vec::with_capacity(cache_size);
    let mut misses = 0u32;
    for &index in indices {
        if cache.contains(&index) {
            continue;
        }
        misses += 1;
        cache.insert(0, index);
        cache.truncate(cache_size);
    }
    misses
}
