//! Skin binding and bone palette construction.
//!
//! Skin data arrives bone-major: each bone carries its bind pose and
//! the list of vertices it influences. Hardware skinning wants the
//! transpose with a bounded register budget, so finalize inverts the
//! table and bin-packs faces into bone palettes. Every face must find
//! all of its bones inside a single palette; vertices straddling two
//! palettes are duplicated so each copy belongs to exactly one.

use std::collections::{BTreeMap, HashMap};

use crate::error::MeshError;
use crate::layout::{VertexAttributeSemantic, VertexLayout};
use crate::math::{Mat4, Vec4};
use crate::mesh::ingest::PreparationData;
use crate::mesh::subset::{MaterialHandle, SubsetKey};

/// Maximum number of blend weights written per vertex.
pub const MAX_VERTEX_INFLUENCES: usize = 4;

/// One vertex influenced by a bone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VertexInfluence {
    /// Index of the influenced vertex.
    pub vertex: u32,
    /// Blend weight contributed by the bone.
    pub weight: f32,
}

impl VertexInfluence {
    /// Create a new influence record.
    pub fn new(vertex: u32, weight: f32) -> Self {
        Self { vertex, weight }
    }
}

/// A bone and the vertices it influences.
#[derive(Debug, Clone)]
pub struct BoneInfluence {
    /// Identifier of the bone in the surrounding skeleton.
    pub bone_id: String,
    /// Transform from mesh space into the bone's bind space.
    pub bind_pose: Mat4,
    /// Vertices this bone influences.
    pub influences: Vec<VertexInfluence>,
}

impl BoneInfluence {
    /// Create a bone with no influences yet.
    pub fn new(bone_id: impl Into<String>, bind_pose: Mat4) -> Self {
        Self {
            bone_id: bone_id.into(),
            bind_pose,
            influences: Vec::new(),
        }
    }

    /// Add an influenced vertex.
    pub fn add_influence(&mut self, vertex: u32, weight: f32) {
        self.influences.push(VertexInfluence::new(vertex, weight));
    }
}

/// Bone-major description of how a skeleton deforms the mesh.
#[derive(Debug, Clone, Default)]
pub struct SkinBindData {
    bones: Vec<BoneInfluence>,
}

impl SkinBindData {
    /// Create empty bind data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bone, returning its index.
    pub fn add_bone(&mut self, bone: BoneInfluence) -> u32 {
        self.bones.push(bone);
        (self.bones.len() - 1) as u32
    }

    /// The bones in index order.
    pub fn bones(&self) -> &[BoneInfluence] {
        &self.bones
    }

    /// Mutable access to the bones.
    pub fn bones_mut(&mut self) -> &mut [BoneInfluence] {
        &mut self.bones
    }

    /// Drop bones that influence no vertices.
    ///
    /// Bone indices shift, so call this before finalize assigns
    /// palettes, not after.
    pub fn remove_empty_bones(&mut self) {
        let before = self.bones.len();
        self.bones.retain(|bone| !bone.influences.is_empty());
        let removed = before - self.bones.len();
        if removed > 0 {
            log::trace!("skin: removed {} bones with no influences", removed);
        }
    }

    /// Drop all vertex influence lists, keeping the bones.
    pub fn clear_vertex_influences(&mut self) {
        for bone in &mut self.bones {
            bone.influences.clear();
        }
    }

    /// Rewrite influence lists after a vertex remap.
    ///
    /// Entries mapping to `u32::MAX` are dropped. When several source
    /// vertices collapse onto one target, only the first surviving
    /// entry per bone is kept.
    pub(crate) fn remap_vertices(&mut self, remap: &[u32]) {
        for bone in &mut self.bones {
            let mut seen = std::collections::HashSet::new();
            bone.influences.retain_mut(|influence| {
                match remap.get(influence.vertex as usize).copied() {
                    Some(new) if new != u32::MAX => {
                        influence.vertex = new;
                        seen.insert(new)
                    }
                    _ => false,
                }
            });
        }
    }

    /// Invert the bone-major table into a per-vertex view.
    pub(crate) fn build_vertex_table(&self, vertex_count: u32) -> Vec<BindVertex> {
        let mut table: Vec<BindVertex> = (0..vertex_count)
            .map(|v| BindVertex {
                bones: Vec::new(),
                weights: Vec::new(),
                palette: None,
                original_vertex: v,
            })
            .collect();
        for (bone, influence) in self.bones.iter().enumerate() {
            for entry in &influence.influences {
                if let Some(slot) = table.get_mut(entry.vertex as usize) {
                    slot.bones.push(bone as u32);
                    slot.weights.push(entry.weight);
                }
            }
        }
        table
    }
}

/// Per-vertex skinning view used during palette assignment.
#[derive(Debug, Clone)]
pub(crate) struct BindVertex {
    /// Bones influencing this vertex, in bind-data index space.
    pub bones: Vec<u32>,
    /// Weight per bone, parallel to `bones`.
    pub weights: Vec<f32>,
    /// Palette this vertex has been claimed by, if any.
    pub palette: Option<u32>,
    /// Source vertex this one was ingested (or duplicated) from.
    pub original_vertex: u32,
}

/// How well a set of bones fits into an existing palette.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaletteFit {
    /// Free slots remaining in the palette.
    pub remaining_space: usize,
    /// Bones of the candidate set already present.
    pub common_bones: usize,
    /// Bones of the candidate set that would need new slots.
    pub additional_bones: usize,
}

impl PaletteFit {
    /// Whether the candidate set fits without overflowing the palette.
    pub fn fits(&self) -> bool {
        self.additional_bones <= self.remaining_space
    }
}

/// A bounded set of bones servicing one batch of skinned faces.
#[derive(Debug, Clone)]
pub struct BonePalette {
    key: SubsetKey,
    maximum_size: usize,
    bones: Vec<u32>,
    faces: Vec<u32>,
    maximum_blend_index: i32,
}

impl BonePalette {
    /// Create an empty palette for the given subset key.
    pub fn new(key: SubsetKey, maximum_size: usize) -> Self {
        Self {
            key,
            maximum_size,
            bones: Vec::new(),
            faces: Vec::new(),
            maximum_blend_index: -1,
        }
    }

    /// Subset key the palette's faces belong to.
    pub fn key(&self) -> SubsetKey {
        self.key
    }

    /// Material of the faces using this palette.
    pub fn material(&self) -> MaterialHandle {
        self.key.material
    }

    /// Data group of the faces using this palette.
    pub fn data_group(&self) -> u32 {
        self.key.data_group
    }

    /// Bones in the palette, in slot order.
    pub fn bones(&self) -> &[u32] {
        &self.bones
    }

    /// Finalized face indices serviced by this palette.
    pub fn faces(&self) -> &[u32] {
        &self.faces
    }

    /// Highest blend index any assigned vertex uses, or -1 when the
    /// palette is empty. A value of 2 means vertices blend up to three
    /// bones.
    pub fn maximum_blend_index(&self) -> i32 {
        self.maximum_blend_index
    }

    /// Measure how a sorted, deduplicated bone set would fit.
    pub fn compute_palette_fit(&self, bones: &[u32]) -> PaletteFit {
        let common = bones
            .iter()
            .filter(|bone| self.bones.contains(bone))
            .count();
        PaletteFit {
            remaining_space: self.maximum_size - self.bones.len(),
            common_bones: common,
            additional_bones: bones.len() - common,
        }
    }

    /// Add the missing bones of a set and claim the given faces.
    pub(crate) fn assign_bones(&mut self, bones: &[u32], faces: &[u32]) {
        for &bone in bones {
            if !self.bones.contains(&bone) {
                self.bones.push(bone);
            }
        }
        debug_assert!(self.bones.len() <= self.maximum_size);
        self.faces.extend_from_slice(faces);
    }

    /// Translate a bind-data bone index into this palette's slot index.
    pub fn translate_bone_to_palette(&self, bone: u32) -> Option<u32> {
        self.bones.iter().position(|&b| b == bone).map(|i| i as u32)
    }

    pub(crate) fn raise_blend_index(&mut self, used_influences: usize) {
        self.maximum_blend_index = self.maximum_blend_index.max(used_influences as i32 - 1);
    }

    pub(crate) fn remap_faces(&mut self, remap: &[u32]) {
        for face in &mut self.faces {
            *face = remap[*face as usize];
        }
        self.faces.sort_unstable();
    }
}

/// Pack skinned faces into bone palettes and write per-vertex blend
/// attributes.
///
/// Faces are bucketed by (subset key, bone set) and each bucket is
/// placed into the candidate palette sharing the most bones that still
/// has room, or a fresh palette otherwise. Vertices referenced by
/// faces of two different palettes are duplicated. Palette face lists
/// refer to ingestion face order; the caller remaps them once the
/// final face order is known.
pub(crate) fn build_bone_palettes(
    layout: &VertexLayout,
    prep: &mut PreparationData,
    skin: &mut SkinBindData,
    palette_size: usize,
) -> Result<Vec<BonePalette>, MeshError> {
    let mut table = skin.build_vertex_table(prep.vertex_count);

    // Bucket faces by subset key and exact bone set.
    let mut buckets: BTreeMap<(SubsetKey, Vec<u32>), Vec<u32>> = BTreeMap::new();
    for (face, tri) in prep.triangles.iter().enumerate() {
        let mut bones: Vec<u32> = tri
            .indices
            .iter()
            .flat_map(|&v| table[v as usize].bones.iter().copied())
            .collect();
        bones.sort_unstable();
        bones.dedup();
        if bones.is_empty() {
            continue;
        }
        if bones.len() > palette_size {
            return Err(MeshError::FaceExceedsPalette {
                face: face as u32,
                bone_count: bones.len(),
                palette_size,
            });
        }
        buckets
            .entry((SubsetKey::new(tri.data_group, tri.material), bones))
            .or_default()
            .push(face as u32);
    }

    let mut palettes: Vec<BonePalette> = Vec::new();
    let mut candidates: HashMap<SubsetKey, Vec<u32>> = HashMap::new();
    let mut assignments: Vec<(u32, Vec<u32>)> = Vec::new();

    for ((key, bones), faces) in buckets {
        let mut best: Option<(u32, usize)> = None;
        for &candidate in candidates.get(&key).into_iter().flatten() {
            let fit = palettes[candidate as usize].compute_palette_fit(&bones);
            if fit.fits() && best.is_none_or(|(_, common)| fit.common_bones > common) {
                best = Some((candidate, fit.common_bones));
            }
        }
        let palette = match best {
            Some((index, _)) => index,
            None => {
                let index = palettes.len() as u32;
                palettes.push(BonePalette::new(key, palette_size));
                candidates.entry(key).or_default().push(index);
                index
            }
        };
        palettes[palette as usize].assign_bones(&bones, &faces);
        assignments.push((palette, faces));
    }

    log::trace!(
        "skin: packed {} bones into {} palettes",
        skin.bones().len(),
        palettes.len()
    );

    // Claim vertices for their palettes, duplicating any vertex that
    // faces of two palettes both reference.
    let mut duplicates: HashMap<(u32, u32), u32> = HashMap::new();
    for (palette, faces) in &assignments {
        for &face in faces {
            for corner in 0..3 {
                let vertex = prep.triangles[face as usize].indices[corner];
                match table[vertex as usize].palette {
                    None => table[vertex as usize].palette = Some(*palette),
                    Some(owner) if owner == *palette => {}
                    Some(_) => {
                        let copy = *duplicates.entry((vertex, *palette)).or_insert_with(|| {
                            let new_vertex = prep.duplicate_vertex(layout, vertex);
                            let mut entry = table[vertex as usize].clone();
                            entry.palette = Some(*palette);
                            log::trace!(
                                "skin: duplicated vertex {} (source {}) for palette {}",
                                new_vertex,
                                entry.original_vertex,
                                palette
                            );
                            // Keep the bone-major view consistent for
                            // CPU-side consumers.
                            for (i, &bone) in entry.bones.iter().enumerate() {
                                skin.bones_mut()[bone as usize]
                                    .add_influence(new_vertex, entry.weights[i]);
                            }
                            table.push(entry);
                            new_vertex
                        });
                        prep.triangles[face as usize].indices[corner] = copy;
                    }
                }
            }
        }
    }

    // Write palette-local blend indices and weights into the vertex data.
    let has_joints = layout.has_semantic(VertexAttributeSemantic::Joints);
    let mut truncated = 0u32;
    for vertex in 0..table.len() {
        let Some(palette_index) = table[vertex].palette else {
            continue;
        };
        let palette = &mut palettes[palette_index as usize];

        let mut pairs: Vec<(u32, f32)> = table[vertex]
            .bones
            .iter()
            .copied()
            .zip(table[vertex].weights.iter().copied())
            .collect();
        pairs.sort_by(|a, b| b.1.total_cmp(&a.1));
        if pairs.len() > MAX_VERTEX_INFLUENCES {
            truncated += 1;
            pairs.truncate(MAX_VERTEX_INFLUENCES);
        }

        let mut joints = [0u32; 4];
        let mut weights = [0.0f32; 4];
        for (slot, &(bone, weight)) in pairs.iter().enumerate() {
            joints[slot] =
                palette
                    .translate_bone_to_palette(bone)
                    .ok_or(MeshError::InvalidState {
                        operation: "assign blend indices",
                        reason: "vertex references a bone missing from its palette",
                    })?;
            weights[slot] = weight;
        }
        palette.raise_blend_index(pairs.len());

        if has_joints {
            layout.write_uint4(
                &mut prep.vertex_data,
                vertex,
                VertexAttributeSemantic::Joints,
                joints,
            );
            layout.write_vec4(
                &mut prep.vertex_data,
                vertex,
                VertexAttributeSemantic::Weights,
                Vec4::new(weights[0], weights[1], weights[2], weights[3]),
            );
        }
    }
    if truncated > 0 {
        log::warn!(
            "skin: {} vertices exceeded {} influences; lowest weights dropped",
            truncated,
            MAX_VERTEX_INFLUENCES
        );
    }

    Ok(palettes)
}
