//! Mesh preparation, finalization and draw dispatch.
//!
//! A [`Mesh`] moves through three states. `prepare` opens a
//! preparation pass and fixes the vertex layout; `add_vertices` and
//! `add_primitives` ingest raw geometry; `end_prepare` runs the
//! finalize pipeline (weld, skin palettes, attribute derivation,
//! subset batching, cache optimization, compaction) and freezes the
//! result. Finalized queries and draws are only valid in the prepared
//! state, and `roll_back_prepare` reopens a finalized mesh for another
//! editing pass.

pub mod ingest;
pub mod optimize;
pub mod skin;
pub mod subset;

mod adjacency;
mod attributes;
mod weld;

use std::collections::HashMap;
use std::sync::Arc;

use crate::driver::{DrawRange, IndexBufferHandle, RenderDriver, VertexBufferHandle};
use crate::error::MeshError;
use crate::layout::{VertexAttributeSemantic, VertexLayout};
use crate::math::{intersect_ray_triangle, BoundingBox, Vec3};

pub use ingest::{SourceFlags, Triangle};
pub use skin::{BoneInfluence, BonePalette, PaletteFit, SkinBindData, VertexInfluence};
pub use subset::{MaterialHandle, MeshSubset, SubsetKey};

use ingest::PreparationData;

/// Where a mesh stands in its preparation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrepareStatus {
    /// No geometry and no layout yet.
    #[default]
    Unprepared,
    /// A preparation pass is open and ingesting geometry.
    Preparing,
    /// Finalized; queries and draws are valid.
    Prepared,
}

/// Tunable limits of the finalize pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshConfig {
    /// Maximum component distance at which vertices weld together.
    pub weld_tolerance: f32,
    /// Modeled post-transform cache size for the face optimizer.
    pub cache_size: usize,
    /// Maximum number of subsets a mesh may produce.
    pub max_subsets: usize,
    /// Maximum bones per palette, typically the skinning register budget.
    pub palette_size: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            weld_tolerance: 1e-5,
            cache_size: 32,
            max_subsets: 4096,
            palette_size: 64,
        }
    }
}

impl MeshConfig {
    /// Set the weld tolerance. Zero disables welding entirely.
    pub fn with_weld_tolerance(mut self, tolerance: f32) -> Self {
        self.weld_tolerance = tolerance;
        self
    }

    /// Set the modeled cache size. The optimizer treats sizes below
    /// four as four.
    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    /// Set the subset limit.
    pub fn with_max_subsets(mut self, max_subsets: usize) -> Self {
        self.max_subsets = max_subsets;
        self
    }

    /// Set the bone palette capacity.
    pub fn with_palette_size(mut self, palette_size: usize) -> Self {
        self.palette_size = palette_size;
        self
    }
}

/// Per-call switches for `end_prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeOptions {
    /// Upload the finalized buffers to the driver.
    pub hardware_copy: bool,
    /// Run the weld stage.
    pub weld: bool,
    /// Run the vertex cache optimizer.
    pub optimize: bool,
}

impl Default for FinalizeOptions {
    fn default() -> Self {
        Self {
            hardware_copy: true,
            weld: true,
            optimize: true,
        }
    }
}

impl FinalizeOptions {
    /// Toggle the hardware upload.
    pub fn with_hardware_copy(mut self, hardware_copy: bool) -> Self {
        self.hardware_copy = hardware_copy;
        self
    }

    /// Toggle the weld stage.
    pub fn with_weld(mut self, weld: bool) -> Self {
        self.weld = weld;
        self
    }

    /// Toggle the cache optimizer.
    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }
}

/// Result of a ray query against finalized geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshHit {
    /// Distance along the ray to the intersection.
    pub distance: f32,
    /// Finalized face index that was hit.
    pub face: u32,
    /// Material of the hit face.
    pub material: MaterialHandle,
}

/// A triangle mesh moving through ingestion, finalization and draw.
#[derive(Debug, Default)]
pub struct Mesh {
    config: MeshConfig,
    status: PrepareStatus,
    layout: Option<Arc<VertexLayout>>,
    default_material: MaterialHandle,

    prep: PreparationData,
    skin: Option<SkinBindData>,

    // Finalized state, valid while status == Prepared.
    vertex_data: Vec<u8>,
    vertex_flags: Vec<SourceFlags>,
    indices: Vec<u32>,
    triangle_keys: Vec<SubsetKey>,
    subsets: Vec<MeshSubset>,
    subset_lookup: HashMap<SubsetKey, usize>,
    palettes: Vec<BonePalette>,
    bounds: BoundingBox,
    optimized: bool,

    vertex_buffer: Option<VertexBufferHandle>,
    index_buffer: Option<IndexBufferHandle>,
}

impl Mesh {
    /// Create an unprepared mesh with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unprepared mesh with the given configuration.
    pub fn with_config(config: MeshConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn status(&self) -> PrepareStatus {
        self.status
    }

    /// The vertex layout fixed by the last `prepare` call.
    pub fn vertex_layout(&self) -> Option<&Arc<VertexLayout>> {
        self.layout.as_ref()
    }

    /// Material substituted when primitives arrive without one.
    pub fn set_default_material(&mut self, material: MaterialHandle) {
        self.default_material = material;
    }

    /// Open a preparation pass with the given vertex layout.
    ///
    /// Discards any previously finalized data; hardware copies left
    /// over from an earlier finalize are destroyed when a driver is
    /// given. Fails when a pass is already open, the layout is
    /// inconsistent, or it has no position.
    pub fn prepare(
        &mut self,
        layout: Arc<VertexLayout>,
        driver: Option<&mut dyn RenderDriver>,
    ) -> Result<(), MeshError> {
        if self.status == PrepareStatus::Preparing {
            return Err(MeshError::InvalidState {
                operation: "prepare mesh",
                reason: "a preparation pass is already open",
            });
        }
        layout.validate().map_err(MeshError::InvalidLayout)?;
        if !layout.has_semantic(VertexAttributeSemantic::Position) {
            return Err(MeshError::MissingAttribute(VertexAttributeSemantic::Position));
        }
        self.release_hardware(driver);
        self.discard_finalized();
        self.prep.clear();
        self.skin = None;
        self.layout = Some(layout);
        self.status = PrepareStatus::Preparing;
        Ok(())
    }

    /// Ingest raw interleaved vertices, returning how many were added.
    pub fn add_vertices(&mut self, data: &[u8]) -> Result<u32, MeshError> {
        let layout = self.require_preparing("add vertices")?;
        self.prep.add_vertices(&layout, data)
    }

    /// Ingest a triangle list referencing already-added vertices.
    ///
    /// An invalid material handle is replaced with the mesh's default
    /// material.
    pub fn add_primitives(
        &mut self,
        indices: &[u32],
        material: MaterialHandle,
        data_group: u32,
    ) -> Result<(), MeshError> {
        self.require_preparing("add primitives")?;
        let material = if material.is_valid() {
            material
        } else {
            self.default_material
        };
        self.prep.add_triangles(indices, material, data_group)
    }

    /// Attach skinning data to the open preparation pass.
    ///
    /// The bind data is copied; influence lists are rewritten as the
    /// pipeline welds, duplicates and compacts vertices. With
    /// `finalize` set this immediately runs `end_prepare` with default
    /// options.
    pub fn bind_skin(
        &mut self,
        data: &SkinBindData,
        finalize: bool,
        driver: Option<&mut dyn RenderDriver>,
    ) -> Result<(), MeshError> {
        self.require_preparing("bind skin")?;
        self.skin = Some(data.clone());
        if finalize {
            self.end_prepare(FinalizeOptions::default(), driver)?;
        }
        Ok(())
    }

    /// Run the finalize pipeline over the ingested geometry.
    ///
    /// On success the mesh is `Prepared`. Any error, including a
    /// driver failure during the hardware upload, aborts finalization
    /// and leaves the pass open for retry; partial pipeline work
    /// (welding, duplication) may already have been applied when that
    /// happens.
    pub fn end_prepare(
        &mut self,
        options: FinalizeOptions,
        driver: Option<&mut dyn RenderDriver>,
    ) -> Result<(), MeshError> {
        let layout = self.require_preparing("finalize mesh")?;

        if options.weld && self.config.weld_tolerance > 0.0 {
            let out = weld::weld_vertices(&layout, &mut self.prep, self.config.weld_tolerance);
            if let Some(skin) = self.skin.as_mut() {
                skin.remap_vertices(&out.remap);
            }
        }

        if let Some(skin) = self.skin.as_mut() {
            self.palettes =
                skin::build_bone_palettes(&layout, &mut self.prep, skin, self.config.palette_size)?;
        } else {
            self.palettes.clear();
        }

        self.derive_attributes(&layout)?;

        let mut build = subset::build_subsets(&self.prep.triangles, self.config.max_subsets)?;
        let mut face_remap = build.face_remap;
        if options.optimize {
            let mut post: Vec<u32> = (0..build.triangle_keys.len() as u32).collect();
            for subset in &build.subsets {
                let start = subset.face_start as usize * 3;
                let end = start + subset.face_count as usize * 3;
                let order =
                    optimize::optimize_subset(&mut build.indices[start..end], self.config.cache_size);
                for (rank, &local) in order.iter().enumerate() {
                    post[subset.face_start as usize + local as usize] =
                        subset.face_start + rank as u32;
                }
            }
            for slot in &mut face_remap {
                *slot = post[*slot as usize];
            }
        }
        for palette in &mut self.palettes {
            palette.remap_faces(&face_remap);
        }

        let (vertex_remap, vertex_count) = subset::compact_vertices(
            &mut build.indices,
            &mut build.subsets,
            self.prep.vertex_count as usize,
        );
        let stride = layout.stride as usize;
        let mut vertex_data = vec![0u8; vertex_count as usize * stride];
        let mut vertex_flags = vec![SourceFlags::empty(); vertex_count as usize];
        let mut unreferenced = 0u32;
        for (old, &new) in vertex_remap.iter().enumerate() {
            if new == u32::MAX {
                unreferenced += 1;
                continue;
            }
            let dst = new as usize;
            vertex_data[dst * stride..(dst + 1) * stride]
                .copy_from_slice(&self.prep.vertex_data[old * stride..(old + 1) * stride]);
            vertex_flags[dst] = self.prep.vertex_flags[old];
        }
        if unreferenced > 0 {
            log::trace!("finalize: dropped {} unreferenced vertices", unreferenced);
        }

        self.vertex_data = vertex_data;
        self.vertex_flags = vertex_flags;
        self.indices = build.indices;
        self.triangle_keys = build.triangle_keys;
        self.subsets = build.subsets;
        self.subset_lookup = self
            .subsets
            .iter()
            .enumerate()
            .map(|(i, s)| (s.key, i))
            .collect();
        self.optimized = options.optimize;
        self.recompute_bounds(&layout);

        // The upload is the last fallible step; the pass only commits
        // to Prepared once the hardware copies exist.
        if options.hardware_copy {
            match driver {
                Some(driver) => self.upload(driver)?,
                None => log::trace!("finalize: no driver; hardware copy deferred"),
            }
        }

        if let Some(skin) = self.skin.as_mut() {
            skin.remap_vertices(&vertex_remap);
        }
        self.prep.clear();
        self.status = PrepareStatus::Prepared;

        log::trace!(
            "finalize: {} vertices, {} faces, {} subsets, {} palettes",
            self.vertex_count(),
            self.face_count(),
            self.subsets.len(),
            self.palettes.len()
        );
        Ok(())
    }

    /// Reopen a finalized mesh for another preparation pass.
    ///
    /// The finalized buffers are converted back into ingestion state
    /// (in finalized face order) and hardware copies are released.
    pub fn roll_back_prepare(
        &mut self,
        driver: Option<&mut dyn RenderDriver>,
    ) -> Result<(), MeshError> {
        if self.status != PrepareStatus::Prepared {
            return Err(MeshError::InvalidState {
                operation: "roll back preparation",
                reason: "the mesh has not been finalized",
            });
        }

        self.prep.vertex_data = std::mem::take(&mut self.vertex_data);
        self.prep.vertex_flags = std::mem::take(&mut self.vertex_flags);
        self.prep.vertex_count = self.prep.vertex_flags.len() as u32;
        self.prep.triangles = self
            .indices
            .chunks_exact(3)
            .zip(&self.triangle_keys)
            .map(|(tri, key)| Triangle::new([tri[0], tri[1], tri[2]], key.material, key.data_group))
            .collect();

        self.release_hardware(driver);
        self.discard_finalized();
        self.status = PrepareStatus::Preparing;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Finalized queries
    // ------------------------------------------------------------------

    /// Number of finalized vertices.
    pub fn vertex_count(&self) -> u32 {
        self.vertex_flags.len() as u32
    }

    /// Number of finalized faces.
    pub fn face_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }

    /// Finalized interleaved vertex bytes.
    pub fn system_vertices(&self) -> &[u8] {
        &self.vertex_data
    }

    /// Finalized index buffer.
    pub fn system_indices(&self) -> &[u32] {
        &self.indices
    }

    /// Finalized subsets in (data group, material) order.
    pub fn subsets(&self) -> &[MeshSubset] {
        &self.subsets
    }

    /// Look up the subset for a (data group, material) pair.
    pub fn subset(&self, data_group: u32, material: MaterialHandle) -> Option<&MeshSubset> {
        self.subset_lookup
            .get(&SubsetKey::new(data_group, material))
            .map(|&i| &self.subsets[i])
    }

    /// Distinct materials used by the finalized mesh, in subset order.
    pub fn materials(&self) -> Vec<MaterialHandle> {
        let mut materials: Vec<MaterialHandle> =
            self.subsets.iter().map(|s| s.key.material).collect();
        materials.sort_unstable();
        materials.dedup();
        materials
    }

    /// Subset key of a finalized face.
    pub fn face_key(&self, face: u32) -> Option<SubsetKey> {
        self.triangle_keys.get(face as usize).copied()
    }

    /// Object-space bounds of the finalized geometry.
    pub fn bounding_box(&self) -> &BoundingBox {
        &self.bounds
    }

    /// Bone palettes produced for skinned geometry.
    pub fn bone_palettes(&self) -> &[BonePalette] {
        &self.palettes
    }

    /// The bound skin data, with influence lists in finalized vertex space.
    pub fn skin_bind_data(&self) -> Option<&SkinBindData> {
        self.skin.as_ref()
    }

    /// Whether the face order went through the cache optimizer.
    pub fn is_optimized(&self) -> bool {
        self.status == PrepareStatus::Prepared && self.optimized
    }

    /// Cast a ray against the finalized geometry.
    ///
    /// Returns the nearest hit, or `None` when the ray misses or the
    /// mesh is not finalized.
    pub fn pick(&self, origin: &Vec3, direction: &Vec3) -> Option<MeshHit> {
        if self.status != PrepareStatus::Prepared {
            return None;
        }
        let layout = self.layout.as_ref()?;
        let read = |index: u32| {
            layout.read_vec3(
                &self.vertex_data,
                index as usize,
                VertexAttributeSemantic::Position,
            )
        };

        let mut nearest: Option<MeshHit> = None;
        for (face, tri) in self.indices.chunks_exact(3).enumerate() {
            let (Some(v0), Some(v1), Some(v2)) = (read(tri[0]), read(tri[1]), read(tri[2])) else {
                continue;
            };
            if let Some(distance) = intersect_ray_triangle(origin, direction, &v0, &v1, &v2) {
                if nearest.is_none_or(|hit| distance < hit.distance) {
                    nearest = Some(MeshHit {
                        distance,
                        face: face as u32,
                        material: self.triangle_keys[face].material,
                    });
                }
            }
        }
        nearest
    }

    // ------------------------------------------------------------------
    // Finalized mutation
    // ------------------------------------------------------------------

    /// Reassign one finalized face to a different material.
    ///
    /// Regroups the affected geometry, so subset ranges and vertex
    /// order may change. Not supported on skinned meshes, where faces
    /// are tied to bone palettes.
    pub fn set_face_material(
        &mut self,
        face: u32,
        material: MaterialHandle,
        driver: Option<&mut dyn RenderDriver>,
    ) -> Result<(), MeshError> {
        self.require_prepared("set face material")?;
        if !self.palettes.is_empty() {
            return Err(MeshError::InvalidState {
                operation: "set face material",
                reason: "faces of a skinned mesh are tied to bone palettes",
            });
        }
        if self.has_hardware_copy() && driver.is_none() {
            return Err(MeshError::InvalidState {
                operation: "set face material",
                reason: "hardware copies exist but no driver was given to refresh them",
            });
        }
        let Some(key) = self.triangle_keys.get_mut(face as usize) else {
            return Err(MeshError::IndexOutOfRange {
                index: face,
                vertex_count: (self.indices.len() / 3) as u32,
            });
        };
        if key.material == material {
            return Ok(());
        }
        key.material = material;
        self.regroup_finalized(driver)
    }

    /// Reassign every finalized face to one material.
    pub fn set_mesh_material(
        &mut self,
        material: MaterialHandle,
        driver: Option<&mut dyn RenderDriver>,
    ) -> Result<(), MeshError> {
        self.require_prepared("set mesh material")?;
        if !self.palettes.is_empty() {
            return Err(MeshError::InvalidState {
                operation: "set mesh material",
                reason: "faces of a skinned mesh are tied to bone palettes",
            });
        }
        if self.has_hardware_copy() && driver.is_none() {
            return Err(MeshError::InvalidState {
                operation: "set mesh material",
                reason: "hardware copies exist but no driver was given to refresh them",
            });
        }
        if self.triangle_keys.iter().all(|key| key.material == material) {
            return Ok(());
        }
        for key in &mut self.triangle_keys {
            key.material = material;
        }
        self.regroup_finalized(driver)
    }

    /// Uniformly scale all positions (and the bounds) by `scale`.
    ///
    /// Valid both during preparation and on a finalized mesh; in the
    /// latter case hardware copies are re-uploaded when a driver is
    /// given.
    pub fn scale_mesh_data(
        &mut self,
        scale: f32,
        driver: Option<&mut dyn RenderDriver>,
    ) -> Result<(), MeshError> {
        let layout = match self.status {
            PrepareStatus::Preparing | PrepareStatus::Prepared => self.layout.clone().ok_or(
                MeshError::InvalidState {
                    operation: "scale mesh data",
                    reason: "no vertex layout is active",
                },
            )?,
            PrepareStatus::Unprepared => {
                return Err(MeshError::InvalidState {
                    operation: "scale mesh data",
                    reason: "the mesh holds no geometry",
                })
            }
        };

        let (data, count) = if self.status == PrepareStatus::Preparing {
            (&mut self.prep.vertex_data, self.prep.vertex_count)
        } else {
            (&mut self.vertex_data, self.vertex_flags.len() as u32)
        };
        for vertex in 0..count as usize {
            if let Some(p) = layout.read_vec3(data, vertex, VertexAttributeSemantic::Position) {
                layout.write_vec3(data, vertex, VertexAttributeSemantic::Position, p * scale);
            }
        }

        if self.status == PrepareStatus::Prepared {
            self.recompute_bounds(&layout);
            self.reupload_or_fail(driver, "scale mesh data")?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Hardware
    // ------------------------------------------------------------------

    /// Recreate hardware buffers from the system copies, e.g. after a
    /// device loss invalidated the previous handles.
    pub fn restore_buffers(&mut self, driver: &mut dyn RenderDriver) -> Result<(), MeshError> {
        self.require_prepared("restore buffers")?;
        if let Some(handle) = self.vertex_buffer.take() {
            driver.destroy_vertex_buffer(handle);
        }
        if let Some(handle) = self.index_buffer.take() {
            driver.destroy_index_buffer(handle);
        }
        self.upload(driver)
    }

    /// Whether hardware copies currently exist.
    pub fn has_hardware_copy(&self) -> bool {
        self.vertex_buffer.is_some() && self.index_buffer.is_some()
    }

    /// Draw every subset of the finalized mesh.
    pub fn draw(&self, driver: &mut dyn RenderDriver) -> Result<(), MeshError> {
        let (vertices, indices) = self.hardware_handles("draw mesh")?;
        for subset in &self.subsets {
            driver.draw_indexed(vertices, indices, Self::subset_range(subset));
        }
        Ok(())
    }

    /// Draw the subset matching a (data group, material) pair.
    ///
    /// Drawing a pair the mesh has no faces for is a no-op.
    pub fn draw_subset(
        &self,
        data_group: u32,
        material: MaterialHandle,
        driver: &mut dyn RenderDriver,
    ) -> Result<(), MeshError> {
        let (vertices, indices) = self.hardware_handles("draw subset")?;
        match self.subset(data_group, material) {
            Some(subset) => driver.draw_indexed(vertices, indices, Self::subset_range(subset)),
            None => log::trace!(
                "draw_subset: no faces for data group {} material {:?}",
                data_group,
                material
            ),
        }
        Ok(())
    }

    /// Draw every subset belonging to a data group.
    pub fn draw_data_group(
        &self,
        data_group: u32,
        driver: &mut dyn RenderDriver,
    ) -> Result<(), MeshError> {
        let (vertices, indices) = self.hardware_handles("draw data group")?;
        for subset in self.subsets.iter().filter(|s| s.key.data_group == data_group) {
            driver.draw_indexed(vertices, indices, Self::subset_range(subset));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn require_preparing(&self, operation: &'static str) -> Result<Arc<VertexLayout>, MeshError> {
        if self.status != PrepareStatus::Preparing {
            return Err(MeshError::InvalidState {
                operation,
                reason: "no preparation pass is open",
            });
        }
        self.layout.clone().ok_or(MeshError::InvalidState {
            operation,
            reason: "no vertex layout is active",
        })
    }

    fn require_prepared(&self, operation: &'static str) -> Result<(), MeshError> {
        if self.status != PrepareStatus::Prepared {
            return Err(MeshError::InvalidState {
                operation,
                reason: "the mesh has not been finalized",
            });
        }
        Ok(())
    }

    fn hardware_handles(
        &self,
        operation: &'static str,
    ) -> Result<(VertexBufferHandle, IndexBufferHandle), MeshError> {
        self.require_prepared(operation)?;
        match (self.vertex_buffer, self.index_buffer) {
            (Some(vertices), Some(indices)) => Ok((vertices, indices)),
            _ => Err(MeshError::InvalidState {
                operation,
                reason: "the mesh has no hardware copies",
            }),
        }
    }

    fn subset_range(subset: &MeshSubset) -> DrawRange {
        DrawRange {
            face_start: subset.face_start,
            face_count: subset.face_count,
            vertex_start: subset.vertex_start,
            vertex_count: subset.vertex_count,
        }
    }

    fn derive_attributes(&mut self, layout: &VertexLayout) -> Result<(), MeshError> {
        let (needs_normals, needs_tangents, needs_binormals) = {
            let missing =
                |flag: SourceFlags| self.prep.vertex_flags.iter().any(|f| !f.contains(flag));
            (
                layout.has_semantic(VertexAttributeSemantic::Normal)
                    && missing(SourceFlags::NORMAL),
                layout.has_semantic(VertexAttributeSemantic::Tangent)
                    && missing(SourceFlags::TANGENT),
                layout.has_semantic(VertexAttributeSemantic::Binormal)
                    && missing(SourceFlags::BINORMAL),
            )
        };

        if needs_normals {
            let keys =
                adjacency::position_keys(layout, &self.prep.vertex_data, self.prep.vertex_count);
            let adj = adjacency::build_adjacency(&keys, &self.prep.triangles);
            attributes::generate_normals(layout, &mut self.prep, &keys, &adj);
        }
        if needs_tangents || needs_binormals {
            if !layout.has_semantic(VertexAttributeSemantic::Normal) {
                return Err(MeshError::MissingAttribute(VertexAttributeSemantic::Normal));
            }
            if !layout.has_semantic(VertexAttributeSemantic::TexCoord0) {
                return Err(MeshError::MissingAttribute(VertexAttributeSemantic::TexCoord0));
            }
            attributes::generate_tangents(layout, &mut self.prep);
        }
        Ok(())
    }

    /// Rebuild subsets and compaction after finalized face keys changed.
    fn regroup_finalized(
        &mut self,
        driver: Option<&mut dyn RenderDriver>,
    ) -> Result<(), MeshError> {
        let layout = self.layout.clone().ok_or(MeshError::InvalidState {
            operation: "regroup mesh",
            reason: "no vertex layout is active",
        })?;

        let triangles: Vec<Triangle> = self
            .indices
            .chunks_exact(3)
            .zip(&self.triangle_keys)
            .map(|(tri, key)| Triangle::new([tri[0], tri[1], tri[2]], key.material, key.data_group))
            .collect();
        let mut build = subset::build_subsets(&triangles, self.config.max_subsets)?;
        if self.optimized {
            for subset in &build.subsets {
                let start = subset.face_start as usize * 3;
                let end = start + subset.face_count as usize * 3;
                optimize::optimize_subset(&mut build.indices[start..end], self.config.cache_size);
            }
        }

        let (vertex_remap, vertex_count) = subset::compact_vertices(
            &mut build.indices,
            &mut build.subsets,
            self.vertex_flags.len(),
        );
        let stride = layout.stride as usize;
        let mut vertex_data = vec![0u8; vertex_count as usize * stride];
        let mut vertex_flags = vec![SourceFlags::empty(); vertex_count as usize];
        for (old, &new) in vertex_remap.iter().enumerate() {
            if new == u32::MAX {
                continue;
            }
            let dst = new as usize;
            vertex_data[dst * stride..(dst + 1) * stride]
                .copy_from_slice(&self.vertex_data[old * stride..(old + 1) * stride]);
            vertex_flags[dst] = self.vertex_flags[old];
        }

        self.vertex_data = vertex_data;
        self.vertex_flags = vertex_flags;
        self.indices = build.indices;
        self.triangle_keys = build.triangle_keys;
        self.subsets = build.subsets;
        self.subset_lookup = self
            .subsets
            .iter()
            .enumerate()
            .map(|(i, s)| (s.key, i))
            .collect();

        self.reupload_or_fail(driver, "regroup mesh")
    }

    fn recompute_bounds(&mut self, layout: &VertexLayout) {
        self.bounds = BoundingBox::empty();
        for vertex in 0..self.vertex_flags.len() {
            if let Some(p) =
                layout.read_vec3(&self.vertex_data, vertex, VertexAttributeSemantic::Position)
            {
                self.bounds.add_point(p);
            }
        }
    }

    fn upload(&mut self, driver: &mut dyn RenderDriver) -> Result<(), MeshError> {
        let stride = self.layout.as_ref().map_or(0, |l| l.stride);
        match self.vertex_buffer {
            Some(handle) => driver.update_vertex_buffer(handle, &self.vertex_data)?,
            None => {
                self.vertex_buffer = Some(driver.create_vertex_buffer(&self.vertex_data, stride)?)
            }
        }
        match self.index_buffer {
            Some(handle) => driver.update_index_buffer(handle, &self.indices)?,
            None => self.index_buffer = Some(driver.create_index_buffer(&self.indices)?),
        }
        Ok(())
    }

    /// Re-upload after mutating system copies. Mutating hardware-backed
    /// buffers without a driver to refresh them is rejected up front.
    fn reupload_or_fail(
        &mut self,
        driver: Option<&mut dyn RenderDriver>,
        operation: &'static str,
    ) -> Result<(), MeshError> {
        match (self.has_hardware_copy(), driver) {
            (true, Some(driver)) => self.upload(driver),
            (true, None) => Err(MeshError::InvalidState {
                operation,
                reason: "hardware copies exist but no driver was given to refresh them",
            }),
            (false, _) => Ok(()),
        }
    }

    fn release_hardware(&mut self, driver: Option<&mut dyn RenderDriver>) {
        match driver {
            Some(driver) => {
                if let Some(handle) = self.vertex_buffer.take() {
                    driver.destroy_vertex_buffer(handle);
                }
                if let Some(handle) = self.index_buffer.take() {
                    driver.destroy_index_buffer(handle);
                }
            }
            None => {
                if self.vertex_buffer.take().is_some() | self.index_buffer.take().is_some() {
                    log::warn!("hardware buffers abandoned without a driver to destroy them");
                }
            }
        }
    }

    fn discard_finalized(&mut self) {
        self.vertex_data = Vec::new();
        self.vertex_flags = Vec::new();
        self.indices = Vec::new();
        self.triangle_keys = Vec::new();
        self.subsets = Vec::new();
        self.subset_lookup.clear();
        self.palettes = Vec::new();
        self.bounds = BoundingBox::empty();
        self.optimized = false;
    }
}
