//! End-to-end tests of the finalize pipeline.

use meshforge::mesh::optimize::simulated_cache_misses;
use meshforge::{
    BoneInfluence, DrawRange, DriverError, FinalizeOptions, IndexBufferHandle, MaterialHandle,
    Mesh, MeshConfig, MeshError, NullDriver, PrepareStatus, RenderDriver, SkinBindData,
    VertexAttributeSemantic, VertexBufferHandle, VertexLayout,
};
use meshforge::math::{Mat4, Vec3};
use rstest::rstest;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An (n+1)x(n+1) vertex grid of 2n^2 triangles in the XY plane.
fn grid_mesh(n: u32, material: MaterialHandle) -> Mesh {
    init_logging();
    let mut mesh = Mesh::new();
    mesh.prepare(VertexLayout::position_only(), None).unwrap();

    let mut positions: Vec<[f32; 3]> = Vec::new();
    for y in 0..=n {
        for x in 0..=n {
            positions.push([x as f32, y as f32, 0.0]);
        }
    }
    mesh.add_vertices(bytemuck::cast_slice(&positions)).unwrap();

    let mut indices = Vec::new();
    for y in 0..n {
        for x in 0..n {
            let v = |dx: u32, dy: u32| (y + dy) * (n + 1) + x + dx;
            indices.extend_from_slice(&[v(0, 0), v(1, 0), v(1, 1), v(0, 0), v(1, 1), v(0, 1)]);
        }
    }
    mesh.add_primitives(&indices, material, 0).unwrap();
    mesh
}

#[test]
fn quad_with_duplicate_seam_welds_to_four_vertices() {
    init_logging();
    let mut mesh = Mesh::new();
    mesh.prepare(VertexLayout::position_only(), None).unwrap();

    // Two triangles submitted with a fully duplicated diagonal edge.
    let positions: [[f32; 3]; 6] = [
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [1.0, 1.0, 0.0],
        [0.0, 0.0, 0.0],
        [1.0, 1.0, 0.0],
        [0.0, 1.0, 0.0],
    ];
    mesh.add_vertices(bytemuck::cast_slice(&positions)).unwrap();
    mesh.add_primitives(&[0, 1, 2, 3, 4, 5], MaterialHandle::new(0), 0)
        .unwrap();
    mesh.end_prepare(FinalizeOptions::default().with_hardware_copy(false), None)
        .unwrap();

    assert_eq!(mesh.vertex_count(), 4);
    assert_eq!(mesh.face_count(), 2);
}

#[test]
fn large_mesh_with_one_duplicate_pair_welds_to_exact_count() {
    init_logging();
    let mut mesh = Mesh::new();
    mesh.prepare(VertexLayout::position_only(), None).unwrap();

    // 10000 vertices on a line; vertex 5000 duplicates vertex 0 within
    // tolerance. Faces reference every vertex so none are dropped as
    // unreferenced.
    let mut positions: Vec<[f32; 3]> = (0..10_000)
        .map(|i| [i as f32 * 0.01, 0.0, 0.0])
        .collect();
    positions[5000] = [1e-7, 0.0, 0.0];
    mesh.add_vertices(bytemuck::cast_slice(&positions)).unwrap();

    let mut indices = Vec::new();
    for i in (0..9_999).step_by(2) {
        indices.extend_from_slice(&[i, i + 1, (i + 2) % 10_000]);
    }
    mesh.add_primitives(&indices, MaterialHandle::new(0), 0)
        .unwrap();
    mesh.end_prepare(FinalizeOptions::default().with_hardware_copy(false), None)
        .unwrap();

    assert_eq!(mesh.vertex_count(), 9_999);
}

#[test]
fn finalize_is_stable_across_roll_back() {
    let options = FinalizeOptions::default()
        .with_hardware_copy(false)
        .with_optimize(false);
    let mut mesh = grid_mesh(8, MaterialHandle::new(1));
    mesh.end_prepare(options, None).unwrap();

    let vertices = mesh.system_vertices().to_vec();
    let indices = mesh.system_indices().to_vec();

    // Rolling back and finalizing again reproduces the same buffers:
    // welding an already-welded mesh is the identity, and the grouped,
    // compacted order is a fixed point of the grouping pass.
    mesh.roll_back_prepare(None).unwrap();
    mesh.end_prepare(options, None).unwrap();

    assert_eq!(mesh.system_vertices(), &vertices[..]);
    assert_eq!(mesh.system_indices(), &indices[..]);
}

#[test]
fn roll_back_preserves_geometry_under_optimizer() {
    let options = FinalizeOptions::default().with_hardware_copy(false);
    let layout = VertexLayout::position_only();
    let mut mesh = grid_mesh(8, MaterialHandle::new(1));
    mesh.end_prepare(options, None).unwrap();

    let triangle_set = |mesh: &Mesh| {
        let mut set: Vec<[[u32; 3]; 3]> = mesh
            .system_indices()
            .chunks_exact(3)
            .map(|tri| {
                let mut corners = [[0u32; 3]; 3];
                for (slot, &index) in corners.iter_mut().zip(tri) {
                    let p = layout
                        .read_vec3(mesh.system_vertices(), index as usize, VertexAttributeSemantic::Position)
                        .unwrap();
                    *slot = [p.x.to_bits(), p.y.to_bits(), p.z.to_bits()];
                }
                corners
            })
            .collect();
        set.sort_unstable();
        set
    };

    let before = triangle_set(&mesh);
    let vertex_count = mesh.vertex_count();

    mesh.roll_back_prepare(None).unwrap();
    mesh.end_prepare(options, None).unwrap();

    // The optimizer may pick a different face order, but the triangle
    // set and the vertex count survive the round trip.
    assert_eq!(triangle_set(&mesh), before);
    assert_eq!(mesh.vertex_count(), vertex_count);
}

#[test]
fn subsets_partition_faces_and_vertices() {
    init_logging();
    let mut mesh = Mesh::new();
    mesh.prepare(VertexLayout::position_only(), None).unwrap();

    let positions: Vec<[f32; 3]> = (0..12).map(|i| [i as f32, (i % 3) as f32, 0.0]).collect();
    mesh.add_vertices(bytemuck::cast_slice(&positions)).unwrap();
    // Interleave materials and data groups.
    mesh.add_primitives(&[0, 1, 2], MaterialHandle::new(5), 1).unwrap();
    mesh.add_primitives(&[3, 4, 5], MaterialHandle::new(2), 0).unwrap();
    mesh.add_primitives(&[6, 7, 8], MaterialHandle::new(5), 1).unwrap();
    mesh.add_primitives(&[9, 10, 11], MaterialHandle::new(5), 0).unwrap();
    mesh.end_prepare(FinalizeOptions::default().with_hardware_copy(false), None)
        .unwrap();

    let subsets = mesh.subsets();
    assert_eq!(subsets.len(), 3);

    // Ordered by data group, then material.
    let keys: Vec<(u32, u32)> = subsets
        .iter()
        .map(|s| (s.key.data_group, s.key.material.id()))
        .collect();
    assert_eq!(keys, vec![(0, 2), (0, 5), (1, 5)]);

    // Face ranges tile the index buffer; vertex ranges tile the vertex
    // buffer; every index stays inside its subset's vertex range.
    let mut face_next = 0;
    let mut vertex_next = 0;
    for subset in subsets {
        assert_eq!(subset.face_start, face_next);
        assert_eq!(subset.vertex_start, vertex_next);
        face_next += subset.face_count;
        vertex_next += subset.vertex_count;

        let start = subset.face_start as usize * 3;
        let end = start + subset.face_count as usize * 3;
        let range = subset.vertex_start..subset.vertex_start + subset.vertex_count;
        for &index in &mesh.system_indices()[start..end] {
            assert!(range.contains(&index));
        }
    }
    assert_eq!(face_next, mesh.face_count());
    assert_eq!(vertex_next, mesh.vertex_count());
}

#[rstest]
#[case(16)]
#[case(32)]
fn optimizer_never_regresses_cache_misses(#[case] cache_size: usize) {
    let config = MeshConfig::default().with_cache_size(cache_size);

    let mut unoptimized = grid_mesh(16, MaterialHandle::new(0));
    let mut optimized = Mesh::with_config(config);
    optimized
        .prepare(VertexLayout::position_only(), None)
        .unwrap();
    optimized
        .add_vertices(bytemuck::cast_slice(
            &(0..17 * 17)
                .map(|i| [(i % 17) as f32, (i / 17) as f32, 0.0])
                .collect::<Vec<[f32; 3]>>(),
        ))
        .unwrap();
    // Same topology as the grid mesh, scrambled submission order.
    let mut faces: Vec<[u32; 3]> = Vec::new();
    for y in 0..16u32 {
        for x in 0..16u32 {
            let v = |dx: u32, dy: u32| (y + dy) * 17 + x + dx;
            faces.push([v(0, 0), v(1, 0), v(1, 1)]);
            faces.push([v(0, 0), v(1, 1), v(0, 1)]);
        }
    }
    let mut state = 0x9e3779b9u64;
    for i in (1..faces.len()).rev() {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let j = (state >> 33) as usize % (i + 1);
        faces.swap(i, j);
    }
    let scrambled: Vec<u32> = faces.into_iter().flatten().collect();
    optimized
        .add_primitives(&scrambled, MaterialHandle::new(0), 0)
        .unwrap();

    unoptimized
        .end_prepare(
            FinalizeOptions::default()
                .with_hardware_copy(false)
                .with_optimize(false),
            None,
        )
        .unwrap();
    optimized
        .end_prepare(FinalizeOptions::default().with_hardware_copy(false), None)
        .unwrap();

    let before = simulated_cache_misses(&scrambled, cache_size);
    let after = simulated_cache_misses(optimized.system_indices(), cache_size);
    assert!(
        after <= before,
        "cache size {}: misses regressed {} -> {}",
        cache_size,
        before,
        after
    );
    // The row-major submission is already coherent; the optimized
    // scramble should land in the same neighborhood.
    let row_major = simulated_cache_misses(unoptimized.system_indices(), cache_size);
    assert!(after <= row_major * 2);
}

#[test]
fn derived_normals_are_smooth_across_welded_seams() {
    init_logging();
    let layout = VertexLayout::position_normal_uv();
    let mut mesh = Mesh::new();
    mesh.prepare(layout.clone(), None).unwrap();

    // A tent of two quads meeting at a ridge; the ridge vertices are
    // duplicated and must weld before normal generation smooths them.
    // The triangulation is symmetric so each ridge vertex sees the same
    // number of faces per slope.
    let stride = layout.stride as usize;
    let positions = [
        // Left slope: a, r0, r1, b.
        Vec3::new(-1.0, 0.0, 0.0),
        Vec3::new(0.0, 1.0, 0.0),
        Vec3::new(0.0, 1.0, 1.0),
        Vec3::new(-1.0, 0.0, 1.0),
        // Right slope with the ridge duplicated: r0', c, r1', d.
        Vec3::new(0.0, 1.0, 0.0),
        Vec3::new(1.0, 0.0, 0.0),
        Vec3::new(0.0, 1.0, 1.0),
        Vec3::new(1.0, 0.0, 1.0),
    ];
    let mut data = vec![0u8; stride * positions.len()];
    for (i, p) in positions.iter().enumerate() {
        layout.write_vec3(&mut data, i, VertexAttributeSemantic::Position, *p);
    }
    mesh.add_vertices(&data).unwrap();
    mesh.add_primitives(
        &[0, 2, 1, 0, 3, 2, 4, 6, 5, 5, 6, 7],
        MaterialHandle::new(0),
        0,
    )
    .unwrap();
    mesh.end_prepare(FinalizeOptions::default().with_hardware_copy(false), None)
        .unwrap();

    // The duplicated ridge welded away.
    assert_eq!(mesh.vertex_count(), 6);

    // Ridge normals average both slopes: straight up.
    let finalized = mesh.system_vertices();
    let mut ridge_checked = 0;
    for v in 0..mesh.vertex_count() as usize {
        let p = layout
            .read_vec3(finalized, v, VertexAttributeSemantic::Position)
            .unwrap();
        let n = layout
            .read_vec3(finalized, v, VertexAttributeSemantic::Normal)
            .unwrap();
        assert!((n.norm() - 1.0).abs() < 1e-4);
        if p.x == 0.0 {
            assert!((n - Vec3::y()).norm() < 1e-4, "ridge normal {:?}", n);
            ridge_checked += 1;
        }
    }
    assert_eq!(ridge_checked, 2);
}

fn skinned_cube(palette_size: usize) -> (Mesh, NullDriver) {
    init_logging();
    let layout = VertexLayout::skinned();
    let mut driver = NullDriver::new();
    let mut mesh = Mesh::with_config(MeshConfig::default().with_palette_size(palette_size));
    mesh.prepare(layout.clone(), None).unwrap();

    // Cube corners; each face quad gets its own bone pair so palette
    // packing has something to pack.
    let corners: [[f32; 3]; 8] = [
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [1.0, 1.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.0, 0.0, 1.0],
        [1.0, 0.0, 1.0],
        [1.0, 1.0, 1.0],
        [0.0, 1.0, 1.0],
    ];
    let stride = layout.stride as usize;
    let mut data = vec![0u8; stride * 8];
    for (i, p) in corners.iter().enumerate() {
        layout.write_vec3(
            &mut data,
            i,
            VertexAttributeSemantic::Position,
            Vec3::new(p[0], p[1], p[2]),
        );
    }
    mesh.add_vertices(&data).unwrap();
    let quads: [[u32; 4]; 6] = [
        [0, 1, 2, 3],
        [5, 4, 7, 6],
        [4, 0, 3, 7],
        [1, 5, 6, 2],
        [3, 2, 6, 7],
        [4, 5, 1, 0],
    ];
    for quad in &quads {
        mesh.add_primitives(
            &[quad[0], quad[1], quad[2], quad[0], quad[2], quad[3]],
            MaterialHandle::new(0),
            0,
        )
        .unwrap();
    }

    // Two bones per cube half; every vertex is influenced by the half
    // it belongs to, with the z=0 / z=1 planes split between them.
    let mut skin = SkinBindData::new();
    let mut near = BoneInfluence::new("near", Mat4::identity());
    let mut far = BoneInfluence::new("far", Mat4::identity());
    for v in 0..4 {
        near.add_influence(v, 1.0);
    }
    for v in 4..8 {
        far.add_influence(v, 1.0);
    }
    skin.add_bone(near);
    skin.add_bone(far);

    mesh.bind_skin(&skin, true, Some(&mut driver)).unwrap();
    (mesh, driver)
}

#[test]
fn skinned_cube_packs_one_palette() {
    let (mesh, _driver) = skinned_cube(64);
    assert_eq!(mesh.status(), PrepareStatus::Prepared);

    let palettes = mesh.bone_palettes();
    assert_eq!(palettes.len(), 1);
    assert_eq!(palettes[0].bones().len(), 2);
    assert_eq!(palettes[0].faces().len(), mesh.face_count() as usize);
    // Single-bone corners and dual-bone side faces: at most one blend.
    assert_eq!(palettes[0].maximum_blend_index(), 0);

    // Every vertex's blend indices stay inside the palette.
    let layout = mesh.vertex_layout().unwrap().clone();
    for v in 0..mesh.vertex_count() as usize {
        let joints = layout
            .read_uint4(mesh.system_vertices(), v, VertexAttributeSemantic::Joints)
            .unwrap();
        assert!(joints[0] < palettes[0].bones().len() as u32);
    }
}

#[test]
fn face_exceeding_palette_aborts_finalize() {
    init_logging();
    let mut mesh = Mesh::with_config(MeshConfig::default().with_palette_size(1));
    mesh.prepare(VertexLayout::skinned(), None).unwrap();
    let positions: [[f32; 3]; 3] = [[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
    let layout = VertexLayout::skinned();
    let mut data = vec![0u8; layout.stride as usize * 3];
    for (i, p) in positions.iter().enumerate() {
        layout.write_vec3(
            &mut data,
            i,
            VertexAttributeSemantic::Position,
            Vec3::new(p[0], p[1], p[2]),
        );
    }
    mesh.add_vertices(&data).unwrap();
    mesh.add_primitives(&[0, 1, 2], MaterialHandle::new(0), 0)
        .unwrap();

    let mut skin = SkinBindData::new();
    let mut a = BoneInfluence::new("a", Mat4::identity());
    a.add_influence(0, 1.0);
    let mut b = BoneInfluence::new("b", Mat4::identity());
    b.add_influence(1, 1.0);
    skin.add_bone(a);
    skin.add_bone(b);

    let err = mesh.bind_skin(&skin, true, None).unwrap_err();
    assert!(matches!(
        err,
        meshforge::MeshError::FaceExceedsPalette {
            bone_count: 2,
            palette_size: 1,
            ..
        }
    ));
    // The pass stays open for correction.
    assert_eq!(mesh.status(), PrepareStatus::Preparing);
}

#[test]
fn tight_palettes_split_and_duplicate_shared_vertices() {
    init_logging();
    let layout = VertexLayout::skinned();
    let mut mesh = Mesh::with_config(MeshConfig::default().with_palette_size(2));
    mesh.prepare(layout.clone(), None).unwrap();

    // Two triangles sharing an edge; three bones so the faces' bone
    // sets ({a, b} and {b, c}) cannot share a two-slot palette.
    let positions: [[f32; 3]; 4] = [
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [0.0, 1.0, 0.0],
        [1.0, 1.0, 0.0],
    ];
    let mut data = vec![0u8; layout.stride as usize * 4];
    for (i, p) in positions.iter().enumerate() {
        layout.write_vec3(
            &mut data,
            i,
            VertexAttributeSemantic::Position,
            Vec3::new(p[0], p[1], p[2]),
        );
    }
    mesh.add_vertices(&data).unwrap();
    mesh.add_primitives(&[0, 1, 2, 1, 3, 2], MaterialHandle::new(0), 0)
        .unwrap();

    let mut skin = SkinBindData::new();
    let mut a = BoneInfluence::new("a", Mat4::identity());
    a.add_influence(0, 1.0);
    let mut b = BoneInfluence::new("b", Mat4::identity());
    b.add_influence(1, 1.0);
    b.add_influence(2, 1.0);
    let mut c = BoneInfluence::new("c", Mat4::identity());
    c.add_influence(3, 1.0);
    skin.add_bone(a);
    skin.add_bone(b);
    skin.add_bone(c);

    mesh.bind_skin(&skin, false, None).unwrap();
    mesh.end_prepare(FinalizeOptions::default().with_hardware_copy(false), None)
        .unwrap();

    let palettes = mesh.bone_palettes();
    assert_eq!(palettes.len(), 2);
    // The shared edge vertices were duplicated, one copy per palette.
    assert_eq!(mesh.vertex_count(), 6);

    // Palette face lists partition the faces, and every vertex of a
    // palette's faces carries blend indices valid for that palette.
    let mut covered = 0;
    for palette in palettes {
        covered += palette.faces().len();
        for &face in palette.faces() {
            assert!(face < mesh.face_count());
            let tri = &mesh.system_indices()[face as usize * 3..face as usize * 3 + 3];
            for &vertex in tri {
                let joints = layout
                    .read_uint4(
                        mesh.system_vertices(),
                        vertex as usize,
                        VertexAttributeSemantic::Joints,
                    )
                    .unwrap();
                assert!(joints[0] < palette.bones().len() as u32);
            }
        }
    }
    assert_eq!(covered, mesh.face_count() as usize);
}

#[test]
fn skinned_influences_track_finalized_vertices() {
    let (mesh, _driver) = skinned_cube(64);
    let skin = mesh.skin_bind_data().unwrap();
    let count = mesh.vertex_count();
    for bone in skin.bones() {
        for influence in &bone.influences {
            assert!(influence.vertex < count);
        }
    }
}

#[test]
fn hardware_copy_uploads_and_draws() {
    init_logging();
    let mut driver = NullDriver::new();
    let mut mesh = grid_mesh(4, MaterialHandle::new(3));
    mesh.end_prepare(FinalizeOptions::default(), Some(&mut driver))
        .unwrap();

    assert_eq!(driver.live_vertex_buffers(), 1);
    assert_eq!(driver.live_index_buffers(), 1);

    mesh.draw(&mut driver).unwrap();
    assert_eq!(driver.draws.len(), 1);
    assert_eq!(driver.draws[0].face_count, mesh.face_count());

    // Roll back releases the hardware copies.
    mesh.roll_back_prepare(Some(&mut driver)).unwrap();
    assert_eq!(driver.live_vertex_buffers(), 0);
    assert_eq!(driver.live_index_buffers(), 0);
}

/// Driver whose allocations always fail.
struct FailingDriver;

impl RenderDriver for FailingDriver {
    fn create_vertex_buffer(
        &mut self,
        _data: &[u8],
        _stride: u32,
    ) -> Result<VertexBufferHandle, DriverError> {
        Err(DriverError::OutOfMemory)
    }

    fn create_index_buffer(&mut self, _indices: &[u32]) -> Result<IndexBufferHandle, DriverError> {
        Err(DriverError::OutOfMemory)
    }

    fn update_vertex_buffer(
        &mut self,
        _handle: VertexBufferHandle,
        _data: &[u8],
    ) -> Result<(), DriverError> {
        Err(DriverError::OutOfMemory)
    }

    fn update_index_buffer(
        &mut self,
        _handle: IndexBufferHandle,
        _indices: &[u32],
    ) -> Result<(), DriverError> {
        Err(DriverError::OutOfMemory)
    }

    fn destroy_vertex_buffer(&mut self, _handle: VertexBufferHandle) {}

    fn destroy_index_buffer(&mut self, _handle: IndexBufferHandle) {}

    fn draw_indexed(
        &mut self,
        _vertices: VertexBufferHandle,
        _indices: IndexBufferHandle,
        _range: DrawRange,
    ) {
    }
}

#[test]
fn failed_upload_leaves_pass_open_for_retry() {
    let mut mesh = grid_mesh(4, MaterialHandle::new(0));

    let err = mesh
        .end_prepare(FinalizeOptions::default(), Some(&mut FailingDriver))
        .unwrap_err();
    assert!(matches!(err, MeshError::Driver(DriverError::OutOfMemory)));
    assert_eq!(mesh.status(), PrepareStatus::Preparing);
    assert!(!mesh.has_hardware_copy());

    // The same pass finalizes once a working driver is available.
    let mut driver = NullDriver::new();
    mesh.end_prepare(FinalizeOptions::default(), Some(&mut driver))
        .unwrap();
    assert_eq!(mesh.status(), PrepareStatus::Prepared);
    assert_eq!(mesh.vertex_count(), 25);
    assert_eq!(mesh.face_count(), 32);
    assert_eq!(driver.live_vertex_buffers(), 1);
    assert_eq!(driver.live_index_buffers(), 1);
}

#[test]
fn tiny_cache_size_still_finalizes() {
    init_logging();
    let mut mesh = Mesh::with_config(MeshConfig::default().with_cache_size(3));
    mesh.prepare(VertexLayout::position_only(), None).unwrap();

    let positions: [[f32; 3]; 4] = [
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [1.0, 1.0, 0.0],
        [0.0, 1.0, 0.0],
    ];
    mesh.add_vertices(bytemuck::cast_slice(&positions)).unwrap();
    mesh.add_primitives(&[0, 1, 2, 0, 2, 3], MaterialHandle::new(0), 0)
        .unwrap();
    mesh.end_prepare(FinalizeOptions::default().with_hardware_copy(false), None)
        .unwrap();

    assert_eq!(mesh.face_count(), 2);
    assert!(mesh.is_optimized());
}

#[test]
fn prepare_with_driver_releases_stale_buffers() {
    init_logging();
    let mut driver = NullDriver::new();
    let mut mesh = grid_mesh(2, MaterialHandle::new(0));
    mesh.end_prepare(FinalizeOptions::default(), Some(&mut driver))
        .unwrap();
    assert_eq!(driver.live_vertex_buffers(), 1);

    mesh.prepare(VertexLayout::position_only(), Some(&mut driver))
        .unwrap();
    assert_eq!(driver.live_vertex_buffers(), 0);
    assert_eq!(driver.live_index_buffers(), 0);
}
