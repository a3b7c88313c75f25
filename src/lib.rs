//! # meshforge
//!
//! A mesh finalization pipeline. Takes an arbitrary, possibly malformed
//! stream of vertices and triangles and turns it into a validated,
//! deduplicated, cache-friendly renderable mesh:
//!
//! - [`layout::VertexLayout`] - Describes the interleaved vertex format
//! - [`mesh::Mesh`] - The mesh being prepared / the finalized result
//! - [`mesh::SkinBindData`] - Bone/vertex influence data for skinned meshes
//! - [`driver::RenderDriver`] - Abstraction over the GPU buffer owner
//!
//! The pipeline runs in a single `prepare -> add_* -> end_prepare` pass:
//! vertex welding, adjacency construction, derivation of missing normals
//! and tangent bases, subset batching by (material, data group), bone
//! palette packing for fixed-capacity GPU skinning, and vertex cache
//! optimization of the final index stream.

pub mod driver;
pub mod error;
pub mod layout;
pub mod math;
pub mod mesh;

pub use driver::{
    DrawRange, DriverError, IndexBufferHandle, NullDriver, RenderDriver, VertexBufferHandle,
};
pub use error::MeshError;
pub use layout::{VertexAttribute, VertexAttributeFormat, VertexAttributeSemantic, VertexLayout};
pub use mesh::{
    BoneInfluence, BonePalette, FinalizeOptions, MaterialHandle, Mesh, MeshConfig, MeshHit,
    MeshSubset, PaletteFit, PrepareStatus, SkinBindData, SourceFlags, SubsetKey, Triangle,
    VertexInfluence,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
