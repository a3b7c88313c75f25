//! Error types for mesh preparation.

use thiserror::Error;

use crate::driver::DriverError;
use crate::layout::VertexAttributeSemantic;

/// Errors that can occur while building or querying a mesh.
///
/// Malformed input and resource exhaustion abort the current
/// `end_prepare` and leave the mesh open for retry; misuse errors
/// (wrong preparation state) never corrupt existing finalized data.
#[derive(Debug, Error)]
pub enum MeshError {
    /// A primitive referenced a vertex that has not been ingested.
    #[error("triangle index {index} out of range (only {vertex_count} vertices ingested)")]
    IndexOutOfRange {
        /// The offending index value.
        index: u32,
        /// Number of vertices ingested so far.
        vertex_count: u32,
    },

    /// Raw vertex data does not match the layout stride.
    #[error("vertex data length {len} is not a multiple of the layout stride {stride}")]
    InvalidVertexData {
        /// Length of the provided byte slice.
        len: usize,
        /// Stride of the active vertex layout.
        stride: usize,
    },

    /// The vertex layout is self-inconsistent.
    #[error("invalid vertex layout: {0}")]
    InvalidLayout(String),

    /// The submitted index list does not form whole triangles.
    #[error("index count {0} is not a multiple of 3")]
    InvalidIndexCount(usize),

    /// The vertex layout lacks an attribute the operation requires.
    #[error("vertex layout has no {0:?} attribute")]
    MissingAttribute(VertexAttributeSemantic),

    /// More (material, data group) combinations than the configured limit.
    #[error("mesh requires {count} subsets but only {limit} are allowed")]
    TooManySubsets {
        /// Number of distinct subset keys discovered.
        count: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// A single face is influenced by more bones than fit in one palette.
    #[error(
        "face {face} is influenced by {bone_count} bones but palettes hold at most {palette_size}"
    )]
    FaceExceedsPalette {
        /// Index of the offending face.
        face: u32,
        /// Unique bones influencing the face.
        bone_count: usize,
        /// Maximum palette capacity.
        palette_size: usize,
    },

    /// The operation is not valid in the mesh's current preparation state.
    #[error("cannot {operation}: {reason}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// Why the state machine rejected it.
        reason: &'static str,
    },

    /// A render driver call failed.
    #[error("render driver error: {0}")]
    Driver(#[from] DriverError),
}
