//! Render driver abstraction.
//!
//! The mesh core never talks to a GPU API directly. At finalize time it
//! hands its system-memory buffers to a [`RenderDriver`], which owns the
//! hardware copies and performs the actual submission. [`NullDriver`]
//! provides a valid implementation for tests and headless tools without
//! requiring GPU hardware.

use std::collections::HashMap;

use thiserror::Error;

/// Errors that can occur in driver operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Failed to create a buffer resource.
    #[error("buffer creation failed: {0}")]
    BufferCreationFailed(String),
    /// Out of GPU memory.
    #[error("out of GPU memory")]
    OutOfMemory,
    /// The device was lost.
    #[error("GPU device lost")]
    DeviceLost,
    /// A stale or foreign buffer handle was passed in.
    #[error("invalid buffer handle")]
    InvalidHandle,
}

/// Handle to a driver-owned vertex buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBufferHandle(pub(crate) u64);

/// Handle to a driver-owned index buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexBufferHandle(pub(crate) u64);

/// A contiguous range of mesh geometry to draw with one call.
///
/// Face counts are in triangles; the index range covered is
/// `[face_start * 3, (face_start + face_count) * 3)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawRange {
    /// First triangle to draw.
    pub face_start: u32,
    /// Number of triangles to draw.
    pub face_count: u32,
    /// First vertex referenced by the range.
    pub vertex_start: u32,
    /// Number of vertices referenced by the range.
    pub vertex_count: u32,
}

/// Owner of hardware vertex/index buffers.
///
/// Implementations wrap a real GPU API. The mesh uploads via
/// `create_*`, re-uploads via `update_*` after mutating its system
/// copies, and describes geometry through [`RenderDriver::draw_indexed`];
/// everything past that point (pipelines, bindings, submission) is the
/// driver's business.
pub trait RenderDriver {
    /// Create a vertex buffer initialized with the given interleaved data.
    fn create_vertex_buffer(
        &mut self,
        data: &[u8],
        stride: u32,
    ) -> Result<VertexBufferHandle, DriverError>;

    /// Create a 32-bit index buffer initialized with the given indices.
    fn create_index_buffer(&mut self, indices: &[u32]) -> Result<IndexBufferHandle, DriverError>;

    /// Replace the full contents of a vertex buffer.
    fn update_vertex_buffer(
        &mut self,
        handle: VertexBufferHandle,
        data: &[u8],
    ) -> Result<(), DriverError>;

    /// Replace the full contents of an index buffer.
    fn update_index_buffer(
        &mut self,
        handle: IndexBufferHandle,
        indices: &[u32],
    ) -> Result<(), DriverError>;

    /// Destroy a vertex buffer. Destroying an unknown handle is a no-op.
    fn destroy_vertex_buffer(&mut self, handle: VertexBufferHandle);

    /// Destroy an index buffer. Destroying an unknown handle is a no-op.
    fn destroy_index_buffer(&mut self, handle: IndexBufferHandle);

    /// Draw an indexed triangle range from the given buffers.
    fn draw_indexed(
        &mut self,
        vertices: VertexBufferHandle,
        indices: IndexBufferHandle,
        range: DrawRange,
    );
}

/// Driver that records operations without touching a GPU.
///
/// Buffers are tracked by size only; submitted draw calls are kept in
/// [`NullDriver::draws`] so tests can assert on the emitted geometry.
#[derive(Debug, Default)]
pub struct NullDriver {
    next_handle: u64,
    vertex_buffers: HashMap<u64, usize>,
    index_buffers: HashMap<u64, usize>,
    /// Draw calls submitted so far, in order.
    pub draws: Vec<DrawRange>,
}

impl NullDriver {
    /// Create a new null driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live vertex buffers.
    pub fn live_vertex_buffers(&self) -> usize {
        self.vertex_buffers.len()
    }

    /// Number of live index buffers.
    pub fn live_index_buffers(&self) -> usize {
        self.index_buffers.len()
    }

    fn next(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

impl RenderDriver for NullDriver {
    fn create_vertex_buffer(
        &mut self,
        data: &[u8],
        stride: u32,
    ) -> Result<VertexBufferHandle, DriverError> {
        let id = self.next();
        log::trace!(
            "NullDriver: creating vertex buffer {} ({} bytes, stride {})",
            id,
            data.len(),
            stride
        );
        self.vertex_buffers.insert(id, data.len());
        Ok(VertexBufferHandle(id))
    }

    fn create_index_buffer(&mut self, indices: &[u32]) -> Result<IndexBufferHandle, DriverError> {
        let id = self.next();
        log::trace!(
            "NullDriver: creating index buffer {} ({} indices)",
            id,
            indices.len()
        );
        self.index_buffers.insert(id, indices.len());
        Ok(IndexBufferHandle(id))
    }

    fn update_vertex_buffer(
        &mut self,
        handle: VertexBufferHandle,
        data: &[u8],
    ) -> Result<(), DriverError> {
        match self.vertex_buffers.get_mut(&handle.0) {
            Some(size) => {
                *size = data.len();
                Ok(())
            }
            None => Err(DriverError::InvalidHandle),
        }
    }

    fn update_index_buffer(
        &mut self,
        handle: IndexBufferHandle,
        indices: &[u32],
    ) -> Result<(), DriverError> {
        match self.index_buffers.get_mut(&handle.0) {
            Some(size) => {
                *size = indices.len();
                Ok(())
            }
            None => Err(DriverError::InvalidHandle),
        }
    }

    fn destroy_vertex_buffer(&mut self, handle: VertexBufferHandle) {
        self.vertex_buffers.remove(&handle.0);
    }

    fn destroy_index_buffer(&mut self, handle: IndexBufferHandle) {
        self.index_buffers.remove(&handle.0);
    }

    fn draw_indexed(
        &mut self,
        _vertices: VertexBufferHandle,
        _indices: IndexBufferHandle,
        range: DrawRange,
    ) {
        self.draws.push(range);
    }
}
