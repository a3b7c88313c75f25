//! Vertex layout definitions.
//!
//! A [`VertexLayout`] describes the interleaved format of the raw vertex
//! bytes flowing through the preparation pipeline: which attributes exist,
//! their formats and byte offsets, and the overall stride. Layouts are
//! shared via `Arc` since there are typically only a few combinations
//! across many meshes.
//!
//! The layout also provides typed read/write access into raw vertex
//! buffers ([`VertexLayout::read_vec3`] and friends), which is how the
//! weld, attribute derivation and skinning stages touch vertex data.

use std::sync::Arc;

use crate::math::{Vec2, Vec3, Vec4};

/// Semantic meaning of a vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexAttributeSemantic {
    /// Vertex position (float3).
    Position,
    /// Vertex normal (float3).
    Normal,
    /// Vertex binormal / bitangent (float3).
    Binormal,
    /// Vertex tangent (float4, w = handedness).
    Tangent,
    /// Texture coordinates set 0 (float2).
    TexCoord0,
    /// Texture coordinates set 1 (float2).
    TexCoord1,
    /// Vertex color (float4).
    Color,
    /// Palette-local blend indices for skinning (uint4).
    Joints,
    /// Blend weights for skinning (float4).
    Weights,
}

/// Format of a vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexAttributeFormat {
    /// Single 32-bit float.
    Float,
    /// Two 32-bit floats.
    Float2,
    /// Three 32-bit floats.
    Float3,
    /// Four 32-bit floats.
    Float4,
    /// Four 32-bit unsigned integers.
    Uint4,
}

impl VertexAttributeFormat {
    /// Size in bytes of this format.
    pub fn size(&self) -> usize {
        match self {
            Self::Float => 4,
            Self::Float2 => 8,
            Self::Float3 => 12,
            Self::Float4 | Self::Uint4 => 16,
        }
    }

    /// Number of scalar components.
    pub fn component_count(&self) -> usize {
        match self {
            Self::Float => 1,
            Self::Float2 => 2,
            Self::Float3 => 3,
            Self::Float4 | Self::Uint4 => 4,
        }
    }

    /// Whether the components are floats (integer formats are never
    /// tolerance-compared or interpolated).
    pub fn is_float(&self) -> bool {
        !matches!(self, Self::Uint4)
    }
}

/// A single vertex attribute description.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    /// Semantic meaning of this attribute.
    pub semantic: VertexAttributeSemantic,
    /// Data format of this attribute.
    pub format: VertexAttributeFormat,
    /// Byte offset within the vertex.
    pub offset: u32,
}

impl VertexAttribute {
    /// Create a new vertex attribute.
    pub fn new(semantic: VertexAttributeSemantic, format: VertexAttributeFormat, offset: u32) -> Self {
        Self {
            semantic,
            format,
            offset,
        }
    }

    /// Position attribute (float3).
    pub fn position(offset: u32) -> Self {
        Self::new(
            VertexAttributeSemantic::Position,
            VertexAttributeFormat::Float3,
            offset,
        )
    }

    /// Normal attribute (float3).
    pub fn normal(offset: u32) -> Self {
        Self::new(
            VertexAttributeSemantic::Normal,
            VertexAttributeFormat::Float3,
            offset,
        )
    }

    /// Binormal attribute (float3).
    pub fn binormal(offset: u32) -> Self {
        Self::new(
            VertexAttributeSemantic::Binormal,
            VertexAttributeFormat::Float3,
            offset,
        )
    }

    /// Tangent attribute (float4, w = handedness).
    pub fn tangent(offset: u32) -> Self {
        Self::new(
            VertexAttributeSemantic::Tangent,
            VertexAttributeFormat::Float4,
            offset,
        )
    }

    /// Texcoord0 attribute (float2).
    pub fn texcoord0(offset: u32) -> Self {
        Self::new(
            VertexAttributeSemantic::TexCoord0,
            VertexAttributeFormat::Float2,
            offset,
        )
    }

    /// Joints attribute (uint4).
    pub fn joints(offset: u32) -> Self {
        Self::new(
            VertexAttributeSemantic::Joints,
            VertexAttributeFormat::Uint4,
            offset,
        )
    }

    /// Weights attribute (float4).
    pub fn weights(offset: u32) -> Self {
        Self::new(
            VertexAttributeSemantic::Weights,
            VertexAttributeFormat::Float4,
            offset,
        )
    }
}

/// Describes the interleaved layout of vertex data.
///
/// # Example
///
/// ```
/// use meshforge::layout::{VertexAttribute, VertexLayout};
///
/// let layout = VertexLayout::new(32)
///     .with_attribute(VertexAttribute::position(0))
///     .with_attribute(VertexAttribute::normal(12))
///     .with_attribute(VertexAttribute::texcoord0(24));
/// assert!(layout.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    /// Stride in bytes between consecutive vertices.
    pub stride: u32,
    /// The vertex attributes.
    pub attributes: Vec<VertexAttribute>,
    /// Optional label for debugging.
    pub label: Option<String>,
}

impl VertexLayout {
    /// Create a new empty vertex layout with the given stride.
    pub fn new(stride: u32) -> Self {
        Self {
            stride,
            attributes: Vec::new(),
            label: None,
        }
    }

    /// Add a vertex attribute.
    pub fn with_attribute(mut self, attribute: VertexAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Set a debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Check if this layout has a specific semantic.
    pub fn has_semantic(&self, semantic: VertexAttributeSemantic) -> bool {
        self.attributes.iter().any(|attr| attr.semantic == semantic)
    }

    /// Get an attribute by semantic.
    pub fn attribute(&self, semantic: VertexAttributeSemantic) -> Option<&VertexAttribute> {
        self.attributes
            .iter()
            .find(|attr| attr.semantic == semantic)
    }

    /// Byte offset of a semantic within each vertex, if present.
    pub fn offset_of(&self, semantic: VertexAttributeSemantic) -> Option<usize> {
        self.attribute(semantic).map(|attr| attr.offset as usize)
    }

    /// Validate the layout (attributes must fit within the stride and
    /// not collide with each other).
    pub fn validate(&self) -> Result<(), String> {
        for attr in &self.attributes {
            let end = attr.offset as usize + attr.format.size();
            if end > self.stride as usize {
                return Err(format!(
                    "attribute {:?} at offset {} with size {} exceeds stride {}",
                    attr.semantic,
                    attr.offset,
                    attr.format.size(),
                    self.stride
                ));
            }
        }
        for (i, a) in self.attributes.iter().enumerate() {
            for b in self.attributes.iter().skip(i + 1) {
                if a.semantic == b.semantic {
                    return Err(format!("duplicate attribute {:?}", a.semantic));
                }
                let (a0, a1) = (a.offset as usize, a.offset as usize + a.format.size());
                let (b0, b1) = (b.offset as usize, b.offset as usize + b.format.size());
                if a0 < b1 && b0 < a1 {
                    return Err(format!(
                        "attributes {:?} and {:?} overlap",
                        a.semantic, b.semantic
                    ));
                }
            }
        }
        Ok(())
    }

    fn scalar_slice<'a>(
        &self,
        data: &'a [u8],
        vertex: usize,
        semantic: VertexAttributeSemantic,
    ) -> Option<(&'a [u8], usize)> {
        let attr = self.attribute(semantic)?;
        let start = vertex * self.stride as usize + attr.offset as usize;
        let end = start + attr.format.size();
        if end > data.len() {
            return None;
        }
        Some((&data[start..end], attr.format.component_count()))
    }

    /// Read the float components of an attribute into `out`, returning the
    /// number of components read (0 when the attribute is absent).
    pub fn read_floats(
        &self,
        data: &[u8],
        vertex: usize,
        semantic: VertexAttributeSemantic,
        out: &mut [f32; 4],
    ) -> usize {
        let Some((bytes, count)) = self.scalar_slice(data, vertex, semantic) else {
            return 0;
        };
        for (i, slot) in out.iter_mut().enumerate().take(count) {
            *slot = bytemuck::pod_read_unaligned::<f32>(&bytes[i * 4..i * 4 + 4]);
        }
        count
    }

    /// Read a float3 attribute for the given vertex.
    pub fn read_vec3(
        &self,
        data: &[u8],
        vertex: usize,
        semantic: VertexAttributeSemantic,
    ) -> Option<Vec3> {
        let mut out = [0.0f32; 4];
        if self.read_floats(data, vertex, semantic, &mut out) >= 3 {
            Some(Vec3::new(out[0], out[1], out[2]))
        } else {
            None
        }
    }

    /// Read a float2 attribute for the given vertex.
    pub fn read_vec2(
        &self,
        data: &[u8],
        vertex: usize,
        semantic: VertexAttributeSemantic,
    ) -> Option<Vec2> {
        let mut out = [0.0f32; 4];
        if self.read_floats(data, vertex, semantic, &mut out) >= 2 {
            Some(Vec2::new(out[0], out[1]))
        } else {
            None
        }
    }

    /// Read a uint4 attribute for the given vertex.
    pub fn read_uint4(
        &self,
        data: &[u8],
        vertex: usize,
        semantic: VertexAttributeSemantic,
    ) -> Option<[u32; 4]> {
        let (bytes, count) = self.scalar_slice(data, vertex, semantic)?;
        if count < 4 {
            return None;
        }
        let mut out = [0u32; 4];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = bytemuck::pod_read_unaligned::<u32>(&bytes[i * 4..i * 4 + 4]);
        }
        Some(out)
    }

    fn write_scalars(
        &self,
        data: &mut [u8],
        vertex: usize,
        semantic: VertexAttributeSemantic,
        values: &[u8],
    ) -> bool {
        let Some(attr) = self.attribute(semantic) else {
            return false;
        };
        let start = vertex * self.stride as usize + attr.offset as usize;
        let len = attr.format.size().min(values.len());
        if start + len > data.len() {
            return false;
        }
        data[start..start + len].copy_from_slice(&values[..len]);
        true
    }

    /// Write a float3 attribute; returns false when the attribute is absent.
    pub fn write_vec3(
        &self,
        data: &mut [u8],
        vertex: usize,
        semantic: VertexAttributeSemantic,
        value: Vec3,
    ) -> bool {
        let raw: [f32; 3] = [value.x, value.y, value.z];
        self.write_scalars(data, vertex, semantic, bytemuck::cast_slice(&raw))
    }

    /// Write a float4 attribute; returns false when the attribute is absent.
    pub fn write_vec4(
        &self,
        data: &mut [u8],
        vertex: usize,
        semantic: VertexAttributeSemantic,
        value: Vec4,
    ) -> bool {
        let raw: [f32; 4] = [value.x, value.y, value.z, value.w];
        self.write_scalars(data, vertex, semantic, bytemuck::cast_slice(&raw))
    }

    /// Write a uint4 attribute; returns false when the attribute is absent.
    pub fn write_uint4(
        &self,
        data: &mut [u8],
        vertex: usize,
        semantic: VertexAttributeSemantic,
        value: [u32; 4],
    ) -> bool {
        self.write_scalars(data, vertex, semantic, bytemuck::cast_slice(&value))
    }
}

// ============================================================================
// Common Layouts
// ============================================================================

impl VertexLayout {
    /// Position-only layout (12 bytes per vertex).
    pub fn position_only() -> Arc<Self> {
        Arc::new(
            Self::new(12)
                .with_attribute(VertexAttribute::position(0))
                .with_label("position_only"),
        )
    }

    /// Position + texcoord layout (20 bytes per vertex).
    pub fn position_uv() -> Arc<Self> {
        Arc::new(
            Self::new(20)
                .with_attribute(VertexAttribute::position(0))
                .with_attribute(VertexAttribute::texcoord0(12))
                .with_label("position_uv"),
        )
    }

    /// Position + normal + texcoord layout (32 bytes per vertex).
    pub fn position_normal_uv() -> Arc<Self> {
        Arc::new(
            Self::new(32)
                .with_attribute(VertexAttribute::position(0))
                .with_attribute(VertexAttribute::normal(12))
                .with_attribute(VertexAttribute::texcoord0(24))
                .with_label("position_normal_uv"),
        )
    }

    /// Full tangent-space layout: position + normal + tangent + binormal +
    /// texcoord (60 bytes per vertex).
    pub fn tangent_space() -> Arc<Self> {
        Arc::new(
            Self::new(60)
                .with_attribute(VertexAttribute::position(0))
                .with_attribute(VertexAttribute::normal(12))
                .with_attribute(VertexAttribute::tangent(24))
                .with_attribute(VertexAttribute::binormal(40))
                .with_attribute(VertexAttribute::texcoord0(52))
                .with_label("tangent_space"),
        )
    }

    /// Skinned layout: position + normal + texcoord + joints + weights
    /// (64 bytes per vertex).
    pub fn skinned() -> Arc<Self> {
        Arc::new(
            Self::new(64)
                .with_attribute(VertexAttribute::position(0))
                .with_attribute(VertexAttribute::normal(12))
                .with_attribute(VertexAttribute::texcoord0(24))
                .with_attribute(VertexAttribute::joints(32))
                .with_attribute(VertexAttribute::weights(48))
                .with_label("skinned"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_format_size() {
        assert_eq!(VertexAttributeFormat::Float.size(), 4);
        assert_eq!(VertexAttributeFormat::Float3.size(), 12);
        assert_eq!(VertexAttributeFormat::Uint4.size(), 16);
        assert!(!VertexAttributeFormat::Uint4.is_float());
    }

    #[test]
    fn test_layout_lookup() {
        let layout = VertexLayout::position_normal_uv();
        assert!(layout.has_semantic(VertexAttributeSemantic::Normal));
        assert!(!layout.has_semantic(VertexAttributeSemantic::Tangent));
        assert_eq!(layout.offset_of(VertexAttributeSemantic::TexCoord0), Some(24));
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn test_layout_validation_rejects_overflow() {
        let layout = VertexLayout::new(12).with_attribute(VertexAttribute::normal(8));
        assert!(layout.validate().is_err());
    }

    #[test]
    fn test_layout_validation_rejects_overlap() {
        let layout = VertexLayout::new(24)
            .with_attribute(VertexAttribute::position(0))
            .with_attribute(VertexAttribute::normal(8));
        assert!(layout.validate().is_err());
    }

    #[test]
    fn test_read_write_roundtrip() {
        let layout = VertexLayout::position_normal_uv();
        let mut data = vec![0u8; 32 * 2];

        assert!(layout.write_vec3(
            &mut data,
            1,
            VertexAttributeSemantic::Position,
            Vec3::new(1.0, 2.0, 3.0)
        ));
        let read = layout
            .read_vec3(&data, 1, VertexAttributeSemantic::Position)
            .unwrap();
        assert_eq!(read, Vec3::new(1.0, 2.0, 3.0));

        // Vertex 0 was untouched.
        let zero = layout
            .read_vec3(&data, 0, VertexAttributeSemantic::Position)
            .unwrap();
        assert_eq!(zero, Vec3::zeros());

        // Absent semantic reads as None, writes as false.
        assert!(layout
            .read_vec3(&data, 0, VertexAttributeSemantic::Tangent)
            .is_none());
        assert!(!layout.write_vec3(
            &mut data,
            0,
            VertexAttributeSemantic::Tangent,
            Vec3::zeros()
        ));
    }

    #[test]
    fn test_read_uint4() {
        let layout = VertexLayout::skinned();
        let mut data = vec![0u8; 64];
        assert!(layout.write_uint4(&mut data, 0, VertexAttributeSemantic::Joints, [1, 2, 3, 4]));
        assert_eq!(
            layout.read_uint4(&data, 0, VertexAttributeSemantic::Joints),
            Some([1, 2, 3, 4])
        );
    }
}
