//! Per-(element, material) geometry accumulation and its binary layout.

use std::ops::Range;

use gltf_json as json;
use tracing::warn;

use crate::traversal::Polymesh;

/// Component width used for a block's index accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexWidth {
    U16,
    U32,
}

impl IndexWidth {
    pub fn byte_size(self) -> usize {
        match self {
            IndexWidth::U16 => 2,
            IndexWidth::U32 => 4,
        }
    }

    pub fn component_type(self) -> json::accessor::ComponentType {
        match self {
            IndexWidth::U16 => json::accessor::ComponentType::U16,
            IndexWidth::U32 => json::accessor::ComponentType::U32,
        }
    }
}

/// Byte ranges of one packed block, relative to the block start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    pub indices: Range<usize>,
    pub positions: Range<usize>,
    pub normals: Option<Range<usize>>,
    pub uvs: Option<Range<usize>>,
    pub len: usize,
}

/// Vertex, normal, UV and index arrays for one material of one element.
///
/// Indices are local to this buffer, so a block is self-contained and can be
/// packed or compressed on its own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BinaryAttributeBuffer {
    positions: Vec<f32>,
    normals: Vec<f32>,
    uvs: Vec<f32>,
    indices: Vec<u32>,
    max_index: Option<u32>,
}

impl BinaryAttributeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one polymesh, offsetting its facet indices by the vertices
    /// already in this buffer.
    ///
    /// Normals are taken per point when the polymesh supplies one per point,
    /// otherwise the first normal is repeated for every point. An attribute
    /// stream that a polymesh does not supply stops being emitted for the
    /// whole buffer.
    pub fn append_polymesh(&mut self, mesh: &Polymesh) {
        let base = self.vertex_count();
        let point_count = mesh.points.len();

        for p in &mesh.points {
            self.positions
                .extend_from_slice(&[p[0] as f32, p[1] as f32, p[2] as f32]);
        }

        if self.normals.len() == base * 3 && !mesh.normals.is_empty() {
            if mesh.normals.len() == point_count {
                for n in &mesh.normals {
                    self.normals
                        .extend_from_slice(&[n[0] as f32, n[1] as f32, n[2] as f32]);
                }
            } else {
                let n = mesh.normals[0];
                for _ in 0..point_count {
                    self.normals
                        .extend_from_slice(&[n[0] as f32, n[1] as f32, n[2] as f32]);
                }
            }
        }

        if self.uvs.len() == base * 2 && mesh.uvs.len() == point_count {
            for uv in &mesh.uvs {
                self.uvs.extend_from_slice(&[uv[0] as f32, uv[1] as f32]);
            }
        }

        let Ok(base) = u32::try_from(base) else {
            warn!(
                "buffer holds {base} vertices, dropping {} facets past the u32 index range",
                mesh.facets.len()
            );
            return;
        };
        for facet in &mesh.facets {
            let [Some(a), Some(b), Some(c)] = facet.map(|v| v.checked_add(base)) else {
                warn!("facet {facet:?} overflows the u32 index range at base {base}, skipped");
                continue;
            };
            for index in [a, b, c] {
                self.indices.push(index);
                self.max_index = Some(self.max_index.map_or(index, |m| m.max(index)));
            }
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len() / 3
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn max_index(&self) -> Option<u32> {
        self.max_index
    }

    pub fn has_normals(&self) -> bool {
        !self.normals.is_empty() && self.normals.len() == self.positions.len()
    }

    pub fn has_uvs(&self) -> bool {
        !self.uvs.is_empty() && self.uvs.len() / 2 == self.vertex_count()
    }

    pub fn positions(&self) -> &[f32] {
        &self.positions
    }

    pub fn normals(&self) -> Option<&[f32]> {
        self.has_normals().then_some(self.normals.as_slice())
    }

    pub fn uvs(&self) -> Option<&[f32]> {
        self.has_uvs().then_some(self.uvs.as_slice())
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn index_width(&self) -> IndexWidth {
        match self.max_index {
            Some(m) if m > u16::MAX as u32 => IndexWidth::U32,
            _ => IndexWidth::U16,
        }
    }

    /// Axis-aligned position bounds, as required on POSITION accessors.
    pub fn bounds(&self) -> Option<([f32; 3], [f32; 3])> {
        if self.positions.is_empty() {
            return None;
        }
        let mut min = [f32::MAX; 3];
        let mut max = [f32::MIN; 3];
        for p in self.positions.chunks_exact(3) {
            for i in 0..3 {
                min[i] = f32::min(min[i], p[i]);
                max[i] = f32::max(max[i], p[i]);
            }
        }
        Some((min, max))
    }

    /// Indices first, a 2-byte pad when an odd number of u16 indices would
    /// misalign the floats, then positions, normals and UVs.
    pub fn layout(&self) -> BlockLayout {
        let width = self.index_width();
        let index_bytes = self.indices.len() * width.byte_size();
        let pad = if width == IndexWidth::U16 && self.indices.len() % 2 == 1 {
            2
        } else {
            0
        };
        let vc = self.vertex_count();

        let indices = 0..index_bytes;
        let mut cursor = index_bytes + pad;
        let positions = cursor..cursor + vc * 12;
        cursor = positions.end;
        let normals = self.has_normals().then(|| {
            let r = cursor..cursor + vc * 12;
            cursor = r.end;
            r
        });
        let uvs = self.has_uvs().then(|| {
            let r = cursor..cursor + vc * 8;
            cursor = r.end;
            r
        });

        BlockLayout {
            indices,
            positions,
            normals,
            uvs,
            len: cursor,
        }
    }

    /// Append this block's bytes, laid out as [`BinaryAttributeBuffer::layout`] describes.
    pub fn write_into(&self, out: &mut Vec<u8>) {
        let layout = self.layout();
        out.reserve(layout.len);

        match self.index_width() {
            IndexWidth::U16 => {
                for &i in &self.indices {
                    out.extend_from_slice(&(i as u16).to_le_bytes());
                }
                if self.indices.len() % 2 == 1 {
                    out.extend_from_slice(&[0, 0]);
                }
            }
            IndexWidth::U32 => {
                for &i in &self.indices {
                    out.extend_from_slice(&i.to_le_bytes());
                }
            }
        }

        extend_f32(out, &self.positions);
        if let Some(normals) = self.normals() {
            extend_f32(out, normals);
        }
        if let Some(uvs) = self.uvs() {
            extend_f32(out, uvs);
        }
    }
}

fn extend_f32(out: &mut Vec<u8>, values: &[f32]) {
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

pub(crate) fn pad_to_4(data: &mut Vec<u8>) {
    while data.len() % 4 != 0 {
        data.push(0);
    }
}
