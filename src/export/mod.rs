use std::path::PathBuf;

use thiserror::Error;

pub mod bom;
pub mod buffer;
pub mod builder;
pub mod compress;
pub mod grouping;
pub mod job;
pub mod material;
pub mod scene_tree;
pub mod writer;

pub const GENERATOR: &str = concat!("bimgltf ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("glTF serialization error: {0}")]
    Serialize(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("mesh compression failed: {0}")]
    Compression(String),
    #[error("output extension must be .gltf or .glb: {0}")]
    UnsupportedOutput(PathBuf),
    #[error("binary buffer of {0} bytes exceeds the 4 GiB GLB limit")]
    BufferTooLarge(usize),
}

impl ExportError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ExportError::Io {
            path: path.into(),
            source,
        }
    }
}
