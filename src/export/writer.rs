//! Serializing a finished document to `.glb` or `.gltf` + `.bin`.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use gltf_json as json;
use rootcause::Report;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::export::ExportError;

pub const GLB_MAGIC: [u8; 4] = *b"glTF";
pub const GLB_VERSION: u32 = 2;
pub const CHUNK_JSON: u32 = 0x4E4F534A;
pub const CHUNK_BIN: u32 = 0x004E4942;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON text plus a sibling `.bin` file.
    Gltf,
    /// Single binary container.
    Glb,
}

impl OutputFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        if ext.eq_ignore_ascii_case("glb") {
            Some(OutputFormat::Glb)
        } else if ext.eq_ignore_ascii_case("gltf") {
            Some(OutputFormat::Gltf)
        } else {
            None
        }
    }
}

/// File name of the binary buffer that accompanies a `.gltf` output.
pub fn bin_file_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "scene".to_string());
    format!("{stem}.bin")
}

/// Write a GLB container: header, JSON chunk padded with spaces, then a BIN
/// chunk padded with zeros (omitted when `bin` is empty).
///
/// The total length and both chunk lengths are written as zero first and
/// patched once the real sizes are known. Returns the number of bytes written.
pub fn write_glb<W: Write + Seek>(writer: &mut W, json: &[u8], bin: &[u8]) -> io::Result<u64> {
    let start = writer.stream_position()?;

    writer.write_all(&GLB_MAGIC)?;
    writer.write_all(&GLB_VERSION.to_le_bytes())?;
    writer.write_all(&0u32.to_le_bytes())?;

    write_chunk(writer, CHUNK_JSON, json, b' ')?;
    if !bin.is_empty() {
        write_chunk(writer, CHUNK_BIN, bin, 0)?;
    }

    let end = writer.stream_position()?;
    let total = length_u32(end - start)?;
    writer.seek(SeekFrom::Start(start + 8))?;
    writer.write_all(&total.to_le_bytes())?;
    writer.seek(SeekFrom::Start(end))?;

    Ok(end - start)
}

fn write_chunk<W: Write + Seek>(
    writer: &mut W,
    chunk_type: u32,
    data: &[u8],
    pad: u8,
) -> io::Result<()> {
    let length_at = writer.stream_position()?;
    writer.write_all(&0u32.to_le_bytes())?;
    writer.write_all(&chunk_type.to_le_bytes())?;
    writer.write_all(data)?;
    let padding = (4 - data.len() % 4) % 4;
    writer.write_all(&[pad; 3][..padding])?;

    let end = writer.stream_position()?;
    let length = length_u32(end - length_at - 8)?;
    writer.seek(SeekFrom::Start(length_at))?;
    writer.write_all(&length.to_le_bytes())?;
    writer.seek(SeekFrom::Start(end))?;
    Ok(())
}

fn length_u32(len: u64) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{len} bytes do not fit a GLB length field"),
        )
    })
}

fn serialize(root: &json::Root) -> Result<String, Report<ExportError>> {
    json::serialize::to_string(root).map_err(|e| Report::new(ExportError::Serialize(e.to_string())))
}

/// Create a temporary file next to `path`.
fn temp_beside(path: &Path) -> Result<NamedTempFile, Report<ExportError>> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    NamedTempFile::new_in(dir).map_err(|e| Report::new(ExportError::io(dir, e)))
}

fn finish_temp(
    mut tmp: NamedTempFile,
    path: &Path,
    write: impl FnOnce(&mut BufWriter<&mut File>) -> io::Result<()>,
) -> Result<NamedTempFile, Report<ExportError>> {
    let result = (|| {
        let mut out = BufWriter::new(tmp.as_file_mut());
        write(&mut out)?;
        out.flush()?;
        drop(out);
        tmp.as_file().sync_all()
    })();
    result.map_err(|e| Report::new(ExportError::io(path, e)))?;
    Ok(tmp)
}

fn persist(tmp: NamedTempFile, path: &Path) -> Result<(), Report<ExportError>> {
    tmp.persist(path)
        .map(|_| ())
        .map_err(|e| Report::new(ExportError::io(path, e.error)))
}

/// Write `root` and `bin` as a single `.glb`. Nothing appears at `path`
/// unless the whole container was written.
pub fn write_glb_file(
    path: &Path,
    root: &json::Root,
    bin: &[u8],
) -> Result<u64, Report<ExportError>> {
    let json_text = serialize(root)?;
    let mut written = 0;
    let tmp = finish_temp(temp_beside(path)?, path, |out| {
        written = write_glb(out, json_text.as_bytes(), bin)?;
        Ok(())
    })?;
    persist(tmp, path)?;
    debug!("wrote {written} bytes to {}", path.display());
    Ok(written)
}

/// Write `root` as UTF-8 JSON at `path` and `bin` as the sibling `.bin`.
/// Both files are fully written before either is moved into place.
pub fn write_gltf_pair(
    path: &Path,
    root: &json::Root,
    bin: &[u8],
) -> Result<Option<PathBuf>, Report<ExportError>> {
    let json_text = serialize(root)?;

    let bin_path = (!bin.is_empty()).then(|| path.with_file_name(bin_file_name(path)));
    let bin_tmp = match &bin_path {
        Some(bin_path) => Some(finish_temp(temp_beside(bin_path)?, bin_path, |out| {
            out.write_all(bin)
        })?),
        None => None,
    };
    let json_tmp = finish_temp(temp_beside(path)?, path, |out| {
        out.write_all(json_text.as_bytes())
    })?;

    if let (Some(tmp), Some(bin_path)) = (bin_tmp, &bin_path) {
        persist(tmp, bin_path)?;
    }
    persist(json_tmp, path)?;
    debug!("wrote {}", path.display());
    Ok(bin_path)
}

/// Counts read back from a written asset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssetSummary {
    pub nodes: usize,
    pub meshes: usize,
    pub primitives: usize,
    pub accessors: usize,
    pub buffer_views: usize,
    pub materials: usize,
    pub images: usize,
    pub bin_len: usize,
}

impl AssetSummary {
    pub fn of(root: &json::Root, bin_len: usize) -> Self {
        AssetSummary {
            nodes: root.nodes.len(),
            meshes: root.meshes.len(),
            primitives: root.meshes.iter().map(|m| m.primitives.len()).sum(),
            accessors: root.accessors.len(),
            buffer_views: root.buffer_views.len(),
            materials: root.materials.len(),
            images: root.images.len(),
            bin_len,
        }
    }
}

/// Parse a `.glb` container back into its JSON document and BIN payload.
pub fn read_glb(bytes: &[u8]) -> Result<(json::Root, Vec<u8>), Report<ExportError>> {
    let glb = gltf::binary::Glb::from_slice(bytes)
        .map_err(|e| Report::new(ExportError::Serialize(e.to_string())))?;
    let root: json::Root = serde_json::from_slice(&glb.json)
        .map_err(|e| Report::new(ExportError::Serialize(e.to_string())))?;
    let bin = glb.bin.map(|b| b.into_owned()).unwrap_or_default();
    Ok((root, bin))
}

/// Summarize a `.glb` or `.gltf` file on disk.
pub fn inspect(path: &Path) -> Result<AssetSummary, Report<ExportError>> {
    let bytes = std::fs::read(path).map_err(|e| Report::new(ExportError::io(path, e)))?;
    if bytes.starts_with(&GLB_MAGIC) {
        let (root, bin) = read_glb(&bytes)?;
        return Ok(AssetSummary::of(&root, bin.len()));
    }

    let root: json::Root = serde_json::from_slice(&bytes)
        .map_err(|e| Report::new(ExportError::Serialize(e.to_string())))?;
    let bin_len = root
        .buffers
        .iter()
        .map(|b| b.byte_length.0 as usize)
        .sum();
    Ok(AssetSummary::of(&root, bin_len))
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;

    fn u32_at(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    }

    #[test]
    fn glb_lengths_are_backpatched() {
        let mut out = Cursor::new(Vec::new());
        let written = write_glb(&mut out, br#"{"a":1}"#, &[1, 2, 3, 4, 5]).unwrap();
        let bytes = out.into_inner();

        assert_eq!(written as usize, bytes.len());
        assert_eq!(&bytes[0..4], b"glTF");
        assert_eq!(u32_at(&bytes, 4), 2);
        assert_eq!(u32_at(&bytes, 8) as usize, bytes.len());

        // JSON: 7 bytes padded to 8 with a space.
        assert_eq!(u32_at(&bytes, 12), 8);
        assert_eq!(u32_at(&bytes, 16), CHUNK_JSON);
        assert_eq!(bytes[27], b' ');

        // BIN: 5 bytes padded to 8 with zeros.
        assert_eq!(u32_at(&bytes, 28), 8);
        assert_eq!(u32_at(&bytes, 32), CHUNK_BIN);
        assert_eq!(&bytes[36..44], &[1, 2, 3, 4, 5, 0, 0, 0]);
        assert_eq!(bytes.len() % 4, 0);
    }

    #[test]
    fn empty_bin_omits_chunk() {
        let mut out = Cursor::new(Vec::new());
        write_glb(&mut out, b"{}", &[]).unwrap();
        let bytes = out.into_inner();
        assert_eq!(bytes.len(), 12 + 8 + 4);
        assert_eq!(u32_at(&bytes, 8), 24);
    }

    #[test]
    fn writing_at_an_offset_patches_relative_lengths() {
        let mut out = Cursor::new(vec![0xAA; 6]);
        out.seek(SeekFrom::End(0)).unwrap();
        let written = write_glb(&mut out, b"{}", &[9; 4]).unwrap();
        let bytes = out.into_inner();
        assert_eq!(u32_at(&bytes, 6 + 8) as u64, written);
        assert_eq!(bytes.len() as u64, 6 + written);
        assert_eq!(written, 12 + 8 + 4 + 8 + 4);
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(OutputFormat::from_path(Path::new("a/b.GLB")), Some(OutputFormat::Glb));
        assert_eq!(OutputFormat::from_path(Path::new("b.gltf")), Some(OutputFormat::Gltf));
        assert_eq!(OutputFormat::from_path(Path::new("b.obj")), None);
        assert_eq!(bin_file_name(Path::new("out/tower.gltf")), "tower.bin");
    }

    #[test]
    fn glb_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.glb");
        let mut root = json::Root::default();
        root.asset.generator = Some("test".into());
        root.push(json::Buffer {
            byte_length: json::validation::USize64::from(8usize),
            uri: None,
            name: None,
            extensions: Default::default(),
            extras: Default::default(),
        });

        let written = write_glb_file(&path, &root, &[0; 8]).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), written);

        let summary = inspect(&path).unwrap();
        assert_eq!(summary.bin_len, 8);
        assert_eq!(summary.nodes, 0);
        // No temporary files left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn gltf_pair_writes_sibling_bin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tower.gltf");
        let root = json::Root::default();
        let bin_path = write_gltf_pair(&path, &root, &[1, 2, 3, 4]).unwrap().unwrap();
        assert_eq!(bin_path, dir.path().join("tower.bin"));
        assert_eq!(std::fs::read(&bin_path).unwrap(), vec![1, 2, 3, 4]);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with('{'));
        assert!(!text.starts_with('\u{feff}'));
    }

    #[test]
    fn failed_write_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-dir").join("out.glb");
        let root = json::Root::default();
        assert!(write_glb_file(&missing, &root, &[]).is_err());
        assert!(!missing.exists());
    }
}
