//! Material deduplication and texture resolution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use gltf_json as json;
use json::validation::Checked::Valid;
use json::validation::USize64;
use rootcause::Report;
use tracing::{debug, warn};

use crate::export::ExportError;
use crate::export::buffer::pad_to_4;
use crate::models::document::Document;
use crate::models::element::MaterialAppearance;
use crate::traversal::MaterialNode;

/// Environment override for the texture library folder.
pub const TEXTURE_LIBRARY_ENV: &str = "BIMGLTF_TEXTURE_LIBRARY";

pub const DEFAULT_TEXTURE_LIBRARY: &str =
    r"C:\Program Files (x86)\Common Files\Autodesk Shared\Materials\Textures";

/// Pick the folder that texture asset paths are relative to.
///
/// An explicitly configured folder wins, then [`TEXTURE_LIBRARY_ENV`], then
/// [`DEFAULT_TEXTURE_LIBRARY`]. Never fails: a folder that does not exist
/// simply means no texture will resolve.
pub fn resolve_texture_library(configured: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }
    match std::env::var_os(TEXTURE_LIBRARY_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => {
            debug!("no texture library configured, using {DEFAULT_TEXTURE_LIBRARY}");
            PathBuf::from(DEFAULT_TEXTURE_LIBRARY)
        }
    }
}

/// Transparency rounded to two decimals, as used in keys and opacity.
fn quantize_transparency(t: f64) -> f64 {
    ((t.clamp(0.0, 1.0) * 100.0).round()) / 100.0
}

/// Key for a material without a usable name: `r{R}g{G}b{B}a{transparency}`.
pub fn color_key(node: &MaterialNode) -> String {
    let [r, g, b] = node.color;
    format!("r{r}g{g}b{b}a{}", quantize_transparency(node.transparency))
}

/// An image whose bytes are embedded when the asset is finished.
#[derive(Debug, Clone)]
struct PendingImage {
    image: json::Index<json::Image>,
    path: PathBuf,
}

/// Deduplicates materials by key and assigns indices in first-seen order.
pub struct MaterialRegistry {
    materials: HashMap<String, json::Index<json::Material>>,
    textures: HashMap<PathBuf, json::Index<json::Texture>>,
    sampler: Option<json::Index<json::texture::Sampler>>,
    pending_images: Vec<PendingImage>,
    texture_library: PathBuf,
    named_materials: bool,
}

impl MaterialRegistry {
    /// `named_materials` selects keying by material name when one is
    /// available; otherwise every material is keyed by its quantized color.
    pub fn new(texture_library: PathBuf, named_materials: bool) -> Self {
        Self {
            materials: HashMap::new(),
            textures: HashMap::new(),
            sampler: None,
            pending_images: Vec::new(),
            texture_library,
            named_materials,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    /// Returns the key and index for `node`, creating the material on first use.
    ///
    /// Appearance lookups that fail degrade to a flat color material.
    pub fn resolve(
        &mut self,
        root: &mut json::Root,
        node: &MaterialNode,
        document: &dyn Document,
    ) -> (String, json::Index<json::Material>) {
        let appearance = if self.named_materials {
            node.material_id.and_then(|id| document.material(id))
        } else {
            None
        };
        let appearance = appearance.filter(|a| !a.name.is_empty());

        let key = match &appearance {
            Some(a) => a.name.clone(),
            None => color_key(node),
        };

        if let Some(&index) = self.materials.get(&key) {
            return (key, index);
        }

        let index = self.create(root, &key, node, appearance.as_ref());
        self.materials.insert(key.clone(), index);
        (key, index)
    }

    fn create(
        &mut self,
        root: &mut json::Root,
        key: &str,
        node: &MaterialNode,
        appearance: Option<&MaterialAppearance>,
    ) -> json::Index<json::Material> {
        let transparency = quantize_transparency(node.transparency);
        let opacity = (1.0 - transparency) as f32;
        let [r, g, b] = node.color;

        let texture = appearance
            .and_then(|a| a.texture.as_deref())
            .and_then(|asset| self.texture_for_asset(root, asset));

        let base_color_factor = if texture.is_some() {
            [1.0, 1.0, 1.0, opacity]
        } else {
            [r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0, opacity]
        };

        let transparent = transparency != 0.0;

        root.push(json::Material {
            name: Some(key.to_string()),
            alpha_mode: Valid(if transparent {
                json::material::AlphaMode::Blend
            } else {
                json::material::AlphaMode::Opaque
            }),
            double_sided: transparent,
            pbr_metallic_roughness: json::material::PbrMetallicRoughness {
                base_color_factor: json::material::PbrBaseColorFactor(base_color_factor),
                base_color_texture: texture,
                metallic_factor: json::material::StrengthFactor(0.0),
                roughness_factor: json::material::StrengthFactor(1.0),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    /// Resolve a texture asset string (`"folder/file.png|..."`) against the
    /// library. Missing files and unsupported formats yield `None`.
    fn texture_for_asset(
        &mut self,
        root: &mut json::Root,
        asset: &str,
    ) -> Option<json::texture::Info> {
        let relative = asset.split('|').next()?.trim();
        if relative.is_empty() {
            return None;
        }
        let mut path = self.texture_library.clone();
        for part in relative.split(['/', '\\']).filter(|p| !p.is_empty()) {
            path.push(part);
        }

        if !path.is_file() {
            debug!("texture {} not found, using flat color", path.display());
            return None;
        }

        if let Some(&index) = self.textures.get(&path) {
            return Some(texture_info(index));
        }

        let mime = match image::ImageFormat::from_path(&path) {
            Ok(format @ (image::ImageFormat::Png | image::ImageFormat::Jpeg)) => {
                format.to_mime_type()
            }
            Ok(format) => {
                debug!("texture {} has unsupported format {format:?}", path.display());
                return None;
            }
            Err(e) => {
                debug!("texture {} has unknown format: {e}", path.display());
                return None;
            }
        };

        let sampler = *self.sampler.get_or_insert_with(|| {
            root.push(json::texture::Sampler {
                mag_filter: Some(Valid(json::texture::MagFilter::Linear)),
                min_filter: Some(Valid(json::texture::MinFilter::LinearMipmapLinear)),
                wrap_s: Valid(json::texture::WrappingMode::Repeat),
                wrap_t: Valid(json::texture::WrappingMode::Repeat),
                name: None,
                extensions: Default::default(),
                extras: Default::default(),
            })
        });

        let image = root.push(json::Image {
            buffer_view: None,
            mime_type: Some(json::image::MimeType(mime.to_string())),
            uri: None,
            name: path.file_stem().map(|s| s.to_string_lossy().into_owned()),
            extensions: Default::default(),
            extras: Default::default(),
        });
        self.pending_images.push(PendingImage {
            image,
            path: path.clone(),
        });

        let texture = root.push(json::Texture {
            source: image,
            sampler: Some(sampler),
            name: None,
            extensions: Default::default(),
            extras: Default::default(),
        });
        self.textures.insert(path, texture);

        Some(texture_info(texture))
    }

    /// Append every referenced image to `bin_data` with its own buffer view.
    ///
    /// Views are created against buffer 0; the caller repoints them once the
    /// buffer exists.
    pub fn embed_images(
        &mut self,
        root: &mut json::Root,
        bin_data: &mut Vec<u8>,
    ) -> Result<usize, Report<ExportError>> {
        let pending = std::mem::take(&mut self.pending_images);
        for PendingImage { image, path } in &pending {
            let bytes = std::fs::read(path).map_err(|e| {
                warn!("texture {} vanished before embedding", path.display());
                Report::new(ExportError::io(path, e))
            })?;

            pad_to_4(bin_data);
            let byte_offset = bin_data.len();
            bin_data.extend_from_slice(&bytes);

            let bv = root.push(json::buffer::View {
                buffer: json::Index::new(0),
                byte_length: USize64::from(bytes.len()),
                byte_offset: Some(USize64::from(byte_offset)),
                byte_stride: None,
                target: None,
                name: None,
                extensions: Default::default(),
                extras: Default::default(),
            });
            if let Some(entry) = root.images.get_mut(image.value()) {
                entry.buffer_view = Some(bv);
            }
        }
        Ok(pending.len())
    }
}

fn texture_info(index: json::Index<json::Texture>) -> json::texture::Info {
    json::texture::Info {
        index,
        tex_coord: 0,
        extensions: None,
        extras: Default::default(),
    }
}
