//! The scene-graph visitor that turns traversal callbacks into a glTF asset.
//!
//! Geometry is accumulated per (element, material) in
//! [`BinaryAttributeBuffer`]s and turned into a mesh when the instance or
//! element that owns it closes. Buffer views and accessors are created at that
//! point with their final byte offsets, so `finish` only has to lay the blocks
//! out in the same order.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use gltf_json as json;
use indexmap::IndexMap;
use json::validation::Checked::Valid;
use json::validation::USize64;
use rootcause::Report;
use serde_json::value::RawValue;
use tracing::{debug, info, warn};

use crate::export::bom::HierarchyTree;
use crate::export::buffer::{BinaryAttributeBuffer, pad_to_4};
use crate::export::compress::{MeshCodec, MeshCompressor};
use crate::export::grouping::{
    BimData, FlatGrouping, GroupingStrategy, NodeExtras, PendingNode, add_child,
};
use crate::export::job::ExportJob;
use crate::export::material::{MaterialRegistry, resolve_texture_library};
use crate::export::scene_tree::SceneTree;
use crate::export::writer::{self, AssetSummary, OutputFormat};
use crate::export::{ExportError, GENERATOR};
use crate::models::document::Document;
use crate::models::element::{ElementId, ElementInfo, SymbolId};
use crate::models::transform::Transform;
use crate::traversal::{ExportContext, MaterialNode, Polymesh, RenderNodeAction};

/// Flat grey used when geometry arrives before any material change.
const DEFAULT_MATERIAL: MaterialNode = MaterialNode {
    material_id: None,
    color: [128, 128, 128],
    transparency: 0.0,
};

struct Frame {
    document: Arc<dyn Document>,
    transform: Transform,
}

/// Document/transform scopes opened by links and instances.
///
/// The base frame is never popped, so there is always a current document and
/// cumulative transform.
struct ContextStack {
    frames: Vec<Frame>,
}

impl ContextStack {
    fn new(document: Arc<dyn Document>) -> Self {
        Self {
            frames: vec![Frame {
                document,
                transform: Transform::IDENTITY,
            }],
        }
    }

    fn top(&self) -> &Frame {
        // The base frame is never removed.
        &self.frames[self.frames.len() - 1]
    }

    fn push(&mut self, document: Option<Arc<dyn Document>>, local: &Transform) {
        let top = self.top();
        let frame = Frame {
            document: document.unwrap_or_else(|| Arc::clone(&top.document)),
            transform: top.transform.multiply(local),
        };
        self.frames.push(frame);
    }

    fn pop(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        } else {
            warn!("unbalanced scope end ignored");
        }
    }

    fn reset(&mut self) {
        self.frames.truncate(1);
    }

    fn depth(&self) -> usize {
        self.frames.len() - 1
    }
}

/// Geometry buffered for one material of the current element or instance.
struct MaterialBuffer {
    material: json::Index<json::Material>,
    buffer: BinaryAttributeBuffer,
}

struct ElementScope {
    info: ElementInfo,
    instance_nodes: Vec<json::Index<json::Node>>,
    buffers: IndexMap<String, MaterialBuffer>,
}

/// What a finished export produced.
pub struct ExportArtifacts<G> {
    pub job: ExportJob,
    pub document: json::Root,
    pub output_path: PathBuf,
    /// Sibling binary file, for `.gltf` output with a non-empty buffer.
    pub bin_path: Option<PathBuf>,
    pub bin_len: usize,
    pub scene_tree: SceneTree,
    pub grouping: G,
}

impl<G> ExportArtifacts<G> {
    pub fn summary(&self) -> AssetSummary {
        AssetSummary::of(&self.document, self.bin_len)
    }
}

pub type FlatExporter = SceneGraphBuilder<FlatGrouping>;
pub type StructuredExporter = SceneGraphBuilder<HierarchyTree>;

/// Builds a glTF document from traversal callbacks.
///
/// Node 0 is the scene root carrying the axis conversion. Element nodes are
/// attached wherever the grouping strategy says.
pub struct SceneGraphBuilder<G> {
    job: ExportJob,
    root: json::Root,
    scene_root: json::Index<json::Node>,
    contexts: ContextStack,
    materials: MaterialRegistry,
    grouping: G,
    compressor: Option<MeshCompressor>,
    symbols: HashMap<SymbolId, json::Index<json::Mesh>>,
    element: Option<ElementScope>,
    current_material: Option<String>,
    /// Finalized blocks in byte order (uncompressed output only).
    blocks: Vec<BinaryAttributeBuffer>,
    byte_cursor: usize,
    /// Placeholder views for compressed blocks, in submission order.
    compressed_views: Vec<json::Index<json::buffer::View>>,
    deferred_error: Option<Report<ExportError>>,
}

impl SceneGraphBuilder<FlatGrouping> {
    pub fn flat(job: ExportJob, document: Arc<dyn Document>) -> Self {
        Self::new(job, document, FlatGrouping)
    }
}

impl SceneGraphBuilder<HierarchyTree> {
    pub fn structured(job: ExportJob, document: Arc<dyn Document>) -> Self {
        let tree = HierarchyTree::new(job.file_id, job.options.root_name.clone());
        Self::new(job, document, tree)
    }
}

impl<G: GroupingStrategy> SceneGraphBuilder<G> {
    pub fn new(job: ExportJob, document: Arc<dyn Document>, grouping: G) -> Self {
        let mut root = json::Root::default();
        root.asset = json::Asset {
            version: "2.0".to_string(),
            generator: Some(GENERATOR.to_string()),
            ..Default::default()
        };

        let scene_root = root.push(json::Node {
            name: Some(job.options.root_name.clone()),
            matrix: Some(job.options.root_matrix()),
            children: Some(Vec::new()),
            ..Default::default()
        });
        let scene = root.push(json::Scene {
            nodes: vec![scene_root],
            name: None,
            extensions: Default::default(),
            extras: Default::default(),
        });
        root.scene = Some(scene);

        let materials = MaterialRegistry::new(
            job.options.texture_library.clone().unwrap_or_default(),
            job.options.named_materials,
        );

        Self {
            job,
            root,
            scene_root,
            contexts: ContextStack::new(document),
            materials,
            grouping,
            compressor: None,
            symbols: HashMap::new(),
            element: None,
            current_material: None,
            blocks: Vec::new(),
            byte_cursor: 0,
            compressed_views: Vec::new(),
            deferred_error: None,
        }
    }

    /// Compress every mesh with `codec` instead of writing raw attributes.
    ///
    /// The worker pool is sized by the job's `compression_threads`.
    pub fn with_codec(mut self, codec: Arc<dyn MeshCodec>) -> Result<Self, Report<ExportError>> {
        let compressor = MeshCompressor::new(codec, self.job.options.compression_threads)
            .map_err(|e| Report::new(ExportError::Compression(e.to_string())))?;
        debug!("compressing meshes on {} threads", compressor.threads());
        self.compressor = Some(compressor);
        Ok(self)
    }

    /// The document as built so far.
    pub fn document(&self) -> &json::Root {
        &self.root
    }

    pub fn grouping(&self) -> &G {
        &self.grouping
    }

    pub fn job(&self) -> &ExportJob {
        &self.job
    }

    fn record_error(&mut self, error: Report<ExportError>) {
        if self.deferred_error.is_none() {
            self.deferred_error = Some(error);
        }
    }

    fn extras(&mut self, extras: &NodeExtras) -> Option<Box<RawValue>> {
        match extras.to_raw() {
            Ok(raw) => raw,
            Err(e) => {
                self.record_error(Report::new(ExportError::Serialize(e.to_string())));
                None
            }
        }
    }

    fn bim_extras(&self, info: &ElementInfo) -> NodeExtras {
        NodeExtras {
            bim: Some(BimData::for_element(
                info,
                self.job.options.export_properties,
            )),
            ..Default::default()
        }
    }

    fn push_view(
        &mut self,
        byte_offset: usize,
        byte_length: usize,
        target: Option<json::buffer::Target>,
    ) -> json::Index<json::buffer::View> {
        self.root.push(json::buffer::View {
            buffer: json::Index::new(0),
            byte_length: USize64::from(byte_length),
            byte_offset: Some(USize64::from(byte_offset)),
            byte_stride: None,
            target: target.map(Valid),
            name: None,
            extensions: Default::default(),
            extras: Default::default(),
        })
    }

    fn push_accessor(
        &mut self,
        view: Option<json::Index<json::buffer::View>>,
        count: usize,
        component_type: json::accessor::ComponentType,
        type_: json::accessor::Type,
        bounds: Option<([f32; 3], [f32; 3])>,
    ) -> json::Index<json::Accessor> {
        self.root.push(json::Accessor {
            buffer_view: view,
            byte_offset: view.map(|_| USize64(0)),
            count: USize64::from(count),
            component_type: Valid(json::accessor::GenericComponentType(component_type)),
            type_: Valid(type_),
            min: bounds.map(|(min, _)| json::Value::from(min.to_vec())),
            max: bounds.map(|(_, max)| json::Value::from(max.to_vec())),
            name: None,
            normalized: false,
            sparse: None,
            extensions: Default::default(),
            extras: Default::default(),
        })
    }

    /// Emit accessors (and views, for raw output) for one buffer and return
    /// its primitive.
    fn build_primitive(
        &mut self,
        material: json::Index<json::Material>,
        buffer: BinaryAttributeBuffer,
    ) -> json::mesh::Primitive {
        use json::accessor::{ComponentType, Type};
        use json::buffer::Target;

        let layout = buffer.layout();
        let raw = self.compressor.is_none();
        let base = self.byte_cursor;
        let vertex_count = buffer.vertex_count();

        // --- Indices ---
        let indices = if buffer.index_count() > 0 {
            let view = raw.then(|| {
                self.push_view(
                    base + layout.indices.start,
                    layout.indices.len(),
                    Some(Target::ElementArrayBuffer),
                )
            });
            Some(self.push_accessor(
                view,
                buffer.index_count(),
                buffer.index_width().component_type(),
                Type::Scalar,
                None,
            ))
        } else {
            None
        };

        // --- Positions ---
        let mut attributes = BTreeMap::new();
        let view = raw.then(|| {
            self.push_view(
                base + layout.positions.start,
                layout.positions.len(),
                Some(Target::ArrayBuffer),
            )
        });
        let positions = self.push_accessor(
            view,
            vertex_count,
            ComponentType::F32,
            Type::Vec3,
            buffer.bounds(),
        );
        attributes.insert(Valid(json::mesh::Semantic::Positions), positions);

        // --- Normals ---
        if let Some(range) = &layout.normals {
            let view = raw
                .then(|| self.push_view(base + range.start, range.len(), Some(Target::ArrayBuffer)));
            let normals = self.push_accessor(view, vertex_count, ComponentType::F32, Type::Vec3, None);
            attributes.insert(Valid(json::mesh::Semantic::Normals), normals);
        }

        // --- UVs ---
        if let Some(range) = &layout.uvs {
            let view = raw
                .then(|| self.push_view(base + range.start, range.len(), Some(Target::ArrayBuffer)));
            let uvs = self.push_accessor(view, vertex_count, ComponentType::F32, Type::Vec2, None);
            attributes.insert(Valid(json::mesh::Semantic::TexCoords(0)), uvs);
        }

        let extensions = match self.compressor.as_mut() {
            None => {
                self.byte_cursor += layout.len;
                self.blocks.push(buffer);
                None
            }
            Some(compressor) => {
                // Attribute ids inside the compressed block follow POSITION,
                // NORMAL, TEXCOORD_0 over the attributes present.
                let mut ids = serde_json::Map::new();
                ids.insert("POSITION".into(), 0.into());
                if layout.normals.is_some() {
                    ids.insert("NORMAL".into(), ids.len().into());
                }
                if layout.uvs.is_some() {
                    ids.insert("TEXCOORD_0".into(), ids.len().into());
                }
                let extension_name = compressor.extension_name().to_string();
                compressor.submit(buffer);

                let view = self.push_view(0, 0, None);
                self.compressed_views.push(view);

                let mut others = serde_json::Map::new();
                others.insert(
                    extension_name,
                    serde_json::json!({
                        "bufferView": view.value(),
                        "attributes": ids,
                    }),
                );
                Some(json::extensions::mesh::Primitive {
                    others,
                    ..Default::default()
                })
            }
        };

        json::mesh::Primitive {
            attributes,
            indices,
            material: Some(material),
            mode: Valid(json::mesh::Mode::Triangles),
            targets: None,
            extensions,
            extras: Default::default(),
        }
    }

    /// Turn buffered geometry into a new mesh. Empty buffers produce no
    /// primitive, and no mesh is created if every buffer is empty.
    fn finalize_mesh(
        &mut self,
        name: &str,
        buffers: IndexMap<String, MaterialBuffer>,
    ) -> Option<json::Index<json::Mesh>> {
        let mut primitives = Vec::new();
        for (key, MaterialBuffer { material, buffer }) in buffers {
            if buffer.is_empty() {
                debug!("material {key} produced no geometry");
                continue;
            }
            primitives.push(self.build_primitive(material, buffer));
        }
        if primitives.is_empty() {
            return None;
        }

        Some(self.root.push(json::Mesh {
            primitives,
            weights: None,
            name: Some(name.to_string()),
            extensions: Default::default(),
            extras: Default::default(),
        }))
    }

    fn take_buffers(&mut self) -> IndexMap<String, MaterialBuffer> {
        self.element
            .as_mut()
            .map(|scope| std::mem::take(&mut scope.buffers))
            .unwrap_or_default()
    }

    fn push_mesh_node(
        &mut self,
        name: &str,
        mesh: json::Index<json::Mesh>,
        transform: &Transform,
        extras: Option<&NodeExtras>,
    ) -> json::Index<json::Node> {
        let extras = extras.and_then(|e| self.extras(e));
        self.root.push(json::Node {
            name: Some(name.to_string()),
            mesh: Some(mesh),
            matrix: transform.to_gltf_matrix(),
            extras,
            ..Default::default()
        })
    }

    /// Create an element-level node where the grouping strategy places it.
    fn place_element_node(
        &mut self,
        info: &ElementInfo,
        mesh: Option<json::Index<json::Mesh>>,
        children: Option<Vec<json::Index<json::Node>>>,
    ) -> json::Index<json::Node> {
        let mut pending = PendingNode {
            name: info.name.clone(),
            extras: self.bim_extras(info),
        };
        let parent = self
            .grouping
            .place(&mut self.root, self.scene_root, info, &mut pending);

        let matrix = if mesh.is_some() {
            self.contexts.top().transform.to_gltf_matrix()
        } else {
            None
        };
        let extras = self.extras(&pending.extras);
        let node = self.root.push(json::Node {
            name: Some(pending.name),
            mesh,
            matrix,
            children,
            extras,
            ..Default::default()
        });
        add_child(&mut self.root, parent, node);
        node
    }

    fn finish_inner(mut self) -> Result<ExportArtifacts<G>, Report<ExportError>> {
        if let Some(error) = self.deferred_error.take() {
            return Err(error);
        }
        let output_path = self.job.output_path.clone();
        let format = OutputFormat::from_path(&output_path)
            .ok_or_else(|| Report::new(ExportError::UnsupportedOutput(output_path.clone())))?;

        let mut bin: Vec<u8> = Vec::with_capacity(self.byte_cursor);
        match self.compressor.take() {
            Some(mut compressor) => {
                let blocks = compressor
                    .wait_all()
                    .map_err(|e| Report::new(ExportError::Compression(e.to_string())))?;
                for (view, bytes) in self.compressed_views.iter().zip(blocks) {
                    pad_to_4(&mut bin);
                    let offset = bin.len();
                    bin.extend_from_slice(&bytes);
                    if let Some(entry) = self.root.buffer_views.get_mut(view.value()) {
                        entry.byte_offset = Some(USize64::from(offset));
                        entry.byte_length = USize64::from(bytes.len());
                    }
                }
                if !self.compressed_views.is_empty() {
                    let name = compressor.extension_name().to_string();
                    self.root.extensions_used.push(name.clone());
                    self.root.extensions_required.push(name);
                }
            }
            None => {
                for block in &self.blocks {
                    block.write_into(&mut bin);
                }
                debug_assert_eq!(bin.len(), self.byte_cursor);
            }
        }

        let images = self.materials.embed_images(&mut self.root, &mut bin)?;
        pad_to_4(&mut bin);

        if format == OutputFormat::Glb && u32::try_from(bin.len()).is_err() {
            return Err(Report::new(ExportError::BufferTooLarge(bin.len())));
        }

        if !bin.is_empty() {
            let buffer = self.root.push(json::Buffer {
                byte_length: USize64::from(bin.len()),
                uri: match format {
                    OutputFormat::Gltf => Some(writer::bin_file_name(&output_path)),
                    OutputFormat::Glb => None,
                },
                name: None,
                extensions: Default::default(),
                extras: Default::default(),
            });
            for bv in self.root.buffer_views.iter_mut() {
                bv.buffer = buffer;
            }
        }

        let bin_path = match format {
            OutputFormat::Glb => {
                writer::write_glb_file(&output_path, &self.root, &bin)?;
                None
            }
            OutputFormat::Gltf => writer::write_gltf_pair(&output_path, &self.root, &bin)?,
        };

        let scene_tree = SceneTree::build(&self.root);
        info!(
            "exported {} nodes, {} meshes, {} materials, {images} images, {} bytes of buffer to {}",
            self.root.nodes.len(),
            self.root.meshes.len(),
            self.root.materials.len(),
            bin.len(),
            output_path.display()
        );

        Ok(ExportArtifacts {
            job: self.job,
            document: self.root,
            output_path,
            bin_path,
            bin_len: bin.len(),
            scene_tree,
            grouping: self.grouping,
        })
    }
}

impl<G: GroupingStrategy> ExportContext for SceneGraphBuilder<G> {
    type Output = Result<ExportArtifacts<G>, Report<ExportError>>;

    fn start(&mut self) {
        self.contexts.reset();
        let library = resolve_texture_library(self.job.options.texture_library.as_deref());
        debug!(
            "export of {} started, textures from {}",
            self.contexts.top().document.title(),
            library.display()
        );
        if self.materials.is_empty() {
            self.materials = MaterialRegistry::new(library, self.job.options.named_materials);
        }
    }

    fn on_link_begin(&mut self, document: Arc<dyn Document>, transform: &Transform) -> RenderNodeAction {
        debug!("entering linked document {}", document.title());
        self.contexts.push(Some(document), transform);
        RenderNodeAction::Proceed
    }

    fn on_link_end(&mut self) {
        self.contexts.pop();
    }

    fn on_element_begin(&mut self, id: ElementId) -> RenderNodeAction {
        let info = self
            .contexts
            .top()
            .document
            .element(id)
            .unwrap_or_else(|| {
                debug!("element {id} not found in document");
                ElementInfo::unresolved(id)
            });
        self.element = Some(ElementScope {
            info,
            instance_nodes: Vec::new(),
            buffers: IndexMap::new(),
        });
        self.current_material = None;
        RenderNodeAction::Proceed
    }

    fn on_element_end(&mut self, id: ElementId) {
        let Some(mut scope) = self.element.take() else {
            warn!("element {id} ended without a matching begin");
            return;
        };
        self.current_material = None;
        let buffers = std::mem::take(&mut scope.buffers);
        let info = scope.info;

        if scope.instance_nodes.is_empty() {
            if let Some(mesh) = self.finalize_mesh(&info.name, buffers) {
                self.place_element_node(&info, Some(mesh), None);
            }
            return;
        }

        let mut children = scope.instance_nodes;
        if let Some(mesh) = self.finalize_mesh(&info.name, buffers) {
            let transform = self.contexts.top().transform;
            children.push(self.push_mesh_node(&info.name, mesh, &transform, None));
        }
        self.place_element_node(&info, None, Some(children));
    }

    fn on_instance_begin(&mut self, transform: &Transform, symbol: &SymbolId) -> RenderNodeAction {
        self.contexts.push(None, transform);
        if self.symbols.contains_key(symbol) {
            RenderNodeAction::Skip
        } else {
            RenderNodeAction::Proceed
        }
    }

    fn on_instance_end(&mut self, symbol: &SymbolId) {
        let transform = self.contexts.top().transform;
        let Some(info) = self.element.as_ref().map(|scope| scope.info.clone()) else {
            warn!("instance of {} outside any element", symbol.0);
            self.contexts.pop();
            return;
        };

        // Only nodes reusing a cached symbol mesh carry the element's extras.
        let buffers = self.take_buffers();
        let (mesh, extras) = match self.symbols.get(symbol) {
            Some(&mesh) => {
                if !buffers.is_empty() {
                    debug!("discarding geometry re-sent for cached symbol {}", symbol.0);
                }
                (Some(mesh), Some(self.bim_extras(&info)))
            }
            None => {
                let mesh = self.finalize_mesh(&info.name, buffers);
                if let Some(mesh) = mesh {
                    self.symbols.insert(symbol.clone(), mesh);
                }
                (mesh, None)
            }
        };

        if let Some(mesh) = mesh {
            let node = self.push_mesh_node(&info.name, mesh, &transform, extras.as_ref());
            if let Some(scope) = self.element.as_mut() {
                scope.instance_nodes.push(node);
            }
        }
        self.current_material = None;
        self.contexts.pop();
    }

    fn on_material(&mut self, material: &MaterialNode) {
        if self.element.is_none() {
            warn!("material change outside any element ignored");
            return;
        }
        let document = Arc::clone(&self.contexts.top().document);
        let (key, index) = self
            .materials
            .resolve(&mut self.root, material, document.as_ref());
        if let Some(scope) = self.element.as_mut() {
            scope
                .buffers
                .entry(key.clone())
                .or_insert_with(|| MaterialBuffer {
                    material: index,
                    buffer: BinaryAttributeBuffer::new(),
                });
        }
        self.current_material = Some(key);
    }

    fn on_polymesh(&mut self, mesh: &Polymesh) {
        if self.current_material.is_none() && self.element.is_some() {
            debug!("polymesh before any material, using the default material");
            self.on_material(&DEFAULT_MATERIAL);
        }
        let target = match (&self.current_material, self.element.as_mut()) {
            (Some(key), Some(scope)) => scope.buffers.get_mut(key),
            _ => None,
        };
        match target {
            Some(entry) => entry.buffer.append_polymesh(mesh),
            None => warn!(
                "polymesh with {} points outside any element ignored (depth {})",
                mesh.points.len(),
                self.contexts.depth()
            ),
        }
    }

    fn is_canceled(&self) -> bool {
        self.job.is_canceled()
    }

    fn finish(self) -> Self::Output {
        self.finish_inner()
    }
}
