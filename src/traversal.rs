//! The traversal protocol between a geometry walker and an exporter.
//!
//! A host walks its model and invokes an [`ExportContext`] in strictly nested
//! order. Traversals can also be recorded as a [`SceneDump`] and fed back
//! through [`replay`], which is how the CLI and the integration tests drive
//! the exporter without a host application.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use rootcause::Report;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ErrorKind;
use crate::models::document::{Document, InMemoryDocument};
use crate::models::element::{ElementId, MaterialId, SymbolId};
use crate::models::transform::Transform;

/// Answer from a `*_begin` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderNodeAction {
    Proceed,
    /// Do not deliver the scope's contents. The matching `*_end` is still delivered.
    Skip,
}

/// Material change for the geometry that follows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialNode {
    /// Named material, if the face has one.
    #[serde(default)]
    pub material_id: Option<MaterialId>,
    /// Display color, 0-255 per channel.
    pub color: [u8; 3],
    /// 0.0 is fully opaque.
    #[serde(default)]
    pub transparency: f64,
}

/// A tessellated face: points, optional per-point attributes and triangles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Polymesh {
    pub points: Vec<[f64; 3]>,
    #[serde(default)]
    pub normals: Vec<[f64; 3]>,
    #[serde(default)]
    pub uvs: Vec<[f64; 2]>,
    pub facets: Vec<[u32; 3]>,
}

/// Visitor driven by a scene traversal.
///
/// Calls arrive single-threaded and strictly nested:
/// `start`, then views containing elements containing instances containing
/// material changes and polymeshes, with links wrapping nested documents.
/// `finish` consumes the context once traversal is over.
pub trait ExportContext {
    type Output;

    fn start(&mut self);

    fn on_view_begin(&mut self, _name: Option<&str>) -> RenderNodeAction {
        RenderNodeAction::Proceed
    }

    fn on_view_end(&mut self) {}

    fn on_link_begin(&mut self, document: Arc<dyn Document>, transform: &Transform)
    -> RenderNodeAction;

    fn on_link_end(&mut self);

    fn on_element_begin(&mut self, id: ElementId) -> RenderNodeAction;

    fn on_element_end(&mut self, id: ElementId);

    fn on_instance_begin(&mut self, transform: &Transform, symbol: &SymbolId)
    -> RenderNodeAction;

    fn on_instance_end(&mut self, symbol: &SymbolId);

    fn on_material(&mut self, material: &MaterialNode);

    fn on_polymesh(&mut self, mesh: &Polymesh);

    /// Polled by the driver between callbacks.
    fn is_canceled(&self) -> bool {
        false
    }

    fn finish(self) -> Self::Output
    where
        Self: Sized;
}

/// One recorded traversal callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraversalEvent {
    ViewBegin {
        #[serde(default)]
        name: Option<String>,
    },
    ViewEnd,
    LinkBegin {
        document: String,
        #[serde(default)]
        transform: Transform,
    },
    LinkEnd,
    ElementBegin {
        id: ElementId,
    },
    ElementEnd {
        id: ElementId,
    },
    InstanceBegin {
        symbol: SymbolId,
        #[serde(default)]
        transform: Transform,
    },
    InstanceEnd {
        symbol: SymbolId,
    },
    Material(MaterialNode),
    Polymesh(Polymesh),
}

impl TraversalEvent {
    fn depth_delta(&self) -> i32 {
        match self {
            TraversalEvent::ViewBegin { .. }
            | TraversalEvent::LinkBegin { .. }
            | TraversalEvent::ElementBegin { .. }
            | TraversalEvent::InstanceBegin { .. } => 1,
            TraversalEvent::ViewEnd
            | TraversalEvent::LinkEnd
            | TraversalEvent::ElementEnd { .. }
            | TraversalEvent::InstanceEnd { .. } => -1,
            TraversalEvent::Material(_) | TraversalEvent::Polymesh(_) => 0,
        }
    }
}

/// A recorded traversal plus the documents it references.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneDump {
    /// Key of the host document in `documents`.
    pub main: String,
    pub documents: BTreeMap<String, InMemoryDocument>,
    pub events: Vec<TraversalEvent>,
}

/// A loaded dump, with documents shared behind `Arc<dyn Document>`.
pub struct LoadedScene {
    pub main: Arc<dyn Document>,
    pub documents: BTreeMap<String, Arc<dyn Document>>,
    pub events: Vec<TraversalEvent>,
}

impl SceneDump {
    pub fn from_reader(reader: impl Read) -> Result<Self, Report<ErrorKind>> {
        serde_json::from_reader(reader).map_err(|err| Report::new(ErrorKind::from(err)))
    }

    pub fn load(self) -> Result<LoadedScene, Report<ErrorKind>> {
        let documents: BTreeMap<String, Arc<dyn Document>> = self
            .documents
            .into_iter()
            .map(|(key, doc)| (key, Arc::new(doc.index()) as Arc<dyn Document>))
            .collect();
        let main = documents
            .get(&self.main)
            .cloned()
            .ok_or_else(|| Report::new(ErrorKind::MissingMainDocument { name: self.main }))?;

        Ok(LoadedScene {
            main,
            documents,
            events: self.events,
        })
    }
}

/// What happened during a [`replay`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub delivered: usize,
    pub skipped: usize,
    pub canceled: bool,
}

/// Drive `ctx` with recorded events.
///
/// `start` is called first. When a `*_begin` callback answers
/// [`RenderNodeAction::Skip`], every event up to the matching end is dropped
/// and only the end itself is delivered. Replay stops early if the context
/// reports cancellation. `finish` is left to the caller.
pub fn replay<C: ExportContext>(
    ctx: &mut C,
    scene: &LoadedScene,
) -> Result<ReplayStats, Report<ErrorKind>> {
    let mut stats = ReplayStats::default();
    let mut depth: i32 = 0;
    let mut skip_depth: Option<i32> = None;

    ctx.start();

    for event in &scene.events {
        if ctx.is_canceled() {
            debug!("traversal canceled after {} events", stats.delivered);
            stats.canceled = true;
            break;
        }

        let delta = event.depth_delta();
        if let Some(target) = skip_depth {
            if delta < 0 && depth == target {
                skip_depth = None;
            } else {
                depth += delta;
                stats.skipped += 1;
                continue;
            }
        }

        let action = match event {
            TraversalEvent::ViewBegin { name } => ctx.on_view_begin(name.as_deref()),
            TraversalEvent::ViewEnd => {
                ctx.on_view_end();
                RenderNodeAction::Proceed
            }
            TraversalEvent::LinkBegin {
                document,
                transform,
            } => {
                let doc = scene.documents.get(document).cloned().ok_or_else(|| {
                    Report::new(ErrorKind::UnknownDocument {
                        name: document.clone(),
                    })
                })?;
                ctx.on_link_begin(doc, transform)
            }
            TraversalEvent::LinkEnd => {
                ctx.on_link_end();
                RenderNodeAction::Proceed
            }
            TraversalEvent::ElementBegin { id } => ctx.on_element_begin(*id),
            TraversalEvent::ElementEnd { id } => {
                ctx.on_element_end(*id);
                RenderNodeAction::Proceed
            }
            TraversalEvent::InstanceBegin { symbol, transform } => {
                ctx.on_instance_begin(transform, symbol)
            }
            TraversalEvent::InstanceEnd { symbol } => {
                ctx.on_instance_end(symbol);
                RenderNodeAction::Proceed
            }
            TraversalEvent::Material(material) => {
                ctx.on_material(material);
                RenderNodeAction::Proceed
            }
            TraversalEvent::Polymesh(mesh) => {
                ctx.on_polymesh(mesh);
                RenderNodeAction::Proceed
            }
        };
        stats.delivered += 1;
        depth += delta;

        if action == RenderNodeAction::Skip {
            skip_depth = Some(depth);
        }
    }

    Ok(stats)
}
