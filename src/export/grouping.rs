//! Where element nodes are attached in the scene graph.

use gltf_json as json;
use serde::Serialize;
use serde_json::value::RawValue;

use crate::models::element::{ElementInfo, ParameterGroup};

/// `extras.BIM` on element-level nodes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BimData {
    #[serde(rename = "elementID")]
    pub element_id: i64,
    #[serde(rename = "uniqueId")]
    pub unique_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Vec<ParameterGroup>>,
}

impl BimData {
    pub fn for_element(element: &ElementInfo, with_parameters: bool) -> Self {
        BimData {
            element_id: element.id.0,
            unique_id: element.unique_id.clone(),
            parameters: with_parameters.then(|| element.parameters.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeExtras {
    #[serde(rename = "BIM", skip_serializing_if = "Option::is_none")]
    pub bim: Option<BimData>,
    #[serde(rename = "Category", skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(rename = "TypeFamily", skip_serializing_if = "Option::is_none")]
    pub type_family: Option<String>,
    #[serde(rename = "TypeName", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
}

impl NodeExtras {
    pub fn is_empty(&self) -> bool {
        self.bim.is_none()
            && self.category.is_none()
            && self.type_family.is_none()
            && self.type_name.is_none()
    }

    pub fn to_raw(&self) -> Result<Option<Box<RawValue>>, serde_json::Error> {
        if self.is_empty() {
            return Ok(None);
        }
        serde_json::value::to_raw_value(self).map(Some)
    }
}

/// An element-level node before it is pushed into the document.
#[derive(Debug, Clone, Default)]
pub struct PendingNode {
    pub name: String,
    pub extras: NodeExtras,
}

/// Decides the parent of each element-level node.
///
/// Called once per element node (a standalone element mesh, or the wrapper
/// around an element's instances) before that node is pushed. A strategy may
/// create intermediate nodes, rename the pending node and add extras.
pub trait GroupingStrategy {
    fn place(
        &mut self,
        root: &mut json::Root,
        scene_root: json::Index<json::Node>,
        element: &ElementInfo,
        node: &mut PendingNode,
    ) -> json::Index<json::Node>;
}

/// Every element hangs directly off the scene root and carries its category
/// and type labels as extras.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatGrouping;

impl GroupingStrategy for FlatGrouping {
    fn place(
        &mut self,
        _root: &mut json::Root,
        scene_root: json::Index<json::Node>,
        element: &ElementInfo,
        node: &mut PendingNode,
    ) -> json::Index<json::Node> {
        node.extras.category = Some(element.category.clone());
        node.extras.type_family = Some(element.family.clone());
        node.extras.type_name = Some(element.type_name.clone());
        scene_root
    }
}

/// Attach `child` to `parent`'s children list.
pub(crate) fn add_child(
    root: &mut json::Root,
    parent: json::Index<json::Node>,
    child: json::Index<json::Node>,
) {
    if let Some(node) = root.nodes.get_mut(parent.value()) {
        node.children.get_or_insert_with(Vec::new).push(child);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::element::{ElementId, Parameter};

    fn element() -> ElementInfo {
        ElementInfo {
            id: ElementId(42),
            unique_id: "abc-42".into(),
            name: "Basic Wall".into(),
            category: "Walls".into(),
            family: "Basic Wall".into(),
            type_name: "Generic 200mm".into(),
            level: Some("Level 1".into()),
            parameters: vec![ParameterGroup {
                group: "Dimensions".into(),
                parameters: vec![Parameter {
                    name: "Length".into(),
                    value: "4000".into(),
                }],
            }],
        }
    }

    #[test]
    fn extras_serialize_with_host_field_names() {
        let extras = NodeExtras {
            bim: Some(BimData::for_element(&element(), false)),
            ..Default::default()
        };
        let raw = extras.to_raw().unwrap().unwrap();
        assert_eq!(raw.get(), r#"{"BIM":{"elementID":42,"uniqueId":"abc-42"}}"#);

        let with_params = BimData::for_element(&element(), true);
        let value = serde_json::to_value(&with_params).unwrap();
        assert_eq!(value["parameters"][0]["parameters"][0]["value"], "4000");
    }

    #[test]
    fn empty_extras_are_omitted() {
        assert!(NodeExtras::default().to_raw().unwrap().is_none());
    }

    #[test]
    fn flat_grouping_targets_scene_root() {
        let mut root = json::Root::default();
        let scene_root = root.push(json::Node::default());
        let mut pending = PendingNode::default();
        let parent = FlatGrouping.place(&mut root, scene_root, &element(), &mut pending);
        assert_eq!(parent, scene_root);
        assert_eq!(pending.extras.category.as_deref(), Some("Walls"));
        assert_eq!(pending.extras.type_name.as_deref(), Some("Generic 200mm"));
        assert_eq!(root.nodes.len(), 1);
    }
}
