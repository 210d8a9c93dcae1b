//! A presentation tree of the finished node graph.
//!
//! Each visited node gets a fresh UUID; the ids are not related to glTF node
//! indices and differ between runs.

use std::collections::HashSet;

use gltf_json as json;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneTreeNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "nodeId")]
    pub node_id: Uuid,
    #[serde(rename = "Children", default)]
    pub children: Vec<SceneTreeNode>,
}

impl SceneTreeNode {
    /// Number of nodes in this subtree, including itself.
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(SceneTreeNode::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SceneTree {
    pub roots: Vec<SceneTreeNode>,
}

impl SceneTree {
    /// Walk every scene's root nodes. Out-of-range child indices are skipped,
    /// as is any child already on the current path.
    pub fn build(root: &json::Root) -> Self {
        let mut roots = Vec::new();
        let mut path = HashSet::new();
        for scene in &root.scenes {
            for &index in &scene.nodes {
                if let Some(node) = visit(root, index, &mut path) {
                    roots.push(node);
                }
            }
        }
        SceneTree { roots }
    }

    pub fn node_count(&self) -> usize {
        self.roots.iter().map(SceneTreeNode::len).sum()
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn visit(
    root: &json::Root,
    index: json::Index<json::Node>,
    path: &mut HashSet<usize>,
) -> Option<SceneTreeNode> {
    let i = index.value();
    let Some(node) = root.nodes.get(i) else {
        warn!("scene tree skipping missing node {i}");
        return None;
    };
    if !path.insert(i) {
        warn!("scene tree skipping cyclic reference to node {i}");
        return None;
    }

    let children = node
        .children
        .iter()
        .flatten()
        .filter_map(|&child| visit(root, child, path))
        .collect();
    path.remove(&i);

    Some(SceneTreeNode {
        name: node.name.clone(),
        node_id: Uuid::new_v4(),
        children,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn node(name: &str, children: &[u32]) -> json::Node {
        json::Node {
            name: Some(name.to_string()),
            children: (!children.is_empty())
                .then(|| children.iter().map(|&c| json::Index::new(c)).collect()),
            ..Default::default()
        }
    }

    fn scene(nodes: &[u32]) -> json::Scene {
        json::Scene {
            nodes: nodes.iter().map(|&n| json::Index::new(n)).collect(),
            name: None,
            extensions: Default::default(),
            extras: Default::default(),
        }
    }

    #[test]
    fn mirrors_hierarchy_with_fresh_ids() {
        let mut root = json::Root::default();
        root.nodes = vec![node("root", &[1, 2]), node("a", &[3]), node("b", &[]), node("c", &[])];
        root.scenes = vec![scene(&[0])];

        let tree = SceneTree::build(&root);
        assert_eq!(tree.roots.len(), 1);
        assert_eq!(tree.node_count(), 4);
        let r = &tree.roots[0];
        assert_eq!(r.children[0].name.as_deref(), Some("a"));
        assert_eq!(r.children[0].children[0].name.as_deref(), Some("c"));
        assert_ne!(r.node_id, r.children[0].node_id);

        let again = SceneTree::build(&root);
        assert_ne!(again.roots[0].node_id, r.node_id);
        // Building never touches the document.
        assert_eq!(root.nodes.len(), 4);
    }

    #[test]
    fn missing_and_cyclic_references_are_skipped() {
        let mut root = json::Root::default();
        root.nodes = vec![node("root", &[1, 9]), node("loop", &[0])];
        root.scenes = vec![scene(&[0, 7])];

        let tree = SceneTree::build(&root);
        assert_eq!(tree.roots.len(), 1);
        assert_eq!(tree.node_count(), 2);
    }

    #[test]
    fn json_uses_host_field_names() {
        let mut root = json::Root::default();
        root.nodes = vec![node("root", &[])];
        root.scenes = vec![scene(&[0])];
        let text = SceneTree::build(&root).to_json_pretty().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value[0]["name"], "root");
        assert!(value[0]["nodeId"].as_str().unwrap().len() == 36);
        assert!(value[0]["Children"].as_array().unwrap().is_empty());
    }
}
