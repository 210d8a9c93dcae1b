//! Bill-of-materials grouping: level, category, family, family type.
//!
//! Element nodes are placed under a four-level chain of branch nodes instead
//! of directly under the scene root. Branches are shared between elements
//! with the same labels, while every placed element adds one [`BomRecord`].

use std::collections::HashMap;

use gltf_json as json;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json as json_value};
use tracing::debug;

use crate::export::grouping::{GroupingStrategy, PendingNode, add_child};
use crate::models::element::{ElementInfo, ParameterGroup};

pub const DEFAULT_ROOT_NAME: &str = "All Elements";
pub const NO_LEVEL: &str = "No Level";

const DEPTH: usize = 4;
// Joins label prefixes into map keys; cannot appear in a label split.
const KEY_SEPARATOR: &str = "\u{1f}";

/// One row of the structured export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BomRecord {
    pub file_id: i64,
    /// `level-category-family-familyType`.
    pub name: String,
    pub element_id: i64,
    pub category: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub attributes: Vec<ParameterGroup>,
}

#[derive(Debug)]
struct Group {
    name: String,
    node: json::Index<json::Node>,
    children: Vec<usize>,
    /// Element node names, only populated on family-type groups.
    leaves: Vec<String>,
}

#[derive(Debug)]
pub struct HierarchyTree {
    file_id: i64,
    root_name: String,
    groups: Vec<Group>,
    top_level: Vec<usize>,
    by_prefix: [HashMap<String, usize>; DEPTH],
    records: Vec<BomRecord>,
}

impl HierarchyTree {
    pub fn new(file_id: i64, root_name: impl Into<String>) -> Self {
        Self {
            file_id,
            root_name: root_name.into(),
            groups: Vec::new(),
            top_level: Vec::new(),
            by_prefix: Default::default(),
            records: Vec::new(),
        }
    }

    /// Place `node` for `element` under the branch chain for `parts`, creating
    /// branches (and their glTF nodes) only for prefixes not seen before.
    ///
    /// Returns the family-type branch node, which becomes the element node's
    /// parent.
    pub fn add_node(
        &mut self,
        root: &mut json::Root,
        scene_root: json::Index<json::Node>,
        parts: [&str; DEPTH],
        element: &ElementInfo,
        node: &mut PendingNode,
    ) -> json::Index<json::Node> {
        let mut parent: Option<usize> = None;
        for depth in 0..DEPTH {
            let key = parts[..=depth].join(KEY_SEPARATOR);
            let group = match self.by_prefix[depth].get(&key) {
                Some(&existing) => existing,
                None => {
                    let parent_node = parent.map_or(scene_root, |p| self.groups[p].node);
                    let branch = root.push(json::Node {
                        name: Some(parts[depth].to_string()),
                        children: Some(Vec::new()),
                        ..Default::default()
                    });
                    add_child(root, parent_node, branch);

                    let id = self.groups.len();
                    self.groups.push(Group {
                        name: parts[depth].to_string(),
                        node: branch,
                        children: Vec::new(),
                        leaves: Vec::new(),
                    });
                    match parent {
                        Some(p) => self.groups[p].children.push(id),
                        None => self.top_level.push(id),
                    }
                    self.by_prefix[depth].insert(key, id);
                    debug!("new BOM branch {:?} at depth {depth}", parts[depth]);
                    id
                }
            };
            parent = Some(group);
        }

        let Some(leaf) = parent else {
            return scene_root;
        };
        node.name = format!("{}[{}]", element.family, element.id);
        self.groups[leaf].leaves.push(node.name.clone());

        self.records.push(BomRecord {
            file_id: self.file_id,
            name: parts.iter().join("-"),
            element_id: element.id.0,
            category: element.category.clone(),
            type_name: element.type_name.clone(),
            attributes: element.parameters.clone(),
        });

        self.groups[leaf].node
    }

    pub fn records(&self) -> &[BomRecord] {
        &self.records
    }

    /// Number of branch nodes created so far.
    pub fn branch_count(&self) -> usize {
        self.groups.len()
    }

    fn group_value(&self, id: usize) -> Value {
        let group = &self.groups[id];
        let children: Vec<Value> = if group.children.is_empty() {
            group.leaves.iter().map(|l| Value::String(l.clone())).collect()
        } else {
            group
                .children
                .iter()
                .map(|&child| self.group_value(child))
                .collect()
        };
        json_value!({ "Name": group.name, "Children": children })
    }

    /// `{"root": {"Name": ..., "Children": [...]}}`, depth first.
    pub fn to_value(&self) -> Value {
        let children: Vec<Value> = self
            .top_level
            .iter()
            .map(|&id| self.group_value(id))
            .collect();
        json_value!({ "root": { "Name": self.root_name, "Children": children } })
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_value())
    }
}

impl GroupingStrategy for HierarchyTree {
    fn place(
        &mut self,
        root: &mut json::Root,
        scene_root: json::Index<json::Node>,
        element: &ElementInfo,
        node: &mut PendingNode,
    ) -> json::Index<json::Node> {
        let level = element.level.as_deref().unwrap_or(NO_LEVEL);
        self.add_node(
            root,
            scene_root,
            [level, &element.category, &element.family, &element.type_name],
            element,
            node,
        )
    }
}
