//! The host document boundary.
//!
//! The exporter never walks the BIM object model itself. Whatever drives the
//! traversal hands it a [`Document`] per (possibly linked) source file, and
//! the exporter only asks it for element metadata and material appearance.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::element::{ElementId, ElementInfo, MaterialAppearance, MaterialId};

pub trait Document: Send + Sync {
    /// Human-readable title, used in logs.
    fn title(&self) -> &str;

    fn element(&self, id: ElementId) -> Option<ElementInfo>;

    fn material(&self, id: MaterialId) -> Option<MaterialAppearance>;
}

/// A fully materialized document, typically deserialized from a traversal dump.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryDocument {
    pub title: String,
    #[serde(default)]
    pub elements: Vec<ElementInfo>,
    #[serde(default)]
    pub materials: HashMap<i64, MaterialAppearance>,
    #[serde(skip)]
    element_lookup: HashMap<ElementId, usize>,
}

impl InMemoryDocument {
    pub fn new(title: impl Into<String>) -> Self {
        InMemoryDocument {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_element(mut self, element: ElementInfo) -> Self {
        self.element_lookup.insert(element.id, self.elements.len());
        self.elements.push(element);
        self
    }

    pub fn with_material(mut self, id: MaterialId, appearance: MaterialAppearance) -> Self {
        self.materials.insert(id.0, appearance);
        self
    }

    /// Rebuilds the id index after deserialization.
    pub fn index(mut self) -> Self {
        self.element_lookup = self
            .elements
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id, i))
            .collect();
        self
    }
}

impl Document for InMemoryDocument {
    fn title(&self) -> &str {
        &self.title
    }

    fn element(&self, id: ElementId) -> Option<ElementInfo> {
        self.element_lookup
            .get(&id)
            .and_then(|&i| self.elements.get(i))
            .cloned()
    }

    fn material(&self, id: MaterialId) -> Option<MaterialAppearance> {
        self.materials.get(&id.0).cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_after_deserialize() {
        let doc: InMemoryDocument = serde_json::from_str(
            r#"{"title":"Tower","elements":[{"id":7,"name":"Wall","category":"Walls"}],
                "materials":{"3":{"name":"Brick"}}}"#,
        )
        .unwrap();
        assert!(doc.element(ElementId(7)).is_none());
        let doc = doc.index();
        assert_eq!(doc.element(ElementId(7)).unwrap().category, "Walls");
        assert_eq!(doc.material(MaterialId(3)).unwrap().name, "Brick");
        assert!(doc.material(MaterialId(4)).is_none());
    }
}
