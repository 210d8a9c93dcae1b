use serde::{Deserialize, Serialize};

/// Integer id of an element inside its source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub i64);

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Integer id of a material inside its source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaterialId(pub i64);

/// Stable identity of a reusable family-type geometry definition.
///
/// Instances that share a symbol share one glTF mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolId(pub String);

impl SymbolId {
    pub fn new(id: impl Into<String>) -> Self {
        SymbolId(id.into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

/// A named group of element parameters, e.g. "Dimensions" or "Identity Data".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterGroup {
    pub group: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

/// Everything the exporter needs to know about one element.
///
/// The grouping labels (`level`, `category`, `family`, `type_name`) are opaque
/// strings supplied by the host; the exporter never interprets them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementInfo {
    pub id: ElementId,
    #[serde(default)]
    pub unique_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub type_name: String,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterGroup>,
}

impl Default for ElementId {
    fn default() -> Self {
        ElementId(-1)
    }
}

impl ElementInfo {
    /// Placeholder used when the host cannot resolve an element id.
    pub fn unresolved(id: ElementId) -> Self {
        ElementInfo {
            id,
            name: id.to_string(),
            ..Default::default()
        }
    }
}

/// Appearance data for a named material.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaterialAppearance {
    pub name: String,
    /// Raw texture asset string; the first `|`-separated segment is a path
    /// relative to the texture library.
    #[serde(default)]
    pub texture: Option<String>,
}
