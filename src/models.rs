/// Source document boundary: element and material lookups supplied by the host.
pub mod document;
/// Element metadata carried into node extras and the BOM tree.
pub mod element;
/// Cumulative placement transforms.
pub mod transform;
