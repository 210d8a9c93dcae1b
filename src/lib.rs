/// Error definitions
pub mod error;
/// glTF / GLB export of traversed BIM scenes
pub mod export;
/// Element, document and transform types supplied by the host
pub mod models;
/// The callback protocol a host drives during traversal, and replay of recorded traversals.
pub mod traversal;
