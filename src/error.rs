use thiserror::Error;

/// Errors raised while loading or replaying a recorded traversal.
#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("Error serializing or deserializing json: {err}")]
    SerdeJson {
        #[from]
        err: serde_json::Error,
    },
    #[error("Traversal references unknown document: {name}")]
    UnknownDocument { name: String },
    #[error("Traversal dump has no main document named {name}")]
    MissingMainDocument { name: String },
}
