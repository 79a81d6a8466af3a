use std::fmt::Debug;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Store Error: {0}")]
    Store(String),

    #[error("Resource Not Found: {resource_type} with ID {resource_id}")]
    NotFound {
        resource_type: String,
        resource_id: String,
    },

    #[error("Ambiguous Lookup: {resource_type} with ID {resource_id} matched more than one row")]
    Ambiguous {
        resource_type: String,
        resource_id: String,
    },

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Artifact Error: {0}")]
    Artifact(String),

    #[error("Safety Error: {0}")]
    Safety(String),

    #[error("Execution Error: {0}")]
    Execution(String),

    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error means a looked-up row simply was not there,
    /// as opposed to the store misbehaving.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}
