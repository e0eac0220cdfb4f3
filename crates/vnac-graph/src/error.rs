//! Error types for graph loading.

/// Errors that can occur when loading or validating a graph description.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// The JSON document could not be deserialized.
    #[error("malformed graph description: {0}")]
    Parse(#[from] serde_json::Error),

    /// An operation record is missing a required field.
    #[error("operation '{op}' is missing required field '{field}'")]
    MissingField { op: String, field: String },

    /// A field is present but has the wrong type or shape.
    #[error("operation '{op}' has a malformed field '{field}'")]
    BadField { op: String, field: String },

    /// A tensor is referenced without a matching declaration.
    #[error("'{op}' references undeclared tensor '{name}'")]
    UnknownTensor { op: String, name: String },
}
