use thiserror::Error;

#[derive(Error, Debug)]
pub enum StrataError {
    #[error("Access denied: {operation} on {model}")]
    AccessDenied { model: String, operation: String },

    #[error("Row security violation on {model}: selection does not satisfy the record rules")]
    RowSecurityViolation { model: String },

    #[error("Concurrency conflict on {model}: records were modified in the meanwhile")]
    ConcurrencyConflict { model: String },

    #[error("Validation failed: {}", .errors.join("; "))]
    ValidationFailed { errors: Vec<String> },

    #[error("The value '{value}' for the field '{field}' is not in the selection")]
    SelectionInvalid { field: String, value: String },

    #[error("Recursion detected in the hierarchy of {model}")]
    RecursionDetected { model: String },

    #[error("Field '{field}' does not exist on model '{model}'")]
    UnknownField { model: String, field: String },

    #[error("Record not found: {model}/{id}")]
    NotFound { model: String, id: i64 },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, StrataError>;
