use thiserror::Error;

#[derive(Error, Debug)]
pub enum MsiError {
    #[error("Access denied: database is read-only")]
    AccessDenied,
    #[error("Invalid parameter")]
    InvalidParameter,
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Invalid field")]
    InvalidField,
    #[error("Invalid table '{0}'")]
    InvalidTable(String),
    #[error("Invalid datatype")]
    InvalidDatatype,
    #[error("Bad query syntax: {0}")]
    BadQuerySyntax(String),
    #[error("Datatype mismatch: {0}")]
    DatatypeMismatch(String),
    #[error("Function failed: {0}")]
    FunctionFailed(String),
    #[error("'{0}' not found")]
    NotFound(String),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("No more items")]
    NoMoreItems,
    #[error("Call not implemented for this view")]
    Unsupported,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, MsiError>;

impl MsiError {
    pub(crate) fn failed(msg: impl Into<String>) -> Self {
        Self::FunctionFailed(msg.into())
    }

    pub(crate) fn syntax(msg: impl Into<String>) -> Self {
        Self::BadQuerySyntax(msg.into())
    }
}
