use std::fmt;

/// The five core error kinds plus the implementation-defined `IndexError`.
///
/// Every fallible entry point in this crate returns `Result<_, CoreError>`
/// rather than raising through a host-level `throw`; an embedder is expected
/// to translate a returned `CoreError` into its own exception mechanism at
/// the boundary.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("resource error: {0}")]
    ResourceError(String),

    #[error("type error: {0}")]
    TypeError(String),

    #[error("key error: {0}")]
    KeyError(String),

    #[error("format error: {0}")]
    FormatError(String),

    #[error("index error: {0}")]
    IndexError(String),
}

impl CoreError {
    pub fn out_of_memory(what: impl fmt::Display) -> Self {
        CoreError::OutOfMemory(format!("cannot allocate {}, out of memory", what))
    }

    pub fn resource(what: impl fmt::Display) -> Self {
        CoreError::ResourceError(what.to_string())
    }

    pub fn type_error(what: impl fmt::Display) -> Self {
        CoreError::TypeError(what.to_string())
    }

    pub fn key_error(what: impl fmt::Display) -> Self {
        CoreError::KeyError(format!("key {} not in map", what))
    }

    pub fn format_error(what: impl fmt::Display) -> Self {
        CoreError::FormatError(what.to_string())
    }

    pub fn index_error(what: impl fmt::Display) -> Self {
        CoreError::IndexError(what.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
