use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("vocabulary load failed: {0}")]
    VocabularyLoad(String),

    #[error("query timed out: {operation}")]
    QueryTimeout { operation: &'static str },

    #[error("store error during {operation}: {message}")]
    Store {
        operation: &'static str,
        message: String,
    },

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("placeholder count {placeholders} does not match parameter count {params}")]
    ParameterMismatch { placeholders: usize, params: usize },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SearchError {
    pub fn store(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Store {
            operation,
            message: message.into(),
        }
    }

    /// Whether a caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::QueryTimeout { .. } | Self::Store { .. } => true,
            #[cfg(feature = "postgres")]
            Self::Database(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SearchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_and_store_failures_are_retryable() {
        assert!(SearchError::QueryTimeout { operation: "ranked" }.is_retryable());
        assert!(SearchError::store("count", "connection reset").is_retryable());
        assert!(
            !SearchError::ParameterMismatch {
                placeholders: 2,
                params: 1
            }
            .is_retryable()
        );
        assert!(!SearchError::Config("bad".into()).is_retryable());
    }

    #[test]
    fn store_error_names_the_operation() {
        let err = SearchError::store("facet:brand", "pool exhausted");
        assert_eq!(
            err.to_string(),
            "store error during facet:brand: pool exhausted"
        );
    }
}
