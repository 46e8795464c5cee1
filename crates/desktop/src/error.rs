use thiserror::Error;

use tillsync_core::DomainError;

use crate::cache::StoreError;

/// Failure of a sync engine operation.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("client is offline")]
    Offline,
    #[error("network error: {0}")]
    Network(String),
    #[error("API error ({0}): {1}")]
    Api(u16, String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("server rejected the request: {0}")]
    Rejected(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("{0} sync is already running")]
    Busy(&'static str),
}

impl SyncError {
    /// Whether another delivery attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Api(..) | SyncError::Parse(_) | SyncError::Rejected(_)
        )
    }
}

impl From<DomainError> for SyncError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Parse(msg) => SyncError::Parse(msg),
            DomainError::InvalidId(msg) => SyncError::Validation(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_app_failures_are_retryable() {
        assert!(SyncError::Network("reset".into()).is_retryable());
        assert!(SyncError::Api(502, "bad gateway".into()).is_retryable());
        assert!(SyncError::Rejected("try later".into()).is_retryable());
        assert!(!SyncError::Validation("id mismatch".into()).is_retryable());
        assert!(!SyncError::Busy("invoice").is_retryable());
        assert!(!SyncError::Offline.is_retryable());
    }

    #[test]
    fn domain_errors_map_onto_the_taxonomy() {
        assert!(matches!(
            SyncError::from(DomainError::invalid_id("uniqueID: empty")),
            SyncError::Validation(_)
        ));
        assert!(matches!(SyncError::from(DomainError::parse("bad")), SyncError::Parse(_)));
    }
}
