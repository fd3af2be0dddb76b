//! Cluster client errors

use thiserror::Error;

/// Errors that can occur when reading or writing cluster state
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write rejected because the object changed since it was read
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Query against an index that was never registered
    #[error("Index not registered: {0}")]
    IndexNotRegistered(String),

    /// An index with the same field name already exists
    #[error("Index already registered: {0}")]
    IndexConflict(String),

    /// Index registered after the indexer started receiving objects
    #[error("Indexer already started, cannot register index: {0}")]
    IndexAlreadyStarted(String),

    /// Index definition is unusable (e.g. empty field name)
    #[error("Invalid index: {0}")]
    InvalidIndex(String),

    /// The backing cache has not completed its initial list yet
    #[error("Cache not synced: {0}")]
    CacheNotSynced(String),
}

impl ClusterError {
    /// True when the error means the object is gone, either reported by
    /// the store itself or as a 404 from the API server.
    pub fn is_not_found(&self) -> bool {
        match self {
            ClusterError::NotFound(_) => true,
            ClusterError::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(ClusterError::NotFound("node/a".to_string()).is_not_found());
        assert!(!ClusterError::Conflict("node/a".to_string()).is_not_found());
        assert!(!ClusterError::CacheNotSynced("pods".to_string()).is_not_found());
    }
}
