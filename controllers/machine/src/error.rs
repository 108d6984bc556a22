//! Controller-specific error types.
//!
//! Reconcilers never panic: every failure becomes a `ControllerError` and
//! the worker re-enqueues the key with back-off. Helper predicates classify
//! the soft apiserver errors (NotFound, Conflict, AlreadyExists) that the
//! idempotent write paths swallow.

use kube::Error as KubeError;
use qmp_client::QmpError;
use storage_client::StorageError;
use thiserror::Error;

/// Errors that can occur while reconciling.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Block-storage API error
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// QMP monitor error (migration driver sub-mode)
    #[error("monitor error: {0}")]
    Qmp(#[from] QmpError),

    /// The referenced machine image is not Ready yet
    #[error("machine image {0} not ready: {1}")]
    ImageNotReady(String, String),

    /// A referenced credential does not exist
    #[error("credential not found: {0}")]
    CredentialNotFound(String),

    /// A referenced record does not exist
    #[error("record not found: {0}")]
    RecordNotFound(String),

    /// The backup URL did not carry the expected query parameters
    #[error("invalid backup URL: {0}")]
    InvalidBackupUrl(String),

    /// The migration target pod has no migrate_port annotation
    #[error("missing migrate_port annotation on migration pod for machine {0}")]
    MissingMigratePort(String),

    /// Live migration only starts from Running or Migrating
    #[error("migration not possible for machine {0} in state {1}")]
    MigrationUnavailable(String, String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// The apiserver reported 404 for the referenced object.
pub fn is_not_found(err: &KubeError) -> bool {
    matches!(err, KubeError::Api(ae) if ae.code == 404)
}

/// Optimistic-concurrency conflict; the write loses and the key requeues.
pub fn is_conflict(err: &KubeError) -> bool {
    matches!(err, KubeError::Api(ae) if ae.code == 409 && ae.reason == "Conflict")
}

/// A duplicate create raced with the cache; treated as success.
pub fn is_already_exists(err: &KubeError) -> bool {
    matches!(err, KubeError::Api(ae) if ae.reason == "AlreadyExists")
}
