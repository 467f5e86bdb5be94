use std::fmt;

use thiserror::Error;

use crate::state_machine::TransitionState;

/// Fatal and operational errors surfaced by a transition.
#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("transition lock is held by {holder}")]
    LockHeld { holder: String },

    #[error("transition lock is owned by {holder}, not by this process")]
    NotOwner { holder: String },

    #[error("failed to release the transition lock: {0}")]
    LockReleaseFailed(ApiError),

    #[error("server version {found} is not supported, need at least {minimum}")]
    UnsupportedVersion { found: String, minimum: String },

    #[error("cannot parse server version: {0}")]
    InvalidVersion(String),

    #[error("node {0} does not exist")]
    NodeNotFound(String),

    #[error("failed to update node {node}: {source}")]
    NodeUpdateFailed { node: String, source: ApiError },

    #[error("step {step} failed on {target}: {source}")]
    ResourceMutationFailed {
        step: String,
        target: String,
        source: ApiError,
    },

    #[error("servant jobs failed on nodes: {}", failed_nodes.join(", "))]
    JobDispatchFailed { failed_nodes: Vec<String> },

    #[error("transition cancelled after {after}")]
    Cancelled { after: TransitionState },

    #[error("control plane error: {0}")]
    Api(#[from] ApiError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Closed classification of control-plane failures.
///
/// Every client call reports one of these, so idempotency decisions never
/// depend on matching error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    NotFound,
    AlreadyExists,
    /// Write rejected because the object changed underneath us.
    Conflict,
    Other,
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiErrorKind::NotFound => write!(f, "not found"),
            ApiErrorKind::AlreadyExists => write!(f, "already exists"),
            ApiErrorKind::Conflict => write!(f, "conflict"),
            ApiErrorKind::Other => write!(f, "request failed"),
        }
    }
}

/// An error returned by a [`ControlPlane`](crate::cluster::ControlPlane) call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::AlreadyExists, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Other, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ApiErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind == ApiErrorKind::AlreadyExists
    }
}
