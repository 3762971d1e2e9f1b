//! Error types for the kpve provider
//!
//! Errors are structured with fields so the outer reconcilers can decide
//! between idempotent success (NotFound), requeue (Infrastructure), and
//! surfacing a configuration problem in status (Configuration, Validation).

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for kpve operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A VM, template, region or storage does not exist
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Kind of the missing object (e.g., "vm", "template", "region")
        kind: String,
        /// Identifier of the missing object
        name: String,
    },

    /// Candidate search was exhausted without a successful launch
    #[error("insufficient capacity: {}", attempts.join("; "))]
    InsufficientCapacity {
        /// One entry per attempted (instance type, region, zone) candidate
        attempts: Vec<String>,
    },

    /// Remote API, async task, or lock-wait failure
    #[error("infrastructure error [{context}]: {message}")]
    Infrastructure {
        /// Operation that failed (e.g., "clone", "wait-task", "next-id")
        context: String,
        /// Description of what failed
        message: String,
        /// Whether the outer reconciler should requeue
        retryable: bool,
    },

    /// Configuration hazard that must be fixed by the user
    #[error("configuration error for {resource}: {message}")]
    Configuration {
        /// Resource with the bad configuration
        resource: String,
        /// Description of what's wrong
        message: String,
    },

    /// Validation failure, e.g. a checksum mismatch on image download
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource that failed validation
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.image.checksum")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an insufficient-capacity error from the per-candidate failures
    pub fn insufficient_capacity(attempts: Vec<String>) -> Self {
        Self::InsufficientCapacity { attempts }
    }

    /// Create a retryable infrastructure error
    pub fn infrastructure(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Infrastructure {
            context: context.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a configuration error for a resource
    pub fn configuration(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error without resource context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Aggregate independently collected errors into one
    ///
    /// A single error is returned as-is so its classification survives.
    /// Several errors collapse into a retryable infrastructure error whose
    /// message lists every cause.
    pub fn join(context: impl Into<String>, mut errors: Vec<Error>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => {
                let retryable = errors.iter().any(Error::is_retryable);
                let message = errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                Some(Self::Infrastructure {
                    context: context.into(),
                    message,
                    retryable,
                })
            }
        }
    }

    /// Whether this error means the target object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Whether this error is the result of an exhausted candidate search
    pub fn is_insufficient_capacity(&self) -> bool {
        matches!(self, Error::InsufficientCapacity { .. })
    }

    /// Check if this error is retryable
    ///
    /// Configuration, validation and serialization errors need a spec change.
    /// Capacity errors are retried since capacity frees up over time.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::NotFound { .. } => false,
            Error::InsufficientCapacity { .. } => true,
            Error::Infrastructure { retryable, .. } => *retryable,
            Error::Configuration { .. } => false,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
