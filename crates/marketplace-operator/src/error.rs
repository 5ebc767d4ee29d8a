//! Error types for the marketplace operator

use crate::manifest::ManifestError;
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Resource already exists
    #[error("Resource already exists: {kind}/{name} in namespace {namespace}")]
    AlreadyExists {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Optimistic update rejected because the object changed underneath us
    #[error("Conflict updating {kind}/{name}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    /// Invalid spec; the message is surfaced verbatim in the phase message
    #[error("{0}")]
    InvalidSpec(String),

    /// Manifest could not be parsed, decomposed or bundled
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Package is not present in the datastore
    #[error("manifest not found for package {0}")]
    ManifestNotFound(String),

    /// A downloaded repository could not be decoded into manifests
    #[error("faulty manifest in {repository}: {source}")]
    FaultyManifest {
        repository: String,
        source: Box<OperatorError>,
    },

    /// Two repositories of one source produce the same package ID
    #[error("package {package} from {repository} is already served by {existing}")]
    DuplicatePackage {
        package: String,
        repository: String,
        existing: String,
    },

    /// App-registry request failed
    #[error("App registry error: {0}")]
    AppRegistry(String),

    /// A child resource exists but is labelled for another owner
    #[error("{0}")]
    OwnershipConflict(String),

    /// Several independent failures collected into one
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<OperatorError>),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

fn format_aggregate(errors: &[OperatorError]) -> String {
    match errors {
        [] => "no errors".to_string(),
        [single] => single.to_string(),
        many => format!(
            "[{}]",
            many.iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

impl OperatorError {
    /// Collapse a list of errors into `None`, the single error, or an aggregate
    pub fn aggregate(mut errors: Vec<OperatorError>) -> Option<OperatorError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(OperatorError::Aggregate(errors)),
        }
    }

    /// Build a not-found error for a named object
    pub fn not_found(kind: &str, namespace: Option<&str>, name: &str) -> Self {
        OperatorError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.unwrap_or_default().to_string(),
        }
    }

    /// Whether this error is a not-found error, including API 404s
    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::NotFound { .. } | OperatorError::ManifestNotFound(_) => true,
            OperatorError::KubeError(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            OperatorError::KubeError(_)
            | OperatorError::Conflict { .. }
            | OperatorError::Timeout(_)
            | OperatorError::AppRegistry(_) => true,
            OperatorError::Aggregate(errors) => errors.iter().any(|e| e.is_retryable()),
            _ => false,
        }
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<std::time::Duration> {
        match self {
            OperatorError::Conflict { .. } => Some(std::time::Duration::from_secs(1)),
            e if e.is_retryable() => Some(std::time::Duration::from_secs(30)),
            _ => None,
        }
    }
}
