//! Error types for the OpenNebula cloud provider

use thiserror::Error;

/// XML-RPC fault code reported when the addressed object does not exist.
pub const ONE_NO_EXISTS: i32 = 0x0400;
/// XML-RPC fault code reported when the addressed object is locked.
pub const ONE_LOCKED: i32 = 0x8000;

#[derive(Error, Debug)]
pub enum Error {
    /// Resource absent from the remote inventory
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Missing or inconsistent configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Template or attribute data the engine cannot work with
    #[error("Invalid template: {0}")]
    TemplateError(String),

    /// Fault returned by the OpenNebula API, surfaced unmodified
    #[error("OpenNebula API error (code {code:#06x}): {message}")]
    OneError { code: i32, message: String },

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Malformed XML-RPC envelope
    #[error("XML-RPC protocol error: {0}")]
    ProtocolError(String),

    #[error("XML parse error: {0}")]
    XmlError(#[from] quick_xml::Error),

    /// State that should be unreachable by construction
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),
}

impl Error {
    /// True when the error means "the resource does not exist yet".
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::OneError { code, .. } => *code == ONE_NO_EXISTS,
            _ => false,
        }
    }

    /// Whether a later attempt may succeed without any change on our side
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::HttpError(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::OneError { code, .. } => *code == ONE_LOCKED,
            Error::KubeError(_) => true,
            _ => false,
        }
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(e: kube::runtime::finalizer::Error<Error>) -> Self {
        use kube::runtime::finalizer::Error as FinalizerError;
        match e {
            FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => e,
            FinalizerError::AddFinalizer(e) | FinalizerError::RemoveFinalizer(e) => {
                Error::KubeError(e)
            }
            other => Error::FinalizerError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
