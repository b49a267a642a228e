//! Error taxonomy for the assembly pipeline.
//!
//! Operations return `anyhow::Result` and attach context as errors travel up.
//! The root cause of a failure the caller may want to act on is always an
//! [`AssemblyError`], so a boundary can recover its [`ErrorKind`] with
//! [`kind_of`] and decide whether to retry, skip, or abort:
//!
//! ```ignore
//! match kind_of(&err) {
//!     Some(ErrorKind::ToolUnavailable) => { /* optional step, skip it */ }
//!     Some(ErrorKind::Extraction) => { /* retried by the extractor */ }
//!     _ => return Err(err),
//! }
//! ```
//!
//! A cache miss is not an error: lookups return `Option::None`.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Typed root causes raised by the pipeline.
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// Invalid or missing configuration value (user-fixable).
    #[error("configuration: {0}")]
    Configuration(String),

    /// Content did not match its declared sha256.
    #[error("sha256 mismatch for {}: expected {expected}, got {actual}", path.display())]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// An external tool is not installed.
    #[error("{tool} not found on PATH")]
    ToolUnavailable { tool: String },

    /// The external extraction tool failed or produced nothing.
    #[error("extracting {file} from {image}: {reason}")]
    Extraction {
        image: String,
        file: String,
        reason: String,
    },

    /// A payload does not fit a fixed-size embed region.
    #[error("{what} needs {required} bytes but only {capacity} are available")]
    Capacity {
        what: String,
        required: u64,
        capacity: u64,
    },

    /// Acquiring or releasing an advisory lock failed.
    #[error("lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// HTTP transfer failed or returned a non-success status.
    #[error("GET {url}: {reason}")]
    Http { url: String, reason: String },
}

/// Discriminant of [`AssemblyError`], for matching at decision boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Integrity,
    ToolUnavailable,
    Extraction,
    Capacity,
    Lock,
    Http,
}

impl AssemblyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AssemblyError::Configuration(_) => ErrorKind::Configuration,
            AssemblyError::Integrity { .. } => ErrorKind::Integrity,
            AssemblyError::ToolUnavailable { .. } => ErrorKind::ToolUnavailable,
            AssemblyError::Extraction { .. } => ErrorKind::Extraction,
            AssemblyError::Capacity { .. } => ErrorKind::Capacity,
            AssemblyError::Lock { .. } => ErrorKind::Lock,
            AssemblyError::Http { .. } => ErrorKind::Http,
        }
    }
}

/// Find the first [`AssemblyError`] in the chain and return its kind.
pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<AssemblyError>())
        .map(AssemblyError::kind)
}
