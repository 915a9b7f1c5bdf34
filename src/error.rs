use std::sync::Arc;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Config key or file path that caused the error (e.g., "warning_threshold_gb", "pubchem/index.log")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Component that raised the error (e.g., "disk_store", "archive")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Error raised by a caller-supplied compute function, shared between every
/// singleflight waiter that observed it.
pub type ComputeError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for the cache subsystem.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Key derivation error: {message}")]
    KeyDerivation { message: String },

    #[error("Disk write error at {path}: {source}")]
    DiskWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Disk read error at {path}: {message}")]
    DiskRead { path: String, message: String },

    #[error("Payload of entry {key} is not JSON-representable and cannot be exported as text")]
    UnsupportedPayload { key: String },

    #[error("Import format error: {message}{}", format_context(.context))]
    ImportFormat {
        message: String,
        context: ErrorContext,
    },

    #[error("Compute function failed: {0}")]
    Compute(ComputeError),

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("Unknown namespace: {0}")]
    UnknownNamespace(String),

    #[error("Global cache manager already initialized")]
    AlreadyInitialized,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn key_derivation(msg: impl Into<String>) -> Self {
        Error::KeyDerivation {
            message: msg.into(),
        }
    }

    pub fn disk_write(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Error::DiskWrite {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub fn disk_read(path: impl AsRef<std::path::Path>, msg: impl std::fmt::Display) -> Self {
        Error::DiskRead {
            path: path.as_ref().display().to_string(),
            message: msg.to_string(),
        }
    }

    /// Wrap an arbitrary caller error raised by a compute function.
    pub fn compute<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Error::Compute(Arc::from(err.into()))
    }

    /// Create a new import format error with structured context
    pub fn import_format_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::ImportFormat {
            message: msg.into(),
            context,
        }
    }

    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Runtime { context, .. }
            | Error::ImportFormat { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Returns the original compute error if this error came from a compute function.
    pub fn compute_source<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Error::Compute(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Whether repeating the same call may succeed.
    ///
    /// Caller bugs (non-canonical arguments, text export of binary payloads,
    /// corrupt archives) fail identically on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KeyDerivation { .. }
            | Error::UnsupportedPayload { .. }
            | Error::ImportFormat { .. }
            | Error::Configuration { .. }
            | Error::UnknownNamespace(_)
            | Error::AlreadyInitialized
            | Error::Serialization(_) => false,
            Error::DiskWrite { .. }
            | Error::DiskRead { .. }
            | Error::Compute(_)
            | Error::Runtime { .. }
            | Error::Io(_) => true,
        }
    }
}
