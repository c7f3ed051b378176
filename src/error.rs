use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "storage.endpoint", "args[1]")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., key, object name, model id)
    pub details: Option<String>,
    /// Component that raised the error (e.g., "result_cache", "artifact_store", "model_manager")
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

/// Unified error type for the caching and model lifecycle core.
///
/// Only `Connection` (strict startup) and `InvalidArgument` (caller bugs) are expected to
/// reach application code; every other variant is downgraded by the best-effort APIs.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Connection error: {message}{}", format_context(.context))]
    Connection {
        message: String,
        context: ErrorContext,
    },

    #[error("Backend unavailable: {message}{}", format_context(.context))]
    Backend {
        message: String,
        context: ErrorContext,
    },

    #[error("Not found: {message}{}", format_context(.context))]
    NotFound {
        message: String,
        context: ErrorContext,
    },

    #[error("Model load failure: {message}{}", format_context(.context))]
    LoadFailure {
        message: String,
        context: ErrorContext,
    },

    #[error("Invalid argument: {message}{}", format_context(.context))]
    InvalidArgument {
        message: String,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

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
    pub fn connection_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Connection {
            message: msg.into(),
            context,
        }
    }

    pub fn backend_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Backend {
            message: msg.into(),
            context,
        }
    }

    pub fn not_found_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::NotFound {
            message: msg.into(),
            context,
        }
    }

    pub fn load_failure_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::LoadFailure {
            message: msg.into(),
            context,
        }
    }

    pub fn invalid_argument_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::InvalidArgument {
            message: msg.into(),
            context,
        }
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::backend_with_context(msg, ErrorContext::new())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::not_found_with_context(msg, ErrorContext::new())
    }

    pub fn load_failure(msg: impl Into<String>) -> Self {
        Self::load_failure_with_context(msg, ErrorContext::new())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::configuration_with_context(msg, ErrorContext::new())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Connection { context, .. }
            | Error::Backend { context, .. }
            | Error::NotFound { context, .. }
            | Error::LoadFailure { context, .. }
            | Error::InvalidArgument { context, .. }
            | Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }
}
