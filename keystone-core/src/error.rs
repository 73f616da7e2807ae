use thiserror::Error;

/// Unified error type for Keystone Gateway.
///
/// Startup-only variants (`Config`, `Compile`) abort the process; everything
/// else is translated into an HTTP response inside the per-request handler.
#[derive(Error, Debug)]
pub enum KeystoneError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Compile error in script '{name}': {message}")]
    Compile { name: String, message: String },

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Request body exceeds {0} bytes")]
    RequestTooLarge(usize),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Script '{name}' failed: {message}")]
    ScriptRuntime { name: String, message: String },

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("Request timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal: {0}")]
    Internal(String),
}

impl KeystoneError {
    /// Map to HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            KeystoneError::RouteNotFound(_) => 404,
            KeystoneError::RequestTooLarge(_) => 413,
            KeystoneError::MalformedRequest(_) => 400,
            KeystoneError::ScriptRuntime { .. } => 500,
            KeystoneError::UpstreamUnreachable(_) => 502,
            KeystoneError::Timeout => 504,
            _ => 500,
        }
    }

    /// Safe JSON error body. Never leaks script or upstream internals.
    pub fn to_json_body(&self) -> Vec<u8> {
        let status = self.status_code();
        let msg = match self {
            KeystoneError::RouteNotFound(_) => "not found",
            KeystoneError::RequestTooLarge(_) => "request body too large",
            KeystoneError::MalformedRequest(_) => "malformed request",
            KeystoneError::ScriptRuntime { .. } => "script execution failed",
            KeystoneError::UpstreamUnreachable(_) => "upstream unreachable",
            KeystoneError::Timeout => "gateway timeout",
            _ => "internal error",
        };
        format!(r#"{{"error":"{}","status":{}}}"#, msg, status).into_bytes()
    }
}
