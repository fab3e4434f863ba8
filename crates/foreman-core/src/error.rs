use thiserror::Error;

pub type ForemanResult<T> = Result<T, ForemanError>;

/// Error kinds surfaced by every control-plane operation.
#[derive(Debug, Error)]
pub enum ForemanError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate type: {0}")]
    DuplicateType(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("unknown agent type: {0}")]
    UnknownAgentType(String),

    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("restore failed: {0}")]
    RestoreFailed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForemanError {
    /// Stable kind label used on the transport surface and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ForemanError::NotFound(_) => "not_found",
            ForemanError::DuplicateType(_) => "duplicate_type",
            ForemanError::UnknownTool(_) => "unknown_tool",
            ForemanError::UnknownAgentType(_) => "unknown_agent_type",
            ForemanError::PoolExhausted(_) => "pool_exhausted",
            ForemanError::PermissionDenied(_) => "permission_denied",
            ForemanError::IllegalState(_) => "illegal_state",
            ForemanError::RestoreFailed(_) => "restore_failed",
            ForemanError::Json(_) => "json",
            ForemanError::Io(_) => "io",
        }
    }
}
