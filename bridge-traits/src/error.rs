use thiserror::Error;

/// Failure reported by a host bridge or a media-server adapter.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Remote server unreachable: {0}")]
    Unreachable(String),

    #[error("Remote rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Remote returned invalid data: {0}")]
    InvalidData(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Rejected credentials will not fix themselves on retry.
    pub fn needs_operator(&self) -> bool {
        matches!(self, BridgeError::Unauthorized(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
