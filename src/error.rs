use thiserror::Error;

/// Crate-internal error taxonomy. Request-scoped variants are converted to
/// HTTP statuses at the ingress boundary; the rest are session- or
/// process-scoped (see spec §7).
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {size} bytes exceeds max {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unexpected frame for current state")]
    UnexpectedFrame,

    #[error("tls setup failed: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
