use thiserror::Error;

/// Core error type for the telemetry client.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Malformed or missing publisher configuration. Fatal at client construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Token acquisition failed for a publisher.
    #[error("authentication failed for publisher {publisher}: {message}")]
    Auth { publisher: String, message: String },

    /// Network failure, 5xx, or throttling. The caller may retry on the next flush.
    #[error("transient transport error from {publisher}: {message}")]
    TransientTransport {
        publisher: String,
        status: Option<u16>,
        retry_after: Option<u64>,
        message: String,
    },

    /// 4xx rejection. Retrying the same batch will not help.
    #[error("permanent transport error from {publisher}: {status} {message}")]
    PermanentTransport {
        publisher: String,
        status: u16,
        message: String,
    },

    /// Bad call into a Track* operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("publish to {publisher} was cancelled")]
    Cancelled { publisher: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TelemetryError {
    /// True when the same batch may succeed on a later flush.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientTransport { .. } | Self::Cancelled { .. }
        )
    }

    /// Short machine-friendly name of the variant, used in span fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Auth { .. } => "auth",
            Self::TransientTransport { .. } => "transient_transport",
            Self::PermanentTransport { .. } => "permanent_transport",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Cancelled { .. } => "cancelled",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, TelemetryError>;
