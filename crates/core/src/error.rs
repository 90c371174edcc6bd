use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("upload failed: {message}")]
    TransientUpload { message: String },

    #[error("rate limited by origin (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("upload failed after {attempts} attempts: {message}")]
    PermanentUpload { attempts: u32, message: String },

    #[error("worker lost: {reason}")]
    WorkerLost { reason: String },

    #[error("disconnected from coordinator")]
    Disconnected,

    #[error("unsupported path (must be UTF-8): {path:?}")]
    NonUtf8Path { path: PathBuf },
}

impl Error {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn worker_lost(reason: impl Into<String>) -> Self {
        Self::WorkerLost {
            reason: reason.into(),
        }
    }

    /// The coordinator socket is gone; the work itself may still be intact.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::WebSocket(_) | Self::Disconnected)
    }

    /// Text for an `error` frame; the peer re-wraps it in its own variant.
    pub fn wire_message(&self) -> String {
        match self {
            Self::Protocol { message } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}
