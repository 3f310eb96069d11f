/// Result alias that carries the custom [`StageError`] type.
pub type Result<T> = std::result::Result<T, StageError>;

/// Common error type for the core crate.
///
/// Most runtime problems on the stage are recovered locally (dropped
/// commands, placeholder images, ignored late resolutions). This type is for
/// the few paths that genuinely fail: surface allocation, encoding, IO in the
/// host, and playback start failures before they are turned into
/// notifications.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Free-form message for conditions without a dedicated variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// JSON payload could not be parsed or produced.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// The render surface could not be allocated or encoded.
    #[error("render: {0}")]
    Render(String),
    /// A playback handle refused to start.
    #[error("playback for `{id}` failed: {message}")]
    Playback { id: String, message: String },
}

impl StageError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn render<T: Into<String>>(msg: T) -> Self {
        Self::Render(msg.into())
    }
}

impl From<&str> for StageError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for StageError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
