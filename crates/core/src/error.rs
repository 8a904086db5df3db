/// Result alias that carries the custom [`StoryboxError`] type.
pub type Result<T> = std::result::Result<T, StoryboxError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum StoryboxError {
    /// Free-form failure that does not fit a more specific variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Malformed JSON in a configuration or timeline document.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The story provider could not be reached or answered with garbage.
    #[error("story provider: {0}")]
    Provider(String),
    /// A downloaded story archive could not be unpacked.
    #[error("story archive: {0}")]
    Archive(String),
    /// A timeline document did not have the minimum required shape.
    #[error("timeline: {0}")]
    Timeline(String),
    /// Pattern parameters that cannot produce a renderable instance.
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
    /// A shared lock was poisoned by a panicking holder.
    #[error("{0} lock has been poisoned")]
    Poisoned(&'static str),
}

impl StoryboxError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn provider<T: Into<String>>(msg: T) -> Self {
        Self::Provider(msg.into())
    }

    pub fn archive<T: Into<String>>(msg: T) -> Self {
        Self::Archive(msg.into())
    }
}

impl From<&str> for StoryboxError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for StoryboxError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
