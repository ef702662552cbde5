/// Result alias that carries the custom [`SoundError`] type.
pub type Result<T> = std::result::Result<T, SoundError>;

/// Common error type for the core crate.
///
/// The type is `Clone` because a single failure is delivered to several
/// observers of the same clip: the `on_error` callback, a pending `play`
/// future and the clip's completion signal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SoundError {
    /// The source could not be fetched or decoded by the host decoder.
    #[error("failed to load \"{source_uri}\": {reason}")]
    DecodeOrLoad { source_uri: String, reason: String },
    /// The host refused to start playback (autoplay gate, missing resource).
    #[error("playback of \"{source_uri}\" was rejected: {reason}")]
    PlaybackRejected { source_uri: String, reason: String },
    /// A pending `play` observed the clip being disposed before it settled.
    #[error("clip {0} was disposed before playback settled")]
    Disposed(u64),
    /// The device context no longer accepts new nodes.
    #[error("audio context {0} has been closed")]
    ContextClosed(u64),
    /// The clip already feeds an analyser.
    #[error("clip {0} is already routed through an analyser")]
    AlreadyRouted(u64),
    /// Configuration could not be parsed or failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Free-form message for conditions without a dedicated variant.
    #[error("{0}")]
    Message(String),
}

impl SoundError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub(crate) fn load(source_uri: &str, reason: impl ToString) -> Self {
        Self::DecodeOrLoad {
            source_uri: source_uri.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn rejected(source_uri: &str, reason: impl ToString) -> Self {
        Self::PlaybackRejected {
            source_uri: source_uri.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<&str> for SoundError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for SoundError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<serde_json::Error> for SoundError {
    fn from(value: serde_json::Error) -> Self {
        Self::Config(value.to_string())
    }
}
