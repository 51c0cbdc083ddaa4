#[derive(Debug)]
pub enum EngineError {
    CommandFailed { op: &'static str, message: String },
    NoDownload,
    UnknownFile(usize),
    ChannelClosed,
    Io(std::io::Error),
}

impl EngineError {
    pub fn command_failed(op: &'static str, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            op,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CommandFailed { op, message } => write!(f, "engine {op} failed: {message}"),
            Self::NoDownload => write!(f, "no download attached to the engine"),
            Self::UnknownFile(index) => write!(f, "download has no file at index {index}"),
            Self::ChannelClosed => write!(f, "engine worker channel closed"),
            Self::Io(source) => write!(f, "engine storage error: {source}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(source) => Some(source),
            Self::CommandFailed { .. }
            | Self::NoDownload
            | Self::UnknownFile(_)
            | Self::ChannelClosed => None,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}
