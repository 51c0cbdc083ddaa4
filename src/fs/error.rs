use crate::engine::EngineError;

#[derive(Debug)]
pub enum FsError {
    /// Swarm metadata (or storage) is not available yet; retry shortly.
    NotReady,
    NotFound(String),
    /// The consumer of a stream went away mid-transfer.
    Disconnected,
    /// The engine stopped fetching the file while a read waited on it.
    Deselected,
    Closed,
    Io(std::io::Error),
    Engine(EngineError),
}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotReady => write!(f, "swarm metadata not ready"),
            Self::NotFound(path) => write!(f, "no swarm entry or local file matches '{path}'"),
            Self::Disconnected => write!(f, "stream consumer disconnected"),
            Self::Deselected => write!(f, "file is no longer selected for download"),
            Self::Closed => write!(f, "file already closed"),
            Self::Io(source) => write!(f, "storage read failed: {source}"),
            Self::Engine(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for FsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(source) => Some(source),
            Self::Engine(source) => Some(source),
            Self::NotReady
            | Self::NotFound(_)
            | Self::Disconnected
            | Self::Deselected
            | Self::Closed => None,
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EngineError> for FsError {
    fn from(value: EngineError) -> Self {
        Self::Engine(value)
    }
}
