use std::fmt::Display;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {reason}")]
    Config { reason: String },

    #[error("persistence error: {reason}")]
    Persistence { reason: String },

    #[error("action error: {reason}")]
    Action { reason: String },
}

impl Error {
    pub fn config(reason: impl Into<String>) -> Self {
        Error::Config {
            reason: reason.into(),
        }
    }

    pub fn persistence(path: &Path, cause: impl Display) -> Self {
        Error::Persistence {
            reason: format!("{}: {}", path.display(), cause),
        }
    }

    pub fn action(reason: impl Into<String>) -> Self {
        Error::Action {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
