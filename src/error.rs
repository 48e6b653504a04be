use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Bad magic, truncated stream, or inconsistent shape in a model file.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("corpus error: {0}")]
    Corpus(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Training produced a non-finite loss or weight.
    #[error("training diverged: {0}")]
    Numeric(String),

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("training cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn invalid_model<S: Into<String>>(msg: S) -> Self {
        Error::InvalidModel(msg.into())
    }

    pub(crate) fn corpus<S: Into<String>>(msg: S) -> Self {
        Error::Corpus(msg.into())
    }

    pub(crate) fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }
}
