use std::{path::PathBuf, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SplicerError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("engine rejected `{command}`: {message}")]
    EngineRejected { command: String, message: String },
    #[error("engine did not settle within {waited:?}")]
    EngineStuck { waited: Duration },
    #[error("measurement failed for {}: {reason}", path.display())]
    Measurement { path: PathBuf, reason: String },
    #[error("io error: {0}")]
    Io(String),
}

impl SplicerError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<anyhow::Error> for SplicerError {
    fn from(value: anyhow::Error) -> Self {
        Self::Io(format!("{value:#}"))
    }
}

impl From<std::io::Error> for SplicerError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}
