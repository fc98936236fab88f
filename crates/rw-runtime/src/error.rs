use derive_more::From;
use orion_error::{ErrorCode, StructError, UvsReason};

use rw_core::CoreReason;

#[derive(Debug, Clone, PartialEq, thiserror::Error, From)]
pub enum RuntimeReason {
    #[error("task execution failure")]
    TaskFailure,
    #[error("run interrupted")]
    Interrupted,
    #[error("configuration error")]
    Configuration,
    #[error("container backend error")]
    Backend,
    #[error("download error")]
    Download,
    #[error("{0}")]
    Core(CoreReason),
    #[error("{0}")]
    Uvs(UvsReason),
}

impl RuntimeReason {
    /// Stable kind string for `error.json`.
    pub fn kind_str(&self) -> &'static str {
        match self {
            RuntimeReason::TaskFailure => "TaskFailure",
            RuntimeReason::Interrupted => "Interrupted",
            RuntimeReason::Configuration => "ConfigurationError",
            RuntimeReason::Backend => "ConfigurationError",
            RuntimeReason::Download => "FilesystemError",
            RuntimeReason::Core(c) => c.kind_str(),
            RuntimeReason::Uvs(_) => "RunFailure",
        }
    }
}

impl ErrorCode for RuntimeReason {
    fn error_code(&self) -> i32 {
        match self {
            Self::TaskFailure => 2001,
            Self::Interrupted => 2002,
            Self::Configuration => 2003,
            Self::Backend => 2004,
            Self::Download => 2005,
            Self::Core(c) => c.error_code(),
            Self::Uvs(u) => u.error_code(),
        }
    }
}

pub type RuntimeError = StructError<RuntimeReason>;
pub type RuntimeResult<T> = Result<T, RuntimeError>;
