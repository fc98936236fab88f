use derive_more::From;
use orion_error::{ErrorCode, StructError, UvsReason};

#[derive(Debug, Clone, PartialEq, thiserror::Error, From)]
pub enum CoreReason {
    #[error("expression evaluation error")]
    Eval,
    #[error("run input error")]
    Input,
    #[error("filesystem error")]
    Filesystem,
    #[error("command template error")]
    Command,
    #[error("{0}")]
    Uvs(UvsReason),
}

impl CoreReason {
    /// Stable kind string for machine-readable error output.
    pub fn kind_str(&self) -> &'static str {
        match self {
            CoreReason::Eval => "EvalError",
            CoreReason::Input => "InputError",
            CoreReason::Filesystem => "FilesystemError",
            CoreReason::Command => "CommandError",
            CoreReason::Uvs(_) => "RunFailure",
        }
    }
}

impl ErrorCode for CoreReason {
    fn error_code(&self) -> i32 {
        match self {
            Self::Eval => 1001,
            Self::Input => 1002,
            Self::Filesystem => 1003,
            Self::Command => 1004,
            Self::Uvs(u) => u.error_code(),
        }
    }
}

pub type CoreError = StructError<CoreReason>;
pub type CoreResult<T> = Result<T, CoreError>;
