use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResticError {
    /// The tool exited non-zero. `exit_code` is -1 when killed by a signal.
    #[error("restic exited with status {exit_code}: {stderr}")]
    Tool { exit_code: i32, stderr: String },

    #[error("failed to parse restic output line {line:?}: {reason}")]
    Parse { line: String, reason: String },

    #[error("restic invocation was cancelled")]
    Cancelled,

    #[error("restic i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResticError {
    pub(crate) fn parse(line: impl Into<String>, reason: impl ToString) -> Self {
        ResticError::Parse {
            line: line.into(),
            reason: reason.to_string(),
        }
    }
}
