use thiserror::Error;

/// Failures that abort judging a run.
///
/// Judging outcomes (wrong answer, time limit, ...) are never errors; they
/// travel as results. Everything here ends the run as `judging_error`,
/// except `Compilation`, which the executor records as `compile_error`.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("sandbox failure: {0}")]
    Sandbox(String),

    #[error("output validator failed: {0}")]
    Validator(String),

    #[error("custom grader failed: {0}")]
    Grader(String),

    #[error("invalid evaluation plan: {0}")]
    Plan(String),

    #[error("unknown language: {0}")]
    UnknownLanguage(String),

    #[error("compilation failed")]
    Compilation(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("missing test data file {0}")]
    MissingFile(String),

    #[error("result stream broken: {0}")]
    Stream(String),

    #[error("evaluation slot pool closed")]
    SlotsClosed,

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for JudgeError {
    fn from(err: redis::RedisError) -> Self {
        JudgeError::Storage(err.to_string())
    }
}

impl From<bollard::errors::Error> for JudgeError {
    fn from(err: bollard::errors::Error) -> Self {
        JudgeError::Sandbox(err.to_string())
    }
}

pub type JudgeResult<T> = std::result::Result<T, JudgeError>;
