use std::{error::Error, fmt, io};

use serde::{Deserialize, Serialize};

use crate::{value::RefId, work::WorkKey};

/// The runtime's result type.
pub type Result<T> = std::result::Result<T, PipeError>;

/// A failure raised while executing a work item.
///
/// It is stored inside the item's result slot and handed out by clone, so every
/// resolver of the same reference observes an identical error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecError {
    pub stage: String,
    pub microbatch: Option<usize>,
    pub msg: String,
}

impl ExecError {
    /// Creates a new `ExecError`.
    ///
    /// # Arguments
    /// * `stage` - The name of the stage that failed.
    /// * `microbatch` - The microbatch being processed when it failed.
    /// * `msg` - A human readable description of the failure.
    pub fn new(stage: impl Into<String>, microbatch: usize, msg: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            microbatch: Some(microbatch),
            msg: msg.into(),
        }
    }

    /// A failure that is not attributable to a stage, e.g. a reference nobody owns.
    pub fn unresolvable(id: RefId, msg: impl fmt::Display) -> Self {
        Self {
            stage: String::new(),
            microbatch: None,
            msg: format!("reference {id}: {msg}"),
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.microbatch {
            Some(mb) => write!(
                f,
                "stage {} failed on microbatch {mb}: {}",
                self.stage, self.msg
            ),
            None => f.write_str(&self.msg),
        }
    }
}

impl Error for ExecError {}

/// All errors that can occur in the pipeline runtime.
#[derive(Debug)]
pub enum PipeError {
    /// Malformed splitter or driver configuration, never retried.
    Config(String),
    /// A live work item with the same key already exists on the stage.
    DuplicateKey { stage: String, key: WorkKey },
    /// A stage callable failed while producing a value.
    Execution(ExecError),
    /// Batch dimension sizes disagree across the input arguments.
    ShapeMismatch {
        arg: usize,
        expected: usize,
        got: usize,
    },
    /// A microbatch's final value is not a resolvable reference.
    UnsupportedOutput { microbatch: usize },
    /// A result slot was assigned a second time.
    SlotAlreadySet(RefId),
    /// The stage no longer accepts work.
    StageClosed(String),
    UnknownStage(String),
    UnknownRef(RefId),
    /// A peer answered a request with an error.
    Remote(String),
    Io(io::Error),
}

impl fmt::Display for PipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "invalid config: {msg}"),
            Self::DuplicateKey { stage, key } => {
                write!(f, "duplicate work item {key} on stage {stage}")
            }
            Self::Execution(e) => write!(f, "execution error: {e}"),
            Self::ShapeMismatch { arg, expected, got } => write!(
                f,
                "batch dimension mismatch on argument {arg}: got {got}, expected {expected}"
            ),
            Self::UnsupportedOutput { microbatch } => write!(
                f,
                "microbatch {microbatch} did not produce a resolvable reference"
            ),
            Self::SlotAlreadySet(id) => write!(f, "result slot {id} was already set"),
            Self::StageClosed(name) => write!(f, "stage {name} is shut down"),
            Self::UnknownStage(name) => write!(f, "unknown stage {name}"),
            Self::UnknownRef(id) => write!(f, "unknown reference {id}"),
            Self::Remote(msg) => write!(f, "remote error: {msg}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for PipeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Execution(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PipeError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ExecError> for PipeError {
    fn from(value: ExecError) -> Self {
        Self::Execution(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<PipeError> for io::Error {
    fn from(value: PipeError) -> Self {
        match value {
            PipeError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
