//! Error taxonomy for translation, task construction and device execution.

use thiserror::Error;

use crate::parsing::BinaryOp;

/// Errors raised anywhere in the closure → kernel → device pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// A closure instruction outside the supported arithmetic subset.
    #[error("unsupported instruction `{mnemonic}` at position {position}")]
    UnsupportedInstruction { mnemonic: String, position: usize },

    /// The stack-machine reduction did not end with exactly one expression.
    #[error("malformed expression: {0}")]
    MalformedExpression(String),

    /// Attempt to build an abstract task kind.
    #[error("invalid construction: {0}")]
    InvalidConstruction(String),

    /// A parallel scan requested with `-` or `/`.
    #[error("`{0}` is not associative and cannot be scanned in parallel")]
    NonAssociative(BinaryOp),

    /// The native bridge rejected kernel source.
    #[error("kernel `{entry_point}` failed to compile: {diagnostic}")]
    CompilationError {
        entry_point: String,
        diagnostic: String,
    },

    /// Device-side fault while running a kernel or moving data.
    #[error("kernel execution failed: {0}")]
    ExecutionError(String),

    /// A materializing call on a device with nothing loaded.
    #[error("no dataset loaded on device")]
    NoDataLoaded,

    #[error("unknown dataset `{0}`")]
    UnknownDataSet(String),

    #[error("unknown operation `{0}`")]
    UnknownOperation(String),

    /// The requested device kind cannot be brought up on this machine.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A device value that does not fit the requested host element type.
    #[error("value {value} cannot be represented as {target}")]
    Conversion { value: i32, target: &'static str },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn compilation(entry_point: &str, diagnostic: impl Into<String>) -> Self {
        Error::CompilationError {
            entry_point: entry_point.to_string(),
            diagnostic: diagnostic.into(),
        }
    }

    pub(crate) fn execution(message: impl Into<String>) -> Self {
        Error::ExecutionError(message.into())
    }
}
