use std::fmt::Display;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid function name: '{0}'")]
    InvalidName(String),

    #[error("wrong number of {what}: expected {expected}, got {got}")]
    Arity {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("shape mismatch for {what}: expected {expected}, got {got}")]
    Shape {
        what: String,
        expected: String,
        got: String,
    },

    #[error("{what} index {index} out of range (limit {limit})")]
    Index {
        what: &'static str,
        index: usize,
        limit: usize,
    },

    #[error("unknown entry: '{0}'")]
    UnknownEntry(String),

    #[error("unknown specification: '{0}'")]
    UnknownSpec(String),

    #[error("unsupported function type: '{0}'")]
    UnsupportedType(String),

    #[error("operation not supported by this node: {0}")]
    Capability(&'static str),

    #[error("null function handle")]
    NullHandle,

    #[error("IO error: {0}")]
    Io(String),

    #[error("{0}")]
    Msg(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new error based on a printable error message.
    pub fn msg<M: Display>(msg: M) -> Self {
        Self::Msg(msg.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value.to_string())
    }
}

#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::Error::Msg(format!($msg)))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($fmt, $($arg)*)))
    };
}
