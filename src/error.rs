use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// CinderDB errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid on-disk data: footer, block, index, or entry decode failures.
    Corruption(String),
    /// Invalid user input, typically configuration or training-input errors.
    InvalidInput(String),
    /// An IO error.
    IO(String),
    /// A learned-model invariant was violated: a fixed-stride entry carried a
    /// shared prefix, or the model returned an impossible position range.
    ModelInvariant(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::ModelInvariant(msg) => write!(f, "model invariant violated: {msg}"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A CinderDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}
