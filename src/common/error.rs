use std::io;
use std::result;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[source] Box<io::Error>),
    #[error("Corruption: {0}")]
    Corruption(String),
    #[error("Not supported: {0}")]
    NotSupported(String),
    #[error("Invalid filename: {0}")]
    InvalidFile(String),
    #[error("File closed: {0}")]
    Closed(String),
    #[error("Task cancel because of: {0}")]
    Cancel(&'static str),
    #[error("Other error: {0}")]
    Other(String),
}

impl From<io::Error> for Error {
    #[inline]
    fn from(e: io::Error) -> Error {
        Error::Io(Box::new(e))
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Io(e) => Error::Other(format!("IO error: {:?}", e)),
            Error::Corruption(e) => Error::Corruption(e.clone()),
            Error::NotSupported(e) => Error::NotSupported(e.clone()),
            Error::InvalidFile(e) => Error::InvalidFile(e.clone()),
            Error::Closed(e) => Error::Closed(e.clone()),
            Error::Cancel(e) => Error::Cancel(*e),
            Error::Other(e) => Error::Other(e.clone()),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
