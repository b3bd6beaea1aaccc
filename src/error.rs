use std::fmt;
use std::io;

use safetensors::SafeTensorError;

#[derive(Debug)]
pub enum NetError {
    Io(io::Error),
    Json(serde_json::Error),
    SafeTensors(SafeTensorError),
    /// The snapshot decoded but its contents do not describe a consistent network.
    CorruptSnapshot(String),
    UnsupportedFormat(String),
    Config(String),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Io(e) => write!(f, "IO error: {}", e),
            NetError::Json(e) => write!(f, "JSON error: {}", e),
            NetError::SafeTensors(e) => write!(f, "Safetensors error: {:?}", e),
            NetError::CorruptSnapshot(s) => write!(f, "Corrupt snapshot: {}", s),
            NetError::UnsupportedFormat(s) => write!(f, "Unsupported snapshot format: {}", s),
            NetError::Config(s) => write!(f, "Configuration error: {}", s),
        }
    }
}

impl std::error::Error for NetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetError::Io(e) => Some(e),
            NetError::Json(e) => Some(e),
            NetError::SafeTensors(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> NetError {
        NetError::Io(err)
    }
}

impl From<serde_json::Error> for NetError {
    fn from(err: serde_json::Error) -> NetError {
        NetError::Json(err)
    }
}

impl From<SafeTensorError> for NetError {
    fn from(err: SafeTensorError) -> NetError {
        NetError::SafeTensors(err)
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
