use std::path::PathBuf;
use std::time::Duration;
use std::{fmt, io};

#[derive(Debug)]
pub enum ShmemError {
    InvalidName(String),
    AlreadyExists(PathBuf),
    NotFound(PathBuf),
    // Fatal: the two sides cannot interoperate.
    VersionMismatch { expected: i32, found: i32 },
    Timeout(Duration),
    PeerGone,
    InvalidArgument(String),
    Closed,
    NotInControl,
    OutOfBounds { offset: usize, len: usize, capacity: usize },
    Encoding(String),
    Io(io::Error),
}

pub type Result<T> = std::result::Result<T, ShmemError>;

impl ShmemError {
    /// Errors after which the session has torn itself down.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ShmemError::Timeout(_) | ShmemError::PeerGone)
    }
}

impl fmt::Display for ShmemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmemError::InvalidName(s) => write!(f, "Invalid name: {}", s),
            ShmemError::AlreadyExists(p) => write!(f, "File already exists: {}", p.display()),
            ShmemError::NotFound(p) => write!(f, "File not found: {}", p.display()),
            ShmemError::VersionMismatch { expected, found } => write!(
                f,
                "Incompatible protocol versions (ours v{}, peer v{})",
                expected, found
            ),
            ShmemError::Timeout(d) => write!(f, "Peer did not return control within {:?}", d),
            ShmemError::PeerGone => write!(f, "Peer has closed the session"),
            ShmemError::InvalidArgument(s) => write!(f, "Invalid argument: {}", s),
            ShmemError::Closed => write!(f, "Region or session is closed"),
            ShmemError::NotInControl => write!(f, "This side does not hold control"),
            ShmemError::OutOfBounds { offset, len, capacity } => write!(
                f,
                "Access of {} bytes at offset {} exceeds capacity {}",
                len, offset, capacity
            ),
            ShmemError::Encoding(s) => write!(f, "Encoding error: {}", s),
            ShmemError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for ShmemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShmemError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ShmemError {
    fn from(err: io::Error) -> Self {
        ShmemError::Io(err)
    }
}
