//======================================================================================================================
// Imports
//======================================================================================================================

use ::libc::{
    c_int,
    EACCES,
    EBADF,
    EIO,
    ENOENT,
    ETIMEDOUT,
};
use ::std::{
    error,
    fmt,
    io,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Failure raised by a reactor operation. Carries an errno-style error code plus a human-readable cause. This is the
/// value recorded in the reactor's error log and the value user callbacks return to signal a failure.
#[derive(Clone)]
pub struct Fail {
    /// Error code.
    pub errno: c_int,
    /// Cause.
    pub cause: String,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Fail {
    /// Creates a new failure.
    pub fn new(errno: i32, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
        }
    }

    /// A handle failed validation before registration. This is the only failure class that surfaces synchronously to
    /// the caller of a registration call.
    pub fn invalid_resource(cause: &str) -> Self {
        Self::new(EBADF, cause)
    }

    /// The target of a file-read task does not exist.
    pub fn file_not_found(path: &str) -> Self {
        Self::new(ENOENT, &format!("file not found: {}", path))
    }

    /// The target of a file-read task exists but cannot be read.
    pub fn not_readable(path: &str) -> Self {
        Self::new(EACCES, &format!("file not readable: {}", path))
    }

    /// The target of a file-read task failed to open for a reason other than the two above.
    pub fn open_failed(path: &str) -> Self {
        Self::new(EIO, &format!("could not open file: {}", path))
    }

    /// A wait on a future outlived its deadline.
    pub fn timed_out(cause: &str) -> Self {
        Self::new(ETIMEDOUT, cause)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error {:?}: {}", self.errno, self.cause)
    }
}

impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error {:?}: {}", self.errno, self.cause)
    }
}

impl error::Error for Fail {}

impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => Self::new(errno, &e.to_string()),
            None => Self::new(EIO, &e.to_string()),
        }
    }
}
