use core::fmt;

/// Generic result type for traversal operations
pub type Result<T> = core::result::Result<T, WalkError>;

/// A raw OS error code as returned by a failed syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Errno(pub(crate) i32);

impl Errno {
    /// Reads `errno` after a failed libc call.
    #[must_use]
    #[inline]
    pub fn last() -> Self {
        Self(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }

    /// The raw error number, e.g. `libc::ENOENT`.
    #[must_use]
    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    #[must_use]
    #[inline]
    pub fn io(self) -> std::io::Error {
        std::io::Error::from_raw_os_error(self.0)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.io())
    }
}

impl From<std::io::Error> for Errno {
    #[inline]
    fn from(err: std::io::Error) -> Self {
        Self(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl From<i32> for Errno {
    #[inline]
    fn from(raw: i32) -> Self {
        Self(raw)
    }
}

/// Errors surfaced by [`walk`](crate::walk()) and [`WalkBuilder`](crate::WalkBuilder).
///
/// OS errors encountered mid-traversal are reported through the callback when
/// [`WalkFlags::RECOVER`](crate::WalkFlags::RECOVER) is set; otherwise the
/// first one aborts the walk and comes back as `Os`.
#[derive(Debug)]
pub enum WalkError {
    /// A syscall failed and error recovery was not requested.
    Os(Errno),
    /// No starting paths were supplied, or a path contained a NUL byte.
    InvalidPath,
    /// The walk was interrupted by a signal.
    Interrupted,
}

impl WalkError {
    /// The underlying OS error code, when there is one.
    #[must_use]
    pub const fn errno(&self) -> Option<Errno> {
        match self {
            Self::Os(errno) => Some(*errno),
            Self::Interrupted => Some(Errno(libc::EINTR)),
            Self::InvalidPath => None,
        }
    }
}

impl fmt::Display for WalkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Os(errno) => write!(f, "traversal failed: {errno}"),
            Self::InvalidPath => write!(f, "invalid starting path"),
            Self::Interrupted => write!(f, "traversal interrupted by signal"),
        }
    }
}

impl std::error::Error for WalkError {}

impl From<Errno> for WalkError {
    #[inline]
    fn from(errno: Errno) -> Self {
        Self::Os(errno)
    }
}

impl From<std::io::Error> for WalkError {
    #[inline]
    fn from(err: std::io::Error) -> Self {
        Self::Os(err.into())
    }
}
