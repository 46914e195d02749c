use core::mem;

/// An owned file descriptor for internal IO. `-1` means closed.
#[derive(Debug)]
#[repr(transparent)]
pub(crate) struct FileDes(i32);

impl FileDes {
    pub(crate) const CLOSED: Self = Self(-1);

    #[inline]
    pub(crate) const fn new(fd: i32) -> Self {
        Self(fd)
    }

    #[inline]
    pub(crate) const fn raw(&self) -> i32 {
        self.0
    }

    #[inline]
    pub(crate) const fn is_open(&self) -> bool {
        self.0 >= 0
    }

    /// Moves the descriptor out, leaving this handle closed.
    #[inline]
    pub(crate) fn take(&mut self) -> Self {
        mem::replace(self, Self::CLOSED)
    }

    /// Closes the descriptor now. Idempotent.
    #[inline]
    pub(crate) fn close(&mut self) {
        if self.is_open() {
            // SAFETY: we own the fd and invalidate it immediately
            unsafe { libc::close(self.0) };
            self.0 = -1;
        }
    }
}

impl Drop for FileDes {
    #[inline]
    fn drop(&mut self) {
        self.close();
    }
}

// d_type tag for whiteout tombstones. Defined here rather than taken from
// libc because not every libc target exports DT_WHT.
pub(crate) const DT_WHT: u8 = 14;

/// Represents the type of a file in the filesystem, as reported by a dirent
/// or a stat. `Error` marks a visit whose information could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileKind {
    Unknown,
    BlockDevice,
    CharDevice,
    Directory,
    Door,
    Fifo,
    Symlink,
    Port,
    RegularFile,
    Socket,
    Whiteout,
    Error,
}

impl FileKind {
    /// Converts a dirent `d_type` to a `FileKind`.
    #[must_use]
    #[inline]
    pub(crate) const fn from_dtype(d_type: u8) -> Self {
        match d_type {
            libc::DT_DIR => Self::Directory,
            libc::DT_REG => Self::RegularFile,
            libc::DT_BLK => Self::BlockDevice,
            libc::DT_CHR => Self::CharDevice,
            libc::DT_FIFO => Self::Fifo,
            libc::DT_LNK => Self::Symlink,
            libc::DT_SOCK => Self::Socket,
            DT_WHT => Self::Whiteout,
            _ => Self::Unknown,
        }
    }

    /// Converts a `st_mode` to a `FileKind`.
    #[must_use]
    #[inline]
    pub(crate) const fn from_mode(mode: libc::mode_t) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFREG => Self::RegularFile,
            libc::S_IFDIR => Self::Directory,
            libc::S_IFBLK => Self::BlockDevice,
            libc::S_IFCHR => Self::CharDevice,
            libc::S_IFIFO => Self::Fifo,
            libc::S_IFLNK => Self::Symlink,
            libc::S_IFSOCK => Self::Socket,
            #[cfg(any(target_os = "solaris", target_os = "illumos"))]
            libc::S_IFDOOR => Self::Door,
            #[cfg(any(target_os = "solaris", target_os = "illumos"))]
            libc::S_IFPORT => Self::Port,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    #[inline]
    pub const fn is_dir(self) -> bool {
        matches!(self, Self::Directory)
    }
}

impl core::fmt::Display for FileKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::BlockDevice => write!(f, "block device"),
            Self::CharDevice => write!(f, "character device"),
            Self::Directory => write!(f, "directory"),
            Self::Door => write!(f, "door"),
            Self::Fifo => write!(f, "FIFO"),
            Self::Symlink => write!(f, "symlink"),
            Self::Port => write!(f, "event port"),
            Self::RegularFile => write!(f, "regular file"),
            Self::Socket => write!(f, "socket"),
            Self::Whiteout => write!(f, "whiteout"),
            Self::Error => write!(f, "error"),
        }
    }
}
