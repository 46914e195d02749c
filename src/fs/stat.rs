use core::ffi::CStr;
use core::mem::MaybeUninit;

use crate::error::Errno;
use crate::fs::FileKind;

/// How to treat a symlink when statting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatFlag {
    /// `lstat` semantics: report the link itself.
    NoFollow,
    /// `stat` semantics: report the target.
    Follow,
    /// `stat`, falling back to `lstat` when the target is unreachable, so
    /// broken links still report as links.
    TryFollow,
}

/// A cached `struct stat` for one file.
#[derive(Clone, Copy)]
pub struct FileStat(libc::stat);

impl FileStat {
    #[must_use]
    #[inline]
    pub fn dev(&self) -> u64 {
        self.0.st_dev as u64
    }

    #[must_use]
    #[inline]
    pub fn ino(&self) -> u64 {
        self.0.st_ino as u64
    }

    #[must_use]
    #[inline]
    pub fn mode(&self) -> libc::mode_t {
        self.0.st_mode
    }

    #[must_use]
    #[inline]
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.0.st_mode)
    }

    #[must_use]
    #[inline]
    pub fn nlink(&self) -> u64 {
        self.0.st_nlink as u64
    }

    #[must_use]
    #[inline]
    pub fn size(&self) -> i64 {
        self.0.st_size as i64
    }

    /// The underlying `libc::stat`, for callers that need more fields.
    #[must_use]
    #[inline]
    pub const fn raw(&self) -> &libc::stat {
        &self.0
    }
}

impl core::fmt::Debug for FileStat {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileStat")
            .field("dev", &self.dev())
            .field("ino", &self.ino())
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

fn fstatat_raw(dfd: i32, name: &CStr, follow: bool) -> Result<FileStat, Errno> {
    let mut buf = MaybeUninit::<libc::stat>::uninit();
    let flags = if follow { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
    // SAFETY: name is NUL-terminated and buf is a valid stat out-pointer
    let ret = unsafe { libc::fstatat(dfd, name.as_ptr(), buf.as_mut_ptr(), flags) };
    if ret == 0 {
        // SAFETY: fstatat succeeded, so the buffer is initialised
        Ok(FileStat(unsafe { buf.assume_init() }))
    } else {
        Err(Errno::last())
    }
}

/// Stats `name` relative to `dfd` (or `AT_FDCWD`).
///
/// Returns the result together with the effective follow behaviour, so the
/// caller knows which cache slot it belongs in: `TryFollow` reports `false`
/// when it fell back to `lstat` on a broken link.
pub(crate) fn stat_at(dfd: i32, name: &CStr, flag: StatFlag) -> (bool, Result<FileStat, Errno>) {
    match flag {
        StatFlag::NoFollow => (false, fstatat_raw(dfd, name, false)),
        StatFlag::Follow => (true, fstatat_raw(dfd, name, true)),
        StatFlag::TryFollow => match fstatat_raw(dfd, name, true) {
            Ok(stat) => (true, Ok(stat)),
            Err(errno) if matches!(errno.raw(), libc::ENOENT | libc::ELOOP) => {
                (false, fstatat_raw(dfd, name, false))
            }
            Err(errno) => (true, Err(errno)),
        },
    }
}
