use core::ffi::CStr;
use std::ffi::CString;

use crate::error::Errno;
use crate::fs::types::DT_WHT;
use crate::fs::{FileDes, FileKind};

/// One entry read from a directory stream. `.` and `..` are never returned.
pub(crate) struct Dirent {
    pub name: CString,
    pub ino: u64,
    pub kind: FileKind,
}

/// Opens `name` relative to `dfd` as a directory descriptor.
///
/// `O_NONBLOCK` keeps an `openat` on a FIFO-shaped oddity from hanging the
/// traversal thread.
pub(crate) fn openat_dir(dfd: i32, name: &CStr) -> Result<FileDes, Errno> {
    const FLAGS: i32 = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NONBLOCK;
    // SAFETY: name is NUL-terminated
    let fd = unsafe { libc::openat(dfd, name.as_ptr(), FLAGS) };
    if fd >= 0 {
        Ok(FileDes::new(fd))
    } else {
        Err(Errno::last())
    }
}

/// Size of the kernel buffer for batched `getdents64` reads.
#[cfg(any(target_os = "linux", target_os = "android"))]
const DIR_BUF_SIZE: usize = 8 * 4096;

#[cfg(any(target_os = "linux", target_os = "android"))]
#[repr(align(8))]
#[derive(Debug)]
struct DirBuf([u8; DIR_BUF_SIZE]);

/**
An open directory stream.

On Linux/Android this reads entries in batches with the `getdents64` system
call, which avoids the per-entry overhead of `readdir` and, crucially, leaves
us in control of the file descriptor: the fd can be kept as an `openat` base
after the stream is finished (see [`Dir::into_fd`]). Elsewhere it wraps
`fdopendir`/`readdir`.
*/
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug)]
pub(crate) struct Dir {
    fd: FileDes,
    buf: Box<DirBuf>,
    pos: usize,
    end: usize,
    whiteouts: bool,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Dir {
    pub(crate) fn open(dfd: i32, name: &CStr, whiteouts: bool) -> Result<Self, Errno> {
        Self::from_fd(openat_dir(dfd, name)?, whiteouts).map_err(|(errno, _)| errno)
    }

    /// Wraps an already-open directory descriptor. On failure the descriptor
    /// is handed back so the caller can return its cache slot.
    pub(crate) fn from_fd(fd: FileDes, whiteouts: bool) -> Result<Self, (Errno, FileDes)> {
        Ok(Self {
            fd,
            buf: Box::new(DirBuf([0; DIR_BUF_SIZE])),
            pos: 0,
            end: 0,
            whiteouts,
        })
    }

    #[inline]
    pub(crate) const fn fd(&self) -> i32 {
        self.fd.raw()
    }

    /// Releases the stream but keeps the underlying descriptor open.
    pub(crate) fn into_fd(mut self) -> FileDes {
        self.fd.take()
    }

    pub(crate) fn close(mut self) -> Result<(), Errno> {
        self.fd.close();
        Ok(())
    }

    fn fill(&mut self) -> Result<usize, Errno> {
        // SAFETY: the fd is an open directory and the buffer is valid for
        // DIR_BUF_SIZE bytes of writes
        let n = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                self.fd.raw(),
                self.buf.0.as_mut_ptr(),
                DIR_BUF_SIZE,
            )
        };
        if n < 0 {
            return Err(Errno::last());
        }
        self.pos = 0;
        self.end = n as usize;
        Ok(self.end)
    }

    /// Reads the next directory entry, or `None` at end of stream.
    pub(crate) fn read(&mut self) -> Result<Option<Dirent>, Errno> {
        loop {
            if self.pos >= self.end {
                if self.fill()? == 0 {
                    return Ok(None);
                }
            }

            // SAFETY: the kernel wrote a well-formed dirent64 at pos, and the
            // 8-aligned buffer keeps every record aligned
            let (reclen, ino, d_type, name) = unsafe {
                let rec = self.buf.0.as_ptr().add(self.pos).cast::<libc::dirent64>();
                let name_ptr = rec
                    .cast::<u8>()
                    .add(core::mem::offset_of!(libc::dirent64, d_name));
                (
                    (*rec).d_reclen as usize,
                    (*rec).d_ino,
                    (*rec).d_type,
                    CStr::from_ptr(name_ptr.cast()),
                )
            };
            self.pos += reclen;

            let bytes = name.to_bytes();
            if bytes == b"." || bytes == b".." {
                continue;
            }
            if d_type == DT_WHT && !self.whiteouts {
                continue;
            }

            return Ok(Some(Dirent {
                name: name.to_owned(),
                ino,
                kind: FileKind::from_dtype(d_type),
            }));
        }
    }
}

/// POSIX fallback over `fdopendir`/`readdir`. Like the classic interface it
/// cannot distinguish a read error from end-of-stream, so errors surface as a
/// short listing rather than a failed one.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
#[derive(Debug)]
pub(crate) struct Dir {
    dir: core::ptr::NonNull<libc::DIR>,
    fd: i32,
    whiteouts: bool,
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl Dir {
    pub(crate) fn open(dfd: i32, name: &CStr, whiteouts: bool) -> Result<Self, Errno> {
        Self::from_fd(openat_dir(dfd, name)?, whiteouts).map_err(|(errno, _)| errno)
    }

    pub(crate) fn from_fd(mut fd: FileDes, whiteouts: bool) -> Result<Self, (Errno, FileDes)> {
        // SAFETY: fd is an open directory descriptor; fdopendir takes it over
        let dir = unsafe { libc::fdopendir(fd.raw()) };
        match core::ptr::NonNull::new(dir) {
            Some(dir) => {
                let raw = fd.take().raw();
                Ok(Self { dir, fd: raw, whiteouts })
            }
            None => Err((Errno::last(), fd)),
        }
    }

    #[inline]
    pub(crate) const fn fd(&self) -> i32 {
        self.fd
    }

    pub(crate) fn into_fd(self) -> FileDes {
        // closedir tears the fd down with the stream, so keep a duplicate
        // SAFETY: self.fd is open until the closedir below
        let kept = unsafe { libc::fcntl(self.fd, libc::F_DUPFD_CLOEXEC, 0) };
        let this = core::mem::ManuallyDrop::new(self);
        unsafe { libc::closedir(this.dir.as_ptr()) };
        FileDes::new(kept)
    }

    pub(crate) fn close(self) -> Result<(), Errno> {
        let this = core::mem::ManuallyDrop::new(self);
        // SAFETY: the stream is valid and owned by us
        if unsafe { libc::closedir(this.dir.as_ptr()) } == 0 {
            Ok(())
        } else {
            Err(Errno::last())
        }
    }

    pub(crate) fn read(&mut self) -> Result<Option<Dirent>, Errno> {
        loop {
            // SAFETY: the stream is valid until close/drop
            let entry = unsafe { libc::readdir(self.dir.as_ptr()) };
            let Some(entry) = (unsafe { entry.as_ref() }) else {
                return Ok(None);
            };

            // SAFETY: d_name is NUL-terminated by the libc
            let name = unsafe { CStr::from_ptr(entry.d_name.as_ptr()) };
            let bytes = name.to_bytes();
            if bytes == b"." || bytes == b".." {
                continue;
            }
            if entry.d_type == DT_WHT && !self.whiteouts {
                continue;
            }

            return Ok(Some(Dirent {
                name: name.to_owned(),
                ino: entry.d_ino as u64,
                kind: FileKind::from_dtype(entry.d_type),
            }));
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl Drop for Dir {
    fn drop(&mut self) {
        // SAFETY: the stream is still open here
        unsafe { libc::closedir(self.dir.as_ptr()) };
    }
}

// SAFETY: the stream is owned data plus a descriptor; it is only ever used by
// one thread at a time (main thread, or the IO worker servicing its op)
unsafe impl Send for Dir {}
