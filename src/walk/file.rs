//! One record per encountered path component.

use crate::error::Errno;
use crate::fs::{Dir, FileDes, FileKind, FileStat};
use crate::util::{Arena, DlistNode, Idx, NamePool, NameRef, SlistNode};

pub(crate) type FileId = Idx;

/// A node in the traversal tree. Owned by the walk's arena; parent edges are
/// stable arena indices. The record carries its own queue and LRU links plus
/// the reference count that drives post-order garbage collection.
pub(crate) struct FileRecord {
    pub parent: Option<FileId>,
    pub root: FileId,
    pub depth: usize,
    /// This component's name (a root's name is the whole starting path).
    pub name: NameRef,
    /// Offset of the name within the full reconstructed path.
    pub nameoff: usize,
    /// Whether a `/` separates this name from the parent's in the path.
    pub sep: bool,

    /// Incoming edges: live child records, plus one for the walk cursor
    /// while the record is queued or being read.
    pub refcount: u32,
    /// Operations currently using this file's fd as a base. Pinned files are
    /// exempt from LRU eviction.
    pub pincount: u32,

    /// Open descriptor, only while `dir` is `None`; an open stream owns the
    /// fd itself.
    pub fd: FileDes,
    pub dir: Option<Dir>,

    pub kind: FileKind,
    /// Device/inode pair for ancestor cycle checks, once known.
    pub devino: Option<(u64, u64)>,

    stat_nofollow: Option<Result<FileStat, Errno>>,
    stat_follow: Option<Result<FileStat, Errno>>,

    /// An async opendir failure, consumed when the directory is popped.
    pub open_err: Option<Errno>,
    /// Ancestor pinned as the `openat` base of an in-flight async op.
    pub pending_base: Option<FileId>,

    /// The pre-order callback has been delivered for this file. Gates the
    /// post-order visit: a record collected without ever being visited
    /// (e.g. pruned at a mount boundary) must not surface a bare `Post`.
    pub visited: bool,

    /// An I/O worker currently owns this file exclusively.
    pub ioqueued: bool,
    /// Async service is complete and the file may be popped.
    pub ready: bool,

    qnext: Option<FileId>,
    lru_prev: Option<FileId>,
    lru_next: Option<FileId>,
    pub in_lru: bool,
}

impl SlistNode for FileRecord {
    fn next(&self) -> Option<Idx> {
        self.qnext
    }
    fn set_next(&mut self, next: Option<Idx>) {
        self.qnext = next;
    }
}

impl DlistNode for FileRecord {
    fn prev(&self) -> Option<Idx> {
        self.lru_prev
    }
    fn next(&self) -> Option<Idx> {
        self.lru_next
    }
    fn set_prev(&mut self, prev: Option<Idx>) {
        self.lru_prev = prev;
    }
    fn set_next(&mut self, next: Option<Idx>) {
        self.lru_next = next;
    }
}

impl FileRecord {
    /// The open descriptor usable as an `openat` base, if any.
    pub(crate) fn open_fd(&self) -> Option<i32> {
        match &self.dir {
            Some(dir) => Some(dir.fd()),
            None => self.fd.is_open().then(|| self.fd.raw()),
        }
    }

    /// End of this file's span in the reconstructed path.
    pub(crate) fn path_len(&self) -> usize {
        self.nameoff + self.name.len()
    }

    pub(crate) fn stat_slot(&self, followed: bool) -> Option<&Result<FileStat, Errno>> {
        if followed {
            self.stat_follow.as_ref()
        } else {
            self.stat_nofollow.as_ref()
        }
    }

    pub(crate) fn set_stat(&mut self, followed: bool, result: Result<FileStat, Errno>) {
        if followed {
            self.stat_follow = Some(result);
        } else {
            self.stat_nofollow = Some(result);
        }
    }

    pub(crate) fn stat_copies(
        &self,
    ) -> (Option<Result<FileStat, Errno>>, Option<Result<FileStat, Errno>>) {
        (self.stat_nofollow, self.stat_follow)
    }
}

/// Allocates a record for `name` under `parent`, bumping the parent's
/// reference count. The new record starts with one reference: the walk
/// cursor that will eventually visit and collect it.
pub(crate) fn alloc_file(
    arena: &mut Arena<FileRecord>,
    names: &mut NamePool,
    parent: Option<FileId>,
    name: &[u8],
    kind: FileKind,
) -> FileId {
    let (depth, nameoff, sep, root) = match parent {
        Some(pid) => {
            let p = &arena[pid];
            // no separator needed after a name like "/" or "dir/"
            let sep = names.bytes(p.name).last() != Some(&b'/');
            (p.depth + 1, p.path_len() + usize::from(sep), sep, p.root)
        }
        None => (0, 0, false, FileId::PLACEHOLDER),
    };

    let name = names.alloc(name);
    let id = arena.alloc(FileRecord {
        parent,
        root,
        depth,
        name,
        nameoff,
        sep,
        refcount: 1,
        pincount: 0,
        fd: FileDes::CLOSED,
        dir: None,
        kind,
        devino: None,
        stat_nofollow: None,
        stat_follow: None,
        open_err: None,
        pending_base: None,
        visited: false,
        ioqueued: false,
        ready: false,
        qnext: None,
        lru_prev: None,
        lru_next: None,
        in_lru: false,
    });

    match parent {
        Some(pid) => arena[pid].refcount += 1,
        None => arena[id].root = id,
    }
    id
}
