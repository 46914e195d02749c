//! The traversal engine's public surface: flags, the visit record handed to
//! callbacks, and the [`WalkBuilder`] entry point.

mod cache;
mod deepen;
mod file;
mod queue;
mod state;

use core::cell::Cell;
use core::ffi::CStr;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt as _;
use std::path::Path;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::{Errno, Result, WalkError};
use crate::fs::{FileKind, FileStat, StatFlag};

bitflags! {
    /// Behaviour switches for a walk.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WalkFlags: u32 {
        /// Stat every file, not just the ones the engine needs.
        const STAT_ALL = 1 << 0;
        /// Report OS errors to the callback as `FileKind::Error` visits
        /// instead of aborting the walk.
        const RECOVER = 1 << 1;
        /// Check every directory against its ancestors' device/inode pairs
        /// and synthesise `ELOOP` on a match.
        const DETECT_CYCLES = 1 << 2;
        /// Follow symlinks given as starting paths.
        const FOLLOW_ROOTS = 1 << 3;
        /// Follow every symlink.
        const FOLLOW_ALL = 1 << 4;
        /// Visit mount points but do not descend into them.
        const SKIP_MOUNTS = 1 << 5;
        /// Do not visit other mounts at all.
        const PRUNE_MOUNTS = 1 << 6;
        /// Deliver a `Visit::Post` callback after each directory's subtree.
        const POST_ORDER = 1 << 7;
        /// Deliver siblings in `strcoll` order.
        const SORT = 1 << 8;
        /// Defer visits through the file queue even when not required.
        const BUFFER = 1 << 9;
        /// Report BSD whiteout entries instead of skipping them.
        const WHITEOUTS = 1 << 10;
    }
}

/// Traversal orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Breadth-first.
    #[default]
    Bfs,
    /// Depth-first.
    Dfs,
    /// Iterative deepening: repeated passes with the depth limit raised by
    /// one.
    Ids,
    /// Exponential deepening: repeated passes with the depth limit doubled.
    Eds,
}

/// Which side of a directory's subtree a visit is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Pre,
    Post,
}

/// Callback verdict for a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep going; descend into a directory.
    Continue,
    /// Skip this directory's subtree. Ignored on `Visit::Post`.
    Prune,
    /// Abort the whole walk.
    Stop,
}

/// Mount-table capability: answers whether a directory entry might sit on a
/// mount boundary and therefore needs a real `stat` to get its type right.
pub trait MountTable: Send + Sync {
    fn might_be_mount(&self, name: &CStr) -> bool;
}

/// Everything the callback learns about one visit. All borrows end with the
/// callback; copy anything that needs to outlive it.
pub struct Entry<'w> {
    pub(crate) path: &'w [u8],
    pub(crate) root_len: usize,
    pub(crate) name_off: usize,
    pub(crate) depth: usize,
    pub(crate) visit: Cell<Visit>,
    pub(crate) kind: FileKind,
    pub(crate) error: Option<Errno>,
    pub(crate) at_fd: i32,
    pub(crate) at_name: &'w CStr,
    pub(crate) stat_flag: StatFlag,
    pub(crate) stat_nofollow: Option<core::result::Result<FileStat, Errno>>,
    pub(crate) stat_follow: Option<core::result::Result<FileStat, Errno>>,
    /// For `ELOOP` visits, where in `path` the matching ancestor ends.
    pub(crate) loopoff: Option<usize>,
}

impl Entry<'_> {
    /// The full path, as raw bytes.
    #[must_use]
    #[inline]
    pub const fn path_bytes(&self) -> &[u8] {
        self.path
    }

    #[must_use]
    #[inline]
    pub fn path(&self) -> &Path {
        Path::new(OsStr::from_bytes(self.path))
    }

    /// The starting path this file was found beneath.
    #[must_use]
    #[inline]
    pub fn root(&self) -> &[u8] {
        &self.path[..self.root_len]
    }

    /// The file's own name within [`path_bytes`](Self::path_bytes).
    #[must_use]
    #[inline]
    pub fn name(&self) -> &[u8] {
        &self.path[self.name_off..]
    }

    /// Depth below the starting path; roots are 0.
    #[must_use]
    #[inline]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    #[inline]
    pub fn visit(&self) -> Visit {
        self.visit.get()
    }

    #[must_use]
    #[inline]
    pub const fn kind(&self) -> FileKind {
        self.kind
    }

    /// The OS error for `FileKind::Error` visits.
    #[must_use]
    #[inline]
    pub const fn error(&self) -> Option<Errno> {
        self.error
    }

    /// A directory fd / relative path pair usable with `openat`-style
    /// syscalls to reach this file without rebuilding the full path.
    #[must_use]
    #[inline]
    pub const fn at(&self) -> (i32, &CStr) {
        (self.at_fd, self.at_name)
    }

    /// How the engine would stat this file, honouring the follow flags.
    #[must_use]
    #[inline]
    pub const fn stat_flag(&self) -> StatFlag {
        self.stat_flag
    }

    /// The cached stat for this visit's follow policy, if one was taken.
    /// At most one stat per file is ever issued; repeated calls see the
    /// same cached buffer.
    #[must_use]
    pub fn stat(&self) -> Option<&FileStat> {
        let slot = match self.stat_flag {
            StatFlag::NoFollow => self.stat_nofollow.as_ref(),
            _ => self.stat_follow.as_ref().or(self.stat_nofollow.as_ref()),
        };
        slot.and_then(|result| result.as_ref().ok())
    }

    /// The cached no-follow stat, if one was taken.
    #[must_use]
    pub fn stat_nofollow(&self) -> Option<&FileStat> {
        self.stat_nofollow
            .as_ref()
            .and_then(|result| result.as_ref().ok())
    }

    /// For cycle errors, the offset in `path` just past the ancestor whose
    /// device/inode pair matched.
    #[must_use]
    #[inline]
    pub const fn loopoff(&self) -> Option<usize> {
        self.loopoff
    }
}

/// Builds and runs a traversal.
///
/// Mirrors the usual builder shape: construct with the starting paths, chain
/// the options, then [`run`](Self::run) with a callback.
#[must_use]
pub struct WalkBuilder {
    paths: Vec<Vec<u8>>,
    flags: WalkFlags,
    strategy: Strategy,
    nopenfd: usize,
    nthreads: usize,
    mtab: Option<Arc<dyn MountTable>>,
}

impl WalkBuilder {
    /// Creates a builder over one or more starting paths.
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<OsStr>,
    {
        let nthreads = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            paths: paths
                .into_iter()
                .map(|p| p.as_ref().as_bytes().to_vec())
                .collect(),
            flags: WalkFlags::empty(),
            strategy: Strategy::Bfs,
            nopenfd: 256,
            nthreads: nthreads.min(8),
            mtab: None,
        }
    }

    /// Replaces the flag set.
    pub const fn flags(mut self, flags: WalkFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Adds to the flag set.
    pub fn flag(mut self, flag: WalkFlags) -> Self {
        self.flags |= flag;
        self
    }

    pub const fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Caps the open directory descriptors the walk may hold. Clamped to a
    /// minimum of 2: one to read from, one to open children through.
    pub fn open_files(mut self, nopenfd: usize) -> Self {
        self.nopenfd = nopenfd.max(2);
        self
    }

    /// Number of I/O worker threads; 0 runs every syscall on the calling
    /// thread.
    pub const fn threads(mut self, nthreads: usize) -> Self {
        self.nthreads = nthreads;
        self
    }

    /// Supplies a mount table for cross-mount decisions.
    pub fn mount_table(mut self, mtab: Arc<dyn MountTable>) -> Self {
        self.mtab = Some(mtab);
        self
    }

    /// Walks the tree, invoking `callback` on every visit.
    ///
    /// Returns `Ok(())` on clean completion, including a callback `Stop`.
    /// The first unrecovered error aborts the walk and is returned; by then
    /// every descriptor and record the walk held has been released.
    ///
    /// # Errors
    /// [`WalkError::InvalidPath`] when no paths were given or one contains a
    /// NUL byte; [`WalkError::Os`] for unrecovered traversal errors;
    /// [`WalkError::Interrupted`] when a termination signal arrived.
    pub fn run<F>(self, mut callback: F) -> Result<()>
    where
        F: FnMut(&Entry<'_>) -> Action,
    {
        if self.paths.is_empty() || self.paths.iter().any(|p| p.is_empty() || p.contains(&0)) {
            return Err(WalkError::InvalidPath);
        }
        match self.strategy {
            Strategy::Bfs | Strategy::Dfs => state::walk_once(&self, &mut callback),
            Strategy::Ids | Strategy::Eds => deepen::run(&self, &mut callback),
        }
    }

    pub(crate) fn paths(&self) -> &[Vec<u8>] {
        &self.paths
    }

    pub(crate) const fn walk_flags(&self) -> WalkFlags {
        self.flags
    }

    pub(crate) const fn walk_strategy(&self) -> Strategy {
        self.strategy
    }

    pub(crate) const fn walk_nopenfd(&self) -> usize {
        self.nopenfd
    }

    pub(crate) const fn walk_nthreads(&self) -> usize {
        self.nthreads
    }

    pub(crate) fn walk_mtab(&self) -> Option<&dyn MountTable> {
        self.mtab.as_deref()
    }
}

/// Walks `paths` breadth-first with default options.
///
/// # Errors
/// See [`WalkBuilder::run`].
pub fn walk<I, P, F>(paths: I, callback: F) -> Result<()>
where
    I: IntoIterator<Item = P>,
    P: AsRef<OsStr>,
    F: FnMut(&Entry<'_>) -> Action,
{
    WalkBuilder::new(paths).run(callback)
}
