//! The traversal state machine: pop, open, read, visit, close, collect.
//!
//! A single main thread owns every structure here. The I/O queue's workers
//! only ever touch a file between `detach_for_io` and the completion being
//! drained, and the signal hook only touches an atomic flag, so no other
//! locking exists.

use core::cell::Cell;
use std::ffi::CString;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, trace};

use crate::error::{Errno, Result, WalkError};
use crate::fs::{self, Dir, FileKind, StatFlag};
use crate::ioq::{IoOp, IoOut, Ioq};
use crate::signal;
use crate::util::{Arena, NamePool};
use crate::walk::cache::FdCache;
use crate::walk::file::{FileId, FileRecord, alloc_file};
use crate::walk::queue::{Peek, Queue, QueueFlags};
use crate::walk::{Action, Entry, MountTable, Strategy, Visit, WalkBuilder, WalkFlags};

/// Runs one complete traversal with the builder's own strategy and flags.
pub(crate) fn walk_once(
    builder: &WalkBuilder,
    callback: &mut dyn FnMut(&Entry<'_>) -> Action,
) -> Result<()> {
    walk_pass(builder, builder.walk_strategy(), builder.walk_flags(), callback)
}

/// Runs one traversal pass. The deepening strategies drive this repeatedly
/// with their own strategy/flag overrides.
pub(crate) fn walk_pass(
    builder: &WalkBuilder,
    strategy: Strategy,
    flags: WalkFlags,
    callback: &mut dyn FnMut(&Entry<'_>) -> Action,
) -> Result<()> {
    let mut state = WalkState::new(builder, strategy, flags, callback);

    for path in builder.paths() {
        if state.quit {
            break;
        }
        state.visit_root(path);
    }
    // starting paths keep their argument order even under SORT; sorting is
    // a sibling guarantee
    state.dirq.flush(&mut state.arena);
    state.fileq.flush(&mut state.arena);
    state.main_loop();
    state.finish();

    for hook in state.hooks.drain(..) {
        signal::unhook(hook);
    }
    match state.error.take() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

struct WalkState<'a> {
    flags: WalkFlags,
    strategy: Strategy,
    callback: &'a mut dyn FnMut(&Entry<'_>) -> Action,
    mtab: Option<&'a dyn MountTable>,

    arena: Arena<FileRecord>,
    names: NamePool,
    cache: FdCache,
    ioq: Option<Ioq>,
    dirq: Queue,
    fileq: Queue,

    /// The reconstructed path of the file being visited.
    path: Vec<u8>,
    /// The directory currently being read.
    current: Option<FileId>,
    /// Cursor for incremental path building.
    previous: Option<FileId>,

    /// A pending open/read error for the current directory.
    direrror: Option<Errno>,
    /// First unrecovered traversal error.
    error: Option<WalkError>,
    quit: bool,

    interrupted: Arc<AtomicBool>,
    hooks: Vec<signal::SigHook>,
}

impl<'a> WalkState<'a> {
    fn new(
        builder: &'a WalkBuilder,
        strategy: Strategy,
        flags: WalkFlags,
        callback: &'a mut dyn FnMut(&Entry<'_>) -> Action,
    ) -> Self {
        let nthreads = builder.walk_nthreads();
        let mut qflags = QueueFlags::BUFFER;
        if matches!(strategy, Strategy::Dfs) {
            qflags |= QueueFlags::LIFO;
        }
        if flags.contains(WalkFlags::SORT) {
            qflags |= QueueFlags::ORDER;
        }
        if nthreads == 1 {
            qflags |= QueueFlags::BALANCE;
        }

        let interrupted = Arc::new(AtomicBool::new(false));
        let mut hooks = Vec::new();
        for sig in [libc::SIGINT, libc::SIGQUIT, libc::SIGTERM] {
            let flag = Arc::clone(&interrupted);
            if let Ok(hook) = signal::on_signal(sig, move |_| flag.store(true, Ordering::Relaxed)) {
                hooks.push(hook);
            }
        }

        debug!(
            "walk: strategy={strategy:?} flags={flags:?} nopenfd={} nthreads={nthreads}",
            builder.walk_nopenfd()
        );

        Self {
            flags,
            strategy,
            callback,
            mtab: builder.walk_mtab(),
            arena: Arena::new(),
            names: NamePool::new(),
            cache: FdCache::new(builder.walk_nopenfd()),
            ioq: Ioq::new(nthreads),
            dirq: Queue::new(qflags),
            fileq: Queue::new(qflags),
            path: Vec::new(),
            current: None,
            previous: None,
            direrror: None,
            error: None,
            quit: false,
            interrupted,
            hooks,
        }
    }

    /// True once the walk should stop; latches a pending signal into the
    /// walk error. Checked before every callback, so no visit is delivered
    /// after a `Stop` or an interrupt.
    fn check_interrupt(&mut self) -> bool {
        if !self.quit && self.interrupted.load(Ordering::Relaxed) {
            self.quit = true;
            if self.error.is_none() {
                self.error = Some(WalkError::Interrupted);
            }
        }
        self.quit
    }

    fn record_error(&mut self, errno: Errno) {
        if self.error.is_none() {
            self.error = Some(WalkError::Os(errno));
        }
        self.quit = true;
    }

    // ---- path building -------------------------------------------------

    /// Rebuilds `self.path` for `id`, overwriting only the suffix that
    /// differs from the previously built path. Amortised O(1) bytes per
    /// transition on a depth-first walk.
    fn build_path(&mut self, id: FileId) {
        let arena = &self.arena;
        let names = &self.names;
        let path = &mut self.path;

        path.resize(arena[id].path_len(), 0);

        // climb the old cursor to the new file's depth
        let mut old = self.previous;
        while let Some(p) = old {
            if arena[p].depth > arena[id].depth {
                old = arena[p].parent;
            } else {
                break;
            }
        }

        // write components bottom-up until the chains converge
        let mut new = Some(id);
        while let Some(f) = new {
            if old == Some(f) {
                break;
            }
            let file = &arena[f];
            if file.sep {
                path[file.nameoff - 1] = b'/';
            }
            path[file.nameoff..file.path_len()].copy_from_slice(names.bytes(file.name));
            new = file.parent;
            if let Some(p) = old {
                if arena[p].depth >= file.depth {
                    old = arena[p].parent;
                }
            }
        }
        self.previous = Some(id);
    }

    // ---- opening -------------------------------------------------------

    fn open_fd(&self, id: FileId) -> Option<i32> {
        self.arena[id].open_fd()
    }

    fn nearest_open_ancestor(&self, id: FileId) -> Option<FileId> {
        let mut cur = self.arena[id].parent;
        while let Some(c) = cur {
            if self.arena[c].open_fd().is_some() {
                return Some(c);
            }
            cur = self.arena[c].parent;
        }
        None
    }

    /// Joins the component names from just below `base` down to `id`.
    fn rel_suffix(&self, base: Option<FileId>, id: FileId) -> CString {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            if Some(c) == base {
                break;
            }
            parts.push(self.names.bytes(self.arena[c].name));
            cur = self.arena[c].parent;
        }

        let mut bytes = Vec::new();
        for part in parts.iter().rev() {
            if !bytes.is_empty() && bytes.last() != Some(&b'/') {
                bytes.push(b'/');
            }
            bytes.extend_from_slice(part);
        }
        // SAFETY: component names never contain NUL bytes
        unsafe { CString::from_vec_unchecked(bytes) }
    }

    /// One `openat` attempt relative to `base`, consuming a cache slot and
    /// parking the new descriptor on the LRU.
    fn try_openat(&mut self, base: Option<FileId>, id: FileId) -> core::result::Result<i32, Errno> {
        // pin first so reserve's eviction cannot close the base under us
        if let Some(b) = base {
            self.cache.pin(&mut self.arena, b);
        }
        let opened = (|| {
            self.cache.reserve(&mut self.arena)?;
            let dfd = base
                .and_then(|b| self.open_fd(b))
                .unwrap_or(libc::AT_FDCWD);
            let rel = self.rel_suffix(base, id);
            fs::openat_dir(dfd, &rel)
        })();
        if let Some(b) = base {
            self.cache.unpin(&mut self.arena, b);
        }

        let fd = opened?;
        self.cache.take_slot();
        let raw = fd.raw();
        self.arena[id].fd = fd;
        self.cache.insert(&mut self.arena, id);
        Ok(raw)
    }

    /// Opens `id` as a directory descriptor, recovering from over-long
    /// relative paths and descriptor exhaustion.
    fn open_file(&mut self, id: FileId) -> core::result::Result<i32, Errno> {
        if let Some(fd) = self.open_fd(id) {
            return Ok(fd);
        }
        let base = self.nearest_open_ancestor(id);
        match self.try_openat(base, id) {
            Ok(fd) => Ok(fd),
            Err(errno) if errno.raw() == libc::ENAMETOOLONG => self.open_stepwise(base, id),
            Err(errno) if matches!(errno.raw(), libc::EMFILE | libc::ENFILE) => {
                // our budget was optimistic; evict, retry once, and fall
                // back to a single cached descriptor from here on
                if self.cache.evict(&mut self.arena) {
                    let fd = self.try_openat(base, id)?;
                    self.cache.pin(&mut self.arena, id);
                    self.cache.pessimise(&mut self.arena);
                    self.cache.unpin(&mut self.arena, id);
                    Ok(fd)
                } else {
                    Err(errno)
                }
            }
            Err(errno) => Err(errno),
        }
    }

    /// The relative suffix blew `PATH_MAX`: open every intermediate
    /// directory one short name at a time, then the target.
    fn open_stepwise(
        &mut self,
        base: Option<FileId>,
        id: FileId,
    ) -> core::result::Result<i32, Errno> {
        let mut chain = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            if Some(c) == base {
                break;
            }
            chain.push(c);
            cur = self.arena[c].parent;
        }
        chain.reverse();

        let mut pinned = None;
        let mut last = Err(Errno(libc::ENAMETOOLONG));
        for &anc in &chain {
            let step = match self.open_fd(anc) {
                Some(fd) => Ok(fd),
                None => {
                    let anc_base = self.nearest_open_ancestor(anc);
                    self.try_openat(anc_base, anc)
                }
            };
            if let Some(p) = pinned {
                self.cache.unpin(&mut self.arena, p);
            }
            match step {
                Ok(fd) => {
                    // hold this level open while the next one opens through it
                    self.cache.pin(&mut self.arena, anc);
                    pinned = Some(anc);
                    last = Ok(fd);
                }
                Err(errno) => return Err(errno),
            }
        }
        if let Some(p) = pinned {
            self.cache.unpin(&mut self.arena, p);
        }
        last
    }

    // ---- stat policy ---------------------------------------------------

    fn follows(&self, depth: usize) -> bool {
        self.flags.contains(WalkFlags::FOLLOW_ALL)
            || (self.flags.contains(WalkFlags::FOLLOW_ROOTS) && depth == 0)
    }

    fn stat_flag_for(&self, depth: usize) -> StatFlag {
        if self.follows(depth) {
            StatFlag::TryFollow
        } else {
            StatFlag::NoFollow
        }
    }

    /// Whether this entry must be statted before its visit: requested
    /// unconditionally, unknown dirent type, a symlink we would follow, a
    /// directory when cycle or mount policy needs its identity, or a name
    /// the mount table flags as a possible mount point.
    fn stat_needed(&self, kind: FileKind, name: &core::ffi::CStr, depth: usize) -> bool {
        self.flags.contains(WalkFlags::STAT_ALL)
            || kind == FileKind::Unknown
            || (kind == FileKind::Symlink && self.follows(depth))
            || (kind == FileKind::Directory
                && self.flags.intersects(
                    WalkFlags::DETECT_CYCLES | WalkFlags::SKIP_MOUNTS | WalkFlags::PRUNE_MOUNTS,
                ))
            || self.mtab.is_some_and(|m| m.might_be_mount(name))
    }

    // ---- cycle and mount policy ----------------------------------------

    /// Looks for `devino` among the ancestors; returns the loop offset just
    /// past the matching ancestor's name.
    fn find_cycle(&self, parent: Option<FileId>, devino: (u64, u64)) -> Option<usize> {
        let mut cur = parent;
        while let Some(c) = cur {
            let file = &self.arena[c];
            if file.devino == Some(devino) {
                return Some(file.path_len());
            }
            cur = file.parent;
        }
        None
    }

    fn crossed_mount(&self, parent: Option<FileId>, devino: Option<(u64, u64)>) -> bool {
        let (Some(parent), Some((dev, _))) = (parent, devino) else {
            return false;
        };
        match self.arena[parent].devino {
            Some((pdev, _)) => pdev != dev,
            None => false,
        }
    }

    // ---- visits --------------------------------------------------------

    /// The `(at_fd, name offset)` pair for reaching `id` relative to its
    /// deepest open ancestor.
    fn at_pair(&self, id: FileId) -> (Option<FileId>, usize) {
        let base = self.nearest_open_ancestor(id);
        let mut top = id;
        loop {
            match self.arena[top].parent {
                p if p == base => break,
                Some(p) => top = p,
                None => break,
            }
        }
        (base, self.arena[top].nameoff)
    }

    /// Visits a starting path: stat it (roots never carry a dirent type),
    /// deliver the pre-visit, and enqueue it when it turns out to be a
    /// directory the callback wants entered.
    fn visit_root(&mut self, path: &[u8]) {
        if self.check_interrupt() {
            return;
        }
        let id = alloc_file(&mut self.arena, &mut self.names, None, path, FileKind::Unknown);
        self.build_path(id);

        let flag = self.stat_flag_for(0);
        let (followed, result) = {
            let name = self.names.cstr(self.arena[id].name);
            fs::stat_at(libc::AT_FDCWD, name, flag)
        };
        self.arena[id].set_stat(followed, result);

        let mut kind = FileKind::Error;
        let mut error = None;
        match result {
            Ok(st) => {
                kind = st.kind();
                self.arena[id].devino = Some((st.dev(), st.ino()));
            }
            Err(errno) => error = Some(errno),
        }
        self.arena[id].kind = kind;

        if error.is_some() && !self.flags.contains(WalkFlags::RECOVER) {
            if let Some(errno) = error {
                self.record_error(errno);
            }
            self.gc_file(id);
            return;
        }

        let action = {
            let file = &self.arena[id];
            let (nofollow, follow) = file.stat_copies();
            let entry = Entry {
                path: &self.path,
                root_len: file.path_len(),
                name_off: 0,
                depth: 0,
                visit: Cell::new(Visit::Pre),
                kind,
                error,
                at_fd: libc::AT_FDCWD,
                at_name: self.names.cstr(file.name),
                stat_flag: flag,
                stat_nofollow: nofollow,
                stat_follow: follow,
                loopoff: None,
            };
            (self.callback)(&entry)
        };
        self.arena[id].visited = true;

        match action {
            Action::Continue if kind.is_dir() => {
                self.dirq.push(&mut self.arena, id, false);
            }
            Action::Stop => {
                self.quit = true;
                self.gc_file(id);
            }
            _ => self.gc_file(id),
        }
    }

    /// The pre-visit protocol for a fresh dirent: either defer it through
    /// the file queue (buffering for sort order, strict depth-first without
    /// workers, or an async stat) or visit it right now.
    fn handle_dirent(&mut self, parent: FileId, de: &fs::Dirent) {
        let depth = self.arena[parent].depth + 1;
        let needed = self.stat_needed(de.kind, &de.name, depth);
        let buffered = self.flags.intersects(WalkFlags::SORT | WalkFlags::BUFFER)
            || (matches!(self.strategy, Strategy::Dfs) && self.ioq.is_none())
            || (needed && self.ioq.is_some());

        if !buffered {
            self.visit_direct(parent, de);
            return;
        }

        let id = alloc_file(
            &mut self.arena,
            &mut self.names,
            Some(parent),
            de.name.to_bytes(),
            de.kind,
        );

        let mut inflight = false;
        if needed && self.fileq.balanced() {
            let can_submit = self.ioq.as_ref().is_some_and(|q| q.capacity() > 0);
            let flag = self.stat_flag_for(depth);
            if can_submit {
                if let Some(dfd) = self.open_fd(parent) {
                    self.cache.pin(&mut self.arena, parent);
                    self.arena[id].pending_base = Some(parent);
                    if let Some(ioq) = &mut self.ioq {
                        ioq.submit(Some(id), IoOp::Stat { dfd, name: de.name.clone(), flag });
                    }
                    inflight = true;
                }
            }
        }
        self.fileq.push(&mut self.arena, id, inflight);
    }

    /// Visits a dirent straight off the parent's stream. A directory gets
    /// its record allocated before the callback runs, so a `Prune` verdict
    /// collects (and post-visits) exactly like a buffered visit would; no
    /// other kind ever needs a record here.
    fn visit_direct(&mut self, parent: FileId, de: &fs::Dirent) {
        if self.check_interrupt() {
            return;
        }
        let parent_len = self.arena[parent].path_len();
        self.path.truncate(parent_len);
        let sep = self.path.last() != Some(&b'/');
        if sep {
            self.path.push(b'/');
        }
        self.path.extend_from_slice(de.name.to_bytes());
        let name_off = parent_len + usize::from(sep);

        let depth = self.arena[parent].depth + 1;
        let flag = self.stat_flag_for(depth);
        let mut kind = de.kind;
        let mut error = None;
        let mut devino = None;
        let mut stat_nofollow = None;
        let mut stat_follow = None;

        if self.stat_needed(kind, &de.name, depth) {
            let dfd = self.open_fd(parent).unwrap_or(libc::AT_FDCWD);
            let (followed, result) = fs::stat_at(dfd, &de.name, flag);
            match result {
                Ok(st) => {
                    kind = st.kind();
                    devino = Some((st.dev(), st.ino()));
                }
                Err(errno) => {
                    kind = FileKind::Error;
                    error = Some(errno);
                }
            }
            if followed {
                stat_follow = Some(result);
            } else {
                stat_nofollow = Some(result);
            }
        }

        let mut loopoff = None;
        if error.is_none() && kind.is_dir() && self.flags.contains(WalkFlags::DETECT_CYCLES) {
            if let Some(di) = devino {
                if let Some(off) = self.find_cycle(Some(parent), di) {
                    kind = FileKind::Error;
                    error = Some(Errno(libc::ELOOP));
                    loopoff = Some(off);
                }
            }
        }

        let crossed = self.crossed_mount(Some(parent), devino);
        if error.is_none()
            && kind.is_dir()
            && crossed
            && self.flags.contains(WalkFlags::PRUNE_MOUNTS)
        {
            self.path.truncate(parent_len);
            return;
        }

        if error.is_some() && !self.flags.contains(WalkFlags::RECOVER) {
            if let Some(errno) = error {
                self.record_error(errno);
            }
            self.path.truncate(parent_len);
            return;
        }

        // allocate ahead of the callback, so Prune and Stop collect the
        // directory through the same path a buffered visit takes
        let record = if kind.is_dir() {
            let id = alloc_file(
                &mut self.arena,
                &mut self.names,
                Some(parent),
                de.name.to_bytes(),
                kind,
            );
            self.arena[id].devino = devino;
            if let Some(result) = stat_nofollow {
                self.arena[id].set_stat(false, result);
            }
            if let Some(result) = stat_follow {
                self.arena[id].set_stat(true, result);
            }
            Some(id)
        } else {
            None
        };

        let at_fd = self.open_fd(parent).unwrap_or(libc::AT_FDCWD);
        let action = {
            let root = self.arena[parent].root;
            let entry = Entry {
                path: &self.path,
                root_len: self.arena[root].path_len(),
                name_off,
                depth,
                visit: Cell::new(Visit::Pre),
                kind,
                error,
                at_fd,
                at_name: de.name.as_c_str(),
                stat_flag: flag,
                stat_nofollow,
                stat_follow,
                loopoff,
            };
            (self.callback)(&entry)
        };
        if let Some(id) = record {
            self.arena[id].visited = true;
        }

        match (action, record) {
            (Action::Continue, Some(id))
                if !(crossed && self.flags.contains(WalkFlags::SKIP_MOUNTS)) =>
            {
                self.dirq.push(&mut self.arena, id, false);
            }
            (Action::Stop, record) => {
                self.quit = true;
                if let Some(id) = record {
                    self.gc_file(id);
                }
            }
            (_, Some(id)) => self.gc_file(id),
            (_, None) => {}
        }
        self.path.truncate(parent_len);
    }

    /// Visits a file popped from the file queue, completing a deferred stat
    /// if its async dispatch never happened or failed to land.
    fn visit_queued(&mut self, id: FileId) {
        if self.check_interrupt() {
            self.gc_file(id);
            return;
        }
        self.build_path(id);

        let depth = self.arena[id].depth;
        let follow = self.follows(depth);
        let flag = self.stat_flag_for(depth);

        let needed = {
            let file = &self.arena[id];
            let name = self.names.cstr(file.name);
            self.stat_needed(file.kind, name, depth)
        };
        let cached = {
            let file = &self.arena[id];
            file.stat_slot(false).is_some() || file.stat_slot(true).is_some()
        };
        if needed && !cached {
            let (base, off) = self.at_pair(id);
            let dfd = base
                .and_then(|b| self.open_fd(b))
                .unwrap_or(libc::AT_FDCWD);
            // SAFETY: path bytes never contain NULs
            let rel = unsafe { CString::from_vec_unchecked(self.path[off..].to_vec()) };
            let (followed, result) = fs::stat_at(dfd, &rel, flag);
            self.arena[id].set_stat(followed, result);
            self.fileq.rebalance(false);
        }

        let (mut kind, mut error, devino) = {
            let file = &self.arena[id];
            let effective = if follow {
                file.stat_slot(true).or(file.stat_slot(false))
            } else {
                file.stat_slot(false)
            };
            match effective {
                Some(Ok(st)) => (st.kind(), None, Some((st.dev(), st.ino()))),
                Some(Err(errno)) => (FileKind::Error, Some(*errno), None),
                None => (file.kind, None, None),
            }
        };
        self.arena[id].devino = devino;

        let mut loopoff = None;
        if error.is_none() && kind.is_dir() && self.flags.contains(WalkFlags::DETECT_CYCLES) {
            if let Some(di) = devino {
                if let Some(off) = self.find_cycle(self.arena[id].parent, di) {
                    kind = FileKind::Error;
                    error = Some(Errno(libc::ELOOP));
                    loopoff = Some(off);
                }
            }
        }

        let crossed = self.crossed_mount(self.arena[id].parent, devino);
        if error.is_none()
            && kind.is_dir()
            && crossed
            && self.flags.contains(WalkFlags::PRUNE_MOUNTS)
        {
            self.gc_file(id);
            return;
        }

        if error.is_some() && !self.flags.contains(WalkFlags::RECOVER) {
            if let Some(errno) = error {
                self.record_error(errno);
            }
            self.gc_file(id);
            return;
        }

        self.arena[id].kind = kind;
        let (at_base, at_off) = self.at_pair(id);
        // SAFETY: path bytes never contain NULs
        let at_name = unsafe { CString::from_vec_unchecked(self.path[at_off..].to_vec()) };
        let at_fd = at_base
            .and_then(|b| self.open_fd(b))
            .unwrap_or(libc::AT_FDCWD);

        let action = {
            let file = &self.arena[id];
            let (nofollow, follow_stat) = file.stat_copies();
            let entry = Entry {
                path: &self.path,
                root_len: self.arena[file.root].path_len(),
                name_off: file.nameoff,
                depth,
                visit: Cell::new(Visit::Pre),
                kind,
                error,
                at_fd,
                at_name: at_name.as_c_str(),
                stat_flag: flag,
                stat_nofollow: nofollow,
                stat_follow: follow_stat,
                loopoff,
            };
            (self.callback)(&entry)
        };
        self.arena[id].visited = true;

        match action {
            Action::Continue
                if kind.is_dir() && !(crossed && self.flags.contains(WalkFlags::SKIP_MOUNTS)) =>
            {
                self.dirq.push(&mut self.arena, id, false);
            }
            Action::Stop => {
                self.quit = true;
                self.gc_file(id);
            }
            _ => self.gc_file(id),
        }
    }

    /// Forwards a directory open/read failure to the callback as an
    /// error-typed visit.
    fn visit_error(&mut self, id: FileId, errno: Errno) {
        if self.check_interrupt() {
            return;
        }
        self.build_path(id);
        let (at_base, at_off) = self.at_pair(id);
        // SAFETY: path bytes never contain NULs
        let at_name = unsafe { CString::from_vec_unchecked(self.path[at_off..].to_vec()) };
        let at_fd = at_base
            .and_then(|b| self.open_fd(b))
            .unwrap_or(libc::AT_FDCWD);

        let action = {
            let file = &self.arena[id];
            let (nofollow, follow) = file.stat_copies();
            let entry = Entry {
                path: &self.path,
                root_len: self.arena[file.root].path_len(),
                name_off: file.nameoff,
                depth: file.depth,
                visit: Cell::new(Visit::Pre),
                kind: FileKind::Error,
                error: Some(errno),
                at_fd,
                at_name: at_name.as_c_str(),
                stat_flag: self.stat_flag_for(file.depth),
                stat_nofollow: nofollow,
                stat_follow: follow,
                loopoff: None,
            };
            (self.callback)(&entry)
        };
        if matches!(action, Action::Stop) {
            self.quit = true;
        }
    }

    /// Delivers the post-order visit for a dying record.
    fn visit_post(&mut self, id: FileId) {
        if self.check_interrupt() {
            return;
        }
        self.build_path(id);
        let (at_base, at_off) = self.at_pair(id);
        // SAFETY: path bytes never contain NULs
        let at_name = unsafe { CString::from_vec_unchecked(self.path[at_off..].to_vec()) };
        let at_fd = at_base
            .and_then(|b| self.open_fd(b))
            .unwrap_or(libc::AT_FDCWD);

        let action = {
            let file = &self.arena[id];
            let (nofollow, follow) = file.stat_copies();
            let entry = Entry {
                path: &self.path,
                root_len: self.arena[file.root].path_len(),
                name_off: file.nameoff,
                depth: file.depth,
                visit: Cell::new(Visit::Post),
                kind: file.kind,
                error: None,
                at_fd,
                at_name: at_name.as_c_str(),
                stat_flag: self.stat_flag_for(file.depth),
                stat_nofollow: nofollow,
                stat_follow: follow,
                loopoff: None,
            };
            (self.callback)(&entry)
        };
        // Prune means nothing on the way out; Stop still wins
        if matches!(action, Action::Stop) {
            self.quit = true;
        }
    }

    // ---- reading and collection ----------------------------------------

    /// Opens (if necessary) and reads one directory, visiting every entry,
    /// then garbage-collects it and flushes the batched children.
    fn read_dir(&mut self, id: FileId) {
        self.current = Some(id);
        trace!("read_dir depth={} refs={}", self.arena[id].depth, self.arena[id].refcount);

        if !self.check_interrupt() && self.arena[id].dir.is_none() {
            let retryable = match self.arena[id].open_err.take() {
                Some(errno) if errno.raw() == libc::ECANCELED => {
                    self.direrror = Some(errno);
                    false
                }
                // an async failure gets one synchronous retry: that is what
                // recovers ENAMETOOLONG and transient descriptor pressure
                Some(_) | None => true,
            };
            if retryable {
                match self.open_file(id) {
                    Ok(_) => {
                        self.cache.forget(&mut self.arena, id);
                        let fd = self.arena[id].fd.take();
                        match Dir::from_fd(fd, self.flags.contains(WalkFlags::WHITEOUTS)) {
                            Ok(dir) => {
                                self.arena[id].dir = Some(dir);
                                self.cache.pin(&mut self.arena, id);
                            }
                            Err((errno, stale)) => {
                                drop(stale);
                                self.cache.give_slot();
                                self.direrror = Some(errno);
                            }
                        }
                    }
                    Err(errno) => self.direrror = Some(errno),
                }
            }
        }

        self.build_path(id);
        if let Some(mut dir) = self.arena[id].dir.take() {
            loop {
                if self.quit {
                    break;
                }
                match dir.read() {
                    Ok(Some(de)) => self.handle_dirent(id, &de),
                    Ok(None) => break,
                    Err(errno) => {
                        self.direrror = Some(errno);
                        break;
                    }
                }
            }
            self.arena[id].dir = Some(dir);
        }

        self.gc_dir(id);
        self.flush_queues();
    }

    /// Leaves the current directory: unpin, unwrap or close the stream,
    /// surface any pending read error, and collapse reference counts.
    fn gc_dir(&mut self, id: FileId) {
        if self.arena[id].dir.is_some() {
            self.cache.unpin(&mut self.arena, id);
            if self.arena[id].refcount > 1 {
                // descendants are still alive; keep the bare fd warm as an
                // openat base. In-flight child stats still hold pins on us,
                // and their ops reference this descriptor, so only unwrap
                // once the last pin is gone.
                if self.arena[id].pincount == 0 {
                    if let Some(dir) = self.arena[id].dir.take() {
                        self.arena[id].fd = dir.into_fd();
                    }
                }
            } else {
                self.cache.forget(&mut self.arena, id);
                if let Some(dir) = self.arena[id].dir.take() {
                    self.close_dir_async(dir);
                }
            }
        }

        if let Some(errno) = self.direrror.take() {
            if self.flags.contains(WalkFlags::RECOVER) {
                self.visit_error(id, errno);
            } else {
                self.record_error(errno);
            }
        }

        self.gc_file(id);
        self.current = None;
    }

    fn close_dir_async(&mut self, dir: Dir) {
        match &mut self.ioq {
            Some(ioq) if ioq.capacity() > 0 => ioq.submit(None, IoOp::CloseDir { dir }),
            _ => {
                let _ = dir.close();
                self.cache.give_slot();
            }
        }
    }

    /// Walks up the parent chain dropping references. Every record whose
    /// count reaches zero gets its post-order visit, loses its descriptor,
    /// and is freed.
    fn gc_file(&mut self, start: FileId) {
        let mut cur = Some(start);
        while let Some(id) = cur {
            {
                let file = &mut self.arena[id];
                file.refcount -= 1;
                if file.refcount > 0 {
                    break;
                }
            }

            // post-order visits are for directories whose pre-visit was
            // delivered; a buffered plain file's record is bookkeeping, and
            // a record collected without a visit (mount-pruned, torn down
            // early) must not surface a bare Post
            if self.flags.contains(WalkFlags::POST_ORDER)
                && !self.quit
                && self.arena[id].kind.is_dir()
                && self.arena[id].visited
            {
                self.visit_post(id);
            }

            let parent = self.arena[id].parent;
            if self.previous == Some(id) {
                self.previous = parent;
            }

            debug_assert!(self.arena[id].pincount == 0, "freeing a pinned record");
            self.cache.forget(&mut self.arena, id);
            if let Some(dir) = self.arena[id].dir.take() {
                let _ = dir.close();
                self.cache.give_slot();
            } else {
                let fd = self.arena[id].fd.take();
                if fd.is_open() {
                    self.close_fd_async(fd);
                }
            }

            let name = self.arena[id].name;
            self.names.free(name);
            self.arena.free(id);
            cur = parent;
        }
    }

    fn close_fd_async(&mut self, fd: crate::fs::FileDes) {
        match &mut self.ioq {
            Some(ioq) if ioq.capacity() > 0 => ioq.submit(None, IoOp::Close { fd }),
            _ => {
                drop(fd);
                self.cache.give_slot();
            }
        }
    }

    // ---- scheduling ----------------------------------------------------

    /// Pipelines async opendir work for waiting directories, within the fd
    /// budget, the I/O queue's depth, and the sync/async balance.
    fn dispatch_opens(&mut self) {
        loop {
            let can_submit = self.ioq.as_ref().is_some_and(|q| q.capacity() > 0);
            if !can_submit || !self.dirq.balanced() {
                break;
            }
            let Some(id) = self.dirq.next_dispatch(&self.arena) else {
                break;
            };
            if self.arena[id].open_fd().is_some() {
                // already open; it will pop soon enough
                break;
            }
            if self.cache.free_slots() == 0 && self.cache.reserve(&mut self.arena).is_err() {
                break;
            }

            let base = self.nearest_open_ancestor(id);
            let rel = self.rel_suffix(base, id);
            self.cache.take_slot();
            if let Some(b) = base {
                self.cache.pin(&mut self.arena, b);
            }
            self.arena[id].pending_base = base;
            let dfd = base
                .and_then(|b| self.open_fd(b))
                .unwrap_or(libc::AT_FDCWD);
            self.dirq.detach_for_io(&mut self.arena, id);
            if let Some(ioq) = &mut self.ioq {
                ioq.submit(
                    Some(id),
                    IoOp::OpenDir {
                        dfd,
                        name: rel,
                        whiteouts: self.flags.contains(WalkFlags::WHITEOUTS),
                    },
                );
            }
        }
    }

    /// Routes completions back to their queues. With `block` set, waits for
    /// the first one.
    fn drain_completions(&mut self, block: bool) {
        let mut block = block;
        loop {
            let result = match &mut self.ioq {
                Some(ioq) => ioq.pop(block),
                None => None,
            };
            let Some(result) = result else { break };
            block = false;

            match result.out {
                IoOut::Close => self.cache.give_slot(),
                IoOut::OpenDir(outcome) => {
                    let Some(id) = result.cookie else { continue };
                    if let Some(b) = self.arena[id].pending_base.take() {
                        self.cache.unpin(&mut self.arena, b);
                    }
                    match outcome {
                        Ok(dir) => {
                            self.arena[id].dir = Some(dir);
                            self.cache.pin(&mut self.arena, id);
                        }
                        Err(errno) => {
                            self.cache.give_slot();
                            self.arena[id].open_err = Some(errno);
                        }
                    }
                    self.dirq.attach(&mut self.arena, id);
                }
                IoOut::Stat { followed, result: outcome } => {
                    let Some(id) = result.cookie else { continue };
                    if let Some(b) = self.arena[id].pending_base.take() {
                        self.cache.unpin(&mut self.arena, b);
                    }
                    self.arena[id].set_stat(followed, outcome);
                    self.fileq.attach(&mut self.arena, id);
                }
            }
        }
    }

    fn flush_queues(&mut self) {
        if self.flags.contains(WalkFlags::SORT) {
            self.dirq.sort_buffer(&mut self.arena, &self.names);
            self.fileq.sort_buffer(&mut self.arena, &self.names);
        }
        self.dirq.flush(&mut self.arena);
        self.fileq.flush(&mut self.arena);
    }

    /// The scheduler: directories first, deferred file visits second,
    /// blocking on the I/O queue only when nothing else can make progress.
    fn main_loop(&mut self) {
        while !self.quit {
            self.drain_completions(false);
            self.dispatch_opens();

            match self.dirq.peek(&self.arena) {
                Peek::Ready(_) => {
                    if let Some(id) = self.dirq.take_ready(&mut self.arena) {
                        self.read_dir(id);
                    }
                    continue;
                }
                Peek::Waiting(_) => {
                    let ioq_idle = self.ioq.as_ref().is_none_or(|q| q.in_flight() == 0);
                    if self.dirq.balanced() || ioq_idle {
                        if let Some(id) = self.dirq.take_waiting(&mut self.arena) {
                            self.dirq.rebalance(false);
                            self.read_dir(id);
                        }
                        continue;
                    }
                }
                Peek::Unflushed => {
                    self.flush_queues();
                    continue;
                }
                Peek::Inflight | Peek::Empty => {}
            }

            match self.fileq.peek(&self.arena) {
                Peek::Ready(_) => {
                    if let Some(id) = self.fileq.take_ready(&mut self.arena) {
                        self.visit_queued(id);
                    }
                    continue;
                }
                Peek::Waiting(_) => {
                    if let Some(id) = self.fileq.take_waiting(&mut self.arena) {
                        self.visit_queued(id);
                    }
                    continue;
                }
                Peek::Unflushed => {
                    self.flush_queues();
                    continue;
                }
                Peek::Inflight | Peek::Empty => {}
            }

            if self.dirq.is_drained() && self.fileq.is_drained() {
                break;
            }
            let inflight = self.ioq.as_ref().map_or(0, Ioq::in_flight);
            if inflight > 0 {
                self.drain_completions(true);
            } else {
                break;
            }
        }
    }

    /// Tears the walk down: cancel outstanding I/O, drain it, and collect
    /// every record still queued. Runs on clean completion too, where it
    /// finds nothing to do.
    fn finish(&mut self) {
        if let Some(ioq) = &self.ioq {
            ioq.cancel();
        }
        loop {
            let inflight = self.ioq.as_ref().map_or(0, Ioq::in_flight);
            if inflight == 0 {
                break;
            }
            self.drain_completions(true);
        }

        debug_assert!(self.current.is_none(), "finish during a directory read");
        let mut leftovers = self.dirq.drain_all(&mut self.arena);
        leftovers.extend(self.fileq.drain_all(&mut self.arena));
        for id in leftovers {
            if self.arena[id].pincount > 0 {
                // async-opened directories are pinned until read; they
                // never will be now
                self.cache.unpin(&mut self.arena, id);
            }
            self.gc_file(id);
        }
        debug_assert_eq!(self.arena.live(), 0, "records leaked past finish");
    }
}
