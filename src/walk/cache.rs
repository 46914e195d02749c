//! The LRU cache of open directory descriptors.
//!
//! The descriptor budget (`nopenfd`) is the one globally disciplined
//! resource: `capacity` counts free slots, and at every instant
//! `capacity + files holding fds (cached, pinned, or in flight) == limit`.
//! Opens debit a slot up front; closes credit it back, on completion when
//! the close runs asynchronously.

use crate::error::Errno;
use crate::util::{Arena, Dlist};
use crate::walk::file::{FileId, FileRecord};

pub(crate) struct FdCache {
    lru: Dlist,
    /// Free descriptor slots.
    capacity: usize,
    /// Total slot budget.
    limit: usize,
    /// Preferred insertion point. Root files become the target so they stay
    /// warm: a root evicted mid-walk forces every descendant open through
    /// the slow absolute-path fallback.
    target: Option<FileId>,
}

impl FdCache {
    pub(crate) const fn new(nopenfd: usize) -> Self {
        Self {
            lru: Dlist::new(),
            capacity: nopenfd,
            limit: nopenfd,
            target: None,
        }
    }

    pub(crate) const fn free_slots(&self) -> usize {
        self.capacity
    }

    /// Closes the least-recently-used unpinned descriptor, crediting its
    /// slot. Returns false when the LRU is empty (everything is pinned).
    pub(crate) fn evict(&mut self, arena: &mut Arena<FileRecord>) -> bool {
        let Some(victim) = self.lru.pop_tail(arena) else {
            return false;
        };
        let file = &mut arena[victim];
        file.in_lru = false;
        debug_assert!(file.pincount == 0, "evicting a pinned file");
        if let Some(dir) = file.dir.take() {
            let _ = dir.close();
        }
        file.fd.close();
        if self.target == Some(victim) {
            self.target = None;
        }
        self.give_slot();
        true
    }

    /// Ensures at least one free slot, evicting if necessary.
    pub(crate) fn reserve(&mut self, arena: &mut Arena<FileRecord>) -> Result<(), Errno> {
        if self.capacity > 0 || self.evict(arena) {
            Ok(())
        } else {
            Err(Errno(libc::EMFILE))
        }
    }

    /// Claims a slot for a descriptor about to be opened.
    pub(crate) fn take_slot(&mut self) {
        debug_assert!(self.capacity > 0, "slot taken past the fd budget");
        self.capacity -= 1;
    }

    /// Returns a slot after its descriptor closed.
    pub(crate) fn give_slot(&mut self) {
        self.capacity += 1;
        debug_assert!(self.capacity <= self.limit, "slot credited twice");
    }

    /// Puts an unpinned open file on the LRU, near the target. Roots become
    /// the next target.
    pub(crate) fn insert(&mut self, arena: &mut Arena<FileRecord>, id: FileId) {
        debug_assert!(!arena[id].in_lru && arena[id].pincount == 0);
        match self.target {
            Some(target) if arena[id].depth > 0 && arena.get(target).is_some_and(|t| t.in_lru) => {
                // just behind the warm roots
                self.lru.insert_after(arena, target, id);
            }
            _ => {
                let head = self.lru.head();
                self.lru.insert_before(arena, head, id);
                if arena[id].depth == 0 {
                    self.target = Some(id);
                }
            }
        }
        arena[id].in_lru = true;
    }

    /// Protects a file's descriptor from eviction and close while an
    /// operation uses it as an `openat` base.
    pub(crate) fn pin(&mut self, arena: &mut Arena<FileRecord>, id: FileId) {
        let file = &mut arena[id];
        file.pincount += 1;
        if file.in_lru {
            file.in_lru = false;
            self.lru.remove(arena, id);
            if self.target == Some(id) {
                self.target = None;
            }
        }
    }

    /// Drops one pin; the file rejoins the LRU once unpinned.
    pub(crate) fn unpin(&mut self, arena: &mut Arena<FileRecord>, id: FileId) {
        debug_assert!(arena[id].pincount > 0, "unbalanced unpin");
        arena[id].pincount -= 1;
        if arena[id].pincount == 0 && arena[id].open_fd().is_some() {
            self.insert(arena, id);
        }
    }

    /// Detaches a dying file from the LRU without touching its descriptor.
    pub(crate) fn forget(&mut self, arena: &mut Arena<FileRecord>, id: FileId) {
        if arena[id].in_lru {
            arena[id].in_lru = false;
            self.lru.remove(arena, id);
            if self.target == Some(id) {
                self.target = None;
            }
        }
    }

    /// `EMFILE` came back even though our accounting says the budget was
    /// fine: the initial cap was too optimistic for this process. Fall back
    /// to a single cached descriptor beyond whatever is currently in use.
    pub(crate) fn pessimise(&mut self, arena: &mut Arena<FileRecord>) {
        while self.evict(arena) {}
        let in_use = self.limit - self.capacity;
        self.limit = in_use + 1;
        self.capacity = 1;
    }
}
