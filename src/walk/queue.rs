//! The buffer / waiting / ready staging queues for files and directories.
//!
//! A file is pushed into the buffer (or straight to waiting), flushed to the
//! waiting list in batch, optionally detached for asynchronous service, and
//! finally popped from the ready list, or from the head of waiting for
//! synchronous service.
//!
//! With `ORDER` set, a file handed to the I/O queue keeps its position on
//! its stage list (marked `ioqueued`) and completions promote the ready
//! prefix, so files reach the ready list in exactly the order they joined
//! the waiting list. Without `ORDER`, a detached file is off every list and
//! owned by its worker until the completion attaches it to ready.

use core::cmp::Ordering as CmpOrdering;

use bitflags::bitflags;

use crate::util::{Arena, NamePool, Slist};
use crate::walk::file::{FileId, FileRecord};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct QueueFlags: u8 {
        /// Stage insertions in the buffer until `flush`.
        const BUFFER = 1 << 0;
        /// Prepend rather than append, for depth-first pop order.
        const LIFO = 1 << 1;
        /// Keep strict order between ready and waiting.
        const ORDER = 1 << 2;
        /// Track the sync/async imbalance counter.
        const BALANCE = 1 << 3;
    }
}

/// What the queue would hand out next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Peek {
    /// Async service is done; pop with `take_ready`.
    Ready(FileId),
    /// Needs synchronous service; pop with `take_waiting`.
    Waiting(FileId),
    /// Everything poppable is in flight on the I/O queue.
    Inflight,
    /// Only unflushed buffered files remain.
    Unflushed,
    Empty,
}

pub(crate) struct Queue {
    flags: QueueFlags,
    buffer: Slist,
    waiting: Slist,
    ready: Slist,
    /// In-flight async ops originating from this queue.
    ioqueued: usize,
    /// Sync service minus async dispatches; async dispatch pauses while
    /// negative so a lone worker cannot starve the main thread.
    imbalance: isize,
}

impl Queue {
    pub(crate) const fn new(flags: QueueFlags) -> Self {
        Self {
            flags,
            buffer: Slist::new(),
            waiting: Slist::new(),
            ready: Slist::new(),
            ioqueued: 0,
            imbalance: 0,
        }
    }

    pub(crate) const fn len(&self) -> usize {
        self.buffer.len() + self.waiting.len() + self.ready.len()
    }

    pub(crate) const fn ioqueued(&self) -> usize {
        self.ioqueued
    }

    /// Fully drained: nothing staged and nothing in flight.
    pub(crate) const fn is_drained(&self) -> bool {
        self.len() == 0 && self.ioqueued == 0
    }

    pub(crate) fn balanced(&self) -> bool {
        !self.flags.contains(QueueFlags::BALANCE) || self.imbalance >= 0
    }

    pub(crate) fn rebalance(&mut self, asynchronous: bool) {
        if self.flags.contains(QueueFlags::BALANCE) {
            if asynchronous {
                self.imbalance -= 1;
            } else {
                self.imbalance += 1;
            }
        }
    }

    /// Adds a file. With `inflight` set the file is already being serviced
    /// by an I/O worker: under `ORDER` it keeps a position on the stage
    /// list, otherwise the worker owns it outright until `attach`.
    pub(crate) fn push(&mut self, arena: &mut Arena<FileRecord>, id: FileId, inflight: bool) {
        if inflight {
            arena[id].ioqueued = true;
            self.ioqueued += 1;
            self.rebalance(true);
            if !self.flags.contains(QueueFlags::ORDER) {
                return;
            }
        }

        let stage = if self.flags.contains(QueueFlags::BUFFER) {
            &mut self.buffer
        } else {
            &mut self.waiting
        };
        if self.flags.contains(QueueFlags::LIFO) {
            stage.push_front(arena, id);
        } else {
            stage.push_back(arena, id);
        }
    }

    /// Drains the buffer into the waiting list. Under `LIFO` the batch lands
    /// at the front, reversed; the LIFO push direction means two reversals
    /// cancel and siblings pop in their buffered order.
    pub(crate) fn flush(&mut self, arena: &mut Arena<FileRecord>) {
        if self.flags.contains(QueueFlags::LIFO) {
            while let Some(id) = self.buffer.pop_front(arena) {
                self.waiting.push_front(arena, id);
            }
        } else {
            self.waiting.splice_back(arena, &mut self.buffer);
        }
        if self.flags.contains(QueueFlags::ORDER) {
            self.promote(arena);
        }
    }

    /// Stable-sorts the buffered batch by `strcoll` of the file names, so a
    /// following `flush` delivers siblings in collation order.
    pub(crate) fn sort_buffer(&mut self, arena: &mut Arena<FileRecord>, names: &NamePool) {
        if self.buffer.len() < 2 {
            return;
        }
        let mut ids = self.buffer.drain(arena);
        ids.sort_by(|&a, &b| strcoll_cmp(names, &arena[a], &arena[b]));
        if self.flags.contains(QueueFlags::LIFO) {
            // flush reverses a LIFO buffer, so store descending
            ids.reverse();
        }
        self.buffer.rebuild(arena, &ids);
    }

    /// Moves the ready prefix of the waiting list onto the ready list.
    fn promote(&mut self, arena: &mut Arena<FileRecord>) {
        while let Some(head) = self.waiting.first() {
            if !arena[head].ready {
                break;
            }
            self.waiting.pop_front(arena);
            self.ready.push_back(arena, head);
        }
    }

    /// Marks a waiting file as handed to the I/O queue. Under `ORDER` the
    /// file keeps its position; otherwise it must be the waiting head and
    /// leaves the list.
    pub(crate) fn detach_for_io(&mut self, arena: &mut Arena<FileRecord>, id: FileId) {
        if !self.flags.contains(QueueFlags::ORDER) {
            let popped = self.waiting.pop_front(arena);
            debug_assert_eq!(popped, Some(id), "detach must take the waiting head");
        }
        arena[id].ioqueued = true;
        self.ioqueued += 1;
        self.rebalance(true);
    }

    /// Records an async completion, making the file poppable.
    pub(crate) fn attach(&mut self, arena: &mut Arena<FileRecord>, id: FileId) {
        debug_assert!(arena[id].ioqueued, "attach of a file that was never detached");
        arena[id].ioqueued = false;
        arena[id].ready = true;
        self.ioqueued -= 1;
        if self.flags.contains(QueueFlags::ORDER) {
            self.promote(arena);
        } else {
            self.ready.push_back(arena, id);
        }
    }

    pub(crate) fn peek(&self, arena: &Arena<FileRecord>) -> Peek {
        if let Some(id) = self.ready.first() {
            return Peek::Ready(id);
        }
        if let Some(id) = self.waiting.first() {
            return if arena[id].ioqueued {
                Peek::Inflight
            } else {
                Peek::Waiting(id)
            };
        }
        if self.ioqueued > 0 {
            Peek::Inflight
        } else if !self.buffer.is_empty() {
            Peek::Unflushed
        } else {
            Peek::Empty
        }
    }

    pub(crate) fn take_ready(&mut self, arena: &mut Arena<FileRecord>) -> Option<FileId> {
        let id = self.ready.pop_front(arena)?;
        arena[id].ready = false;
        Some(id)
    }

    pub(crate) fn take_waiting(&mut self, arena: &mut Arena<FileRecord>) -> Option<FileId> {
        let head = self.waiting.first()?;
        if arena[head].ioqueued {
            return None;
        }
        self.waiting.pop_front(arena);
        arena[head].ready = false;
        Some(head)
    }

    /// The next waiting (or, failing that, buffered) file that could be
    /// dispatched to the I/O queue.
    pub(crate) fn next_dispatch(&self, arena: &Arena<FileRecord>) -> Option<FileId> {
        if self.flags.contains(QueueFlags::ORDER) {
            self.waiting
                .iter(arena)
                .find(|&id| !arena[id].ioqueued && !arena[id].ready)
        } else {
            self.waiting.first()
        }
    }

    /// Empties every stage for end-of-walk cleanup.
    pub(crate) fn drain_all(&mut self, arena: &mut Arena<FileRecord>) -> Vec<FileId> {
        let mut out = self.buffer.drain(arena);
        out.extend(self.waiting.drain(arena));
        out.extend(self.ready.drain(arena));
        for &id in &out {
            if arena[id].ioqueued {
                arena[id].ioqueued = false;
                self.ioqueued -= 1;
            }
            arena[id].ready = false;
        }
        out
    }
}

fn strcoll_cmp(names: &NamePool, a: &FileRecord, b: &FileRecord) -> CmpOrdering {
    // SAFETY: both names are NUL-terminated pool strings
    let r = unsafe { libc::strcoll(names.cstr(a.name).as_ptr(), names.cstr(b.name).as_ptr()) };
    r.cmp(&0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileKind;
    use crate::walk::file::alloc_file;

    fn setup(names: &[&[u8]]) -> (Arena<FileRecord>, NamePool, Vec<FileId>) {
        let mut arena = Arena::new();
        let mut pool = NamePool::new();
        let ids = names
            .iter()
            .map(|n| alloc_file(&mut arena, &mut pool, None, n, FileKind::RegularFile))
            .collect();
        (arena, pool, ids)
    }

    #[test]
    fn fifo_buffer_flush_pop() {
        let (mut arena, _, ids) = setup(&[b"a", b"b", b"c"]);
        let mut q = Queue::new(QueueFlags::BUFFER);

        for &id in &ids {
            q.push(&mut arena, id, false);
        }
        assert_eq!(q.peek(&arena), Peek::Unflushed);

        q.flush(&mut arena);
        assert_eq!(q.peek(&arena), Peek::Waiting(ids[0]));
        assert_eq!(q.take_waiting(&mut arena), Some(ids[0]));
        assert_eq!(q.take_waiting(&mut arena), Some(ids[1]));
        assert_eq!(q.take_waiting(&mut arena), Some(ids[2]));
        assert!(q.is_drained());
    }

    #[test]
    fn lifo_flush_preserves_sibling_order_per_batch() {
        let (mut arena, _, ids) = setup(&[b"a", b"b", b"x", b"y"]);
        let mut q = Queue::new(QueueFlags::BUFFER | QueueFlags::LIFO);

        // first batch
        q.push(&mut arena, ids[0], false);
        q.push(&mut arena, ids[1], false);
        q.flush(&mut arena);
        // second batch jumps the line, keeping its own order
        q.push(&mut arena, ids[2], false);
        q.push(&mut arena, ids[3], false);
        q.flush(&mut arena);

        let order: Vec<_> = std::iter::from_fn(|| q.take_waiting(&mut arena)).collect();
        assert_eq!(order, vec![ids[2], ids[3], ids[0], ids[1]]);
    }

    #[test]
    fn ordered_ready_respects_waiting_order() {
        let (mut arena, _, ids) = setup(&[b"a", b"b", b"c"]);
        let mut q = Queue::new(QueueFlags::BUFFER | QueueFlags::ORDER);

        for &id in &ids {
            q.push(&mut arena, id, false);
        }
        q.flush(&mut arena);

        q.detach_for_io(&mut arena, ids[0]);
        q.detach_for_io(&mut arena, ids[1]);
        assert_eq!(q.peek(&arena), Peek::Inflight);

        // b completes before a: nothing promotes yet
        q.attach(&mut arena, ids[1]);
        assert_eq!(q.peek(&arena), Peek::Inflight);

        // a completes: both promote, in order
        q.attach(&mut arena, ids[0]);
        assert_eq!(q.take_ready(&mut arena), Some(ids[0]));
        assert_eq!(q.take_ready(&mut arena), Some(ids[1]));
        assert_eq!(q.peek(&arena), Peek::Waiting(ids[2]));
    }

    #[test]
    fn unordered_detach_removes_from_lists() {
        let (mut arena, _, ids) = setup(&[b"a", b"b"]);
        let mut q = Queue::new(QueueFlags::empty());

        q.push(&mut arena, ids[0], false);
        q.push(&mut arena, ids[1], false);
        q.detach_for_io(&mut arena, ids[0]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.ioqueued(), 1);

        // the ready list only ever holds completed files
        q.attach(&mut arena, ids[0]);
        assert_eq!(q.peek(&arena), Peek::Ready(ids[0]));
        assert_eq!(q.take_ready(&mut arena), Some(ids[0]));
        assert_eq!(q.peek(&arena), Peek::Waiting(ids[1]));
    }

    #[test]
    fn sort_buffer_orders_siblings() {
        let (mut arena, pool, ids) = setup(&[b"b", b"a", b"c"]);
        let mut q = Queue::new(QueueFlags::BUFFER | QueueFlags::ORDER);

        for &id in &ids {
            q.push(&mut arena, id, false);
        }
        q.sort_buffer(&mut arena, &pool);
        q.flush(&mut arena);

        let order: Vec<_> = std::iter::from_fn(|| q.take_waiting(&mut arena)).collect();
        assert_eq!(order, vec![ids[1], ids[0], ids[2]]);
    }

    #[test]
    fn balance_counter_gates_dispatch() {
        let (mut arena, _, ids) = setup(&[b"a", b"b"]);
        let mut q = Queue::new(QueueFlags::BALANCE);

        assert!(q.balanced());
        q.push(&mut arena, ids[0], false);
        q.detach_for_io(&mut arena, ids[0]);
        assert!(!q.balanced());

        // one synchronous completion rebalances
        q.rebalance(false);
        assert!(q.balanced());
    }
}
