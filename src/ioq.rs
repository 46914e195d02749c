//! The asynchronous I/O queue.
//!
//! Potentially blocking syscalls (`opendir`, `stat`, `close`) are shipped to
//! a small pool of worker threads so the traversal thread can keep popping
//! queues and running callbacks. Submissions go through a
//! [`crossbeam_deque::Injector`], which gives FIFO hand-off to whichever
//! worker wakes first; completions come back over a `crossbeam-channel`
//! MPSC channel drained only by the traversal thread.
//!
//! For a single file the submit → execute → complete chain is linear, so the
//! channel's internal synchronisation establishes happens-before between the
//! traversal thread's writes and the worker's reads. Workers never touch a
//! record after sending its completion.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use crossbeam_deque::{Injector, Steal};

use crate::error::Errno;
use crate::fs::{Dir, FileDes, FileStat, StatFlag, stat_at};
use crate::util::Idx;

/// In-flight ops per worker thread. Deep enough to keep workers busy while
/// the traversal thread is stuck in a callback, shallow enough to bound the
/// number of pre-opened directories holding FD slots.
const DEPTH_PER_THREAD: usize = 8;

pub(crate) enum IoOp {
    OpenDir {
        dfd: i32,
        name: CString,
        whiteouts: bool,
    },
    Stat {
        dfd: i32,
        name: CString,
        flag: StatFlag,
    },
    CloseDir {
        dir: Dir,
    },
    Close {
        fd: FileDes,
    },
}

pub(crate) enum IoOut {
    OpenDir(Result<Dir, Errno>),
    Stat {
        followed: bool,
        result: Result<FileStat, Errno>,
    },
    Close,
}

pub(crate) struct IoEntry {
    pub cookie: Option<Idx>,
    pub op: IoOp,
}

pub(crate) struct IoResult {
    pub cookie: Option<Idx>,
    pub out: IoOut,
}

struct Shared {
    injector: Injector<IoEntry>,
    cancel: AtomicBool,
    shutdown: AtomicBool,
    idle: Mutex<()>,
    wake: Condvar,
}

fn execute(entry: IoEntry, cancelled: bool) -> IoResult {
    let out = match entry.op {
        // close ops always run: a cancelled walk must still not leak fds
        IoOp::CloseDir { dir } => {
            let _ = dir.close();
            IoOut::Close
        }
        IoOp::Close { mut fd } => {
            fd.close();
            IoOut::Close
        }
        IoOp::OpenDir { .. } if cancelled => IoOut::OpenDir(Err(Errno(libc::ECANCELED))),
        IoOp::Stat { .. } if cancelled => IoOut::Stat {
            followed: false,
            result: Err(Errno(libc::ECANCELED)),
        },
        IoOp::OpenDir { dfd, name, whiteouts } => IoOut::OpenDir(Dir::open(dfd, &name, whiteouts)),
        IoOp::Stat { dfd, name, flag } => {
            let (followed, result) = stat_at(dfd, &name, flag);
            IoOut::Stat { followed, result }
        }
    };
    IoResult { cookie: entry.cookie, out }
}

fn worker(shared: &Shared, results: &Sender<IoResult>) {
    loop {
        match shared.injector.steal() {
            Steal::Success(entry) => {
                let cancelled = shared.cancel.load(Ordering::Acquire);
                // send fails only when the queue owner is gone; the op
                // already ran, so just drop the completion
                let _ = results.send(execute(entry, cancelled));
            }
            Steal::Retry => {}
            Steal::Empty => {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                let guard = shared.idle.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if shared.injector.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
                    drop(shared.wake.wait(guard));
                }
            }
        }
    }
}

/// Handle to the worker pool, owned by the traversal thread.
pub(crate) struct Ioq {
    shared: Arc<Shared>,
    results: Receiver<IoResult>,
    workers: Vec<JoinHandle<()>>,
    depth: usize,
    in_flight: usize,
}

impl Ioq {
    /// Spawns `nthreads` workers. Zero threads means no queue at all: every
    /// caller falls back to synchronous execution.
    pub(crate) fn new(nthreads: usize) -> Option<Self> {
        if nthreads == 0 {
            return None;
        }

        let shared = Arc::new(Shared {
            injector: Injector::new(),
            cancel: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            idle: Mutex::new(()),
            wake: Condvar::new(),
        });
        let (tx, rx) = unbounded();

        let workers = (0..nthreads)
            .map(|_| {
                let shared = Arc::clone(&shared);
                let tx = tx.clone();
                std::thread::spawn(move || worker(&shared, &tx))
            })
            .collect();

        Some(Self {
            shared,
            results: rx,
            workers,
            depth: nthreads * DEPTH_PER_THREAD,
            in_flight: 0,
        })
    }

    /// Remaining submission slots.
    pub(crate) const fn capacity(&self) -> usize {
        self.depth - self.in_flight
    }

    pub(crate) const fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub(crate) fn submit(&mut self, cookie: Option<Idx>, op: IoOp) {
        debug_assert!(self.capacity() > 0, "ioq submit past capacity");
        self.in_flight += 1;
        self.shared.injector.push(IoEntry { cookie, op });
        self.shared.wake.notify_one();
    }

    /// Takes one completion, blocking when `block` is set. Blocking with
    /// nothing in flight would sleep forever, so callers gate on
    /// [`in_flight`](Self::in_flight).
    pub(crate) fn pop(&mut self, block: bool) -> Option<IoResult> {
        debug_assert!(!block || self.in_flight > 0, "blocking pop on an idle ioq");
        let result = if block {
            self.results.recv().ok()
        } else {
            self.results.try_recv().ok()
        };
        if result.is_some() {
            self.in_flight -= 1;
        }
        result
    }

    /// Makes every submitted-but-unserviced op complete promptly, with
    /// `ECANCELED` where the syscall was skipped. Close ops still run.
    pub(crate) fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::Release);
        self.shared.wake.notify_all();
    }
}

impl Drop for Ioq {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        // drain stragglers so any opened directories close via their Drops
        while self.results.try_recv().is_ok() {}
    }
}
