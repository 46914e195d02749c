//! Async-signal-safe hook registration and dispatch.
//!
//! Handlers may fire on any thread at any instant, so the hook table is kept
//! behind a two-epoch read-copy-update cell: readers (the signal handler)
//! acquire the current snapshot with two atomic ops and never block; writers
//! (registration, on the normal control path) swap in a new snapshot and spin
//! until the retired epoch's readers drain. The fatal-signal re-raise path
//! therefore never takes a lock.

use core::ffi::c_int;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::error::Errno;

type HookFn = Arc<dyn Fn(c_int) + Send + Sync + 'static>;

struct HookEntry {
    id: u64,
    /// Signal this hook listens for; 0 for exit hooks, which fire on any
    /// terminating signal.
    sig: c_int,
    on_exit: bool,
    func: HookFn,
}

type Table = Vec<HookEntry>;

struct RcuSlot {
    readers: AtomicUsize,
    data: AtomicPtr<Table>,
}

impl RcuSlot {
    const fn new() -> Self {
        Self {
            readers: AtomicUsize::new(0),
            data: AtomicPtr::new(core::ptr::null_mut()),
        }
    }
}

/// Two-epoch RCU cell. Readers are wait-free; one writer at a time (the
/// registry mutex serialises them).
struct Rcu {
    active: AtomicUsize,
    slots: [RcuSlot; 2],
}

struct ReadGuard<'a> {
    slot: &'a RcuSlot,
}

impl Rcu {
    const fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            slots: [RcuSlot::new(), RcuSlot::new()],
        }
    }

    fn read(&self) -> ReadGuard<'_> {
        loop {
            let epoch = self.active.load(Ordering::Acquire);
            let slot = &self.slots[epoch];
            slot.readers.fetch_add(1, Ordering::Acquire);
            if self.active.load(Ordering::Acquire) == epoch {
                return ReadGuard { slot };
            }
            // lost a race with a writer rotating epochs; back out and retry
            slot.readers.fetch_sub(1, Ordering::Release);
        }
    }

    /// Publishes `table` and waits for readers of the retired epoch.
    fn update(&self, table: Table) {
        let old_epoch = self.active.load(Ordering::Relaxed);
        let new_epoch = old_epoch ^ 1;
        let slot = &self.slots[new_epoch];

        let stale = slot.data.swap(Box::into_raw(Box::new(table)), Ordering::AcqRel);
        self.active.store(new_epoch, Ordering::Release);

        while self.slots[old_epoch].readers.load(Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }

        // two rotations old by now, so no reader can still hold it
        if !stale.is_null() {
            // SAFETY: the pointer came from Box::into_raw in a prior update
            drop(unsafe { Box::from_raw(stale) });
        }
    }
}

impl ReadGuard<'_> {
    fn table(&self) -> &[HookEntry] {
        let ptr = self.slot.data.load(Ordering::Acquire);
        if ptr.is_null() {
            &[]
        } else {
            // SAFETY: the reader count keeps the writer from retiring this
            // snapshot until the guard drops
            unsafe { &*ptr }
        }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.slot.readers.fetch_sub(1, Ordering::Release);
    }
}

static HOOKS: Rcu = Rcu::new();

struct Registered {
    id: u64,
    sig: c_int,
    on_exit: bool,
    func: HookFn,
}

#[derive(Default)]
struct Registry {
    entries: Vec<Registered>,
    /// Saved dispositions for signals we have a handler installed on.
    installed: HashMap<c_int, libc::sigaction>,
    next_id: u64,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Registry::default()))
}

const FATAL_SIGNALS: [c_int; 4] = [libc::SIGSEGV, libc::SIGBUS, libc::SIGFPE, libc::SIGILL];
const EXIT_SIGNALS: [c_int; 4] = [libc::SIGINT, libc::SIGQUIT, libc::SIGTERM, libc::SIGHUP];

fn is_fatal(sig: c_int) -> bool {
    FATAL_SIGNALS.contains(&sig)
}

extern "C" fn handler(sig: c_int) {
    let mut hooked = false;
    {
        let guard = HOOKS.read();
        for entry in guard.table() {
            if entry.sig == sig {
                hooked = true;
                (entry.func)(sig);
            } else if entry.on_exit && (is_fatal(sig) || EXIT_SIGNALS.contains(&sig)) {
                (entry.func)(sig);
            }
        }
    }

    // A signal nobody claimed (only exit finalizers ran) keeps its default
    // fate: restore the disposition and re-deliver. Fatal faults always die.
    if is_fatal(sig) || !hooked {
        // SAFETY: resetting to SIG_DFL and re-raising is async-signal-safe
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        }
    }
}

fn install(reg: &mut Registry, sig: c_int) -> Result<(), Errno> {
    if reg.installed.contains_key(&sig) {
        return Ok(());
    }
    // SAFETY: zeroed sigaction is a valid starting point; handler is an
    // async-signal-safe extern "C" fn
    unsafe {
        let mut sa: libc::sigaction = core::mem::zeroed();
        sa.sa_sigaction = handler as extern "C" fn(c_int) as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        let mut old: libc::sigaction = core::mem::zeroed();
        if libc::sigaction(sig, &sa, &mut old) != 0 {
            return Err(Errno::last());
        }
        reg.installed.insert(sig, old);
    }
    Ok(())
}

fn uninstall(reg: &mut Registry, sig: c_int) {
    if reg.entries.iter().any(|e| e.sig == sig || (e.on_exit && (is_fatal(sig) || EXIT_SIGNALS.contains(&sig)))) {
        return;
    }
    if let Some(old) = reg.installed.remove(&sig) {
        // SAFETY: restoring the previously saved disposition
        unsafe { libc::sigaction(sig, &old, core::ptr::null_mut()) };
    }
}

fn publish(reg: &Registry) {
    let table = reg
        .entries
        .iter()
        .map(|e| HookEntry {
            id: e.id,
            sig: e.sig,
            on_exit: e.on_exit,
            func: Arc::clone(&e.func),
        })
        .collect();
    HOOKS.update(table);
}

/// A registered signal hook. Detach it with [`unhook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigHook(u64);

/// Runs `func` from the signal handler whenever `sig` is delivered.
///
/// `func` must restrict itself to async-signal-safe work; storing to an
/// atomic flag is the intended use. While a hook is registered the signal no
/// longer terminates the process.
pub fn on_signal(
    sig: c_int,
    func: impl Fn(c_int) + Send + Sync + 'static,
) -> Result<SigHook, Errno> {
    let mut reg = registry().lock().unwrap_or_else(PoisonError::into_inner);
    install(&mut reg, sig)?;
    let id = reg.next_id;
    reg.next_id += 1;
    reg.entries.push(Registered {
        id,
        sig,
        on_exit: false,
        func: Arc::new(func),
    });
    publish(&reg);
    Ok(SigHook(id))
}

/// Runs `func` as a finalizer when the process is about to die from a fatal
/// fault or a terminating signal, before the default action is re-delivered.
pub fn on_exit_signal(
    func: impl Fn(c_int) + Send + Sync + 'static,
) -> Result<SigHook, Errno> {
    let mut reg = registry().lock().unwrap_or_else(PoisonError::into_inner);
    for sig in FATAL_SIGNALS.into_iter().chain(EXIT_SIGNALS) {
        install(&mut reg, sig)?;
    }
    let id = reg.next_id;
    reg.next_id += 1;
    reg.entries.push(Registered {
        id,
        sig: 0,
        on_exit: true,
        func: Arc::new(func),
    });
    publish(&reg);
    Ok(SigHook(id))
}

/// Removes a hook registered with [`on_signal`] or [`on_exit_signal`],
/// restoring the saved disposition of any signal left without hooks. Safe to
/// call while the signal is being delivered on another thread; returns after
/// the handler can no longer observe the hook.
pub fn unhook(hook: SigHook) {
    let mut reg = registry().lock().unwrap_or_else(PoisonError::into_inner);
    let Some(pos) = reg.entries.iter().position(|e| e.id == hook.0) else {
        return;
    };
    let removed = reg.entries.remove(pos);
    publish(&reg);
    if removed.on_exit {
        for sig in FATAL_SIGNALS.into_iter().chain(EXIT_SIGNALS) {
            uninstall(&mut reg, sig);
        }
    } else {
        uninstall(&mut reg, removed.sig);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn hook_fires_and_unhook_restores() {
        static SEEN: AtomicBool = AtomicBool::new(false);

        let hook = on_signal(libc::SIGUSR1, |_| SEEN.store(true, Ordering::SeqCst)).unwrap();
        unsafe { libc::raise(libc::SIGUSR1) };
        assert!(SEEN.load(Ordering::SeqCst));

        unhook(hook);
        let reg = registry().lock().unwrap();
        assert!(!reg.installed.contains_key(&libc::SIGUSR1));
    }

    #[test]
    fn exit_hooks_install_on_every_terminating_signal() {
        let hook = on_exit_signal(|_| {}).unwrap();
        {
            let reg = registry().lock().unwrap();
            for sig in FATAL_SIGNALS.into_iter().chain(EXIT_SIGNALS) {
                assert!(reg.installed.contains_key(&sig), "no handler for {sig}");
            }
        }
        unhook(hook);
    }

    #[test]
    fn rcu_readers_see_updates() {
        let rcu = Rcu::new();
        assert!(rcu.read().table().is_empty());

        rcu.update(vec![HookEntry {
            id: 7,
            sig: libc::SIGUSR2,
            on_exit: false,
            func: Arc::new(|_| {}),
        }]);
        let guard = rcu.read();
        assert_eq!(guard.table().len(), 1);
        assert_eq!(guard.table()[0].id, 7);
        drop(guard);

        rcu.update(Vec::new());
        assert!(rcu.read().table().is_empty());
    }
}
