//! Ordered undo actions for partially provisioned machines.
//!
//! A [`CleanupStack`] collects undo closures as provisioning makes progress.
//! It is drained at most once, either by the failing pipeline or by the
//! interrupt handler, whichever gets there first; the loser sees an empty
//! stack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, warn};

/// Exit status used after an interrupt-triggered rollback (128 + SIGINT).
const INTERRUPTED_EXIT_CODE: i32 = 130;

type UndoFn = Box<dyn FnOnce() -> Result<()> + Send>;

struct Inner {
    actions: Mutex<Vec<(String, UndoFn)>>,
    drained: AtomicBool,
}

/// A LIFO stack of named undo actions, shared between clones.
#[derive(Clone)]
pub(crate) struct CleanupStack {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupStack")
            .field("pending", &self.len())
            .field("drained", &self.inner.drained.load(Ordering::SeqCst))
            .finish()
    }
}

fn lock_ignoring_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl CleanupStack {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                actions: Mutex::new(Vec::new()),
                drained: AtomicBool::new(false),
            }),
        }
    }

    /// Register an undo action. Actions pushed after the stack was drained
    /// are dropped without running.
    pub(crate) fn push(
        &self,
        description: impl Into<String>,
        undo: impl FnOnce() -> Result<()> + Send + 'static,
    ) {
        let description = description.into();
        if self.inner.drained.load(Ordering::SeqCst) {
            warn!("Ignoring undo action registered after cleanup: {description}");
            return;
        }
        lock_ignoring_poison(&self.inner.actions).push((description, Box::new(undo)));
    }

    /// Number of undo actions not yet run.
    pub(crate) fn len(&self) -> usize {
        lock_ignoring_poison(&self.inner.actions).len()
    }

    fn take(&self) -> Option<Vec<(String, UndoFn)>> {
        if self.inner.drained.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(std::mem::take(&mut *lock_ignoring_poison(
            &self.inner.actions,
        )))
    }

    /// Run every undo action in reverse registration order. Failures are
    /// logged and do not stop the remaining actions. Returns how many actions
    /// this call ran; a second drain runs nothing.
    pub(crate) fn clean(&self) -> usize {
        let Some(actions) = self.take() else {
            debug!("Cleanup stack already drained");
            return 0;
        };
        let n = actions.len();
        for (description, undo) in actions.into_iter().rev() {
            debug!("Rolling back: {description}");
            if let Err(e) = undo() {
                warn!("Failed to roll back {description}: {e:#}");
            }
        }
        n
    }

    /// Drop all undo actions without running them.
    pub(crate) fn discard(&self) {
        if let Some(actions) = self.take() {
            debug!("Discarding {} undo actions", actions.len());
        }
    }

    /// Make this the stack drained when the process is interrupted, until the
    /// returned guard is dropped.
    pub(crate) fn clean_on_interrupt(&self) -> Result<InterruptGuard> {
        install_interrupt_handler()?;
        Ok(self.register(&ACTIVE))
    }

    fn register(&self, slot: &'static Slot) -> InterruptGuard {
        *lock_ignoring_poison(slot) = Some(self.clone());
        InterruptGuard {
            stack: self.clone(),
            slot,
        }
    }
}

type Slot = Mutex<Option<CleanupStack>>;

/// Stack drained by the interrupt handler.
static ACTIVE: Slot = Mutex::new(None);

/// Unregisters its stack from interrupt handling when dropped.
#[derive(Debug)]
pub(crate) struct InterruptGuard {
    stack: CleanupStack,
    slot: &'static Slot,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        let mut active = lock_ignoring_poison(self.slot);
        if active
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(&s.inner, &self.stack.inner))
        {
            *active = None;
        }
    }
}

fn install_interrupt_handler() -> Result<()> {
    static INSTALLED: OnceLock<std::result::Result<(), String>> = OnceLock::new();
    INSTALLED
        .get_or_init(|| ctrlc::set_handler(on_interrupt).map_err(|e| e.to_string()))
        .clone()
        .map_err(|e| eyre!("Failed to install interrupt handler: {e}"))
}

/// Unregister and drain the stack in `slot`, returning how many actions ran.
fn drain_slot(slot: &Slot) -> usize {
    let stack = lock_ignoring_poison(slot).take();
    match stack {
        Some(stack) => {
            eprintln!("Interrupted, rolling back partial changes...");
            stack.clean()
        }
        None => 0,
    }
}

fn on_interrupt() {
    drain_slot(&ACTIVE);
    std::process::exit(INTERRUPTED_EXIT_CODE);
}
