//! Pseudo-atomic regions
//!
//! An allocation and the writes that make the allocated block a valid object
//! must not be observed half-done by a collector or a signal handler. Instead
//! of blocking interrupts, the builder marks the span as pseudo-atomic: any
//! interrupt requested while the region is open is queued and serviced when
//! the outermost region closes.
//!
//! ```text
//!   enter()  ──►  [in region]  ──request_interrupt()──► queued, flag set
//!                      │
//!                 guard dropped
//!                      │
//!                      ▼
//!            flag set? ──yes──► drain queue through the handler
//! ```
//!
//! Regions nest; only the outermost exit is a safe point.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

/// An asynchronous request that must wait for a safe point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// The allocator crossed its collection threshold
    GcRequested,
    /// A deferred operating-system signal
    Signal(i32),
}

type InterruptHandler = Box<dyn FnMut(Interrupt) + Send>;

/// Shared pseudo-atomic state for one loader
pub struct PseudoAtomic {
    depth: AtomicU32,
    interrupted: AtomicBool,
    servicing: AtomicBool,
    pending: Mutex<Vec<Interrupt>>,
    handler: Mutex<Option<InterruptHandler>>,
    deferred_count: AtomicU64,
    serviced_count: AtomicU64,
}

impl std::fmt::Debug for PseudoAtomic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PseudoAtomic")
            .field("depth", &self.depth.load(Ordering::Relaxed))
            .field("interrupted", &self.interrupted.load(Ordering::Relaxed))
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl Default for PseudoAtomic {
    fn default() -> Self {
        Self::new()
    }
}

impl PseudoAtomic {
    pub fn new() -> Self {
        Self {
            depth: AtomicU32::new(0),
            interrupted: AtomicBool::new(false),
            servicing: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
            deferred_count: AtomicU64::new(0),
            serviced_count: AtomicU64::new(0),
        }
    }

    /// Open a region. It closes when the returned guard is dropped.
    pub fn enter(self: &Arc<Self>) -> PseudoAtomicGuard {
        self.depth.fetch_add(1, Ordering::AcqRel);
        PseudoAtomicGuard {
            state: Arc::clone(self),
        }
    }

    /// Whether any region is currently open
    #[inline]
    pub fn in_region(&self) -> bool {
        self.depth.load(Ordering::Acquire) > 0
    }

    /// Whether an interrupt is waiting for the region to close
    #[inline]
    pub fn interrupt_pending(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Install the function that services interrupts. Without one, interrupts
    /// are logged and dropped.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: FnMut(Interrupt) + Send + 'static,
    {
        *self.handler.lock() = Some(Box::new(handler));
    }

    /// Request an interrupt. Serviced immediately outside a region, deferred inside one.
    pub fn request_interrupt(&self, interrupt: Interrupt) {
        self.pending.lock().push(interrupt);
        if self.in_region() {
            self.interrupted.store(true, Ordering::Release);
            self.deferred_count.fetch_add(1, Ordering::Relaxed);
            debug!(target: "codeload::pseudo_atomic", ?interrupt, "Interrupt deferred");
        } else {
            self.service_pending();
        }
    }

    /// Number of interrupts that arrived inside a region
    pub fn deferred_count(&self) -> u64 {
        self.deferred_count.load(Ordering::Relaxed)
    }

    /// Number of interrupts delivered to the handler (or dropped without one)
    pub fn serviced_count(&self) -> u64 {
        self.serviced_count.load(Ordering::Relaxed)
    }

    fn service_pending(&self) {
        // A handler that requests another interrupt lands here re-entrantly;
        // the outer loop picks the new request up.
        if self.servicing.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            let batch = std::mem::take(&mut *self.pending.lock());
            if batch.is_empty() {
                break;
            }
            let mut handler = self.handler.lock();
            for interrupt in batch {
                self.serviced_count.fetch_add(1, Ordering::Relaxed);
                match handler.as_mut() {
                    Some(h) => h(interrupt),
                    None => trace!(target: "codeload::pseudo_atomic", ?interrupt, "No handler installed"),
                }
            }
        }
        self.servicing.store(false, Ordering::Release);
    }

    fn exit(&self) {
        if self.depth.fetch_sub(1, Ordering::AcqRel) == 1 && self.interrupted.swap(false, Ordering::AcqRel) {
            self.service_pending();
        }
    }
}

/// Open pseudo-atomic region; closing it is the safe point
#[must_use = "the region closes as soon as the guard is dropped"]
pub struct PseudoAtomicGuard {
    state: Arc<PseudoAtomic>,
}

impl Drop for PseudoAtomicGuard {
    fn drop(&mut self) {
        self.state.exit();
    }
}
