//! Quiescence barriers between teardown steps.
//!
//! Two operations, two classes of outstanding asynchronous work:
//! draining the immediate work queue covers callbacks that are already
//! queued for a worker thread, and awaiting the reclamation epoch covers
//! epoch-deferred destructors scheduled before the call.  Neither covers
//! timer-delayed work.  The teardown sequence interleaves these barriers
//! so that no host worker can call back into the extension after its
//! memory is reclaimed.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::host::{ReclamationDomain, WorkQueue};

// ---------------------------------------------------------------------------
// BarrierOp — the step-ledger vocabulary
// ---------------------------------------------------------------------------

/// A quiescence operation, as recorded in the controller's step ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierOp {
    DrainImmediate,
    AwaitEpoch,
}

impl fmt::Display for BarrierOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DrainImmediate => write!(f, "drain_immediate"),
            Self::AwaitEpoch => write!(f, "await_epoch"),
        }
    }
}

// ---------------------------------------------------------------------------
// QuiescenceBarrier
// ---------------------------------------------------------------------------

/// Blocking barriers over the host's deferred-work machinery.
///
/// Both operations block without timeout: a stuck host worker stalls the
/// caller indefinitely.  That is the accepted tradeoff; hanging is safer
/// than letting a worker run freed extension code.
#[derive(Clone)]
pub struct QuiescenceBarrier {
    work_queue: Arc<dyn WorkQueue>,
    reclamation: Arc<dyn ReclamationDomain>,
}

impl QuiescenceBarrier {
    pub fn new(work_queue: Arc<dyn WorkQueue>, reclamation: Arc<dyn ReclamationDomain>) -> Self {
        Self {
            work_queue,
            reclamation,
        }
    }

    /// Block until every immediate work item enqueued before this call has
    /// run.  Timer-delayed items are not waited for.
    pub fn drain_immediate(&self) {
        self.work_queue.drain_immediate();
    }

    /// Block until every epoch-deferred destructor scheduled before this
    /// call has executed.
    pub fn await_epoch(&self) {
        self.reclamation.await_epoch();
    }

    /// Run one barrier operation by ledger vocabulary.
    pub fn run(&self, op: BarrierOp) {
        match op {
            BarrierOp::DrainImmediate => self.drain_immediate(),
            BarrierOp::AwaitEpoch => self.await_epoch(),
        }
    }
}

impl fmt::Debug for QuiescenceBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuiescenceBarrier").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::host_harness::{HarnessConfig, InProcessHost};

    // -- BarrierOp --

    #[test]
    fn barrier_op_display() {
        assert_eq!(BarrierOp::DrainImmediate.to_string(), "drain_immediate");
        assert_eq!(BarrierOp::AwaitEpoch.to_string(), "await_epoch");
    }

    #[test]
    fn barrier_op_serde_roundtrip() {
        for op in [BarrierOp::DrainImmediate, BarrierOp::AwaitEpoch] {
            let json = serde_json::to_string(&op).expect("serialize");
            let restored: BarrierOp = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(op, restored);
        }
    }

    // -- Barrier semantics against the reference host --

    #[test]
    fn drain_immediate_covers_previously_queued_work() {
        let host = InProcessHost::new(HarnessConfig::default());
        let barrier = QuiescenceBarrier::new(
            host.context().work_queue,
            host.context().reclamation,
        );

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        host.context()
            .work_queue
            .enqueue_immediate(Box::new(move || flag.store(true, Ordering::SeqCst)));

        barrier.drain_immediate();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn drain_immediate_does_not_cover_delayed_work() {
        let host = InProcessHost::new(HarnessConfig::default());
        let ctx = host.context();
        let barrier = QuiescenceBarrier::new(ctx.work_queue.clone(), ctx.reclamation.clone());

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        ctx.work_queue
            .enqueue_delayed(Box::new(move || flag.store(true, Ordering::SeqCst)));

        barrier.drain_immediate();
        assert!(!ran.load(Ordering::SeqCst));

        host.fire_delayed();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn await_epoch_covers_destructor_scheduled_by_drained_work() {
        let host = InProcessHost::new(HarnessConfig::default());
        let ctx = host.context();
        let barrier = QuiescenceBarrier::new(ctx.work_queue.clone(), ctx.reclamation.clone());

        let destroyed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&destroyed);
        let reclamation = ctx.reclamation.clone();
        ctx.work_queue.enqueue_immediate(Box::new(move || {
            reclamation.schedule_deferred_destructor(Box::new(move || {
                flag.store(true, Ordering::SeqCst);
            }));
        }));

        barrier.drain_immediate();
        barrier.await_epoch();
        assert!(destroyed.load(Ordering::SeqCst));
    }

    #[test]
    fn run_dispatches_by_op() {
        let host = InProcessHost::new(HarnessConfig::default());
        let ctx = host.context();
        let barrier = QuiescenceBarrier::new(ctx.work_queue.clone(), ctx.reclamation.clone());

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        ctx.work_queue
            .enqueue_immediate(Box::new(move || flag.store(true, Ordering::SeqCst)));

        barrier.run(BarrierOp::DrainImmediate);
        assert!(ran.load(Ordering::SeqCst));
        barrier.run(BarrierOp::AwaitEpoch);
    }

    #[test]
    fn barriers_on_idle_host_return_immediately() {
        let host = InProcessHost::new(HarnessConfig::default());
        let ctx = host.context();
        let barrier = QuiescenceBarrier::new(ctx.work_queue, ctx.reclamation);
        barrier.drain_immediate();
        barrier.await_epoch();
    }
}
