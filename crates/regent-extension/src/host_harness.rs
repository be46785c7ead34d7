//! In-process reference host for exercising the lifecycle core.
//!
//! Implements every host collaborator trait over real threads so the
//! quiescence barriers block for real: an immediate lane serviced by a
//! worker thread (drained by watermark), a reclamation lane with an epoch
//! wait, and a delayed lane that drains deliberately do NOT cover, the
//! same gap that makes the real host's mark reaper dangerous.  The harness
//! also keeps the books the tests need: which credentials were destroyed
//! versus leaked, whether anything touched extension-owned objects after
//! the module was notionally reclaimed, and which parent the introspection
//! entry was restored under.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};

use crate::host::{
    AllocationFailure, CredentialApi, HostContext, HostCredential, InodeRef,
    IntrospectionRegistry, MarkRegistry, PathRef, PathResolver, ReclamationDomain,
    RegistrationFailure, ResolveError, ResolvedDir, RestoreError, SavedParent, WorkItem,
    WorkQueue, lock_unpoisoned,
};
use crate::watch::{DispatchOutcome, FsEvent, WatchGroup, WatchMark};

// ---------------------------------------------------------------------------
// HarnessConfig
// ---------------------------------------------------------------------------

/// Fault-injection switches for the reference host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    pub fail_credential_create: bool,
    pub fail_mark_registration: bool,
    pub fail_restore: bool,
    /// When true, `destroy_group_with_wait` runs the pending mark reaper
    /// before returning.  When false it returns immediately with reaper
    /// work still pending, reproducing the defective host wait.
    pub trustworthy_destroy: bool,
}

// ---------------------------------------------------------------------------
// Lane — a worker-serviced queue with a watermark drain
// ---------------------------------------------------------------------------

struct LaneState {
    queue: VecDeque<(u64, WorkItem)>,
    enqueued: u64,
    completed: u64,
    stop: bool,
}

struct Lane {
    state: Mutex<LaneState>,
    cond: Condvar,
}

impl Lane {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LaneState {
                queue: VecDeque::new(),
                enqueued: 0,
                completed: 0,
                stop: false,
            }),
            cond: Condvar::new(),
        })
    }

    fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let lane = Arc::clone(self);
        std::thread::spawn(move || lane.worker_loop())
    }

    fn worker_loop(&self) {
        loop {
            let item = {
                let mut state = lock_unpoisoned(&self.state);
                loop {
                    if let Some(entry) = state.queue.pop_front() {
                        break Some(entry);
                    }
                    if state.stop {
                        break None;
                    }
                    state = match self.cond.wait(state) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            };
            let Some((seq, task)) = item else {
                return;
            };
            task();
            let mut state = lock_unpoisoned(&self.state);
            state.completed = seq;
            self.cond.notify_all();
        }
    }

    fn enqueue(&self, task: WorkItem) {
        let mut state = lock_unpoisoned(&self.state);
        state.enqueued += 1;
        let seq = state.enqueued;
        state.queue.push_back((seq, task));
        self.cond.notify_all();
    }

    /// Block until everything enqueued before this call has completed.
    /// Work enqueued afterwards is not waited for.
    fn drain(&self) {
        let mut state = lock_unpoisoned(&self.state);
        let watermark = state.enqueued;
        while state.completed < watermark {
            state = match self.cond.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn stop(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.stop = true;
        self.cond.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Host bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CredentialLedger {
    next_id: u64,
    live: BTreeSet<u64>,
    leaked: BTreeSet<u64>,
    destroyed: Vec<u64>,
}

#[derive(Debug)]
struct EntryState {
    visible: bool,
    original_parent: SavedParent,
    restored_with: Option<SavedParent>,
}

struct HostInner {
    config: HarnessConfig,
    immediate: Arc<Lane>,
    reclamation: Arc<Lane>,
    delayed: Mutex<Vec<WorkItem>>,
    reaper: Mutex<Vec<WorkItem>>,
    credentials: Mutex<CredentialLedger>,
    dirs: Mutex<BTreeMap<String, InodeRef>>,
    next_ino: AtomicU64,
    groups: Mutex<Vec<Arc<WatchGroup>>>,
    marks: Mutex<Vec<Arc<WatchMark>>>,
    entry: Mutex<EntryState>,
    module_reclaimed: AtomicBool,
    use_after_reclaim: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for HostInner {
    fn drop(&mut self) {
        self.immediate.stop();
        self.reclamation.stop();
        let handles = match self.workers.get_mut() {
            Ok(handles) => std::mem::take(handles),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// InProcessHost
// ---------------------------------------------------------------------------

/// The reference host.  Cheap to clone; all clones share one host.
#[derive(Clone)]
pub struct InProcessHost {
    inner: Arc<HostInner>,
}

impl InProcessHost {
    pub fn new(config: HarnessConfig) -> Self {
        let immediate = Lane::new();
        let reclamation = Lane::new();
        let workers = vec![immediate.spawn_worker(), reclamation.spawn_worker()];
        Self {
            inner: Arc::new(HostInner {
                config,
                immediate,
                reclamation,
                delayed: Mutex::new(Vec::new()),
                reaper: Mutex::new(Vec::new()),
                credentials: Mutex::new(CredentialLedger::default()),
                dirs: Mutex::new(BTreeMap::new()),
                next_ino: AtomicU64::new(1),
                groups: Mutex::new(Vec::new()),
                marks: Mutex::new(Vec::new()),
                entry: Mutex::new(EntryState {
                    visible: true,
                    original_parent: SavedParent {
                        name: "module_set".to_string(),
                    },
                    restored_with: None,
                }),
                module_reclaimed: AtomicBool::new(false),
                use_after_reclaim: AtomicU64::new(0),
                workers: Mutex::new(workers),
            }),
        }
    }

    /// Bundle this host into the collaborator context the controller takes.
    pub fn context(&self) -> HostContext {
        HostContext {
            work_queue: Arc::new(self.clone()),
            reclamation: Arc::new(self.clone()),
            credentials: Arc::new(self.clone()),
            resolver: Arc::new(self.clone()),
            marks: Arc::new(self.clone()),
            introspection: Arc::new(self.clone()),
        }
    }

    // -- Filesystem fixture --

    /// Make a directory resolvable, returning the host's own inode handle.
    pub fn add_directory(&self, path: &str) -> InodeRef {
        let ino = self.inner.next_ino.fetch_add(1, Ordering::SeqCst);
        let inode = InodeRef::new(ino);
        lock_unpoisoned(&self.inner.dirs).insert(path.to_string(), inode.clone());
        inode
    }

    pub fn inode_strong_count(&self, path: &str) -> Option<usize> {
        lock_unpoisoned(&self.inner.dirs)
            .get(path)
            .map(InodeRef::strong_count)
    }

    /// Deliver one filesystem-change event to every registered group, the
    /// way the host's notification path would.
    pub fn fire_event(&self, event: &FsEvent) -> Vec<DispatchOutcome> {
        let groups = lock_unpoisoned(&self.inner.groups).clone();
        groups.iter().map(|group| group.dispatch(event)).collect()
    }

    // -- Timers --

    /// Fire everything sitting behind a timer: delayed work items and any
    /// pending mark-reaper work.
    pub fn fire_delayed(&self) {
        let delayed: Vec<WorkItem> = std::mem::take(&mut *lock_unpoisoned(&self.inner.delayed));
        let reaper: Vec<WorkItem> = std::mem::take(&mut *lock_unpoisoned(&self.inner.reaper));
        for task in delayed {
            task();
        }
        for task in reaper {
            task();
        }
    }

    pub fn pending_delayed_work(&self) -> usize {
        lock_unpoisoned(&self.inner.delayed).len()
    }

    pub fn pending_mark_destruction(&self) -> usize {
        lock_unpoisoned(&self.inner.reaper).len()
    }

    // -- Reclaim accounting --

    /// Declare the extension's memory reclaimed.  Anything that touches
    /// extension-owned objects after this point is a use-after-reclaim.
    pub fn mark_module_reclaimed(&self) {
        self.inner.module_reclaimed.store(true, Ordering::SeqCst);
    }

    pub fn use_after_reclaim_count(&self) -> u64 {
        self.inner.use_after_reclaim.load(Ordering::SeqCst)
    }

    // -- Credential accounting --

    pub fn live_credentials(&self) -> usize {
        lock_unpoisoned(&self.inner.credentials).live.len()
    }

    pub fn leaked_credentials(&self) -> usize {
        lock_unpoisoned(&self.inner.credentials).leaked.len()
    }

    pub fn destroyed_credentials(&self) -> usize {
        lock_unpoisoned(&self.inner.credentials).destroyed.len()
    }

    // -- Watch registry accounting --

    pub fn registered_groups(&self) -> usize {
        lock_unpoisoned(&self.inner.groups).len()
    }

    pub fn registered_marks(&self) -> usize {
        lock_unpoisoned(&self.inner.marks).len()
    }

    // -- Introspection accounting --

    pub fn introspection_visible(&self) -> bool {
        lock_unpoisoned(&self.inner.entry).visible
    }

    pub fn restored_parent(&self) -> Option<SavedParent> {
        lock_unpoisoned(&self.inner.entry).restored_with.clone()
    }
}

impl std::fmt::Debug for InProcessHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessHost")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Trait implementations
// ---------------------------------------------------------------------------

impl WorkQueue for InProcessHost {
    fn enqueue_immediate(&self, task: WorkItem) {
        self.inner.immediate.enqueue(task);
    }

    fn enqueue_delayed(&self, task: WorkItem) {
        lock_unpoisoned(&self.inner.delayed).push(task);
    }

    fn drain_immediate(&self) {
        self.inner.immediate.drain();
    }
}

impl ReclamationDomain for InProcessHost {
    fn schedule_deferred_destructor(&self, destructor: WorkItem) {
        self.inner.reclamation.enqueue(destructor);
    }

    fn await_epoch(&self) {
        self.inner.reclamation.drain();
    }
}

impl CredentialApi for InProcessHost {
    fn create_credential(&self) -> Result<HostCredential, AllocationFailure> {
        if self.inner.config.fail_credential_create {
            return Err(AllocationFailure);
        }
        let mut ledger = lock_unpoisoned(&self.inner.credentials);
        ledger.next_id += 1;
        let id = ledger.next_id;
        ledger.live.insert(id);
        Ok(HostCredential::new(id))
    }

    fn release(&self, credential: HostCredential) {
        let id = credential.id();
        let weak = Arc::downgrade(&self.inner);
        // The destructor runs on the reclamation worker and, like the real
        // one, touches memory the extension owned.
        self.inner.reclamation.enqueue(Box::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.module_reclaimed.load(Ordering::SeqCst) {
                inner.use_after_reclaim.fetch_add(1, Ordering::SeqCst);
            }
            let mut ledger = lock_unpoisoned(&inner.credentials);
            ledger.live.remove(&id);
            ledger.destroyed.push(id);
        }));
    }

    fn abandon(&self, credential: HostCredential) {
        let id = credential.id();
        let mut ledger = lock_unpoisoned(&self.inner.credentials);
        ledger.live.remove(&id);
        ledger.leaked.insert(id);
    }
}

impl PathResolver for InProcessHost {
    fn resolve(&self, path: &str) -> Result<ResolvedDir, ResolveError> {
        lock_unpoisoned(&self.inner.dirs)
            .get(path)
            .map(|inode| ResolvedDir {
                inode: inode.clone(),
                path: PathRef::new(path),
            })
            .ok_or_else(|| ResolveError::NotFound {
                path: path.to_string(),
            })
    }
}

impl MarkRegistry for InProcessHost {
    fn register_mark(
        &self,
        group: &Arc<WatchGroup>,
        mark: &Arc<WatchMark>,
    ) -> Result<(), RegistrationFailure> {
        if self.inner.config.fail_mark_registration {
            return Err(RegistrationFailure {
                reason: "registration disabled by host".to_string(),
            });
        }
        let mut groups = lock_unpoisoned(&self.inner.groups);
        if !groups.iter().any(|known| Arc::ptr_eq(known, group)) {
            groups.push(Arc::clone(group));
        }
        lock_unpoisoned(&self.inner.marks).push(Arc::clone(mark));
        Ok(())
    }

    fn unregister_mark(&self, mark: &Arc<WatchMark>) {
        lock_unpoisoned(&self.inner.marks).retain(|known| !Arc::ptr_eq(known, mark));
        // Destruction happens on the reaper, behind a timer, exactly like
        // the host this models.
        let weak = Arc::downgrade(&self.inner);
        let mark = Arc::clone(mark);
        lock_unpoisoned(&self.inner.reaper).push(Box::new(move || {
            if let Some(inner) = weak.upgrade()
                && inner.module_reclaimed.load(Ordering::SeqCst)
            {
                inner.use_after_reclaim.fetch_add(1, Ordering::SeqCst);
                return;
            }
            let _ = mark.mask();
        }));
    }

    fn destroy_group_with_wait(&self, group: &Arc<WatchGroup>) {
        lock_unpoisoned(&self.inner.groups).retain(|known| !Arc::ptr_eq(known, group));
        if self.inner.config.trustworthy_destroy {
            let reaper: Vec<WorkItem> = std::mem::take(&mut *lock_unpoisoned(&self.inner.reaper));
            for task in reaper {
                task();
            }
        }
        // Defective host: return immediately, reaper work still pending.
    }
}

impl IntrospectionRegistry for InProcessHost {
    fn hide(&self) -> Option<SavedParent> {
        let mut entry = lock_unpoisoned(&self.inner.entry);
        if !entry.visible {
            return None;
        }
        entry.visible = false;
        Some(entry.original_parent.clone())
    }

    fn show(&self, parent: SavedParent) -> Result<(), RestoreError> {
        if self.inner.config.fail_restore {
            return Err(RestoreError {
                reason: "restore disabled by host".to_string(),
            });
        }
        let mut entry = lock_unpoisoned(&self.inner.entry);
        entry.visible = true;
        entry.restored_with = Some(parent);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::watch::{WatchConfig, WatchSubsystem};

    fn host() -> InProcessHost {
        InProcessHost::new(HarnessConfig::default())
    }

    // -- Lanes --

    #[test]
    fn drain_runs_previously_enqueued_work() {
        let host = host();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            host.enqueue_immediate(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        host.drain_immediate();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn delayed_work_is_outside_the_drain() {
        let host = host();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        host.enqueue_delayed(Box::new(move || flag.store(true, Ordering::SeqCst)));

        host.drain_immediate();
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(host.pending_delayed_work(), 1);

        host.fire_delayed();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(host.pending_delayed_work(), 0);
    }

    #[test]
    fn epoch_wait_covers_scheduled_destructors() {
        let host = host();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        host.schedule_deferred_destructor(Box::new(move || flag.store(true, Ordering::SeqCst)));
        host.await_epoch();
        assert!(ran.load(Ordering::SeqCst));
    }

    // -- Credentials --

    #[test]
    fn released_credential_is_destroyed_after_epoch() {
        let host = host();
        let cred = host.create_credential().expect("create");
        assert_eq!(host.live_credentials(), 1);

        host.release(cred);
        host.await_epoch();
        assert_eq!(host.live_credentials(), 0);
        assert_eq!(host.destroyed_credentials(), 1);
        assert_eq!(host.leaked_credentials(), 0);
    }

    #[test]
    fn abandoned_credential_is_leaked_not_destroyed() {
        let host = host();
        let cred = host.create_credential().expect("create");
        host.abandon(cred);
        host.await_epoch();
        assert_eq!(host.leaked_credentials(), 1);
        assert_eq!(host.destroyed_credentials(), 0);
    }

    #[test]
    fn release_after_reclaim_counts_use_after_reclaim() {
        let host = host();
        let cred = host.create_credential().expect("create");
        host.mark_module_reclaimed();
        host.release(cred);
        host.await_epoch();
        assert_eq!(host.use_after_reclaim_count(), 1);
    }

    #[test]
    fn failing_allocator_returns_allocation_failure() {
        let host = InProcessHost::new(HarnessConfig {
            fail_credential_create: true,
            ..HarnessConfig::default()
        });
        assert!(host.create_credential().is_err());
    }

    // -- Resolution --

    #[test]
    fn resolve_unknown_path_is_not_found() {
        let host = host();
        let err = host.resolve("/data/system").expect_err("missing");
        assert_eq!(
            err,
            ResolveError::NotFound {
                path: "/data/system".to_string(),
            }
        );
    }

    #[test]
    fn resolve_returns_shared_inode() {
        let host = host();
        host.add_directory("/data/system");
        let resolved = host.resolve("/data/system").expect("resolve");
        assert_eq!(resolved.path.as_str(), "/data/system");
        // The host's copy plus the resolved copy.
        assert_eq!(host.inode_strong_count("/data/system"), Some(2));
        drop(resolved);
        assert_eq!(host.inode_strong_count("/data/system"), Some(1));
    }

    // -- Mark registry --

    fn started_watch(
        host: &InProcessHost,
    ) -> (WatchSubsystem, std::sync::mpsc::Receiver<crate::watch::RescanSignal>) {
        host.add_directory("/data/system");
        let ctx = host.context();
        let (mut subsystem, rx) =
            WatchSubsystem::new(ctx.resolver, ctx.marks, WatchConfig::default());
        subsystem.start().expect("start");
        (subsystem, rx)
    }

    #[test]
    fn registration_tracks_groups_and_marks() {
        let host = host();
        let (subsystem, _rx) = started_watch(&host);
        assert_eq!(host.registered_groups(), 1);
        assert_eq!(host.registered_marks(), 1);
        assert_eq!(host.pending_mark_destruction(), 0);
        drop(subsystem);
    }

    #[test]
    fn defective_destroy_leaves_reaper_pending() {
        let host = host();
        host.add_directory("/data/system");
        let ctx = host.context();
        let config = WatchConfig {
            strategy: crate::watch::WatchTeardownStrategy::DestroyAndWait,
            ..WatchConfig::default()
        };
        let (mut subsystem, _rx) = WatchSubsystem::new(ctx.resolver, ctx.marks, config);
        subsystem.start().expect("start");

        subsystem.unwatch_all();
        assert_eq!(host.registered_groups(), 0);
        assert_eq!(host.pending_mark_destruction(), 1);
    }

    #[test]
    fn trustworthy_destroy_flushes_reaper() {
        let host = InProcessHost::new(HarnessConfig {
            trustworthy_destroy: true,
            ..HarnessConfig::default()
        });
        host.add_directory("/data/system");
        let ctx = host.context();
        let config = WatchConfig {
            strategy: crate::watch::WatchTeardownStrategy::DestroyAndWait,
            ..WatchConfig::default()
        };
        let (mut subsystem, _rx) = WatchSubsystem::new(ctx.resolver, ctx.marks, config);
        subsystem.start().expect("start");

        subsystem.unwatch_all();
        assert_eq!(host.pending_mark_destruction(), 0);
        host.mark_module_reclaimed();
        host.fire_delayed();
        assert_eq!(host.use_after_reclaim_count(), 0);
    }

    #[test]
    fn reaper_firing_after_reclaim_counts_use_after_reclaim() {
        let host = host();
        let (subsystem, _rx) = started_watch(&host);

        // Unregister through the registry directly to leave reaper work.
        let registered = lock_unpoisoned(&host.inner.marks).clone();
        for mark in &registered {
            host.unregister_mark(mark);
        }
        assert_eq!(host.pending_mark_destruction(), 1);

        host.mark_module_reclaimed();
        host.fire_delayed();
        assert_eq!(host.use_after_reclaim_count(), 1);
        drop(subsystem);
    }

    #[test]
    fn fire_event_reaches_registered_groups() {
        let host = host();
        let (subsystem, rx) = started_watch(&host);
        let outcomes = host.fire_event(&FsEvent::created("packages.list"));
        assert_eq!(outcomes, vec![DispatchOutcome::Forwarded]);
        assert!(rx.try_recv().expect("signal").full_rescan);
        drop(subsystem);
    }

    // -- Introspection --

    #[test]
    fn hide_returns_original_parent_once() {
        let host = host();
        let parent = host.hide().expect("first hide");
        assert_eq!(parent.name, "module_set");
        assert!(!host.introspection_visible());
        assert!(host.hide().is_none());
    }

    #[test]
    fn show_restores_with_given_parent() {
        let host = host();
        let parent = host.hide().expect("hide");
        host.show(parent.clone()).expect("show");
        assert!(host.introspection_visible());
        assert_eq!(host.restored_parent(), Some(parent));
    }

    #[test]
    fn failing_restore_is_reported() {
        let host = InProcessHost::new(HarnessConfig {
            fail_restore: true,
            ..HarnessConfig::default()
        });
        let parent = host.hide().expect("hide");
        assert!(host.show(parent).is_err());
    }

    // -- Plumbing --

    #[test]
    fn host_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<InProcessHost>();
    }

    #[test]
    fn dropping_host_joins_workers() {
        let host = InProcessHost::new(HarnessConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let clone = Arc::clone(&counter);
        host.enqueue_immediate(Box::new(move || {
            clone.fetch_add(1, Ordering::SeqCst);
        }));
        host.drain_immediate();
        drop(host);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
