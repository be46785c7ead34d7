//! Host collaborator surface consumed by the extension core.
//!
//! The extension never owns the host's deferred-work machinery, reclamation
//! bookkeeping, credential allocator, or watch registration backend; it only
//! observes them through the narrow traits defined here.  This module is the
//! single approved boundary between the lifecycle core and whatever host it
//! is loaded into: production code binds these traits to a real kernel
//! surface, tests bind them to [`crate::host_harness::InProcessHost`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::watch::{WatchGroup, WatchMark};

// ---------------------------------------------------------------------------
// WorkItem — a unit of host-deferred work
// ---------------------------------------------------------------------------

/// A deferred callback the host runs on one of its worker threads.
pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

// ---------------------------------------------------------------------------
// WorkQueue — system-wide deferred work
// ---------------------------------------------------------------------------

/// The host's system-wide deferred work queue.
///
/// `drain_immediate` blocks until every work item that was already enqueued
/// on the immediate lane at the time of the call has run.  It does NOT cover
/// delay/timer-scheduled items; those fire on their own schedule and are the
/// reason the watch subsystem cannot always trust destroy-and-wait teardown.
pub trait WorkQueue: Send + Sync {
    /// Queue a task for execution at the next worker opportunity.
    fn enqueue_immediate(&self, task: WorkItem);
    /// Queue a task behind a timer.  Never covered by `drain_immediate`.
    fn enqueue_delayed(&self, task: WorkItem);
    /// Block until all currently-queued immediate tasks have completed.
    fn drain_immediate(&self);
}

// ---------------------------------------------------------------------------
// ReclamationDomain — epoch-deferred destruction
// ---------------------------------------------------------------------------

/// The host's deferred-reclamation service.
///
/// Destructors scheduled here run asynchronously once every holder that
/// observed the object before the current epoch has finished with it.
/// `await_epoch` blocks until every destructor scheduled strictly before the
/// call has executed.  It is a coarse, host-wide barrier that trades latency
/// for certainty.
pub trait ReclamationDomain: Send + Sync {
    /// Schedule a destructor to run after the current epoch completes.
    fn schedule_deferred_destructor(&self, destructor: WorkItem);
    /// Block until every destructor scheduled before this call has run.
    fn await_epoch(&self);
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// An opaque elevated-privilege credential object owned by the host.
///
/// Deliberately neither `Clone` nor `Copy`: exactly one owner at a time, and
/// disposal consumes it.
#[derive(Debug)]
pub struct HostCredential {
    id: u64,
}

impl HostCredential {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// The host cannot produce the requested resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("host cannot produce a credential object")]
pub struct AllocationFailure;

/// Host credential allocator.
pub trait CredentialApi: Send + Sync {
    /// Produce a new elevated credential, or fail if the host cannot.
    fn create_credential(&self) -> Result<HostCredential, AllocationFailure>;
    /// Request destruction.  The host schedules an epoch-deferred destructor;
    /// the object is not gone until a later `await_epoch` covers it.
    fn release(&self, credential: HostCredential);
    /// Relinquish tracking without destruction.  The object is leaked for the
    /// lifetime of the host.
    fn abandon(&self, credential: HostCredential);
}

// ---------------------------------------------------------------------------
// Path / inode resolution
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Inode {
    ino: u64,
}

/// A reference-counted handle on a host inode.  Cloning takes another strong
/// reference; the inode stays pinned while any clone is alive.
#[derive(Debug, Clone)]
pub struct InodeRef(Arc<Inode>);

impl InodeRef {
    pub fn new(ino: u64) -> Self {
        Self(Arc::new(Inode { ino }))
    }

    pub fn ino(&self) -> u64 {
        self.0.ino
    }

    /// Number of live strong references, including this one.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// A reference-counted handle on the path that resolved an inode.
#[derive(Debug, Clone)]
pub struct PathRef(Arc<String>);

impl PathRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self(Arc::new(path.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A successful path resolution: the inode plus the path handle that found it.
#[derive(Debug, Clone)]
pub struct ResolvedDir {
    pub inode: InodeRef,
    pub path: PathRef,
}

/// Path lookup failure.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ResolveError {
    /// The path does not exist yet.  Callers tolerate this and do not retry.
    #[error("path not ready: {path}")]
    NotFound { path: String },
}

/// Host-side path lookup with reference-counted results.
pub trait PathResolver: Send + Sync {
    fn resolve(&self, path: &str) -> Result<ResolvedDir, ResolveError>;
}

// ---------------------------------------------------------------------------
// Watch mark registration backend
// ---------------------------------------------------------------------------

/// Mark registration rejected by the host.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("mark registration rejected: {reason}")]
pub struct RegistrationFailure {
    pub reason: String,
}

/// The host's filesystem-change notification backend.
///
/// `unregister_mark` schedules the mark's destruction asynchronously (the
/// host reaper runs as delayed work).  `destroy_group_with_wait` claims to
/// block until that destruction has finished, but whether the wait actually
/// covers the reaper is a property of the running host that this core cannot
/// verify; see [`crate::watch::WatchTeardownStrategy`].
pub trait MarkRegistry: Send + Sync {
    fn register_mark(
        &self,
        group: &Arc<WatchGroup>,
        mark: &Arc<WatchMark>,
    ) -> Result<(), RegistrationFailure>;
    fn unregister_mark(&self, mark: &Arc<WatchMark>);
    fn destroy_group_with_wait(&self, group: &Arc<WatchGroup>);
}

// ---------------------------------------------------------------------------
// Management-interface (introspection) registration
// ---------------------------------------------------------------------------

/// The parent reference an introspection entry had before it was hidden.
/// Restoring under any other parent can leave the host's later cleanup of the
/// entry inconsistent, so `hide` hands the original back for safekeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedParent {
    pub name: String,
}

/// Introspection-entry restore failure.  Non-fatal: the extension stays
/// invisible in the host's introspection tree but otherwise functional.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("introspection entry restore failed: {reason}")]
pub struct RestoreError {
    pub reason: String,
}

/// The host's introspection tree entry for this extension.
pub trait IntrospectionRegistry: Send + Sync {
    /// Remove the entry, returning the original parent reference if the
    /// entry was visible.
    fn hide(&self) -> Option<SavedParent>;
    /// Re-add the entry under the given parent.
    fn show(&self, parent: SavedParent) -> Result<(), RestoreError>;
}

// ---------------------------------------------------------------------------
// HostContext — the injected collaborator bundle
// ---------------------------------------------------------------------------

/// Everything the lifecycle core needs from its host, bundled so subsystems
/// receive an explicit context instead of reaching for process-wide state.
#[derive(Clone)]
pub struct HostContext {
    pub work_queue: Arc<dyn WorkQueue>,
    pub reclamation: Arc<dyn ReclamationDomain>,
    pub credentials: Arc<dyn CredentialApi>,
    pub resolver: Arc<dyn PathResolver>,
    pub marks: Arc<dyn MarkRegistry>,
    pub introspection: Arc<dyn IntrospectionRegistry>,
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Lock helper
// ---------------------------------------------------------------------------

/// Poisoning only records that a previous holder panicked; dispatch and
/// teardown must keep working on whatever state remains.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- Handles --

    #[test]
    fn host_credential_carries_id() {
        let cred = HostCredential::new(42);
        assert_eq!(cred.id(), 42);
    }

    #[test]
    fn inode_ref_counts_strong_references() {
        let inode = InodeRef::new(7);
        assert_eq!(inode.strong_count(), 1);
        let second = inode.clone();
        assert_eq!(inode.strong_count(), 2);
        drop(second);
        assert_eq!(inode.strong_count(), 1);
    }

    #[test]
    fn path_ref_exposes_path() {
        let path = PathRef::new("/data/system");
        assert_eq!(path.as_str(), "/data/system");
    }

    // -- Errors --

    #[test]
    fn allocation_failure_display() {
        assert_eq!(
            AllocationFailure.to_string(),
            "host cannot produce a credential object"
        );
    }

    #[test]
    fn resolve_error_display_names_path() {
        let err = ResolveError::NotFound {
            path: "/data/system".to_string(),
        };
        assert_eq!(err.to_string(), "path not ready: /data/system");
    }

    #[test]
    fn registration_failure_display() {
        let err = RegistrationFailure {
            reason: "backend full".to_string(),
        };
        assert!(err.to_string().contains("backend full"));
    }

    #[test]
    fn restore_error_display() {
        let err = RestoreError {
            reason: "entry exists".to_string(),
        };
        assert!(err.to_string().contains("entry exists"));
    }

    // -- Serde --

    #[test]
    fn saved_parent_serde_roundtrip() {
        let parent = SavedParent {
            name: "module_set".to_string(),
        };
        let json = serde_json::to_string(&parent).expect("serialize");
        let restored: SavedParent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parent, restored);
    }

    #[test]
    fn resolve_error_serde_roundtrip() {
        let err = ResolveError::NotFound {
            path: "/x".to_string(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let restored: ResolveError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err, restored);
    }

    // -- Lock helper --

    #[test]
    fn lock_unpoisoned_recovers_after_panic() {
        let mutex = Arc::new(Mutex::new(5_u32));
        let clone = Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().expect("first lock");
            panic!("poison the lock");
        })
        .join();
        assert_eq!(*lock_unpoisoned(&mutex), 5);
    }
}
