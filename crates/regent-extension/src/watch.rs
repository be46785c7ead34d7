//! Directory-watch subsystem: mark lifecycle, event dispatch, and the
//! passivate-or-destroy teardown decision.
//!
//! One watch group owns one mark per watched directory.  A mark pins the
//! resolved inode with a strong reference and forwards a rescan signal when
//! a change event names the trigger file exactly.  Teardown has two shapes:
//! destroy-and-wait hands everything back to the host and trusts its
//! destruction wait to cover the asynchronously-scheduled mark reaper, while
//! passivate-and-abandon neutralizes the group in place and leaks it,
//! because on hosts where that wait does not actually block, triggering
//! destruction at all races the reaper against module unload.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::host::{
    InodeRef, MarkRegistry, PathRef, PathResolver, ResolveError, ResolvedDir, lock_unpoisoned,
};
use crate::subsystem::{Subsystem, SubsystemError};

// ---------------------------------------------------------------------------
// EventMask — filesystem-change event bits
// ---------------------------------------------------------------------------

bitflags! {
    /// Filesystem-change event mask, shared between marks and events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u32 {
        const CREATE = 1 << 0;
        const MOVED_FROM = 1 << 1;
        const MOVED_TO = 1 << 2;
        const DELETE = 1 << 3;
        const MODIFY = 1 << 4;
        /// Deliver events for children of the watched directory.
        const EVENT_ON_CHILD = 1 << 5;
        /// The changed entry is itself a directory.
        const IS_DIR = 1 << 6;

        const MOVE = Self::MOVED_FROM.bits() | Self::MOVED_TO.bits();
    }
}

impl Serialize for EventMask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for EventMask {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        Ok(Self::from_bits_truncate(bits))
    }
}

// ---------------------------------------------------------------------------
// FsEvent — one delivered notification
// ---------------------------------------------------------------------------

/// A filesystem-change notification as delivered to a watch group.
#[derive(Debug, Clone)]
pub struct FsEvent {
    pub mask: EventMask,
    /// Name of the changed child entry, if the event carries one.
    pub child_name: Option<String>,
}

impl FsEvent {
    pub fn new(mask: EventMask) -> Self {
        Self {
            mask,
            child_name: None,
        }
    }

    pub fn for_child(mask: EventMask, name: impl Into<String>) -> Self {
        Self {
            mask,
            child_name: Some(name.into()),
        }
    }

    pub fn created(name: impl Into<String>) -> Self {
        Self::for_child(EventMask::CREATE, name)
    }

    pub fn moved_to(name: impl Into<String>) -> Self {
        Self::for_child(EventMask::MOVED_TO, name)
    }
}

// ---------------------------------------------------------------------------
// RescanSignal — the outward notification
// ---------------------------------------------------------------------------

/// Notification sent to the privilege-recomputation collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescanSignal {
    pub full_rescan: bool,
}

// ---------------------------------------------------------------------------
// DispatchOutcome
// ---------------------------------------------------------------------------

/// What happened to one delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Trigger matched; a rescan signal was sent.
    Forwarded,
    /// The group is shutting down; the event was ignored untouched.
    GroupShutDown,
    /// No mark matched the event.
    NoMatch,
    /// Trigger matched but the signal channel was full; signal dropped.
    Dropped,
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forwarded => write!(f, "forwarded"),
            Self::GroupShutDown => write!(f, "group_shut_down"),
            Self::NoMatch => write!(f, "no_match"),
            Self::Dropped => write!(f, "dropped"),
        }
    }
}

// ---------------------------------------------------------------------------
// WatchMark — one directory registration
// ---------------------------------------------------------------------------

/// A registration binding an event mask to one inode.
///
/// While the mark is active it holds a strong reference to the inode it
/// watches and to the path that resolved it.  The mask is atomic so a mark
/// can be neutralized (mask zeroed, no further dispatch) without
/// unregistration.
#[derive(Debug)]
pub struct WatchMark {
    path: String,
    trigger: String,
    mask: AtomicU32,
    inode: Mutex<Option<InodeRef>>,
    resolved: Mutex<Option<PathRef>>,
}

impl WatchMark {
    fn new(dir: &WatchDirConfig, resolved: ResolvedDir) -> Self {
        Self {
            path: dir.path.clone(),
            trigger: dir.trigger.clone(),
            mask: AtomicU32::new(dir.mask.bits()),
            inode: Mutex::new(Some(resolved.inode)),
            resolved: Mutex::new(Some(resolved.path)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    pub fn mask(&self) -> EventMask {
        EventMask::from_bits_truncate(self.mask.load(Ordering::Acquire))
    }

    pub fn set_mask(&self, mask: EventMask) {
        self.mask.store(mask.bits(), Ordering::Release);
    }

    /// True while the mark still pins its inode.
    pub fn holds_inode_ref(&self) -> bool {
        lock_unpoisoned(&self.inode).is_some()
    }

    /// Stop dispatching without unregistration.
    pub(crate) fn neutralize(&self) {
        self.set_mask(EventMask::empty());
    }

    /// Drop the strong inode and path references (destroy path only).
    pub(crate) fn release_refs(&self) {
        lock_unpoisoned(&self.inode).take();
        lock_unpoisoned(&self.resolved).take();
    }
}

// ---------------------------------------------------------------------------
// WatchGroup — registration context and dispatch gate
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct GroupState {
    shutting_down: bool,
    marks: Vec<Arc<WatchMark>>,
}

/// The registration context for this extension's watches.
///
/// The shutdown flag and the mark list live behind one lock, and dispatch
/// checks the flag before touching either, so a shut-down group is inert
/// even when a delivery is already in flight on another thread.
#[derive(Debug)]
pub struct WatchGroup {
    state: Mutex<GroupState>,
    signal_tx: SyncSender<RescanSignal>,
    dropped_signals: AtomicU64,
}

impl WatchGroup {
    fn new(signal_tx: SyncSender<RescanSignal>) -> Self {
        Self {
            state: Mutex::new(GroupState {
                shutting_down: false,
                marks: Vec::new(),
            }),
            signal_tx,
            dropped_signals: AtomicU64::new(0),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        lock_unpoisoned(&self.state).shutting_down
    }

    pub fn mark_count(&self) -> usize {
        lock_unpoisoned(&self.state).marks.len()
    }

    /// Signals dropped because the channel was full.
    pub fn dropped_signals(&self) -> u64 {
        self.dropped_signals.load(Ordering::Relaxed)
    }

    /// Deliver one filesystem-change event.  Safe to call from any thread,
    /// concurrently with teardown.
    ///
    /// Only an event that names the trigger file exactly, and is not a
    /// directory-type entry, forwards a rescan signal.  The send never
    /// blocks; a full channel drops the signal and counts the drop.
    pub fn dispatch(&self, event: &FsEvent) -> DispatchOutcome {
        let state = lock_unpoisoned(&self.state);
        if state.shutting_down {
            return DispatchOutcome::GroupShutDown;
        }
        let Some(name) = event.child_name.as_deref() else {
            return DispatchOutcome::NoMatch;
        };
        if event.mask.contains(EventMask::IS_DIR) {
            return DispatchOutcome::NoMatch;
        }
        for mark in &state.marks {
            let mask = mark.mask();
            if mask.is_empty() || !mask.intersects(event.mask) {
                continue;
            }
            if name != mark.trigger() {
                continue;
            }
            return match self.signal_tx.try_send(RescanSignal { full_rescan: true }) {
                Ok(()) => DispatchOutcome::Forwarded,
                Err(_) => {
                    self.dropped_signals.fetch_add(1, Ordering::Relaxed);
                    DispatchOutcome::Dropped
                }
            };
        }
        DispatchOutcome::NoMatch
    }

    /// Neutralize every mark, then latch the shutdown flag, all under the
    /// group lock so no dispatch can interleave between the two.
    pub(crate) fn begin_shutdown(&self) {
        let mut state = lock_unpoisoned(&self.state);
        for mark in &state.marks {
            mark.neutralize();
        }
        state.shutting_down = true;
    }

    fn add_mark(&self, mark: Arc<WatchMark>) {
        lock_unpoisoned(&self.state).marks.push(mark);
    }

    fn marks_snapshot(&self) -> Vec<Arc<WatchMark>> {
        lock_unpoisoned(&self.state).marks.clone()
    }

    fn clear_marks(&self) {
        lock_unpoisoned(&self.state).marks.clear();
    }
}

// ---------------------------------------------------------------------------
// Teardown strategy and disposal state
// ---------------------------------------------------------------------------

/// How `unwatch_all` disposes of the group.
///
/// `DestroyAndWait` is sound only on hosts whose group-destruction wait is
/// verified to block until the asynchronously-scheduled mark reaper has run.
/// When that cannot be proven, `PassivateAndAbandon` is mandatory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchTeardownStrategy {
    DestroyAndWait,
    #[default]
    PassivateAndAbandon,
}

impl fmt::Display for WatchTeardownStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DestroyAndWait => write!(f, "destroy_and_wait"),
            Self::PassivateAndAbandon => write!(f, "passivate_and_abandon"),
        }
    }
}

/// Disposal state of the watch group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupDisposal {
    Active,
    Destroyed,
    /// Passivated in place and intentionally leaked; reclaimed only when
    /// the host restarts.
    Abandoned,
}

impl fmt::Display for GroupDisposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Destroyed => write!(f, "destroyed"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

// ---------------------------------------------------------------------------
// WatchError
// ---------------------------------------------------------------------------

/// Errors from watch operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchError {
    /// The subsystem has not been started.
    NotStarted,
    /// The subsystem was already started.
    AlreadyStarted,
    /// The directory does not exist yet.  Reported once; never retried.
    NotReady { path: String },
    /// The host rejected the mark registration.
    Registration { path: String, reason: String },
}

impl WatchError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotStarted => "watch_not_started",
            Self::AlreadyStarted => "watch_already_started",
            Self::NotReady { .. } => "watch_path_not_ready",
            Self::Registration { .. } => "watch_registration_rejected",
        }
    }
}

impl fmt::Display for WatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "watch subsystem not started"),
            Self::AlreadyStarted => write!(f, "watch subsystem already started"),
            Self::NotReady { path } => write!(f, "watch path not ready: {path}"),
            Self::Registration { path, reason } => {
                write!(f, "mark registration rejected for {path}: {reason}")
            }
        }
    }
}

impl std::error::Error for WatchError {}

// ---------------------------------------------------------------------------
// WatchEvent — structured ledger
// ---------------------------------------------------------------------------

/// Structured event emitted by watch operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub step: String,
    pub path: Option<String>,
    pub outcome: String,
    pub error_code: Option<String>,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// One watched directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchDirConfig {
    pub path: String,
    pub mask: EventMask,
    /// Exact child filename that triggers a rescan signal.
    pub trigger: String,
}

impl WatchDirConfig {
    pub fn new(
        path: impl Into<String>,
        mask: EventMask,
        trigger: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            mask,
            trigger: trigger.into(),
        }
    }
}

impl Default for WatchDirConfig {
    /// The canonical deployment: the package store directory, watched for
    /// creates and moves of `packages.list`.
    fn default() -> Self {
        Self {
            path: "/data/system".to_string(),
            mask: EventMask::CREATE | EventMask::MOVE | EventMask::EVENT_ON_CHILD,
            trigger: "packages.list".to_string(),
        }
    }
}

/// Watch subsystem configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    pub dirs: Vec<WatchDirConfig>,
    pub strategy: WatchTeardownStrategy,
    /// Bounded capacity of the rescan signal channel.
    pub signal_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dirs: vec![WatchDirConfig::default()],
            strategy: WatchTeardownStrategy::default(),
            signal_capacity: 8,
        }
    }
}

// ---------------------------------------------------------------------------
// WatchSubsystem
// ---------------------------------------------------------------------------

/// Owns the watch group and applies the configured teardown strategy.
pub struct WatchSubsystem {
    resolver: Arc<dyn PathResolver>,
    registry: Arc<dyn MarkRegistry>,
    config: WatchConfig,
    signal_tx: SyncSender<RescanSignal>,
    group: Option<Arc<WatchGroup>>,
    disposal: GroupDisposal,
    events: Vec<WatchEvent>,
}

impl WatchSubsystem {
    /// Build the subsystem and hand back the receiving end of the rescan
    /// channel for the privilege-recomputation collaborator.
    pub fn new(
        resolver: Arc<dyn PathResolver>,
        registry: Arc<dyn MarkRegistry>,
        config: WatchConfig,
    ) -> (Self, Receiver<RescanSignal>) {
        let (signal_tx, signal_rx) = sync_channel(config.signal_capacity.max(1));
        (
            Self {
                resolver,
                registry,
                config,
                signal_tx,
                group: None,
                disposal: GroupDisposal::Active,
                events: Vec::new(),
            },
            signal_rx,
        )
    }

    /// A sender onto the rescan channel, for out-of-band kicks.
    pub fn signal_sender(&self) -> SyncSender<RescanSignal> {
        self.signal_tx.clone()
    }

    pub fn group(&self) -> Option<Arc<WatchGroup>> {
        self.group.clone()
    }

    pub fn disposal(&self) -> GroupDisposal {
        self.disposal
    }

    pub fn active_marks(&self) -> usize {
        self.group.as_ref().map_or(0, |group| group.mark_count())
    }

    /// Create the group and register one mark per configured directory.
    /// Directories that do not resolve yet, or whose registration the host
    /// rejects, are skipped; the rest keep working.  Returns the number of
    /// active marks.
    pub fn start(&mut self) -> Result<usize, WatchError> {
        if self.group.is_some() {
            return Err(WatchError::AlreadyStarted);
        }
        self.group = Some(Arc::new(WatchGroup::new(self.signal_tx.clone())));
        self.push_event("group_created", None, "ok", None);

        let dirs = self.config.dirs.clone();
        let mut active = 0;
        for dir in dirs {
            if self.watch(dir).is_ok() {
                active += 1;
            }
        }
        Ok(active)
    }

    /// Register one additional directory watch, returning the active mark.
    ///
    /// A missing directory yields `NotReady` exactly once; there is no
    /// internal retry.  The directory is expected to appear later and the
    /// caller tolerates the missing watch.
    pub fn watch(&mut self, dir: WatchDirConfig) -> Result<Arc<WatchMark>, WatchError> {
        let Some(group) = self.group.clone() else {
            return Err(WatchError::NotStarted);
        };

        let resolved = match self.resolver.resolve(&dir.path) {
            Ok(resolved) => resolved,
            Err(ResolveError::NotFound { path }) => {
                let err = WatchError::NotReady { path };
                self.push_event("watch", Some(&dir.path), "not_ready", Some(err.error_code()));
                return Err(err);
            }
        };

        let mark = Arc::new(WatchMark::new(&dir, resolved));
        if let Err(failure) = self.registry.register_mark(&group, &mark) {
            // Release the partial references taken by resolution.
            mark.release_refs();
            let err = WatchError::Registration {
                path: dir.path.clone(),
                reason: failure.reason,
            };
            self.push_event("watch", Some(&dir.path), "error", Some(err.error_code()));
            return Err(err);
        }

        group.add_mark(Arc::clone(&mark));
        self.push_event("watch", Some(&dir.path), "ok", None);
        Ok(mark)
    }

    /// Tear down every watch using the configured strategy.
    ///
    /// Destroy-and-wait unregisters each mark, asks the host to destroy the
    /// group with its destruction wait, then drops the extension's own
    /// references.  Passivate-and-abandon never triggers destruction:
    /// masks are zeroed and the shutdown flag latched under the group lock,
    /// then group, marks, inode and path references are leaked in place.
    /// Safe to call again once disposed; later calls are no-ops.
    pub fn unwatch_all(&mut self) -> GroupDisposal {
        let Some(group) = self.group.take() else {
            self.push_event("unwatch_all", None, "noop", None);
            return self.disposal;
        };

        match self.config.strategy {
            WatchTeardownStrategy::DestroyAndWait => {
                let marks = group.marks_snapshot();
                for mark in &marks {
                    self.registry.unregister_mark(mark);
                }
                self.registry.destroy_group_with_wait(&group);
                for mark in &marks {
                    mark.release_refs();
                }
                group.clear_marks();
                self.disposal = GroupDisposal::Destroyed;
                self.push_event("unwatch_all", None, "destroyed", None);
            }
            WatchTeardownStrategy::PassivateAndAbandon => {
                group.begin_shutdown();
                // Leak the group (and through it the marks and their inode
                // and path references): the strong count can never reach
                // zero, so the host's defective destruction path is never
                // entered.
                std::mem::forget(group);
                self.disposal = GroupDisposal::Abandoned;
                self.push_event("unwatch_all", None, "abandoned", None);
            }
        }
        self.disposal
    }

    /// Drain the structured event ledger.
    pub fn drain_events(&mut self) -> Vec<WatchEvent> {
        std::mem::take(&mut self.events)
    }

    fn push_event(
        &mut self,
        step: &str,
        path: Option<&str>,
        outcome: &str,
        error_code: Option<&str>,
    ) {
        self.events.push(WatchEvent {
            step: step.to_string(),
            path: path.map(str::to_string),
            outcome: outcome.to_string(),
            error_code: error_code.map(str::to_string),
        });
    }
}

impl fmt::Debug for WatchSubsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchSubsystem")
            .field("disposal", &self.disposal)
            .field("active_marks", &self.active_marks())
            .finish_non_exhaustive()
    }
}

impl Subsystem for WatchSubsystem {
    fn name(&self) -> &str {
        "observer"
    }

    fn init(&mut self) -> Result<(), SubsystemError> {
        // Per-directory failures are tolerated; only double-start is an
        // error at this level.
        self.start()
            .map(|_| ())
            .map_err(|err| SubsystemError::new(err.error_code(), err.to_string()))
    }

    fn teardown(&mut self) -> Result<(), SubsystemError> {
        self.unwatch_all();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
