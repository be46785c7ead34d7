//! Privileged-extension lifecycle core.
//!
//! This crate is the load/unload machinery of an extension that lives inside
//! a running host kernel.  A controller brings interdependent subsystems up
//! in order; a directory-watch subsystem turns package-store changes into
//! privilege-rescan signals; a singleton manager owns the elevated
//! credential.  The part that earns its keep is the teardown sequence, which
//! interleaves quiescence barriers so that no host worker thread, timer
//! callback, or epoch-deferred destructor can execute extension code after
//! the host reclaims the extension's memory.
//!
//! Two decisions define the design.  First, the credential is abandoned at
//! teardown rather than released, because a release schedules a destructor
//! that other subsystems' stray references can push past the epoch wait; a
//! few hundred leaked bytes beat a worker thread crashing in freed code.
//! Second, the watch group defaults to passivate-and-abandon: on hosts whose
//! group-destruction wait does not actually cover the asynchronously
//! scheduled mark reaper, neutralizing the group in place and leaking it is
//! the only teardown that cannot race the reaper.
//!
//! Hosts are reached exclusively through the traits in [`host`]; the
//! threaded reference implementation in [`host_harness`] backs the tests.

#![forbid(unsafe_code)]

pub mod controller;
pub mod credential;
pub mod host;
pub mod host_harness;
pub mod quiescence;
pub mod subsystem;
pub mod watch;

pub use controller::{
    ControllerConfig, ControllerError, InitReport, LifecycleController, LifecycleEvent,
    LifecyclePhase, ModuleState, TeardownReport,
};
pub use credential::{
    CredentialDisposal, CredentialError, CredentialEvent, CredentialHandle, CredentialManager,
    CredentialState,
};
pub use host::{
    AllocationFailure, CredentialApi, HostContext, HostCredential, InodeRef,
    IntrospectionRegistry, MarkRegistry, PathRef, PathResolver, ReclamationDomain,
    RegistrationFailure, ResolveError, ResolvedDir, RestoreError, SavedParent, WorkItem,
    WorkQueue,
};
pub use host_harness::{HarnessConfig, InProcessHost};
pub use quiescence::{BarrierOp, QuiescenceBarrier};
pub use subsystem::{Subsystem, SubsystemError};
pub use watch::{
    DispatchOutcome, EventMask, FsEvent, GroupDisposal, RescanSignal, WatchConfig,
    WatchDirConfig, WatchError, WatchEvent, WatchGroup, WatchMark, WatchSubsystem,
    WatchTeardownStrategy,
};
