//! Elevated-credential ownership and the disposal decision.
//!
//! The manager owns at most one elevated credential for the lifetime of the
//! extension.  Disposal at teardown is the delicate part: releasing the
//! credential schedules an epoch-deferred destructor on a host worker thread,
//! and that destructor is only safe if no other subsystem still holds a
//! reference it will drop *after* the teardown's epoch wait.  The controller
//! cannot verify that locally, because helpers such as the mount-namespace
//! shim take and drop references outside its view.  Absent
//! that proof, disposal abandons the credential: host tracking is
//! relinquished and the object leaks (a fixed few hundred bytes, reclaimed
//! only when the host restarts).  Abandonment is a first-class terminal
//! state here, not a missing cleanup.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::host::{AllocationFailure, CredentialApi, HostCredential};

// ---------------------------------------------------------------------------
// CredentialState — ownership state machine
// ---------------------------------------------------------------------------

/// Ownership state of the managed credential.
///
/// Transitions: Absent →(create)→ Owned →(dispose)→ Released | Abandoned.
/// Released and Abandoned are terminal; disposal happens at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Absent,
    Owned,
    Released,
    Abandoned,
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Owned => write!(f, "owned"),
            Self::Released => write!(f, "released"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

// ---------------------------------------------------------------------------
// CredentialDisposal — the configured teardown choice
// ---------------------------------------------------------------------------

/// How teardown disposes of the credential.
///
/// `Release` is only sound when the deployment can prove no other subsystem
/// retains a credential reference past the reclamation-epoch wait.  The
/// default is `Abandon`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialDisposal {
    Release,
    #[default]
    Abandon,
}

impl fmt::Display for CredentialDisposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Release => write!(f, "release"),
            Self::Abandon => write!(f, "abandon"),
        }
    }
}

// ---------------------------------------------------------------------------
// CredentialError
// ---------------------------------------------------------------------------

/// Errors from credential management.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialError {
    /// A credential already exists or was already disposed; at most one is
    /// ever created.
    AlreadyCreated { state: CredentialState },
    /// The host could not produce a credential.  The extension continues
    /// without elevated capability.
    Allocation,
}

impl CredentialError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyCreated { .. } => "credential_already_created",
            Self::Allocation => "credential_allocation_failed",
        }
    }
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyCreated { state } => {
                write!(f, "credential already created (state={state})")
            }
            Self::Allocation => write!(f, "host credential allocation failed"),
        }
    }
}

impl std::error::Error for CredentialError {}

impl From<AllocationFailure> for CredentialError {
    fn from(_: AllocationFailure) -> Self {
        Self::Allocation
    }
}

// ---------------------------------------------------------------------------
// CredentialEvent — structured ledger
// ---------------------------------------------------------------------------

/// Structured event emitted by credential operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialEvent {
    pub step: String,
    pub outcome: String,
    pub state: CredentialState,
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// CredentialHandle
// ---------------------------------------------------------------------------

/// The managed credential: the host object plus local bookkeeping.
#[derive(Debug)]
pub struct CredentialHandle {
    credential: HostCredential,
    valid: bool,
    created_at: DateTime<Utc>,
}

impl CredentialHandle {
    fn new(credential: HostCredential) -> Self {
        Self {
            credential,
            valid: true,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.credential.id()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

// ---------------------------------------------------------------------------
// CredentialManager
// ---------------------------------------------------------------------------

/// Owns the singleton credential and applies the disposal decision.
pub struct CredentialManager {
    api: Arc<dyn CredentialApi>,
    handle: Option<CredentialHandle>,
    state: CredentialState,
    events: Vec<CredentialEvent>,
}

impl CredentialManager {
    pub fn new(api: Arc<dyn CredentialApi>) -> Self {
        Self {
            api,
            handle: None,
            state: CredentialState::Absent,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> CredentialState {
        self.state
    }

    /// True while the extension holds a usable elevated credential.
    pub fn has_elevated_capability(&self) -> bool {
        self.state == CredentialState::Owned
            && self.handle.as_ref().is_some_and(CredentialHandle::is_valid)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.handle.as_ref().map(CredentialHandle::created_at)
    }

    /// Create the elevated credential.  At most one is ever created; a
    /// second call fails without touching the host.
    pub fn create(&mut self) -> Result<(), CredentialError> {
        if self.state != CredentialState::Absent {
            return Err(CredentialError::AlreadyCreated { state: self.state });
        }
        match self.api.create_credential() {
            Ok(credential) => {
                self.handle = Some(CredentialHandle::new(credential));
                self.state = CredentialState::Owned;
                self.push_event("create", "ok", None);
                Ok(())
            }
            Err(failure) => {
                self.push_event("create", "error", Some(failure.to_string()));
                Err(CredentialError::Allocation)
            }
        }
    }

    /// Dispose of the credential exactly once.
    ///
    /// `Release` hands the object back to the host, which schedules an
    /// epoch-deferred destructor; the caller must follow with an epoch wait.
    /// `Abandon` relinquishes tracking and leaks the object.  Either way the
    /// handle is gone afterwards: no later code path can dereference it.
    /// Calling again, or calling with no credential, is a logged no-op.
    pub fn release_or_abandon(&mut self, disposal: CredentialDisposal) -> CredentialState {
        let Some(mut handle) = self.handle.take() else {
            self.push_event("dispose", "noop", Some(self.state.to_string()));
            return self.state;
        };
        handle.valid = false;
        match disposal {
            CredentialDisposal::Release => {
                self.api.release(handle.credential);
                self.state = CredentialState::Released;
            }
            CredentialDisposal::Abandon => {
                self.api.abandon(handle.credential);
                self.state = CredentialState::Abandoned;
            }
        }
        self.push_event("dispose", "ok", Some(disposal.to_string()));
        self.state
    }

    /// Drain the structured event ledger.
    pub fn drain_events(&mut self) -> Vec<CredentialEvent> {
        std::mem::take(&mut self.events)
    }

    fn push_event(&mut self, step: &str, outcome: &str, detail: Option<String>) {
        self.events.push(CredentialEvent {
            step: step.to_string(),
            outcome: outcome.to_string(),
            state: self.state,
            detail,
        });
    }
}

impl fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialManager")
            .field("state", &self.state)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct RecordingApi {
        next_id: AtomicU64,
        fail_create: bool,
        released: Mutex<Vec<u64>>,
        abandoned: Mutex<Vec<u64>>,
    }

    impl CredentialApi for RecordingApi {
        fn create_credential(&self) -> Result<HostCredential, AllocationFailure> {
            if self.fail_create {
                return Err(AllocationFailure);
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(HostCredential::new(id))
        }

        fn release(&self, credential: HostCredential) {
            self.released.lock().unwrap().push(credential.id());
        }

        fn abandon(&self, credential: HostCredential) {
            self.abandoned.lock().unwrap().push(credential.id());
        }
    }

    fn manager() -> (CredentialManager, Arc<RecordingApi>) {
        let api = Arc::new(RecordingApi::default());
        (CredentialManager::new(api.clone()), api)
    }

    // -- State machine --

    #[test]
    fn create_transitions_absent_to_owned() {
        let (mut manager, _api) = manager();
        assert_eq!(manager.state(), CredentialState::Absent);
        assert!(!manager.has_elevated_capability());

        manager.create().expect("create");
        assert_eq!(manager.state(), CredentialState::Owned);
        assert!(manager.has_elevated_capability());
        assert!(manager.created_at().is_some());
    }

    #[test]
    fn second_create_is_rejected() {
        let (mut manager, _api) = manager();
        manager.create().expect("create");
        let err = manager.create().expect_err("singleton");
        assert_eq!(
            err,
            CredentialError::AlreadyCreated {
                state: CredentialState::Owned,
            }
        );
        assert_eq!(err.error_code(), "credential_already_created");
    }

    #[test]
    fn allocation_failure_degrades_without_capability() {
        let api = Arc::new(RecordingApi {
            fail_create: true,
            ..RecordingApi::default()
        });
        let mut manager = CredentialManager::new(api);
        let err = manager.create().expect_err("allocation");
        assert_eq!(err, CredentialError::Allocation);
        assert_eq!(manager.state(), CredentialState::Absent);
        assert!(!manager.has_elevated_capability());
    }

    // -- Disposal --

    #[test]
    fn abandon_relinquishes_without_release() {
        let (mut manager, api) = manager();
        manager.create().expect("create");

        let state = manager.release_or_abandon(CredentialDisposal::Abandon);
        assert_eq!(state, CredentialState::Abandoned);
        assert!(!manager.has_elevated_capability());
        assert_eq!(api.abandoned.lock().unwrap().len(), 1);
        assert!(api.released.lock().unwrap().is_empty());
    }

    #[test]
    fn release_hands_credential_to_host() {
        let (mut manager, api) = manager();
        manager.create().expect("create");

        let state = manager.release_or_abandon(CredentialDisposal::Release);
        assert_eq!(state, CredentialState::Released);
        assert_eq!(api.released.lock().unwrap().len(), 1);
        assert!(api.abandoned.lock().unwrap().is_empty());
    }

    #[test]
    fn disposal_is_idempotent() {
        let (mut manager, api) = manager();
        manager.create().expect("create");
        manager.release_or_abandon(CredentialDisposal::Abandon);

        let state = manager.release_or_abandon(CredentialDisposal::Release);
        assert_eq!(state, CredentialState::Abandoned);
        assert!(api.released.lock().unwrap().is_empty());
        assert_eq!(api.abandoned.lock().unwrap().len(), 1);
    }

    #[test]
    fn disposal_without_credential_is_noop() {
        let (mut manager, api) = manager();
        let state = manager.release_or_abandon(CredentialDisposal::Abandon);
        assert_eq!(state, CredentialState::Absent);
        assert!(api.abandoned.lock().unwrap().is_empty());
    }

    #[test]
    fn default_disposal_is_abandon() {
        assert_eq!(CredentialDisposal::default(), CredentialDisposal::Abandon);
    }

    // -- Events --

    #[test]
    fn events_record_create_and_dispose() {
        let (mut manager, _api) = manager();
        manager.create().expect("create");
        manager.release_or_abandon(CredentialDisposal::Abandon);

        let events = manager.drain_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].step, "create");
        assert_eq!(events[0].outcome, "ok");
        assert_eq!(events[1].step, "dispose");
        assert_eq!(events[1].detail.as_deref(), Some("abandon"));
        assert_eq!(events[1].state, CredentialState::Abandoned);
    }

    #[test]
    fn drain_events_clears_ledger() {
        let (mut manager, _api) = manager();
        manager.create().expect("create");
        assert_eq!(manager.drain_events().len(), 1);
        assert!(manager.drain_events().is_empty());
    }

    // -- Display / serde --

    #[test]
    fn credential_state_display_all_unique() {
        let displays: std::collections::BTreeSet<String> = [
            CredentialState::Absent,
            CredentialState::Owned,
            CredentialState::Released,
            CredentialState::Abandoned,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(displays.len(), 4);
    }

    #[test]
    fn credential_state_serde_roundtrip() {
        for state in [
            CredentialState::Absent,
            CredentialState::Owned,
            CredentialState::Released,
            CredentialState::Abandoned,
        ] {
            let json = serde_json::to_string(&state).expect("serialize");
            let restored: CredentialState = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(state, restored);
        }
    }

    #[test]
    fn credential_disposal_serde_roundtrip() {
        for disposal in [CredentialDisposal::Release, CredentialDisposal::Abandon] {
            let json = serde_json::to_string(&disposal).expect("serialize");
            let restored: CredentialDisposal =
                serde_json::from_str(&json).expect("deserialize");
            assert_eq!(disposal, restored);
        }
    }

    #[test]
    fn credential_error_display() {
        let err = CredentialError::AlreadyCreated {
            state: CredentialState::Owned,
        };
        assert!(err.to_string().contains("owned"));
        assert!(CredentialError::Allocation.to_string().contains("allocation"));
    }

    #[test]
    fn state_ordering_is_monotonic() {
        assert!(CredentialState::Absent < CredentialState::Owned);
        assert!(CredentialState::Owned < CredentialState::Released);
        assert!(CredentialState::Released < CredentialState::Abandoned);
    }
}
