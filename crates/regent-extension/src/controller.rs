//! Lifecycle controller: ordered init, and the teardown sequence that must
//! leave no host worker able to call back into unloaded code.
//!
//! Init is forgiving: a subsystem that fails to come up is logged and the
//! rest keep going, and a missing credential just means no elevated
//! capability.  Teardown is the hard part and runs as a fixed step list:
//! drain the immediate work queue while code is still resident, restore the
//! introspection entry under its original parent, stop subsystems in reverse
//! order, dispose of the credential, then hold the reclamation-epoch and
//! final-drain barriers before the host is allowed to reclaim the
//! extension's memory.  Every step is best-effort and recorded in a
//! structured ledger; teardown never fails outward and never times out.

use std::fmt;
use std::sync::mpsc::SyncSender;

use serde::{Deserialize, Serialize};

use crate::credential::{CredentialDisposal, CredentialEvent, CredentialManager, CredentialState};
use crate::host::{HostContext, SavedParent};
use crate::quiescence::QuiescenceBarrier;
use crate::subsystem::Subsystem;
use crate::watch::RescanSignal;

// ---------------------------------------------------------------------------
// ModuleState — lifecycle state machine
// ---------------------------------------------------------------------------

/// Lifecycle state of the extension.
///
/// Transitions: Uninitialized → Initializing → Running → TearingDown →
/// Unloaded.  Monotonic; Unloaded is terminal and nothing ever re-enters
/// Running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Uninitialized,
    Initializing,
    Running,
    TearingDown,
    Unloaded,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::TearingDown => write!(f, "tearing_down"),
            Self::Unloaded => write!(f, "unloaded"),
        }
    }
}

// ---------------------------------------------------------------------------
// ControllerConfig
// ---------------------------------------------------------------------------

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Emit a prominent notice event at init (debug builds).
    pub debug_banner: bool,
    /// Remove the management-interface entry at init and restore it at
    /// teardown.
    pub hide_introspection_entry: bool,
    /// How teardown disposes of the elevated credential.
    pub credential_disposal: CredentialDisposal,
    /// Repeat the epoch wait after the final drain, in case drained work
    /// scheduled further epoch-deferred destructors.
    pub double_barrier: bool,
    /// Send one rescan signal after the watch subsystem starts, so the
    /// privilege-recomputation collaborator builds its initial state.
    pub initial_rescan_kick: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            debug_banner: false,
            hide_introspection_entry: true,
            credential_disposal: CredentialDisposal::default(),
            double_barrier: true,
            initial_rescan_kick: true,
        }
    }
}

// ---------------------------------------------------------------------------
// LifecycleEvent — the structured step ledger
// ---------------------------------------------------------------------------

/// Which half of the lifecycle a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Init,
    Teardown,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

/// One executed lifecycle step.  Ordering tests read this ledger instead of
/// parsing log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub phase: LifecyclePhase,
    pub step: String,
    pub outcome: String,
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// ControllerError
// ---------------------------------------------------------------------------

/// Errors from controller operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerError {
    /// `init` was already run; registration and re-init are rejected.
    AlreadyInitialized { state: ModuleState },
}

impl ControllerError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyInitialized { .. } => "controller_already_initialized",
        }
    }
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInitialized { state } => {
                write!(f, "controller already initialized (state={state})")
            }
        }
    }
}

impl std::error::Error for ControllerError {}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Outcome summary of `init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitReport {
    pub state: ModuleState,
    pub subsystems_total: usize,
    pub subsystems_failed: usize,
    /// True when the elevated credential was created.
    pub elevated_capability: bool,
    pub introspection_hidden: bool,
}

/// Outcome summary of `teardown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    /// False when the call was a no-op (module was not Running).
    pub performed: bool,
    pub state: ModuleState,
    pub steps_failed: usize,
    pub credential_state: CredentialState,
}

// ---------------------------------------------------------------------------
// LifecycleController
// ---------------------------------------------------------------------------

/// Sequences subsystem startup and the quiescent teardown of the extension.
///
/// Owns the module state, the credential manager, and the registered
/// subsystems; everything host-side is reached through the injected
/// [`HostContext`].
pub struct LifecycleController {
    config: ControllerConfig,
    ctx: HostContext,
    barrier: QuiescenceBarrier,
    credentials: CredentialManager,
    subsystems: Vec<Box<dyn Subsystem>>,
    rescan_tx: Option<SyncSender<RescanSignal>>,
    saved_parent: Option<SavedParent>,
    state: ModuleState,
    events: Vec<LifecycleEvent>,
}

impl LifecycleController {
    pub fn new(ctx: HostContext, config: ControllerConfig) -> Self {
        let barrier = QuiescenceBarrier::new(ctx.work_queue.clone(), ctx.reclamation.clone());
        let credentials = CredentialManager::new(ctx.credentials.clone());
        Self {
            config,
            ctx,
            barrier,
            credentials,
            subsystems: Vec::new(),
            rescan_tx: None,
            saved_parent: None,
            state: ModuleState::Uninitialized,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn credential_state(&self) -> CredentialState {
        self.credentials.state()
    }

    /// The step ledger so far, oldest first.
    pub fn events(&self) -> &[LifecycleEvent] {
        &self.events
    }

    /// Drain the step ledger, including the credential manager's entries
    /// folded in as `credential:*` steps.
    pub fn drain_events(&mut self) -> Vec<LifecycleEvent> {
        let mut events = std::mem::take(&mut self.events);
        for CredentialEvent {
            step,
            outcome,
            detail,
            ..
        } in self.credentials.drain_events()
        {
            let phase = if step == "dispose" {
                LifecyclePhase::Teardown
            } else {
                LifecyclePhase::Init
            };
            events.push(LifecycleEvent {
                phase,
                step: format!("credential:{step}"),
                outcome,
                detail,
            });
        }
        events
    }

    /// Register a subsystem.  Init runs them in registration order and
    /// teardown in strict reverse.  Rejected once `init` has run.
    pub fn register_subsystem(
        &mut self,
        subsystem: Box<dyn Subsystem>,
    ) -> Result<(), ControllerError> {
        if self.state != ModuleState::Uninitialized {
            return Err(ControllerError::AlreadyInitialized { state: self.state });
        }
        self.subsystems.push(subsystem);
        Ok(())
    }

    /// Wire the rescan channel for the post-init kick.
    pub fn set_rescan_sender(&mut self, sender: SyncSender<RescanSignal>) {
        self.rescan_tx = Some(sender);
    }

    /// Initialize everything in dependency order.
    ///
    /// Best-effort throughout: a failing subsystem or a missing credential
    /// degrades the extension, it does not stop the load.
    pub fn init(&mut self) -> Result<InitReport, ControllerError> {
        if self.state != ModuleState::Uninitialized {
            return Err(ControllerError::AlreadyInitialized { state: self.state });
        }
        self.state = ModuleState::Initializing;
        self.push(LifecyclePhase::Init, "init_started", "ok", None);

        if self.config.debug_banner {
            self.push(
                LifecyclePhase::Init,
                "debug_banner",
                "notice",
                Some("running in debug mode".to_string()),
            );
        }

        let elevated = match self.credentials.create() {
            Ok(()) => {
                self.push(LifecyclePhase::Init, "create_credential", "ok", None);
                true
            }
            Err(err) => {
                self.push(
                    LifecyclePhase::Init,
                    "create_credential",
                    "error",
                    Some(err.error_code().to_string()),
                );
                false
            }
        };

        let mut failed = 0;
        for index in 0..self.subsystems.len() {
            let name = self.subsystems[index].name().to_string();
            match self.subsystems[index].init() {
                Ok(()) => {
                    self.push(LifecyclePhase::Init, &format!("init:{name}"), "ok", None);
                }
                Err(err) => {
                    failed += 1;
                    self.push(
                        LifecyclePhase::Init,
                        &format!("init:{name}"),
                        "error",
                        Some(err.error_code),
                    );
                }
            }
        }

        if self.config.initial_rescan_kick
            && let Some(sender) = &self.rescan_tx
        {
            // Nothing changed on disk yet; the collaborator only needs to
            // build its initial state.
            let sent = sender.try_send(RescanSignal { full_rescan: false }).is_ok();
            self.push(
                LifecyclePhase::Init,
                "initial_rescan_kick",
                if sent { "ok" } else { "dropped" },
                None,
            );
        }

        let mut hidden = false;
        if self.config.hide_introspection_entry {
            self.saved_parent = self.ctx.introspection.hide();
            hidden = self.saved_parent.is_some();
            self.push(
                LifecyclePhase::Init,
                "hide_introspection",
                if hidden { "ok" } else { "absent" },
                None,
            );
        }

        self.state = ModuleState::Running;
        self.push(LifecyclePhase::Init, "init_complete", "ok", None);

        Ok(InitReport {
            state: self.state,
            subsystems_total: self.subsystems.len(),
            subsystems_failed: failed,
            elevated_capability: elevated,
            introspection_hidden: hidden,
        })
    }

    /// Tear everything down and block until quiescence.
    ///
    /// A no-op unless the module is Running.  Otherwise runs the full step
    /// sequence; individual failures are counted and skipped, never
    /// propagated, because a half-removed extension is worse than a
    /// degraded teardown.  Returns only when every barrier has been crossed, after
    /// which the host may reclaim the extension's memory.
    pub fn teardown(&mut self) -> TeardownReport {
        if self.state != ModuleState::Running {
            self.push(
                LifecyclePhase::Teardown,
                "teardown_noop",
                "skipped",
                Some(self.state.to_string()),
            );
            return TeardownReport {
                performed: false,
                state: self.state,
                steps_failed: 0,
                credential_state: self.credentials.state(),
            };
        }

        self.state = ModuleState::TearingDown;
        self.push(LifecyclePhase::Teardown, "teardown_started", "ok", None);
        let mut failed = 0;

        // Exiting processes may have pushed handle-close work onto the
        // immediate queue; it must run while this code is still mapped.
        self.barrier.drain_immediate();
        self.push(LifecyclePhase::Teardown, "drain_immediate", "ok", None);

        if let Some(parent) = self.saved_parent.take() {
            match self.ctx.introspection.show(parent) {
                Ok(()) => {
                    self.push(LifecyclePhase::Teardown, "restore_introspection", "ok", None);
                }
                Err(err) => {
                    failed += 1;
                    self.push(
                        LifecyclePhase::Teardown,
                        "restore_introspection",
                        "error",
                        Some(err.reason),
                    );
                }
            }
        }

        for index in (0..self.subsystems.len()).rev() {
            let name = self.subsystems[index].name().to_string();
            match self.subsystems[index].teardown() {
                Ok(()) => {
                    self.push(
                        LifecyclePhase::Teardown,
                        &format!("teardown:{name}"),
                        "ok",
                        None,
                    );
                }
                Err(err) => {
                    failed += 1;
                    self.push(
                        LifecyclePhase::Teardown,
                        &format!("teardown:{name}"),
                        "error",
                        Some(err.error_code),
                    );
                }
            }
        }

        let credential_state = self
            .credentials
            .release_or_abandon(self.config.credential_disposal);
        self.push(
            LifecyclePhase::Teardown,
            "dispose_credential",
            "ok",
            Some(credential_state.to_string()),
        );

        self.barrier.await_epoch();
        self.push(LifecyclePhase::Teardown, "await_epoch", "ok", None);

        // Subsystem teardown and credential disposal may themselves have
        // enqueued immediate work.
        self.barrier.drain_immediate();
        self.push(LifecyclePhase::Teardown, "final_drain", "ok", None);

        if self.config.double_barrier {
            self.barrier.await_epoch();
            self.push(LifecyclePhase::Teardown, "await_epoch_final", "ok", None);
        }

        self.state = ModuleState::Unloaded;
        self.push(LifecyclePhase::Teardown, "teardown_complete", "ok", None);

        TeardownReport {
            performed: true,
            state: self.state,
            steps_failed: failed,
            credential_state,
        }
    }

    fn push(&mut self, phase: LifecyclePhase, step: &str, outcome: &str, detail: Option<String>) {
        self.events.push(LifecycleEvent {
            phase,
            step: step.to_string(),
            outcome: outcome.to_string(),
            detail,
        });
    }
}

impl fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleController")
            .field("state", &self.state)
            .field("subsystems", &self.subsystems.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
