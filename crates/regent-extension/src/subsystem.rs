//! The seam between the lifecycle controller and its dependent subsystems.
//!
//! The privilege-policy store, feature flags, privilege-call surface, hook
//! installer, allow-list, and daemon bridge all live outside this core; the
//! controller only needs to start them in order and stop them in reverse.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A subsystem the controller initializes and tears down.
///
/// Both operations are best-effort from the controller's point of view: a
/// failure is recorded in the step ledger and the sequence continues.
pub trait Subsystem: Send {
    /// Stable name used in the controller's step ledger.
    fn name(&self) -> &str;
    fn init(&mut self) -> Result<(), SubsystemError>;
    fn teardown(&mut self) -> Result<(), SubsystemError>;
}

/// Failure reported by a subsystem initializer or finalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemError {
    /// Stable snake_case code for the step ledger.
    pub error_code: String,
    pub message: String,
}

impl SubsystemError {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SubsystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subsystem error [{}]: {}", self.error_code, self.message)
    }
}

impl std::error::Error for SubsystemError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsystem_error_display_carries_code_and_message() {
        let err = SubsystemError::new("bridge_socket_missing", "control socket not present");
        let msg = err.to_string();
        assert!(msg.contains("bridge_socket_missing"));
        assert!(msg.contains("control socket not present"));
    }

    #[test]
    fn subsystem_error_serde_roundtrip() {
        let err = SubsystemError::new("hook_install_rejected", "interception table busy");
        let json = serde_json::to_string(&err).expect("serialize");
        let restored: SubsystemError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err, restored);
    }

    #[test]
    fn subsystem_error_implements_std_error() {
        let err = SubsystemError::new("x", "y");
        let dyn_err: &dyn std::error::Error = &err;
        assert!(dyn_err.to_string().contains("[x]"));
    }
}
