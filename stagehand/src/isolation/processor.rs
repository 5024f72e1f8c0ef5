//! External collaborators: the per-event-type `EventProcessor` and the
//! injected `PathValidator`. Both are out of scope for the engine itself —
//! only their contracts live here.

use async_trait::async_trait;

use super::error::Result;
use super::types::{CancelToken, IOEvent, OperationContext, Outcome};

/// Performs the actual byte-level work for one event type: file syscalls,
/// audio DSP, MIDI decoding, network codec, etc. Supplied per event type at
/// `IsolationManager` construction.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    async fn process(
        &self,
        event: IOEvent,
        ctx: OperationContext,
        cancel: CancelToken,
    ) -> Result<Outcome>;
}

/// Outcome of a path validation check.
#[derive(Clone, Debug)]
pub struct Validation {
    pub ok: bool,
    pub reason: Option<String>,
}

impl Validation {
    pub fn ok() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

/// The safety/validation policy on file paths. Injected into the manager at
/// construction rather than referenced as a global singleton.
pub trait PathValidator: Send + Sync {
    fn validate_read(&self, path: &std::path::Path) -> Validation;
    fn validate_write(&self, path: &std::path::Path) -> Validation;
}

/// A `PathValidator` that accepts everything. Useful for event types that
/// never touch the filesystem, and as a test default.
pub struct PermissiveValidator;

impl PathValidator for PermissiveValidator {
    fn validate_read(&self, _path: &std::path::Path) -> Validation {
        Validation::ok()
    }

    fn validate_write(&self, _path: &std::path::Path) -> Validation {
        Validation::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn permissive_validator_accepts_any_path_for_read_and_write() {
        let validator = PermissiveValidator;
        assert!(validator.validate_read(Path::new("/etc/passwd")).ok);
        assert!(validator.validate_write(Path::new("/etc/passwd")).ok);
    }

    #[test]
    fn rejected_validation_carries_a_reason() {
        let validation = Validation::rejected("outside sandbox root");
        assert!(!validation.ok);
        assert_eq!(validation.reason.as_deref(), Some("outside sandbox root"));
    }
}
