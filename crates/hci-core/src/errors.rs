//! Error types for the HCI engine.
//!
//! Protocol and peer failures never surface as errors to applications;
//! they resolve to a status on the corresponding application event.
//! These types cover the synchronous failure paths: invalid API use,
//! resource exhaustion, and binding failures.

use thiserror::Error;

use crate::types::AppHandle;

/// Errors from registry table operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("application table full")]
    AppsFull,

    #[error("application name too long")]
    NameTooLong,

    #[error("application name already registered")]
    DuplicateName,

    #[error("unknown application {0}")]
    UnknownApp(AppHandle),

    #[error("gate {0:#04x} owned by another application")]
    GateInUse(u8),

    #[error("gate id {0:#04x} outside the allocatable ranges")]
    InvalidGate(u8),

    #[error("no free gate in the proprietary range")]
    NoFreeGate,

    #[error("unknown gate {0:#04x}")]
    UnknownGate(u8),

    #[error("no free pipe slot")]
    NoFreePipe,

    #[error("unknown pipe {0:#04x}")]
    UnknownPipe(u8),

    #[error("a pipe already connects gate {local_gate:#04x} to host {dest_host:#04x} gate {dest_gate:#04x}")]
    DuplicatePipe {
        local_gate: u8,
        dest_host: u8,
        dest_gate: u8,
    },
}

/// Why a persisted configuration blob was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("blob length {0} does not match the fixed layout")]
    BadLength(usize),

    #[error("duplicate or malformed application name")]
    BadAppTable,

    #[error("flag byte {0:#04x} is not a boolean")]
    BadFlag(u8),

    #[error("gate entry {0:#04x} invalid or duplicated")]
    BadGate(u8),

    #[error("gate {0:#04x} owner is not a registered application")]
    BadGateOwner(u8),

    #[error("pipe entry {0:#04x} invalid or duplicated")]
    BadPipe(u8),

    #[error("gate pipe-slot set references a missing or foreign pipe")]
    BadPipeSlot,

    #[error("identity gate pipe set does not match the pipe table")]
    IdentitySetMismatch,
}

/// Errors from the persistence binding.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("record not found: block {0:#04x}")]
    NotFound(u8),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),
}
