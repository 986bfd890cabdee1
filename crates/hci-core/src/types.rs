//! Identifier spaces, instruction codes, and status values of the HCI
//! gate/pipe protocol.

use std::fmt;

// ============================================================================
// Pipe identifiers
// ============================================================================

/// Static pipe reserved for link management.
pub const LINK_MGMT_PIPE: u8 = 0x00;
/// Static pipe reserved for the admin gate.
pub const ADMIN_PIPE: u8 = 0x01;
/// First dynamically allocated pipe id.
pub const FIRST_DYNAMIC_PIPE: u8 = 0x02;
/// Last dynamically allocated pipe id.
pub const LAST_DYNAMIC_PIPE: u8 = 0x6F;

/// Whether a pipe id lies in the dynamic range.
pub fn is_dynamic_pipe(pipe: u8) -> bool {
    (FIRST_DYNAMIC_PIPE..=LAST_DYNAMIC_PIPE).contains(&pipe)
}

// ============================================================================
// Gate identifiers
// ============================================================================

/// Loopback gate (fixed id).
pub const LOOPBACK_GATE: u8 = 0x04;
/// Identity-management gate (fixed id).
pub const IDENTITY_GATE: u8 = 0x05;
/// Reserved connectivity gate; shared, no single owning application.
pub const CONNECTIVITY_GATE: u8 = 0x41;
/// First host-specific generic gate id.
pub const FIRST_HOST_SPECIFIC_GATE: u8 = 0x10;
/// Last host-specific generic gate id.
pub const LAST_HOST_SPECIFIC_GATE: u8 = 0xEF;
/// First proprietary gate id.
pub const FIRST_PROP_GATE: u8 = 0xF0;
/// Last proprietary gate id.
pub const LAST_PROP_GATE: u8 = 0xFF;

/// Whether a gate id lies in the proprietary range.
pub fn is_prop_gate(gate: u8) -> bool {
    gate >= FIRST_PROP_GATE
}

/// Whether a gate id may be allocated at all.
pub fn is_allocatable_gate(gate: u8) -> bool {
    gate == LOOPBACK_GATE
        || gate == CONNECTIVITY_GATE
        || (FIRST_HOST_SPECIFIC_GATE..=LAST_HOST_SPECIFIC_GATE).contains(&gate)
        || is_prop_gate(gate)
}

/// Whether a gate id is valid as a pipe endpoint (local or remote).
pub fn is_valid_gate(gate: u8) -> bool {
    gate == IDENTITY_GATE || is_allocatable_gate(gate)
}

// ============================================================================
// Host identifiers
// ============================================================================

/// The host controller itself.
pub const HOST_CONTROLLER: u8 = 0x00;
/// The terminal host (this device).
pub const TERMINAL_HOST: u8 = 0x01;
/// First peer host id (e.g. a UICC).
pub const FIRST_PEER_HOST: u8 = 0x02;
/// Number of peer-host slots in the host network.
pub const MAX_PEER_HOSTS: usize = 6;

/// Slot index for a peer host id, if it is one.
pub fn peer_host_slot(host: u8) -> Option<usize> {
    let slot = host.checked_sub(FIRST_PEER_HOST)? as usize;
    (slot < MAX_PEER_HOSTS).then_some(slot)
}

// ============================================================================
// Session identity
// ============================================================================

/// Length of the session identity value.
pub const SESSION_ID_LEN: usize = 8;
/// Well-known "never set" session identity.
pub const SESSION_ID_UNSET: [u8; SESSION_ID_LEN] = [0xFF; SESSION_ID_LEN];

// ============================================================================
// Application handles
// ============================================================================

/// Opaque handle identifying a registered application.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppHandle(pub u8);

/// Handle returned when a registration fails.
pub const INVALID_APP_HANDLE: AppHandle = AppHandle(0xFF);

impl fmt::Display for AppHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "app#{:02x}", self.0)
    }
}

// ============================================================================
// Instructions
// ============================================================================

/// Command instruction codes (6-bit).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HcpCommand {
    AnySetParameter,
    AnyGetParameter,
    AnyOpenPipe,
    AnyClosePipe,
    AdmCreatePipe,
    AdmDeletePipe,
    AdmNotifyPipeCreated,
    AdmNotifyPipeDeleted,
    AdmClearAllPipe,
    AdmNotifyAllPipeCleared,
    ConProHostRequest,
}

impl HcpCommand {
    pub fn code(self) -> u8 {
        match self {
            HcpCommand::AnySetParameter => 0x01,
            HcpCommand::AnyGetParameter => 0x02,
            HcpCommand::AnyOpenPipe => 0x03,
            HcpCommand::AnyClosePipe => 0x04,
            HcpCommand::AdmCreatePipe => 0x10,
            HcpCommand::AdmDeletePipe => 0x11,
            HcpCommand::AdmNotifyPipeCreated => 0x12,
            HcpCommand::AdmNotifyPipeDeleted => 0x13,
            HcpCommand::AdmClearAllPipe => 0x14,
            HcpCommand::AdmNotifyAllPipeCleared => 0x15,
            HcpCommand::ConProHostRequest => 0x3F,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => HcpCommand::AnySetParameter,
            0x02 => HcpCommand::AnyGetParameter,
            0x03 => HcpCommand::AnyOpenPipe,
            0x04 => HcpCommand::AnyClosePipe,
            0x10 => HcpCommand::AdmCreatePipe,
            0x11 => HcpCommand::AdmDeletePipe,
            0x12 => HcpCommand::AdmNotifyPipeCreated,
            0x13 => HcpCommand::AdmNotifyPipeDeleted,
            0x14 => HcpCommand::AdmClearAllPipe,
            0x15 => HcpCommand::AdmNotifyAllPipeCleared,
            0x3F => HcpCommand::ConProHostRequest,
            _ => return None,
        })
    }
}

/// Response instruction codes (6-bit).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HcpResponse {
    AnyOk,
    AnyENotConnected,
    AnyECmdParUnknown,
    AnyENok,
    AnyEPipesFull,
    AnyERegParUnknown,
    AnyEPipeNotOpened,
    AnyECmdNotSupported,
    AnyEInhibited,
    AnyETimeout,
    AnyERegAccessDenied,
    AnyEPipeAccessDenied,
    /// Codes outside the defined set, forwarded verbatim.
    Other(u8),
}

impl HcpResponse {
    pub fn code(self) -> u8 {
        match self {
            HcpResponse::AnyOk => 0x00,
            HcpResponse::AnyENotConnected => 0x01,
            HcpResponse::AnyECmdParUnknown => 0x02,
            HcpResponse::AnyENok => 0x03,
            HcpResponse::AnyEPipesFull => 0x04,
            HcpResponse::AnyERegParUnknown => 0x05,
            HcpResponse::AnyEPipeNotOpened => 0x06,
            HcpResponse::AnyECmdNotSupported => 0x07,
            HcpResponse::AnyEInhibited => 0x08,
            HcpResponse::AnyETimeout => 0x09,
            HcpResponse::AnyERegAccessDenied => 0x0A,
            HcpResponse::AnyEPipeAccessDenied => 0x0B,
            HcpResponse::Other(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => HcpResponse::AnyOk,
            0x01 => HcpResponse::AnyENotConnected,
            0x02 => HcpResponse::AnyECmdParUnknown,
            0x03 => HcpResponse::AnyENok,
            0x04 => HcpResponse::AnyEPipesFull,
            0x05 => HcpResponse::AnyERegParUnknown,
            0x06 => HcpResponse::AnyEPipeNotOpened,
            0x07 => HcpResponse::AnyECmdNotSupported,
            0x08 => HcpResponse::AnyEInhibited,
            0x09 => HcpResponse::AnyETimeout,
            0x0A => HcpResponse::AnyERegAccessDenied,
            0x0B => HcpResponse::AnyEPipeAccessDenied,
            other => HcpResponse::Other(other),
        }
    }

    pub fn is_ok(self) -> bool {
        self == HcpResponse::AnyOk
    }
}

// ============================================================================
// Event codes
// ============================================================================

/// Event instruction on the loopback and generic gates.
pub const EVT_POST_DATA: u8 = 0x02;
/// Host added to or removed from the network (admin gate).
pub const EVT_HOT_PLUG: u8 = 0x03;
/// Connectivity-class event.
pub const EVT_CONNECTIVITY: u8 = 0x10;
/// End of a connectivity-class operation.
pub const EVT_OPERATION_ENDED: u8 = 0x11;
/// Secure-element transaction notification.
pub const EVT_TRANSACTION: u8 = 0x12;

// ============================================================================
// Registry parameter indices
// ============================================================================

/// Admin gate registry: 8-byte session identity.
pub const ADMIN_PARAM_SESSION_IDENTITY: u8 = 0x01;
/// Admin gate registry: maximum pipe count.
pub const ADMIN_PARAM_MAX_PIPE: u8 = 0x02;
/// Admin gate registry: whitelist of allowed peer hosts.
pub const ADMIN_PARAM_WHITELIST: u8 = 0x03;
/// Admin gate registry: list of currently present hosts.
pub const ADMIN_PARAM_HOST_LIST: u8 = 0x04;

/// Identity gate registry indices.
pub const IDENTITY_PARAM_VERSION_SW: u8 = 0x01;
pub const IDENTITY_PARAM_HCI_VERSION: u8 = 0x02;
pub const IDENTITY_PARAM_VERSION_HW: u8 = 0x03;
pub const IDENTITY_PARAM_VENDOR_NAME: u8 = 0x04;
pub const IDENTITY_PARAM_MODEL_ID: u8 = 0x05;
pub const IDENTITY_PARAM_GATES_LIST: u8 = 0x06;

/// Link-management gate registry: receive error counter.
pub const LINK_PARAM_REC_ERROR: u8 = 0x02;

// ============================================================================
// Pipe state
// ============================================================================

/// State of a pipe end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipeState {
    Closed,
    Opened,
}

impl PipeState {
    pub fn to_byte(self) -> u8 {
        match self {
            PipeState::Closed => 0,
            PipeState::Opened => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PipeState::Closed),
            1 => Some(PipeState::Opened),
            _ => None,
        }
    }
}

// ============================================================================
// Status values delivered to applications
// ============================================================================

/// Status attached to application-visible events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HciStatus {
    Ok,
    Failed,
    Timeout,
    NoResources,
    /// A reassembled message overran its buffer; the delivered payload
    /// holds the first capacity bytes.
    BufferFull,
}

impl HciStatus {
    pub fn is_ok(self) -> bool {
        self == HciStatus::Ok
    }
}

/// Collapse a peer response code into an application status.
pub fn status_from_response(rsp: HcpResponse) -> HciStatus {
    if rsp.is_ok() {
        HciStatus::Ok
    } else {
        HciStatus::Failed
    }
}
