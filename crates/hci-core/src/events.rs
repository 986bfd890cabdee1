//! Typed messages crossing the engine boundary: API requests in,
//! application events out, plus the engine's own input events and the
//! side-effect actions it emits.
//!
//! Dispatch over these closed enums replaces any table-indexed handler
//! lookup; unhandled variants are a compile error, not a runtime bounds
//! check.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

use crate::types::{AppHandle, HciStatus, HcpResponse};

// ============================================================================
// API Requests
// ============================================================================

/// A request from an application (or the stack above) to the engine.
///
/// Requests that cannot run immediately are queued, never rejected for
/// timing: the ordinary pending queue drains when the engine is idle,
/// the reset-pending queue additionally waits for resetting hosts.
#[derive(Debug)]
pub enum ApiRequest {
    RegisterApp {
        name: String,
        connectivity_events: bool,
        events: UnboundedSender<HciEvent>,
    },
    DeregisterApp {
        app: AppHandle,
    },
    /// Allocate a gate; `gate == 0` picks one from the proprietary
    /// range.
    AllocGate {
        app: AppHandle,
        gate: u8,
    },
    DeallocGate {
        app: AppHandle,
        gate: u8,
    },
    GetHostList {
        app: AppHandle,
    },
    /// Local query of the allocated gates and their pipes.
    GetGatePipeList {
        app: AppHandle,
    },
    CreatePipe {
        app: AppHandle,
        source_gate: u8,
        dest_host: u8,
        dest_gate: u8,
    },
    OpenPipe {
        app: AppHandle,
        pipe: u8,
    },
    ClosePipe {
        app: AppHandle,
        pipe: u8,
    },
    DeletePipe {
        app: AppHandle,
        pipe: u8,
    },
    /// Record a proprietary static pipe locally (no admin exchange).
    AddStaticPipe {
        app: AppHandle,
        host: u8,
        gate: u8,
        pipe: u8,
    },
    GetRegistry {
        app: AppHandle,
        pipe: u8,
        index: u8,
    },
    SetRegistry {
        app: AppHandle,
        pipe: u8,
        index: u8,
        data: Bytes,
    },
    SendCommand {
        app: AppHandle,
        pipe: u8,
        code: u8,
        data: Bytes,
    },
    SendResponse {
        app: AppHandle,
        pipe: u8,
        response: u8,
        data: Bytes,
    },
    /// Send an event; `rsp_timeout` arms a wait for the peer's answer
    /// event on the same pipe.
    SendEvent {
        app: AppHandle,
        pipe: u8,
        code: u8,
        data: Bytes,
        rsp_timeout: Option<Duration>,
    },
}

impl ApiRequest {
    /// The application a failure notification should go to.
    pub fn app(&self) -> Option<AppHandle> {
        match self {
            ApiRequest::RegisterApp { .. } => None,
            ApiRequest::DeregisterApp { app }
            | ApiRequest::AllocGate { app, .. }
            | ApiRequest::DeallocGate { app, .. }
            | ApiRequest::GetHostList { app }
            | ApiRequest::GetGatePipeList { app }
            | ApiRequest::CreatePipe { app, .. }
            | ApiRequest::OpenPipe { app, .. }
            | ApiRequest::ClosePipe { app, .. }
            | ApiRequest::DeletePipe { app, .. }
            | ApiRequest::AddStaticPipe { app, .. }
            | ApiRequest::GetRegistry { app, .. }
            | ApiRequest::SetRegistry { app, .. }
            | ApiRequest::SendCommand { app, .. }
            | ApiRequest::SendResponse { app, .. }
            | ApiRequest::SendEvent { app, .. } => Some(*app),
        }
    }
}

// ============================================================================
// Application events
// ============================================================================

/// One gate with its attached pipe ids, for list queries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatePipes {
    pub gate: u8,
    pub pipes: Vec<u8>,
}

/// Typed notification delivered to a registered application.
#[derive(Clone, Debug)]
pub enum HciEvent {
    Registered {
        status: HciStatus,
        handle: AppHandle,
    },
    Deregistered {
        status: HciStatus,
    },
    GateAllocated {
        status: HciStatus,
        gate: u8,
    },
    GateDeallocated {
        status: HciStatus,
        gate: u8,
    },
    PipeCreated {
        status: HciStatus,
        pipe: u8,
        source_gate: u8,
        dest_host: u8,
        dest_gate: u8,
    },
    PipeOpened {
        status: HciStatus,
        pipe: u8,
    },
    PipeClosed {
        status: HciStatus,
        pipe: u8,
    },
    PipeDeleted {
        status: HciStatus,
        pipe: u8,
    },
    StaticPipeAdded {
        status: HciStatus,
        pipe: u8,
    },
    HostList {
        status: HciStatus,
        hosts: Vec<u8>,
    },
    GatePipeList {
        status: HciStatus,
        entries: Vec<GatePipes>,
    },
    RegistryRead {
        status: HciStatus,
        pipe: u8,
        index: u8,
        data: Bytes,
    },
    RegistryWritten {
        status: HciStatus,
        pipe: u8,
        index: u8,
    },
    CommandSent {
        status: HciStatus,
        pipe: u8,
    },
    ResponseSent {
        status: HciStatus,
        pipe: u8,
    },
    EventSent {
        status: HciStatus,
        pipe: u8,
    },
    /// A peer command on a gate the application owns; the application
    /// answers with `ApiRequest::SendResponse`.
    CommandReceived {
        pipe: u8,
        code: u8,
        data: Bytes,
    },
    ResponseReceived {
        status: HciStatus,
        pipe: u8,
        response: HcpResponse,
        data: Bytes,
    },
    EventReceived {
        status: HciStatus,
        pipe: u8,
        code: u8,
        data: Bytes,
    },
    /// A peer host cleared every pipe it owned.
    AllPipesCleared {
        host: u8,
    },
    /// Subsystem finished its bootstrap.
    Initialized {
        status: HciStatus,
    },
    /// Subsystem disabled; the handle is no longer usable.
    Exited,
}

// ============================================================================
// Engine input events
// ============================================================================

/// A discrete external stimulus consumed by the engine, in arrival
/// order. The engine never blocks; anything it cannot do now is queued.
#[derive(Debug)]
pub enum EngineEvent {
    /// Persisted configuration arrived (None: never written/invalid).
    NvReadDone { data: Option<Bytes> },
    /// A persistence write finished.
    NvWriteDone { ok: bool },
    /// One inbound transport frame.
    Frame { data: Bytes },
    /// The response timer for the outstanding command expired.
    RspTimeout,
    /// The bounded host-network readiness wait expired.
    StartupTimeout,
    /// Discovery reported the number of discoverable peer hosts.
    HostCount { count: u8 },
    /// Discovery reported one peer host as ready.
    HostReady { host: u8 },
    /// The controller completed a power-mode cycle; re-run the
    /// handshake and signal restore-complete.
    PowerCycle,
    /// Shut the subsystem down.
    Disable,
    Api(ApiRequest),
}

// ============================================================================
// Engine output actions
// ============================================================================

/// A side effect requested by the engine, executed by the service that
/// owns the transport, persistence, and timers.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    /// Send one transport frame.
    SendFrame(Bytes),
    /// (Re)arm the response timer.
    StartRspTimer(Duration),
    StopRspTimer,
    /// Arm the bounded host-network readiness timer.
    StartStartupTimer(Duration),
    StopStartupTimer,
    /// Flush the configuration blob.
    NvWrite(Bytes),
    /// Close the logical connection.
    CloseLink,
    /// Startup finished (reported once to the enable caller).
    EnableComplete(HciStatus),
    /// Post-power-cycle handshake finished.
    RestoreComplete(HciStatus),
}
