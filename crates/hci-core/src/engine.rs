//! The engine control block.
//!
//! One `HciEngine` owns every piece of protocol state: the resource
//! registry, the session/bootstrap state machine, the single
//! outstanding transaction, the reassembly buffers, and the two
//! pending-request queues. It is synchronous and single-threaded:
//! every external stimulus arrives as one `EngineEvent`, is handled to
//! completion, and produces a list of `Action` side effects for the
//! owning service to execute. Nothing here blocks.

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use hci_transport::{FramingError, HcpCodec, Reassembler};

use crate::events::{Action, ApiRequest, EngineEvent, HciEvent};
use crate::registry::{Registry, MAX_APPS};
use crate::store::encode_config;
use crate::transaction::Transaction;
use crate::types::{
    is_dynamic_pipe, AppHandle, HciStatus, HcpCommand, INVALID_APP_HANDLE, MAX_PEER_HOSTS,
};

/// Payload capacity of the shared reassembly buffer, sized for the
/// largest ordinary event.
pub const GENERIC_RX_CAPACITY: usize = 260;

/// Payload capacity of the dedicated buffers for the extended pipe
/// classes (APDU relay, secure-element connectivity).
pub const EXTENDED_RX_CAPACITY: usize = 1024;

/// Engine tuning knobs.
#[derive(Clone, Debug)]
pub struct HciConfig {
    /// Peer hosts announced to the controller in the whitelist.
    pub whitelist: Vec<u8>,
    /// Bound on every command's response wait.
    pub rsp_timeout: Duration,
    /// Bound on the host-network readiness wait during bootstrap.
    pub startup_timeout: Duration,
}

impl Default for HciConfig {
    fn default() -> Self {
        Self {
            whitelist: vec![0x02, 0x03],
            rsp_timeout: Duration::from_millis(1000),
            startup_timeout: Duration::from_millis(2000),
        }
    }
}

/// Overall engine state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    /// First-enable bootstrap: admin handshake in progress.
    Startup,
    /// Bootstrap done, waiting for host-network readiness.
    WaitNetworkEnable,
    /// Accepting requests.
    Idle,
    /// One command outstanding on behalf of a request.
    WaitRsp,
    /// Draining a gate's pipes before releasing it.
    RemoveGate,
    /// Draining an application's pipes before deregistering it.
    AppDeregister,
    /// Post-power-cycle handshake in progress.
    Restore,
    /// Post-power-cycle readiness wait.
    RestoreNetworkEnable,
    /// Terminal: fatal startup failure or explicit disable.
    Disabled,
}

/// Why pipes are being drained one deletion at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DrainReason {
    DeallocGate,
    Deregister,
}

/// Resumable sub-state of a REMOVE-GATE / APP-DEREGISTER drain.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DrainJob {
    pub app: AppHandle,
    pub reason: DrainReason,
    /// Gate being drained (for `DeallocGate`; `Deregister` walks all of
    /// the application's gates).
    pub gate: u8,
}

/// Which reassembly buffer a pipe's frames land in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PipeClass {
    Generic,
    ApduRelay,
    SeConnectivity,
}

pub struct HciEngine {
    pub(crate) cfg: HciConfig,
    pub(crate) codec: HcpCodec,
    pub(crate) state: EngineState,
    pub(crate) registry: Registry,
    pub(crate) callbacks: [Option<UnboundedSender<HciEvent>>; MAX_APPS],

    // Transaction state
    pub(crate) outstanding: Option<Transaction>,
    /// Armed when an application sent an event and awaits the peer's
    /// answer event on that pipe.
    pub(crate) w4_evt: Option<(u8, AppHandle)>,

    // Pending-request queues
    pub(crate) pending: VecDeque<ApiRequest>,
    pub(crate) reset_pending: VecDeque<ApiRequest>,
    pub(crate) drain: Option<DrainJob>,

    // Host liveness
    pub(crate) inactive: [bool; MAX_PEER_HOSTS],
    pub(crate) resetting: [bool; MAX_PEER_HOSTS],
    pub(crate) expected_hosts: Option<usize>,
    pub(crate) ready_hosts: BTreeSet<u8>,

    // Reassembly, one buffer per pipe class
    pub(crate) generic_rx: Reassembler,
    pub(crate) apdu_rx: Reassembler,
    pub(crate) conn_rx: Reassembler,

    pub(crate) nv_write_pending: bool,
    pub(crate) restoring: bool,
    /// An admin host-list refresh is wanted as soon as the engine is
    /// idle (hot plug, all-pipes-cleared).
    pub(crate) host_list_wanted: bool,
}

impl HciEngine {
    /// Build an engine for a link with the given negotiated frame size.
    pub fn new(cfg: HciConfig, max_frame: usize) -> Result<Self, FramingError> {
        let codec = HcpCodec::new(max_frame)?;
        Ok(Self {
            cfg,
            codec,
            state: EngineState::Startup,
            registry: Registry::new(),
            callbacks: std::array::from_fn(|_| None),
            outstanding: None,
            w4_evt: None,
            pending: VecDeque::new(),
            reset_pending: VecDeque::new(),
            drain: None,
            inactive: [true; MAX_PEER_HOSTS],
            resetting: [false; MAX_PEER_HOSTS],
            expected_hosts: None,
            ready_hosts: BTreeSet::new(),
            generic_rx: Reassembler::new(GENERIC_RX_CAPACITY),
            apdu_rx: Reassembler::new(EXTENDED_RX_CAPACITY),
            conn_rx: Reassembler::new(EXTENDED_RX_CAPACITY),
            nv_write_pending: false,
            restoring: false,
            host_list_wanted: false,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Consume one external stimulus and return the side effects.
    pub fn handle_event(&mut self, event: EngineEvent) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == EngineState::Disabled && !matches!(event, EngineEvent::Api(_)) {
            debug!(?event, "event ignored while disabled");
            return actions;
        }
        match event {
            EngineEvent::NvReadDone { data } => self.begin_startup(data, &mut actions),
            EngineEvent::NvWriteDone { ok } => {
                self.nv_write_pending = false;
                if !ok {
                    warn!("persistence write failed; state kept dirty");
                    self.registry.mark_dirty();
                }
            }
            EngineEvent::Frame { data } => self.handle_frame(&data, &mut actions),
            EngineEvent::RspTimeout => self.handle_rsp_timeout(&mut actions),
            EngineEvent::StartupTimeout => self.handle_startup_timeout(&mut actions),
            EngineEvent::HostCount { count } => self.handle_host_count(count, &mut actions),
            EngineEvent::HostReady { host } => self.handle_host_ready(host, &mut actions),
            EngineEvent::PowerCycle => self.begin_restore(&mut actions),
            EngineEvent::Disable => self.disable(&mut actions),
            EngineEvent::Api(req) => self.admit_request(req),
        }
        self.post_event(&mut actions);
        actions
    }

    // -------------------------------------------------------------------------
    // Request admission and queue draining
    // -------------------------------------------------------------------------

    fn admit_request(&mut self, req: ApiRequest) {
        if self.state == EngineState::Disabled {
            self.refuse_request(req);
            return;
        }
        self.pending.push_back(req);
    }

    /// Answer a request that can never run with a failure event.
    pub(crate) fn refuse_request(&mut self, req: ApiRequest) {
        if let ApiRequest::RegisterApp { events, .. } = &req {
            let _ = events.send(HciEvent::Registered {
                status: HciStatus::Failed,
                handle: INVALID_APP_HANDLE,
            });
            return;
        }
        let Some(app) = req.app() else { return };
        let event = match req {
            ApiRequest::DeregisterApp { .. } => HciEvent::Deregistered {
                status: HciStatus::Failed,
            },
            ApiRequest::AllocGate { gate, .. } => HciEvent::GateAllocated {
                status: HciStatus::Failed,
                gate,
            },
            ApiRequest::DeallocGate { gate, .. } => HciEvent::GateDeallocated {
                status: HciStatus::Failed,
                gate,
            },
            ApiRequest::GetHostList { .. } => HciEvent::HostList {
                status: HciStatus::Failed,
                hosts: Vec::new(),
            },
            ApiRequest::GetGatePipeList { .. } => HciEvent::GatePipeList {
                status: HciStatus::Failed,
                entries: Vec::new(),
            },
            ApiRequest::CreatePipe {
                source_gate,
                dest_host,
                dest_gate,
                ..
            } => HciEvent::PipeCreated {
                status: HciStatus::Failed,
                pipe: 0,
                source_gate,
                dest_host,
                dest_gate,
            },
            ApiRequest::OpenPipe { pipe, .. } => HciEvent::PipeOpened {
                status: HciStatus::Failed,
                pipe,
            },
            ApiRequest::ClosePipe { pipe, .. } => HciEvent::PipeClosed {
                status: HciStatus::Failed,
                pipe,
            },
            ApiRequest::DeletePipe { pipe, .. } => HciEvent::PipeDeleted {
                status: HciStatus::Failed,
                pipe,
            },
            ApiRequest::AddStaticPipe { pipe, .. } => HciEvent::StaticPipeAdded {
                status: HciStatus::Failed,
                pipe,
            },
            ApiRequest::GetRegistry { pipe, index, .. } => HciEvent::RegistryRead {
                status: HciStatus::Failed,
                pipe,
                index,
                data: Bytes::new(),
            },
            ApiRequest::SetRegistry { pipe, index, .. } => HciEvent::RegistryWritten {
                status: HciStatus::Failed,
                pipe,
                index,
            },
            ApiRequest::SendCommand { pipe, .. } => HciEvent::CommandSent {
                status: HciStatus::Failed,
                pipe,
            },
            ApiRequest::SendResponse { pipe, .. } => HciEvent::ResponseSent {
                status: HciStatus::Failed,
                pipe,
            },
            ApiRequest::SendEvent { pipe, .. } => HciEvent::EventSent {
                status: HciStatus::Failed,
                pipe,
            },
            ApiRequest::RegisterApp { .. } => unreachable!("handled above"),
        };
        self.notify_app(app, event);
    }

    /// Run after every event: drain the pending queues while the engine
    /// is idle, then flush dirty registry state to persistence.
    fn post_event(&mut self, actions: &mut Vec<Action>) {
        loop {
            if self.state != EngineState::Idle
                || self.outstanding.is_some()
                || self.w4_evt.is_some()
            {
                break;
            }
            if self.host_list_wanted {
                self.host_list_wanted = false;
                self.send_host_list_query(None, actions);
                continue;
            }
            let req = if let Some(req) = self.pending.pop_front() {
                req
            } else if !self.any_host_resetting() {
                match self.reset_pending.pop_front() {
                    Some(req) => req,
                    None => break,
                }
            } else {
                break;
            };
            self.execute_request(req, actions);
        }

        // Persistence writes only run while no transaction can mutate
        // the registry underneath them.
        if self.state == EngineState::Idle
            && self.outstanding.is_none()
            && self.registry.is_dirty()
            && !self.nv_write_pending
        {
            self.registry.clear_dirty();
            self.nv_write_pending = true;
            actions.push(Action::NvWrite(encode_config(&self.registry)));
        }
    }

    pub(crate) fn any_host_resetting(&self) -> bool {
        self.resetting.iter().any(|r| *r)
    }

    // -------------------------------------------------------------------------
    // Application notification
    // -------------------------------------------------------------------------

    pub(crate) fn notify_app(&mut self, app: AppHandle, event: HciEvent) {
        let Some(sender) = self
            .callbacks
            .get(app.0 as usize)
            .and_then(|s| s.as_ref())
        else {
            warn!(%app, ?event, "no callback for application");
            return;
        };
        if sender.send(event).is_err() {
            warn!(%app, "application event receiver dropped");
            self.callbacks[app.0 as usize] = None;
        }
    }

    pub(crate) fn notify_all(&mut self, event: &HciEvent) {
        for app in self.registry.app_handles() {
            self.notify_app(app, event.clone());
        }
    }

    pub(crate) fn notify_gate_owner(&mut self, gate: u8, event: HciEvent) {
        if let Some(owner) = self.registry.find_gate(gate).and_then(|g| g.owner) {
            self.notify_app(owner, event);
        }
    }

    // -------------------------------------------------------------------------
    // Deregistration / gate-removal drain
    // -------------------------------------------------------------------------

    /// Delete the next pipe of the drain job, or finish it.
    ///
    /// Non-dynamic (proprietary static) pipes cannot be deleted through
    /// the admin gate and are released locally.
    pub(crate) fn continue_drain(&mut self, actions: &mut Vec<Action>) {
        let Some(job) = self.drain else {
            warn!("drain continuation without a job");
            self.state = EngineState::Idle;
            return;
        };
        let gates = match job.reason {
            DrainReason::DeallocGate => vec![job.gate],
            DrainReason::Deregister => self.registry.gates_owned_by(job.app),
        };
        for gate in &gates {
            for pipe in self.registry.pipes_on_gate(*gate) {
                if is_dynamic_pipe(pipe) {
                    self.send_delete_pipe(None, pipe, actions);
                    return;
                }
                self.registry.release_pipe(pipe).ok();
            }
        }
        self.finish_drain(job, gates, actions);
    }

    fn finish_drain(&mut self, job: DrainJob, gates: Vec<u8>, _actions: &mut [Action]) {
        self.drain = None;
        self.state = EngineState::Idle;
        match job.reason {
            DrainReason::DeallocGate => {
                let status = match self.registry.release_gate(job.gate) {
                    Ok(()) => HciStatus::Ok,
                    Err(_) => HciStatus::Failed,
                };
                self.notify_app(
                    job.app,
                    HciEvent::GateDeallocated {
                        status,
                        gate: job.gate,
                    },
                );
            }
            DrainReason::Deregister => {
                for gate in gates {
                    self.registry.release_gate(gate).ok();
                }
                self.registry.remove_app(job.app).ok();
                self.notify_app(
                    job.app,
                    HciEvent::Deregistered {
                        status: HciStatus::Ok,
                    },
                );
                self.callbacks[job.app.0 as usize] = None;
            }
        }
    }

    /// Last-resort recovery when a drain deletion times out: ask the
    /// controller to clear everything, assuming its pipe state no
    /// longer matches ours.
    pub(crate) fn drain_recovery(&mut self, actions: &mut Vec<Action>) {
        warn!("drain deletion timed out; degrading to clear-all-pipes");
        self.send_clear_all_pipes(actions);
    }

    /// Clear-all finished (response or timeout): wipe the local dynamic
    /// pipes and complete whatever drain was in progress.
    pub(crate) fn finish_clear_all(&mut self, actions: &mut Vec<Action>) {
        self.registry.clear_all_dynamic_pipes();
        if let Some(job) = self.drain {
            let gates = match job.reason {
                DrainReason::DeallocGate => vec![job.gate],
                DrainReason::Deregister => self.registry.gates_owned_by(job.app),
            };
            self.finish_drain(job, gates, actions);
        } else {
            self.state = EngineState::Idle;
        }
    }

    // -------------------------------------------------------------------------
    // Pipe classification for reassembly
    // -------------------------------------------------------------------------

    pub(crate) fn pipe_class(&self, pipe: u8) -> PipeClass {
        use crate::types::{is_prop_gate, CONNECTIVITY_GATE};
        match self.registry.find_pipe(pipe) {
            Some(p) if p.local_gate == CONNECTIVITY_GATE => PipeClass::SeConnectivity,
            Some(p) if is_prop_gate(p.local_gate) => PipeClass::ApduRelay,
            _ => PipeClass::Generic,
        }
    }

    // -------------------------------------------------------------------------
    // Disable
    // -------------------------------------------------------------------------

    fn disable(&mut self, actions: &mut Vec<Action>) {
        debug!("disabling HCI subsystem");
        actions.push(Action::StopRspTimer);
        actions.push(Action::StopStartupTimer);
        if self.registry.is_dirty() {
            self.registry.clear_dirty();
            actions.push(Action::NvWrite(encode_config(&self.registry)));
        }
        actions.push(Action::CloseLink);
        self.notify_all(&HciEvent::Exited);
        self.outstanding = None;
        self.w4_evt = None;
        self.pending.clear();
        self.reset_pending.clear();
        self.drain = None;
        self.state = EngineState::Disabled;
    }

    // -------------------------------------------------------------------------
    // Shared protocol send helpers (used across modules)
    // -------------------------------------------------------------------------

    pub(crate) fn send_delete_pipe(
        &mut self,
        app: Option<AppHandle>,
        pipe: u8,
        actions: &mut Vec<Action>,
    ) {
        let tx = Transaction {
            cmd: HcpCommand::AdmDeletePipe.code(),
            pipe: crate::types::ADMIN_PIPE,
            target_pipe: pipe,
            index: 0,
            app,
            local_gate: 0,
            dest_host: 0,
            dest_gate: 0,
        };
        self.send_command(tx, &[pipe], actions);
    }

    pub(crate) fn send_clear_all_pipes(&mut self, actions: &mut Vec<Action>) {
        let tx = Transaction {
            cmd: HcpCommand::AdmClearAllPipe.code(),
            pipe: crate::types::ADMIN_PIPE,
            target_pipe: 0,
            index: 0,
            app: None,
            local_gate: 0,
            dest_host: 0,
            dest_gate: 0,
        };
        let host = crate::types::TERMINAL_HOST;
        self.send_command(tx, &[host], actions);
    }

    pub(crate) fn send_host_list_query(
        &mut self,
        app: Option<AppHandle>,
        actions: &mut Vec<Action>,
    ) {
        let tx = Transaction {
            cmd: HcpCommand::AnyGetParameter.code(),
            pipe: crate::types::ADMIN_PIPE,
            target_pipe: 0,
            index: crate::types::ADMIN_PARAM_HOST_LIST,
            app,
            local_gate: 0,
            dest_host: 0,
            dest_gate: 0,
        };
        let index = crate::types::ADMIN_PARAM_HOST_LIST;
        self.send_command(tx, &[index], actions);
    }
}
