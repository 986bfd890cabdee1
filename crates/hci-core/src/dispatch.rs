//! Message and request dispatch.
//!
//! Inbound frames are reassembled, then routed by pipe: the two static
//! pipes go to the admin and link-management handlers, everything else
//! to the handler of the pipe's local gate. The static gates (loopback,
//! identity, connectivity) are served here; generic gates forward to
//! their owning application. The back half of this module executes
//! queued API requests once the engine is idle.

use bytes::Bytes;
use tracing::{debug, warn};

use hci_transport::{frame_pipe, HcpMessage, MessageKind};

use crate::engine::{EngineState, HciEngine, PipeClass};
use crate::events::{Action, ApiRequest, GatePipes, HciEvent};
use crate::transaction::Transaction;
use crate::types::{
    is_dynamic_pipe, is_prop_gate, peer_host_slot, AppHandle, HciStatus, HcpCommand, HcpResponse,
    PipeState, ADMIN_PIPE, CONNECTIVITY_GATE, EVT_HOT_PLUG, EVT_POST_DATA, HOST_CONTROLLER,
    IDENTITY_GATE, IDENTITY_PARAM_GATES_LIST, IDENTITY_PARAM_HCI_VERSION,
    IDENTITY_PARAM_MODEL_ID, IDENTITY_PARAM_VENDOR_NAME, IDENTITY_PARAM_VERSION_HW,
    IDENTITY_PARAM_VERSION_SW, INVALID_APP_HANDLE, LAST_DYNAMIC_PIPE, LINK_MGMT_PIPE,
    LINK_PARAM_REC_ERROR, LOOPBACK_GATE, TERMINAL_HOST,
};
use crate::errors::RegistryError;

// Identity gate canned values.
const VERSION_SW: &[u8] = &[0x01, 0x00, 0x00];
const VERSION_HW: &[u8] = &[0x01, 0x00, 0x00];
const HCI_VERSION: &[u8] = &[0x01];
const VENDOR_NAME: &[u8] = b"TERMINAL";
const MODEL_ID: &[u8] = &[0x00];

/// Whether a per-host request may run now.
enum HostGate {
    Proceed,
    Refused,
    Requeue,
}

impl HciEngine {
    // -------------------------------------------------------------------------
    // Inbound frames
    // -------------------------------------------------------------------------

    /// Reassemble one transport frame and dispatch the message it
    /// completes, if any. Framing errors bump the link error counter
    /// and drop the frame.
    pub(crate) fn handle_frame(&mut self, data: &Bytes, actions: &mut Vec<Action>) {
        let pipe = match frame_pipe(data) {
            Ok(pipe) => pipe,
            Err(err) => {
                warn!(%err, "undecodable frame");
                self.bump_rec_errors();
                return;
            }
        };
        let pushed = match self.pipe_class(pipe) {
            PipeClass::Generic => self.generic_rx.push(data),
            PipeClass::ApduRelay => self.apdu_rx.push(data),
            PipeClass::SeConnectivity => self.conn_rx.push(data),
        };
        match pushed {
            Ok(Some(msg)) => self.dispatch_message(msg, actions),
            Ok(None) => {}
            Err(err) => {
                warn!(%err, pipe = format_args!("{pipe:#04x}"), "frame dropped");
                self.bump_rec_errors();
            }
        }
    }

    fn bump_rec_errors(&mut self) {
        let count = self.registry.link_rec_errors().wrapping_add(1);
        self.registry.set_link_rec_errors(count);
    }

    fn dispatch_message(&mut self, msg: HcpMessage, actions: &mut Vec<Action>) {
        debug!(
            pipe = format_args!("{:#04x}", msg.pipe),
            kind = ?msg.kind,
            inst = format_args!("{:#04x}", msg.instruction),
            len = msg.payload.len(),
            truncated = msg.truncated,
            "rx"
        );
        match msg.pipe {
            LINK_MGMT_PIPE => self.handle_link_mgmt(&msg, actions),
            ADMIN_PIPE => self.handle_admin(&msg, actions),
            _ => self.route_gate(&msg, actions),
        }
    }

    // -------------------------------------------------------------------------
    // Admin gate (static pipe 0x01)
    // -------------------------------------------------------------------------

    fn handle_admin(&mut self, msg: &HcpMessage, actions: &mut Vec<Action>) {
        match msg.kind {
            MessageKind::Response => self.handle_response(msg, actions),
            MessageKind::Command => self.handle_admin_command(msg, actions),
            MessageKind::Event => self.handle_admin_event(msg, actions),
        }
    }

    fn handle_admin_command(&mut self, msg: &HcpMessage, actions: &mut Vec<Action>) {
        match HcpCommand::from_code(msg.instruction) {
            Some(HcpCommand::AnyOpenPipe) => {
                self.registry.set_admin_pipe_state(PipeState::Opened);
                self.send_response(ADMIN_PIPE, HcpResponse::AnyOk, &[], actions);
            }
            Some(HcpCommand::AnyClosePipe) => {
                self.registry.set_admin_pipe_state(PipeState::Closed);
                self.send_response(ADMIN_PIPE, HcpResponse::AnyOk, &[], actions);
            }
            Some(HcpCommand::AdmNotifyPipeCreated) => self.peer_created_pipe(msg, actions),
            Some(HcpCommand::AdmNotifyPipeDeleted) => self.peer_deleted_pipe(msg, actions),
            Some(HcpCommand::AdmNotifyAllPipeCleared) => self.peer_cleared_pipes(msg, actions),
            _ => {
                self.send_response(ADMIN_PIPE, HcpResponse::AnyECmdNotSupported, &[], actions)
            }
        }
    }

    /// A peer created a pipe toward one of our gates. Payload: source
    /// host, source gate, destination host, destination gate, pipe id.
    fn peer_created_pipe(&mut self, msg: &HcpMessage, actions: &mut Vec<Action>) {
        if msg.payload.len() < 5 {
            return self.send_response(ADMIN_PIPE, HcpResponse::AnyECmdParUnknown, &[], actions);
        }
        let (src_host, src_gate) = (msg.payload[0], msg.payload[1]);
        let dest_gate = msg.payload[3];
        let pipe = msg.payload[4];

        let known_gate = dest_gate == IDENTITY_GATE
            || dest_gate == LOOPBACK_GATE
            || dest_gate == CONNECTIVITY_GATE
            || self.registry.find_gate(dest_gate).is_some();
        if !known_gate || !is_dynamic_pipe(pipe) {
            warn!(
                gate = format_args!("{dest_gate:#04x}"),
                pipe = format_args!("{pipe:#04x}"),
                "refusing peer pipe"
            );
            return self.send_response(ADMIN_PIPE, HcpResponse::AnyENok, &[], actions);
        }
        let recorded = self
            .registry
            .allocate_pipe(pipe, dest_gate, src_host, src_gate)
            .and_then(|slot| self.registry.add_pipe_to_gate(slot, dest_gate));
        match recorded {
            Ok(()) => {
                self.send_response(ADMIN_PIPE, HcpResponse::AnyOk, &[], actions);
                self.notify_gate_owner(
                    dest_gate,
                    HciEvent::PipeCreated {
                        status: HciStatus::Ok,
                        pipe,
                        source_gate: dest_gate,
                        dest_host: src_host,
                        dest_gate: src_gate,
                    },
                );
            }
            Err(err) => {
                warn!(%err, "cannot record peer pipe");
                self.send_response(ADMIN_PIPE, HcpResponse::AnyEPipesFull, &[], actions);
            }
        }
    }

    fn peer_deleted_pipe(&mut self, msg: &HcpMessage, actions: &mut Vec<Action>) {
        let Some(&pipe) = msg.payload.first() else {
            return self.send_response(ADMIN_PIPE, HcpResponse::AnyECmdParUnknown, &[], actions);
        };
        let Some(gate) = self.registry.find_pipe(pipe).map(|p| p.local_gate) else {
            return self.send_response(ADMIN_PIPE, HcpResponse::AnyENok, &[], actions);
        };
        self.registry.release_pipe(pipe).ok();
        self.send_response(ADMIN_PIPE, HcpResponse::AnyOk, &[], actions);
        self.notify_gate_owner(
            gate,
            HciEvent::PipeDeleted {
                status: HciStatus::Ok,
                pipe,
            },
        );
    }

    /// A host cleared every pipe it owned (it rebooted). Drop our
    /// records toward it, mark it resetting, and refresh the host list
    /// once idle.
    fn peer_cleared_pipes(&mut self, msg: &HcpMessage, actions: &mut Vec<Action>) {
        let Some(&host) = msg.payload.first() else {
            return self.send_response(ADMIN_PIPE, HcpResponse::AnyECmdParUnknown, &[], actions);
        };
        let cleared = self.registry.clear_pipes_to_host(host);
        debug!(
            host = format_args!("{host:#04x}"),
            pipes = ?cleared,
            "peer cleared its pipes"
        );
        if let Some(slot) = peer_host_slot(host) {
            self.resetting[slot] = true;
        }
        self.host_list_wanted = true;
        self.send_response(ADMIN_PIPE, HcpResponse::AnyOk, &[], actions);
        self.notify_all(&HciEvent::AllPipesCleared { host });
    }

    fn handle_admin_event(&mut self, msg: &HcpMessage, actions: &mut Vec<Action>) {
        if msg.instruction != EVT_HOT_PLUG {
            warn!(inst = msg.instruction, "unhandled admin event");
            return;
        }
        let host = msg.payload.first().copied();
        if self.in_network_wait() {
            if let Some(host) = host {
                self.handle_host_ready(host, actions);
            }
        } else {
            // Membership changed; re-read the host list when idle.
            self.host_list_wanted = true;
        }
    }

    // -------------------------------------------------------------------------
    // Link-management gate (static pipe 0x00)
    // -------------------------------------------------------------------------

    fn handle_link_mgmt(&mut self, msg: &HcpMessage, actions: &mut Vec<Action>) {
        match msg.kind {
            MessageKind::Response => self.handle_response(msg, actions),
            MessageKind::Event => warn!("unexpected event on the link-management pipe"),
            MessageKind::Command => match HcpCommand::from_code(msg.instruction) {
                Some(HcpCommand::AnyOpenPipe) => {
                    self.registry.set_link_pipe_state(PipeState::Opened);
                    self.send_response(LINK_MGMT_PIPE, HcpResponse::AnyOk, &[], actions);
                }
                Some(HcpCommand::AnyClosePipe) => {
                    self.registry.set_link_pipe_state(PipeState::Closed);
                    self.send_response(LINK_MGMT_PIPE, HcpResponse::AnyOk, &[], actions);
                }
                Some(HcpCommand::AnySetParameter) => {
                    if msg.payload.len() >= 2 && msg.payload[0] == LINK_PARAM_REC_ERROR {
                        self.registry.set_link_rec_errors(msg.payload[1]);
                        self.send_response(LINK_MGMT_PIPE, HcpResponse::AnyOk, &[], actions);
                    } else {
                        self.send_response(
                            LINK_MGMT_PIPE,
                            HcpResponse::AnyERegParUnknown,
                            &[],
                            actions,
                        );
                    }
                }
                Some(HcpCommand::AnyGetParameter) => {
                    if msg.payload.first() == Some(&LINK_PARAM_REC_ERROR) {
                        let count = self.registry.link_rec_errors();
                        self.send_response(LINK_MGMT_PIPE, HcpResponse::AnyOk, &[count], actions);
                    } else {
                        self.send_response(
                            LINK_MGMT_PIPE,
                            HcpResponse::AnyERegParUnknown,
                            &[],
                            actions,
                        );
                    }
                }
                _ => self.send_response(
                    LINK_MGMT_PIPE,
                    HcpResponse::AnyECmdNotSupported,
                    &[],
                    actions,
                ),
            },
        }
    }

    // -------------------------------------------------------------------------
    // Gate routing
    // -------------------------------------------------------------------------

    fn route_gate(&mut self, msg: &HcpMessage, actions: &mut Vec<Action>) {
        if msg.kind == MessageKind::Response {
            return self.handle_response(msg, actions);
        }
        let Some(gate) = self.registry.find_pipe(msg.pipe).map(|p| p.local_gate) else {
            warn!(
                pipe = format_args!("{:#04x}", msg.pipe),
                "message on an unknown pipe"
            );
            return;
        };
        match gate {
            LOOPBACK_GATE => self.serve_loopback(msg, actions),
            IDENTITY_GATE => self.serve_identity(msg, actions),
            CONNECTIVITY_GATE => self.serve_connectivity(msg, actions),
            _ => self.serve_generic(gate, msg, actions),
        }
    }

    /// Loopback gate: echo whatever the peer posts.
    fn serve_loopback(&mut self, msg: &HcpMessage, actions: &mut Vec<Action>) {
        match msg.kind {
            MessageKind::Command => match HcpCommand::from_code(msg.instruction) {
                Some(HcpCommand::AnyOpenPipe) => {
                    self.set_pipe_state(msg.pipe, PipeState::Opened);
                    self.send_response(msg.pipe, HcpResponse::AnyOk, &[0x01], actions);
                }
                Some(HcpCommand::AnyClosePipe) => {
                    self.set_pipe_state(msg.pipe, PipeState::Closed);
                    self.send_response(msg.pipe, HcpResponse::AnyOk, &[], actions);
                }
                _ => self.send_response(msg.pipe, HcpResponse::AnyECmdNotSupported, &[], actions),
            },
            MessageKind::Event => {
                if msg.instruction == EVT_POST_DATA {
                    let payload = msg.payload.clone();
                    self.send_event(msg.pipe, EVT_POST_DATA, &payload, actions);
                } else {
                    warn!(inst = msg.instruction, "unhandled loopback event");
                }
            }
            MessageKind::Response => unreachable!("responses routed earlier"),
        }
    }

    /// Identity-management gate: serve the canned device registry.
    fn serve_identity(&mut self, msg: &HcpMessage, actions: &mut Vec<Action>) {
        match msg.kind {
            MessageKind::Command => match HcpCommand::from_code(msg.instruction) {
                Some(HcpCommand::AnyOpenPipe) => {
                    self.set_pipe_state(msg.pipe, PipeState::Opened);
                    self.send_response(msg.pipe, HcpResponse::AnyOk, &[0x01], actions);
                }
                Some(HcpCommand::AnyClosePipe) => {
                    self.set_pipe_state(msg.pipe, PipeState::Closed);
                    self.send_response(msg.pipe, HcpResponse::AnyOk, &[], actions);
                }
                Some(HcpCommand::AnyGetParameter) => {
                    match msg.payload.first().copied() {
                        Some(IDENTITY_PARAM_VERSION_SW) => {
                            self.send_response(msg.pipe, HcpResponse::AnyOk, VERSION_SW, actions)
                        }
                        Some(IDENTITY_PARAM_HCI_VERSION) => {
                            self.send_response(msg.pipe, HcpResponse::AnyOk, HCI_VERSION, actions)
                        }
                        Some(IDENTITY_PARAM_VERSION_HW) => {
                            self.send_response(msg.pipe, HcpResponse::AnyOk, VERSION_HW, actions)
                        }
                        Some(IDENTITY_PARAM_VENDOR_NAME) => {
                            self.send_response(msg.pipe, HcpResponse::AnyOk, VENDOR_NAME, actions)
                        }
                        Some(IDENTITY_PARAM_MODEL_ID) => {
                            self.send_response(msg.pipe, HcpResponse::AnyOk, MODEL_ID, actions)
                        }
                        Some(IDENTITY_PARAM_GATES_LIST) => {
                            let gates = self.registry.gate_ids();
                            self.send_response(msg.pipe, HcpResponse::AnyOk, &gates, actions)
                        }
                        _ => self.send_response(
                            msg.pipe,
                            HcpResponse::AnyERegParUnknown,
                            &[],
                            actions,
                        ),
                    }
                }
                Some(HcpCommand::AnySetParameter) => {
                    self.send_response(msg.pipe, HcpResponse::AnyERegAccessDenied, &[], actions)
                }
                _ => self.send_response(msg.pipe, HcpResponse::AnyECmdNotSupported, &[], actions),
            },
            MessageKind::Event => warn!("unexpected event on an identity pipe"),
            MessageKind::Response => unreachable!("responses routed earlier"),
        }
    }

    /// Connectivity gate: broadcast events to subscribed applications.
    fn serve_connectivity(&mut self, msg: &HcpMessage, actions: &mut Vec<Action>) {
        match msg.kind {
            MessageKind::Command => match HcpCommand::from_code(msg.instruction) {
                Some(HcpCommand::AnyOpenPipe) => {
                    self.set_pipe_state(msg.pipe, PipeState::Opened);
                    self.send_response(msg.pipe, HcpResponse::AnyOk, &[], actions);
                }
                Some(HcpCommand::AnyClosePipe) => {
                    self.set_pipe_state(msg.pipe, PipeState::Closed);
                    self.send_response(msg.pipe, HcpResponse::AnyOk, &[], actions);
                }
                _ => self.send_response(msg.pipe, HcpResponse::AnyECmdNotSupported, &[], actions),
            },
            MessageKind::Event => {
                let status = if msg.truncated {
                    HciStatus::BufferFull
                } else {
                    HciStatus::Ok
                };
                for app in self.registry.connectivity_subscribers() {
                    self.notify_app(
                        app,
                        HciEvent::EventReceived {
                            status,
                            pipe: msg.pipe,
                            code: msg.instruction,
                            data: msg.payload.clone(),
                        },
                    );
                }
            }
            MessageKind::Response => unreachable!("responses routed earlier"),
        }
    }

    /// Generic (application-owned) gates.
    fn serve_generic(&mut self, gate: u8, msg: &HcpMessage, actions: &mut Vec<Action>) {
        match msg.kind {
            MessageKind::Command => match HcpCommand::from_code(msg.instruction) {
                Some(HcpCommand::AnyOpenPipe) => {
                    self.set_pipe_state(msg.pipe, PipeState::Opened);
                    let open = self.registry.count_open_pipes_on_gate(gate) as u8;
                    self.send_response(msg.pipe, HcpResponse::AnyOk, &[open], actions);
                }
                Some(HcpCommand::AnyClosePipe) => {
                    self.set_pipe_state(msg.pipe, PipeState::Closed);
                    self.send_response(msg.pipe, HcpResponse::AnyOk, &[], actions);
                }
                _ => {
                    let owner = self.registry.find_gate(gate).and_then(|g| g.owner);
                    match owner {
                        Some(app) => self.notify_app(
                            app,
                            HciEvent::CommandReceived {
                                pipe: msg.pipe,
                                code: msg.instruction,
                                data: msg.payload.clone(),
                            },
                        ),
                        None => self.send_response(msg.pipe, HcpResponse::AnyENok, &[], actions),
                    }
                }
            },
            MessageKind::Event => {
                let status = if msg.truncated {
                    HciStatus::BufferFull
                } else {
                    HciStatus::Ok
                };
                // An application awaiting an answer event gets it ahead
                // of ordinary delivery.
                if let Some((pipe, app)) = self.w4_evt {
                    if pipe == msg.pipe {
                        self.w4_evt = None;
                        actions.push(Action::StopRspTimer);
                        if self.state == EngineState::WaitRsp {
                            self.state = EngineState::Idle;
                        }
                        self.notify_app(
                            app,
                            HciEvent::EventReceived {
                                status,
                                pipe: msg.pipe,
                                code: msg.instruction,
                                data: msg.payload.clone(),
                            },
                        );
                        return;
                    }
                }
                self.notify_gate_owner(
                    gate,
                    HciEvent::EventReceived {
                        status,
                        pipe: msg.pipe,
                        code: msg.instruction,
                        data: msg.payload.clone(),
                    },
                );
            }
            MessageKind::Response => unreachable!("responses routed earlier"),
        }
    }

    fn set_pipe_state(&mut self, pipe: u8, state: PipeState) {
        if let Some(p) = self.registry.pipe_mut(pipe) {
            if p.state != state {
                p.state = state;
                self.registry.mark_dirty();
            }
        }
    }

    // -------------------------------------------------------------------------
    // API request execution (engine idle)
    // -------------------------------------------------------------------------

    pub(crate) fn execute_request(&mut self, req: ApiRequest, actions: &mut Vec<Action>) {
        match req {
            ApiRequest::RegisterApp {
                name,
                connectivity_events,
                events,
            } => self.exec_register(name, connectivity_events, events),
            ApiRequest::DeregisterApp { app } => self.exec_deregister(app, actions),
            ApiRequest::AllocGate { app, gate } => self.exec_alloc_gate(app, gate),
            ApiRequest::DeallocGate { app, gate } => self.exec_dealloc_gate(app, gate, actions),
            ApiRequest::GetHostList { app } => self.send_host_list_query(Some(app), actions),
            ApiRequest::GetGatePipeList { app } => {
                let entries = self
                    .registry
                    .gates_owned_by(app)
                    .into_iter()
                    .map(|gate| GatePipes {
                        gate,
                        pipes: self.registry.pipes_on_gate(gate),
                    })
                    .collect();
                self.notify_app(
                    app,
                    HciEvent::GatePipeList {
                        status: HciStatus::Ok,
                        entries,
                    },
                );
            }
            ApiRequest::CreatePipe {
                app,
                source_gate,
                dest_host,
                dest_gate,
            } => self.exec_create_pipe(app, source_gate, dest_host, dest_gate, actions),
            ApiRequest::OpenPipe { app, pipe } => self.exec_open_pipe(app, pipe, actions),
            ApiRequest::ClosePipe { app, pipe } => self.exec_close_pipe(app, pipe, actions),
            ApiRequest::DeletePipe { app, pipe } => self.exec_delete_pipe(app, pipe, actions),
            ApiRequest::AddStaticPipe {
                app,
                host,
                gate,
                pipe,
            } => self.exec_add_static_pipe(app, host, gate, pipe),
            ApiRequest::GetRegistry { app, pipe, index } => {
                self.exec_get_registry(app, pipe, index, actions)
            }
            ApiRequest::SetRegistry {
                app,
                pipe,
                index,
                data,
            } => self.exec_set_registry(app, pipe, index, data, actions),
            ApiRequest::SendCommand {
                app,
                pipe,
                code,
                data,
            } => self.exec_send_command(app, pipe, code, data, actions),
            ApiRequest::SendResponse {
                app,
                pipe,
                response,
                data,
            } => {
                self.send_response(pipe, HcpResponse::from_code(response), &data, actions);
                self.notify_app(
                    app,
                    HciEvent::ResponseSent {
                        status: HciStatus::Ok,
                        pipe,
                    },
                );
            }
            ApiRequest::SendEvent {
                app,
                pipe,
                code,
                data,
                rsp_timeout,
            } => self.exec_send_event(app, pipe, code, data, rsp_timeout, actions),
        }
    }

    fn exec_register(
        &mut self,
        name: String,
        connectivity_events: bool,
        events: tokio::sync::mpsc::UnboundedSender<HciEvent>,
    ) {
        // A persisted entry with no live callback is a previous life of
        // the same application; resume it under its old handle.
        if let Some(handle) = self.registry.app_by_name(&name) {
            if self.callbacks[handle.0 as usize].is_some() {
                warn!(name, "application already registered");
                let _ = events.send(HciEvent::Registered {
                    status: HciStatus::Failed,
                    handle: INVALID_APP_HANDLE,
                });
                return;
            }
            if let Some(entry) = self.registry.apps[handle.0 as usize].as_mut() {
                if entry.connectivity_events != connectivity_events {
                    entry.connectivity_events = connectivity_events;
                    self.registry.mark_dirty();
                }
            }
            self.callbacks[handle.0 as usize] = Some(events);
            self.notify_app(
                handle,
                HciEvent::Registered {
                    status: HciStatus::Ok,
                    handle,
                },
            );
            return;
        }
        match self.registry.register_app(&name, connectivity_events) {
            Ok(handle) => {
                self.callbacks[handle.0 as usize] = Some(events);
                self.notify_app(
                    handle,
                    HciEvent::Registered {
                        status: HciStatus::Ok,
                        handle,
                    },
                );
            }
            Err(err) => {
                warn!(%err, name, "registration refused");
                let _ = events.send(HciEvent::Registered {
                    status: registry_status(&err),
                    handle: INVALID_APP_HANDLE,
                });
            }
        }
    }

    fn exec_deregister(&mut self, app: AppHandle, actions: &mut Vec<Action>) {
        if self.registry.app(app).is_none() {
            warn!(%app, "deregister for an unknown application");
            return;
        }
        let has_pipes = self
            .registry
            .gates_owned_by(app)
            .iter()
            .any(|g| self.registry.count_pipes_on_gate(*g) > 0);
        if has_pipes {
            self.state = EngineState::AppDeregister;
            self.drain = Some(crate::engine::DrainJob {
                app,
                reason: crate::engine::DrainReason::Deregister,
                gate: 0,
            });
            self.continue_drain(actions);
        } else {
            for gate in self.registry.gates_owned_by(app) {
                self.registry.release_gate(gate).ok();
            }
            self.registry.remove_app(app).ok();
            self.notify_app(
                app,
                HciEvent::Deregistered {
                    status: HciStatus::Ok,
                },
            );
            self.callbacks[app.0 as usize] = None;
        }
    }

    fn exec_alloc_gate(&mut self, app: AppHandle, gate: u8) {
        // The connectivity gate is shared; it carries no owner.
        let result = if gate == CONNECTIVITY_GATE {
            self.registry.allocate_gate(None, CONNECTIVITY_GATE)
        } else {
            self.registry.allocate_gate(Some(app), gate)
        };
        match result {
            Ok(id) => self.notify_app(
                app,
                HciEvent::GateAllocated {
                    status: HciStatus::Ok,
                    gate: id,
                },
            ),
            Err(err) => {
                warn!(%err, gate = format_args!("{gate:#04x}"), "gate allocation refused");
                self.notify_app(
                    app,
                    HciEvent::GateAllocated {
                        status: registry_status(&err),
                        gate,
                    },
                );
            }
        }
    }

    fn exec_dealloc_gate(&mut self, app: AppHandle, gate: u8, actions: &mut Vec<Action>) {
        let owned = self
            .registry
            .find_gate(gate)
            .is_some_and(|g| g.owner == Some(app));
        if !owned {
            warn!(%app, gate = format_args!("{gate:#04x}"), "deallocating a gate not owned");
            return self.notify_app(
                app,
                HciEvent::GateDeallocated {
                    status: HciStatus::Failed,
                    gate,
                },
            );
        }
        if self.registry.count_pipes_on_gate(gate) > 0 {
            self.state = EngineState::RemoveGate;
            self.drain = Some(crate::engine::DrainJob {
                app,
                reason: crate::engine::DrainReason::DeallocGate,
                gate,
            });
            self.continue_drain(actions);
        } else {
            let status = match self.registry.release_gate(gate) {
                Ok(()) => HciStatus::Ok,
                Err(_) => HciStatus::Failed,
            };
            self.notify_app(app, HciEvent::GateDeallocated { status, gate });
        }
    }

    fn exec_create_pipe(
        &mut self,
        app: AppHandle,
        source_gate: u8,
        dest_host: u8,
        dest_gate: u8,
        actions: &mut Vec<Action>,
    ) {
        let fail = |me: &mut Self| {
            me.notify_app(
                app,
                HciEvent::PipeCreated {
                    status: HciStatus::Failed,
                    pipe: 0,
                    source_gate,
                    dest_host,
                    dest_gate,
                },
            );
        };
        let owned = self
            .registry
            .find_gate(source_gate)
            .is_some_and(|g| g.owner == Some(app) || g.owner.is_none());
        if !owned {
            warn!(%app, gate = format_args!("{source_gate:#04x}"), "create on a foreign gate");
            return fail(self);
        }
        match self.check_host(dest_host) {
            HostGate::Refused => {
                warn!(host = format_args!("{dest_host:#04x}"), "destination host not usable");
                return fail(self);
            }
            HostGate::Requeue => {
                self.reset_pending.push_back(ApiRequest::CreatePipe {
                    app,
                    source_gate,
                    dest_host,
                    dest_gate,
                });
                return;
            }
            HostGate::Proceed => {}
        }
        if self
            .registry
            .pipe_between(source_gate, dest_host, dest_gate)
            .is_some()
        {
            warn!("a pipe between those endpoints already exists");
            return fail(self);
        }
        let tx = Transaction {
            cmd: HcpCommand::AdmCreatePipe.code(),
            pipe: ADMIN_PIPE,
            target_pipe: 0,
            index: 0,
            app: Some(app),
            local_gate: source_gate,
            dest_host,
            dest_gate,
        };
        self.send_command(
            tx,
            &[TERMINAL_HOST, source_gate, dest_host, dest_gate],
            actions,
        );
    }

    fn exec_open_pipe(&mut self, app: AppHandle, pipe: u8, actions: &mut Vec<Action>) {
        match self.pipe_precheck(app, pipe) {
            PipeCheck::Proceed => {
                let tx = Transaction {
                    cmd: HcpCommand::AnyOpenPipe.code(),
                    pipe,
                    target_pipe: 0,
                    index: 0,
                    app: Some(app),
                    local_gate: 0,
                    dest_host: 0,
                    dest_gate: 0,
                };
                self.send_command(tx, &[], actions);
            }
            PipeCheck::Requeue => self
                .reset_pending
                .push_back(ApiRequest::OpenPipe { app, pipe }),
            PipeCheck::Refused => self.notify_app(
                app,
                HciEvent::PipeOpened {
                    status: HciStatus::Failed,
                    pipe,
                },
            ),
        }
    }

    fn exec_close_pipe(&mut self, app: AppHandle, pipe: u8, actions: &mut Vec<Action>) {
        match self.pipe_precheck(app, pipe) {
            PipeCheck::Proceed => {
                let tx = Transaction {
                    cmd: HcpCommand::AnyClosePipe.code(),
                    pipe,
                    target_pipe: 0,
                    index: 0,
                    app: Some(app),
                    local_gate: 0,
                    dest_host: 0,
                    dest_gate: 0,
                };
                self.send_command(tx, &[], actions);
            }
            PipeCheck::Requeue => self
                .reset_pending
                .push_back(ApiRequest::ClosePipe { app, pipe }),
            PipeCheck::Refused => self.notify_app(
                app,
                HciEvent::PipeClosed {
                    status: HciStatus::Failed,
                    pipe,
                },
            ),
        }
    }

    fn exec_delete_pipe(&mut self, app: AppHandle, pipe: u8, actions: &mut Vec<Action>) {
        if !is_dynamic_pipe(pipe) {
            warn!(pipe = format_args!("{pipe:#04x}"), "only dynamic pipes can be deleted");
            return self.notify_app(
                app,
                HciEvent::PipeDeleted {
                    status: HciStatus::Failed,
                    pipe,
                },
            );
        }
        match self.pipe_precheck(app, pipe) {
            PipeCheck::Proceed => self.send_delete_pipe(Some(app), pipe, actions),
            PipeCheck::Requeue => self
                .reset_pending
                .push_back(ApiRequest::DeletePipe { app, pipe }),
            PipeCheck::Refused => self.notify_app(
                app,
                HciEvent::PipeDeleted {
                    status: HciStatus::Failed,
                    pipe,
                },
            ),
        }
    }

    /// Record a proprietary static pipe: no admin exchange, the pipe id
    /// is fixed by the vendor. The gate is allocated on the way if
    /// needed.
    fn exec_add_static_pipe(&mut self, app: AppHandle, host: u8, gate: u8, pipe: u8) {
        let fail = |me: &mut Self, status| {
            me.notify_app(app, HciEvent::StaticPipeAdded { status, pipe });
        };
        if pipe <= LAST_DYNAMIC_PIPE || pipe > 0x7F || !is_prop_gate(gate) {
            warn!(
                pipe = format_args!("{pipe:#04x}"),
                gate = format_args!("{gate:#04x}"),
                "static pipe outside the proprietary ranges"
            );
            return fail(self, HciStatus::Failed);
        }
        let recorded = self
            .registry
            .allocate_gate(Some(app), gate)
            .and_then(|_| self.registry.allocate_pipe(pipe, gate, host, gate))
            .and_then(|slot| self.registry.add_pipe_to_gate(slot, gate));
        match recorded {
            Ok(()) => {
                // Static pipes need no open handshake.
                if let Some(p) = self.registry.pipe_mut(pipe) {
                    p.state = PipeState::Opened;
                }
                self.registry.mark_dirty();
                self.notify_app(
                    app,
                    HciEvent::StaticPipeAdded {
                        status: HciStatus::Ok,
                        pipe,
                    },
                );
            }
            Err(err) => {
                warn!(%err, "cannot record static pipe");
                fail(self, registry_status(&err));
            }
        }
    }

    fn exec_get_registry(
        &mut self,
        app: AppHandle,
        pipe: u8,
        index: u8,
        actions: &mut Vec<Action>,
    ) {
        match self.registry_pipe_precheck(app, pipe) {
            PipeCheck::Proceed => {
                let tx = Transaction {
                    cmd: HcpCommand::AnyGetParameter.code(),
                    pipe,
                    target_pipe: 0,
                    index,
                    app: Some(app),
                    local_gate: 0,
                    dest_host: 0,
                    dest_gate: 0,
                };
                self.send_command(tx, &[index], actions);
            }
            PipeCheck::Requeue => self
                .reset_pending
                .push_back(ApiRequest::GetRegistry { app, pipe, index }),
            PipeCheck::Refused => self.notify_app(
                app,
                HciEvent::RegistryRead {
                    status: HciStatus::Failed,
                    pipe,
                    index,
                    data: Bytes::new(),
                },
            ),
        }
    }

    fn exec_set_registry(
        &mut self,
        app: AppHandle,
        pipe: u8,
        index: u8,
        data: Bytes,
        actions: &mut Vec<Action>,
    ) {
        match self.registry_pipe_precheck(app, pipe) {
            PipeCheck::Proceed => {
                let mut payload = Vec::with_capacity(1 + data.len());
                payload.push(index);
                payload.extend_from_slice(&data);
                let tx = Transaction {
                    cmd: HcpCommand::AnySetParameter.code(),
                    pipe,
                    target_pipe: 0,
                    index,
                    app: Some(app),
                    local_gate: 0,
                    dest_host: 0,
                    dest_gate: 0,
                };
                self.send_command(tx, &payload, actions);
            }
            PipeCheck::Requeue => self.reset_pending.push_back(ApiRequest::SetRegistry {
                app,
                pipe,
                index,
                data,
            }),
            PipeCheck::Refused => self.notify_app(
                app,
                HciEvent::RegistryWritten {
                    status: HciStatus::Failed,
                    pipe,
                    index,
                },
            ),
        }
    }

    fn exec_send_command(
        &mut self,
        app: AppHandle,
        pipe: u8,
        code: u8,
        data: Bytes,
        actions: &mut Vec<Action>,
    ) {
        let opened = self
            .registry
            .find_pipe(pipe)
            .is_some_and(|p| p.state == PipeState::Opened);
        if !opened {
            warn!(pipe = format_args!("{pipe:#04x}"), "command on a pipe that is not open");
            return self.notify_app(
                app,
                HciEvent::CommandSent {
                    status: HciStatus::Failed,
                    pipe,
                },
            );
        }
        match self.pipe_precheck(app, pipe) {
            PipeCheck::Proceed => {
                let tx = Transaction {
                    cmd: code,
                    pipe,
                    target_pipe: 0,
                    index: 0,
                    app: Some(app),
                    local_gate: 0,
                    dest_host: 0,
                    dest_gate: 0,
                };
                self.send_command(tx, &data, actions);
                self.notify_app(
                    app,
                    HciEvent::CommandSent {
                        status: HciStatus::Ok,
                        pipe,
                    },
                );
            }
            PipeCheck::Requeue => self.reset_pending.push_back(ApiRequest::SendCommand {
                app,
                pipe,
                code,
                data,
            }),
            PipeCheck::Refused => self.notify_app(
                app,
                HciEvent::CommandSent {
                    status: HciStatus::Failed,
                    pipe,
                },
            ),
        }
    }

    fn exec_send_event(
        &mut self,
        app: AppHandle,
        pipe: u8,
        code: u8,
        data: Bytes,
        rsp_timeout: Option<std::time::Duration>,
        actions: &mut Vec<Action>,
    ) {
        match self.pipe_precheck(app, pipe) {
            PipeCheck::Proceed => {
                self.send_event(pipe, code, &data, actions);
                if let Some(timeout) = rsp_timeout {
                    self.w4_evt = Some((pipe, app));
                    actions.push(Action::StartRspTimer(timeout));
                    if self.state == EngineState::Idle {
                        self.state = EngineState::WaitRsp;
                    }
                }
                self.notify_app(
                    app,
                    HciEvent::EventSent {
                        status: HciStatus::Ok,
                        pipe,
                    },
                );
            }
            PipeCheck::Requeue => self.reset_pending.push_back(ApiRequest::SendEvent {
                app,
                pipe,
                code,
                data,
                rsp_timeout,
            }),
            PipeCheck::Refused => self.notify_app(
                app,
                HciEvent::EventSent {
                    status: HciStatus::Failed,
                    pipe,
                },
            ),
        }
    }

    // -------------------------------------------------------------------------
    // Admission checks
    // -------------------------------------------------------------------------

    fn check_host(&self, host: u8) -> HostGate {
        match peer_host_slot(host) {
            None if host == HOST_CONTROLLER || host == TERMINAL_HOST => HostGate::Proceed,
            None => HostGate::Refused,
            Some(slot) if self.inactive[slot] => HostGate::Refused,
            Some(slot) if self.resetting[slot] => HostGate::Requeue,
            Some(_) => HostGate::Proceed,
        }
    }

    /// Existence, access, and destination-host liveness for a request
    /// addressing an existing pipe.
    fn pipe_precheck(&self, app: AppHandle, pipe: u8) -> PipeCheck {
        let Some(p) = self.registry.find_pipe(pipe) else {
            return PipeCheck::Refused;
        };
        if !self.app_may_use_gate(app, p.local_gate) {
            return PipeCheck::Refused;
        }
        match self.check_host(p.dest_host) {
            HostGate::Proceed => PipeCheck::Proceed,
            HostGate::Requeue => PipeCheck::Requeue,
            HostGate::Refused => PipeCheck::Refused,
        }
    }

    /// Registry reads/writes may also address the static admin and
    /// link-management pipes.
    fn registry_pipe_precheck(&self, app: AppHandle, pipe: u8) -> PipeCheck {
        if pipe == ADMIN_PIPE || pipe == LINK_MGMT_PIPE {
            return PipeCheck::Proceed;
        }
        self.pipe_precheck(app, pipe)
    }

    fn app_may_use_gate(&self, app: AppHandle, gate: u8) -> bool {
        if gate == IDENTITY_GATE {
            return true;
        }
        match self.registry.find_gate(gate) {
            Some(g) => g.owner.is_none() || g.owner == Some(app),
            None => false,
        }
    }
}

enum PipeCheck {
    Proceed,
    Refused,
    Requeue,
}

/// Map a table error onto the status delivered to the application.
fn registry_status(err: &RegistryError) -> HciStatus {
    match err {
        RegistryError::AppsFull
        | RegistryError::NoFreeGate
        | RegistryError::NoFreePipe => HciStatus::NoResources,
        _ => HciStatus::Failed,
    }
}
