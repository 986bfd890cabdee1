//! The outstanding-transaction discipline.
//!
//! At most one command is in flight at any time. The `Transaction`
//! record pins everything needed to interpret the eventual response (or
//! its absence): the instruction, the pipe, the registry index or
//! target pipe, and the requesting application. Response arrival and
//! response timeout both funnel through here.

use tracing::warn;

use hci_transport::{HcpMessage, MessageKind};

use crate::engine::{EngineState, HciEngine};
use crate::events::{Action, HciEvent};
use crate::types::{
    is_dynamic_pipe, status_from_response, AppHandle, HciStatus, HcpCommand, HcpResponse,
    ADMIN_PARAM_HOST_LIST, ADMIN_PIPE, MAX_PEER_HOSTS, PipeState,
};

/// The single in-flight command.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Transaction {
    /// Raw instruction code; application commands may carry codes with
    /// no `HcpCommand` equivalent.
    pub cmd: u8,
    /// Pipe the command was sent on.
    pub pipe: u8,
    /// Pipe being created/deleted through the admin gate, if any.
    pub target_pipe: u8,
    /// Registry parameter index for get/set, if any.
    pub index: u8,
    /// Requesting application; `None` for engine-initiated commands.
    pub app: Option<AppHandle>,
    // Endpoint triple of an ADM_CREATE_PIPE in flight.
    pub local_gate: u8,
    pub dest_host: u8,
    pub dest_gate: u8,
}

impl HciEngine {
    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    /// Fragment and queue a command, arm the response timer, and record
    /// the transaction.
    pub(crate) fn send_command(
        &mut self,
        tx: Transaction,
        payload: &[u8],
        actions: &mut Vec<Action>,
    ) {
        debug_assert!(self.outstanding.is_none(), "command while one outstanding");
        for frame in self
            .codec
            .fragment(tx.pipe, MessageKind::Command, tx.cmd, payload)
        {
            actions.push(Action::SendFrame(frame));
        }
        actions.push(Action::StartRspTimer(self.cfg.rsp_timeout));
        if self.state == EngineState::Idle {
            self.state = EngineState::WaitRsp;
        }
        self.outstanding = Some(tx);
    }

    /// Fragment and queue a response. No transaction, no timer.
    pub(crate) fn send_response(
        &mut self,
        pipe: u8,
        response: HcpResponse,
        payload: &[u8],
        actions: &mut Vec<Action>,
    ) {
        for frame in self
            .codec
            .fragment(pipe, MessageKind::Response, response.code(), payload)
        {
            actions.push(Action::SendFrame(frame));
        }
    }

    /// Fragment and queue an event. No transaction, no timer.
    pub(crate) fn send_event(
        &mut self,
        pipe: u8,
        code: u8,
        payload: &[u8],
        actions: &mut Vec<Action>,
    ) {
        for frame in self.codec.fragment(pipe, MessageKind::Event, code, payload) {
            actions.push(Action::SendFrame(frame));
        }
    }

    // -------------------------------------------------------------------------
    // Response arrival
    // -------------------------------------------------------------------------

    /// Route a reassembled response to the handler for the current
    /// phase. A response with no matching transaction is dropped.
    pub(crate) fn handle_response(&mut self, msg: &HcpMessage, actions: &mut Vec<Action>) {
        let Some(tx) = self.outstanding else {
            warn!(
                pipe = format_args!("{:#04x}", msg.pipe),
                "response without an outstanding command"
            );
            return;
        };
        if tx.pipe != msg.pipe {
            warn!(
                expected = format_args!("{:#04x}", tx.pipe),
                got = format_args!("{:#04x}", msg.pipe),
                "response on the wrong pipe"
            );
            return;
        }
        self.outstanding = None;
        actions.push(Action::StopRspTimer);
        if self.state == EngineState::WaitRsp {
            self.state = EngineState::Idle;
        }

        let rsp = HcpResponse::from_code(msg.instruction);
        match self.state {
            EngineState::Startup
            | EngineState::Restore
            | EngineState::WaitNetworkEnable
            | EngineState::RestoreNetworkEnable => {
                self.handle_bootstrap_response(tx, rsp, msg, actions)
            }
            EngineState::RemoveGate | EngineState::AppDeregister => {
                self.handle_drain_response(tx, rsp, actions)
            }
            _ => self.handle_idle_response(tx, rsp, msg, actions),
        }
    }

    fn handle_drain_response(
        &mut self,
        tx: Transaction,
        rsp: HcpResponse,
        actions: &mut Vec<Action>,
    ) {
        match HcpCommand::from_code(tx.cmd) {
            Some(HcpCommand::AdmDeletePipe) => {
                if !rsp.is_ok() {
                    warn!(
                        pipe = format_args!("{:#04x}", tx.target_pipe),
                        ?rsp,
                        "drain deletion refused; releasing locally"
                    );
                }
                self.registry.release_pipe(tx.target_pipe).ok();
                self.continue_drain(actions);
            }
            Some(HcpCommand::AdmClearAllPipe) => self.finish_clear_all(actions),
            _ => {
                warn!(cmd = tx.cmd, "unexpected response during drain");
                self.continue_drain(actions);
            }
        }
    }

    fn handle_idle_response(
        &mut self,
        tx: Transaction,
        rsp: HcpResponse,
        msg: &HcpMessage,
        actions: &mut Vec<Action>,
    ) {
        let status = status_from_response(rsp);
        match HcpCommand::from_code(tx.cmd) {
            Some(HcpCommand::AnyOpenPipe) => {
                if rsp.is_ok() {
                    if let Some(pipe) = self.registry.pipe_mut(tx.pipe) {
                        pipe.state = PipeState::Opened;
                        self.registry.mark_dirty();
                    }
                }
                if let Some(app) = tx.app {
                    self.notify_app(app, HciEvent::PipeOpened { status, pipe: tx.pipe });
                }
            }
            Some(HcpCommand::AnyClosePipe) => {
                if rsp.is_ok() {
                    if let Some(pipe) = self.registry.pipe_mut(tx.pipe) {
                        pipe.state = PipeState::Closed;
                        self.registry.mark_dirty();
                    }
                }
                if let Some(app) = tx.app {
                    self.notify_app(app, HciEvent::PipeClosed { status, pipe: tx.pipe });
                }
            }
            Some(HcpCommand::AnyGetParameter)
                if tx.pipe == ADMIN_PIPE && tx.index == ADMIN_PARAM_HOST_LIST =>
            {
                self.apply_host_list(&msg.payload);
                if let Some(app) = tx.app {
                    self.notify_app(
                        app,
                        HciEvent::HostList {
                            status,
                            hosts: msg.payload.to_vec(),
                        },
                    );
                }
            }
            Some(HcpCommand::AnyGetParameter) => {
                if let Some(app) = tx.app {
                    self.notify_app(
                        app,
                        HciEvent::RegistryRead {
                            status,
                            pipe: tx.pipe,
                            index: tx.index,
                            data: msg.payload.clone(),
                        },
                    );
                }
            }
            Some(HcpCommand::AnySetParameter) => {
                if let Some(app) = tx.app {
                    self.notify_app(
                        app,
                        HciEvent::RegistryWritten {
                            status,
                            pipe: tx.pipe,
                            index: tx.index,
                        },
                    );
                }
            }
            Some(HcpCommand::AdmCreatePipe) => {
                self.finish_create_pipe(tx, rsp, msg, actions)
            }
            Some(HcpCommand::AdmDeletePipe) => {
                // Release regardless of the answer; the peer end is gone
                // either way.
                self.registry.release_pipe(tx.target_pipe).ok();
                if let Some(app) = tx.app {
                    self.notify_app(
                        app,
                        HciEvent::PipeDeleted {
                            status,
                            pipe: tx.target_pipe,
                        },
                    );
                }
            }
            Some(HcpCommand::AdmClearAllPipe) => self.finish_clear_all(actions),
            _ => {
                // Application-level command.
                if let Some(app) = tx.app {
                    self.notify_app(
                        app,
                        HciEvent::ResponseReceived {
                            status: if msg.truncated {
                                HciStatus::BufferFull
                            } else {
                                HciStatus::Ok
                            },
                            pipe: tx.pipe,
                            response: rsp,
                            data: msg.payload.clone(),
                        },
                    );
                }
            }
        }
    }

    fn finish_create_pipe(
        &mut self,
        tx: Transaction,
        rsp: HcpResponse,
        msg: &HcpMessage,
        _actions: &mut [Action],
    ) {
        // Response payload: source host, source gate, destination host,
        // destination gate, assigned pipe.
        let created = rsp.is_ok() && msg.payload.len() >= 5;
        let status = if created {
            status_from_response(rsp)
        } else {
            HciStatus::Failed
        };
        let mut pipe = 0;
        if created {
            pipe = msg.payload[4];
            let ok = self
                .registry
                .allocate_pipe(pipe, tx.local_gate, tx.dest_host, tx.dest_gate)
                .and_then(|slot| self.registry.add_pipe_to_gate(slot, tx.local_gate));
            if let Err(err) = ok {
                warn!(%err, "could not record created pipe");
            }
        }
        if let Some(app) = tx.app {
            self.notify_app(
                app,
                HciEvent::PipeCreated {
                    status,
                    pipe,
                    source_gate: tx.local_gate,
                    dest_host: tx.dest_host,
                    dest_gate: tx.dest_gate,
                },
            );
        }
    }

    // -------------------------------------------------------------------------
    // Response timeout
    // -------------------------------------------------------------------------

    /// The response timer fired. Recovery assumes the peer end of the
    /// pipe is gone and reconciles local state optimistically rather
    /// than retrying.
    pub(crate) fn handle_rsp_timeout(&mut self, actions: &mut Vec<Action>) {
        // An awaited answer event shares the response timer.
        if let Some((pipe, app)) = self.w4_evt.take() {
            if self.state == EngineState::WaitRsp {
                self.state = EngineState::Idle;
            }
            self.notify_app(
                app,
                HciEvent::EventReceived {
                    status: HciStatus::Timeout,
                    pipe,
                    code: 0,
                    data: bytes::Bytes::new(),
                },
            );
            return;
        }

        match self.state {
            EngineState::Startup
            | EngineState::Restore
            | EngineState::WaitNetworkEnable
            | EngineState::RestoreNetworkEnable => {
                warn!("bootstrap command timed out");
                self.fail_startup(HciStatus::Timeout, actions);
            }
            EngineState::RemoveGate | EngineState::AppDeregister => {
                let Some(tx) = self.outstanding.take() else { return };
                if HcpCommand::from_code(tx.cmd) == Some(HcpCommand::AdmClearAllPipe) {
                    warn!("clear-all-pipes timed out; wiping locally");
                    self.finish_clear_all(actions);
                } else {
                    self.registry.release_pipe(tx.target_pipe).ok();
                    self.drain_recovery(actions);
                }
            }
            EngineState::WaitRsp => {
                let Some(tx) = self.outstanding.take() else {
                    warn!("response timeout with nothing outstanding");
                    self.state = EngineState::Idle;
                    return;
                };
                self.state = EngineState::Idle;
                self.recover_idle_timeout(tx);
            }
            _ => warn!("spurious response timeout"),
        }
    }

    fn recover_idle_timeout(&mut self, tx: Transaction) {
        warn!(
            cmd = format_args!("{:#04x}", tx.cmd),
            pipe = format_args!("{:#04x}", tx.pipe),
            "command timed out; assuming the peer dropped the pipe"
        );
        match HcpCommand::from_code(tx.cmd) {
            Some(HcpCommand::AnyOpenPipe) => {
                self.release_timed_out_pipe(tx.pipe);
                if let Some(app) = tx.app {
                    self.notify_app(
                        app,
                        HciEvent::PipeOpened {
                            status: HciStatus::Timeout,
                            pipe: tx.pipe,
                        },
                    );
                }
            }
            Some(HcpCommand::AnyClosePipe) => {
                self.release_timed_out_pipe(tx.pipe);
                if let Some(app) = tx.app {
                    self.notify_app(
                        app,
                        HciEvent::PipeClosed {
                            status: HciStatus::Timeout,
                            pipe: tx.pipe,
                        },
                    );
                }
            }
            Some(HcpCommand::AnyGetParameter)
                if tx.pipe == ADMIN_PIPE && tx.index == ADMIN_PARAM_HOST_LIST =>
            {
                // The refresh never arrived. A host still marked as
                // resetting would hold its queued requests forever.
                self.resetting = [false; MAX_PEER_HOSTS];
                if let Some(app) = tx.app {
                    self.notify_app(
                        app,
                        HciEvent::HostList {
                            status: HciStatus::Timeout,
                            hosts: Vec::new(),
                        },
                    );
                }
            }
            Some(HcpCommand::AnyGetParameter) => {
                self.release_timed_out_pipe(tx.pipe);
                if let Some(app) = tx.app {
                    self.notify_app(
                        app,
                        HciEvent::RegistryRead {
                            status: HciStatus::Timeout,
                            pipe: tx.pipe,
                            index: tx.index,
                            data: bytes::Bytes::new(),
                        },
                    );
                }
            }
            Some(HcpCommand::AnySetParameter) => {
                self.release_timed_out_pipe(tx.pipe);
                if let Some(app) = tx.app {
                    self.notify_app(
                        app,
                        HciEvent::RegistryWritten {
                            status: HciStatus::Timeout,
                            pipe: tx.pipe,
                            index: tx.index,
                        },
                    );
                }
            }
            Some(HcpCommand::AdmCreatePipe) => {
                // Nothing to clean up; the pipe was never recorded.
                if let Some(app) = tx.app {
                    self.notify_app(
                        app,
                        HciEvent::PipeCreated {
                            status: HciStatus::Timeout,
                            pipe: 0,
                            source_gate: tx.local_gate,
                            dest_host: tx.dest_host,
                            dest_gate: tx.dest_gate,
                        },
                    );
                }
            }
            Some(HcpCommand::AdmDeletePipe) => {
                self.registry.release_pipe(tx.target_pipe).ok();
                if let Some(app) = tx.app {
                    self.notify_app(
                        app,
                        HciEvent::PipeDeleted {
                            status: HciStatus::Timeout,
                            pipe: tx.target_pipe,
                        },
                    );
                }
            }
            _ => {
                if let Some(app) = tx.app {
                    self.notify_app(
                        app,
                        HciEvent::ResponseReceived {
                            status: HciStatus::Timeout,
                            pipe: tx.pipe,
                            response: HcpResponse::AnyETimeout,
                            data: bytes::Bytes::new(),
                        },
                    );
                }
            }
        }
    }

    /// Dynamic pipes whose peer stopped answering are presumed deleted
    /// on the remote side; drop our end so state cannot diverge further.
    fn release_timed_out_pipe(&mut self, pipe: u8) {
        if is_dynamic_pipe(pipe) && self.registry.release_pipe(pipe).is_ok() {
            warn!(
                pipe = format_args!("{pipe:#04x}"),
                "released unresponsive pipe"
            );
        }
    }
}
