//! Bootstrap and restore: the admin-gate handshake that brings the
//! subsystem from cold start (or a controller power cycle) to IDLE.
//!
//! Sequence: open the admin pipe if needed, publish the whitelist,
//! compare session identities, on mismatch wipe the dynamic tables and
//! publish a fresh identity, wait for the host network, then fetch the
//! host list. The next step after each response is inferred from the
//! transaction that just completed; there is no separate sub-state
//! counter to drift out of sync.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::{debug, warn};

use hci_transport::HcpMessage;

use crate::engine::{EngineState, HciEngine, GENERIC_RX_CAPACITY, EXTENDED_RX_CAPACITY};
use crate::store::decode_config;
use crate::transaction::Transaction;
use crate::types::{
    HciStatus, HcpCommand, HcpResponse, PipeState, ADMIN_PARAM_SESSION_IDENTITY,
    ADMIN_PARAM_WHITELIST, ADMIN_PIPE, FIRST_PEER_HOST, MAX_PEER_HOSTS, SESSION_ID_LEN,
    SESSION_ID_UNSET,
};
use crate::events::{Action, HciEvent};

use hci_transport::Reassembler;

impl HciEngine {
    // -------------------------------------------------------------------------
    // Entry points
    // -------------------------------------------------------------------------

    /// Persisted configuration arrived; start the admin handshake.
    pub(crate) fn begin_startup(&mut self, data: Option<Bytes>, actions: &mut Vec<Action>) {
        if self.state != EngineState::Startup && self.state != EngineState::Restore {
            warn!(state = ?self.state, "persisted config outside bootstrap");
            return;
        }
        match data.as_deref().and_then(decode_config) {
            Some(reg) => {
                debug!("persisted configuration restored");
                self.registry = reg;
            }
            None => {
                debug!("no usable persisted configuration; starting clean");
                // A fresh registry carries the unset identity, which can
                // never match the controller's, forcing a clean session.
                let mut reg = crate::registry::Registry::new();
                reg.mark_dirty();
                self.registry = reg;
            }
        }
        self.handshake_step(actions);
    }

    /// The controller power-cycled: re-run the handshake against
    /// whatever session survived on its side.
    pub(crate) fn begin_restore(&mut self, actions: &mut Vec<Action>) {
        debug!("power cycle; restoring session");
        actions.push(Action::StopRspTimer);
        actions.push(Action::StopStartupTimer);
        self.outstanding = None;
        self.w4_evt = None;
        self.drain = None;
        self.expected_hosts = None;
        self.ready_hosts.clear();
        // Partial frames from before the cycle are meaningless now.
        self.generic_rx = Reassembler::new(GENERIC_RX_CAPACITY);
        self.apdu_rx = Reassembler::new(EXTENDED_RX_CAPACITY);
        self.conn_rx = Reassembler::new(EXTENDED_RX_CAPACITY);
        self.restoring = true;
        self.state = EngineState::Restore;
        self.handshake_step(actions);
    }

    /// Issue the first pending handshake command: open the admin pipe
    /// if our end believes it is closed, else go straight to the
    /// whitelist.
    fn handshake_step(&mut self, actions: &mut Vec<Action>) {
        if self.registry.admin_pipe_state() == PipeState::Closed {
            self.send_admin_command(HcpCommand::AnyOpenPipe, 0, &[], actions);
        } else {
            self.send_whitelist(actions);
        }
    }

    fn send_whitelist(&mut self, actions: &mut Vec<Action>) {
        let mut payload = vec![ADMIN_PARAM_WHITELIST];
        payload.extend_from_slice(&self.cfg.whitelist);
        self.send_admin_command(
            HcpCommand::AnySetParameter,
            ADMIN_PARAM_WHITELIST,
            &payload,
            actions,
        );
    }

    fn send_session_get(&mut self, actions: &mut Vec<Action>) {
        self.send_admin_command(
            HcpCommand::AnyGetParameter,
            ADMIN_PARAM_SESSION_IDENTITY,
            &[ADMIN_PARAM_SESSION_IDENTITY],
            actions,
        );
    }

    fn send_session_set(&mut self, actions: &mut Vec<Action>) {
        let mut payload = vec![ADMIN_PARAM_SESSION_IDENTITY];
        payload.extend_from_slice(self.registry.session_id());
        self.send_admin_command(
            HcpCommand::AnySetParameter,
            ADMIN_PARAM_SESSION_IDENTITY,
            &payload,
            actions,
        );
    }

    fn send_admin_command(
        &mut self,
        cmd: HcpCommand,
        index: u8,
        payload: &[u8],
        actions: &mut Vec<Action>,
    ) {
        let tx = Transaction {
            cmd: cmd.code(),
            pipe: ADMIN_PIPE,
            target_pipe: 0,
            index,
            app: None,
            local_gate: 0,
            dest_host: 0,
            dest_gate: 0,
        };
        self.send_command(tx, payload, actions);
    }

    // -------------------------------------------------------------------------
    // Handshake responses
    // -------------------------------------------------------------------------

    pub(crate) fn handle_bootstrap_response(
        &mut self,
        tx: Transaction,
        rsp: HcpResponse,
        msg: &HcpMessage,
        actions: &mut Vec<Action>,
    ) {
        match HcpCommand::from_code(tx.cmd) {
            Some(HcpCommand::AnyOpenPipe) => {
                if !rsp.is_ok() {
                    warn!(?rsp, "admin pipe refused to open");
                    return self.fail_startup(HciStatus::Failed, actions);
                }
                self.registry.set_admin_pipe_state(PipeState::Opened);
                self.send_whitelist(actions);
            }
            Some(HcpCommand::AnySetParameter) if tx.index == ADMIN_PARAM_WHITELIST => {
                if !rsp.is_ok() {
                    warn!(?rsp, "whitelist refused");
                    return self.fail_startup(HciStatus::Failed, actions);
                }
                self.send_session_get(actions);
            }
            Some(HcpCommand::AnyGetParameter) if tx.index == ADMIN_PARAM_SESSION_IDENTITY => {
                self.handle_session_identity(rsp, msg, actions)
            }
            Some(HcpCommand::AnySetParameter) if tx.index == ADMIN_PARAM_SESSION_IDENTITY => {
                if !rsp.is_ok() {
                    warn!(?rsp, "session identity refused");
                    return self.fail_startup(HciStatus::Failed, actions);
                }
                self.enter_network_wait(actions);
            }
            Some(HcpCommand::AnyGetParameter) => {
                // Host list: the last handshake step.
                if !rsp.is_ok() {
                    warn!(?rsp, "host list refused");
                    return self.fail_startup(HciStatus::Failed, actions);
                }
                self.apply_host_list(&msg.payload);
                self.finish_startup(actions);
            }
            other => {
                warn!(?other, "unexpected response during bootstrap");
                self.fail_startup(HciStatus::Failed, actions);
            }
        }
    }

    fn handle_session_identity(
        &mut self,
        rsp: HcpResponse,
        msg: &HcpMessage,
        actions: &mut Vec<Action>,
    ) {
        match rsp {
            HcpResponse::AnyOk => {
                let matches = msg.payload.len() == SESSION_ID_LEN
                    && msg.payload[..] == self.registry.session_id()[..]
                    && *self.registry.session_id() != SESSION_ID_UNSET;
                if matches {
                    debug!("session identity matches; configuration kept");
                    self.enter_network_wait(actions);
                } else {
                    debug!(
                        ours = %hex::encode(self.registry.session_id()),
                        theirs = %hex::encode(&msg.payload),
                        "session identity mismatch; resetting tables"
                    );
                    self.registry.reset_tables();
                    // The admin pipe is open right now, whatever the
                    // wiped tables say.
                    self.registry.set_admin_pipe_state(PipeState::Opened);
                    self.registry.set_session_id(generate_session_id());
                    self.send_session_set(actions);
                }
            }
            HcpResponse::AnyEPipeNotOpened => {
                // Our end believed the pipe was open; the controller
                // disagrees. Re-open and restart the chain from there.
                self.registry.set_admin_pipe_state(PipeState::Closed);
                self.send_admin_command(HcpCommand::AnyOpenPipe, 0, &[], actions);
            }
            other => {
                warn!(?other, "session identity read refused");
                self.fail_startup(HciStatus::Failed, actions);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Host-network readiness
    // -------------------------------------------------------------------------

    fn enter_network_wait(&mut self, actions: &mut Vec<Action>) {
        self.state = if self.restoring {
            EngineState::RestoreNetworkEnable
        } else {
            EngineState::WaitNetworkEnable
        };
        if self.network_ready() {
            self.send_host_list_query(None, actions);
        } else {
            actions.push(Action::StartStartupTimer(self.cfg.startup_timeout));
        }
    }

    fn network_ready(&self) -> bool {
        self.expected_hosts
            .is_some_and(|n| self.ready_hosts.len() >= n)
    }

    pub(crate) fn in_network_wait(&self) -> bool {
        matches!(
            self.state,
            EngineState::WaitNetworkEnable | EngineState::RestoreNetworkEnable
        )
    }

    pub(crate) fn handle_host_count(&mut self, count: u8, actions: &mut Vec<Action>) {
        self.expected_hosts = Some(count as usize);
        self.maybe_network_ready(actions);
    }

    pub(crate) fn handle_host_ready(&mut self, host: u8, actions: &mut Vec<Action>) {
        self.ready_hosts.insert(host);
        self.maybe_network_ready(actions);
    }

    fn maybe_network_ready(&mut self, actions: &mut Vec<Action>) {
        if self.in_network_wait() && self.outstanding.is_none() && self.network_ready() {
            actions.push(Action::StopStartupTimer);
            self.send_host_list_query(None, actions);
        }
    }

    /// The bounded readiness wait expired; proceed with whatever hosts
    /// showed up.
    pub(crate) fn handle_startup_timeout(&mut self, actions: &mut Vec<Action>) {
        if self.in_network_wait() && self.outstanding.is_none() {
            warn!(
                ready = self.ready_hosts.len(),
                expected = ?self.expected_hosts,
                "host network readiness wait expired"
            );
            self.send_host_list_query(None, actions);
        } else {
            warn!("spurious startup timeout");
        }
    }

    /// Refresh the per-host liveness flags from an admin host list.
    pub(crate) fn apply_host_list(&mut self, hosts: &[u8]) {
        for slot in 0..MAX_PEER_HOSTS {
            let host = FIRST_PEER_HOST + slot as u8;
            let present = hosts.contains(&host);
            self.inactive[slot] = !present;
            self.resetting[slot] = false;
        }
        debug!(hosts = %hex::encode(hosts), "host list applied");
    }

    // -------------------------------------------------------------------------
    // Completion
    // -------------------------------------------------------------------------

    fn finish_startup(&mut self, actions: &mut Vec<Action>) {
        actions.push(Action::StopStartupTimer);
        self.state = EngineState::Idle;
        if self.restoring {
            self.restoring = false;
            actions.push(Action::RestoreComplete(HciStatus::Ok));
        } else {
            actions.push(Action::EnableComplete(HciStatus::Ok));
            self.notify_all(&HciEvent::Initialized {
                status: HciStatus::Ok,
            });
        }
    }

    /// A fatal handshake failure disables the subsystem.
    pub(crate) fn fail_startup(&mut self, status: HciStatus, actions: &mut Vec<Action>) {
        actions.push(Action::StopRspTimer);
        actions.push(Action::StopStartupTimer);
        actions.push(Action::CloseLink);
        self.outstanding = None;
        self.w4_evt = None;
        self.state = EngineState::Disabled;
        while let Some(req) = self.pending.pop_front() {
            self.refuse_request(req);
        }
        while let Some(req) = self.reset_pending.pop_front() {
            self.refuse_request(req);
        }
        if self.restoring {
            self.restoring = false;
            actions.push(Action::RestoreComplete(status));
        } else {
            actions.push(Action::EnableComplete(status));
            self.notify_all(&HciEvent::Initialized { status });
        }
    }
}

/// Derive a fresh session identity from the clock and process id. The
/// value only has to differ from the previous session's, never to be
/// unpredictable.
fn generate_session_id() -> [u8; SESSION_ID_LEN] {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let mixed = nanos ^ ((std::process::id() as u64) << 32) ^ nanos.rotate_left(17);
    let mut id = mixed.to_le_bytes();
    if id == SESSION_ID_UNSET {
        id[0] = 0x00;
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_never_unset() {
        for _ in 0..64 {
            assert_ne!(generate_session_id(), SESSION_ID_UNSET);
        }
    }
}
