//! Test harness: drives a bare engine synchronously and plays the
//! controller's side of the wire.
//!
//! Outbound frames are reassembled back into messages so tests assert
//! on protocol messages, not on raw fragments. Timer and persistence
//! actions are recorded instead of executed; NV writes complete
//! immediately.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use hci_transport::{HcpCodec, HcpMessage, MessageKind, Reassembler};

use crate::engine::{HciConfig, HciEngine};
use crate::events::{Action, ApiRequest, EngineEvent, HciEvent};
use crate::types::{
    AppHandle, HciStatus, HcpCommand, HcpResponse, ADMIN_PIPE, SESSION_ID_UNSET,
};

const HARNESS_RX_CAPACITY: usize = 2048;

pub struct Harness {
    pub engine: HciEngine,
    codec: HcpCodec,
    rx: Reassembler,
    /// Reassembled outbound messages, oldest first.
    pub sent: Vec<HcpMessage>,
    pub rsp_timer: Option<Duration>,
    pub startup_timer: Option<Duration>,
    /// Last persisted configuration blob.
    pub nv: Option<Bytes>,
    pub enable_result: Option<HciStatus>,
    pub restore_result: Option<HciStatus>,
    pub link_closed: bool,
}

impl Harness {
    pub fn new(max_frame: usize) -> Self {
        Self::with_config(HciConfig::default(), max_frame)
    }

    pub fn with_config(cfg: HciConfig, max_frame: usize) -> Self {
        Self {
            engine: HciEngine::new(cfg, max_frame).expect("frame budget"),
            codec: HcpCodec::new(max_frame).expect("frame budget"),
            rx: Reassembler::new(HARNESS_RX_CAPACITY),
            sent: Vec::new(),
            rsp_timer: None,
            startup_timer: None,
            nv: None,
            enable_result: None,
            restore_result: None,
            link_closed: false,
        }
    }

    /// Feed one event, executing actions the way the service would.
    pub fn feed(&mut self, event: EngineEvent) {
        let mut queue = vec![event];
        while !queue.is_empty() {
            let event = queue.remove(0);
            for action in self.engine.handle_event(event) {
                match action {
                    Action::SendFrame(frame) => {
                        if let Some(msg) = self.rx.push(&frame).expect("outbound frames decode") {
                            self.sent.push(msg);
                        }
                    }
                    Action::StartRspTimer(after) => self.rsp_timer = Some(after),
                    Action::StopRspTimer => self.rsp_timer = None,
                    Action::StartStartupTimer(after) => self.startup_timer = Some(after),
                    Action::StopStartupTimer => self.startup_timer = None,
                    Action::NvWrite(blob) => {
                        self.nv = Some(blob);
                        queue.push(EngineEvent::NvWriteDone { ok: true });
                    }
                    Action::CloseLink => self.link_closed = true,
                    Action::EnableComplete(status) => self.enable_result = Some(status),
                    Action::RestoreComplete(status) => self.restore_result = Some(status),
                }
            }
        }
    }

    /// Deliver one inbound message, fragmented like a real peer would.
    pub fn deliver(&mut self, pipe: u8, kind: MessageKind, instruction: u8, payload: &[u8]) {
        for frame in self.codec.fragment(pipe, kind, instruction, payload) {
            self.feed(EngineEvent::Frame { data: frame });
        }
    }

    pub fn respond(&mut self, pipe: u8, response: HcpResponse, payload: &[u8]) {
        self.deliver(pipe, MessageKind::Response, response.code(), payload);
    }

    pub fn take_sent(&mut self) -> Vec<HcpMessage> {
        std::mem::take(&mut self.sent)
    }

    /// Pop the oldest outbound message and check it is the expected
    /// command.
    pub fn expect_cmd(&mut self, cmd: HcpCommand) -> HcpMessage {
        assert!(!self.sent.is_empty(), "expected {cmd:?}, nothing was sent");
        let msg = self.sent.remove(0);
        assert_eq!(msg.kind, MessageKind::Command, "expected a command");
        assert_eq!(msg.instruction, cmd.code(), "expected {cmd:?}");
        msg
    }

    /// Run the clean-boot handshake: fresh store, session mismatch,
    /// fresh identity published, host list served with `hosts`.
    pub fn boot_clean(&mut self, hosts: &[u8]) {
        self.feed(EngineEvent::NvReadDone { data: None });

        self.expect_cmd(HcpCommand::AnyOpenPipe);
        self.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);

        self.expect_cmd(HcpCommand::AnySetParameter); // whitelist
        self.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);

        self.expect_cmd(HcpCommand::AnyGetParameter); // session identity
        self.respond(ADMIN_PIPE, HcpResponse::AnyOk, &SESSION_ID_UNSET);

        self.expect_cmd(HcpCommand::AnySetParameter); // fresh identity
        self.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);

        self.feed(EngineEvent::HostCount {
            count: hosts.len() as u8,
        });
        for host in hosts {
            self.feed(EngineEvent::HostReady { host: *host });
        }
        self.expect_cmd(HcpCommand::AnyGetParameter); // host list
        self.respond(ADMIN_PIPE, HcpResponse::AnyOk, hosts);

        assert_eq!(self.enable_result, Some(HciStatus::Ok));
    }

    /// Register an application and return its handle and event stream.
    pub fn register_app(
        &mut self,
        name: &str,
        connectivity_events: bool,
    ) -> (AppHandle, UnboundedReceiver<HciEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.feed(EngineEvent::Api(ApiRequest::RegisterApp {
            name: name.to_string(),
            connectivity_events,
            events: tx,
        }));
        match rx.try_recv() {
            Ok(HciEvent::Registered { status, handle }) => {
                assert!(status.is_ok(), "registration failed: {status:?}");
                (handle, rx)
            }
            other => panic!("expected a registration event, got {other:?}"),
        }
    }
}

/// Drain and return every queued event on an application stream.
pub fn drain_events(rx: &mut UnboundedReceiver<HciEvent>) -> Vec<HciEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
