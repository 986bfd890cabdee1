//! End-to-end tests: the async service running over a mock link, with
//! the test playing the controller.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

use hci_core::events::{ApiRequest, HciEvent};
use hci_core::service::{HciService, ServiceNotice};
use hci_core::store::InMemoryNvStore;
use hci_core::types::{HciStatus, HcpCommand, HcpResponse, ADMIN_PIPE};
use hci_transport::{HcpCodec, HcpMessage, MessageKind, MockLink, Reassembler};

const MAX_FRAME: usize = 29;

/// Plays the host controller: reads outbound frames from the mock link
/// and injects responses.
struct Controller {
    link: Arc<MockLink>,
    codec: HcpCodec,
    rx: Reassembler,
    consumed: usize,
}

impl Controller {
    fn new(link: Arc<MockLink>) -> Self {
        Self {
            link,
            codec: HcpCodec::new(MAX_FRAME).unwrap(),
            rx: Reassembler::new(2048),
            consumed: 0,
        }
    }

    async fn next_msg(&mut self) -> HcpMessage {
        timeout(Duration::from_secs(2), async {
            loop {
                let sent = self.link.get_sent();
                while self.consumed < sent.len() {
                    let frame = sent[self.consumed].clone();
                    self.consumed += 1;
                    if let Some(msg) = self.rx.push(&frame).expect("outbound frames decode") {
                        return msg;
                    }
                }
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("timed out waiting for an outbound message")
    }

    async fn expect_cmd(&mut self, cmd: HcpCommand) -> HcpMessage {
        let msg = self.next_msg().await;
        assert_eq!(msg.kind, MessageKind::Command, "expected {cmd:?}");
        assert_eq!(msg.instruction, cmd.code(), "expected {cmd:?}");
        msg
    }

    fn respond(&self, pipe: u8, response: HcpResponse, payload: &[u8]) {
        for frame in self
            .codec
            .fragment(pipe, MessageKind::Response, response.code(), payload)
        {
            self.link.inject_recv(frame);
        }
    }
}

async fn next_event(rx: &mut UnboundedReceiver<HciEvent>) -> HciEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an application event")
        .expect("event stream closed")
}

/// Bring a fresh service all the way to IDLE.
async fn enabled_service() -> (
    HciService,
    Controller,
    UnboundedReceiver<ServiceNotice>,
) {
    let link = Arc::new(MockLink::new(MAX_FRAME));
    let store = Arc::new(InMemoryNvStore::new());
    let mut ctl = Controller::new(link.clone());

    let (service, mut notices) = HciService::start(Default::default(), link, store)
        .await
        .expect("service starts");

    ctl.expect_cmd(HcpCommand::AnyOpenPipe).await;
    ctl.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);
    ctl.expect_cmd(HcpCommand::AnySetParameter).await;
    ctl.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);
    ctl.expect_cmd(HcpCommand::AnyGetParameter).await;
    ctl.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[0xFF; 8]);
    ctl.expect_cmd(HcpCommand::AnySetParameter).await;
    ctl.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);

    service.host_count(1);
    service.host_ready(0x02);
    ctl.expect_cmd(HcpCommand::AnyGetParameter).await;
    ctl.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[0x02]);

    let notice = timeout(Duration::from_secs(2), notices.recv())
        .await
        .expect("timed out waiting for enable")
        .expect("notice stream closed");
    assert_eq!(notice, ServiceNotice::EnableComplete(HciStatus::Ok));
    (service, ctl, notices)
}

#[tokio::test]
async fn integration_enable_flow() {
    let (service, _ctl, _notices) = enabled_service().await;
    service.shutdown().await;
}

#[tokio::test]
async fn integration_wallet_pipe_lifecycle() {
    let (service, mut ctl, _notices) = enabled_service().await;

    let mut events = service.register("wallet", false);
    match next_event(&mut events).await {
        HciEvent::Registered { status, handle } => {
            assert!(status.is_ok());

            service.request(ApiRequest::AllocGate {
                app: handle,
                gate: 0xF5,
            });
            assert!(matches!(
                next_event(&mut events).await,
                HciEvent::GateAllocated {
                    status: HciStatus::Ok,
                    gate: 0xF5
                }
            ));

            service.request(ApiRequest::CreatePipe {
                app: handle,
                source_gate: 0xF5,
                dest_host: 0x02,
                dest_gate: 0x41,
            });
            let create = ctl.expect_cmd(HcpCommand::AdmCreatePipe).await;
            assert_eq!(&create.payload[..], &[0x01, 0xF5, 0x02, 0x41]);
            ctl.respond(
                ADMIN_PIPE,
                HcpResponse::AnyOk,
                &[0x01, 0xF5, 0x02, 0x41, 0x20],
            );
            assert!(matches!(
                next_event(&mut events).await,
                HciEvent::PipeCreated {
                    status: HciStatus::Ok,
                    pipe: 0x20,
                    ..
                }
            ));

            service.request(ApiRequest::OpenPipe {
                app: handle,
                pipe: 0x20,
            });
            ctl.expect_cmd(HcpCommand::AnyOpenPipe).await;
            ctl.respond(0x20, HcpResponse::AnyOk, &[]);
            assert!(matches!(
                next_event(&mut events).await,
                HciEvent::PipeOpened {
                    status: HciStatus::Ok,
                    pipe: 0x20
                }
            ));
        }
        other => panic!("expected registration, got {other:?}"),
    }

    service.shutdown().await;
}

#[tokio::test]
async fn integration_shutdown_notifies_applications() {
    let (service, _ctl, _notices) = enabled_service().await;
    let mut events = service.register("wallet", false);
    assert!(matches!(
        next_event(&mut events).await,
        HciEvent::Registered { .. }
    ));

    service.shutdown().await;
    assert!(matches!(next_event(&mut events).await, HciEvent::Exited));
}

#[tokio::test]
async fn integration_link_loss_disables() {
    let link = Arc::new(MockLink::new(MAX_FRAME));
    let store = Arc::new(InMemoryNvStore::new());
    let mut ctl = Controller::new(link.clone());

    let (service, _notices) = HciService::start(Default::default(), link.clone(), store)
        .await
        .expect("service starts");
    ctl.expect_cmd(HcpCommand::AnyOpenPipe).await;

    link.disconnect();
    // The task notices the dead link and winds down on its own;
    // shutdown just joins it.
    service.shutdown().await;
}
