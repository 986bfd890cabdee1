//! Protocol flow tests: the engine driven synchronously through the
//! harness, with the harness playing the controller.

use hci_core::engine::EngineState;
use hci_core::events::{ApiRequest, EngineEvent, HciEvent};
use hci_core::harness::{drain_events, Harness};
use hci_core::store::decode_config;
use hci_core::types::{
    AppHandle, HciStatus, HcpCommand, HcpResponse, PipeState, ADMIN_PIPE, CONNECTIVITY_GATE,
    EVT_POST_DATA, EVT_TRANSACTION, IDENTITY_GATE, IDENTITY_PARAM_VENDOR_NAME, LOOPBACK_GATE,
};
use hci_transport::MessageKind;
use tokio::sync::mpsc::UnboundedReceiver;

const MAX_FRAME: usize = 29;

/// Boot, register an application, and leave it holding gate 0xF5 with
/// pipe 0x20 toward host 0x02. The event stream is drained.
fn wallet_with_pipe(h: &mut Harness) -> (AppHandle, UnboundedReceiver<HciEvent>) {
    h.boot_clean(&[0x02, 0x03]);
    let (app, mut rx) = h.register_app("wallet", false);
    h.feed(EngineEvent::Api(ApiRequest::AllocGate { app, gate: 0xF5 }));
    h.feed(EngineEvent::Api(ApiRequest::CreatePipe {
        app,
        source_gate: 0xF5,
        dest_host: 0x02,
        dest_gate: 0x41,
    }));
    h.expect_cmd(HcpCommand::AdmCreatePipe);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[0x01, 0xF5, 0x02, 0x41, 0x20]);
    drain_events(&mut rx);
    (app, rx)
}

fn peer_pipe(h: &mut Harness, src_host: u8, src_gate: u8, dest_gate: u8, pipe: u8) {
    h.deliver(
        ADMIN_PIPE,
        MessageKind::Command,
        HcpCommand::AdmNotifyPipeCreated.code(),
        &[src_host, src_gate, 0x01, dest_gate, pipe],
    );
    let rsp = h.sent.remove(0);
    assert_eq!(rsp.kind, MessageKind::Response);
    assert_eq!(rsp.instruction, HcpResponse::AnyOk.code());
}

#[test]
fn test_clean_boot_handshake() {
    let mut h = Harness::new(MAX_FRAME);
    h.boot_clean(&[0x02, 0x03]);

    assert_eq!(h.engine.state(), EngineState::Idle);
    // The fresh identity was persisted.
    let blob = h.nv.clone().expect("configuration flushed");
    let reg = decode_config(&blob).expect("persisted blob decodes");
    assert_ne!(reg.session_id(), &[0xFF; 8]);
}

#[test]
fn test_whitelist_and_session_payloads() {
    let mut h = Harness::new(MAX_FRAME);
    h.feed(EngineEvent::NvReadDone { data: None });

    h.expect_cmd(HcpCommand::AnyOpenPipe);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);

    let whitelist = h.expect_cmd(HcpCommand::AnySetParameter);
    assert_eq!(&whitelist.payload[..], &[0x03, 0x02, 0x03]);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);

    let get = h.expect_cmd(HcpCommand::AnyGetParameter);
    assert_eq!(&get.payload[..], &[0x01]);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[0xFF; 8]);

    // Mismatch against the unset identity: a fresh one is published.
    let set = h.expect_cmd(HcpCommand::AnySetParameter);
    assert_eq!(set.payload.len(), 9);
    assert_eq!(set.payload[0], 0x01);
    assert_ne!(&set.payload[1..], &[0xFF; 8]);
}

#[test]
fn test_session_match_keeps_configuration() {
    // First life: boot clean and create some resources.
    let mut h = Harness::new(MAX_FRAME);
    h.boot_clean(&[0x02]);
    let (app, mut rx) = h.register_app("wallet", false);
    h.feed(EngineEvent::Api(ApiRequest::AllocGate { app, gate: 0xF5 }));
    h.feed(EngineEvent::Api(ApiRequest::CreatePipe {
        app,
        source_gate: 0xF5,
        dest_host: 0x02,
        dest_gate: 0x41,
    }));
    h.expect_cmd(HcpCommand::AdmCreatePipe);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[0x01, 0xF5, 0x02, 0x41, 0x20]);
    drain_events(&mut rx);

    let session = *h.engine.registry().session_id();
    let blob = h.nv.clone().expect("configuration flushed");

    // Second life: same blob, controller still holds the session.
    let mut h2 = Harness::new(MAX_FRAME);
    h2.feed(EngineEvent::NvReadDone { data: Some(blob) });

    // Admin pipe was persisted open: the handshake starts at the
    // whitelist.
    h2.expect_cmd(HcpCommand::AnySetParameter);
    h2.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);
    h2.expect_cmd(HcpCommand::AnyGetParameter);
    h2.respond(ADMIN_PIPE, HcpResponse::AnyOk, &session);

    h2.feed(EngineEvent::HostCount { count: 1 });
    h2.feed(EngineEvent::HostReady { host: 0x02 });
    h2.expect_cmd(HcpCommand::AnyGetParameter);
    h2.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[0x02]);

    assert_eq!(h2.enable_result, Some(HciStatus::Ok));
    assert!(h2.engine.registry().find_pipe(0x20).is_some());
    assert!(h2.engine.registry().find_gate(0xF5).is_some());
}

#[test]
fn test_session_mismatch_resets_tables() {
    let mut h = Harness::new(MAX_FRAME);
    h.boot_clean(&[0x02]);
    let (app, _rx) = h.register_app("wallet", false);
    h.feed(EngineEvent::Api(ApiRequest::AllocGate { app, gate: 0xF5 }));
    let blob = h.nv.clone().expect("configuration flushed");

    let mut h2 = Harness::new(MAX_FRAME);
    h2.feed(EngineEvent::NvReadDone { data: Some(blob) });
    h2.expect_cmd(HcpCommand::AnySetParameter);
    h2.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);
    h2.expect_cmd(HcpCommand::AnyGetParameter);
    // The controller reports someone else's session.
    h2.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[9, 9, 9, 9, 9, 9, 9, 9]);

    // Tables wiped, fresh identity published. Applications survive.
    h2.expect_cmd(HcpCommand::AnySetParameter);
    assert!(h2.engine.registry().find_gate(0xF5).is_none());
    assert_eq!(h2.engine.registry().app_by_name("wallet"), Some(app));
}

#[test]
fn test_wallet_end_to_end() {
    let mut h = Harness::new(MAX_FRAME);
    h.boot_clean(&[0x02, 0x03]);
    let (app, mut rx) = h.register_app("wallet", true);

    h.feed(EngineEvent::Api(ApiRequest::AllocGate { app, gate: 0xF5 }));
    assert!(matches!(
        drain_events(&mut rx)[..],
        [HciEvent::GateAllocated {
            status: HciStatus::Ok,
            gate: 0xF5
        }]
    ));

    h.feed(EngineEvent::Api(ApiRequest::CreatePipe {
        app,
        source_gate: 0xF5,
        dest_host: 0x02,
        dest_gate: 0x41,
    }));
    let create = h.expect_cmd(HcpCommand::AdmCreatePipe);
    assert_eq!(&create.payload[..], &[0x01, 0xF5, 0x02, 0x41]);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[0x01, 0xF5, 0x02, 0x41, 0x20]);
    assert!(matches!(
        drain_events(&mut rx)[..],
        [HciEvent::PipeCreated {
            status: HciStatus::Ok,
            pipe: 0x20,
            ..
        }]
    ));

    h.feed(EngineEvent::Api(ApiRequest::OpenPipe { app, pipe: 0x20 }));
    let open = h.expect_cmd(HcpCommand::AnyOpenPipe);
    assert_eq!(open.pipe, 0x20);
    h.respond(0x20, HcpResponse::AnyOk, &[]);
    assert!(matches!(
        drain_events(&mut rx)[..],
        [HciEvent::PipeOpened {
            status: HciStatus::Ok,
            pipe: 0x20
        }]
    ));

    // Duplicate endpoints are refused locally, no wire traffic.
    h.feed(EngineEvent::Api(ApiRequest::CreatePipe {
        app,
        source_gate: 0xF5,
        dest_host: 0x02,
        dest_gate: 0x41,
    }));
    assert!(h.sent.is_empty());
    assert!(matches!(
        drain_events(&mut rx)[..],
        [HciEvent::PipeCreated {
            status: HciStatus::Failed,
            ..
        }]
    ));
}

#[test]
fn test_one_command_outstanding() {
    let mut h = Harness::new(MAX_FRAME);
    h.boot_clean(&[0x02]);
    let (app, mut rx) = h.register_app("wallet", false);

    h.feed(EngineEvent::Api(ApiRequest::GetRegistry {
        app,
        pipe: ADMIN_PIPE,
        index: 0x02,
    }));
    h.feed(EngineEvent::Api(ApiRequest::GetRegistry {
        app,
        pipe: ADMIN_PIPE,
        index: 0x03,
    }));

    // Only the first went out.
    assert_eq!(h.sent.len(), 1);
    let first = h.expect_cmd(HcpCommand::AnyGetParameter);
    assert_eq!(&first.payload[..], &[0x02]);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[0x14]);

    // Its completion releases the second.
    let second = h.expect_cmd(HcpCommand::AnyGetParameter);
    assert_eq!(&second.payload[..], &[0x03]);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);

    let events = drain_events(&mut rx);
    assert_eq!(events.len(), 2);
    assert!(matches!(
        events[0],
        HciEvent::RegistryRead {
            status: HciStatus::Ok,
            index: 0x02,
            ..
        }
    ));
}

#[test]
fn test_deregistration_cascade() {
    let mut h = Harness::new(MAX_FRAME);
    h.boot_clean(&[0x02, 0x03]);
    let (app, mut rx) = h.register_app("wallet", false);
    let (other, mut other_rx) = h.register_app("reader", false);

    h.feed(EngineEvent::Api(ApiRequest::AllocGate { app, gate: 0xF5 }));
    for (dest_host, pipe) in [(0x02u8, 0x20u8), (0x03, 0x21)] {
        h.feed(EngineEvent::Api(ApiRequest::CreatePipe {
            app,
            source_gate: 0xF5,
            dest_host,
            dest_gate: 0x41,
        }));
        h.expect_cmd(HcpCommand::AdmCreatePipe);
        h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[0x01, 0xF5, dest_host, 0x41, pipe]);
    }
    drain_events(&mut rx);

    h.feed(EngineEvent::Api(ApiRequest::DeregisterApp { app }));
    assert_eq!(h.engine.state(), EngineState::AppDeregister);

    // Another application's request waits for the cascade.
    h.feed(EngineEvent::Api(ApiRequest::GetGatePipeList { app: other }));
    assert!(drain_events(&mut other_rx).is_empty());

    // Pipes go one deletion at a time.
    let del = h.expect_cmd(HcpCommand::AdmDeletePipe);
    assert_eq!(&del.payload[..], &[0x20]);
    assert!(h.sent.is_empty());
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);

    let del = h.expect_cmd(HcpCommand::AdmDeletePipe);
    assert_eq!(&del.payload[..], &[0x21]);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);

    assert!(matches!(
        drain_events(&mut rx)[..],
        [HciEvent::Deregistered {
            status: HciStatus::Ok
        }]
    ));
    assert!(h.engine.registry().app_by_name("wallet").is_none());
    assert!(h.engine.registry().find_gate(0xF5).is_none());

    // The queued request ran once the engine went idle again.
    assert!(matches!(
        drain_events(&mut other_rx)[..],
        [HciEvent::GatePipeList {
            status: HciStatus::Ok,
            ..
        }]
    ));
}

#[test]
fn test_timeout_releases_unresponsive_pipe() {
    let mut h = Harness::new(MAX_FRAME);
    h.boot_clean(&[0x02]);
    let (app, mut rx) = h.register_app("wallet", false);
    h.feed(EngineEvent::Api(ApiRequest::AllocGate { app, gate: 0xF5 }));
    h.feed(EngineEvent::Api(ApiRequest::CreatePipe {
        app,
        source_gate: 0xF5,
        dest_host: 0x02,
        dest_gate: 0x41,
    }));
    h.expect_cmd(HcpCommand::AdmCreatePipe);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[0x01, 0xF5, 0x02, 0x41, 0x20]);
    drain_events(&mut rx);

    h.feed(EngineEvent::Api(ApiRequest::OpenPipe { app, pipe: 0x20 }));
    h.expect_cmd(HcpCommand::AnyOpenPipe);
    assert!(h.rsp_timer.is_some());

    h.feed(EngineEvent::RspTimeout);
    assert!(matches!(
        drain_events(&mut rx)[..],
        [HciEvent::PipeOpened {
            status: HciStatus::Timeout,
            pipe: 0x20
        }]
    ));
    // The pipe is presumed gone on the remote side.
    assert!(h.engine.registry().find_pipe(0x20).is_none());
    assert_eq!(h.engine.state(), EngineState::Idle);
}

#[test]
fn test_host_reset_defers_requests() {
    let mut h = Harness::new(MAX_FRAME);
    h.boot_clean(&[0x02]);
    let (app, mut rx) = h.register_app("wallet", false);
    h.feed(EngineEvent::Api(ApiRequest::AllocGate { app, gate: 0xF5 }));
    drain_events(&mut rx);

    // The UICC reboots and clears its pipes; the engine refreshes the
    // host list before serving anything else.
    h.deliver(
        ADMIN_PIPE,
        MessageKind::Command,
        HcpCommand::AdmNotifyAllPipeCleared.code(),
        &[0x02],
    );
    let rsp = h.sent.remove(0);
    assert_eq!(rsp.instruction, HcpResponse::AnyOk.code());
    let query = h.expect_cmd(HcpCommand::AnyGetParameter);
    assert_eq!(&query.payload[..], &[0x04]);

    h.feed(EngineEvent::Api(ApiRequest::CreatePipe {
        app,
        source_gate: 0xF5,
        dest_host: 0x02,
        dest_gate: 0x41,
    }));
    assert!(h.sent.is_empty(), "create must wait for the host list");

    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[0x02]);
    h.expect_cmd(HcpCommand::AdmCreatePipe);
}

#[test]
fn test_loopback_echo() {
    let mut h = Harness::new(MAX_FRAME);
    h.boot_clean(&[0x02]);
    peer_pipe(&mut h, 0x02, LOOPBACK_GATE, LOOPBACK_GATE, 0x32);

    h.deliver(0x32, MessageKind::Command, HcpCommand::AnyOpenPipe.code(), &[]);
    let rsp = h.sent.remove(0);
    assert_eq!(&rsp.payload[..], &[0x01]);

    let payload = [0xAB; 40];
    h.deliver(0x32, MessageKind::Event, EVT_POST_DATA, &payload);
    let echo = h.sent.remove(0);
    assert_eq!(echo.kind, MessageKind::Event);
    assert_eq!(echo.instruction, EVT_POST_DATA);
    assert_eq!(&echo.payload[..], &payload);
}

#[test]
fn test_identity_gate_serves_registry() {
    let mut h = Harness::new(MAX_FRAME);
    h.boot_clean(&[0x02]);
    peer_pipe(&mut h, 0x02, IDENTITY_GATE, IDENTITY_GATE, 0x31);

    h.deliver(0x31, MessageKind::Command, HcpCommand::AnyOpenPipe.code(), &[]);
    assert_eq!(&h.sent.remove(0).payload[..], &[0x01]);

    h.deliver(
        0x31,
        MessageKind::Command,
        HcpCommand::AnyGetParameter.code(),
        &[IDENTITY_PARAM_VENDOR_NAME],
    );
    let rsp = h.sent.remove(0);
    assert_eq!(rsp.instruction, HcpResponse::AnyOk.code());
    assert_eq!(&rsp.payload[..], b"TERMINAL");

    // Writes to the identity registry are denied.
    h.deliver(
        0x31,
        MessageKind::Command,
        HcpCommand::AnySetParameter.code(),
        &[IDENTITY_PARAM_VENDOR_NAME, 0x00],
    );
    assert_eq!(
        h.sent.remove(0).instruction,
        HcpResponse::AnyERegAccessDenied.code()
    );
}

#[test]
fn test_connectivity_events_fan_out_to_subscribers() {
    let mut h = Harness::new(MAX_FRAME);
    h.boot_clean(&[0x02]);
    let (_sub, mut sub_rx) = h.register_app("wallet", true);
    let (_other, mut other_rx) = h.register_app("reader", false);

    peer_pipe(&mut h, 0x02, CONNECTIVITY_GATE, CONNECTIVITY_GATE, 0x33);
    drain_events(&mut sub_rx);
    drain_events(&mut other_rx);

    h.deliver(0x33, MessageKind::Event, EVT_TRANSACTION, &[0x81, 0x02, 0xAA, 0xBB]);
    assert!(matches!(
        drain_events(&mut sub_rx)[..],
        [HciEvent::EventReceived {
            status: HciStatus::Ok,
            pipe: 0x33,
            code: EVT_TRANSACTION,
            ..
        }]
    ));
    assert!(drain_events(&mut other_rx).is_empty());
}

#[test]
fn test_oversized_event_delivered_truncated() {
    let mut h = Harness::new(MAX_FRAME);
    h.boot_clean(&[0x02]);
    let (app, mut rx) = h.register_app("wallet", false);
    h.feed(EngineEvent::Api(ApiRequest::AllocGate { app, gate: 0x10 }));
    drain_events(&mut rx);

    peer_pipe(&mut h, 0x02, 0x10, 0x10, 0x30);
    drain_events(&mut rx);
    h.deliver(0x30, MessageKind::Command, HcpCommand::AnyOpenPipe.code(), &[]);
    h.sent.clear();

    // 300 bytes against a 260-byte reassembly budget.
    let big = vec![0x55u8; 300];
    h.deliver(0x30, MessageKind::Event, EVT_POST_DATA, &big);
    let events = drain_events(&mut rx);
    match &events[..] {
        [HciEvent::EventReceived { status, data, .. }] => {
            assert_eq!(*status, HciStatus::BufferFull);
            assert_eq!(data.len(), 260);
            assert!(data.iter().all(|b| *b == 0x55));
        }
        other => panic!("expected one truncated event, got {other:?}"),
    }
}

#[test]
fn test_restore_after_power_cycle() {
    let mut h = Harness::new(MAX_FRAME);
    h.boot_clean(&[0x02]);
    let (app, mut rx) = h.register_app("wallet", false);
    h.feed(EngineEvent::Api(ApiRequest::AllocGate { app, gate: 0xF5 }));
    drain_events(&mut rx);
    let session = *h.engine.registry().session_id();

    h.feed(EngineEvent::PowerCycle);
    assert_eq!(h.engine.state(), EngineState::Restore);

    // Admin pipe still open on our side: whitelist first, then the
    // session check, which matches.
    h.expect_cmd(HcpCommand::AnySetParameter);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);
    h.expect_cmd(HcpCommand::AnyGetParameter);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &session);

    h.feed(EngineEvent::HostCount { count: 1 });
    h.feed(EngineEvent::HostReady { host: 0x02 });
    h.expect_cmd(HcpCommand::AnyGetParameter);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[0x02]);

    assert_eq!(h.restore_result, Some(HciStatus::Ok));
    assert_eq!(h.engine.state(), EngineState::Idle);
    assert!(h.engine.registry().find_gate(0xF5).is_some());
}

#[test]
fn test_network_wait_timeout_proceeds() {
    let mut h = Harness::new(MAX_FRAME);
    h.feed(EngineEvent::NvReadDone { data: None });
    h.expect_cmd(HcpCommand::AnyOpenPipe);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);
    h.expect_cmd(HcpCommand::AnySetParameter);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);
    h.expect_cmd(HcpCommand::AnyGetParameter);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[0xFF; 8]);
    h.expect_cmd(HcpCommand::AnySetParameter);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);

    // No readiness signals arrive; the bounded wait is armed.
    assert!(h.startup_timer.is_some());
    assert!(h.sent.is_empty());

    h.feed(EngineEvent::StartupTimeout);
    h.expect_cmd(HcpCommand::AnyGetParameter);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);
    assert_eq!(h.enable_result, Some(HciStatus::Ok));
}

#[test]
fn test_bootstrap_timeout_disables() {
    let mut h = Harness::new(MAX_FRAME);
    h.feed(EngineEvent::NvReadDone { data: None });
    h.expect_cmd(HcpCommand::AnyOpenPipe);

    // The controller never answers.
    h.feed(EngineEvent::RspTimeout);
    assert_eq!(h.engine.state(), EngineState::Disabled);
    assert_eq!(h.enable_result, Some(HciStatus::Timeout));
    assert!(h.link_closed);
}

#[test]
fn test_event_fragmentation_across_frames() {
    let mut h = Harness::new(MAX_FRAME);
    h.boot_clean(&[0x02]);
    let (app, mut rx) = h.register_app("wallet", false);
    h.feed(EngineEvent::Api(ApiRequest::AllocGate { app, gate: 0xF5 }));
    h.feed(EngineEvent::Api(ApiRequest::CreatePipe {
        app,
        source_gate: 0xF5,
        dest_host: 0x02,
        dest_gate: 0x41,
    }));
    h.expect_cmd(HcpCommand::AdmCreatePipe);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[0x01, 0xF5, 0x02, 0x41, 0x20]);
    h.feed(EngineEvent::Api(ApiRequest::OpenPipe { app, pipe: 0x20 }));
    h.expect_cmd(HcpCommand::AnyOpenPipe);
    h.respond(0x20, HcpResponse::AnyOk, &[]);
    drain_events(&mut rx);

    // 300 payload bytes with a 29-byte frame budget: 11 frames.
    let actions = h.engine.handle_event(EngineEvent::Api(ApiRequest::SendEvent {
        app,
        pipe: 0x20,
        code: EVT_POST_DATA,
        data: vec![0x77u8; 300].into(),
        rsp_timeout: None,
    }));
    let frames: Vec<_> = actions
        .iter()
        .filter(|a| matches!(a, hci_core::events::Action::SendFrame(_)))
        .collect();
    assert_eq!(frames.len(), 11);
}

#[test]
fn test_delete_pipe_releases_both_ends() {
    let mut h = Harness::new(MAX_FRAME);
    let (app, mut rx) = wallet_with_pipe(&mut h);

    h.feed(EngineEvent::Api(ApiRequest::DeletePipe { app, pipe: 0x20 }));
    let del = h.expect_cmd(HcpCommand::AdmDeletePipe);
    assert_eq!(&del.payload[..], &[0x20]);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);

    assert!(matches!(
        drain_events(&mut rx)[..],
        [HciEvent::PipeDeleted {
            status: HciStatus::Ok,
            pipe: 0x20
        }]
    ));
    assert!(h.engine.registry().find_pipe(0x20).is_none());
    assert_eq!(h.engine.state(), EngineState::Idle);
}

#[test]
fn test_gate_deallocation_drains_pipes() {
    let mut h = Harness::new(MAX_FRAME);
    let (app, mut rx) = wallet_with_pipe(&mut h);

    // A second pipe on the same gate toward the other host.
    h.feed(EngineEvent::Api(ApiRequest::CreatePipe {
        app,
        source_gate: 0xF5,
        dest_host: 0x03,
        dest_gate: 0x41,
    }));
    h.expect_cmd(HcpCommand::AdmCreatePipe);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[0x01, 0xF5, 0x03, 0x41, 0x21]);
    drain_events(&mut rx);

    h.feed(EngineEvent::Api(ApiRequest::DeallocGate { app, gate: 0xF5 }));
    assert_eq!(h.engine.state(), EngineState::RemoveGate);

    let del = h.expect_cmd(HcpCommand::AdmDeletePipe);
    assert_eq!(&del.payload[..], &[0x20]);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);
    let del = h.expect_cmd(HcpCommand::AdmDeletePipe);
    assert_eq!(&del.payload[..], &[0x21]);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);

    assert!(matches!(
        drain_events(&mut rx)[..],
        [HciEvent::GateDeallocated {
            status: HciStatus::Ok,
            gate: 0xF5
        }]
    ));
    assert!(h.engine.registry().find_gate(0xF5).is_none());
    assert_eq!(h.engine.state(), EngineState::Idle);
}

#[test]
fn test_drain_timeout_degrades_to_clear_all() {
    let mut h = Harness::new(MAX_FRAME);
    let (app, mut rx) = wallet_with_pipe(&mut h);

    h.feed(EngineEvent::Api(ApiRequest::DeallocGate { app, gate: 0xF5 }));
    h.expect_cmd(HcpCommand::AdmDeletePipe);

    // The deletion is never answered; the engine falls back to wiping
    // every dynamic pipe at once.
    h.feed(EngineEvent::RspTimeout);
    let clear = h.expect_cmd(HcpCommand::AdmClearAllPipe);
    assert_eq!(&clear.payload[..], &[0x01]);
    h.respond(ADMIN_PIPE, HcpResponse::AnyOk, &[]);

    assert!(matches!(
        drain_events(&mut rx)[..],
        [HciEvent::GateDeallocated {
            status: HciStatus::Ok,
            gate: 0xF5
        }]
    ));
    assert!(h.engine.registry().find_pipe(0x20).is_none());
    assert!(h.engine.registry().find_gate(0xF5).is_none());
    assert_eq!(h.engine.state(), EngineState::Idle);
}

#[test]
fn test_static_pipe_recorded_locally() {
    let mut h = Harness::new(MAX_FRAME);
    h.boot_clean(&[0x02]);
    let (app, mut rx) = h.register_app("relay", false);

    h.feed(EngineEvent::Api(ApiRequest::AddStaticPipe {
        app,
        host: 0x02,
        gate: 0xF0,
        pipe: 0x70,
    }));
    // No admin exchange: the pipe exists by convention.
    assert!(h.sent.is_empty());
    assert!(matches!(
        drain_events(&mut rx)[..],
        [HciEvent::StaticPipeAdded {
            status: HciStatus::Ok,
            pipe: 0x70
        }]
    ));
    let pipe = h.engine.registry().find_pipe(0x70).expect("pipe recorded");
    assert_eq!(pipe.state, PipeState::Opened);
    assert_eq!(pipe.local_gate, 0xF0);

    // Ids that do not fit the 7-bit pipe field are refused.
    h.feed(EngineEvent::Api(ApiRequest::AddStaticPipe {
        app,
        host: 0x02,
        gate: 0xF0,
        pipe: 0x85,
    }));
    assert!(matches!(
        drain_events(&mut rx)[..],
        [HciEvent::StaticPipeAdded {
            status: HciStatus::Failed,
            pipe: 0x85
        }]
    ));
    assert!(h.engine.registry().find_pipe(0x85).is_none());
}

#[test]
fn test_host_list_timeout_releases_deferred_requests() {
    let mut h = Harness::new(MAX_FRAME);
    h.boot_clean(&[0x02]);
    let (app, mut rx) = h.register_app("wallet", false);
    h.feed(EngineEvent::Api(ApiRequest::AllocGate { app, gate: 0xF5 }));
    drain_events(&mut rx);

    // The UICC clears its pipes and the host-list refresh goes out.
    h.deliver(
        ADMIN_PIPE,
        MessageKind::Command,
        HcpCommand::AdmNotifyAllPipeCleared.code(),
        &[0x02],
    );
    assert_eq!(h.sent.remove(0).instruction, HcpResponse::AnyOk.code());
    h.expect_cmd(HcpCommand::AnyGetParameter);

    h.feed(EngineEvent::Api(ApiRequest::CreatePipe {
        app,
        source_gate: 0xF5,
        dest_host: 0x02,
        dest_gate: 0x41,
    }));
    assert!(h.sent.is_empty());

    // The refresh is never answered. The host must not stay marked as
    // resetting, or the queued create would wait forever.
    h.feed(EngineEvent::RspTimeout);
    let create = h.expect_cmd(HcpCommand::AdmCreatePipe);
    assert_eq!(&create.payload[..], &[0x01, 0xF5, 0x02, 0x41]);
}

#[test]
fn test_peer_deleted_pipe_notification() {
    let mut h = Harness::new(MAX_FRAME);
    h.boot_clean(&[0x02]);
    let (app, mut rx) = h.register_app("wallet", false);
    h.feed(EngineEvent::Api(ApiRequest::AllocGate { app, gate: 0xF5 }));
    drain_events(&mut rx);
    peer_pipe(&mut h, 0x02, 0x41, 0xF5, 0x22);
    drain_events(&mut rx);

    h.deliver(
        ADMIN_PIPE,
        MessageKind::Command,
        HcpCommand::AdmNotifyPipeDeleted.code(),
        &[0x22],
    );
    assert_eq!(h.sent.remove(0).instruction, HcpResponse::AnyOk.code());
    assert!(h.engine.registry().find_pipe(0x22).is_none());
    assert!(matches!(
        drain_events(&mut rx)[..],
        [HciEvent::PipeDeleted {
            status: HciStatus::Ok,
            pipe: 0x22
        }]
    ));
}
