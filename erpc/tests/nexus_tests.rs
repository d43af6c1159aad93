//! Integration tests for the Nexus.
//!
//! These tests run real SM and background threads and talk over UDP on the
//! loopback interface.

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use erpc::{
    Context, Direction, Error, Hook, MsgBuffer, Nexus, NexusConfig, RegistrationError, ReqFunc, ReqHandle,
    RespHandle, SmPeer, SmPkt, SmPktType, SmWorkItem,
};

use common::{init_tracing, loopback_addr, poll_until, test_nexus, wait_until};

#[test]
fn test_nexus_creation() {
    init_tracing();

    let nexus = test_nexus("localhost", 2);
    assert_ne!(nexus.sm_udp_port(), 0);
    assert_eq!(nexus.num_bg_threads(), 2);
    assert_eq!(nexus.hostname(), "localhost");
}

#[test]
fn test_port_in_use() {
    init_tracing();

    let first = test_nexus("localhost", 0);
    let result = Nexus::new(NexusConfig::new("localhost", first.sm_udp_port()));
    assert!(matches!(result, Err(Error::Bind { .. })));
}

#[test]
fn test_too_many_bg_threads() {
    init_tracing();

    let result = Nexus::new(NexusConfig::new("localhost", 0).with_bg_threads(erpc::MAX_BG_THREADS + 1));
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[test]
fn test_sm_exchange_between_processes() {
    init_tracing();

    let client = test_nexus("client", 0);
    let server = test_nexus("server", 0);
    let client_hook = Hook::new(1);
    let server_hook = Hook::new(2);
    client.register_hook(&client_hook).unwrap();
    server.register_hook(&server_hook).unwrap();

    // Several packets before the connection exists; all arrive, in order.
    for tag in 0..3u8 {
        let pkt = SmPkt::new(SmPktType::ConnectReq, 1, 2, vec![tag]);
        client_hook.sm_tx(SmWorkItem::to_host(1, pkt, loopback_addr(&server)));
    }

    let reqs = poll_until(3, 5000, || server_hook.drain_sm_rx());
    let tags: Vec<u8> = reqs.iter().map(|wi| wi.sm_pkt.payload[0]).collect();
    assert_eq!(tags, vec![0, 1, 2]);
    assert!(reqs.iter().all(|wi| wi.rpc_id == 2));

    // Reply on the handle the request came in on.
    let SmPeer::Handle(peer) = reqs[0].peer.clone() else {
        panic!("received work item without a peer handle");
    };
    let resp = SmPkt::new(SmPktType::ConnectResp, 2, 1, b"ok".to_vec());
    server_hook.sm_tx(SmWorkItem::to_peer(2, resp.clone(), peer));

    let resps = poll_until(1, 5000, || client_hook.drain_sm_rx());
    assert_eq!(resps[0].sm_pkt, resp);
    assert_eq!(resps[0].rpc_id, 1);
}

#[test]
fn test_sm_packet_for_unknown_rpc_is_dropped() {
    init_tracing();

    let client = test_nexus("client", 0);
    let server = test_nexus("server", 0);
    let client_hook = Hook::new(1);
    let server_hook = Hook::new(2);
    client.register_hook(&client_hook).unwrap();
    server.register_hook(&server_hook).unwrap();

    // Rpc 9 does not exist on the server. The next packet still gets through.
    let lost = SmPkt::new(SmPktType::ConnectReq, 1, 9, vec![]);
    let kept = SmPkt::new(SmPktType::ConnectReq, 1, 2, vec![]);
    client_hook.sm_tx(SmWorkItem::to_host(1, lost, loopback_addr(&server)));
    client_hook.sm_tx(SmWorkItem::to_host(1, kept.clone(), loopback_addr(&server)));

    let items = poll_until(1, 5000, || server_hook.drain_sm_rx());
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].sm_pkt, kept);
}

#[test]
fn test_background_requests() {
    init_tracing();

    let nexus = test_nexus("localhost", 2);
    nexus
        .register_req_func(
            3,
            ReqFunc::background(|handle: &mut ReqHandle, _: &Context| {
                let mut resp = MsgBuffer::alloc(8, 1024, Direction::Tx).unwrap();
                resp.data_mut().copy_from_slice(&handle.req_num.to_le_bytes());
                handle.respond(resp);
            }),
        )
        .unwrap();
    let hook = Hook::new(0);
    nexus.register_hook(&hook).unwrap();

    for req_num in 0..16 {
        let req = MsgBuffer::alloc(32, 1024, Direction::Rx).unwrap();
        hook.submit_bg_request(1, ReqHandle::new(0, req_num, 3, req), Arc::new(()));
    }

    let done = poll_until(16, 5000, || hook.drain_bg_responses());
    let nums: Vec<u64> = done.iter().map(|h| h.req_num).collect();
    assert_eq!(nums, (0..16).collect::<Vec<_>>());
    for handle in &done {
        let resp = handle.response().unwrap();
        assert_eq!(resp.data(), &handle.req_num.to_le_bytes());
    }
}

#[test]
fn test_hook_queues_map_to_worker_threads() {
    init_tracing();

    let nexus = test_nexus("localhost", 3);
    let ran_on = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&ran_on);
    nexus
        .register_req_func(
            4,
            ReqFunc::background(move |handle: &mut ReqHandle, _: &Context| {
                let name = std::thread::current().name().unwrap_or_default().to_string();
                log.lock().push((handle.req_num, name));
            }),
        )
        .unwrap();
    let hook_a = Hook::new(0);
    let hook_b = Hook::new(1);
    nexus.register_hook(&hook_a).unwrap();
    nexus.register_hook(&hook_b).unwrap();

    // Three items to worker 0, then one to each other worker.
    let submit = |bg_idx: usize, req_num: u64| {
        let req = ReqHandle::new(0, req_num, 4, MsgBuffer::invalid());
        hook_a.submit_bg_request(bg_idx, req, Arc::new(()));
    };
    for req_num in 0..3 {
        submit(0, req_num);
    }
    submit(1, 10);
    submit(2, 20);

    let done = poll_until(5, 5000, || hook_a.drain_bg_responses());
    assert_eq!(done.len(), 5);
    assert!(hook_b.drain_bg_responses().is_empty());

    let ran_on = ran_on.lock().clone();
    let on_worker = |name: &str| -> Vec<u64> {
        ran_on.iter().filter(|(_, n)| n == name).map(|(r, _)| *r).collect()
    };
    assert_eq!(on_worker("erpc-bg-0"), vec![0, 1, 2]);
    assert_eq!(on_worker("erpc-bg-1"), vec![10]);
    assert_eq!(on_worker("erpc-bg-2"), vec![20]);
}

#[test]
fn test_background_worker_survives_panicking_handler() {
    init_tracing();

    let nexus = test_nexus("localhost", 1);
    nexus
        .register_req_func(
            5,
            ReqFunc::background(|handle: &mut ReqHandle, _: &Context| {
                assert_ne!(handle.req_num, 0, "request 0 fails");
                handle.respond(MsgBuffer::alloc(1, 1024, Direction::Tx).unwrap());
            }),
        )
        .unwrap();
    let hook = Hook::new(0);
    nexus.register_hook(&hook).unwrap();

    for req_num in 0..4 {
        hook.submit_bg_request(0, ReqHandle::new(0, req_num, 5, MsgBuffer::invalid()), Arc::new(()));
    }
    let done = poll_until(4, 5000, || hook.drain_bg_responses());
    assert!(!done[0].has_response());
    assert!(done[1..].iter().all(|h| h.has_response()));

    for req_num in 4..104 {
        hook.submit_bg_request(0, ReqHandle::new(0, req_num, 5, MsgBuffer::invalid()), Arc::new(()));
    }
    let later = poll_until(100, 5000, || hook.drain_bg_responses());
    assert_eq!(later.len(), 100);
}

#[test]
fn test_background_continuations_run_in_order() {
    init_tracing();

    let nexus = test_nexus("localhost", 1);
    let hook = Hook::new(0);
    nexus.register_hook(&hook).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    for req_num in 0..5 {
        let seen = Arc::clone(&seen);
        let resp = RespHandle {
            session_num: 0,
            req_num,
            resp_msgbuf: MsgBuffer::invalid(),
        };
        hook.submit_bg_response(
            0,
            resp,
            Box::new(move |resp: RespHandle, _: &Context| seen.lock().push(resp.req_num)),
            Arc::new(()),
        );
    }

    wait_until(5000, || seen.lock().len() == 5);
    assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_registration_closes_at_first_hook() {
    init_tracing();

    let nexus = test_nexus("localhost", 0);
    let noop = || ReqFunc::foreground(|_: &mut ReqHandle, _: &Context| {});
    nexus.register_req_func(1, noop()).unwrap();

    let hook = Hook::new(0);
    nexus.register_hook(&hook).unwrap();
    assert_eq!(nexus.register_req_func(2, noop()), Err(RegistrationError::RegistrationClosed));

    // A later hook sees the same snapshot.
    let late = Hook::new(1);
    nexus.register_hook(&late).unwrap();
    assert!(late.req_funcs().unwrap().contains(1));
    assert!(!late.req_funcs().unwrap().contains(2));
}

#[test]
fn test_drop_with_pending_work() {
    init_tracing();

    let nexus = test_nexus("localhost", 1);
    let hook = Hook::new(0);
    nexus.register_hook(&hook).unwrap();

    // Nothing is listening on this port; the packet stays queued.
    let pkt = SmPkt::new(SmPktType::ConnectReq, 0, 0, vec![]);
    hook.sm_tx(SmWorkItem::to_host(0, pkt, "127.0.0.1:9"));
    std::thread::sleep(Duration::from_millis(20));

    drop(nexus);
}
