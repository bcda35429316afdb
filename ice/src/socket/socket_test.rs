use super::*;
use stun::integrity::MessageIntegrity;

use crate::attributes::AttrControlling;
use crate::attributes::PriorityAttr;

const LOCAL: &str = "10.0.0.1:41000";
const STUN_SERVER: &str = "198.51.100.10:3478";
const PEER: &str = "192.0.2.30:50000";

const UFRAG: &str = "socketFragSocket";
const PWD: &str = "socketPwdSocketPwdSocketPwdSock0";

fn new_socket() -> IceSocket {
    IceSocket::new(IceSocketConfig {
        local_addrs: vec![LOCAL.parse().unwrap()],
        stun_servers: vec![STUN_SERVER.parse().unwrap()],
        turn_servers: vec![],
        local_ufrag: UFRAG.to_owned(),
        local_pwd: PWD.to_owned(),
    })
    .unwrap()
}

fn drain_events(socket: &mut IceSocket) -> Vec<IceSocketEvent> {
    let mut events = vec![];
    while let Some(event) = socket.poll_event() {
        events.push(event);
    }
    events
}

fn udp_read(local: &str, peer: &str, message: BytesMut) -> TaggedBytesMut {
    TaggedBytesMut {
        now: Instant::now(),
        transport: TransportContext {
            local_addr: local.parse().unwrap(),
            peer_addr: peer.parse().unwrap(),
            protocol: TransportProtocol::Udp,
        },
        message,
    }
}

#[test]
fn test_gathering_host_and_server_reflexive() {
    let mut socket = new_socket();

    let (candidates, crc) = socket.local_candidates();
    assert_eq!(candidates.len(), 1, "host candidate gathered up front");
    assert_eq!(candidates[0].candidate_type, crate::CandidateType::Host);
    let host_crc = crc;

    // the binding discovery goes out to the STUN server
    let transmit = socket.poll_transmit().expect("binding discovery expected");
    assert_eq!(transmit.transport.peer_addr, STUN_SERVER.parse().unwrap());
    let mut request = Message::new();
    request.raw = transmit.message.to_vec();
    request.decode().unwrap();
    assert_eq!(request.typ, BINDING_REQUEST);

    // the mapped address comes back and becomes a srflx candidate
    let mut response = Message::new();
    response
        .build(&[
            Box::new(request.transaction_id),
            Box::new(stun::message::BINDING_SUCCESS),
            Box::new(XorMappedAddress {
                ip: "203.0.113.77".parse().unwrap(),
                port: 61000,
            }),
        ])
        .unwrap();
    socket
        .handle_read(udp_read(LOCAL, STUN_SERVER, BytesMut::from(&response.raw[..])))
        .unwrap();

    let (candidates, crc) = socket.local_candidates();
    assert_eq!(candidates.len(), 2);
    let srflx = candidates
        .iter()
        .find(|candidate| candidate.candidate_type == crate::CandidateType::ServerReflexive)
        .expect("server-reflexive candidate expected");
    assert_eq!(srflx.addr, "203.0.113.77:61000".parse().unwrap());
    assert_eq!(srflx.related_addr, Some(LOCAL.parse().unwrap()));
    assert_ne!(crc, host_crc, "the candidate version changed");

    let events = drain_events(&mut socket);
    assert!(events
        .iter()
        .any(|event| matches!(event, IceSocketEvent::CandidatesChanged { .. })));
    assert!(
        events
            .iter()
            .any(|event| matches!(event, IceSocketEvent::StateChange(SocketState::Ready))),
        "gathering completes once every discovery settled"
    );
    assert_eq!(socket.state(), SocketState::Ready);
}

#[test]
fn test_binding_request_routes_by_ufrag_and_installs_route() {
    let mut socket = new_socket();
    let id = socket
        .create_session(
            "peerFragPeerFrag",
            "",
            vec![],
            IceRole::Controlled,
            KeepAliveConfig::default(),
            None,
        )
        .unwrap();
    drain_events(&mut socket);

    // a connectivity check arrives from an address we never saw: the
    // username picks the session, which admits a peer-reflexive candidate
    let mut request = Message::new();
    request
        .build(&[
            Box::new(TransactionId::new()),
            Box::new(BINDING_REQUEST),
            Box::new(TextAttribute::new(
                ATTR_USERNAME,
                format!("{UFRAG}:peerFragPeerFrag"),
            )),
            Box::new(PriorityAttr(0x6E00_0000)),
            Box::new(AttrControlling(7)),
            Box::new(MessageIntegrity::new_short_term_integrity(PWD.to_owned())),
            Box::new(stun::fingerprint::FINGERPRINT),
        ])
        .unwrap();
    socket
        .handle_read(udp_read(LOCAL, PEER, BytesMut::from(&request.raw[..])))
        .unwrap();

    // the session answered through the socket (the gathering discovery may
    // still be queued ahead of it)
    let mut answered = false;
    while let Some(transmit) = socket.poll_transmit() {
        if transmit.transport.peer_addr == PEER.parse().unwrap() {
            answered = true;
        }
    }
    assert!(answered, "binding answer expected");

    // opaque user data on the same tuple now routes to the session
    socket
        .handle_read(udp_read(LOCAL, PEER, BytesMut::from(&b"payload"[..])))
        .unwrap();
    let events = drain_events(&mut socket);
    assert!(events.iter().any(|event| matches!(
        event,
        IceSocketEvent::Session {
            id: session_id,
            event: SessionEvent::PacketReceived { .. },
        } if *session_id == id
    )));
}

#[test]
fn test_unroutable_datagram_is_dropped() {
    let mut socket = new_socket();
    drain_events(&mut socket);

    socket
        .handle_read(udp_read(LOCAL, PEER, BytesMut::from(&b"garbage"[..])))
        .unwrap();
    assert!(drain_events(&mut socket).is_empty());
}

#[test]
fn test_shutdown_closes_sessions_once() {
    let mut socket = new_socket();
    let id = socket
        .create_session(
            "peerFragPeerFrag",
            "",
            vec![],
            IceRole::Controlling,
            KeepAliveConfig::default(),
            None,
        )
        .unwrap();
    drain_events(&mut socket);

    socket.shutdown();
    let events = drain_events(&mut socket);
    assert!(events.iter().any(|event| matches!(
        event,
        IceSocketEvent::Session {
            id: session_id,
            event: SessionEvent::Closed { error: None },
        } if *session_id == id
    )));
    assert!(events
        .iter()
        .any(|event| matches!(event, IceSocketEvent::StateChange(SocketState::Shutdown))));

    // a second shutdown emits nothing
    socket.shutdown();
    assert!(drain_events(&mut socket).is_empty());
}
