use super::*;
use crate::candidate::CandidateType;

const LOCAL_UFRAG: &str = "localFragLocalF0";
const LOCAL_PWD: &str = "localPwdLocalPwdLocalPwdLocalPw0";
const REMOTE_UFRAG: &str = "remoteFragRemote";
const REMOTE_PWD: &str = "remotePwdRemotePwdRemotePwdRemo0";

const VIA: &str = "10.0.0.1:40000";
const PEER: &str = "192.0.2.20:50000";

fn new_session(role: IceRole, remote_pwd: &str) -> IceSession {
    let mut session = IceSession::new(SessionConfig {
        role,
        local_ufrag: LOCAL_UFRAG.to_owned(),
        local_pwd: LOCAL_PWD.to_owned(),
        remote_ufrag: REMOTE_UFRAG.to_owned(),
        remote_pwd: remote_pwd.to_owned(),
        keep_alive: KeepAliveConfig::default(),
    })
    .unwrap();

    session.update_local_candidates(&[Candidate::host(VIA.parse().unwrap(), 65535)]);
    session
}

fn add_peer(session: &mut IceSession, addr: &str) {
    session.add_remote_candidate(Candidate::remote(
        CandidateType::Host,
        addr.parse().unwrap(),
        0x7E00_01FF,
    ));
}

fn drain_events(session: &mut IceSession) -> Vec<SessionEvent> {
    let mut events = vec![];
    while let Some(event) = session.poll_event() {
        events.push(event);
    }
    events
}

fn drain_transmits(session: &mut IceSession) -> Vec<Message> {
    let mut messages = vec![];
    while let Some(transmit) = session.poll_transmit() {
        let mut msg = Message::new();
        msg.raw = transmit.message.to_vec();
        msg.decode().unwrap();
        messages.push(msg);
    }
    messages
}

fn inbound_request(
    extra: Vec<Box<dyn Setter>>,
    username: &str,
    integrity_pwd: &str,
) -> Message {
    let mut setters: Vec<Box<dyn Setter>> = vec![
        Box::new(TransactionId::new()),
        Box::new(BINDING_REQUEST),
        Box::new(TextAttribute::new(ATTR_USERNAME, username.to_owned())),
        Box::new(PriorityAttr(0x7E00_01FE)),
    ];
    setters.extend(extra);
    setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
        integrity_pwd.to_owned(),
    )));
    setters.push(Box::new(FINGERPRINT));

    let mut msg = Message::new();
    msg.build(&setters).unwrap();
    msg
}

fn local_username() -> String {
    format!("{LOCAL_UFRAG}:{REMOTE_UFRAG}")
}

#[test]
fn test_activation_sends_credentialed_check() {
    let mut session = new_session(IceRole::Controlling, REMOTE_PWD);
    add_peer(&mut session, PEER);
    assert_eq!(session.state(), SessionState::Searching);
    drain_events(&mut session);

    session.handle_timeout(Instant::now(), None);
    let messages = drain_transmits(&mut session);
    assert_eq!(messages.len(), 1, "one pair is probed per tick");

    let mut check = messages.into_iter().next().unwrap();
    assert_eq!(check.typ, BINDING_REQUEST);

    let username = TextAttribute::get_from_as(&check, ATTR_USERNAME).unwrap();
    assert_eq!(username.text, format!("{REMOTE_UFRAG}:{LOCAL_UFRAG}"));

    let mut priority = PriorityAttr::default();
    priority.get_from(&check).unwrap();
    assert_ne!(priority.0, 0);

    assert!(check.contains(stun::attributes::ATTR_ICE_CONTROLLING));
    MessageIntegrity::new_short_term_integrity(REMOTE_PWD.to_owned())
        .check(&mut check)
        .unwrap();
}

#[test]
fn test_plain_probe_without_remote_password() {
    let mut session = new_session(IceRole::Controlling, "");
    add_peer(&mut session, PEER);
    drain_events(&mut session);

    session.handle_timeout(Instant::now(), None);
    let messages = drain_transmits(&mut session);
    assert_eq!(messages.len(), 1);
    let check = &messages[0];
    assert!(TextAttribute::get_from_as(check, ATTR_USERNAME).is_err());
    assert!(!check.contains(ATTR_MESSAGE_INTEGRITY));
}

#[test]
fn test_role_conflict_lower_tie_breaker_switches_and_answers_success() {
    let mut session = new_session(IceRole::Controlling, REMOTE_PWD);
    add_peer(&mut session, PEER);
    session.set_tie_breaker(0xA000_0000_0000_0000);
    drain_events(&mut session);
    drain_transmits(&mut session);

    // peer also claims controlling, with the larger tie-breaker
    let mut request = inbound_request(
        vec![Box::new(AttrControlling(0xB000_0000_0000_0000))],
        &local_username(),
        LOCAL_PWD,
    );
    session.handle_stun(&mut request, VIA.parse().unwrap(), PEER.parse().unwrap());

    assert_eq!(session.role(), IceRole::Controlled, "loser switches roles");

    let messages = drain_transmits(&mut session);
    let response = messages
        .iter()
        .find(|msg| msg.typ.class == CLASS_SUCCESS_RESPONSE)
        .expect("the switched side answers 200, never 487");
    assert_eq!(response.transaction_id, request.transaction_id);

    let mut mapped = XorMappedAddress::default();
    mapped.get_from(response).unwrap();
    assert_eq!(SocketAddr::new(mapped.ip, mapped.port), PEER.parse().unwrap());

    assert!(
        !messages.iter().any(|msg| msg.typ.class == CLASS_ERROR_RESPONSE),
        "no 487 goes out from the losing side"
    );
}

#[test]
fn test_role_conflict_higher_tie_breaker_answers_487() {
    let mut session = new_session(IceRole::Controlling, REMOTE_PWD);
    add_peer(&mut session, PEER);
    session.set_tie_breaker(0xB000_0000_0000_0000);
    drain_events(&mut session);
    drain_transmits(&mut session);

    let mut request = inbound_request(
        vec![Box::new(AttrControlling(0xA000_0000_0000_0000))],
        &local_username(),
        LOCAL_PWD,
    );
    session.handle_stun(&mut request, VIA.parse().unwrap(), PEER.parse().unwrap());

    assert_eq!(session.role(), IceRole::Controlling, "winner keeps its role");

    let messages = drain_transmits(&mut session);
    let response = messages
        .iter()
        .find(|msg| msg.typ.class == CLASS_ERROR_RESPONSE)
        .expect("winner answers with an error");
    assert_eq!(error_code(response), Some(CODE_ROLE_CONFLICT.0));
}

#[test]
fn test_equal_tie_breakers_resolve_to_controlling_wins() {
    let mut session = new_session(IceRole::Controlling, REMOTE_PWD);
    add_peer(&mut session, PEER);
    session.set_tie_breaker(0xAAAA_AAAA_AAAA_AAAA);
    drain_events(&mut session);
    drain_transmits(&mut session);

    let mut request = inbound_request(
        vec![Box::new(AttrControlling(0xAAAA_AAAA_AAAA_AAAA))],
        &local_username(),
        LOCAL_PWD,
    );
    session.handle_stun(&mut request, VIA.parse().unwrap(), PEER.parse().unwrap());

    // the >= comparison keeps us controlling on the tie
    assert_eq!(session.role(), IceRole::Controlling);
}

#[test]
fn test_foreign_username_dropped_without_reply() {
    let mut session = new_session(IceRole::Controlled, REMOTE_PWD);
    add_peer(&mut session, PEER);
    drain_events(&mut session);
    drain_transmits(&mut session);

    let mut request = inbound_request(
        vec![],
        &format!("someoneElse:{REMOTE_UFRAG}"),
        LOCAL_PWD,
    );
    session.handle_stun(&mut request, VIA.parse().unwrap(), PEER.parse().unwrap());

    assert!(
        drain_transmits(&mut session).is_empty(),
        "mismatching username prefix must not be answered"
    );
}

#[test]
fn test_failed_integrity_answers_401() {
    let mut session = new_session(IceRole::Controlled, REMOTE_PWD);
    add_peer(&mut session, PEER);
    drain_events(&mut session);
    drain_transmits(&mut session);

    let mut request = inbound_request(vec![], &local_username(), "wrongPassword000");
    session.handle_stun(&mut request, VIA.parse().unwrap(), PEER.parse().unwrap());

    let messages = drain_transmits(&mut session);
    let response = messages
        .iter()
        .find(|msg| msg.typ.class == CLASS_ERROR_RESPONSE)
        .expect("integrity failure earns an error response");
    assert_eq!(error_code(response), Some(CODE_UNAUTHORIZED.0));
}

#[test]
fn test_use_candidate_nominates_on_controlled_side() {
    let mut session = new_session(IceRole::Controlled, REMOTE_PWD);
    add_peer(&mut session, PEER);
    drain_events(&mut session);
    drain_transmits(&mut session);

    let mut request = inbound_request(
        vec![
            Box::new(AttrControlling(1)),
            Box::new(UseCandidateAttr::new()),
        ],
        &local_username(),
        LOCAL_PWD,
    );
    session.handle_stun(&mut request, VIA.parse().unwrap(), PEER.parse().unwrap());

    assert_eq!(session.state(), SessionState::Nominated);
    let (local, remote) = session.nominated_pair().expect("pair nominated");
    assert_eq!(local.addr, VIA.parse().unwrap());
    assert_eq!(remote.addr, PEER.parse().unwrap());

    let events = drain_events(&mut session);
    assert!(events
        .iter()
        .any(|event| matches!(event, SessionEvent::NominatedPairChanged(Some(_)))));
    assert!(events
        .iter()
        .any(|event| matches!(event, SessionEvent::WriteReady)));

    let routes = session.take_pending_routes();
    assert_eq!(
        routes,
        vec![(VIA.parse().unwrap(), PEER.parse().unwrap())]
    );
}

#[test]
fn test_controlling_nominates_after_both_directions_verified() {
    let mut session = new_session(IceRole::Controlling, REMOTE_PWD);
    add_peer(&mut session, PEER);
    drain_events(&mut session);

    // our check goes out
    session.handle_timeout(Instant::now(), None);
    let check = drain_transmits(&mut session)
        .into_iter()
        .find(|msg| msg.typ == BINDING_REQUEST)
        .expect("connectivity check expected");

    // the peer checks us, proving the reverse direction
    let mut request = inbound_request(
        vec![Box::new(AttrControlled(1))],
        &local_username(),
        LOCAL_PWD,
    );
    session.handle_stun(&mut request, VIA.parse().unwrap(), PEER.parse().unwrap());
    drain_transmits(&mut session);

    // and answers our check
    let mut response = Message::new();
    response
        .build(&[
            Box::new(check.transaction_id),
            Box::new(BINDING_SUCCESS),
            Box::new(XorMappedAddress {
                ip: VIA.parse::<SocketAddr>().unwrap().ip(),
                port: VIA.parse::<SocketAddr>().unwrap().port(),
            }),
            Box::new(MessageIntegrity::new_short_term_integrity(
                REMOTE_PWD.to_owned(),
            )),
            Box::new(FINGERPRINT),
        ])
        .unwrap();
    session.handle_stun(&mut response, VIA.parse().unwrap(), PEER.parse().unwrap());

    assert_eq!(session.state(), SessionState::Nominating);
    let mut nominate = drain_transmits(&mut session)
        .into_iter()
        .find(|msg| {
            msg.typ == BINDING_REQUEST && UseCandidateAttr::is_set(msg)
        })
        .expect("USE-CANDIDATE check expected");
    MessageIntegrity::new_short_term_integrity(REMOTE_PWD.to_owned())
        .check(&mut nominate)
        .unwrap();

    // its success completes the nomination
    let mut nominate_response = Message::new();
    nominate_response
        .build(&[
            Box::new(nominate.transaction_id),
            Box::new(BINDING_SUCCESS),
            Box::new(XorMappedAddress {
                ip: VIA.parse::<SocketAddr>().unwrap().ip(),
                port: VIA.parse::<SocketAddr>().unwrap().port(),
            }),
            Box::new(MessageIntegrity::new_short_term_integrity(
                REMOTE_PWD.to_owned(),
            )),
            Box::new(FINGERPRINT),
        ])
        .unwrap();
    session.handle_stun(
        &mut nominate_response,
        VIA.parse().unwrap(),
        PEER.parse().unwrap(),
    );

    assert_eq!(session.state(), SessionState::Nominated);
}

#[test]
fn test_end_of_candidates_with_all_pairs_failed_closes_once() {
    let mut session = new_session(IceRole::Controlling, REMOTE_PWD);
    add_peer(&mut session, "192.0.2.21:50000");
    add_peer(&mut session, "192.0.2.22:50000");
    add_peer(&mut session, "192.0.2.23:50000");
    assert_eq!(session.state(), SessionState::Searching);
    drain_events(&mut session);

    session.end_of_remote_candidates();

    // let every check run out of retries
    for _ in 0..1024 {
        let deadline = match session.poll_timeout() {
            Some(deadline) => deadline,
            None => break,
        };
        session.handle_timeout(deadline, None);
        drain_transmits(&mut session);
        if session.state() == SessionState::Shutdown {
            break;
        }
    }

    assert_eq!(session.state(), SessionState::Shutdown);
    let events = drain_events(&mut session);

    let state_changes: Vec<&SessionEvent> = events
        .iter()
        .filter(|event| matches!(event, SessionEvent::StateChange(_)))
        .collect();
    assert_eq!(
        state_changes.len(),
        1,
        "exactly one state change is emitted: {state_changes:?}"
    );
    assert!(matches!(
        state_changes[0],
        SessionEvent::StateChange(SessionState::Shutdown)
    ));

    assert!(events.iter().any(|event| matches!(
        event,
        SessionEvent::Closed {
            error: Some(Error::ErrCandidateSearchFailed)
        }
    )));
}

#[test]
fn test_close_twice_is_noop() {
    let mut session = new_session(IceRole::Controlling, REMOTE_PWD);
    add_peer(&mut session, PEER);
    drain_events(&mut session);

    session.close();
    assert_eq!(session.state(), SessionState::Shutdown);
    let first = drain_events(&mut session);
    assert!(first
        .iter()
        .any(|event| matches!(event, SessionEvent::Closed { error: None })));

    session.close();
    assert!(drain_events(&mut session).is_empty());
}

#[test]
fn test_frozen_pair_waits_for_foundation() {
    let mut session = new_session(IceRole::Controlling, REMOTE_PWD);
    add_peer(&mut session, PEER);
    drain_events(&mut session);

    let local: SocketAddr = VIA.parse().unwrap();
    let foundation_key = (
        Candidate::host(local, 65535).foundation(),
        PEER.parse::<SocketAddr>().unwrap().ip(),
    );

    // frozen: the foundation session has not succeeded on this key yet
    let mut progress = FoundationProgress::new();
    progress.insert(foundation_key.clone(), PairProgress::default());
    session.handle_timeout(Instant::now(), Some(&progress));
    assert!(
        drain_transmits(&mut session).is_empty(),
        "frozen pairs must not be probed"
    );

    // unfrozen once the foundation pair succeeded
    progress.insert(
        foundation_key,
        PairProgress {
            succeeded: true,
            failed: false,
        },
    );
    session.handle_timeout(Instant::now() + Duration::from_millis(40), Some(&progress));
    assert_eq!(drain_transmits(&mut session).len(), 1);
}
