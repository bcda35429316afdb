use super::*;
use std::time::Duration;

const LOCAL: &str = "10.0.0.1:4000";
const PEER: &str = "192.0.2.10:3478";

fn new_requester(purpose: u32, profile: RetransmitProfile, now: Instant) -> Requester<u32> {
    Requester::new(
        RequesterConfig {
            transaction_id: TransactionId::new(),
            purpose,
            raw: BytesMut::from(&b"request"[..]),
            local_addr: LOCAL.parse().unwrap(),
            peer_addr: PEER.parse().unwrap(),
            protocol: TransportProtocol::Udp,
            profile,
        },
        now,
    )
}

fn drain_transmits<P>(map: &mut RequesterMap<P>) -> usize {
    let mut n = 0;
    while map.poll_transmit().is_some() {
        n += 1;
    }
    n
}

#[test]
fn test_duplicate_transaction_id_rejected() -> Result<()> {
    let now = Instant::now();
    let mut map = RequesterMap::new();

    let first = new_requester(1, RetransmitProfile::Udp, now);
    let transaction_id = first.transaction_id;
    map.send(first)?;

    let mut second = new_requester(2, RetransmitProfile::Udp, now);
    second.transaction_id = transaction_id;
    assert_eq!(map.send(second), Err(Error::ErrTransactionExists));

    Ok(())
}

#[test]
fn test_single_outcome() -> Result<()> {
    let now = Instant::now();
    let mut map = RequesterMap::new();

    let requester = new_requester(7, RetransmitProfile::Udp, now);
    let transaction_id = requester.transaction_id;
    map.send(requester)?;

    let matched = map.handle_response(&transaction_id, PEER.parse().unwrap());
    assert!(matched.is_some());
    assert_eq!(matched.unwrap().purpose, 7);

    // a second response for the same transaction is not deliverable
    assert!(map
        .handle_response(&transaction_id, PEER.parse().unwrap())
        .is_none());

    // and the transaction can no longer time out
    map.handle_timeout(now + Duration::from_secs(60));
    assert!(map.poll_event().is_none());

    Ok(())
}

#[test]
fn test_response_from_unexpected_address_ignored() -> Result<()> {
    let now = Instant::now();
    let mut map = RequesterMap::new();

    let requester = new_requester(1, RetransmitProfile::Udp, now);
    let transaction_id = requester.transaction_id;
    map.send(requester)?;

    let spoofed: SocketAddr = "198.51.100.99:3478".parse().unwrap();
    assert!(map.handle_response(&transaction_id, spoofed).is_none());
    assert!(map.contains(&transaction_id));

    Ok(())
}

#[test]
fn test_cancel_is_idempotent() -> Result<()> {
    let now = Instant::now();
    let mut map = RequesterMap::new();

    let requester = new_requester(1, RetransmitProfile::Udp, now);
    let transaction_id = requester.transaction_id;
    map.send(requester)?;

    assert!(map.cancel(&transaction_id).is_some());
    assert!(map.cancel(&transaction_id).is_none());

    // no outcome after cancellation
    map.handle_timeout(now + Duration::from_secs(60));
    assert!(map.poll_event().is_none());
    Ok(())
}

#[test]
fn test_udp_retransmit_schedule() -> Result<()> {
    let start = Instant::now();
    let mut map = RequesterMap::new();
    map.send(new_requester(1, RetransmitProfile::Udp, start))?;

    // initial transmission
    assert_eq!(drain_transmits(&mut map), 1);

    // walk the doubling schedule: 500, 1000, 1600, 1600, 1600, 1600
    let mut sends = 1;
    let mut now = start;
    loop {
        let deadline = match map.poll_timeout() {
            Some(deadline) => deadline,
            None => break,
        };
        now = deadline;
        map.handle_timeout(now);
        sends += drain_transmits(&mut map);
        if map.poll_event().is_some() {
            break;
        }
    }

    assert_eq!(sends, 7, "RFC 5389 schedule sends 7 requests total");
    assert!(map.is_empty());
    assert!(
        now.duration_since(start) >= Duration::from_millis(7900),
        "final timeout fired too early: {:?}",
        now.duration_since(start)
    );

    Ok(())
}

#[test]
fn test_tcp_profile_single_send() -> Result<()> {
    let start = Instant::now();
    let mut map = RequesterMap::new();
    let requester = new_requester(1, RetransmitProfile::Tcp, start);
    let transaction_id = requester.transaction_id;
    map.send(requester)?;

    assert_eq!(drain_transmits(&mut map), 1);

    let deadline = map.poll_timeout().unwrap();
    assert_eq!(deadline - start, Duration::from_millis(39_500));

    map.handle_timeout(deadline);
    assert_eq!(drain_transmits(&mut map), 0, "stream transport never resends");
    match map.poll_event() {
        Some(RequesterEvent::Timeout {
            transaction_id: tid,
            purpose,
        }) => {
            assert_eq!(tid, transaction_id);
            assert_eq!(purpose, 1);
        }
        _ => panic!("expected timeout event"),
    }

    Ok(())
}

#[test]
fn test_retry_now_keeps_budget() -> Result<()> {
    let start = Instant::now();
    let mut map = RequesterMap::new();
    let requester = new_requester(1, RetransmitProfile::IceCheck, start);
    let transaction_id = requester.transaction_id;
    map.send(requester)?;
    assert_eq!(drain_transmits(&mut map), 1);

    map.retry_now(&transaction_id, start + Duration::from_millis(10));
    assert_eq!(drain_transmits(&mut map), 1);
    assert!(map.contains(&transaction_id));

    Ok(())
}
