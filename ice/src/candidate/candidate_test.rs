use super::*;

#[test]
fn test_host_priority() {
    let candidate = Candidate::host("10.0.0.1:5000".parse().unwrap(), 65535);
    // 2^24*126 + 2^8*65535 + 255
    assert_eq!(candidate.priority(), 0x7E00_0000 + 0x00FF_FF00 + 255);
}

#[test]
fn test_type_preferences_order() {
    let host = Candidate::host("10.0.0.1:5000".parse().unwrap(), 65535);
    let srflx = Candidate::server_reflexive(
        "198.51.100.1:5000".parse().unwrap(),
        "10.0.0.1:5000".parse().unwrap(),
        65535,
    );
    let relay = Candidate::relayed(
        "198.51.100.2:5000".parse().unwrap(),
        "10.0.0.1:5000".parse().unwrap(),
        65535,
    );

    assert!(host.priority() > srflx.priority());
    assert!(srflx.priority() > relay.priority());
}

#[test]
fn test_priority_override_wins() {
    let mut candidate = Candidate::host("10.0.0.1:5000".parse().unwrap(), 65535);
    candidate.priority_override = 1234;
    assert_eq!(candidate.priority(), 1234);
}

#[test]
fn test_foundation_groups_by_type_and_base() {
    let a = Candidate::host("10.0.0.1:5000".parse().unwrap(), 65535);
    let b = Candidate::host("10.0.0.1:6000".parse().unwrap(), 65534);
    let c = Candidate::host("10.0.0.2:5000".parse().unwrap(), 65535);

    assert_eq!(a.foundation(), b.foundation(), "same base ip, same foundation");
    assert_ne!(a.foundation(), c.foundation());

    let srflx = Candidate::server_reflexive(
        "198.51.100.1:5000".parse().unwrap(),
        "10.0.0.1:5000".parse().unwrap(),
        65535,
    );
    assert_ne!(a.foundation(), srflx.foundation(), "type changes foundation");
}

#[test]
fn test_base_is_related_address() {
    let relay = Candidate::relayed(
        "198.51.100.2:49000".parse().unwrap(),
        "10.0.0.1:5000".parse().unwrap(),
        65535,
    );
    assert_eq!(relay.base(), "10.0.0.1:5000".parse().unwrap());

    let host = Candidate::host("10.0.0.1:5000".parse().unwrap(), 65535);
    assert_eq!(host.base(), host.addr);
}
