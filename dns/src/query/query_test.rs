use super::*;

fn record(name: &str, priority: u16, weight: u16) -> SrvRecord {
    SrvRecord {
        name: name.to_owned(),
        port: 3478,
        priority,
        weight,
        a: None,
        aaaa: None,
    }
}

#[test]
fn test_order_srv_records_by_priority() {
    let mut records = vec![
        record("c", 30, 0),
        record("a", 10, 0),
        record("b", 20, 0),
    ];
    order_srv_records(&mut records);

    let priorities: Vec<u16> = records.iter().map(|r| r.priority).collect();
    assert_eq!(priorities, vec![10, 20, 30]);
}

#[test]
fn test_order_srv_records_is_a_permutation() {
    let mut records = vec![
        record("a", 10, 5),
        record("b", 10, 60),
        record("c", 10, 35),
        record("d", 5, 0),
    ];
    order_srv_records(&mut records);

    assert_eq!(records.len(), 4);
    assert_eq!(records[0].name, "d", "lowest priority must sort first");
    let mut names: Vec<&str> = records[1..].iter().map(|r| r.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[test]
fn test_order_srv_records_two_sorts_group_identically() {
    // ordering within a priority group is randomised, but the group
    // partitioning itself must be deterministic
    for _ in 0..16 {
        let mut records = vec![
            record("x", 2, 1),
            record("y", 1, 1),
            record("z", 2, 1),
        ];
        order_srv_records(&mut records);
        assert_eq!(records[0].priority, 1);
        assert_eq!(records[1].priority, 2);
        assert_eq!(records[2].priority, 2);
    }
}

#[test]
fn test_address_aggregate_union() {
    let mut aggregate = AddressAggregate::new("a.example,b.example");
    aggregate.pending = 2;

    let mut actions = vec![];
    aggregate.on_sub_result(
        SubSlot::AddressFamily(Family::V4),
        Some(&LookupRecords::Address {
            ttl: 300,
            ips: vec!["192.0.2.1".parse().unwrap()],
        }),
        &mut actions,
    );
    assert!(actions.is_empty());

    aggregate.on_sub_result(
        SubSlot::AddressFamily(Family::V4),
        Some(&LookupRecords::Address {
            ttl: 60,
            ips: vec!["192.0.2.2".parse().unwrap(), "192.0.2.1".parse().unwrap()],
        }),
        &mut actions,
    );

    match actions.as_slice() {
        [StepAction::Complete(Some(DnsAnswer::Addresses { a: Some(a), aaaa: None }))] => {
            assert_eq!(a.ttl, 60, "merged ttl is the minimum");
            assert_eq!(a.ips.len(), 2, "duplicate addresses are not repeated");
        }
        other => panic!("unexpected actions: {other:?}"),
    }
}

#[test]
fn test_address_aggregate_all_failed() {
    let mut aggregate = AddressAggregate::new("gone.example");
    aggregate.pending = 1;

    let mut actions = vec![];
    aggregate.on_sub_result(SubSlot::AddressFamily(Family::V4), None, &mut actions);
    assert!(matches!(
        actions.as_slice(),
        [StepAction::Complete(None)]
    ));
}

#[test]
fn test_srv_aggregate_expands_targets() {
    let mut aggregate = SrvAggregate::new(
        "example",
        "turn",
        "udp",
        SrvLookupOptions::default(),
    );
    aggregate.pending = 1;

    let mut actions = vec![];
    aggregate.on_sub_result(
        SubSlot::SrvLookup,
        Some(&LookupRecords::Srv {
            ttl: 120,
            records: vec![RawSrvRecord {
                priority: 10,
                weight: 5,
                port: 3478,
                target: "relay.example".to_owned(),
            }],
        }),
        &mut actions,
    );

    // one lookup per family for the single non-literal target
    assert_eq!(actions.len(), 2);
    assert!(actions.iter().all(|action| matches!(
        action,
        StepAction::Lookup {
            name,
            family_or_srv: LookupKind::Address(_),
            slot: SubSlot::Target { record: 0, .. },
        } if name == "relay.example"
    )));

    let mut actions = vec![];
    aggregate.on_sub_result(
        SubSlot::Target {
            record: 0,
            family: Family::V4,
        },
        Some(&LookupRecords::Address {
            ttl: 300,
            ips: vec!["192.0.2.7".parse().unwrap()],
        }),
        &mut actions,
    );
    assert!(actions.is_empty());

    let mut actions = vec![];
    aggregate.on_sub_result(
        SubSlot::Target {
            record: 0,
            family: Family::V6,
        },
        None,
        &mut actions,
    );

    match actions.as_slice() {
        [StepAction::Complete(Some(DnsAnswer::Srv(result)))] => {
            assert_eq!(result.ttl, 120);
            assert_eq!(result.records.len(), 1);
            let record = &result.records[0];
            assert_eq!(record.name, "relay.example");
            assert_eq!(record.port, 3478);
            assert!(record.aaaa.is_none(), "failed target family stays empty");
            assert_eq!(
                record.a.as_ref().unwrap().ips,
                vec!["192.0.2.7".parse::<IpAddr>().unwrap()]
            );
        }
        other => panic!("unexpected actions: {other:?}"),
    }
}

#[test]
fn test_srv_aggregate_literal_target_is_not_resolved() {
    let mut aggregate = SrvAggregate::new(
        "example",
        "turn",
        "udp",
        SrvLookupOptions::default(),
    );
    aggregate.pending = 1;

    let mut actions = vec![];
    aggregate.on_sub_result(
        SubSlot::SrvLookup,
        Some(&LookupRecords::Srv {
            ttl: 60,
            records: vec![RawSrvRecord {
                priority: 1,
                weight: 1,
                port: 3478,
                target: "198.51.100.4".to_owned(),
            }],
        }),
        &mut actions,
    );

    match actions.as_slice() {
        [StepAction::Complete(Some(DnsAnswer::Srv(result)))] => {
            let record = &result.records[0];
            assert_eq!(
                record.a.as_ref().unwrap().ips,
                vec!["198.51.100.4".parse::<IpAddr>().unwrap()]
            );
        }
        other => panic!("unexpected actions: {other:?}"),
    }
}
