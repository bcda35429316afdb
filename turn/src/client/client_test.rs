use super::*;

const SERVER: &str = "192.0.2.1:3478";
const LOCAL: &str = "10.0.0.5:41000";

fn new_udp_client() -> Client {
    Client::new(
        ClientConfig {
            username: "u".to_owned(),
            password: "p".to_owned(),
            use_channel_binding: true,
            local_addr: LOCAL.parse().unwrap(),
            ..Default::default()
        },
        vec![(SERVER.parse().unwrap(), TransportProtocol::Udp)],
    )
    .unwrap()
}

fn pop_request(client: &mut Client) -> Message {
    let transmit = client.poll_transmit().expect("expected an outbound request");
    assert_eq!(transmit.transport.peer_addr, SERVER.parse().unwrap());
    let mut msg = Message::new();
    msg.raw = transmit.message.to_vec();
    msg.decode().unwrap();
    msg
}

fn reply(client: &mut Client, res: &Message) {
    client
        .handle_read(TaggedBytesMut {
            now: Instant::now(),
            transport: TransportContext {
                local_addr: LOCAL.parse().unwrap(),
                peer_addr: SERVER.parse().unwrap(),
                protocol: TransportProtocol::Udp,
            },
            message: BytesMut::from(&res.raw[..]),
        })
        .unwrap();
}

fn unauthorized_response(request: &Message, realm: &str, nonce: &str) -> Message {
    let mut res = Message::new();
    res.build(&[
        Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_ERROR_RESPONSE)),
        Box::new(request.transaction_id),
        Box::new(ErrorCodeAttribute {
            code: CODE_UNAUTHORIZED,
            reason: b"Unauthorized".to_vec(),
        }),
        Box::new(TextAttribute::new(ATTR_REALM, realm.to_owned())),
        Box::new(TextAttribute::new(ATTR_NONCE, nonce.to_owned())),
    ])
    .unwrap();
    res
}

fn allocate_success(request: &Message) -> Message {
    let mut res = Message::new();
    res.build(&[
        Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_SUCCESS_RESPONSE)),
        Box::new(request.transaction_id),
        Box::new(RelayedAddress {
            ip: "198.51.100.7".parse().unwrap(),
            port: 49123,
        }),
        Box::new(XorMappedAddress {
            ip: "203.0.113.2".parse().unwrap(),
            port: 7000,
        }),
        Box::new(Lifetime(Duration::from_secs(600))),
    ])
    .unwrap();
    res
}

fn success_response(request: &Message, method: stun::message::Method) -> Message {
    let mut res = Message::new();
    res.build(&[
        Box::new(MessageType::new(method, CLASS_SUCCESS_RESPONSE)),
        Box::new(request.transaction_id),
    ])
    .unwrap();
    res
}

/// Drives a fresh client through the 401 handshake into Ready.
fn ready_client() -> Client {
    let mut client = new_udp_client();
    client.handle_timeout(Instant::now());

    let first = pop_request(&mut client);
    reply(&mut client, &unauthorized_response(&first, "r", "n"));

    let second = pop_request(&mut client);
    reply(&mut client, &allocate_success(&second));

    assert_eq!(client.state(), ClientState::Ready);
    while client.poll_event().is_some() {}
    client
}

#[test]
fn test_allocate_authentication_handshake() {
    let mut client = new_udp_client();
    let started = Instant::now();
    client.handle_timeout(started);

    // the first allocate goes out unauthenticated
    let first = pop_request(&mut client);
    assert_eq!(first.typ, MessageType::new(METHOD_ALLOCATE, CLASS_REQUEST));
    assert!(TextAttribute::get_from_as(&first, ATTR_USERNAME).is_err());

    reply(&mut client, &unauthorized_response(&first, "r", "n"));

    // the retry carries the credentials and an integrity over "p"
    let mut second = pop_request(&mut client);
    assert_eq!(
        TextAttribute::get_from_as(&second, ATTR_USERNAME).unwrap().text,
        "u"
    );
    assert_eq!(
        TextAttribute::get_from_as(&second, ATTR_REALM).unwrap().text,
        "r"
    );
    assert_eq!(
        TextAttribute::get_from_as(&second, ATTR_NONCE).unwrap().text,
        "n"
    );
    MessageIntegrity::new_long_term_integrity("u".to_owned(), "r".to_owned(), "p".to_owned())
        .check(&mut second)
        .unwrap();

    reply(&mut client, &allocate_success(&second));

    assert_eq!(client.state(), ClientState::Ready);
    assert_eq!(
        client.relayed_addr(),
        Some("198.51.100.7:49123".parse().unwrap())
    );
    assert_eq!(
        client.reflected_addr(),
        Some("203.0.113.2:7000".parse().unwrap())
    );
    assert!(client.is_udp());

    match client.poll_event() {
        Some(Event::Ready { relayed_addr, .. }) => {
            assert_eq!(relayed_addr, "198.51.100.7:49123".parse().unwrap());
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // refresh is due a minute before the 600s lifetime runs out
    let refresh_at = client.refresh_at.expect("refresh must be scheduled");
    let until_refresh = refresh_at.duration_since(started);
    assert!(
        until_refresh > Duration::from_secs(500) && until_refresh <= Duration::from_secs(540),
        "refresh scheduled after {until_refresh:?}"
    );
}

#[test]
fn test_channel_bind_race_uses_indication_until_bound() {
    let mut client = ready_client();
    let peer: SocketAddr = "203.0.113.5:49170".parse().unwrap();

    assert!(client.send_to(peer, b"X", true).unwrap());

    // one ChannelBind and one CreatePermission go out in parallel; the
    // payload itself stays queued
    let mut bind_request = None;
    let mut permission_request = None;
    while let Some(transmit) = client.poll_transmit() {
        let mut msg = Message::new();
        msg.raw = transmit.message.to_vec();
        msg.decode().unwrap();
        match msg.typ.method {
            METHOD_CHANNEL_BIND => bind_request = Some(msg),
            METHOD_CREATE_PERMISSION => permission_request = Some(msg),
            method => panic!("unexpected outbound method {method}"),
        }
    }
    let bind_request = bind_request.expect("channel bind expected");
    let permission_request = permission_request.expect("create permission expected");

    let mut peer_addr = PeerAddress::default();
    peer_addr.get_from(&permission_request).unwrap();
    assert_eq!(peer_addr.ip, peer.ip());

    // permission installs first: the queued payload drains as a SEND
    // indication, not channel data
    reply(
        &mut client,
        &success_response(&permission_request, METHOD_CREATE_PERMISSION),
    );

    let indication = pop_request(&mut client);
    assert_eq!(
        indication.typ,
        MessageType::new(METHOD_SEND, CLASS_INDICATION)
    );
    let mut data = Data::default();
    data.get_from(&indication).unwrap();
    assert_eq!(data.0, b"X".to_vec());

    assert!(matches!(client.poll_event(), Some(Event::WriteReady)));

    // once the binding confirms, the next send switches to CHANNEL-DATA
    reply(
        &mut client,
        &success_response(&bind_request, METHOD_CHANNEL_BIND),
    );

    assert!(client.send_to(peer, b"Y", true).unwrap());
    let transmit = client.poll_transmit().expect("channel data expected");
    let mut ch_data = ChannelData {
        raw: transmit.message.to_vec(),
        ..Default::default()
    };
    ch_data.decode().unwrap();
    assert!(ch_data.number.is_valid());
    assert_eq!(ch_data.data, b"Y".to_vec());
}

#[test]
fn test_restricted_destination_drops_silently() {
    let mut client = ready_client();
    client.config.restricted_destinations =
        Some(["198.51.100.40".parse::<IpAddr>().unwrap()].into_iter().collect());

    let blocked: SocketAddr = "203.0.113.9:5000".parse().unwrap();
    assert!(client.send_to(blocked, b"data", false).unwrap());
    assert!(client.poll_transmit().is_none(), "filter misses drop silently");
}

#[test]
fn test_send_before_ready_reports_not_ready() {
    let mut client = new_udp_client();
    let peer: SocketAddr = "203.0.113.5:49170".parse().unwrap();
    assert!(!client.send_to(peer, b"early", false).unwrap());
}

#[test]
fn test_invalid_destination_rejected() {
    let mut client = ready_client();
    let unspecified: SocketAddr = "0.0.0.0:4000".parse().unwrap();
    assert_eq!(
        client.send_to(unspecified, b"data", false),
        Err(Error::ErrInvalidDestination)
    );
}

#[test]
fn test_graceful_shutdown_deallocates() {
    let mut client = ready_client();
    client.shutdown();
    assert_eq!(client.state(), ClientState::ShuttingDown);

    let dealloc = pop_request(&mut client);
    assert_eq!(dealloc.typ, MessageType::new(METHOD_REFRESH, CLASS_REQUEST));
    let mut lifetime = Lifetime(Duration::from_secs(1));
    lifetime.get_from(&dealloc).unwrap();
    assert_eq!(lifetime.0, Duration::from_secs(0));

    reply(&mut client, &success_response(&dealloc, METHOD_REFRESH));
    assert_eq!(client.state(), ClientState::Shutdown);
    match client.poll_event() {
        Some(Event::Closed { error }) => {
            assert_eq!(error, Some(Error::ErrUserRequestedShutdown));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // shutting down twice is a no-op
    client.shutdown();
    assert!(client.poll_event().is_none());
    assert!(client.poll_transmit().is_none());
}

#[test]
fn test_bogus_tcp_stream_poisons_connection() {
    let mut client = Client::new(
        ClientConfig {
            username: "u".to_owned(),
            password: "p".to_owned(),
            local_addr: LOCAL.parse().unwrap(),
            ..Default::default()
        },
        vec![(SERVER.parse().unwrap(), TransportProtocol::Tcp)],
    )
    .unwrap();

    client.handle_timeout(Instant::now());
    match client.poll_event() {
        Some(Event::TcpConnectRequired { server }) => {
            assert_eq!(server, SERVER.parse().unwrap());
        }
        other => panic!("unexpected event: {other:?}"),
    }
    client.on_tcp_connected(SERVER.parse().unwrap());
    let _allocate = pop_request(&mut client);

    let result = client.handle_read(TaggedBytesMut {
        now: Instant::now(),
        transport: TransportContext {
            local_addr: LOCAL.parse().unwrap(),
            peer_addr: SERVER.parse().unwrap(),
            protocol: TransportProtocol::Tcp,
        },
        message: BytesMut::from(&[0xffu8, 0x00, 0x00, 0x00][..]),
    });

    assert_eq!(result, Err(Error::ErrBogusDataOnSocketReceived));
    assert_eq!(client.state(), ClientState::Shutdown);
}
