#[cfg(test)]
mod socket_test;

use bytes::BytesMut;
use log::{debug, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crc::{Crc, CRC_32_ISCSI};
use stun::attributes::ATTR_USERNAME;
use stun::fingerprint::FINGERPRINT;
use stun::agent::TransactionId;
use stun::message::{
    is_message, Getter, Message, BINDING_REQUEST, CLASS_ERROR_RESPONSE, CLASS_REQUEST,
    CLASS_SUCCESS_RESPONSE,
};
use stun::textattrs::TextAttribute;
use stun::xoraddr::XorMappedAddress;

use dns::SrvResult;
use requester::{Requester, RequesterConfig, RequesterMap, RetransmitProfile};
use shared::error::{Error, Result};
use shared::{FourTuple, TaggedBytesMut, TransportContext, TransportProtocol};

use crate::candidate::{Candidate, DEFAULT_LOCAL_PREFERENCE};
use crate::rand::{generate_pwd, generate_ufrag};
use crate::session::{
    FoundationProgress, IceRole, IceSession, KeepAliveConfig, SessionConfig, SessionEvent,
};

/// Handle of a session owned by the socket's registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum SocketState {
    /// Candidate gathering in progress.
    #[default]
    Pending,
    /// Every discovery and relay allocation settled.
    Ready,
    Shutdown,
}

/// One TURN server the socket relays through.
pub struct TurnServerConfig {
    pub username: String,
    pub password: String,
    pub software: String,
    pub srv_udp: Option<SrvResult>,
    pub srv_tcp: Option<SrvResult>,
    pub force_transport: Option<TransportProtocol>,
    pub use_channel_binding: bool,
    pub channel_range: (u16, u16),
    pub restricted_destinations: Option<std::collections::HashSet<std::net::IpAddr>>,
}

impl Default for TurnServerConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            software: String::new(),
            srv_udp: None,
            srv_tcp: None,
            force_transport: None,
            use_channel_binding: true,
            channel_range: turn::DEFAULT_CHANNEL_RANGE,
            restricted_destinations: None,
        }
    }
}

#[derive(Default)]
pub struct IceSocketConfig {
    /// Bound local UDP socket addresses, one per interface, preference
    /// decreasing in list order.
    pub local_addrs: Vec<SocketAddr>,
    pub stun_servers: Vec<SocketAddr>,
    pub turn_servers: Vec<TurnServerConfig>,
    /// Generated when left empty.
    pub local_ufrag: String,
    /// Generated when left empty.
    pub local_pwd: String,
}

#[derive(Debug)]
pub enum IceSocketEvent {
    StateChange(SocketState),
    /// The gathered candidate set changed; `crc` is its version.
    CandidatesChanged { crc: u32 },
    TcpConnectRequired { server: SocketAddr },
    TcpCloseRequired { server: SocketAddr },
    Session { id: SessionId, event: SessionEvent },
}

/// A server-reflexive discovery outstanding against a STUN server.
#[derive(Debug, Copy, Clone)]
struct Discovery {
    local_addr: SocketAddr,
}

struct TurnEntry {
    client: turn::Client,
    local_addr: SocketAddr,
    relayed: Option<SocketAddr>,
}

struct SessionEntry {
    session: IceSession,
    foundation: Option<SessionId>,
}

/// Owns the local sockets' candidate view, the TURN clients and the session
/// registry, and demultiplexes every inbound datagram.
pub struct IceSocket {
    local_ufrag: String,
    local_pwd: String,
    state: SocketState,

    local_candidates: Vec<Candidate>,
    candidates_crc: u32,

    discoveries: RequesterMap<Discovery>,
    turn: Vec<TurnEntry>,

    sessions: HashMap<SessionId, SessionEntry>,
    routes: HashMap<FourTuple, SessionId>,
    next_session_id: u64,

    transmits: VecDeque<TaggedBytesMut>,
    events: VecDeque<IceSocketEvent>,
}

fn stun_err(err: stun::Error) -> Error {
    Error::Other(err.to_string())
}

fn candidates_crc(candidates: &[Candidate]) -> u32 {
    let mut lines: Vec<String> = candidates
        .iter()
        .map(|candidate| candidate.to_string())
        .collect();
    lines.sort_unstable();
    Crc::<u32>::new(&CRC_32_ISCSI).checksum(lines.join("\n").as_bytes())
}

impl IceSocket {
    pub fn new(config: IceSocketConfig) -> Result<Self> {
        if config.local_addrs.is_empty() {
            return Err(Error::Other("no local addresses to gather on".to_owned()));
        }

        let local_ufrag = if config.local_ufrag.is_empty() {
            generate_ufrag()
        } else {
            config.local_ufrag
        };
        let local_pwd = if config.local_pwd.is_empty() {
            generate_pwd()
        } else {
            config.local_pwd
        };

        let mut socket = Self {
            local_ufrag,
            local_pwd,
            state: SocketState::Pending,
            local_candidates: vec![],
            candidates_crc: 0,
            discoveries: RequesterMap::new(),
            turn: vec![],
            sessions: HashMap::new(),
            routes: HashMap::new(),
            next_session_id: 0,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        };

        // host candidates, preference decreasing across interfaces
        for (index, local_addr) in config.local_addrs.iter().enumerate() {
            let preference = DEFAULT_LOCAL_PREFERENCE.saturating_sub(index as u16);
            socket.add_local_candidate(Candidate::host(*local_addr, preference));
        }

        // server-reflexive discovery per (local socket, STUN server)
        let now = Instant::now();
        for stun_server in &config.stun_servers {
            for local_addr in &config.local_addrs {
                socket.start_discovery(*local_addr, *stun_server, now);
            }
        }

        // one TURN client per relay server on the primary socket
        let primary = config.local_addrs[0];
        for server in config.turn_servers {
            let client_config = turn::ClientConfig {
                username: server.username,
                password: server.password,
                software: server.software,
                local_addr: primary,
                use_channel_binding: server.use_channel_binding,
                channel_range: server.channel_range,
                force_transport: server.force_transport,
                restricted_destinations: server.restricted_destinations,
            };
            match turn::Client::from_srv(
                client_config,
                server.srv_udp.as_ref(),
                server.srv_tcp.as_ref(),
            ) {
                Ok(client) => socket.turn.push(TurnEntry {
                    client,
                    local_addr: primary,
                    relayed: None,
                }),
                Err(err) => warn!("skipping relay server with no resolved addresses: {err}"),
            }
        }

        socket.check_gathering_complete();
        Ok(socket)
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn local_ufrag(&self) -> &str {
        &self.local_ufrag
    }

    pub fn local_pwd(&self) -> &str {
        &self.local_pwd
    }

    /// The gathered candidates plus their version CRC.
    pub fn local_candidates(&self) -> (&[Candidate], u32) {
        (&self.local_candidates, self.candidates_crc)
    }

    //-------------------------------------------------------------------
    // gathering
    //-------------------------------------------------------------------

    fn start_discovery(&mut self, local_addr: SocketAddr, server: SocketAddr, now: Instant) {
        let mut msg = Message::new();
        if let Err(err) = msg.build(&[
            Box::new(TransactionId::new()),
            Box::new(BINDING_REQUEST),
            Box::new(FINGERPRINT),
        ]) {
            warn!("failed to build binding discovery: {err}");
            return;
        }

        let requester = Requester::new(
            RequesterConfig {
                transaction_id: msg.transaction_id,
                purpose: Discovery { local_addr },
                raw: BytesMut::from(&msg.raw[..]),
                local_addr,
                peer_addr: server,
                protocol: TransportProtocol::Udp,
                profile: RetransmitProfile::Udp,
            },
            now,
        );
        if let Err(err) = self.discoveries.send(requester) {
            warn!("failed to start binding discovery: {err}");
        }
    }

    fn add_local_candidate(&mut self, candidate: Candidate) {
        if self
            .local_candidates
            .iter()
            .any(|existing| existing.equal(&candidate))
        {
            return;
        }
        debug!("gathered candidate: {candidate}");
        self.local_candidates.push(candidate);
        self.refresh_candidates_version();
    }

    /// Recomputes the version CRC and, when it changed, notifies the
    /// subscriber and refreshes every session's pair list.
    fn refresh_candidates_version(&mut self) {
        let crc = candidates_crc(&self.local_candidates);
        if crc == self.candidates_crc {
            return;
        }
        self.candidates_crc = crc;
        self.events
            .push_back(IceSocketEvent::CandidatesChanged { crc });

        let candidates = self.local_candidates.clone();
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            if let Some(entry) = self.sessions.get_mut(&id) {
                entry.session.update_local_candidates(&candidates);
            }
            self.pump_session(id);
        }
    }

    fn check_gathering_complete(&mut self) {
        if self.state != SocketState::Pending {
            return;
        }
        let discoveries_done = self.discoveries.is_empty();
        let relays_done = self.turn.iter().all(|entry| {
            matches!(
                entry.client.state(),
                turn::ClientState::Ready | turn::ClientState::Shutdown
            )
        });
        if discoveries_done && relays_done {
            self.state = SocketState::Ready;
            self.events
                .push_back(IceSocketEvent::StateChange(SocketState::Ready));
        }
    }

    //-------------------------------------------------------------------
    // sessions
    //-------------------------------------------------------------------

    /// Creates a session towards one peer. `foundation` names an earlier
    /// session on this socket whose check results order this session's
    /// frozen pairs.
    pub fn create_session(
        &mut self,
        remote_ufrag: &str,
        remote_pwd: &str,
        remote_candidates: Vec<Candidate>,
        role: IceRole,
        keep_alive: KeepAliveConfig,
        foundation: Option<SessionId>,
    ) -> Result<SessionId> {
        if remote_ufrag.is_empty() {
            return Err(Error::ErrRemoteUfragEmpty);
        }

        let mut session = IceSession::new(SessionConfig {
            role,
            local_ufrag: self.local_ufrag.clone(),
            local_pwd: self.local_pwd.clone(),
            remote_ufrag: remote_ufrag.to_owned(),
            remote_pwd: remote_pwd.to_owned(),
            keep_alive,
        })?;
        session.update_local_candidates(&self.local_candidates);
        for candidate in remote_candidates {
            session.add_remote_candidate(candidate);
        }

        self.next_session_id += 1;
        let id = SessionId(self.next_session_id);
        self.sessions.insert(
            id,
            SessionEntry {
                session,
                foundation,
            },
        );
        self.pump_session(id);
        Ok(id)
    }

    pub fn session(&self, id: SessionId) -> Option<&IceSession> {
        self.sessions.get(&id).map(|entry| &entry.session)
    }

    pub fn add_remote_candidate(&mut self, id: SessionId, candidate: Candidate) -> Result<()> {
        match self.sessions.get_mut(&id) {
            Some(entry) => {
                entry.session.add_remote_candidate(candidate);
                self.pump_session(id);
                Ok(())
            }
            None => Err(Error::ErrSessionNotExists),
        }
    }

    pub fn end_of_remote_candidates(&mut self, id: SessionId) -> Result<()> {
        match self.sessions.get_mut(&id) {
            Some(entry) => {
                entry.session.end_of_remote_candidates();
                self.pump_session(id);
                Ok(())
            }
            None => Err(Error::ErrSessionNotExists),
        }
    }

    pub fn set_session_keep_alive(&mut self, id: SessionId, keep_alive: KeepAliveConfig) -> Result<()> {
        match self.sessions.get_mut(&id) {
            Some(entry) => {
                entry.session.set_keep_alive(keep_alive);
                Ok(())
            }
            None => Err(Error::ErrSessionNotExists),
        }
    }

    /// Sends user data through a session's nominated pair.
    pub fn send(&mut self, id: SessionId, data: &[u8]) -> Result<bool> {
        match self.sessions.get_mut(&id) {
            Some(entry) => entry.session.send(data),
            None => Err(Error::ErrSessionNotExists),
        }
    }

    pub fn close_session(&mut self, id: SessionId) -> Result<()> {
        match self.sessions.get_mut(&id) {
            Some(entry) => {
                entry.session.close();
                self.pump_session(id);
                self.routes.retain(|_, session_id| *session_id != id);
                Ok(())
            }
            None => Err(Error::ErrSessionNotExists),
        }
    }

    fn pump_session(&mut self, id: SessionId) {
        let (routes, events) = match self.sessions.get_mut(&id) {
            Some(entry) => {
                let routes = entry.session.take_pending_routes();
                let mut events = vec![];
                while let Some(event) = entry.session.poll_event() {
                    events.push(event);
                }
                (routes, events)
            }
            None => return,
        };

        for (via, peer) in routes {
            trace!("adding route {via} -> {peer} for {id:?}");
            self.routes.insert(FourTuple::new(via, peer), id);
        }
        for event in events {
            self.events.push_back(IceSocketEvent::Session { id, event });
        }
    }

    //-------------------------------------------------------------------
    // TURN plumbing
    //-------------------------------------------------------------------

    fn pump_turn(&mut self, index: usize) {
        loop {
            let event = match self.turn[index].client.poll_event() {
                Some(event) => event,
                None => break,
            };
            match event {
                turn::Event::TcpConnectRequired { server } => {
                    self.events
                        .push_back(IceSocketEvent::TcpConnectRequired { server });
                }
                turn::Event::TcpCloseRequired { server } => {
                    self.events
                        .push_back(IceSocketEvent::TcpCloseRequired { server });
                }
                turn::Event::Ready {
                    relayed_addr,
                    reflected_addr,
                } => {
                    self.turn[index].relayed = Some(relayed_addr);
                    let base = self.turn[index].local_addr;
                    self.add_local_candidate(Candidate::relayed(
                        relayed_addr,
                        base,
                        DEFAULT_LOCAL_PREFERENCE,
                    ));
                    if let Some(reflected) = reflected_addr {
                        self.add_local_candidate(Candidate::server_reflexive(
                            reflected,
                            base,
                            DEFAULT_LOCAL_PREFERENCE,
                        ));
                    }
                    self.check_gathering_complete();
                }
                turn::Event::DataReceived { peer, data } => {
                    // unwrapped relay traffic behaves like a direct path via
                    // the relayed candidate
                    if let Some(via) = self.turn[index].relayed {
                        self.route_bytes(via, peer, data);
                    }
                }
                turn::Event::WriteReady => {}
                turn::Event::Closed { error } => {
                    debug!("relay client closed: {error:?}");
                    self.check_gathering_complete();
                }
            }
        }
    }

    pub fn on_tcp_connected(&mut self, server: SocketAddr) {
        for index in 0..self.turn.len() {
            if self.turn[index].client.is_server(server) {
                self.turn[index].client.on_tcp_connected(server);
                self.pump_turn(index);
            }
        }
    }

    pub fn on_tcp_closed(&mut self, server: SocketAddr) {
        for index in 0..self.turn.len() {
            if self.turn[index].client.is_server(server) {
                self.turn[index].client.on_tcp_closed(server);
                self.pump_turn(index);
            }
        }
    }

    //-------------------------------------------------------------------
    // inbound demultiplex
    //-------------------------------------------------------------------

    pub fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        if self.state == SocketState::Shutdown {
            return Ok(());
        }
        let from = msg.transport.peer_addr;

        // anything on a TCP link belongs to the TURN client that asked for it;
        // likewise UDP traffic from a relay server
        if let Some(index) = self
            .turn
            .iter()
            .position(|entry| entry.client.is_server(from))
        {
            let result = self.turn[index].client.handle_read(msg);
            self.pump_turn(index);
            return result;
        }
        if msg.transport.protocol == TransportProtocol::Tcp {
            trace!("TCP bytes from unknown peer {from}");
            return Ok(());
        }

        let via = msg.transport.local_addr;
        self.route_bytes(via, from, msg.message);
        Ok(())
    }

    /// Routes post-unwrap bytes by `(via local candidate, remote address)`.
    fn route_bytes(&mut self, via: SocketAddr, from: SocketAddr, data: BytesMut) {
        if is_message(&data) {
            let mut msg = Message::new();
            msg.raw = data.to_vec();
            if let Err(err) = msg.decode() {
                warn!("undecodable STUN datagram from {from}: {err}");
                return;
            }

            if (msg.typ.class == CLASS_SUCCESS_RESPONSE || msg.typ.class == CLASS_ERROR_RESPONSE)
                && self.discoveries.contains(&msg.transaction_id)
            {
                self.handle_discovery_response(&msg, from);
                return;
            }

            self.route_stun_to_session(msg, via, from);
        } else if let Some(&id) = self.routes.get(&FourTuple::new(via, from)) {
            if let Some(entry) = self.sessions.get_mut(&id) {
                entry.session.handle_user_packet(via, from, data);
            }
            self.pump_session(id);
        } else {
            trace!("dropping datagram from {from}: no route on {via}");
        }
    }

    fn handle_discovery_response(&mut self, msg: &Message, from: SocketAddr) {
        let discovery = match self.discoveries.handle_response(&msg.transaction_id, from) {
            Some(requester) => requester.purpose,
            None => return,
        };

        let mut reflected = XorMappedAddress::default();
        match reflected.get_from(msg).map_err(stun_err) {
            Ok(()) => {
                let addr = SocketAddr::new(reflected.ip, reflected.port);
                self.add_local_candidate(Candidate::server_reflexive(
                    addr,
                    discovery.local_addr,
                    DEFAULT_LOCAL_PREFERENCE,
                ));
            }
            Err(err) => warn!("binding discovery answer without mapped address: {err}"),
        }
        self.check_gathering_complete();
    }

    fn route_stun_to_session(&mut self, mut msg: Message, via: SocketAddr, from: SocketAddr) {
        if let Some(&id) = self.routes.get(&FourTuple::new(via, from)) {
            if let Some(entry) = self.sessions.get_mut(&id) {
                entry.session.handle_stun(&mut msg, via, from);
            }
            self.pump_session(id);
            return;
        }

        // no route yet: a Binding request picks its session by username,
        // "<our ufrag>:<their ufrag>"
        if msg.typ.class != CLASS_REQUEST {
            trace!("dropping unroutable STUN answer from {from}");
            return;
        }
        let username = match TextAttribute::get_from_as(&msg, ATTR_USERNAME) {
            Ok(username) => username.text,
            Err(_) => {
                trace!("dropping anonymous binding request from {from}");
                return;
            }
        };
        let mut parts = username.splitn(2, ':');
        let local_part = parts.next().unwrap_or_default();
        let remote_part = parts.next().unwrap_or_default().to_owned();
        if local_part != self.local_ufrag {
            trace!("binding request for foreign ufrag {local_part}");
            return;
        }

        let target = self
            .sessions
            .iter()
            .find(|(_, entry)| entry.session.remote_ufrag() == remote_part)
            .map(|(id, _)| *id);
        match target {
            Some(id) => {
                if let Some(entry) = self.sessions.get_mut(&id) {
                    entry.session.handle_stun(&mut msg, via, from);
                }
                self.routes.insert(FourTuple::new(via, from), id);
                self.pump_session(id);
            }
            None => {
                trace!("no session for remote ufrag {remote_part}");
            }
        }
    }

    //-------------------------------------------------------------------
    // timers
    //-------------------------------------------------------------------

    pub fn poll_timeout(&self) -> Option<Instant> {
        let mut earliest = self.discoveries.poll_timeout();
        let mut consider = |candidate: Option<Instant>| {
            if let Some(time) = candidate {
                earliest = Some(match earliest {
                    Some(existing) if existing <= time => existing,
                    _ => time,
                });
            }
        };

        for entry in &self.turn {
            consider(entry.client.poll_timeout());
        }
        for entry in self.sessions.values() {
            consider(entry.session.poll_timeout());
        }
        earliest
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if self.state == SocketState::Shutdown {
            return;
        }

        self.discoveries.handle_timeout(now);
        let mut discovery_done = false;
        while self.discoveries.poll_event().is_some() {
            discovery_done = true;
        }
        if discovery_done {
            self.check_gathering_complete();
        }

        for index in 0..self.turn.len() {
            self.turn[index].client.handle_timeout(now);
            self.pump_turn(index);
        }

        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            let foundation = self
                .sessions
                .get(&id)
                .and_then(|entry| entry.foundation)
                .filter(|foundation_id| *foundation_id != id);
            let progress: Option<FoundationProgress> = foundation.and_then(|foundation_id| {
                self.sessions
                    .get(&foundation_id)
                    .map(|entry| entry.session.foundation_progress())
            });
            if let Some(entry) = self.sessions.get_mut(&id) {
                entry.session.handle_timeout(now, progress.as_ref());
            }
            self.pump_session(id);
        }
    }

    //-------------------------------------------------------------------
    // lifecycle
    //-------------------------------------------------------------------

    /// Guarantees gathered candidates stay valid for at least `min_validity`.
    pub fn wakeup(&mut self, min_validity: Duration) {
        for index in 0..self.turn.len() {
            self.turn[index].client.wakeup(min_validity);
            self.pump_turn(index);
        }
    }

    pub fn shutdown(&mut self) {
        if self.state == SocketState::Shutdown {
            return;
        }

        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            if let Some(entry) = self.sessions.get_mut(&id) {
                entry.session.close();
            }
            self.pump_session(id);
        }

        for index in 0..self.turn.len() {
            self.turn[index].client.shutdown();
            self.pump_turn(index);
        }

        self.discoveries.clear();
        self.routes.clear();
        self.state = SocketState::Shutdown;
        self.events
            .push_back(IceSocketEvent::StateChange(SocketState::Shutdown));
    }

    //-------------------------------------------------------------------
    // poll surface
    //-------------------------------------------------------------------

    pub fn poll_transmit(&mut self) -> Option<TaggedBytesMut> {
        self.collect_transmits();
        self.transmits.pop_front()
    }

    fn collect_transmits(&mut self) {
        while let Some(transmit) = self.discoveries.poll_transmit() {
            self.transmits.push_back(transmit);
        }

        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            loop {
                let transmit = match self.sessions.get_mut(&id) {
                    Some(entry) => entry.session.poll_transmit(),
                    None => None,
                };
                let Some(transmit) = transmit else { break };

                // sends via a relayed candidate tunnel through the TURN client
                let relay = self
                    .turn
                    .iter()
                    .position(|entry| entry.relayed == Some(transmit.transport.local_addr));
                match relay {
                    Some(index) => {
                        if let Err(err) = self.turn[index].client.send_to(
                            transmit.transport.peer_addr,
                            &transmit.message,
                            true,
                        ) {
                            warn!("relayed send failed: {err}");
                        }
                        self.pump_turn(index);
                    }
                    None => self.transmits.push_back(transmit),
                }
            }
        }

        for index in 0..self.turn.len() {
            while let Some(transmit) = self.turn[index].client.poll_transmit() {
                self.transmits.push_back(transmit);
            }
        }
    }

    pub fn poll_event(&mut self) -> Option<IceSocketEvent> {
        self.events.pop_front()
    }
}
