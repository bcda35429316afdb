#[cfg(test)]
mod client_test;

pub(crate) mod channel;
pub(crate) mod framing;
pub(crate) mod permission;
pub(crate) mod server;

use bytes::BytesMut;
use log::{debug, trace, warn};
use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use stun::attributes::{ATTR_NONCE, ATTR_REALM, ATTR_SOFTWARE, ATTR_USERNAME};
use stun::error_code::{
    ErrorCodeAttribute, CODE_INSUFFICIENT_CAPACITY, CODE_STALE_NONCE, CODE_UNAUTHORIZED,
};
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::agent::TransactionId;
use stun::message::{
    is_message, Getter, Message, MessageType, Setter, CLASS_ERROR_RESPONSE,
    CLASS_INDICATION, CLASS_REQUEST, CLASS_SUCCESS_RESPONSE, METHOD_ALLOCATE, METHOD_CHANNEL_BIND,
    METHOD_CREATE_PERMISSION, METHOD_DATA, METHOD_REFRESH, METHOD_SEND,
};
use stun::textattrs::TextAttribute;
use stun::xoraddr::XorMappedAddress;

use dns::SrvResult;
use requester::{Requester, RequesterConfig, RequesterEvent, RequesterMap, RetransmitProfile};
use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportContext, TransportProtocol};

use crate::proto::chandata::ChannelData;
use crate::proto::channum::{ChannelNumber, MAX_CHANNEL_NUMBER, MIN_CHANNEL_NUMBER};
use crate::proto::data::Data;
use crate::proto::lifetime::{Lifetime, DEFAULT_LIFETIME};
use crate::proto::peeraddr::PeerAddress;
use crate::proto::relayaddr::RelayedAddress;
use crate::proto::reqtrans::{RequestedTransport, PROTO_UDP};

use channel::{ChannelMap, CHANNEL_IDLE_TIMEOUT, CHANNEL_REFRESH_INTERVAL};
use framing::{peek_frame, FramePeek};
use permission::PermissionMap;
use server::{Server, READ_BUFFER_LIMIT};

/// Default CHANNEL-DATA number range.
pub const DEFAULT_CHANNEL_RANGE: (u16, u16) = (MIN_CHANNEL_NUMBER, MAX_CHANNEL_NUMBER);

/// Spacing between trial-list entries becoming eligible.
const ACTIVATION_SPACING: Duration = Duration::from_secs(4);
/// The activation list is walked on a one-second ticker.
const ACTIVATION_TICK: Duration = Duration::from_secs(1);
/// Permissions are refreshed on this cadence (server expiry is ~5 minutes).
const PERMISSION_REFRESH_INTERVAL: Duration = Duration::from_secs(4 * 60);
/// Something must reach the server at least this often to keep NAT state.
const SERVER_KEEPALIVE_WINDOW: Duration = Duration::from_secs(20);
/// Floor of the refresh schedule.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClientState {
    #[default]
    Pending,
    Ready,
    ShuttingDown,
    Shutdown,
}

/// Events surfaced to the owner of the client.
#[derive(Debug)]
pub enum Event {
    /// The owner must open a TCP link to this server and report
    /// [Client::on_tcp_connected].
    TcpConnectRequired { server: SocketAddr },
    /// The owner may drop the TCP link to this (losing) server.
    TcpCloseRequired { server: SocketAddr },
    /// Allocation succeeded.
    Ready {
        relayed_addr: SocketAddr,
        reflected_addr: Option<SocketAddr>,
    },
    /// A packet was relayed to us, unwrapped from a DATA indication or a
    /// CHANNEL-DATA frame. `peer` is the apparent peer address.
    DataReceived { peer: SocketAddr, data: BytesMut },
    /// Queued sends were flushed after a permission install.
    WriteReady,
    /// The client reached Shutdown.
    Closed { error: Option<Error> },
}

/// What an outstanding transaction was for.
#[derive(Debug)]
enum Purpose {
    /// Unauthenticated allocate probing one server.
    AllocateAttempt { server_index: usize },
    /// Authenticated allocate.
    Allocate {
        server_index: usize,
        retried_nonce: bool,
    },
    Refresh { retried_nonce: bool },
    Dealloc,
    CreatePermission {
        peers: Vec<IpAddr>,
        retried_nonce: bool,
    },
    ChannelBind {
        peer: SocketAddr,
        number: u16,
        retried_nonce: bool,
    },
}

pub struct ClientConfig {
    pub username: String,
    pub password: String,
    pub software: String,
    /// Local address of the socket the owner reads/writes for us.
    pub local_addr: SocketAddr,
    /// Bind channels on demand instead of always using indications.
    pub use_channel_binding: bool,
    pub channel_range: (u16, u16),
    /// Restrict the trial list to one transport.
    pub force_transport: Option<TransportProtocol>,
    /// Relayed sends to IPs outside this set are silently dropped.
    pub restricted_destinations: Option<HashSet<IpAddr>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            software: String::new(),
            local_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            use_channel_binding: false,
            channel_range: DEFAULT_CHANNEL_RANGE,
            force_transport: None,
            restricted_destinations: None,
        }
    }
}

/// Sans-io TURN allocation client. Owns the allocation lifecycle: server
/// selection, long-term-credential authentication, refresh, permissions and
/// channel bindings. The owner moves bytes and TCP links for it.
pub struct Client {
    config: ClientConfig,
    state: ClientState,
    last_error: Option<Error>,

    realm: String,
    nonce: String,

    servers: Vec<Server>,
    active: Option<usize>,
    relayed_addr: Option<SocketAddr>,
    reflected_addr: Option<SocketAddr>,
    lifetime: Duration,

    requests: RequesterMap<Purpose>,
    refresh_tx: Option<TransactionId>,
    permission_tx: Option<TransactionId>,
    dealloc_tx: Option<TransactionId>,

    permissions: PermissionMap,
    permission_capacity: usize,
    channels: ChannelMap,

    last_sent_to_server: Instant,
    next_activation: Option<Instant>,
    refresh_at: Option<Instant>,
    permission_refresh_at: Option<Instant>,

    transmits: VecDeque<TaggedBytesMut>,
    events: VecDeque<Event>,
}

fn stun_err(err: stun::Error) -> Error {
    Error::Other(err.to_string())
}

impl Client {
    /// Builds the client from a pre-resolved server list. Entries activate
    /// staggered in list order.
    pub fn new(config: ClientConfig, servers: Vec<(SocketAddr, TransportProtocol)>) -> Result<Self> {
        let now = Instant::now();

        let mut trial_list = vec![];
        let mut seen = HashSet::new();
        for (addr, protocol) in servers {
            if let Some(forced) = config.force_transport {
                if protocol != forced {
                    continue;
                }
            }
            // never try the same server twice
            if !seen.insert((addr.ip(), protocol)) {
                continue;
            }
            let activate_after = now + ACTIVATION_SPACING * (trial_list.len() as u32);
            trial_list.push(Server::new(addr, protocol, activate_after));
        }

        if trial_list.is_empty() {
            return Err(Error::ErrDnsLookupFailure);
        }

        Ok(Self {
            config,
            state: ClientState::Pending,
            last_error: None,
            realm: String::new(),
            nonce: String::new(),
            servers: trial_list,
            active: None,
            relayed_addr: None,
            reflected_addr: None,
            lifetime: DEFAULT_LIFETIME,
            requests: RequesterMap::new(),
            refresh_tx: None,
            permission_tx: None,
            dealloc_tx: None,
            permissions: PermissionMap::new(),
            permission_capacity: usize::MAX,
            channels: ChannelMap::new(),
            last_sent_to_server: now,
            next_activation: Some(now),
            refresh_at: None,
            permission_refresh_at: None,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    /// Builds the trial list from the two SRV trees, interleaving UDP and
    /// TCP entries so both transports are probed early.
    pub fn from_srv(
        config: ClientConfig,
        srv_udp: Option<&SrvResult>,
        srv_tcp: Option<&SrvResult>,
    ) -> Result<Self> {
        let udp: Vec<SocketAddr> = srv_udp.map(|srv| srv.addresses()).unwrap_or_default();
        let tcp: Vec<SocketAddr> = srv_tcp.map(|srv| srv.addresses()).unwrap_or_default();

        let mut servers = vec![];
        let mut udp_iter = udp.into_iter();
        let mut tcp_iter = tcp.into_iter();
        loop {
            let u = udp_iter.next();
            let t = tcp_iter.next();
            if u.is_none() && t.is_none() {
                break;
            }
            if let Some(addr) = u {
                servers.push((addr, TransportProtocol::Udp));
            }
            if let Some(addr) = t {
                servers.push((addr, TransportProtocol::Tcp));
            }
        }

        Self::new(config, servers)
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// The relay address, set once Ready.
    pub fn relayed_addr(&self) -> Option<SocketAddr> {
        self.relayed_addr
    }

    /// Our address as the server saw it, set once Ready.
    pub fn reflected_addr(&self) -> Option<SocketAddr> {
        self.reflected_addr
    }

    pub fn active_server_addr(&self) -> Option<SocketAddr> {
        self.active.map(|index| self.servers[index].addr)
    }

    /// Whether the active (or prospective) relay path runs over UDP.
    pub fn is_udp(&self) -> bool {
        match self.active {
            Some(index) => self.servers[index].is_udp(),
            None => self.servers.iter().any(|server| server.is_udp()),
        }
    }

    /// Whether `addr` is one of the trial-list servers.
    pub fn is_server(&self, addr: SocketAddr) -> bool {
        self.servers.iter().any(|server| server.addr == addr)
    }

    pub fn is_active_server(&self, addr: SocketAddr) -> bool {
        self.active_server_addr() == Some(addr)
    }

    /// Whether `buf` starts with a channel number this allocation bound.
    pub fn matches_channel_prefix(&self, buf: &[u8]) -> bool {
        if buf.len() < 2 {
            return false;
        }
        let number = u16::from_be_bytes([buf[0], buf[1]]);
        self.channels.contains_number(number)
    }

    //-------------------------------------------------------------------
    // outbound data path
    //-------------------------------------------------------------------

    /// Relays `data` to `peer`. Returns `Ok(false)` while the allocation is
    /// not ready. Queues behind a permission install when necessary;
    /// `bind_channel_if_possible` additionally installs a channel binding.
    pub fn send_to(
        &mut self,
        peer: SocketAddr,
        data: &[u8],
        bind_channel_if_possible: bool,
    ) -> Result<bool> {
        if self.state != ClientState::Ready {
            return Ok(false);
        }
        if peer.ip().is_unspecified() || peer.port() == 0 {
            return Err(Error::ErrInvalidDestination);
        }
        if let Some(allowed) = &self.config.restricted_destinations {
            if !allowed.contains(&peer.ip()) {
                trace!("dropping relayed send to restricted destination {peer}");
                return Ok(true);
            }
        }

        let now = Instant::now();

        if self.config.use_channel_binding
            && bind_channel_if_possible
            && self.channels.get(&peer.ip()).is_none()
        {
            self.bind_channel(peer, now);
        }

        if let Some(channel) = self.channels.get_mut(&peer.ip()) {
            if channel.bound {
                channel.last_sent_at = now;
                let number = channel.number;
                return self.send_channel_data(number, data, now).map(|_| true);
            }
        }

        let installed = self
            .permissions
            .get(&peer.ip())
            .map(|permission| permission.installed)
            .unwrap_or(false);

        if installed {
            self.send_indication(peer, data, now)?;
            if let Some(permission) = self.permissions.get_mut(&peer.ip()) {
                permission.last_sent_at = now;
            }
            return Ok(true);
        }

        // no permission yet: queue and trigger an immediate batch install
        let needs_request = !self.permissions.contains(&peer.ip());
        let permission = self.permissions.entry(peer.ip(), now);
        permission.pending.push((peer, data.to_vec()));
        if needs_request || self.permission_tx.is_none() {
            self.request_permissions_now(now);
        }
        Ok(true)
    }

    fn send_indication(&mut self, peer: SocketAddr, data: &[u8], now: Instant) -> Result<()> {
        let mut msg = Message::new();
        msg.build(&[
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(METHOD_SEND, CLASS_INDICATION)),
            Box::new(PeerAddress::from(peer)),
            Box::new(Data(data.to_vec())),
            Box::new(FINGERPRINT),
        ])
        .map_err(stun_err)?;

        self.transmit_to_active(BytesMut::from(&msg.raw[..]), now);
        Ok(())
    }

    fn send_channel_data(&mut self, number: u16, data: &[u8], now: Instant) -> Result<()> {
        let stream = !self.is_udp();
        let mut ch_data = ChannelData {
            number: ChannelNumber(number),
            data: data.to_vec(),
            raw: vec![],
        };
        ch_data.encode(stream)?;
        self.transmit_to_active(BytesMut::from(&ch_data.raw[..]), now);
        Ok(())
    }

    fn transmit_to_active(&mut self, raw: BytesMut, now: Instant) {
        let (peer_addr, protocol) = match self.active {
            Some(index) => (self.servers[index].addr, self.servers[index].protocol),
            None => return,
        };
        self.last_sent_to_server = now;
        self.transmits.push_back(TaggedBytesMut {
            now,
            transport: TransportContext {
                local_addr: self.config.local_addr,
                peer_addr,
                protocol,
            },
            message: raw,
        });
    }

    //-------------------------------------------------------------------
    // channels
    //-------------------------------------------------------------------

    fn bind_channel(&mut self, peer: SocketAddr, now: Instant) {
        let number = match self.channels.random_free_number(self.config.channel_range) {
            Some(number) => number,
            None => {
                warn!("no free channel number inside the configured range");
                return;
            }
        };
        self.channels.insert(peer, number, now);
        // a channel binding implies a permission; make sure one is tracked
        self.permissions.entry(peer.ip(), now);
        self.send_channel_bind(peer, number, false, now);
    }

    fn send_channel_bind(&mut self, peer: SocketAddr, number: u16, retried_nonce: bool, now: Instant) {
        let msg = match self.build_authenticated(
            MessageType::new(METHOD_CHANNEL_BIND, CLASS_REQUEST),
            |setters| {
                setters.push(Box::new(ChannelNumber(number)));
                setters.push(Box::new(PeerAddress::from(peer)));
            },
        ) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("failed to build channel bind request: {err}");
                return;
            }
        };

        let transaction_id = msg.transaction_id;
        if let Some(channel) = self.channels.get_mut(&peer.ip()) {
            channel.bind_tx = Some(transaction_id);
        }
        self.perform(
            msg,
            Purpose::ChannelBind {
                peer,
                number,
                retried_nonce,
            },
            now,
        );
    }

    //-------------------------------------------------------------------
    // permissions
    //-------------------------------------------------------------------

    fn request_permissions_now(&mut self, now: Instant) {
        if self.state != ClientState::Ready || self.permissions.is_empty() {
            return;
        }
        if let Some(transaction_id) = self.permission_tx.take() {
            self.requests.cancel(&transaction_id);
        }

        // batch uninstalled peers first, then refresh the rest, capped by
        // the capacity the server advertised through 508 answers
        let mut peers = self.permissions.uninstalled_ips();
        for ip in self.permissions.ips() {
            if !peers.contains(&ip) {
                peers.push(ip);
            }
        }
        peers.truncate(self.permission_capacity);
        if peers.is_empty() {
            return;
        }

        let msg = match self.build_authenticated(
            MessageType::new(METHOD_CREATE_PERMISSION, CLASS_REQUEST),
            |setters| {
                for ip in &peers {
                    setters.push(Box::new(PeerAddress {
                        ip: *ip,
                        port: 0,
                    }));
                }
            },
        ) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("failed to build create permission request: {err}");
                return;
            }
        };

        self.permission_tx = Some(msg.transaction_id);
        self.perform(
            msg,
            Purpose::CreatePermission {
                peers,
                retried_nonce: false,
            },
            now,
        );
        self.permission_refresh_at = Some(now + PERMISSION_REFRESH_INTERVAL);
    }

    fn handle_permission_response(
        &mut self,
        res: Message,
        peers: Vec<IpAddr>,
        retried_nonce: bool,
        now: Instant,
    ) {
        self.permission_tx = None;

        if res.typ.class == CLASS_ERROR_RESPONSE {
            let code = error_code(&res);
            if code == Some(CODE_STALE_NONCE.0) && !retried_nonce {
                self.update_nonce(&res);
                let msg = match self.build_authenticated(
                    MessageType::new(METHOD_CREATE_PERMISSION, CLASS_REQUEST),
                    |setters| {
                        for ip in &peers {
                            setters.push(Box::new(PeerAddress { ip: *ip, port: 0 }));
                        }
                    },
                ) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!("failed to rebuild create permission request: {err}");
                        return;
                    }
                };
                self.permission_tx = Some(msg.transaction_id);
                self.perform(
                    msg,
                    Purpose::CreatePermission {
                        peers,
                        retried_nonce: true,
                    },
                    now,
                );
            } else if code == Some(CODE_INSUFFICIENT_CAPACITY.0) {
                // back the batch size off and retry right away
                self.permission_capacity = std::cmp::max(1, peers.len().saturating_sub(1));
                debug!(
                    "server reported insufficient capacity, batching {} permissions",
                    self.permission_capacity
                );
                self.request_permissions_now(now);
            } else {
                warn!("create permission failed: {:?}", code);
            }
            return;
        }

        let mut flushed = false;
        for ip in peers {
            let pending = match self.permissions.get_mut(&ip) {
                Some(permission) => {
                    permission.installed = true;
                    std::mem::take(&mut permission.pending)
                }
                None => continue,
            };
            for (peer, payload) in pending {
                flushed = true;
                if let Err(err) = self.send_indication(peer, &payload, now) {
                    warn!("failed to flush queued send to {peer}: {err}");
                }
            }
        }
        if flushed {
            self.events.push_back(Event::WriteReady);
        }
    }

    //-------------------------------------------------------------------
    // allocate / refresh
    //-------------------------------------------------------------------

    fn start_allocate_attempt(&mut self, server_index: usize, now: Instant) {
        let server = &mut self.servers[server_index];
        server.tried = true;

        let mut setters: Vec<Box<dyn Setter>> = vec![
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(METHOD_ALLOCATE, CLASS_REQUEST)),
            Box::new(RequestedTransport {
                protocol: PROTO_UDP,
            }),
        ];
        if !self.config.software.is_empty() {
            setters.push(Box::new(TextAttribute::new(
                ATTR_SOFTWARE,
                self.config.software.clone(),
            )));
        }
        setters.push(Box::new(FINGERPRINT));

        let mut msg = Message::new();
        if let Err(err) = msg.build(&setters) {
            warn!("failed to build allocate request: {err}");
            return;
        }

        trace!("probing {} over {:?}", self.servers[server_index].addr, self.servers[server_index].protocol);
        self.perform_to(
            msg,
            server_index,
            Purpose::AllocateAttempt { server_index },
            now,
        );
    }

    fn start_authenticated_allocate(&mut self, server_index: usize, retried_nonce: bool, now: Instant) {
        let msg = match self.build_authenticated(
            MessageType::new(METHOD_ALLOCATE, CLASS_REQUEST),
            |setters| {
                setters.push(Box::new(RequestedTransport {
                    protocol: PROTO_UDP,
                }));
            },
        ) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("failed to build authenticated allocate: {err}");
                return;
            }
        };
        self.perform_to(
            msg,
            server_index,
            Purpose::Allocate {
                server_index,
                retried_nonce,
            },
            now,
        );
    }

    fn handle_allocate_attempt_response(&mut self, res: Message, server_index: usize, now: Instant) {
        if res.typ.class == CLASS_SUCCESS_RESPONSE {
            // server without authentication
            self.complete_allocation(&res, server_index, now);
            return;
        }

        match error_code(&res) {
            Some(code) if code == CODE_UNAUTHORIZED.0 || code == CODE_STALE_NONCE.0 => {
                if let (Ok(realm), Ok(nonce)) = (
                    TextAttribute::get_from_as(&res, ATTR_REALM),
                    TextAttribute::get_from_as(&res, ATTR_NONCE),
                ) {
                    self.realm = realm.text;
                    self.nonce = nonce.text;
                    self.start_authenticated_allocate(server_index, false, now);
                } else {
                    warn!("401 without realm/nonce, failing server");
                    self.server_failed(server_index);
                }
            }
            code => {
                debug!("allocate attempt rejected ({code:?})");
                self.server_failed(server_index);
            }
        }
    }

    fn handle_allocate_response(
        &mut self,
        res: Message,
        server_index: usize,
        retried_nonce: bool,
        now: Instant,
    ) {
        if res.typ.class == CLASS_SUCCESS_RESPONSE {
            self.complete_allocation(&res, server_index, now);
            return;
        }

        match error_code(&res) {
            Some(code) if code == CODE_STALE_NONCE.0 && !retried_nonce => {
                self.update_nonce(&res);
                self.start_authenticated_allocate(server_index, true, now);
            }
            Some(code) if code == CODE_UNAUTHORIZED.0 => {
                // the server saw our credentials and still said 401
                debug!("credentials rejected by {}", self.servers[server_index].addr);
                self.server_failed(server_index);
            }
            code => {
                debug!("authenticated allocate rejected ({code:?})");
                self.server_failed(server_index);
            }
        }
    }

    fn complete_allocation(&mut self, res: &Message, server_index: usize, now: Instant) {
        let mut relayed = RelayedAddress::default();
        if let Err(err) = relayed.get_from(res) {
            warn!("allocate response without relayed address: {err}");
            self.server_failed(server_index);
            return;
        }

        let mut reflected = XorMappedAddress::default();
        let reflected_addr = reflected
            .get_from(res)
            .ok()
            .map(|_| SocketAddr::new(reflected.ip, reflected.port));

        let mut lifetime = Lifetime(DEFAULT_LIFETIME);
        let _ = lifetime.get_from(res);

        self.relayed_addr = Some(relayed.into());
        self.reflected_addr = reflected_addr;
        self.lifetime = lifetime.0;
        self.active = Some(server_index);
        self.next_activation = None;

        // the race is over: drop every other pending server
        let mut to_cancel = vec![];
        for (index, server) in self.servers.iter_mut().enumerate() {
            if index == server_index {
                continue;
            }
            if server.protocol == TransportProtocol::Tcp
                && (server.connected || server.awaiting_connect)
            {
                to_cancel.push(server.addr);
            }
            server.failed = true;
        }
        // allocate requesters of the losing servers are cancelled wholesale;
        // the winner has no other transaction outstanding yet
        self.requests.clear();
        for addr in to_cancel {
            self.events.push_back(Event::TcpCloseRequired { server: addr });
        }

        self.state = ClientState::Ready;
        self.schedule_refresh(now);

        debug!(
            "allocation ready: relayed {:?} reflected {:?} lifetime {:?}",
            self.relayed_addr, self.reflected_addr, self.lifetime
        );
        self.events.push_back(Event::Ready {
            relayed_addr: relayed.into(),
            reflected_addr,
        });
    }

    fn schedule_refresh(&mut self, now: Instant) {
        let lifetime = self.lifetime;
        let base = std::cmp::max(
            lifetime.saturating_sub(Duration::from_secs(60)),
            std::cmp::max(lifetime / 2, MIN_REFRESH_INTERVAL),
        );
        self.refresh_at = Some(now + base);
    }

    fn send_refresh(&mut self, lifetime: Duration, now: Instant) {
        let msg = match self.build_authenticated(
            MessageType::new(METHOD_REFRESH, CLASS_REQUEST),
            |setters| {
                setters.push(Box::new(Lifetime(lifetime)));
            },
        ) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("failed to build refresh request: {err}");
                return;
            }
        };
        self.refresh_tx = Some(msg.transaction_id);
        self.perform(msg, Purpose::Refresh { retried_nonce: false }, now);
    }

    fn handle_refresh_response(&mut self, res: Message, retried_nonce: bool, now: Instant) {
        self.refresh_tx = None;

        if res.typ.class == CLASS_ERROR_RESPONSE {
            let code = error_code(&res);
            if code == Some(CODE_STALE_NONCE.0) && !retried_nonce {
                self.update_nonce(&res);
                let msg = match self.build_authenticated(
                    MessageType::new(METHOD_REFRESH, CLASS_REQUEST),
                    |setters| {
                        setters.push(Box::new(Lifetime(self.lifetime)));
                    },
                ) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!("failed to rebuild refresh request: {err}");
                        return;
                    }
                };
                self.refresh_tx = Some(msg.transaction_id);
                self.perform(msg, Purpose::Refresh { retried_nonce: true }, now);
            } else {
                warn!("allocation refresh rejected");
                self.shutdown_with(Error::ErrRefreshTimeout);
            }
            return;
        }

        let mut lifetime = Lifetime(self.lifetime);
        let _ = lifetime.get_from(&res);
        self.lifetime = lifetime.0;
        trace!("allocation refreshed, lifetime {:?}", self.lifetime);
        self.schedule_refresh(now);
    }

    fn handle_dealloc_response(&mut self) {
        self.dealloc_tx = None;
        self.finish_shutdown();
    }

    //-------------------------------------------------------------------
    // message building / transaction plumbing
    //-------------------------------------------------------------------

    fn build_authenticated(
        &self,
        typ: MessageType,
        extra: impl FnOnce(&mut Vec<Box<dyn Setter>>),
    ) -> Result<Message> {
        let mut setters: Vec<Box<dyn Setter>> = vec![
            Box::new(TransactionId::new()),
            Box::new(typ),
        ];
        extra(&mut setters);
        setters.push(Box::new(TextAttribute::new(
            ATTR_USERNAME,
            self.config.username.clone(),
        )));
        setters.push(Box::new(TextAttribute::new(
            ATTR_REALM,
            self.realm.clone(),
        )));
        setters.push(Box::new(TextAttribute::new(
            ATTR_NONCE,
            self.nonce.clone(),
        )));
        setters.push(Box::new(MessageIntegrity::new_long_term_integrity(
            self.config.username.clone(),
            self.realm.clone(),
            self.config.password.clone(),
        )));
        setters.push(Box::new(FINGERPRINT));

        let mut msg = Message::new();
        msg.build(&setters).map_err(stun_err)?;
        Ok(msg)
    }

    /// Starts a transaction towards the active server.
    fn perform(&mut self, msg: Message, purpose: Purpose, now: Instant) {
        if let Some(index) = self.active {
            self.perform_to(msg, index, purpose, now);
        }
    }

    fn perform_to(&mut self, msg: Message, server_index: usize, purpose: Purpose, now: Instant) {
        let server = &self.servers[server_index];
        let profile = if server.is_udp() {
            RetransmitProfile::Udp
        } else {
            RetransmitProfile::Tcp
        };

        let requester = Requester::new(
            RequesterConfig {
                transaction_id: msg.transaction_id,
                purpose,
                raw: BytesMut::from(&msg.raw[..]),
                local_addr: self.config.local_addr,
                peer_addr: server.addr,
                protocol: server.protocol,
                profile,
            },
            now,
        );
        self.last_sent_to_server = now;
        if let Err(err) = self.requests.send(requester) {
            warn!("failed to start transaction: {err}");
        }
    }

    fn update_nonce(&mut self, res: &Message) {
        match TextAttribute::get_from_as(res, ATTR_NONCE) {
            Ok(nonce) => {
                self.nonce = nonce.text;
                debug!("stale nonce, picked up the replacement");
            }
            Err(_) => warn!("stale nonce answer carried no nonce"),
        }
    }

    fn server_failed(&mut self, server_index: usize) {
        self.servers[server_index].failed = true;

        if self.state != ClientState::Pending {
            return;
        }
        if self.servers.iter().all(|server| server.failed) {
            self.shutdown_with(Error::ErrFailedToConnectToAnyServer);
        }
    }

    //-------------------------------------------------------------------
    // inbound
    //-------------------------------------------------------------------

    /// Classifies raw bytes from one of our sockets. UDP datagrams carry a
    /// whole message; TCP segments run through the per-server read buffer.
    pub fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        match msg.transport.protocol {
            TransportProtocol::Udp => self.handle_udp(&msg.message, msg.transport.peer_addr),
            TransportProtocol::Tcp => self.handle_tcp(&msg.message, msg.transport.peer_addr),
        }
    }

    fn handle_udp(&mut self, data: &[u8], from: SocketAddr) -> Result<()> {
        if is_message(data) {
            let mut msg = Message::new();
            msg.raw = data.to_vec();
            msg.decode().map_err(stun_err)?;
            self.handle_stun(msg, from)
        } else if ChannelData::is_channel_data(data) {
            self.handle_channel_data(data)
        } else {
            trace!("non-STUN/TURN datagram from {from}, unhandled");
            Ok(())
        }
    }

    fn handle_tcp(&mut self, data: &[u8], from: SocketAddr) -> Result<()> {
        let server_index = match self
            .servers
            .iter()
            .position(|server| server.addr == from && !server.is_udp())
        {
            Some(index) => index,
            None => {
                trace!("TCP bytes from unknown server {from}");
                return Ok(());
            }
        };

        if self.servers[server_index].read_buffer.len() + data.len() > READ_BUFFER_LIMIT {
            self.shutdown_with(Error::ErrBogusDataOnSocketReceived);
            return Err(Error::ErrBogusDataOnSocketReceived);
        }
        self.servers[server_index].read_buffer.extend_from_slice(data);

        loop {
            let peek = peek_frame(
                &self.servers[server_index].read_buffer,
                self.config.channel_range,
            );
            match peek {
                FramePeek::Insufficient => break,
                FramePeek::Stun { total } => {
                    // STUN keeps references into the buffer, so give the
                    // message its own copy before consuming
                    let frame = self.servers[server_index]
                        .read_buffer
                        .split_to(total);
                    let mut msg = Message::new();
                    msg.raw = frame.to_vec();
                    match msg.decode() {
                        Ok(()) => self.handle_stun(msg, from)?,
                        Err(err) => warn!("undecodable STUN frame on TCP: {err}"),
                    }
                }
                FramePeek::ChannelData { total, message } => {
                    let frame = self.servers[server_index]
                        .read_buffer
                        .split_to(total);
                    self.handle_channel_data(&frame[..message])?;
                }
                FramePeek::Bogus => {
                    self.shutdown_with(Error::ErrBogusDataOnSocketReceived);
                    return Err(Error::ErrBogusDataOnSocketReceived);
                }
            }
        }
        Ok(())
    }

    /// Routes one decoded STUN message belonging to this client.
    pub fn handle_stun(&mut self, msg: Message, from: SocketAddr) -> Result<()> {
        if msg.typ.class == CLASS_INDICATION {
            if msg.typ.method == METHOD_DATA {
                let mut peer_addr = PeerAddress::default();
                peer_addr.get_from(&msg).map_err(stun_err)?;

                let mut data = Data::default();
                data.get_from(&msg).map_err(stun_err)?;

                trace!("data indication from {peer_addr}");
                self.events.push_back(Event::DataReceived {
                    peer: peer_addr.into(),
                    data: BytesMut::from(&data.0[..]),
                });
            }
            return Ok(());
        }

        if msg.typ.class == CLASS_REQUEST {
            warn!("unexpected STUN request from {from}");
            return Ok(());
        }

        let requester = match self.requests.handle_response(&msg.transaction_id, from) {
            Some(requester) => requester,
            None => {
                debug!("no transaction for {:?}", msg.transaction_id);
                return Ok(());
            }
        };

        let now = Instant::now();
        match requester.purpose {
            Purpose::AllocateAttempt { server_index } => {
                self.handle_allocate_attempt_response(msg, server_index, now);
            }
            Purpose::Allocate {
                server_index,
                retried_nonce,
            } => {
                self.handle_allocate_response(msg, server_index, retried_nonce, now);
            }
            Purpose::Refresh { retried_nonce } => {
                self.handle_refresh_response(msg, retried_nonce, now);
            }
            Purpose::Dealloc => self.handle_dealloc_response(),
            Purpose::CreatePermission {
                peers,
                retried_nonce,
            } => {
                self.handle_permission_response(msg, peers, retried_nonce, now);
            }
            Purpose::ChannelBind {
                peer,
                number,
                retried_nonce,
            } => {
                self.handle_channel_bind_response(msg, peer, number, retried_nonce, now);
            }
        }
        Ok(())
    }

    fn handle_channel_bind_response(
        &mut self,
        res: Message,
        peer: SocketAddr,
        number: u16,
        retried_nonce: bool,
        now: Instant,
    ) {
        if res.typ.class == CLASS_ERROR_RESPONSE {
            let code = error_code(&res);
            if code == Some(CODE_STALE_NONCE.0) && !retried_nonce {
                self.update_nonce(&res);
                self.send_channel_bind(peer, number, true, now);
            } else {
                warn!("channel bind for {peer} rejected, falling back to indications");
                self.channels.remove(&peer.ip());
            }
            return;
        }

        if let Some(channel) = self.channels.get_mut(&peer.ip()) {
            channel.bound = true;
            channel.bind_tx = None;
            channel.refreshed_at = now;
            debug!("channel 0x{number:04x} bound to {peer}");
        }
    }

    /// Decodes one CHANNEL-DATA message and surfaces the payload with the
    /// peer the channel is bound to.
    pub fn handle_channel_data(&mut self, data: &[u8]) -> Result<()> {
        let mut ch_data = ChannelData {
            raw: data.to_vec(),
            ..Default::default()
        };
        ch_data.decode()?;

        let peer = self
            .channels
            .peer_by_number(ch_data.number.0)
            .ok_or(Error::ErrChannelBindNotFound)?;

        trace!("channel data from {peer} (ch={})", ch_data.number);
        self.events.push_back(Event::DataReceived {
            peer,
            data: BytesMut::from(&ch_data.data[..]),
        });
        Ok(())
    }

    //-------------------------------------------------------------------
    // TCP link lifecycle (driven by the owner)
    //-------------------------------------------------------------------

    pub fn on_tcp_connected(&mut self, server: SocketAddr) {
        let now = Instant::now();
        if let Some(index) = self
            .servers
            .iter()
            .position(|entry| entry.addr == server && !entry.is_udp())
        {
            self.servers[index].connected = true;
            self.servers[index].awaiting_connect = false;
            if self.state == ClientState::Pending && !self.servers[index].tried {
                self.start_allocate_attempt(index, now);
            }
        }
    }

    pub fn on_tcp_closed(&mut self, server: SocketAddr) {
        if self.is_active_server(server) {
            self.shutdown_with(Error::ErrUnexpectedSocketFailure);
            return;
        }
        if let Some(index) = self
            .servers
            .iter()
            .position(|entry| entry.addr == server && !entry.is_udp())
        {
            self.servers[index].connected = false;
            self.servers[index].awaiting_connect = false;
            self.server_failed(index);
        }
    }

    //-------------------------------------------------------------------
    // timers
    //-------------------------------------------------------------------

    pub fn poll_timeout(&self) -> Option<Instant> {
        let mut earliest = self.requests.poll_timeout();

        let mut consider = |candidate: Option<Instant>| {
            if let Some(time) = candidate {
                earliest = Some(match earliest {
                    Some(existing) if existing <= time => existing,
                    _ => time,
                });
            }
        };

        consider(self.next_activation);
        if self.state == ClientState::Ready {
            consider(self.refresh_at);
            // keep the NAT binding warm when nothing else talks to the server
            consider(Some(self.last_sent_to_server + SERVER_KEEPALIVE_WINDOW));
            consider(self.permission_refresh_at);
            for (_, deadline) in self.channels_deadlines() {
                consider(Some(deadline));
            }
        }
        earliest
    }

    fn channels_deadlines(&self) -> Vec<(IpAddr, Instant)> {
        let mut deadlines = vec![];
        for ip in self.channels.ips() {
            if let Some(channel) = self.channels.get(&ip) {
                let idle_at = channel.last_sent_at + CHANNEL_IDLE_TIMEOUT;
                let rebind_at = channel.refreshed_at + CHANNEL_REFRESH_INTERVAL;
                deadlines.push((ip, std::cmp::min(idle_at, rebind_at)));
            }
        }
        deadlines
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        self.requests.handle_timeout(now);
        while let Some(event) = self.requests.poll_event() {
            let RequesterEvent::Timeout { purpose, .. } = event;
            self.handle_transaction_timeout(purpose);
        }

        if self.state == ClientState::Pending {
            self.run_activation(now);
        }

        if self.state == ClientState::Ready {
            let refresh_due = self.refresh_at.map(|at| at <= now).unwrap_or(false);
            let keepalive_due =
                now.duration_since(self.last_sent_to_server) >= SERVER_KEEPALIVE_WINDOW;
            if (refresh_due || keepalive_due) && self.refresh_tx.is_none() {
                let lifetime = self.lifetime;
                self.send_refresh(lifetime, now);
            }

            if self
                .permission_refresh_at
                .map(|at| at <= now)
                .unwrap_or(false)
                && self.permission_tx.is_none()
            {
                self.request_permissions_now(now);
            }

            self.sweep_channels(now);
        }
    }

    fn run_activation(&mut self, now: Instant) {
        let due: Vec<usize> = self
            .servers
            .iter()
            .enumerate()
            .filter(|(_, server)| {
                !server.tried && !server.failed && server.activate_after <= now
            })
            .map(|(index, _)| index)
            .collect();

        for index in due {
            if self.servers[index].is_udp() {
                self.start_allocate_attempt(index, now);
            } else if !self.servers[index].connected && !self.servers[index].awaiting_connect {
                self.servers[index].awaiting_connect = true;
                self.events.push_back(Event::TcpConnectRequired {
                    server: self.servers[index].addr,
                });
            }
        }

        let any_waiting = self
            .servers
            .iter()
            .any(|server| !server.tried && !server.failed);
        self.next_activation = any_waiting.then(|| now + ACTIVATION_TICK);
    }

    fn sweep_channels(&mut self, now: Instant) {
        let mut idle = vec![];
        let mut rebind = vec![];
        for (ip, channel) in self.channels.iter_mut() {
            if now.duration_since(channel.last_sent_at) >= CHANNEL_IDLE_TIMEOUT {
                idle.push(*ip);
            } else if now.duration_since(channel.refreshed_at) >= CHANNEL_REFRESH_INTERVAL
                && channel.bind_tx.is_none()
            {
                rebind.push((channel.peer, channel.number));
                channel.refreshed_at = now;
            }
        }

        for ip in idle {
            debug!("tearing down idle channel binding to {ip}");
            self.channels.remove(&ip);
        }
        for (peer, number) in rebind {
            self.send_channel_bind(peer, number, false, now);
        }
    }

    fn handle_transaction_timeout(&mut self, purpose: Purpose) {
        match purpose {
            Purpose::AllocateAttempt { server_index } | Purpose::Allocate { server_index, .. } => {
                debug!("no answer from {}", self.servers[server_index].addr);
                self.server_failed(server_index);
            }
            Purpose::Refresh { .. } => {
                self.refresh_tx = None;
                self.shutdown_with(Error::ErrRefreshTimeout);
            }
            Purpose::Dealloc => {
                self.dealloc_tx = None;
                self.finish_shutdown();
            }
            Purpose::CreatePermission { .. } => {
                // the four-minute cadence retries on its own
                self.permission_tx = None;
            }
            Purpose::ChannelBind { peer, .. } => {
                warn!("channel bind to {peer} timed out");
                self.channels.remove(&peer.ip());
            }
        }
    }

    //-------------------------------------------------------------------
    // shutdown
    //-------------------------------------------------------------------

    /// Graceful teardown: a zero-lifetime refresh is sent and awaited when
    /// an allocation exists.
    pub fn shutdown(&mut self) {
        match self.state {
            ClientState::Shutdown | ClientState::ShuttingDown => {}
            ClientState::Pending => {
                self.last_error = Some(Error::ErrUserRequestedShutdown);
                self.finish_shutdown();
            }
            ClientState::Ready => {
                self.state = ClientState::ShuttingDown;
                self.last_error = Some(Error::ErrUserRequestedShutdown);
                self.refresh_at = None;
                self.permission_refresh_at = None;
                if let Some(transaction_id) = self.permission_tx.take() {
                    self.requests.cancel(&transaction_id);
                }
                if let Some(transaction_id) = self.refresh_tx.take() {
                    self.requests.cancel(&transaction_id);
                }

                let now = Instant::now();
                let msg = match self.build_authenticated(
                    MessageType::new(METHOD_REFRESH, CLASS_REQUEST),
                    |setters| {
                        setters.push(Box::new(Lifetime(Duration::from_secs(0))));
                    },
                ) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!("failed to build dealloc request: {err}");
                        self.finish_shutdown();
                        return;
                    }
                };
                self.dealloc_tx = Some(msg.transaction_id);
                self.perform(msg, Purpose::Dealloc, now);
            }
        }
    }

    fn shutdown_with(&mut self, error: Error) {
        if self.state == ClientState::Shutdown {
            return;
        }
        self.last_error = Some(error);
        self.finish_shutdown();
    }

    fn finish_shutdown(&mut self) {
        if self.state == ClientState::Shutdown {
            return;
        }
        self.state = ClientState::Shutdown;
        self.requests.clear();
        self.permissions.clear();
        self.channels.clear();
        self.next_activation = None;
        self.refresh_at = None;
        self.permission_refresh_at = None;
        self.events.push_back(Event::Closed {
            error: self.last_error.clone(),
        });
    }

    /// Guarantees the allocation outlives `min_validity` by refreshing
    /// ahead of schedule when needed.
    pub fn wakeup(&mut self, min_validity: Duration) {
        if self.state != ClientState::Ready || self.refresh_tx.is_some() {
            return;
        }
        let now = Instant::now();
        if self
            .refresh_at
            .map(|at| at <= now + min_validity)
            .unwrap_or(false)
        {
            let lifetime = self.lifetime;
            self.send_refresh(lifetime, now);
        }
    }

    //-------------------------------------------------------------------
    // poll surface
    //-------------------------------------------------------------------

    pub fn poll_transmit(&mut self) -> Option<TaggedBytesMut> {
        while let Some(transmit) = self.requests.poll_transmit() {
            self.transmits.push_back(transmit);
        }
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }
}

fn error_code(res: &Message) -> Option<u16> {
    let mut code = ErrorCodeAttribute::default();
    code.get_from(res).ok().map(|_| code.code.0)
}
