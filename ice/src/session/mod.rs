#[cfg(test)]
mod session_test;

use bytes::BytesMut;
use log::{debug, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use stun::attributes::{ATTR_MESSAGE_INTEGRITY, ATTR_USERNAME};
use stun::error_code::{ErrorCodeAttribute, CODE_ROLE_CONFLICT, CODE_UNAUTHORIZED};
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::agent::TransactionId;
use stun::message::{
    Getter, Message, MessageType, Setter, BINDING_REQUEST, BINDING_SUCCESS,
    CLASS_ERROR_RESPONSE, CLASS_INDICATION, CLASS_REQUEST, CLASS_SUCCESS_RESPONSE,
    METHOD_BINDING,
};
use stun::textattrs::TextAttribute;
use stun::xoraddr::XorMappedAddress;

use requester::{Requester, RequesterConfig, RequesterEvent, RequesterMap, RetransmitProfile};
use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportContext, TransportProtocol};

use crate::attributes::{AttrControlled, AttrControlling, PriorityAttr, UseCandidateAttr};
use crate::candidate::candidate_pair::{sort_pairs, CandidatePair, MAX_CANDIDATE_PAIRS};
use crate::candidate::{Candidate, CandidateType};

/// One new pair is probed per activation tick.
const ACTIVATION_INTERVAL: Duration = Duration::from_millis(20);
/// Keep-alive indications default to this cadence once nominated.
const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// The two asymmetric ICE roles. The controlling side nominates.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IceRole {
    Controlling,
    Controlled,
}

impl IceRole {
    fn flipped(self) -> Self {
        match self {
            IceRole::Controlling => IceRole::Controlled,
            IceRole::Controlled => IceRole::Controlling,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No remote candidates yet.
    Pending,
    /// Remote candidates known, no runnable pairs.
    Prepared,
    /// Pairs are being probed.
    Searching,
    /// Every pair failed; waiting for more remote candidates.
    Halted,
    /// USE-CANDIDATE sent, awaiting its success.
    Nominating,
    /// A pair is active; keep-alives in effect.
    Nominated,
    Shutdown,
}

/// Liveness and keep-alive knobs; may be adjusted while the session runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// Send a Binding indication when nothing went out for this long.
    pub keep_alive_interval: Option<Duration>,
    /// Probe with an authenticated Binding request when nothing came in for
    /// this long; a probe timeout evicts the nomination.
    pub expecting_data_within: Option<Duration>,
    /// Budget of the liveness probe (requester profile decides when unset).
    pub keep_alive_probe_timeout: Option<Duration>,
    /// Close the session outright when nothing at all happened for this long.
    pub backgrounding_timeout: Option<Duration>,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Some(DEFAULT_KEEP_ALIVE_INTERVAL),
            expecting_data_within: None,
            keep_alive_probe_timeout: None,
            backgrounding_timeout: None,
        }
    }
}

pub struct SessionConfig {
    pub role: IceRole,
    pub local_ufrag: String,
    pub local_pwd: String,
    pub remote_ufrag: String,
    /// May be empty: pairs are then probed with plain STUN bindings.
    pub remote_pwd: String,
    pub keep_alive: KeepAliveConfig,
}

#[derive(Debug)]
pub enum SessionEvent {
    StateChange(SessionState),
    /// The nominated pair changed; `None` when the nomination was evicted.
    NominatedPairChanged(Option<(Candidate, Candidate)>),
    /// The session can carry user data again.
    WriteReady,
    /// Opaque user data arrived on a known pair.
    PacketReceived { peer: SocketAddr, data: BytesMut },
    /// A STUN message with a non-Binding method arrived on a known pair;
    /// layered protocols consume these.
    StunReceived { peer: SocketAddr, message: Message },
    Closed { error: Option<Error> },
}

/// What an outstanding Binding transaction was probing.
#[derive(Debug, Copy, Clone)]
enum CheckKind {
    Check { pair: usize },
    Nominate { pair: usize },
    Liveness,
}

/// Per-(foundation, remote IP) progress a foundation session exports so
/// derived sessions can order their frozen checks.
#[derive(Debug, Default, Copy, Clone)]
pub struct PairProgress {
    pub succeeded: bool,
    pub failed: bool,
}

pub type FoundationProgress = HashMap<(String, IpAddr), PairProgress>;

/// Per-peer connectivity-check state machine.
pub struct IceSession {
    role: IceRole,
    tie_breaker: u64,

    local_ufrag: String,
    local_pwd: String,
    remote_ufrag: String,
    remote_pwd: String,

    local_candidates: Vec<Candidate>,
    remote_candidates: Vec<Candidate>,
    pairs: Vec<CandidatePair>,
    nominated: Option<usize>,
    pending_nomination: Option<usize>,
    previously_nominated: bool,
    end_of_remote_candidates: bool,

    state: SessionState,
    keep_alive: KeepAliveConfig,

    requests: RequesterMap<CheckKind>,
    liveness_tx: Option<TransactionId>,
    next_activation: Option<Instant>,

    last_sent: Instant,
    last_received: Instant,
    informed_write_ready: bool,

    /// Routes the owning socket must register: (via local addr, remote addr).
    pending_routes: Vec<(SocketAddr, SocketAddr)>,

    transmits: VecDeque<TaggedBytesMut>,
    events: VecDeque<SessionEvent>,
}

fn stun_err(err: stun::Error) -> Error {
    Error::Other(err.to_string())
}

impl IceSession {
    pub fn new(config: SessionConfig) -> Result<Self> {
        if config.local_ufrag.len() * 8 < 24 {
            return Err(Error::ErrLocalUfragInsufficientBits);
        }
        if config.local_pwd.len() * 8 < 128 {
            return Err(Error::ErrLocalPwdInsufficientBits);
        }

        let now = Instant::now();
        Ok(Self {
            role: config.role,
            tie_breaker: rand::random::<u64>(),
            local_ufrag: config.local_ufrag,
            local_pwd: config.local_pwd,
            remote_ufrag: config.remote_ufrag,
            remote_pwd: config.remote_pwd,
            local_candidates: vec![],
            remote_candidates: vec![],
            pairs: vec![],
            nominated: None,
            pending_nomination: None,
            previously_nominated: false,
            end_of_remote_candidates: false,
            state: SessionState::Pending,
            keep_alive: config.keep_alive,
            requests: RequesterMap::new(),
            liveness_tx: None,
            next_activation: None,
            last_sent: now,
            last_received: now,
            informed_write_ready: false,
            pending_routes: vec![],
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> IceRole {
        self.role
    }

    pub fn remote_ufrag(&self) -> &str {
        &self.remote_ufrag
    }

    pub fn set_keep_alive(&mut self, keep_alive: KeepAliveConfig) {
        debug!("adjusting keep alive properties");
        self.keep_alive = keep_alive;
    }

    /// Nominated (local, remote) candidates, if any.
    pub fn nominated_pair(&self) -> Option<(&Candidate, &Candidate)> {
        let pair = &self.pairs[self.nominated?];
        Some((
            &self.local_candidates[pair.local],
            &self.remote_candidates[pair.remote],
        ))
    }

    #[cfg(test)]
    pub(crate) fn set_tie_breaker(&mut self, tie_breaker: u64) {
        self.tie_breaker = tie_breaker;
    }

    //-------------------------------------------------------------------
    // candidate bookkeeping
    //-------------------------------------------------------------------

    /// Called by the owning socket whenever its gathered set changes.
    pub fn update_local_candidates(&mut self, candidates: &[Candidate]) {
        let previous = self.snapshot_progress();
        self.local_candidates = candidates.to_vec();
        self.rebuild_pairs(previous);
    }

    pub fn add_remote_candidate(&mut self, candidate: Candidate) {
        if self
            .remote_candidates
            .iter()
            .any(|existing| existing.equal(&candidate))
        {
            return;
        }
        let previous = self.snapshot_progress();
        self.remote_candidates.push(candidate);
        self.rebuild_pairs(previous);
    }

    /// Pair progress keyed by addresses, surviving index reshuffles.
    fn snapshot_progress(&self) -> HashMap<(SocketAddr, SocketAddr), CandidatePair> {
        self.pairs
            .iter()
            .map(|pair| {
                (
                    (
                        self.local_candidates[pair.local].addr,
                        self.remote_candidates[pair.remote].addr,
                    ),
                    *pair,
                )
            })
            .collect()
    }

    /// The peer signalled that no further candidates will arrive.
    pub fn end_of_remote_candidates(&mut self) {
        self.end_of_remote_candidates = true;
        self.evaluate_failure();
    }

    /// Rebuilds the pair list: local server-reflexive candidates cannot
    /// send and are pruned, each (local IP, remote IP) keeps only its
    /// highest-priority local candidate, and the list is capped.
    fn rebuild_pairs(&mut self, previous: HashMap<(SocketAddr, SocketAddr), CandidatePair>) {
        // outstanding checks reference pair indices; drop them
        self.requests.clear();
        self.liveness_tx = None;
        self.pairs.clear();

        let controlling = self.role == IceRole::Controlling;

        let mut pairs = vec![];
        for (local_index, local) in self.local_candidates.iter().enumerate() {
            if local.candidate_type == CandidateType::ServerReflexive {
                continue;
            }
            for (remote_index, remote) in self.remote_candidates.iter().enumerate() {
                pairs.push(CandidatePair::new(
                    local_index,
                    remote_index,
                    local.priority(),
                    remote.priority(),
                    controlling,
                ));
            }
        }

        sort_pairs(&mut pairs);

        let mut seen = std::collections::HashSet::new();
        pairs.retain(|pair| {
            let key = (
                self.local_candidates[pair.local].addr.ip(),
                self.remote_candidates[pair.remote].addr.ip(),
            );
            seen.insert(key)
        });
        pairs.truncate(MAX_CANDIDATE_PAIRS);

        // carry probing progress over for pairs that survived the rebuild
        for pair in pairs.iter_mut() {
            let key = (
                self.local_candidates[pair.local].addr,
                self.remote_candidates[pair.remote].addr,
            );
            if let Some(old) = previous.get(&key) {
                pair.received_request = old.received_request;
                pair.received_response = old.received_response;
                pair.failed = old.failed;
                pair.nominated = old.nominated;
            }
        }
        self.nominated = pairs.iter().position(|pair| pair.nominated);
        self.pairs = pairs;

        match self.state {
            SessionState::Pending | SessionState::Prepared | SessionState::Halted => {
                if !self.pairs.is_empty() {
                    self.set_state(SessionState::Searching);
                    self.arm_activation();
                } else if !self.remote_candidates.is_empty() || !self.local_candidates.is_empty() {
                    self.set_state(SessionState::Prepared);
                }
            }
            SessionState::Searching | SessionState::Nominating => {
                self.arm_activation();
            }
            _ => {}
        }
    }

    fn arm_activation(&mut self) {
        if self.next_activation.is_none() {
            self.next_activation = Some(Instant::now());
        }
    }

    fn find_pair(&self, via: SocketAddr, from: SocketAddr) -> Option<usize> {
        self.pairs.iter().position(|pair| {
            self.local_candidates[pair.local].addr == via
                && self.remote_candidates[pair.remote].addr == from
        })
    }

    /// Progress this session exports to sessions deriving from it.
    pub fn foundation_progress(&self) -> FoundationProgress {
        let mut progress = FoundationProgress::new();
        for pair in &self.pairs {
            let key = (
                self.local_candidates[pair.local].foundation(),
                self.remote_candidates[pair.remote].addr.ip(),
            );
            let entry = progress.entry(key).or_default();
            entry.succeeded |= pair.succeeded();
            entry.failed |= pair.failed;
        }
        progress
    }

    //-------------------------------------------------------------------
    // outbound data
    //-------------------------------------------------------------------

    /// Sends user data over the nominated pair. `Ok(false)` when no pair is
    /// nominated yet; callers should wait for the write-ready event.
    pub fn send(&mut self, data: &[u8]) -> Result<bool> {
        let pair_index = match self.nominated {
            Some(index) => index,
            None => return Ok(false),
        };
        let pair = self.pairs[pair_index];
        let via = self.local_candidates[pair.local].addr;
        let peer = self.remote_candidates[pair.remote].addr;

        let now = Instant::now();
        self.last_sent = now;
        self.transmits.push_back(TaggedBytesMut {
            now,
            transport: TransportContext {
                local_addr: via,
                peer_addr: peer,
                protocol: TransportProtocol::Udp,
            },
            message: BytesMut::from(data),
        });
        Ok(true)
    }

    //-------------------------------------------------------------------
    // connectivity checks
    //-------------------------------------------------------------------

    fn build_check(&self, pair: &CandidatePair, nominate: bool) -> Result<Message> {
        let mut setters: Vec<Box<dyn Setter>> = vec![
            Box::new(BINDING_REQUEST),
            Box::new(TransactionId::new()),
        ];

        if self.remote_pwd.is_empty() {
            // no credentials yet: plain STUN binding probes the path
            setters.push(Box::new(FINGERPRINT));
        } else {
            let username = format!("{}:{}", self.remote_ufrag, self.local_ufrag);
            setters.push(Box::new(TextAttribute::new(ATTR_USERNAME, username)));
            if nominate {
                setters.push(Box::new(UseCandidateAttr::new()));
            }
            match self.role {
                IceRole::Controlling => {
                    setters.push(Box::new(AttrControlling(self.tie_breaker)))
                }
                IceRole::Controlled => setters.push(Box::new(AttrControlled(self.tie_breaker))),
            }
            setters.push(Box::new(PriorityAttr(pair.local_priority)));
            setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
                self.remote_pwd.clone(),
            )));
            setters.push(Box::new(FINGERPRINT));
        }

        let mut msg = Message::new();
        msg.build(&setters).map_err(stun_err)?;
        Ok(msg)
    }

    fn start_check(&mut self, pair_index: usize, nominate: bool, now: Instant) {
        let pair = self.pairs[pair_index];
        let msg = match self.build_check(&pair, nominate) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("failed to build connectivity check: {err}");
                return;
            }
        };

        let kind = if nominate {
            CheckKind::Nominate { pair: pair_index }
        } else {
            CheckKind::Check { pair: pair_index }
        };

        let requester = Requester::new(
            RequesterConfig {
                transaction_id: msg.transaction_id,
                purpose: kind,
                raw: BytesMut::from(&msg.raw[..]),
                local_addr: self.local_candidates[pair.local].addr,
                peer_addr: self.remote_candidates[pair.remote].addr,
                protocol: TransportProtocol::Udp,
                profile: RetransmitProfile::IceCheck,
            },
            now,
        );

        self.pairs[pair_index].in_flight = Some(msg.transaction_id);
        self.last_sent = now;
        if let Err(err) = self.requests.send(requester) {
            warn!("failed to start connectivity check: {err}");
        }
    }

    /// One pass of the activation timer: probe the best runnable pair.
    fn activate_one(&mut self, foundation: Option<&FoundationProgress>, now: Instant) {
        let mut chosen = None;
        for (index, pair) in self.pairs.iter().enumerate() {
            if pair.nominated
                || pair.failed
                || pair.received_response
                || pair.in_flight.is_some()
            {
                continue;
            }
            if let Some(progress) = foundation {
                let key = (
                    self.local_candidates[pair.local].foundation(),
                    self.remote_candidates[pair.remote].addr.ip(),
                );
                if let Some(entry) = progress.get(&key) {
                    if entry.failed {
                        // the foundation pair failed; this one will too
                        chosen = Some((index, true));
                        break;
                    }
                    if !entry.succeeded {
                        // still frozen
                        continue;
                    }
                }
            }
            chosen = Some((index, false));
            break;
        }

        match chosen {
            Some((index, true)) => {
                self.pairs[index].failed = true;
                self.evaluate_failure();
            }
            Some((index, false)) => {
                trace!("activating pair {}", self.pairs[index]);
                self.start_check(index, false, now);
            }
            None => {}
        }
    }

    //-------------------------------------------------------------------
    // inbound STUN
    //-------------------------------------------------------------------

    /// Handles a STUN message that arrived on `(via, from)`.
    pub fn handle_stun(&mut self, msg: &mut Message, via: SocketAddr, from: SocketAddr) {
        if self.state == SessionState::Shutdown {
            return;
        }
        if msg.typ.method != METHOD_BINDING {
            // not connectivity checking; hand it up to whatever protocol
            // runs over this session
            trace!("forwarding STUN method {} from {from}", msg.typ.method);
            self.note_activity(via, from);
            self.events.push_back(SessionEvent::StunReceived {
                peer: from,
                message: msg.clone(),
            });
            return;
        }

        if msg.typ.class == CLASS_REQUEST {
            self.handle_binding_request(msg, via, from);
        } else if msg.typ.class == CLASS_SUCCESS_RESPONSE || msg.typ.class == CLASS_ERROR_RESPONSE
        {
            self.handle_binding_response(msg, via, from);
        } else if msg.typ.class == CLASS_INDICATION {
            // keep-alive from the peer
            self.note_activity(via, from);
        }
    }

    /// Opaque user data on a known pair.
    pub fn handle_user_packet(&mut self, via: SocketAddr, from: SocketAddr, data: BytesMut) {
        if self.state == SessionState::Shutdown {
            return;
        }
        self.note_activity(via, from);
        self.events
            .push_back(SessionEvent::PacketReceived { peer: from, data });
    }

    fn note_activity(&mut self, via: SocketAddr, from: SocketAddr) {
        self.last_received = Instant::now();
        if let (Some(nominated), Some(pair_index)) = (self.nominated, self.find_pair(via, from)) {
            if nominated == pair_index {
                // the path is alive; any outstanding probe is moot
                if let Some(transaction_id) = self.liveness_tx.take() {
                    self.requests.cancel(&transaction_id);
                }
            }
        }
    }

    fn handle_binding_request(&mut self, msg: &mut Message, via: SocketAddr, from: SocketAddr) {
        // the username must name us; anything else is not ours to answer
        let username = match TextAttribute::get_from_as(msg, ATTR_USERNAME) {
            Ok(username) => Some(username.text),
            Err(_) => None,
        };
        if let Some(username) = &username {
            let mut parts = username.splitn(2, ':');
            let local_part = parts.next().unwrap_or_default();
            if local_part != self.local_ufrag {
                trace!("dropping binding request with foreign username {username}");
                return;
            }
        } else if !self.remote_pwd.is_empty() {
            trace!("dropping anonymous binding request while credentials are set");
            return;
        }

        // integrity before anything else; a failure earns a 401
        let failed_integrity = if msg.contains(ATTR_MESSAGE_INTEGRITY) {
            MessageIntegrity::new_short_term_integrity(self.local_pwd.clone())
                .check(msg)
                .is_err()
        } else {
            !self.remote_pwd.is_empty()
        };

        if failed_integrity {
            debug!("binding request from {from} failed integrity");
            self.send_binding_error(msg, via, from, CODE_UNAUTHORIZED.0, "Unauthorized");
            return;
        }

        // role conflict resolution by tie-breaker
        if self.role == IceRole::Controlling && msg.contains(stun::attributes::ATTR_ICE_CONTROLLING)
        {
            let mut theirs = AttrControlling::default();
            let _ = theirs.get_from(msg);
            if self.tie_breaker >= theirs.0 {
                debug!("role conflict won, peer must switch");
                self.send_binding_error(msg, via, from, CODE_ROLE_CONFLICT.0, "Role Conflict");
                return;
            }
            warn!("role conflict lost, switching to controlled");
            self.switch_role(IceRole::Controlled);
        } else if self.role == IceRole::Controlled
            && msg.contains(stun::attributes::ATTR_ICE_CONTROLLED)
        {
            let mut theirs = AttrControlled::default();
            let _ = theirs.get_from(msg);
            if self.tie_breaker < theirs.0 {
                debug!("role conflict won, peer must switch");
                self.send_binding_error(msg, via, from, CODE_ROLE_CONFLICT.0, "Role Conflict");
                return;
            }
            warn!("role conflict lost, switching to controlling");
            self.switch_role(IceRole::Controlling);
        }

        // an unknown source on a known local candidate is a new
        // peer-reflexive candidate
        let pair_index = match self.find_pair(via, from) {
            Some(index) => Some(index),
            None => {
                if self.local_candidates.iter().any(|local| local.addr == via) {
                    let mut priority = PriorityAttr::default();
                    let _ = priority.get_from(msg);
                    debug!("adding peer-reflexive candidate {from}");
                    self.add_remote_candidate(Candidate::remote(
                        CandidateType::PeerReflexive,
                        from,
                        priority.0,
                    ));
                    self.find_pair(via, from)
                } else {
                    None
                }
            }
        };

        if let Some(index) = pair_index {
            let pair = &mut self.pairs[index];
            pair.received_request = true;
            // a previously failed pair is worth another try now
            pair.failed = false;
            if self.state == SessionState::Halted {
                self.set_state(SessionState::Searching);
                self.arm_activation();
            }
        }

        self.send_binding_success(msg, via, from);
        self.note_activity(via, from);

        let Some(index) = pair_index else {
            return;
        };

        // nomination by the controlling peer
        if UseCandidateAttr::is_set(msg) && self.role == IceRole::Controlled {
            if self.nominated != Some(index) {
                debug!("pair nominated by the controlling peer: {}", self.pairs[index]);
                self.nominate(index, via, from);
            }
        }

        // triggered check in the reverse direction
        if !self.pairs[index].received_response {
            match self.pairs[index].in_flight {
                Some(transaction_id) => {
                    self.requests.retry_now(&transaction_id, Instant::now());
                }
                None => self.start_check(index, false, Instant::now()),
            }
        }
    }

    fn handle_binding_response(&mut self, msg: &mut Message, _via: SocketAddr, from: SocketAddr) {
        // a response that fails integrity is not authoritative; let the
        // transaction time out naturally
        if !self.remote_pwd.is_empty() && msg.contains(ATTR_MESSAGE_INTEGRITY) {
            if MessageIntegrity::new_short_term_integrity(self.remote_pwd.clone())
                .check(msg)
                .is_err()
            {
                warn!("discarding response from {from} failing integrity");
                return;
            }
        } else if !self.remote_pwd.is_empty() && msg.typ.class == CLASS_ERROR_RESPONSE {
            // unauthenticated error responses must not drive role switches
            let code = error_code(msg);
            if code == Some(CODE_ROLE_CONFLICT.0) {
                warn!("ignoring unauthenticated role conflict answer");
                return;
            }
        }

        let requester = match self.requests.handle_response(&msg.transaction_id, from) {
            Some(requester) => requester,
            None => {
                trace!("no transaction for {:?}", msg.transaction_id);
                return;
            }
        };

        self.last_received = Instant::now();

        if msg.typ.class == CLASS_SUCCESS_RESPONSE {
            match requester.purpose {
                CheckKind::Check { pair } => {
                    self.pairs[pair].received_response = true;
                    self.pairs[pair].in_flight = None;
                    self.maybe_nominate(Instant::now());
                }
                CheckKind::Nominate { pair } => {
                    let via = self.local_candidates[self.pairs[pair].local].addr;
                    let peer = self.remote_candidates[self.pairs[pair].remote].addr;
                    self.pairs[pair].received_response = true;
                    self.pairs[pair].in_flight = None;
                    self.pending_nomination = None;
                    self.nominate(pair, via, peer);
                }
                CheckKind::Liveness => {
                    self.liveness_tx = None;
                }
            }
            return;
        }

        let code = error_code(msg);
        if code == Some(CODE_ROLE_CONFLICT.0) {
            warn!("peer reported role conflict, switching role");
            self.switch_role(self.role.flipped());
            return;
        }
        match requester.purpose {
            CheckKind::Check { pair } => {
                self.pairs[pair].failed = true;
                self.pairs[pair].in_flight = None;
                self.evaluate_failure();
            }
            CheckKind::Nominate { pair } => {
                self.pending_nomination = None;
                self.pairs[pair].failed = true;
                self.pairs[pair].in_flight = None;
                if self.state == SessionState::Nominating {
                    self.set_state(SessionState::Searching);
                    self.arm_activation();
                }
                self.evaluate_failure();
            }
            CheckKind::Liveness => {
                self.liveness_tx = None;
            }
        }
    }

    //-------------------------------------------------------------------
    // nomination
    //-------------------------------------------------------------------

    fn maybe_nominate(&mut self, now: Instant) {
        if self.role != IceRole::Controlling
            || self.nominated.is_some()
            || self.pending_nomination.is_some()
        {
            return;
        }

        // highest-priority pair that proved both directions
        let candidate = self
            .pairs
            .iter()
            .position(|pair| pair.succeeded() && !pair.failed);
        if let Some(index) = candidate {
            debug!("nominating {}", self.pairs[index]);
            self.pending_nomination = Some(index);
            self.set_state(SessionState::Nominating);
            self.start_check(index, true, now);
        }
    }

    fn nominate(&mut self, index: usize, via: SocketAddr, peer: SocketAddr) {
        if let Some(previous) = self.nominated {
            if previous == index {
                return;
            }
            self.pairs[previous].nominated = false;
        }
        // cancel any competing nomination attempt
        if let Some(pending) = self.pending_nomination.take() {
            if let Some(transaction_id) = self.pairs[pending].in_flight.take() {
                self.requests.cancel(&transaction_id);
            }
        }

        self.pairs[index].nominated = true;
        self.nominated = Some(index);
        self.previously_nominated = true;
        self.pending_routes.push((via, peer));

        self.set_state(SessionState::Nominated);
        let nominated = self
            .nominated_pair()
            .map(|(local, remote)| (local.clone(), remote.clone()));
        self.events
            .push_back(SessionEvent::NominatedPairChanged(nominated));
        if !self.informed_write_ready {
            self.informed_write_ready = true;
            self.events.push_back(SessionEvent::WriteReady);
        }
    }

    fn evict_nomination(&mut self) {
        if let Some(index) = self.nominated.take() {
            self.pairs[index].nominated = false;
            self.pairs[index].received_response = false;
            self.informed_write_ready = false;
            self.events.push_back(SessionEvent::NominatedPairChanged(None));
            self.set_state(SessionState::Searching);
            self.arm_activation();
        }
    }

    //-------------------------------------------------------------------
    // role handling
    //-------------------------------------------------------------------

    /// Role switches start the search over: all pair progress is cleared.
    fn switch_role(&mut self, role: IceRole) {
        self.role = role;
        self.requests.clear();
        self.liveness_tx = None;
        self.pending_nomination = None;
        self.nominated = None;
        self.informed_write_ready = false;

        let controlling = role == IceRole::Controlling;
        for pair in self.pairs.iter_mut() {
            pair.reset_progress();
            pair.controlling = controlling;
        }
        sort_pairs(&mut self.pairs);

        if !self.pairs.is_empty() {
            self.set_state(SessionState::Searching);
            self.arm_activation();
        }
    }

    //-------------------------------------------------------------------
    // responses
    //-------------------------------------------------------------------

    fn send_binding_success(&mut self, req: &Message, via: SocketAddr, from: SocketAddr) {
        let mut res = Message::new();
        let result = res.build(&[
            Box::new(req.clone()),
            Box::new(BINDING_SUCCESS),
            Box::new(XorMappedAddress {
                ip: from.ip(),
                port: from.port(),
            }),
            Box::new(MessageIntegrity::new_short_term_integrity(
                self.local_pwd.clone(),
            )),
            Box::new(FINGERPRINT),
        ]);

        match result {
            Ok(()) => self.transmit(via, from, &res.raw),
            Err(err) => warn!("failed to build binding success: {err}"),
        }
    }

    fn send_binding_error(
        &mut self,
        req: &Message,
        via: SocketAddr,
        from: SocketAddr,
        code: u16,
        reason: &str,
    ) {
        let mut res = Message::new();
        let result = res.build(&[
            Box::new(req.clone()),
            Box::new(MessageType::new(METHOD_BINDING, CLASS_ERROR_RESPONSE)),
            Box::new(ErrorCodeAttribute {
                code: stun::error_code::ErrorCode(code),
                reason: reason.as_bytes().to_vec(),
            }),
            Box::new(MessageIntegrity::new_short_term_integrity(
                self.local_pwd.clone(),
            )),
            Box::new(FINGERPRINT),
        ]);

        match result {
            Ok(()) => self.transmit(via, from, &res.raw),
            Err(err) => warn!("failed to build binding error: {err}"),
        }
    }

    fn transmit(&mut self, via: SocketAddr, to: SocketAddr, raw: &[u8]) {
        let now = Instant::now();
        self.last_sent = now;
        self.transmits.push_back(TaggedBytesMut {
            now,
            transport: TransportContext {
                local_addr: via,
                peer_addr: to,
                protocol: TransportProtocol::Udp,
            },
            message: BytesMut::from(raw),
        });
    }

    //-------------------------------------------------------------------
    // failure / termination
    //-------------------------------------------------------------------

    fn evaluate_failure(&mut self) {
        if self.pairs.is_empty() && !self.end_of_remote_candidates {
            return;
        }
        let all_failed = self.pairs.iter().all(|pair| pair.failed);
        if !all_failed && !self.pairs.is_empty() {
            return;
        }
        if self.nominated.is_some() {
            return;
        }

        if self.end_of_remote_candidates {
            debug!("remote candidate list exhausted and every pair failed");
            self.close_with(Some(Error::ErrCandidateSearchFailed));
        } else if !self.pairs.is_empty()
            && matches!(
                self.state,
                SessionState::Searching | SessionState::Nominating
            )
        {
            self.set_state(SessionState::Halted);
            self.next_activation = None;
        }
    }

    /// Explicit shutdown; repeated calls are no-ops.
    pub fn close(&mut self) {
        self.close_with(None);
    }

    fn close_with(&mut self, error: Option<Error>) {
        if self.state == SessionState::Shutdown {
            return;
        }
        self.requests.clear();
        self.liveness_tx = None;
        self.next_activation = None;
        self.nominated = None;
        self.pending_nomination = None;
        self.set_state(SessionState::Shutdown);
        self.events.push_back(SessionEvent::Closed { error });
    }

    //-------------------------------------------------------------------
    // timers
    //-------------------------------------------------------------------

    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.state == SessionState::Shutdown {
            return None;
        }

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
        if self.nominated.is_some() {
            if let Some(interval) = self.keep_alive.keep_alive_interval {
                consider(Some(self.last_sent + interval));
            }
            if let Some(window) = self.keep_alive.expecting_data_within {
                consider(Some(self.last_received + window));
            }
        }
        if let Some(timeout) = self.keep_alive.backgrounding_timeout {
            consider(Some(self.last_received + timeout));
        }
        earliest
    }

    pub fn handle_timeout(&mut self, now: Instant, foundation: Option<&FoundationProgress>) {
        if self.state == SessionState::Shutdown {
            return;
        }

        self.requests.handle_timeout(now);
        while let Some(event) = self.requests.poll_event() {
            let RequesterEvent::Timeout { purpose, .. } = event;
            match purpose {
                CheckKind::Check { pair } => {
                    trace!("check on pair {} timed out", self.pairs[pair]);
                    self.pairs[pair].failed = true;
                    self.pairs[pair].in_flight = None;
                    self.evaluate_failure();
                }
                CheckKind::Nominate { pair } => {
                    debug!("nomination of pair {} timed out", self.pairs[pair]);
                    self.pending_nomination = None;
                    self.pairs[pair].failed = true;
                    self.pairs[pair].in_flight = None;
                    if self.state == SessionState::Nominating {
                        self.set_state(SessionState::Searching);
                        self.arm_activation();
                    }
                    self.evaluate_failure();
                }
                CheckKind::Liveness => {
                    debug!("liveness probe timed out, evicting nomination");
                    self.liveness_tx = None;
                    self.evict_nomination();
                }
            }
        }
        if self.state == SessionState::Shutdown {
            return;
        }

        if let Some(timeout) = self.keep_alive.backgrounding_timeout {
            if now.duration_since(self.last_received) >= timeout {
                self.close_with(Some(Error::ErrBackgroundingTimeout));
                return;
            }
        }

        if let Some(at) = self.next_activation {
            if at <= now
                && matches!(
                    self.state,
                    SessionState::Searching | SessionState::Nominating
                )
            {
                self.activate_one(foundation, now);
                self.next_activation = Some(now + ACTIVATION_INTERVAL);
            }
        }

        if let Some(pair_index) = self.nominated {
            if let Some(interval) = self.keep_alive.keep_alive_interval {
                if now.duration_since(self.last_sent) >= interval {
                    self.send_keep_alive(pair_index);
                }
            }
            if let Some(window) = self.keep_alive.expecting_data_within {
                if now.duration_since(self.last_received) >= window && self.liveness_tx.is_none() {
                    self.start_liveness_probe(pair_index, now);
                }
            }
        }
    }

    fn send_keep_alive(&mut self, pair_index: usize) {
        let pair = self.pairs[pair_index];
        let via = self.local_candidates[pair.local].addr;
        let peer = self.remote_candidates[pair.remote].addr;

        let mut msg = Message::new();
        let result = msg.build(&[
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(METHOD_BINDING, CLASS_INDICATION)),
            Box::new(FINGERPRINT),
        ]);
        match result {
            Ok(()) => {
                trace!("keep-alive indication on {}", self.pairs[pair_index]);
                self.transmit(via, peer, &msg.raw);
            }
            Err(err) => warn!("failed to build keep-alive indication: {err}"),
        }
    }

    fn start_liveness_probe(&mut self, pair_index: usize, now: Instant) {
        let pair = self.pairs[pair_index];
        let msg = match self.build_check(&pair, false) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("failed to build liveness probe: {err}");
                return;
            }
        };

        let requester = Requester::new(
            RequesterConfig {
                transaction_id: msg.transaction_id,
                purpose: CheckKind::Liveness,
                raw: BytesMut::from(&msg.raw[..]),
                local_addr: self.local_candidates[pair.local].addr,
                peer_addr: self.remote_candidates[pair.remote].addr,
                protocol: TransportProtocol::Udp,
                profile: RetransmitProfile::IceCheck,
            },
            now,
        );
        self.liveness_tx = Some(msg.transaction_id);
        self.last_sent = now;
        if let Err(err) = self.requests.send(requester) {
            warn!("failed to start liveness probe: {err}");
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("session state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.events.push_back(SessionEvent::StateChange(state));
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

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Routes the owning socket must add for inbound demultiplexing.
    pub fn take_pending_routes(&mut self) -> Vec<(SocketAddr, SocketAddr)> {
        std::mem::take(&mut self.pending_routes)
    }
}

fn error_code(res: &Message) -> Option<u16> {
    let mut code = ErrorCodeAttribute::default();
    code.get_from(res).ok().map(|_| code.code.0)
}
