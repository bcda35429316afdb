
use bytes::BytesMut;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use log::{debug, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportContext, TransportProtocol};

use crate::query::{
    Aggregate, AddressAggregate, Family, LookupKind, LookupRecords, SrvAggregate,
    SrvLookupOptions, StepAction, SubSlot,
};
use crate::DnsAnswer;

/// TTL reported for IP-literal inputs that never touch the resolver.
const LITERAL_TTL: u32 = 3600;
/// How long NXDOMAIN / FORMERR outcomes are cached.
const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(120);
/// Positive cache floor for empty answers.
const EMPTY_ANSWER_TTL: u32 = 60;
/// Re-queue delay after a transient failure (SERVFAIL, retry exhaustion).
const REQUEUE_DELAY: Duration = Duration::from_secs(15);
/// Transient re-queues attempted before the lookup reports failure.
const MAX_REQUEUES: u16 = 2;

const INITIAL_RETRANSMIT: Duration = Duration::from_secs(1);
const MAX_RETRANSMIT: Duration = Duration::from_secs(8);
const MAX_SENDS: u16 = 4;

/// Handle of an aggregate query.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

pub struct DnsConfig {
    /// Recursive nameserver the monitor talks to.
    pub nameserver: std::net::SocketAddr,
    /// Local address of the UDP socket the owner reads/writes for us.
    pub local_addr: std::net::SocketAddr,
}

#[derive(Debug)]
pub enum DnsEvent {
    /// An aggregate query finished. `answer` is `None` when every branch of
    /// the aggregate failed.
    Completed {
        query: QueryId,
        answer: Option<DnsAnswer>,
    },
}

type LookupKey = (String, RecordType);

struct Lookup {
    wire_id: u16,
    raw: BytesMut,
    n_sent: u16,
    interval: Duration,
    deadline: Instant,
    requeues: u16,
    /// Set while the lookup is parked after a transient failure.
    requeue_at: Option<Instant>,
    waiters: Vec<(QueryId, SubSlot)>,
}

struct CacheEntry {
    expires: Instant,
    /// `None` caches a hard failure.
    records: Option<LookupRecords>,
}

/// The single background resolver front-end: multiplexes A / AAAA / SRV
/// wire lookups, dedupes them by `(name, type)`, caches outcomes and drives
/// the aggregate query state machines.
pub struct DnsMonitor {
    config: DnsConfig,
    next_query_id: u64,
    queries: HashMap<QueryId, Aggregate>,
    lookups: HashMap<LookupKey, Lookup>,
    by_wire_id: HashMap<u16, LookupKey>,
    cache: HashMap<LookupKey, CacheEntry>,
    transmits: VecDeque<TaggedBytesMut>,
    events: VecDeque<DnsEvent>,
}

impl DnsMonitor {
    pub fn new(config: DnsConfig) -> Self {
        Self {
            config,
            next_query_id: 0,
            queries: HashMap::new(),
            lookups: HashMap::new(),
            by_wire_id: HashMap::new(),
            cache: HashMap::new(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Resolves `name` (or a comma-separated list of names) to IPv4 addresses.
    pub fn lookup_a(&mut self, name: &str) -> Result<QueryId> {
        self.lookup_address(name, &[Family::V4])
    }

    /// Resolves `name` (or a comma-separated list of names) to IPv6 addresses.
    pub fn lookup_aaaa(&mut self, name: &str) -> Result<QueryId> {
        self.lookup_address(name, &[Family::V6])
    }

    /// Resolves both families in parallel; completes when both terminated.
    pub fn lookup_a_or_aaaa(&mut self, name: &str) -> Result<QueryId> {
        self.lookup_address(name, &[Family::V4, Family::V6])
    }

    fn lookup_address(&mut self, name: &str, families: &[Family]) -> Result<QueryId> {
        let elements = split_list(name)?;
        let query_id = self.alloc_query_id();
        let mut aggregate = AddressAggregate::new(name);

        let mut subs = vec![];
        for element in &elements {
            if let Some(ips) = parse_literals(element) {
                aggregate.merge(Family::V4, LITERAL_TTL, &ips);
                aggregate.merge(Family::V6, LITERAL_TTL, &ips);
            } else {
                for family in families {
                    aggregate.pending += 1;
                    subs.push((element.clone(), *family));
                }
            }
        }

        if aggregate.pending == 0 {
            self.events.push_back(DnsEvent::Completed {
                query: query_id,
                answer: aggregate.finish(),
            });
            return Ok(query_id);
        }

        self.queries.insert(query_id, Aggregate::Address(aggregate));
        for (element, family) in subs {
            self.start_sub_lookup(
                query_id,
                &element,
                LookupKind::Address(family),
                SubSlot::AddressFamily(family),
            );
        }
        Ok(query_id)
    }

    /// Resolves `_service._protocol.name` SRV records, expanding each target
    /// to addresses, with the configured fallback when the SRV tree is empty.
    pub fn lookup_srv(
        &mut self,
        name: &str,
        service: &str,
        protocol: &str,
        options: SrvLookupOptions,
    ) -> Result<QueryId> {
        let elements = split_list(name)?;
        let query_id = self.alloc_query_id();
        let mut aggregate = SrvAggregate::new(name, service, protocol, options);

        let mut subs = vec![];
        for element in &elements {
            if let Some(ips) = parse_literals(element) {
                aggregate.push_literal(element, ips);
            } else {
                aggregate.pending += 1;
                subs.push(format!("_{service}._{protocol}.{element}"));
            }
        }

        if aggregate.pending == 0 {
            let actions = vec![aggregate.finish()];
            self.apply_actions(query_id, actions);
            return Ok(query_id);
        }

        self.queries.insert(query_id, Aggregate::Srv(aggregate));
        for srv_name in subs {
            self.start_sub_lookup(query_id, &srv_name, LookupKind::Srv, SubSlot::SrvLookup);
        }
        Ok(query_id)
    }

    /// Forgets an aggregate query; its completion event is never delivered.
    pub fn cancel(&mut self, query: QueryId) {
        self.queries.remove(&query);
        for lookup in self.lookups.values_mut() {
            lookup.waiters.retain(|(waiter, _)| *waiter != query);
        }
    }

    fn alloc_query_id(&mut self) -> QueryId {
        self.next_query_id += 1;
        QueryId(self.next_query_id)
    }

    fn start_sub_lookup(&mut self, query_id: QueryId, name: &str, kind: LookupKind, slot: SubSlot) {
        let name = normalize(name);

        // names that are already literals never reach the wire
        if let LookupKind::Address(_) = kind {
            if let Some(ips) = parse_literals(&name) {
                let records = LookupRecords::Address {
                    ttl: LITERAL_TTL,
                    ips,
                };
                self.deliver(query_id, slot, Some(&records));
                return;
            }
        }

        let rtype = match kind {
            LookupKind::Address(family) => family.record_type(),
            LookupKind::Srv => RecordType::SRV,
        };
        let key = (name.clone(), rtype);

        let now = Instant::now();
        if let Some(entry) = self.cache.get(&key) {
            if entry.expires > now {
                let cached = entry.records.clone();
                self.deliver(query_id, slot, cached.as_ref());
                return;
            }
            self.cache.remove(&key);
        }

        if let Some(lookup) = self.lookups.get_mut(&key) {
            lookup.waiters.push((query_id, slot));
            return;
        }

        let wire_id = self.alloc_wire_id();
        match encode_query(&name, rtype, wire_id) {
            Ok(raw) => {
                trace!("starting {rtype} lookup for {name} (id={wire_id})");
                self.transmits.push_back(self.tag(raw.clone(), now));
                self.by_wire_id.insert(wire_id, key.clone());
                self.lookups.insert(
                    key,
                    Lookup {
                        wire_id,
                        raw,
                        n_sent: 1,
                        interval: INITIAL_RETRANSMIT,
                        deadline: now + INITIAL_RETRANSMIT,
                        requeues: 0,
                        requeue_at: None,
                        waiters: vec![(query_id, slot)],
                    },
                );
            }
            Err(err) => {
                warn!("failed to encode {rtype} query for {name}: {err}");
                self.deliver(query_id, slot, None);
            }
        }
    }

    fn alloc_wire_id(&mut self) -> u16 {
        loop {
            let id = rand::random::<u16>();
            if !self.by_wire_id.contains_key(&id) {
                return id;
            }
        }
    }

    fn tag(&self, raw: BytesMut, now: Instant) -> TaggedBytesMut {
        TaggedBytesMut {
            now,
            transport: TransportContext {
                local_addr: self.config.local_addr,
                peer_addr: self.config.nameserver,
                protocol: TransportProtocol::Udp,
            },
            message: raw,
        }
    }

    /// Routes one sub-lookup outcome into its aggregate and performs the
    /// follow-up work the aggregate requests.
    fn deliver(&mut self, query_id: QueryId, slot: SubSlot, outcome: Option<&LookupRecords>) {
        let mut aggregate = match self.queries.remove(&query_id) {
            Some(aggregate) => aggregate,
            // cancelled while the lookup was in flight
            None => return,
        };

        let mut actions = vec![];
        aggregate.on_sub_result(slot, outcome, &mut actions);

        let completed = actions
            .iter()
            .any(|action| matches!(action, StepAction::Complete(_)));
        if !completed {
            self.queries.insert(query_id, aggregate);
        }
        self.apply_actions(query_id, actions);
    }

    fn apply_actions(&mut self, query_id: QueryId, actions: Vec<StepAction>) {
        for action in actions {
            match action {
                StepAction::Complete(answer) => {
                    debug!("query {query_id:?} completed (ok={})", answer.is_some());
                    self.events.push_back(DnsEvent::Completed {
                        query: query_id,
                        answer,
                    });
                }
                StepAction::Lookup {
                    name,
                    family_or_srv,
                    slot,
                } => {
                    self.start_sub_lookup(query_id, &name, family_or_srv, slot);
                }
            }
        }
    }

    fn complete_lookup(&mut self, key: &LookupKey, outcome: Option<LookupRecords>, negative: bool) {
        let lookup = match self.lookups.remove(key) {
            Some(lookup) => lookup,
            None => return,
        };
        self.by_wire_id.remove(&lookup.wire_id);

        let now = Instant::now();
        match (&outcome, negative) {
            (Some(records), _) => {
                let ttl = match records {
                    LookupRecords::Address { ttl, ips } if ips.is_empty() => {
                        (*ttl).min(EMPTY_ANSWER_TTL)
                    }
                    LookupRecords::Srv { ttl, records } if records.is_empty() => {
                        (*ttl).min(EMPTY_ANSWER_TTL)
                    }
                    LookupRecords::Address { ttl, .. } | LookupRecords::Srv { ttl, .. } => *ttl,
                };
                self.cache.insert(
                    key.clone(),
                    CacheEntry {
                        expires: now + Duration::from_secs(u64::from(ttl.max(1))),
                        records: outcome.clone(),
                    },
                );
            }
            (None, true) => {
                self.cache.insert(
                    key.clone(),
                    CacheEntry {
                        expires: now + NEGATIVE_CACHE_TTL,
                        records: None,
                    },
                );
            }
            // transient failure, not cached
            (None, false) => {}
        }

        for (query_id, slot) in lookup.waiters {
            self.deliver(query_id, slot, outcome.as_ref());
        }
    }

    pub fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        if msg.transport.peer_addr != self.config.nameserver {
            trace!(
                "discarding datagram from {} (not the configured nameserver)",
                msg.transport.peer_addr
            );
            return Ok(());
        }

        let response =
            Message::from_vec(&msg.message).map_err(|err| Error::Other(err.to_string()))?;

        let key = match self.by_wire_id.get(&response.id()) {
            Some(key) => key.clone(),
            None => {
                // silently discard
                debug!("no lookup for wire id {}", response.id());
                return Ok(());
            }
        };

        match response.response_code() {
            ResponseCode::NoError if !response.truncated() => {
                let records = parse_answer(&response, key.1);
                self.complete_lookup(&key, Some(records), false);
            }
            ResponseCode::NXDomain | ResponseCode::FormErr => {
                debug!("hard failure for {key:?}: {}", response.response_code());
                self.complete_lookup(&key, None, true);
            }
            code => {
                debug!("transient failure for {key:?}: {code}");
                self.transient_failure(&key);
            }
        }
        Ok(())
    }

    /// Parks the lookup for re-queueing, or fails it once the re-queue
    /// budget ran out.
    fn transient_failure(&mut self, key: &LookupKey) {
        let exhausted = match self.lookups.get_mut(key) {
            Some(lookup) => {
                if lookup.requeues >= MAX_REQUEUES {
                    true
                } else {
                    lookup.requeues += 1;
                    lookup.requeue_at = Some(Instant::now() + REQUEUE_DELAY);
                    false
                }
            }
            None => return,
        };

        if exhausted {
            self.complete_lookup(key, None, false);
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.lookups
            .values()
            .map(|lookup| lookup.requeue_at.unwrap_or(lookup.deadline))
            .min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        let mut exhausted = vec![];
        let mut resend = vec![];

        for (key, lookup) in self.lookups.iter_mut() {
            if let Some(requeue_at) = lookup.requeue_at {
                if requeue_at <= now {
                    lookup.requeue_at = None;
                    lookup.n_sent = 1;
                    lookup.interval = INITIAL_RETRANSMIT;
                    lookup.deadline = now + INITIAL_RETRANSMIT;
                    resend.push(lookup.raw.clone());
                }
                continue;
            }

            if lookup.deadline > now {
                continue;
            }

            if lookup.n_sent >= MAX_SENDS {
                if lookup.requeues >= MAX_REQUEUES {
                    exhausted.push(key.clone());
                } else {
                    lookup.requeues += 1;
                    lookup.requeue_at = Some(now + REQUEUE_DELAY);
                }
                continue;
            }

            lookup.n_sent += 1;
            lookup.interval = (lookup.interval * 2).min(MAX_RETRANSMIT);
            lookup.deadline = now + lookup.interval;
            resend.push(lookup.raw.clone());
        }

        for raw in resend {
            let transmit = self.tag(raw, now);
            self.transmits.push_back(transmit);
        }
        for key in exhausted {
            self.complete_lookup(&key, None, false);
        }
    }

    pub fn poll_transmit(&mut self) -> Option<TaggedBytesMut> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<DnsEvent> {
        self.events.pop_front()
    }
}

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn split_list(name: &str) -> Result<Vec<String>> {
    let elements: Vec<String> = name
        .split(',')
        .map(|element| normalize(element))
        .collect();
    if elements.iter().any(|element| element.is_empty()) {
        return Err(Error::ErrHostnameEmpty);
    }
    Ok(elements)
}

/// `Some(ips)` when the element is an IP literal.
fn parse_literals(element: &str) -> Option<Vec<IpAddr>> {
    element.parse::<IpAddr>().ok().map(|ip| vec![ip])
}

fn encode_query(name: &str, rtype: RecordType, wire_id: u16) -> Result<BytesMut> {
    let qname =
        Name::from_utf8(format!("{name}.")).map_err(|err| Error::Other(err.to_string()))?;

    let mut message = Message::new();
    message
        .set_id(wire_id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(qname, rtype));

    let raw = message
        .to_vec()
        .map_err(|err| Error::Other(err.to_string()))?;
    Ok(BytesMut::from(&raw[..]))
}

fn parse_answer(response: &Message, rtype: RecordType) -> LookupRecords {
    let mut ttl: Option<u32> = None;
    let mut ips = vec![];
    let mut srv_records = vec![];

    for record in response.answers() {
        let data = match record.data() {
            Some(data) => data,
            None => continue,
        };
        match (rtype, data) {
            (RecordType::A, RData::A(a)) => {
                ips.push(IpAddr::V4(a.0));
                ttl = Some(ttl.map_or(record.ttl(), |t| t.min(record.ttl())));
            }
            (RecordType::AAAA, RData::AAAA(aaaa)) => {
                ips.push(IpAddr::V6(aaaa.0));
                ttl = Some(ttl.map_or(record.ttl(), |t| t.min(record.ttl())));
            }
            (RecordType::SRV, RData::SRV(srv)) => {
                srv_records.push(crate::query::RawSrvRecord {
                    priority: srv.priority(),
                    weight: srv.weight(),
                    port: srv.port(),
                    target: normalize(&srv.target().to_utf8()),
                });
                ttl = Some(ttl.map_or(record.ttl(), |t| t.min(record.ttl())));
            }
            _ => {}
        }
    }

    let ttl = ttl.unwrap_or(EMPTY_ANSWER_TTL);
    if rtype == RecordType::SRV {
        LookupRecords::Srv {
            ttl,
            records: srv_records,
        }
    } else {
        LookupRecords::Address { ttl, ips }
    }
}
