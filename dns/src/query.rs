#[cfg(test)]
mod query_test;

use rand::Rng;
use std::net::{IpAddr, SocketAddr};

/// Result of an A or AAAA lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressResult {
    pub name: String,
    pub ttl: u32,
    pub ips: Vec<IpAddr>,
}

/// One SRV record with its target optionally expanded to addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub name: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
    pub a: Option<AddressResult>,
    pub aaaa: Option<AddressResult>,
}

impl SrvRecord {
    /// All expanded socket addresses of this record.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        let mut addrs = vec![];
        for result in self.a.iter().chain(self.aaaa.iter()) {
            for ip in &result.ips {
                addrs.push(SocketAddr::new(*ip, self.port));
            }
        }
        addrs
    }
}

/// Result of an SRV lookup, ordered per RFC 2782.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvResult {
    pub name: String,
    pub service: String,
    pub protocol: String,
    pub ttl: u32,
    pub records: Vec<SrvRecord>,
}

impl SrvResult {
    /// All expanded socket addresses, in record order.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.records
            .iter()
            .flat_map(|record| record.addresses())
            .collect()
    }
}

/// Completed answer of an aggregate query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsAnswer {
    /// A / AAAA / A-or-AAAA outcome; whichever families succeeded are set.
    Addresses {
        a: Option<AddressResult>,
        aaaa: Option<AddressResult>,
    },
    Srv(SrvResult),
}

/// What to resolve when an SRV lookup fails or comes back empty.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum SrvFallback {
    /// Fail the aggregate.
    #[default]
    None,
    /// Fall back to an A lookup on the input name.
    A,
    /// Fall back to an AAAA lookup on the input name.
    Aaaa,
    /// Fall back to both families on the input name.
    AOrAaaa,
}

/// Options of an SRV aggregate: fallback behaviour and the values used for
/// synthesized records.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SrvLookupOptions {
    pub fallback: SrvFallback,
    pub default_port: u16,
    pub default_priority: u16,
    pub default_weight: u16,
}

impl Default for SrvLookupOptions {
    fn default() -> Self {
        Self {
            fallback: SrvFallback::None,
            default_port: 0,
            default_priority: 10,
            default_weight: 0,
        }
    }
}

/// Sorts SRV records by ascending priority; records of equal priority are
/// ordered by repeated weight-proportional random selection (RFC 2782).
pub fn order_srv_records(records: &mut Vec<SrvRecord>) {
    records.sort_by_key(|record| record.priority);

    let mut rng = rand::rng();
    let mut ordered = Vec::with_capacity(records.len());
    let mut rest = std::mem::take(records);

    while !rest.is_empty() {
        let priority = rest[0].priority;
        let group_len = rest.iter().take_while(|r| r.priority == priority).count();
        let mut group: Vec<SrvRecord> = rest.drain(..group_len).collect();

        while !group.is_empty() {
            let total: u64 = group.iter().map(|r| u64::from(r.weight)).sum();
            let index = if total == 0 {
                0
            } else {
                let mut pick = rng.random_range(0..total);
                let mut chosen = group.len() - 1;
                for (i, record) in group.iter().enumerate() {
                    let weight = u64::from(record.weight);
                    if pick < weight {
                        chosen = i;
                        break;
                    }
                    pick -= weight;
                }
                chosen
            };
            ordered.push(group.remove(index));
        }
    }

    *records = ordered;
}

/// Raw SRV record as it came off the wire, target not yet expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawSrvRecord {
    pub(crate) priority: u16,
    pub(crate) weight: u16,
    pub(crate) port: u16,
    pub(crate) target: String,
}

/// Records a single lookup resolved to, shared between the cache and the
/// aggregate state machines.
#[derive(Debug, Clone)]
pub(crate) enum LookupRecords {
    Address { ttl: u32, ips: Vec<IpAddr> },
    Srv { ttl: u32, records: Vec<RawSrvRecord> },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Family {
    V4,
    V6,
}

impl Family {
    pub(crate) fn record_type(&self) -> hickory_proto::rr::RecordType {
        match self {
            Family::V4 => hickory_proto::rr::RecordType::A,
            Family::V6 => hickory_proto::rr::RecordType::AAAA,
        }
    }

    pub(crate) fn matches(&self, ip: &IpAddr) -> bool {
        match self {
            Family::V4 => ip.is_ipv4(),
            Family::V6 => ip.is_ipv6(),
        }
    }
}

/// Which sub-lookup of an aggregate completed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SubSlot {
    AddressFamily(Family),
    SrvLookup,
    FallbackFamily(Family),
    Target { record: usize, family: Family },
}

/// Follow-up work an aggregate asks the monitor to perform.
#[derive(Debug)]
pub(crate) enum StepAction {
    Lookup {
        name: String,
        family_or_srv: LookupKind,
        slot: SubSlot,
    },
    Complete(Option<DnsAnswer>),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum LookupKind {
    Address(Family),
    Srv,
}

/// A / AAAA / A-or-AAAA aggregate, possibly spanning a comma-separated list
/// of input names. Completes when every sub-lookup terminated.
#[derive(Debug)]
pub(crate) struct AddressAggregate {
    pub(crate) name: String,
    pub(crate) pending: usize,
    pub(crate) a: Option<AddressResult>,
    pub(crate) aaaa: Option<AddressResult>,
}

impl AddressAggregate {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            pending: 0,
            a: None,
            aaaa: None,
        }
    }

    /// Merges one family result in: union of IPs, minimum TTL.
    pub(crate) fn merge(&mut self, family: Family, ttl: u32, ips: &[IpAddr]) {
        let matching: Vec<IpAddr> = ips.iter().copied().filter(|ip| family.matches(ip)).collect();
        if matching.is_empty() {
            return;
        }

        let slot = match family {
            Family::V4 => &mut self.a,
            Family::V6 => &mut self.aaaa,
        };
        match slot {
            Some(existing) => {
                existing.ttl = existing.ttl.min(ttl);
                for ip in matching {
                    if !existing.ips.contains(&ip) {
                        existing.ips.push(ip);
                    }
                }
            }
            None => {
                *slot = Some(AddressResult {
                    name: self.name.clone(),
                    ttl,
                    ips: matching,
                });
            }
        }
    }

    pub(crate) fn finish(&mut self) -> Option<DnsAnswer> {
        if self.a.is_none() && self.aaaa.is_none() {
            None
        } else {
            Some(DnsAnswer::Addresses {
                a: self.a.take(),
                aaaa: self.aaaa.take(),
            })
        }
    }

    pub(crate) fn on_sub_result(
        &mut self,
        slot: SubSlot,
        outcome: Option<&LookupRecords>,
        actions: &mut Vec<StepAction>,
    ) {
        if let (SubSlot::AddressFamily(family), Some(LookupRecords::Address { ttl, ips })) =
            (slot, outcome)
        {
            self.merge(family, *ttl, ips);
        }

        self.pending = self.pending.saturating_sub(1);
        if self.pending == 0 {
            actions.push(StepAction::Complete(self.finish()));
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SrvPhase {
    /// SRV lookups per list element outstanding.
    Lookup,
    /// SRV empty/failed, resolving the input name directly.
    Fallback,
    /// Resolving each SRV target to addresses.
    Targets,
}

/// SRV-with-fallback aggregate.
#[derive(Debug)]
pub(crate) struct SrvAggregate {
    pub(crate) name: String,
    pub(crate) service: String,
    pub(crate) protocol: String,
    pub(crate) options: SrvLookupOptions,
    pub(crate) phase: SrvPhase,
    pub(crate) pending: usize,
    pub(crate) ttl: Option<u32>,
    /// Raw records awaiting target expansion.
    pub(crate) raw: Vec<RawSrvRecord>,
    /// Final records: literal-IP list elements land here up front, expanded
    /// targets and synthetic fallback records during the later phases.
    pub(crate) records: Vec<SrvRecord>,
    fallback_addrs: AddressAggregate,
}

impl SrvAggregate {
    pub(crate) fn new(name: &str, service: &str, protocol: &str, options: SrvLookupOptions) -> Self {
        Self {
            name: name.to_owned(),
            service: service.to_owned(),
            protocol: protocol.to_owned(),
            options,
            phase: SrvPhase::Lookup,
            pending: 0,
            ttl: None,
            raw: vec![],
            records: vec![],
            fallback_addrs: AddressAggregate::new(name),
        }
    }

    /// A list element that was already an IP literal.
    pub(crate) fn push_literal(&mut self, literal: &str, ips: Vec<IpAddr>) {
        let (v4, v6): (Vec<IpAddr>, Vec<IpAddr>) = ips.into_iter().partition(|ip| ip.is_ipv4());
        self.records.push(SrvRecord {
            name: literal.to_owned(),
            port: self.options.default_port,
            priority: self.options.default_priority,
            weight: self.options.default_weight,
            a: (!v4.is_empty()).then(|| AddressResult {
                name: literal.to_owned(),
                ttl: 3600,
                ips: v4,
            }),
            aaaa: (!v6.is_empty()).then(|| AddressResult {
                name: literal.to_owned(),
                ttl: 3600,
                ips: v6,
            }),
        });
    }

    fn note_ttl(&mut self, ttl: u32) {
        self.ttl = Some(self.ttl.map_or(ttl, |existing| existing.min(ttl)));
    }

    fn fallback_families(&self) -> Vec<Family> {
        match self.options.fallback {
            SrvFallback::None => vec![],
            SrvFallback::A => vec![Family::V4],
            SrvFallback::Aaaa => vec![Family::V6],
            SrvFallback::AOrAaaa => vec![Family::V4, Family::V6],
        }
    }

    pub(crate) fn finish(&mut self) -> StepAction {
        let mut records = std::mem::take(&mut self.records);
        if records.is_empty() {
            return StepAction::Complete(None);
        }
        order_srv_records(&mut records);
        StepAction::Complete(Some(DnsAnswer::Srv(SrvResult {
            name: self.name.clone(),
            service: self.service.clone(),
            protocol: self.protocol.clone(),
            ttl: self.ttl.unwrap_or(3600),
            records,
        })))
    }

    /// Moves into target expansion, queueing one lookup per family per
    /// non-literal target. Targets that are IP literals expand in place.
    fn begin_targets(&mut self, actions: &mut Vec<StepAction>) {
        self.phase = SrvPhase::Targets;
        let raw = std::mem::take(&mut self.raw);

        for raw_record in raw {
            let index = self.records.len();
            let mut record = SrvRecord {
                name: raw_record.target.clone(),
                port: raw_record.port,
                priority: raw_record.priority,
                weight: raw_record.weight,
                a: None,
                aaaa: None,
            };

            if let Ok(ip) = raw_record.target.parse::<IpAddr>() {
                let result = AddressResult {
                    name: raw_record.target.clone(),
                    ttl: self.ttl.unwrap_or(3600),
                    ips: vec![ip],
                };
                if ip.is_ipv4() {
                    record.a = Some(result);
                } else {
                    record.aaaa = Some(result);
                }
                self.records.push(record);
                continue;
            }

            self.records.push(record);
            for family in [Family::V4, Family::V6] {
                self.pending += 1;
                actions.push(StepAction::Lookup {
                    name: raw_record.target.clone(),
                    family_or_srv: LookupKind::Address(family),
                    slot: SubSlot::Target {
                        record: index,
                        family,
                    },
                });
            }
        }

        if self.pending == 0 {
            actions.push(self.finish());
        }
    }

    fn begin_fallback(&mut self, actions: &mut Vec<StepAction>) {
        let families = self.fallback_families();
        if families.is_empty() {
            actions.push(StepAction::Complete(None));
            return;
        }

        self.phase = SrvPhase::Fallback;
        for element in self.name.split(',') {
            for family in &families {
                self.pending += 1;
                actions.push(StepAction::Lookup {
                    name: element.to_owned(),
                    family_or_srv: LookupKind::Address(*family),
                    slot: SubSlot::FallbackFamily(*family),
                });
            }
        }
    }

    pub(crate) fn on_sub_result(
        &mut self,
        slot: SubSlot,
        outcome: Option<&LookupRecords>,
        actions: &mut Vec<StepAction>,
    ) {
        self.pending = self.pending.saturating_sub(1);

        match (slot, outcome) {
            (SubSlot::SrvLookup, Some(LookupRecords::Srv { ttl, records })) => {
                if !records.is_empty() {
                    self.note_ttl(*ttl);
                    self.raw.extend(records.iter().cloned());
                }
            }
            // a failed SRV element behaves like an empty one
            (SubSlot::SrvLookup, _) => {}
            (SubSlot::FallbackFamily(family), Some(LookupRecords::Address { ttl, ips })) => {
                self.fallback_addrs.merge(family, *ttl, ips);
            }
            (SubSlot::FallbackFamily(_), _) => {}
            (
                SubSlot::Target { record, family },
                Some(LookupRecords::Address { ttl, ips }),
            ) => {
                if let Some(target) = self.records.get_mut(record) {
                    let matching: Vec<IpAddr> =
                        ips.iter().copied().filter(|ip| family.matches(ip)).collect();
                    if !matching.is_empty() {
                        let result = AddressResult {
                            name: target.name.clone(),
                            ttl: *ttl,
                            ips: matching,
                        };
                        match family {
                            Family::V4 => target.a = Some(result),
                            Family::V6 => target.aaaa = Some(result),
                        }
                    }
                }
            }
            // target failures leave the record unexpanded
            (SubSlot::Target { .. }, _) => {}
            (SubSlot::AddressFamily(_), _) => {
                log::warn!("address sub-result delivered to SRV aggregate");
            }
        }

        if self.pending > 0 {
            return;
        }

        match self.phase {
            SrvPhase::Lookup => {
                if !self.raw.is_empty() {
                    self.begin_targets(actions);
                } else if !self.records.is_empty() {
                    // literal list elements satisfied the query
                    actions.push(self.finish());
                } else {
                    self.begin_fallback(actions);
                }
            }
            SrvPhase::Fallback => {
                let a = self.fallback_addrs.a.take();
                let aaaa = self.fallback_addrs.aaaa.take();
                if a.is_none() && aaaa.is_none() {
                    actions.push(StepAction::Complete(None));
                } else {
                    let ttl = a
                        .as_ref()
                        .map(|r| r.ttl)
                        .into_iter()
                        .chain(aaaa.as_ref().map(|r| r.ttl))
                        .min();
                    if let Some(ttl) = ttl {
                        self.note_ttl(ttl);
                    }
                    self.records.push(SrvRecord {
                        name: self.name.clone(),
                        port: self.options.default_port,
                        priority: self.options.default_priority,
                        weight: self.options.default_weight,
                        a,
                        aaaa,
                    });
                    actions.push(self.finish());
                }
            }
            SrvPhase::Targets => {
                actions.push(self.finish());
            }
        }
    }
}

/// The tagged union over every aggregate query variant.
#[derive(Debug)]
pub(crate) enum Aggregate {
    Address(AddressAggregate),
    Srv(SrvAggregate),
}

impl Aggregate {
    pub(crate) fn on_sub_result(
        &mut self,
        slot: SubSlot,
        outcome: Option<&LookupRecords>,
        actions: &mut Vec<StepAction>,
    ) {
        match self {
            Aggregate::Address(aggregate) => aggregate.on_sub_result(slot, outcome, actions),
            Aggregate::Srv(aggregate) => aggregate.on_sub_result(slot, outcome, actions),
        }
    }
}
