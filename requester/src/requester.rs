#[cfg(test)]
mod requester_test;

use bytes::BytesMut;
use log::trace;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use stun::agent::TransactionId;

use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportContext, TransportProtocol};

use crate::profile::RetransmitProfile;

/// Events surfaced by a [RequesterMap].
#[derive(Debug)]
pub enum RequesterEvent<P> {
    /// The retransmission budget of a request ran out without a matching
    /// response. The requester has been removed from the map.
    Timeout {
        transaction_id: TransactionId,
        purpose: P,
    },
}

/// Parameters for a new [Requester].
pub struct RequesterConfig<P> {
    pub transaction_id: TransactionId,
    pub purpose: P,
    /// Serialized request, retransmitted verbatim.
    pub raw: BytesMut,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub protocol: TransportProtocol,
    pub profile: RetransmitProfile,
}

/// A single outstanding STUN request: owns the serialized message, the
/// retransmission state and the destination it expects the response from.
pub struct Requester<P> {
    pub transaction_id: TransactionId,
    pub purpose: P,
    pub raw: BytesMut,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub protocol: TransportProtocol,
    profile: RetransmitProfile,
    n_sent: u16,
    interval: Duration,
    deadline: Instant,
    transmits: VecDeque<TaggedBytesMut>,
}

impl<P> Requester<P> {
    /// Creates the requester and queues the initial transmission.
    pub fn new(config: RequesterConfig<P>, now: Instant) -> Self {
        let interval = config.profile.initial_interval();
        let mut requester = Self {
            transaction_id: config.transaction_id,
            purpose: config.purpose,
            raw: config.raw,
            local_addr: config.local_addr,
            peer_addr: config.peer_addr,
            protocol: config.protocol,
            profile: config.profile,
            n_sent: 0,
            interval,
            deadline: now + interval,
            transmits: VecDeque::new(),
        };
        requester.transmit(now);
        requester
    }

    fn transmit(&mut self, now: Instant) {
        self.n_sent += 1;
        self.transmits.push_back(TaggedBytesMut {
            now,
            transport: TransportContext {
                local_addr: self.local_addr,
                peer_addr: self.peer_addr,
                protocol: self.protocol,
            },
            message: self.raw.clone(),
        });
    }

    /// Retransmits immediately without consuming the retry budget. Used for
    /// triggered checks reacting to an inbound request on the same pair.
    pub fn retry_now(&mut self, now: Instant) {
        self.transmits.push_back(TaggedBytesMut {
            now,
            transport: TransportContext {
                local_addr: self.local_addr,
                peer_addr: self.peer_addr,
                protocol: self.protocol,
            },
            message: self.raw.clone(),
        });
        self.deadline = now + self.interval;
    }

    pub fn poll_timeout(&self) -> Instant {
        self.deadline
    }

    /// Advances the retransmission schedule. Returns true once the budget is
    /// exhausted and the request must be reported as timed out.
    pub fn handle_timeout(&mut self, now: Instant) -> bool {
        if self.deadline > now {
            return false;
        }
        if self.n_sent >= self.profile.max_sends() {
            return true;
        }

        self.interval = std::cmp::min(self.interval * 2, self.profile.max_interval());
        self.deadline = now + self.interval;

        trace!(
            "retransmitting {:?} to {} (n_sent={})",
            self.transaction_id,
            self.peer_addr,
            self.n_sent
        );
        self.transmit(now);
        false
    }

    pub fn poll_transmit(&mut self) -> Option<TaggedBytesMut> {
        self.transmits.pop_front()
    }
}

/// The unique `transaction id -> requester` table. Inbound responses are
/// matched against it; retransmissions and timeouts are driven through it.
pub struct RequesterMap<P> {
    requesters: HashMap<TransactionId, Requester<P>>,
    transmits: VecDeque<TaggedBytesMut>,
    events: VecDeque<RequesterEvent<P>>,
}

impl<P> Default for RequesterMap<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> RequesterMap<P> {
    pub fn new() -> Self {
        Self {
            requesters: HashMap::new(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Registers an outstanding request. Duplicate transaction ids are
    /// rejected; with 96-bit random ids this only fires on caller bugs.
    pub fn send(&mut self, requester: Requester<P>) -> Result<()> {
        if self.requesters.contains_key(&requester.transaction_id) {
            return Err(Error::ErrTransactionExists);
        }
        self.requesters.insert(requester.transaction_id, requester);
        Ok(())
    }

    /// Matches a response by transaction id and source address. On a match
    /// the requester is removed and returned; at most one outcome is ever
    /// delivered for a transaction. A response from an unexpected address
    /// leaves the transaction outstanding.
    pub fn handle_response(
        &mut self,
        transaction_id: &TransactionId,
        from: SocketAddr,
    ) -> Option<Requester<P>> {
        match self.requesters.get(transaction_id) {
            Some(requester) if requester.peer_addr == from => {
                self.requesters.remove(transaction_id)
            }
            Some(requester) => {
                trace!(
                    "discarding response for {:?} from unexpected address {} (expected {})",
                    transaction_id,
                    from,
                    requester.peer_addr
                );
                None
            }
            None => None,
        }
    }

    /// Cancels an outstanding request. No further packets are emitted for
    /// it and no outcome is delivered. Cancelling a transaction that already
    /// completed is a no-op.
    pub fn cancel(&mut self, transaction_id: &TransactionId) -> Option<Requester<P>> {
        self.requesters.remove(transaction_id)
    }

    /// Immediate retransmit of an outstanding request, see
    /// [Requester::retry_now].
    pub fn retry_now(&mut self, transaction_id: &TransactionId, now: Instant) {
        if let Some(requester) = self.requesters.get_mut(transaction_id) {
            requester.retry_now(now);
        }
    }

    pub fn contains(&self, transaction_id: &TransactionId) -> bool {
        self.requesters.contains_key(transaction_id)
    }

    pub fn get(&self, transaction_id: &TransactionId) -> Option<&Requester<P>> {
        self.requesters.get(transaction_id)
    }

    pub fn len(&self) -> usize {
        self.requesters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requesters.is_empty()
    }

    /// Drops every outstanding request without delivering outcomes.
    pub fn clear(&mut self) {
        self.requesters.clear();
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.requesters
            .values()
            .map(|requester| requester.poll_timeout())
            .min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        let mut timed_out = vec![];
        for (transaction_id, requester) in self.requesters.iter_mut() {
            if requester.handle_timeout(now) {
                timed_out.push(*transaction_id);
            }
        }

        for transaction_id in timed_out {
            if let Some(requester) = self.requesters.remove(&transaction_id) {
                self.events.push_back(RequesterEvent::Timeout {
                    transaction_id,
                    purpose: requester.purpose,
                });
            }
        }
    }

    pub fn poll_transmit(&mut self) -> Option<TaggedBytesMut> {
        for requester in self.requesters.values_mut() {
            while let Some(transmit) = requester.poll_transmit() {
                self.transmits.push_back(transmit);
            }
        }
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<RequesterEvent<P>> {
        self.events.pop_front()
    }
}
