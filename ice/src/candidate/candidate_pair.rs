use std::fmt;

use stun::agent::TransactionId;

/// Pair lists never grow beyond this many entries (RFC 5245 5.7.3).
pub const MAX_CANDIDATE_PAIRS: usize = 100;

/// A local/remote candidate pairing under connectivity probing.
#[derive(Clone, Copy, Debug)]
pub struct CandidatePair {
    pub local: usize,
    pub remote: usize,
    pub local_priority: u32,
    pub remote_priority: u32,
    pub(crate) controlling: bool,

    pub received_request: bool,
    pub received_response: bool,
    pub failed: bool,
    pub nominated: bool,
    pub(crate) in_flight: Option<TransactionId>,
}

impl fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prio {} (local {} prio {}) <-> (remote {} prio {})",
            self.priority(),
            self.local,
            self.local_priority,
            self.remote,
            self.remote_priority,
        )
    }
}

impl PartialEq for CandidatePair {
    fn eq(&self, other: &Self) -> bool {
        self.local == other.local && self.remote == other.remote
    }
}

impl CandidatePair {
    #[must_use]
    pub fn new(
        local: usize,
        remote: usize,
        local_priority: u32,
        remote_priority: u32,
        controlling: bool,
    ) -> Self {
        Self {
            local,
            remote,
            local_priority,
            remote_priority,
            controlling,
            received_request: false,
            received_response: false,
            failed: false,
            nominated: false,
            in_flight: None,
        }
    }

    /// RFC 5245 5.7.2. Let G be the controlling side's candidate priority
    /// and D the controlled side's:
    /// pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
    pub fn priority(&self) -> u64 {
        let (g, d) = if self.controlling {
            (self.local_priority, self.remote_priority)
        } else {
            (self.remote_priority, self.local_priority)
        };

        (1u64 << 32) * u64::from(std::cmp::min(g, d))
            + 2 * u64::from(std::cmp::max(g, d))
            + u64::from(g > d)
    }

    /// Both directions verified; eligible for nomination.
    pub fn succeeded(&self) -> bool {
        self.received_request && self.received_response
    }

    /// Forgets all probing progress (role switches start over).
    pub fn reset_progress(&mut self) {
        self.received_request = false;
        self.received_response = false;
        self.failed = false;
        self.nominated = false;
        self.in_flight = None;
    }
}

/// Sorts descending by pair priority. The priority formula itself breaks
/// ties, so equal-priority pairs keep their insertion order (stable sort).
pub fn sort_pairs(pairs: &mut [CandidatePair]) {
    pairs.sort_by(|a, b| b.priority().cmp(&a.priority()));
}
