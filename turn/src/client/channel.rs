use rand::Rng;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use stun::agent::TransactionId;

/// Channel bindings last ten minutes on the server; the client re-binds a
/// minute earlier and tears down bindings idle for the full lifetime.
pub(crate) const CHANNEL_REFRESH_INTERVAL: Duration = Duration::from_secs(9 * 60);
pub(crate) const CHANNEL_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Attempts made to find a free random number inside the configured range.
const CHANNEL_PICK_ATTEMPTS: usize = 100;

pub(crate) struct Channel {
    pub(crate) peer: SocketAddr,
    pub(crate) number: u16,
    pub(crate) bound: bool,
    pub(crate) bind_tx: Option<TransactionId>,
    pub(crate) last_sent_at: Instant,
    pub(crate) refreshed_at: Instant,
}

/// Channel bindings keyed by peer IP with a reverse number index.
#[derive(Default)]
pub(crate) struct ChannelMap {
    by_ip: HashMap<IpAddr, Channel>,
    by_number: HashMap<u16, IpAddr>,
}

impl ChannelMap {
    pub(crate) fn new() -> Self {
        Self {
            by_ip: HashMap::new(),
            by_number: HashMap::new(),
        }
    }

    /// Picks an unused number uniformly at random inside `range`.
    pub(crate) fn random_free_number(&self, range: (u16, u16)) -> Option<u16> {
        let mut rng = rand::rng();
        for _ in 0..CHANNEL_PICK_ATTEMPTS {
            let number = rng.random_range(range.0..=range.1);
            if !self.by_number.contains_key(&number) {
                return Some(number);
            }
        }
        None
    }

    pub(crate) fn insert(&mut self, peer: SocketAddr, number: u16, now: Instant) -> &mut Channel {
        let ip = peer.ip();
        self.by_number.insert(number, ip);
        self.by_ip.entry(ip).or_insert(Channel {
            peer,
            number,
            bound: false,
            bind_tx: None,
            last_sent_at: now,
            refreshed_at: now,
        })
    }

    pub(crate) fn get(&self, peer: &IpAddr) -> Option<&Channel> {
        self.by_ip.get(peer)
    }

    pub(crate) fn get_mut(&mut self, peer: &IpAddr) -> Option<&mut Channel> {
        self.by_ip.get_mut(peer)
    }

    pub(crate) fn peer_by_number(&self, number: u16) -> Option<SocketAddr> {
        self.by_number
            .get(&number)
            .and_then(|ip| self.by_ip.get(ip))
            .map(|channel| channel.peer)
    }

    pub(crate) fn contains_number(&self, number: u16) -> bool {
        self.by_number.contains_key(&number)
    }

    pub(crate) fn remove(&mut self, peer: &IpAddr) -> Option<Channel> {
        let channel = self.by_ip.remove(peer)?;
        self.by_number.remove(&channel.number);
        Some(channel)
    }

    pub(crate) fn ips(&self) -> Vec<IpAddr> {
        self.by_ip.keys().copied().collect()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (&IpAddr, &mut Channel)> {
        self.by_ip.iter_mut()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_ip.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.by_ip.clear();
        self.by_number.clear();
    }
}
