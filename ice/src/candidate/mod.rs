#[cfg(test)]
mod candidate_pair_test;
#[cfg(test)]
mod candidate_test;

pub mod candidate_pair;

use crc::{Crc, CRC_32_ISCSI};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;

pub(crate) const DEFAULT_LOCAL_PREFERENCE: u16 = 65535;

/// Candidates carry component 1 unless the caller says otherwise.
pub(crate) const DEFAULT_COMPONENT: u16 = 1;

/// Provenance of a transport address a peer may be reached on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CandidateType {
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "srflx")]
    ServerReflexive,
    #[serde(rename = "prflx")]
    PeerReflexive,
    #[serde(rename = "relay")]
    Relay,
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        };
        write!(f, "{s}")
    }
}

impl CandidateType {
    /// Type preference per RFC 5245 4.1.2.2: 126 for host, 110 for peer
    /// reflexive, 100 for server reflexive, 0 for relayed.
    #[must_use]
    pub const fn preference(self) -> u16 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay => 0,
        }
    }
}

/// An ICE candidate: a transport address plus provenance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub candidate_type: CandidateType,
    pub addr: SocketAddr,
    /// The local host address underneath reflexive/relayed candidates;
    /// decides which local socket sends for this candidate.
    pub related_addr: Option<SocketAddr>,
    pub component: u16,
    pub local_preference: u16,
    /// Explicit priority; zero means "compute from type and preference".
    pub priority_override: u32,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.related_addr {
            Some(related) => write!(
                f,
                "{} {} related {}",
                self.candidate_type, self.addr, related
            ),
            None => write!(f, "{} {}", self.candidate_type, self.addr),
        }
    }
}

impl Candidate {
    pub fn host(addr: SocketAddr, local_preference: u16) -> Self {
        Self {
            candidate_type: CandidateType::Host,
            addr,
            related_addr: None,
            component: DEFAULT_COMPONENT,
            local_preference,
            priority_override: 0,
        }
    }

    pub fn server_reflexive(addr: SocketAddr, base: SocketAddr, local_preference: u16) -> Self {
        Self {
            candidate_type: CandidateType::ServerReflexive,
            addr,
            related_addr: Some(base),
            component: DEFAULT_COMPONENT,
            local_preference,
            priority_override: 0,
        }
    }

    pub fn peer_reflexive(addr: SocketAddr, base: SocketAddr, priority: u32) -> Self {
        Self {
            candidate_type: CandidateType::PeerReflexive,
            addr,
            related_addr: Some(base),
            component: DEFAULT_COMPONENT,
            local_preference: DEFAULT_LOCAL_PREFERENCE,
            priority_override: priority,
        }
    }

    pub fn relayed(addr: SocketAddr, base: SocketAddr, local_preference: u16) -> Self {
        Self {
            candidate_type: CandidateType::Relay,
            addr,
            related_addr: Some(base),
            component: DEFAULT_COMPONENT,
            local_preference,
            priority_override: 0,
        }
    }

    /// A remote candidate known only by its advertised address/priority.
    pub fn remote(candidate_type: CandidateType, addr: SocketAddr, priority: u32) -> Self {
        Self {
            candidate_type,
            addr,
            related_addr: None,
            component: DEFAULT_COMPONENT,
            local_preference: DEFAULT_LOCAL_PREFERENCE,
            priority_override: priority,
        }
    }

    /// RFC 5245 4.1.2.1:
    /// priority = 2^24 * type-pref + 2^8 * local-pref + (256 - component)
    pub fn priority(&self) -> u32 {
        if self.priority_override != 0 {
            return self.priority_override;
        }
        (1 << 24) * u32::from(self.candidate_type.preference())
            + (1 << 8) * u32::from(self.local_preference)
            + (256 - u32::from(self.component))
    }

    /// The local host address this candidate sends from.
    pub fn base(&self) -> SocketAddr {
        self.related_addr.unwrap_or(self.addr)
    }

    /// Grouping key of the freezing algorithm: candidates with the same
    /// type, base address and transport share a foundation.
    pub fn foundation(&self) -> String {
        let mut buf = vec![];
        buf.extend_from_slice(self.candidate_type.to_string().as_bytes());
        buf.extend_from_slice(self.base().ip().to_string().as_bytes());
        buf.extend_from_slice(b"udp");

        let checksum = Crc::<u32>::new(&CRC_32_ISCSI).checksum(&buf);
        format!("{checksum}")
    }

    pub fn equal(&self, other: &Candidate) -> bool {
        self.candidate_type == other.candidate_type
            && self.addr == other.addr
            && self.related_addr == other.related_addr
    }
}
