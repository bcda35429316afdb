use bytes::BytesMut;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

/// Type of transport protocol, either UDP or TCP.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportProtocol {
    /// UDP
    #[default]
    Udp,
    /// TCP
    Tcp,
}

/// Transport context with local address, peer address and protocol.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportContext {
    /// Local socket address, either IPv4 or IPv6
    pub local_addr: SocketAddr,
    /// Peer socket address, either IPv4 or IPv6
    pub peer_addr: SocketAddr,
    /// Type of transport protocol, either UDP or TCP
    pub protocol: TransportProtocol,
}

impl Default for TransportContext {
    fn default() -> Self {
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        Self {
            local_addr: unspecified,
            peer_addr: unspecified,
            protocol: TransportProtocol::Udp,
        }
    }
}

/// A generic inbound/outbound message tagged with its [TransportContext].
#[derive(Debug, Clone)]
pub struct TransportMessage<T> {
    /// Received/sent time
    pub now: Instant,
    /// Where the message came from / is going to
    pub transport: TransportContext,
    /// Message body
    pub message: T,
}

/// [BytesMut] message tagged with its [TransportContext].
pub type TaggedBytesMut = TransportMessage<BytesMut>;

/// Local address and peer address; the demultiplexing key of a route.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FourTuple {
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

impl FourTuple {
    pub fn new(local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            peer_addr,
        }
    }
}

impl From<&TransportContext> for FourTuple {
    fn from(value: &TransportContext) -> Self {
        Self {
            local_addr: value.local_addr,
            peer_addr: value.peer_addr,
        }
    }
}
