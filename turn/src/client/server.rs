use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Instant;

use shared::TransportProtocol;

use crate::proto::chandata::CHANNEL_DATA_HEADER_SIZE;
use crate::proto::chandata::MAX_CHANNEL_DATA_LENGTH;

/// Upper bound of the per-server stream read buffer: one maximal
/// CHANNEL-DATA frame plus its header.
pub(crate) const READ_BUFFER_LIMIT: usize = MAX_CHANNEL_DATA_LENGTH + CHANNEL_DATA_HEADER_SIZE;

/// One entry of the allocation trial list.
pub(crate) struct Server {
    pub(crate) addr: SocketAddr,
    pub(crate) protocol: TransportProtocol,
    /// Entries activate staggered; earlier entries get a head start.
    pub(crate) activate_after: Instant,
    pub(crate) tried: bool,
    pub(crate) failed: bool,
    /// TCP: connect was requested from the owner, link not up yet.
    pub(crate) awaiting_connect: bool,
    pub(crate) connected: bool,
    pub(crate) read_buffer: BytesMut,
}

impl Server {
    pub(crate) fn new(
        addr: SocketAddr,
        protocol: TransportProtocol,
        activate_after: Instant,
    ) -> Self {
        Self {
            addr,
            protocol,
            activate_after,
            tried: false,
            failed: false,
            awaiting_connect: false,
            connected: protocol == TransportProtocol::Udp,
            read_buffer: BytesMut::new(),
        }
    }

    pub(crate) fn is_udp(&self) -> bool {
        self.protocol == TransportProtocol::Udp
    }
}
