use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use stun::attributes::ATTR_XOR_RELAYED_ADDRESS;
use stun::message::{Getter, Message, Setter};
use stun::xoraddr::XorMappedAddress;

/// XOR-RELAYED-ADDRESS attribute: the relay transport address the server
/// allocated for this client.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RelayedAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl Default for RelayedAddress {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }
}

impl fmt::Display for RelayedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl From<RelayedAddress> for SocketAddr {
    fn from(addr: RelayedAddress) -> Self {
        SocketAddr::new(addr.ip, addr.port)
    }
}

impl Setter for RelayedAddress {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        let a = XorMappedAddress {
            ip: self.ip,
            port: self.port,
        };
        a.add_to_as(m, ATTR_XOR_RELAYED_ADDRESS)
    }
}

impl Getter for RelayedAddress {
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let mut a = XorMappedAddress::default();
        a.get_from_as(m, ATTR_XOR_RELAYED_ADDRESS)?;
        self.ip = a.ip;
        self.port = a.port;
        Ok(())
    }
}
