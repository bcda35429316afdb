use std::fmt;

use stun::attributes::ATTR_REQUESTED_TRANSPORT;
use stun::checks::check_size;
use stun::message::{Getter, Message, Setter};

/// UDP protocol number for REQUESTED-TRANSPORT.
pub const PROTO_UDP: Protocol = Protocol(17);
/// TCP protocol number for REQUESTED-TRANSPORT.
pub const PROTO_TCP: Protocol = Protocol(6);

const REQUESTED_TRANSPORT_SIZE: usize = 4;

/// IANA protocol number carried in REQUESTED-TRANSPORT.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct Protocol(pub u8);

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PROTO_UDP => write!(f, "UDP"),
            PROTO_TCP => write!(f, "TCP"),
            Protocol(other) => write!(f, "{other}"),
        }
    }
}

/// REQUESTED-TRANSPORT attribute: the transport of the relayed address.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct RequestedTransport {
    pub protocol: Protocol,
}

impl Setter for RequestedTransport {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        // protocol number followed by three RFFU bytes
        let v = [self.protocol.0, 0, 0, 0];
        m.add(ATTR_REQUESTED_TRANSPORT, &v);
        Ok(())
    }
}

impl Getter for RequestedTransport {
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_REQUESTED_TRANSPORT)?;
        check_size(ATTR_REQUESTED_TRANSPORT, v.len(), REQUESTED_TRANSPORT_SIZE)?;
        self.protocol = Protocol(v[0]);
        Ok(())
    }
}
