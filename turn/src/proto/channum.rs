use std::fmt;

use stun::attributes::ATTR_CHANNEL_NUMBER;
use stun::checks::check_size;
use stun::message::{Getter, Message, Setter};

/// Start of the channel number range usable for CHANNEL-DATA (RFC 5766 §11).
pub const MIN_CHANNEL_NUMBER: u16 = 0x4000;
/// End of the channel number range usable for CHANNEL-DATA (RFC 5766 §11).
pub const MAX_CHANNEL_NUMBER: u16 = 0x7FFF;

const CHANNEL_NUMBER_SIZE: usize = 4;

/// CHANNEL-NUMBER attribute: the 16-bit shorthand bound to a peer address.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone, Hash, PartialOrd, Ord)]
pub struct ChannelNumber(pub u16);

impl fmt::Display for ChannelNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl ChannelNumber {
    /// Whether the number lies in the RFC 5766 CHANNEL-DATA range.
    pub fn is_valid(&self) -> bool {
        (MIN_CHANNEL_NUMBER..=MAX_CHANNEL_NUMBER).contains(&self.0)
    }
}

impl Setter for ChannelNumber {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        let mut v = vec![0; CHANNEL_NUMBER_SIZE];
        // the lower two bytes are RFFU and must be zero
        v[..2].copy_from_slice(&self.0.to_be_bytes());
        m.add(ATTR_CHANNEL_NUMBER, &v);
        Ok(())
    }
}

impl Getter for ChannelNumber {
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_CHANNEL_NUMBER)?;
        check_size(ATTR_CHANNEL_NUMBER, v.len(), CHANNEL_NUMBER_SIZE)?;
        self.0 = u16::from_be_bytes([v[0], v[1]]);
        Ok(())
    }
}
