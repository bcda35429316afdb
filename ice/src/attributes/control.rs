use stun::attributes::{ATTR_ICE_CONTROLLED, ATTR_ICE_CONTROLLING};
use stun::checks::check_size;
use stun::message::{Getter, Message, Setter};

const TIE_BREAKER_SIZE: usize = 8;

/// ICE-CONTROLLING attribute: the controlling agent's tie-breaker.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct AttrControlling(pub u64);

impl Setter for AttrControlling {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_ICE_CONTROLLING, &self.0.to_be_bytes());
        Ok(())
    }
}

impl Getter for AttrControlling {
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_ICE_CONTROLLING)?;
        check_size(ATTR_ICE_CONTROLLING, v.len(), TIE_BREAKER_SIZE)?;
        self.0 = u64::from_be_bytes([v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7]]);
        Ok(())
    }
}

/// ICE-CONTROLLED attribute: the controlled agent's tie-breaker.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct AttrControlled(pub u64);

impl Setter for AttrControlled {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_ICE_CONTROLLED, &self.0.to_be_bytes());
        Ok(())
    }
}

impl Getter for AttrControlled {
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_ICE_CONTROLLED)?;
        check_size(ATTR_ICE_CONTROLLED, v.len(), TIE_BREAKER_SIZE)?;
        self.0 = u64::from_be_bytes([v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7]]);
        Ok(())
    }
}

#[cfg(test)]
mod control_test {
    use super::*;
    use stun::agent::TransactionId;
    use stun::message::BINDING_REQUEST;

    #[test]
    fn test_controlling_round_trip() -> Result<(), stun::Error> {
        let attr = AttrControlling(0xB000_0000_0000_0001);

        let mut m = Message::new();
        m.build(&[
            Box::new(TransactionId::new()),
            Box::new(BINDING_REQUEST),
            Box::new(attr),
        ])?;

        let mut decoded = Message::new();
        decoded.raw = m.raw.clone();
        decoded.decode()?;

        let mut got = AttrControlling::default();
        got.get_from(&decoded)?;
        assert_eq!(got, attr);
        Ok(())
    }
}
