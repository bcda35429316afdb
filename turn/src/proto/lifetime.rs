use std::fmt;
use std::time::Duration;

use stun::attributes::ATTR_LIFETIME;
use stun::checks::check_size;
use stun::message::{Getter, Message, Setter};

/// Allocation lifetime granted by the server by default.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(10 * 60);

const LIFETIME_SIZE: usize = 4;

/// LIFETIME attribute: allocation duration in seconds.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct Lifetime(pub Duration);

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0.as_secs())
    }
}

impl Setter for Lifetime {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        let v = (self.0.as_secs() as u32).to_be_bytes();
        m.add(ATTR_LIFETIME, &v);
        Ok(())
    }
}

impl Getter for Lifetime {
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_LIFETIME)?;
        check_size(ATTR_LIFETIME, v.len(), LIFETIME_SIZE)?;
        let seconds = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
        self.0 = Duration::from_secs(u64::from(seconds));
        Ok(())
    }
}

#[cfg(test)]
mod lifetime_test {
    use super::*;
    use stun::agent::TransactionId;
    use stun::message::BINDING_REQUEST;

    #[test]
    fn test_lifetime_round_trip() -> Result<(), stun::Error> {
        let lifetime = Lifetime(Duration::from_secs(600));

        let mut m = Message::new();
        m.build(&[
            Box::new(TransactionId::new()),
            Box::new(BINDING_REQUEST),
            Box::new(lifetime),
        ])?;

        let mut decoded = Message::new();
        decoded.raw = m.raw.clone();
        decoded.decode()?;

        let mut got = Lifetime::default();
        got.get_from(&decoded)?;
        assert_eq!(got, lifetime);
        Ok(())
    }
}
