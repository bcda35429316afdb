use stun::attributes::ATTR_PRIORITY;
use stun::checks::check_size;
use stun::message::{Getter, Message, Setter};

const PRIORITY_SIZE: usize = 4;

/// PRIORITY attribute: the priority the sender assigns to the candidate a
/// connectivity check would discover.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct PriorityAttr(pub u32);

impl Setter for PriorityAttr {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_PRIORITY, &self.0.to_be_bytes());
        Ok(())
    }
}

impl Getter for PriorityAttr {
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_PRIORITY)?;
        check_size(ATTR_PRIORITY, v.len(), PRIORITY_SIZE)?;
        self.0 = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
        Ok(())
    }
}
