use stun::attributes::ATTR_USE_CANDIDATE;
use stun::message::{Message, Setter};

/// USE-CANDIDATE attribute: flag the controlling agent sets to nominate the
/// pair the check runs on. Carries no value.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct UseCandidateAttr;

impl UseCandidateAttr {
    pub fn new() -> Self {
        Self
    }

    pub fn is_set(m: &Message) -> bool {
        m.contains(ATTR_USE_CANDIDATE)
    }
}

impl Setter for UseCandidateAttr {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_USE_CANDIDATE, &[]);
        Ok(())
    }
}
