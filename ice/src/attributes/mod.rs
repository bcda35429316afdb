pub mod control;
pub mod priority;
pub mod use_candidate;

pub use control::{AttrControlled, AttrControlling};
pub use priority::PriorityAttr;
pub use use_candidate::UseCandidateAttr;
