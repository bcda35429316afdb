#![warn(rust_2018_idioms)]

pub mod error;
mod transport;
pub mod util;

pub use transport::{
    FourTuple, TaggedBytesMut, TransportContext, TransportMessage, TransportProtocol,
};
