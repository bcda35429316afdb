#![warn(rust_2018_idioms)]

pub mod client;
pub mod proto;

pub use client::{Client, ClientConfig, ClientState, Event, DEFAULT_CHANNEL_RANGE};
