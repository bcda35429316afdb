#![warn(rust_2018_idioms)]

mod monitor;
mod query;

pub use monitor::{DnsConfig, DnsEvent, DnsMonitor, QueryId};
pub use query::{
    order_srv_records, AddressResult, DnsAnswer, SrvFallback, SrvLookupOptions, SrvRecord,
    SrvResult,
};
