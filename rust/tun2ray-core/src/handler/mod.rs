//! The three flow paths: proxy engine, direct/exception and DNS fallback.

mod direct;
mod dns;
mod proxy;

pub use direct::{DirectDialer, DirectHandler, SystemDialer};
pub use dns::DnsFallbackHandler;
pub use proxy::ProxyHandler;
