//! Bridges a TUN device to a user-space proxy engine.
//!
//! Packets read from the device are reassembled by a user-space TCP/IP
//! stack into flows. Each flow is dispatched once to the proxy engine, to a
//! direct dial for excepted applications, or to the DNS fallback path when
//! UDP proxying is disabled.

pub mod config;
pub mod device;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod exception;
pub mod flow;
pub mod handler;
pub mod logging;
pub mod net;
pub mod process;
pub mod protect;
pub mod proxy;
pub mod relay;
pub mod sniff;
pub mod stack;
pub mod stats;

#[cfg(test)]
mod tests;

pub use config::{DnsFallbackConfig, DnsTransport, EngineConfig, TunConfig};
pub use engine::{Engine, EngineComponents};
pub use error::{
    ConfigError, DeviceError, DialError, EngineError, ShutdownError, StackError, StartError,
    StopError,
};
pub use logging::{init_logging, recent_logs, LogLevel};
pub use protect::{clear_protect_callback, has_protect_callback, set_protect_callback};
pub use proxy::BuiltinEngines;
pub use stack::SmoltcpStackProvider;
pub use stats::StatsSnapshot;

/// Components for a real deployment: smoltcp stack, bundled proxy engines,
/// OS sockets for direct dials and the platform process resolver.
pub fn default_components(device: std::sync::Arc<dyn device::DeviceFactory>) -> EngineComponents {
    EngineComponents::new(
        device,
        std::sync::Arc::new(SmoltcpStackProvider::default()),
        std::sync::Arc::new(BuiltinEngines),
    )
    .with_resolver(process::system_resolver())
}
