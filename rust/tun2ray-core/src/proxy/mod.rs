//! Proxy engine seam.
//!
//! The bridge treats the proxy engine as a black box created from an opaque
//! configuration blob. It only needs outbound TCP streams and UDP datagram
//! channels towards a destination, plus a way to close the engine.

mod direct;
mod socks5;

pub use direct::DirectEngine;
pub use socks5::{Socks5Config, Socks5Engine};

use crate::error::{DialError, EngineError};
use crate::flow::{FlowMeta, FlowStream};
use crate::sniff::{SniffResult, SniffingPolicy};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Where an outbound connection should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Destination {
    pub fn port(&self) -> u16 {
        match self {
            Destination::Ip(addr) => addr.port(),
            Destination::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Ip(addr) => write!(f, "{}", addr),
            Destination::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Per-flow context handed to the proxy engine on every dial
#[derive(Debug, Clone)]
pub struct DialContext {
    pub meta: FlowMeta,
    pub sniffing: SniffingPolicy,
    pub sniffed: Option<SniffResult>,
}

impl DialContext {
    pub fn new(meta: FlowMeta, sniffing: SniffingPolicy) -> Self {
        Self {
            meta,
            sniffing,
            sniffed: None,
        }
    }

    /// Destination after applying a sniffed host name, if the policy allows it
    pub fn destination(&self) -> Destination {
        match &self.sniffed {
            Some(sniffed) if self.sniffing.allows(sniffed.protocol) => {
                Destination::Domain(sniffed.host.clone(), self.meta.destination.port())
            }
            _ => Destination::Ip(self.meta.destination),
        }
    }
}

/// Connected datagram channel to one remote endpoint
#[async_trait]
pub trait DatagramConn: Send + Sync {
    async fn send(&self, payload: &[u8]) -> io::Result<usize>;
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

#[async_trait]
impl DatagramConn for UdpSocket {
    async fn send(&self, payload: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, payload).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }
}

#[async_trait]
pub trait ProxyEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn dial_tcp(&self, ctx: &DialContext, dest: Destination) -> Result<FlowStream, DialError>;

    async fn dial_udp(
        &self,
        ctx: &DialContext,
        dest: Destination,
    ) -> Result<Box<dyn DatagramConn>, DialError>;

    /// Stop accepting dials. Outstanding connections die with the engine.
    async fn close(&self) -> Result<(), EngineError>;
}

/// Builds a proxy engine from its configuration blob
pub trait EngineProvider: Send + Sync {
    fn create(&self, blob: &str) -> Result<Arc<dyn ProxyEngine>, EngineError>;
}

#[derive(Debug, Deserialize)]
struct EngineHeader {
    #[serde(rename = "type")]
    kind: String,
}

/// Engines shipped with the crate, selected by the blob's `"type"` field
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinEngines;

impl EngineProvider for BuiltinEngines {
    fn create(&self, blob: &str) -> Result<Arc<dyn ProxyEngine>, EngineError> {
        let blob = blob.trim();
        if blob.is_empty() {
            return Err(EngineError::Config("empty proxy configuration".into()));
        }
        let header: EngineHeader = serde_json::from_str(blob)?;
        match header.kind.to_ascii_lowercase().as_str() {
            "socks5" | "socks" => {
                let config: Socks5Config = serde_json::from_str(blob)?;
                Ok(Arc::new(Socks5Engine::new(config)?))
            }
            "direct" | "freedom" => Ok(Arc::new(DirectEngine::new())),
            other => Err(EngineError::UnsupportedType(other.to_string())),
        }
    }
}

/// Resolve a destination to one socket address
pub(crate) async fn resolve(dest: &Destination) -> Result<SocketAddr, DialError> {
    match dest {
        Destination::Ip(addr) => Ok(*addr),
        Destination::Domain(host, port) => tokio::net::lookup_host((host.as_str(), *port))
            .await
            .map_err(|e| DialError::connect(dest, e))?
            .next()
            .ok_or_else(|| {
                DialError::connect(
                    dest,
                    io::Error::new(io::ErrorKind::NotFound, "no address for host"),
                )
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sniff::SniffProtocol;

    fn meta() -> FlowMeta {
        FlowMeta::tcp("10.0.89.2:40000".parse().unwrap(), "93.184.216.34:443".parse().unwrap())
    }

    #[test]
    fn test_destination_override() {
        let mut ctx = DialContext::new(
            meta(),
            SniffingPolicy {
                http: false,
                tls: true,
            },
        );
        assert_eq!(ctx.destination(), Destination::Ip("93.184.216.34:443".parse().unwrap()));

        ctx.sniffed = Some(SniffResult {
            protocol: SniffProtocol::Tls,
            host: "example.com".into(),
        });
        assert_eq!(ctx.destination(), Destination::Domain("example.com".into(), 443));

        ctx.sniffed = Some(SniffResult {
            protocol: SniffProtocol::Http,
            host: "example.com".into(),
        });
        assert_eq!(ctx.destination(), Destination::Ip("93.184.216.34:443".parse().unwrap()));
    }

    #[test]
    fn test_builtin_engines() {
        let engines = BuiltinEngines;
        let engine = engines
            .create(r#"{"type": "socks5", "server": "127.0.0.1", "port": 1080}"#)
            .unwrap();
        assert_eq!(engine.name(), "socks5");
        assert_eq!(engines.create(r#"{"type": "direct"}"#).unwrap().name(), "direct");

        assert!(matches!(engines.create(""), Err(EngineError::Config(_))));
        assert!(matches!(engines.create("{not json"), Err(EngineError::Config(_))));
        assert!(matches!(
            engines.create(r#"{"type": "vmess"}"#),
            Err(EngineError::UnsupportedType(_))
        ));
    }
}
