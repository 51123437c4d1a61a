use super::DirectDialer;
use crate::config::{DnsFallbackConfig, DnsTransport};
use crate::error::DialError;
use crate::flow::{FlowMeta, FlowState, FlowTracker, UdpFlow};
use crate::stats::EngineStats;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

const MAX_DNS_MESSAGE: usize = 65535;

/// Answers DNS-shaped UDP traffic when UDP proxying is disabled.
///
/// Only datagrams to the configured port that parse as a DNS query are
/// forwarded. A flow answers the queries queued on its 4-tuple when it
/// starts, one reply per query, then ends. Everything else is dropped.
#[derive(Clone)]
pub struct DnsFallbackHandler {
    dialer: Arc<dyn DirectDialer>,
    config: DnsFallbackConfig,
    stats: Arc<EngineStats>,
}

impl DnsFallbackHandler {
    pub fn new(dialer: Arc<dyn DirectDialer>, config: DnsFallbackConfig, stats: Arc<EngineStats>) -> Self {
        Self {
            dialer,
            config,
            stats,
        }
    }

    pub async fn handle_udp(&self, flow: UdpFlow, tracker: &mut FlowTracker) {
        let UdpFlow {
            meta,
            mut inbound,
            replier,
        } = flow;

        if meta.destination.port() != self.config.port {
            trace!("[dns-fallback] dropping non-DNS datagram {}", meta);
            self.stats.udp_dropped();
            tracker.transition(FlowState::Rejected);
            return;
        }

        let first = match tokio::time::timeout(self.config.timeout(), inbound.recv()).await {
            Ok(Some(query)) => query,
            _ => return,
        };
        // queries already queued on this 4-tuple belong to this flow; later
        // datagrams open a new one
        inbound.close();
        let mut queries = vec![first];
        while let Ok(query) = inbound.try_recv() {
            queries.push(query);
        }

        let mut answered = false;
        let mut failed = false;
        for query in queries {
            if !is_dns_query(&query) {
                debug!("[dns-fallback] dropping malformed DNS datagram {}", meta);
                self.stats.udp_dropped();
                continue;
            }
            if !answered && !failed {
                tracker.transition(FlowState::Active);
            }
            match self.answer(&meta, &query).await {
                Some(response) => {
                    if replier.send(response).await.is_ok() {
                        self.stats.dns_response();
                        trace!("[dns-fallback] answered {}", meta);
                    }
                    answered = true;
                }
                None => failed = true,
            }
        }

        if failed && !answered {
            tracker.transition(FlowState::DialFailed);
        } else if !failed && !answered {
            tracker.transition(FlowState::Rejected);
        }
    }

    /// Forward one query upstream, `None` when it fails or times out
    async fn answer(&self, meta: &FlowMeta, query: &[u8]) -> Option<Bytes> {
        let upstream = self.config.upstream.unwrap_or(meta.destination);
        self.stats.dns_query();
        match tokio::time::timeout(self.config.timeout(), self.forward(upstream, query)).await {
            Ok(Ok(response)) => Some(response),
            Ok(Err(e)) => {
                warn!("[dns-fallback] {} via {} failed: {}", meta, upstream, e);
                None
            }
            Err(_) => {
                warn!("[dns-fallback] {} via {} timed out", meta, upstream);
                None
            }
        }
    }

    async fn forward(&self, upstream: SocketAddr, query: &[u8]) -> Result<Bytes, DialError> {
        match self.config.transport {
            DnsTransport::Tcp => self.forward_tcp(upstream, query).await,
            DnsTransport::Udp => self.forward_udp(upstream, query).await,
        }
    }

    async fn forward_tcp(&self, upstream: SocketAddr, query: &[u8]) -> Result<Bytes, DialError> {
        let mut stream = self.dialer.dial_tcp(upstream, None).await?;

        let mut framed = Vec::with_capacity(query.len() + 2);
        framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
        framed.extend_from_slice(query);
        stream.write_all(&framed).await?;
        stream.flush().await?;

        let mut len = [0u8; 2];
        stream.read_exact(&mut len).await?;
        let len = u16::from_be_bytes(len) as usize;
        let mut response = vec![0u8; len];
        stream.read_exact(&mut response).await?;
        Ok(Bytes::from(response))
    }

    async fn forward_udp(&self, upstream: SocketAddr, query: &[u8]) -> Result<Bytes, DialError> {
        let conn = self.dialer.dial_udp(upstream, None).await?;
        conn.send(query).await?;
        let mut buf = vec![0u8; MAX_DNS_MESSAGE];
        let n = conn.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }
}

/// True when `payload` parses as a DNS query message
pub fn is_dns_query(payload: &[u8]) -> bool {
    if payload.len() > MAX_DNS_MESSAGE {
        return false;
    }
    match Message::from_vec(payload) {
        Ok(message) => message.message_type() == MessageType::Query,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};

    fn dns_query(name: &str) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(0x1234);
        message.set_message_type(MessageType::Query);
        message.set_recursion_desired(true);
        message.add_query(Query::query(Name::from_ascii(name).unwrap(), RecordType::A));
        message.to_vec().unwrap()
    }

    #[test]
    fn test_is_dns_query() {
        assert!(is_dns_query(&dns_query("example.com.")));
        assert!(!is_dns_query(b"hello"));
        assert!(!is_dns_query(&[]));

        let mut response = Message::from_vec(&dns_query("example.com.")).unwrap();
        response.set_message_type(MessageType::Response);
        assert!(!is_dns_query(&response.to_vec().unwrap()));
    }
}
