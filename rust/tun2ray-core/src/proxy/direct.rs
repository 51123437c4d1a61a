use super::{resolve, DatagramConn, Destination, DialContext, ProxyEngine};
use crate::error::{DialError, EngineError};
use crate::flow::FlowStream;
use crate::net::{connect_tcp, connect_udp, DEFAULT_CONNECT_TIMEOUT};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Engine that dials every destination itself
#[derive(Debug, Default)]
pub struct DirectEngine {
    closed: AtomicBool,
}

impl DirectEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), DialError> {
        if self.closed.load(Ordering::Acquire) {
            Err(DialError::EngineClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ProxyEngine for DirectEngine {
    fn name(&self) -> &str {
        "direct"
    }

    async fn dial_tcp(&self, ctx: &DialContext, dest: Destination) -> Result<FlowStream, DialError> {
        self.ensure_open()?;
        let target = resolve(&dest).await?;
        debug!("direct engine: {} -> {} ({})", ctx.meta.source, dest, target);
        let stream = connect_tcp(target, None, DEFAULT_CONNECT_TIMEOUT).await?;
        Ok(Box::new(stream))
    }

    async fn dial_udp(
        &self,
        _ctx: &DialContext,
        dest: Destination,
    ) -> Result<Box<dyn DatagramConn>, DialError> {
        self.ensure_open()?;
        let target = resolve(&dest).await?;
        Ok(Box::new(connect_udp(target, None).await?))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowMeta;
    use crate::sniff::SniffingPolicy;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_closed_engine_refuses_dials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let engine = DirectEngine::new();
        let ctx = DialContext::new(
            FlowMeta::tcp("10.0.89.2:1".parse().unwrap(), target),
            SniffingPolicy::disabled(),
        );

        assert!(engine.dial_tcp(&ctx, Destination::Ip(target)).await.is_ok());
        engine.close().await.unwrap();
        assert!(matches!(
            engine.dial_tcp(&ctx, Destination::Ip(target)).await,
            Err(DialError::EngineClosed)
        ));
    }
}
