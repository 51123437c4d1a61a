use crate::flow::{FlowState, FlowTracker, TcpFlow, UdpFlow};
use crate::proxy::{DialContext, ProxyEngine};
use crate::relay::{relay_bidirectional, relay_datagrams};
use crate::sniff::SniffingPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

const SNIFF_TIMEOUT: Duration = Duration::from_millis(300);
const SNIFF_BUFFER_SIZE: usize = 4096;

/// Forwards flows to the proxy engine
#[derive(Clone)]
pub struct ProxyHandler {
    engine: Arc<dyn ProxyEngine>,
    sniffing: SniffingPolicy,
    udp_timeout: Duration,
}

impl ProxyHandler {
    pub fn new(engine: Arc<dyn ProxyEngine>, sniffing: SniffingPolicy, udp_timeout: Duration) -> Self {
        Self {
            engine,
            sniffing,
            udp_timeout,
        }
    }

    pub async fn handle_tcp(&self, flow: TcpFlow, tracker: &mut FlowTracker) {
        let mut flow = flow;
        let mut ctx = DialContext::new(flow.meta.clone(), self.sniffing);

        // Bytes read while sniffing are replayed upstream before relaying
        let mut peeked = Vec::new();
        if self.sniffing.is_enabled() {
            let mut buf = vec![0u8; SNIFF_BUFFER_SIZE];
            match tokio::time::timeout(SNIFF_TIMEOUT, flow.stream.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    trace!("[proxy] {} closed before sending data", flow.meta);
                    return;
                }
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    ctx.sniffed = self.sniffing.sniff(&buf);
                    peeked = buf;
                }
                Ok(Err(e)) => {
                    debug!("[proxy] {} read error while sniffing: {}", flow.meta, e);
                    return;
                }
                // server-speaks-first protocols send nothing
                Err(_) => {}
            }
        }

        let dest = ctx.destination();
        if let Some(sniffed) = &ctx.sniffed {
            debug!("[proxy] {} sniffed {} host {}", flow.meta, sniffed.protocol, sniffed.host);
        }

        let mut upstream = match self.engine.dial_tcp(&ctx, dest.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("[proxy:{}] {} -> {} failed: {}", self.engine.name(), flow.meta, dest, e);
                tracker.transition(FlowState::DialFailed);
                flow.fail(&e);
                return;
            }
        };
        tracker.transition(FlowState::Active);
        debug!("[proxy:{}] {} -> {}", self.engine.name(), flow.meta, dest);

        if !peeked.is_empty() {
            if let Err(e) = upstream.write_all(&peeked).await {
                debug!("[proxy] {} failed to replay sniffed bytes: {}", flow.meta, e);
                return;
            }
        }

        let TcpFlow { meta, mut stream, .. } = flow;
        match relay_bidirectional(&mut stream, &mut upstream).await {
            Ok(stats) => debug!(
                "[proxy] {} closed ({} up, {} down)",
                meta,
                stats.upload + peeked.len() as u64,
                stats.download
            ),
            Err(e) => debug!("[proxy] {} relay error: {}", meta, e),
        }
    }

    pub async fn handle_udp(&self, flow: UdpFlow, tracker: &mut FlowTracker) {
        let UdpFlow {
            meta,
            mut inbound,
            replier,
        } = flow;
        let ctx = DialContext::new(meta.clone(), self.sniffing);
        let dest = ctx.destination();
        let upstream = match self.engine.dial_udp(&ctx, dest.clone()).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("[proxy:{}] {} -> {} failed: {}", self.engine.name(), meta, dest, e);
                tracker.transition(FlowState::DialFailed);
                return;
            }
        };
        tracker.transition(FlowState::Active);
        if let Err(e) =
            relay_datagrams(&mut inbound, &replier, upstream.as_ref(), self.udp_timeout).await
        {
            debug!("[proxy] {} relay error: {}", meta, e);
        }
    }
}
