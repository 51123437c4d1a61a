use crate::error::DialError;
use crate::flow::{FlowState, FlowStream, FlowTracker, TcpFlow, UdpFlow};
use crate::net::{connect_tcp, connect_udp, DEFAULT_CONNECT_TIMEOUT};
use crate::proxy::DatagramConn;
use crate::relay::{relay_bidirectional, relay_datagrams};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Opens sockets that bypass the proxy engine
#[async_trait]
pub trait DirectDialer: Send + Sync {
    async fn dial_tcp(
        &self,
        target: SocketAddr,
        send_through: Option<SocketAddr>,
    ) -> Result<FlowStream, DialError>;

    async fn dial_udp(
        &self,
        target: SocketAddr,
        send_through: Option<SocketAddr>,
    ) -> Result<Box<dyn DatagramConn>, DialError>;
}

/// Dials with protected OS sockets
#[derive(Debug, Clone, Copy)]
pub struct SystemDialer {
    pub connect_timeout: Duration,
}

impl Default for SystemDialer {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[async_trait]
impl DirectDialer for SystemDialer {
    async fn dial_tcp(
        &self,
        target: SocketAddr,
        send_through: Option<SocketAddr>,
    ) -> Result<FlowStream, DialError> {
        let stream = connect_tcp(target, send_through, self.connect_timeout).await?;
        Ok(Box::new(stream))
    }

    async fn dial_udp(
        &self,
        target: SocketAddr,
        send_through: Option<SocketAddr>,
    ) -> Result<Box<dyn DatagramConn>, DialError> {
        Ok(Box::new(connect_udp(target, send_through).await?))
    }
}

/// Carries excepted flows straight to their destination
#[derive(Clone)]
pub struct DirectHandler {
    dialer: Arc<dyn DirectDialer>,
    send_through: Option<SocketAddr>,
    udp_timeout: Duration,
}

impl DirectHandler {
    pub fn new(
        dialer: Arc<dyn DirectDialer>,
        send_through: Option<SocketAddr>,
        udp_timeout: Duration,
    ) -> Self {
        Self {
            dialer,
            send_through,
            udp_timeout,
        }
    }

    pub async fn handle_tcp(&self, flow: TcpFlow, tracker: &mut FlowTracker) {
        let target = flow.meta.destination;
        let mut upstream = match self.dialer.dial_tcp(target, self.send_through).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("[direct] {} dial failed: {}", flow.meta, e);
                tracker.transition(FlowState::DialFailed);
                flow.fail(&e);
                return;
            }
        };
        tracker.transition(FlowState::Active);
        debug!("[direct] {} connected", flow.meta);

        let TcpFlow { meta, mut stream, .. } = flow;
        match relay_bidirectional(&mut stream, &mut upstream).await {
            Ok(stats) => debug!(
                "[direct] {} closed ({} up, {} down)",
                meta, stats.upload, stats.download
            ),
            Err(e) => debug!("[direct] {} relay error: {}", meta, e),
        }
    }

    pub async fn handle_udp(&self, flow: UdpFlow, tracker: &mut FlowTracker) {
        let UdpFlow {
            meta,
            mut inbound,
            replier,
        } = flow;
        let upstream = match self.dialer.dial_udp(meta.destination, self.send_through).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("[direct] {} dial failed: {}", meta, e);
                tracker.transition(FlowState::DialFailed);
                return;
            }
        };
        tracker.transition(FlowState::Active);
        if let Err(e) =
            relay_datagrams(&mut inbound, &replier, upstream.as_ref(), self.udp_timeout).await
        {
            debug!("[direct] {} relay error: {}", meta, e);
        }
    }
}
