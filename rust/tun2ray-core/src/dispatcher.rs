//! Per-flow path selection.
//!
//! Routing is a pure function of the flow descriptor, the exception set and
//! the UDP-enabled flag, evaluated once when the flow is created. The
//! dispatcher then hands the flow to the chosen handler on its own task and
//! keeps nothing.

use crate::exception::ExceptionSet;
use crate::flow::{FlowMeta, FlowState, FlowTracker, Network, Path, TcpFlow, UdpFlow};
use crate::handler::{DirectHandler, DnsFallbackHandler, ProxyHandler};
use crate::process::ProcessResolver;
use crate::stack::FlowAcceptor;
use crate::stats::EngineStats;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpPath {
    Proxy,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpPath {
    Proxy,
    Direct,
    DnsFallback,
}

impl From<TcpPath> for Path {
    fn from(path: TcpPath) -> Self {
        match path {
            TcpPath::Proxy => Path::Proxy,
            TcpPath::Direct => Path::Direct,
        }
    }
}

impl From<UdpPath> for Path {
    fn from(path: UdpPath) -> Self {
        match path {
            UdpPath::Proxy => Path::Proxy,
            UdpPath::Direct => Path::Direct,
            UdpPath::DnsFallback => Path::DnsFallback,
        }
    }
}

fn is_excepted(meta: &FlowMeta, exceptions: &ExceptionSet) -> bool {
    meta.process
        .as_deref()
        .is_some_and(|process| exceptions.contains(process))
}

pub fn route_tcp(meta: &FlowMeta, exceptions: &ExceptionSet) -> TcpPath {
    if is_excepted(meta, exceptions) {
        TcpPath::Direct
    } else {
        TcpPath::Proxy
    }
}

pub fn route_udp(meta: &FlowMeta, exceptions: &ExceptionSet, udp_enabled: bool) -> UdpPath {
    if is_excepted(meta, exceptions) {
        UdpPath::Direct
    } else if udp_enabled {
        UdpPath::Proxy
    } else {
        UdpPath::DnsFallback
    }
}

struct Inner {
    exceptions: ExceptionSet,
    udp_enabled: bool,
    resolver: Option<Arc<dyn ProcessResolver>>,
    proxy: ProxyHandler,
    direct: DirectHandler,
    dns: DnsFallbackHandler,
    stats: Arc<EngineStats>,
    shutdown: CancellationToken,
}

/// Accepts flows from the stack and runs each on its own task
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

pub struct DispatcherBuilder {
    exceptions: ExceptionSet,
    udp_enabled: bool,
    resolver: Option<Arc<dyn ProcessResolver>>,
    stats: Arc<EngineStats>,
    shutdown: CancellationToken,
}

impl DispatcherBuilder {
    pub fn new(stats: Arc<EngineStats>, shutdown: CancellationToken) -> Self {
        Self {
            exceptions: ExceptionSet::default(),
            udp_enabled: true,
            resolver: None,
            stats,
            shutdown,
        }
    }

    pub fn exceptions(mut self, exceptions: ExceptionSet) -> Self {
        self.exceptions = exceptions;
        self
    }

    pub fn udp_enabled(mut self, enabled: bool) -> Self {
        self.udp_enabled = enabled;
        self
    }

    pub fn resolver(mut self, resolver: Option<Arc<dyn ProcessResolver>>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn build(self, proxy: ProxyHandler, direct: DirectHandler, dns: DnsFallbackHandler) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(Inner {
                exceptions: self.exceptions,
                udp_enabled: self.udp_enabled,
                resolver: self.resolver,
                proxy,
                direct,
                dns,
                stats: self.stats,
                shutdown: self.shutdown,
            }),
        }
    }
}

impl Inner {
    /// Fill in the owning process when the stack could not, and only when
    /// the answer can change the route.
    async fn identify(&self, meta: &mut FlowMeta) {
        if meta.process.is_some() || self.exceptions.is_empty() {
            return;
        }
        let Some(resolver) = self.resolver.clone() else {
            return;
        };
        let (network, source) = (meta.network, meta.source);
        match tokio::task::spawn_blocking(move || resolver.lookup(network, source)).await {
            Ok(process) => meta.process = process,
            Err(e) => debug!("Process lookup for {} failed: {}", source, e),
        }
    }

    async fn run_tcp(&self, mut flow: TcpFlow) {
        let mut tracker = FlowTracker::new(self.stats.clone());
        self.identify(&mut flow.meta).await;

        let path = route_tcp(&flow.meta, &self.exceptions);
        tracker.transition(FlowState::Dispatched(path.into()));
        trace!("{} -> {:?}", flow.meta, path);

        match path {
            TcpPath::Proxy => self.proxy.handle_tcp(flow, &mut tracker).await,
            TcpPath::Direct => self.direct.handle_tcp(flow, &mut tracker).await,
        }
    }

    async fn run_udp(&self, mut flow: UdpFlow) {
        let mut tracker = FlowTracker::new(self.stats.clone());
        self.identify(&mut flow.meta).await;

        let path = route_udp(&flow.meta, &self.exceptions, self.udp_enabled);
        tracker.transition(FlowState::Dispatched(path.into()));
        trace!("{} -> {:?}", flow.meta, path);

        match path {
            UdpPath::Proxy => self.proxy.handle_udp(flow, &mut tracker).await,
            UdpPath::Direct => self.direct.handle_udp(flow, &mut tracker).await,
            UdpPath::DnsFallback => self.dns.handle_udp(flow, &mut tracker).await,
        }
    }
}

impl FlowAcceptor for Dispatcher {
    fn accept_tcp(&self, flow: TcpFlow) {
        debug_assert_eq!(flow.meta.network, Network::Tcp);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let shutdown = inner.shutdown.clone();
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = inner.run_tcp(flow) => {}
            }
        });
    }

    fn accept_udp(&self, flow: UdpFlow) {
        debug_assert_eq!(flow.meta.network, Network::Udp);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let shutdown = inner.shutdown.clone();
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = inner.run_udp(flow) => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(process: Option<&str>) -> FlowMeta {
        let mut meta = FlowMeta::udp("10.0.89.2:5000".parse().unwrap(), "8.8.8.8:53".parse().unwrap());
        meta.process = process.map(str::to_string);
        meta
    }

    #[test]
    fn test_route_tcp() {
        let exceptions = ExceptionSet::new(["app1"]);
        let mut m = meta(Some("app1"));
        m.network = Network::Tcp;
        assert_eq!(route_tcp(&m, &exceptions), TcpPath::Direct);
        m.process = Some("app2".into());
        assert_eq!(route_tcp(&m, &exceptions), TcpPath::Proxy);
        m.process = None;
        assert_eq!(route_tcp(&m, &exceptions), TcpPath::Proxy);
    }

    #[test]
    fn test_route_udp() {
        let exceptions = ExceptionSet::new(["app1"]);
        assert_eq!(route_udp(&meta(Some("app1")), &exceptions, false), UdpPath::Direct);
        assert_eq!(route_udp(&meta(Some("app1")), &exceptions, true), UdpPath::Direct);
        assert_eq!(route_udp(&meta(None), &exceptions, true), UdpPath::Proxy);
        assert_eq!(route_udp(&meta(Some("app2")), &exceptions, false), UdpPath::DnsFallback);
    }
}
