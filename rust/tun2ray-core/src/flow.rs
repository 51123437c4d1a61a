//! Flow descriptors handed from the stack to the dispatcher.
//!
//! A TCP flow owns the stack-side byte stream. A UDP flow owns a queue of
//! inbound datagrams for one 4-tuple plus a handle for writing replies back
//! into the stack.

use crate::error::DialError;
use crate::stats::EngineStats;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Trait alias for the byte streams carried by TCP flows and dials
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

pub type FlowStream = Box<dyn AsyncReadWrite>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Identity of a flow: protocol, endpoints and the originating process if known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMeta {
    pub network: Network,
    /// Local endpoint (the application inside the tunnel)
    pub source: SocketAddr,
    /// Remote endpoint the application addressed
    pub destination: SocketAddr,
    pub process: Option<String>,
}

impl FlowMeta {
    pub fn tcp(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            network: Network::Tcp,
            source,
            destination,
            process: None,
        }
    }

    pub fn udp(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            network: Network::Udp,
            source,
            destination,
            process: None,
        }
    }

    pub fn with_process<S: Into<String>>(mut self, process: S) -> Self {
        self.process = Some(process.into());
        self
    }
}

impl fmt::Display for FlowMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.network, self.source, self.destination)?;
        if let Some(process) = &self.process {
            write!(f, " ({})", process)?;
        }
        Ok(())
    }
}

type FailureHook = Box<dyn FnOnce(&FlowMeta, &DialError) + Send>;

/// A reassembled TCP connection accepted by the stack
pub struct TcpFlow {
    pub meta: FlowMeta,
    pub stream: FlowStream,
    on_failure: Option<FailureHook>,
}

impl TcpFlow {
    pub fn new(meta: FlowMeta, stream: FlowStream) -> Self {
        Self {
            meta,
            stream,
            on_failure: None,
        }
    }

    /// Register how the stack wants to hear about a failed outbound open.
    pub fn with_failure_hook<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&FlowMeta, &DialError) + Send + 'static,
    {
        self.on_failure = Some(Box::new(hook));
        self
    }

    /// Report a dial failure back to the stack and drop the stream.
    pub fn fail(mut self, err: &DialError) {
        debug!("TCP flow {} open failed: {}", self.meta, err);
        if let Some(hook) = self.on_failure.take() {
            hook(&self.meta, err);
        }
    }
}

impl fmt::Debug for TcpFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpFlow").field("meta", &self.meta).finish()
    }
}

/// A datagram written back into the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpReply {
    pub payload: Bytes,
    /// Remote endpoint the reply appears to come from
    pub from: SocketAddr,
    /// Local endpoint the reply is addressed to
    pub to: SocketAddr,
}

/// Write half of a UDP flow
#[derive(Clone, Debug)]
pub struct UdpReplier {
    tx: mpsc::Sender<UdpReply>,
    from: SocketAddr,
    to: SocketAddr,
}

impl UdpReplier {
    pub fn new(tx: mpsc::Sender<UdpReply>, meta: &FlowMeta) -> Self {
        Self {
            tx,
            from: meta.destination,
            to: meta.source,
        }
    }

    pub async fn send(&self, payload: Bytes) -> Result<(), DialError> {
        let reply = UdpReply {
            payload,
            from: self.from,
            to: self.to,
        };
        self.tx.send(reply).await.map_err(|_| {
            DialError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stack UDP writer closed",
            ))
        })
    }
}

/// A UDP soft session for one 4-tuple
#[derive(Debug)]
pub struct UdpFlow {
    pub meta: FlowMeta,
    pub inbound: mpsc::Receiver<Bytes>,
    pub replier: UdpReplier,
}

/// Per-flow lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Created,
    Dispatched(Path),
    Active,
    DialFailed,
    Rejected,
    Closed,
}

/// Path a flow was dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Path {
    Proxy,
    Direct,
    DnsFallback,
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Path::Proxy => write!(f, "proxy"),
            Path::Direct => write!(f, "direct"),
            Path::DnsFallback => write!(f, "dns-fallback"),
        }
    }
}

static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(1);

/// Follows one flow through its state machine. Dropping the tracker always
/// lands the flow in `Closed`, whichever way the flow task ends.
pub struct FlowTracker {
    id: u64,
    state: FlowState,
    stats: Arc<EngineStats>,
}

impl FlowTracker {
    pub fn new(stats: Arc<EngineStats>) -> Self {
        stats.flow_opened();
        let id = NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed);
        trace!(flow = id, "flow created");
        Self {
            id,
            state: FlowState::Created,
            stats,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn transition(&mut self, next: FlowState) {
        trace!(flow = self.id, "flow {:?} -> {:?}", self.state, next);
        match next {
            FlowState::Dispatched(path) => self.stats.record_path(path),
            FlowState::DialFailed => self.stats.record_dial_failure(),
            _ => {}
        }
        self.state = next;
    }
}

impl Drop for FlowTracker {
    fn drop(&mut self) {
        if self.state != FlowState::Closed {
            self.transition(FlowState::Closed);
        }
        self.stats.flow_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_tracker_closes_on_drop() {
        let stats = Arc::new(EngineStats::default());
        {
            let mut tracker = FlowTracker::new(stats.clone());
            tracker.transition(FlowState::Dispatched(Path::Direct));
            tracker.transition(FlowState::Active);
            assert_eq!(stats.snapshot().active_flows, 1);
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.active_flows, 0);
        assert_eq!(snapshot.direct_flows, 1);
    }

    #[test]
    fn test_fail_invokes_hook() {
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        let (stream, _peer) = tokio::io::duplex(64);
        let meta = FlowMeta::tcp(addr("10.0.89.2:40000"), addr("93.184.216.34:80"));
        let flow = TcpFlow::new(meta, Box::new(stream)).with_failure_hook(move |meta, err| {
            *seen_clone.lock().unwrap() = Some((meta.destination, err.to_string()));
        });

        flow.fail(&DialError::Timeout("93.184.216.34:80".into()));
        let seen = seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.0, addr("93.184.216.34:80"));
        assert!(seen.1.contains("timed out"));
    }

    #[tokio::test]
    async fn test_replier_swaps_endpoints() {
        let (tx, mut rx) = mpsc::channel(1);
        let meta = FlowMeta::udp(addr("10.0.89.2:5353"), addr("8.8.8.8:53"));
        let replier = UdpReplier::new(tx, &meta);
        replier.send(Bytes::from_static(b"hi")).await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.from, addr("8.8.8.8:53"));
        assert_eq!(reply.to, addr("10.0.89.2:5353"));
    }

    #[test]
    fn test_meta_display() {
        let meta =
            FlowMeta::tcp(addr("10.0.89.2:1"), addr("1.1.1.1:443")).with_process("app1");
        assert_eq!(meta.to_string(), "tcp 10.0.89.2:1 -> 1.1.1.1:443 (app1)");
    }
}
