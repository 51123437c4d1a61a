use super::FlowAcceptor;
use crate::flow::{FlowMeta, UdpFlow, UdpReplier, UdpReply};
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::trace;

const SESSION_QUEUE: usize = 64;
const PURGE_THRESHOLD: usize = 1024;

/// Splits a stack's flat datagram stream into per-4-tuple UDP flows.
///
/// A session lives as long as its flow task holds the receiving end. The
/// first datagram for an unknown or finished 4-tuple opens a new flow.
pub struct UdpSessionTable {
    sessions: DashMap<(SocketAddr, SocketAddr), mpsc::Sender<Bytes>>,
    reply_tx: mpsc::Sender<UdpReply>,
}

impl UdpSessionTable {
    pub fn new(reply_tx: mpsc::Sender<UdpReply>) -> Self {
        Self {
            sessions: DashMap::new(),
            reply_tx,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Route one datagram from `source` to `destination`.
    pub fn dispatch(
        &self,
        source: SocketAddr,
        destination: SocketAddr,
        payload: Bytes,
        acceptor: &dyn FlowAcceptor,
    ) {
        self.dispatch_meta(FlowMeta::udp(source, destination), payload, acceptor)
    }

    /// Same as [`dispatch`](Self::dispatch) for stacks that know the owning process.
    pub fn dispatch_meta(&self, meta: FlowMeta, payload: Bytes, acceptor: &dyn FlowAcceptor) {
        let key = (meta.source, meta.destination);
        let payload = match self.sessions.get(&key) {
            Some(tx) => match tx.try_send(payload) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    trace!("UDP session {} -> {} queue full, dropping datagram", key.0, key.1);
                    return;
                }
                Err(TrySendError::Closed(payload)) => payload,
            },
            None => payload,
        };
        self.open_session(meta, payload, acceptor);
    }

    fn open_session(&self, meta: FlowMeta, payload: Bytes, acceptor: &dyn FlowAcceptor) {
        if self.sessions.len() >= PURGE_THRESHOLD {
            self.sessions.retain(|_, tx| !tx.is_closed());
        }
        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        // fresh channel with free capacity
        let _ = tx.try_send(payload);
        self.sessions.insert((meta.source, meta.destination), tx);
        let replier = UdpReplier::new(self.reply_tx.clone(), &meta);
        acceptor.accept_udp(UdpFlow {
            meta,
            inbound: rx,
            replier,
        });
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }
}
