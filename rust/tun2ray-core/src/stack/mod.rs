//! Reassembly stack seam.
//!
//! A stack consumes raw IP packets through [`NetStack::input`], writes the
//! packets it produces to a [`PacketOutput`], and reports new flows to a
//! [`FlowAcceptor`]. Both hooks are supplied when the stack is built.

mod smoltcp;
mod udp;

pub use self::smoltcp::{SmoltcpStack, SmoltcpStackProvider};
pub use self::udp::UdpSessionTable;

use crate::error::{DeviceError, StackError};
use crate::flow::{TcpFlow, UdpFlow};
use async_trait::async_trait;
use std::sync::Arc;

/// Sink for packets produced by the stack
#[async_trait]
pub trait PacketOutput: Send + Sync {
    async fn output(&self, packet: &[u8]) -> Result<usize, DeviceError>;
}

/// Receives every new flow the stack reassembles. Must not block.
pub trait FlowAcceptor: Send + Sync {
    fn accept_tcp(&self, flow: TcpFlow);
    fn accept_udp(&self, flow: UdpFlow);
}

#[async_trait]
pub trait NetStack: Send + Sync {
    /// Feed one packet read from the device
    async fn input(&self, packet: &[u8]) -> Result<(), StackError>;

    /// Stop the stack and drop every flow it still owns. Idempotent.
    async fn close(&self) -> Result<(), StackError>;
}

/// Callbacks wired into a stack at build time
#[derive(Clone)]
pub struct StackHooks {
    pub output: Arc<dyn PacketOutput>,
    pub acceptor: Arc<dyn FlowAcceptor>,
}

pub trait StackProvider: Send + Sync {
    /// Build a running stack. Called from inside the tokio runtime.
    fn build(&self, hooks: StackHooks, mtu: usize) -> Result<Arc<dyn NetStack>, StackError>;
}
