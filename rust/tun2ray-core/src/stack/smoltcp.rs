use super::{NetStack, StackHooks, StackProvider, UdpSessionTable};
use crate::error::StackError;
use crate::flow::{FlowMeta, TcpFlow, UdpReply};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use netstack_smoltcp::{AnyIpPktFrame, Stack, StackBuilder};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const REPLY_QUEUE: usize = 1024;

/// Builds [`SmoltcpStack`]s on top of `netstack-smoltcp`
#[derive(Debug, Clone)]
pub struct SmoltcpStackProvider {
    pub stack_buffer_size: usize,
    pub tcp_buffer_size: usize,
}

impl Default for SmoltcpStackProvider {
    fn default() -> Self {
        Self {
            stack_buffer_size: 1024,
            tcp_buffer_size: 512 * 1024,
        }
    }
}

impl StackProvider for SmoltcpStackProvider {
    fn build(&self, hooks: StackHooks, mtu: usize) -> Result<Arc<dyn NetStack>, StackError> {
        let stack = SmoltcpStack::new(self, hooks, mtu)?;
        Ok(Arc::new(stack))
    }
}

/// User-space TCP/IP stack driven by smoltcp.
///
/// Four background tasks run until [`NetStack::close`]: the smoltcp poll
/// runner, the packet output pump, the TCP accept loop and the UDP demux.
pub struct SmoltcpStack {
    sink: tokio::sync::Mutex<Option<SplitSink<Stack, AnyIpPktFrame>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sessions: Arc<UdpSessionTable>,
    shutdown: CancellationToken,
}

impl SmoltcpStack {
    fn new(provider: &SmoltcpStackProvider, hooks: StackHooks, mtu: usize) -> Result<Self, StackError> {
        let (stack, runner, udp_socket, tcp_listener) = StackBuilder::default()
            .enable_tcp(true)
            .enable_udp(true)
            .enable_icmp(true)
            .stack_buffer_size(provider.stack_buffer_size)
            .tcp_buffer_size(provider.tcp_buffer_size)
            .build()
            .map_err(|e| StackError::Build(e.to_string()))?;

        let tcp_listener =
            tcp_listener.ok_or_else(|| StackError::Build("TCP listener not enabled".into()))?;
        let udp_socket =
            udp_socket.ok_or_else(|| StackError::Build("UDP socket not enabled".into()))?;

        let shutdown = CancellationToken::new();
        let (reply_tx, mut reply_rx) = mpsc::channel::<UdpReply>(REPLY_QUEUE);
        let sessions = Arc::new(UdpSessionTable::new(reply_tx));
        let (sink, mut stream) = stack.split();
        let mut tasks = Vec::with_capacity(5);

        if let Some(runner) = runner {
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    result = runner => debug!("smoltcp runner exited: {:?}", result),
                }
            }));
        }

        // stack -> device, in production order
        let output = hooks.output.clone();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = token.cancelled() => break,
                    frame = stream.next() => frame,
                };
                match frame {
                    Some(Ok(frame)) => {
                        if let Err(e) = output.output(&frame).await {
                            trace!("Dropping stack output packet: {}", e);
                        }
                    }
                    Some(Err(e)) => warn!("Stack output error: {}", e),
                    None => break,
                }
            }
            debug!("Stack output task stopped");
        }));

        let acceptor = hooks.acceptor.clone();
        let token = shutdown.clone();
        let mut tcp_listener = tcp_listener;
        tasks.push(tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = tcp_listener.next() => accepted,
                };
                let Some((stream, local, remote)) = accepted else {
                    break;
                };
                let flow = TcpFlow::new(FlowMeta::tcp(local, remote), Box::new(stream))
                    .with_failure_hook(|meta, err| {
                        // dropping the accepted stream resets the connection towards the app
                        debug!("Resetting {}: {}", meta, err);
                    });
                acceptor.accept_tcp(flow);
            }
            debug!("Stack TCP accept task stopped");
        }));

        let (mut udp_read, mut udp_write) = udp_socket.split();
        let acceptor = hooks.acceptor.clone();
        let table = sessions.clone();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let datagram = tokio::select! {
                    _ = token.cancelled() => break,
                    datagram = udp_read.next() => datagram,
                };
                let Some((data, local, remote)) = datagram else {
                    break;
                };
                if data.len() > mtu {
                    trace!("Dropping oversized UDP datagram from {}", local);
                    continue;
                }
                table.dispatch(local, remote, Bytes::from(data), acceptor.as_ref());
            }
            debug!("Stack UDP read task stopped");
        }));

        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let reply = tokio::select! {
                    _ = token.cancelled() => break,
                    reply = reply_rx.recv() => reply,
                };
                let Some(reply) = reply else {
                    break;
                };
                if let Err(e) = udp_write.send((reply.payload.to_vec(), reply.from, reply.to)).await {
                    warn!("Stack UDP write error: {}", e);
                }
            }
            debug!("Stack UDP write task stopped");
        }));

        info!("smoltcp stack started (mtu {})", mtu);
        Ok(Self {
            sink: tokio::sync::Mutex::new(Some(sink)),
            tasks: Mutex::new(tasks),
            sessions,
            shutdown,
        })
    }
}

#[async_trait]
impl NetStack for SmoltcpStack {
    async fn input(&self, packet: &[u8]) -> Result<(), StackError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(StackError::Closed)?;
        sink.send(packet.to_vec()).await.map_err(StackError::Io)
    }

    async fn close(&self) -> Result<(), StackError> {
        self.shutdown.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.abort();
        }
        self.sessions.clear();
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            sink.close().await.map_err(StackError::Io)?;
            info!("smoltcp stack closed");
        }
        Ok(())
    }
}
