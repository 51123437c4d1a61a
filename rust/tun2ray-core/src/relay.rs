use crate::flow::UdpReplier;
use crate::proxy::DatagramConn;
use bytes::Bytes;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::trace;

const RELAY_BUFFER_SIZE: usize = 32 * 1024;
const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// Bytes moved in each direction by a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub upload: u64,
    pub download: u64,
}

/// Copy bytes both ways until each side has closed its write half.
///
/// `a` is the stack side, `b` the dialed side. Each direction preserves
/// its byte order and half-closes the peer on EOF.
pub async fn relay_bidirectional<A, B>(a: &mut A, b: &mut B) -> io::Result<RelayStats>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let a_to_b = copy_half(&mut ar, &mut bw);
    let b_to_a = copy_half(&mut br, &mut aw);

    let (upload, download) = tokio::join!(a_to_b, b_to_a);
    match (upload, download) {
        (Ok(upload), Ok(download)) => {
            trace!("Relay finished: {} bytes up, {} bytes down", upload, download);
            Ok(RelayStats { upload, download })
        }
        (Err(e), _) | (_, Err(e)) => Err(e),
    }
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if is_connection_closed(&e) => break,
            Err(e) => return Err(e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            if is_connection_closed(&e) {
                break;
            }
            return Err(e);
        }
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    Ok(total)
}

pub fn is_connection_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

/// Relay datagrams between a UDP flow and an upstream until the flow has
/// been idle for `idle_timeout` or either side goes away.
pub async fn relay_datagrams(
    inbound: &mut mpsc::Receiver<Bytes>,
    replier: &UdpReplier,
    upstream: &dyn DatagramConn,
    idle_timeout: Duration,
) -> io::Result<RelayStats> {
    let mut stats = RelayStats::default();
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        tokio::select! {
            datagram = inbound.recv() => {
                let Some(datagram) = datagram else {
                    break;
                };
                stats.upload += datagram.len() as u64;
                upstream.send(&datagram).await?;
            }
            received = upstream.recv(&mut buf) => {
                let n = received?;
                stats.download += n as u64;
                if replier.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(idle_timeout) => {
                trace!("UDP flow idle for {:?}, closing", idle_timeout);
                break;
            }
        }
    }
    Ok(stats)
}
