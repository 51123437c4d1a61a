use crate::error::DialError;
use crate::protect::protect_socket;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn domain_for(addr: &SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

/// Source address to bind for `target`, if the send-through address has a
/// matching family. A mismatched family falls back to the default route.
fn bind_addr_for(target: &SocketAddr, send_through: Option<SocketAddr>) -> Option<SocketAddr> {
    let bind = send_through?;
    if bind.is_ipv4() == target.is_ipv4() {
        Some(bind)
    } else {
        debug!(
            "Send-through address {} does not match family of {}, using default route",
            bind, target
        );
        None
    }
}

/// Dial `target` over TCP from a protected socket, optionally bound to the
/// send-through address.
pub async fn connect_tcp(
    target: SocketAddr,
    send_through: Option<SocketAddr>,
    timeout: Duration,
) -> Result<TcpStream, DialError> {
    let socket = Socket::new(domain_for(&target), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| DialError::connect(target, e))?;

    if !protect_socket(&socket) {
        warn!("Failed to protect socket for {}, connection may loop", target);
    }

    if let Some(bind) = bind_addr_for(&target, send_through) {
        socket
            .bind(&SockAddr::from(bind))
            .map_err(|e| DialError::connect(target, e))?;
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| DialError::connect(target, e))?;
    match socket.connect(&SockAddr::from(target)) {
        Ok(()) => {}
        Err(e) if in_progress(&e) => {}
        Err(e) => return Err(DialError::connect(target, e)),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream).map_err(|e| DialError::connect(target, e))?;

    let connected = tokio::time::timeout(timeout, stream.writable()).await;
    match connected {
        Err(_) => return Err(DialError::Timeout(target.to_string())),
        Ok(Err(e)) => return Err(DialError::connect(target, e)),
        Ok(Ok(())) => {}
    }
    if let Some(e) = stream.take_error().map_err(|e| DialError::connect(target, e))? {
        return Err(DialError::connect(target, e));
    }
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

fn in_progress(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(libc::EINPROGRESS)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Bind a protected UDP socket suitable for talking to `target` and
/// connect it there.
pub async fn connect_udp(
    target: SocketAddr,
    send_through: Option<SocketAddr>,
) -> Result<UdpSocket, DialError> {
    let socket = Socket::new(domain_for(&target), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| DialError::connect(target, e))?;

    if !protect_socket(&socket) {
        warn!("Failed to protect UDP socket for {}, traffic may loop", target);
    }

    let bind = match bind_addr_for(&target, send_through) {
        // send-through ports only apply to TCP; UDP sessions take an ephemeral port
        Some(bind) => SocketAddr::new(bind.ip(), 0),
        None => SocketAddr::new(unspecified_for(&target), 0),
    };
    socket
        .bind(&SockAddr::from(bind))
        .map_err(|e| DialError::connect(target, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| DialError::connect(target, e))?;

    let std_socket: std::net::UdpSocket = socket.into();
    let udp = UdpSocket::from_std(std_socket).map_err(|e| DialError::connect(target, e))?;
    udp.connect(target)
        .await
        .map_err(|e| DialError::connect(target, e))?;
    Ok(udp)
}

fn unspecified_for(target: &SocketAddr) -> IpAddr {
    if target.is_ipv4() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_tcp_with_send_through() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut sock, peer) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            (peer, buf)
        });

        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut stream = connect_tcp(target, Some(bind), DEFAULT_CONNECT_TIMEOUT)
            .await
            .unwrap();
        stream.write_all(b"hello").await.unwrap();

        let (peer, buf) = accept.await.unwrap();
        assert_eq!(peer.ip(), bind.ip());
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_connect_tcp_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let target = listener.local_addr().unwrap();
        drop(listener);

        let err = connect_tcp(target, None, DEFAULT_CONNECT_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, DialError::Connect { .. }));
    }

    #[test]
    fn test_bind_family_mismatch_ignored() {
        let target: SocketAddr = "[::1]:53".parse().unwrap();
        assert_eq!(bind_addr_for(&target, Some("192.168.1.3:0".parse().unwrap())), None);
        let target: SocketAddr = "1.1.1.1:53".parse().unwrap();
        assert!(bind_addr_for(&target, Some("192.168.1.3:0".parse().unwrap())).is_some());
    }
}
