use super::{resolve, DatagramConn, Destination, DialContext, ProxyEngine};
use crate::error::{DialError, EngineError};
use crate::flow::FlowStream;
use crate::net::{connect_tcp, connect_udp, DEFAULT_CONNECT_TIMEOUT};
use async_trait::async_trait;
use serde::Deserialize;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct Socks5Config {
    pub server: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub udp: bool,
}

/// SOCKS5 proxy engine (RFC 1928, with RFC 1929 authentication)
#[derive(Debug)]
pub struct Socks5Engine {
    config: Socks5Config,
    closed: AtomicBool,
}

impl Socks5Engine {
    pub fn new(config: Socks5Config) -> Result<Self, EngineError> {
        if config.server.trim().is_empty() {
            return Err(EngineError::Config("socks5: missing server address".into()));
        }
        if config.port == 0 {
            return Err(EngineError::Config("socks5: missing port".into()));
        }
        if config.username.as_ref().is_some_and(|u| u.len() > 255)
            || config.password.as_ref().is_some_and(|p| p.len() > 255)
        {
            return Err(EngineError::Config("socks5: credentials longer than 255 bytes".into()));
        }
        Ok(Self {
            config,
            closed: AtomicBool::new(false),
        })
    }

    fn server(&self) -> Destination {
        match self.config.server.parse::<IpAddr>() {
            Ok(ip) => Destination::Ip(SocketAddr::new(ip, self.config.port)),
            Err(_) => Destination::Domain(self.config.server.clone(), self.config.port),
        }
    }

    async fn connect_server(&self) -> Result<TcpStream, DialError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DialError::EngineClosed);
        }
        let server = resolve(&self.server()).await?;
        let mut stream = connect_tcp(server, None, DEFAULT_CONNECT_TIMEOUT).await?;
        handshake(
            &mut stream,
            self.config.username.as_deref(),
            self.config.password.as_deref(),
        )
        .await?;
        Ok(stream)
    }
}

#[async_trait]
impl ProxyEngine for Socks5Engine {
    fn name(&self) -> &str {
        "socks5"
    }

    async fn dial_tcp(&self, ctx: &DialContext, dest: Destination) -> Result<FlowStream, DialError> {
        let mut stream = self.connect_server().await?;
        write_request(&mut stream, CMD_CONNECT, &dest).await?;
        read_reply(&mut stream).await?;
        debug!("SOCKS5: tunnel established {} -> {}", ctx.meta.source, dest);
        Ok(Box::new(stream))
    }

    async fn dial_udp(
        &self,
        _ctx: &DialContext,
        dest: Destination,
    ) -> Result<Box<dyn DatagramConn>, DialError> {
        if !self.config.udp {
            return Err(DialError::UdpUnsupported(self.name().to_string()));
        }
        let mut control = self.connect_server().await?;
        let unspecified = Destination::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        write_request(&mut control, CMD_UDP_ASSOCIATE, &unspecified).await?;
        let mut relay = read_reply(&mut control).await?;
        // servers may answer with an unspecified address meaning "same host"
        if relay.ip().is_unspecified() {
            relay.set_ip(control.peer_addr()?.ip());
        }
        let socket = connect_udp(relay, None).await?;
        debug!("SOCKS5: UDP associate via {} for {}", relay, dest);
        Ok(Box::new(Socks5Datagram {
            _control: control,
            socket,
            header: encode_udp_header(&dest)?,
        }))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// UDP ASSOCIATE session. The relay lives as long as the control stream.
struct Socks5Datagram {
    _control: TcpStream,
    socket: UdpSocket,
    header: Vec<u8>,
}

#[async_trait]
impl DatagramConn for Socks5Datagram {
    async fn send(&self, payload: &[u8]) -> io::Result<usize> {
        let mut packet = Vec::with_capacity(self.header.len() + payload.len());
        packet.extend_from_slice(&self.header);
        packet.extend_from_slice(payload);
        self.socket.send(&packet).await?;
        Ok(payload.len())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut packet = vec![0u8; buf.len() + 262];
        loop {
            let n = self.socket.recv(&mut packet).await?;
            let Some(offset) = udp_payload_offset(&packet[..n]) else {
                debug!("SOCKS5: dropping malformed UDP relay packet");
                continue;
            };
            let len = (n - offset).min(buf.len());
            buf[..len].copy_from_slice(&packet[offset..offset + len]);
            return Ok(len);
        }
    }
}

async fn handshake<S>(stream: &mut S, username: Option<&str>, password: Option<&str>) -> Result<(), DialError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if username.is_some() {
        &[SOCKS_VERSION, 0x02, 0x00, 0x02]
    } else {
        &[SOCKS_VERSION, 0x01, 0x00]
    };
    stream.write_all(greeting).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[0] != SOCKS_VERSION {
        return Err(DialError::protocol("Invalid SOCKS5 version in response"));
    }

    match response[1] {
        0x00 => Ok(()),
        0x02 => match (username, password) {
            (Some(user), pass) => authenticate(stream, user, pass.unwrap_or_default()).await,
            _ => Err(DialError::protocol(
                "SOCKS5 server requires auth but no credentials provided",
            )),
        },
        0xFF => Err(DialError::protocol("SOCKS5 no acceptable auth method")),
        other => Err(DialError::protocol(format!(
            "Unsupported SOCKS5 auth method: {}",
            other
        ))),
    }
}

async fn authenticate<S>(stream: &mut S, username: &str, password: &str) -> Result<(), DialError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut auth = vec![0x01];
    auth.push(username.len() as u8);
    auth.extend_from_slice(username.as_bytes());
    auth.push(password.len() as u8);
    auth.extend_from_slice(password.as_bytes());
    stream.write_all(&auth).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[1] != 0x00 {
        return Err(DialError::protocol("SOCKS5 authentication failed"));
    }
    Ok(())
}

fn encode_address(dest: &Destination, out: &mut Vec<u8>) -> Result<(), DialError> {
    match dest {
        Destination::Domain(host, port) => {
            if host.len() > 255 {
                return Err(DialError::protocol(format!("domain too long: {}", host)));
            }
            out.push(ATYP_DOMAIN);
            out.push(host.len() as u8);
            out.extend_from_slice(host.as_bytes());
            out.extend_from_slice(&port.to_be_bytes());
        }
        Destination::Ip(addr) => {
            match addr.ip() {
                IpAddr::V4(ip) => {
                    out.push(ATYP_IPV4);
                    out.extend_from_slice(&ip.octets());
                }
                IpAddr::V6(ip) => {
                    out.push(ATYP_IPV6);
                    out.extend_from_slice(&ip.octets());
                }
            }
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    Ok(())
}

async fn write_request<S>(stream: &mut S, command: u8, dest: &Destination) -> Result<(), DialError>
where
    S: AsyncWrite + Unpin,
{
    let mut request = vec![SOCKS_VERSION, command, 0x00];
    encode_address(dest, &mut request)?;
    stream.write_all(&request).await?;
    Ok(())
}

/// Read a command reply and return the bound address
async fn read_reply<S>(stream: &mut S) -> Result<SocketAddr, DialError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(DialError::protocol("Invalid SOCKS5 version in response"));
    }

    if header[1] != 0x00 {
        let message = match header[1] {
            0x01 => "General SOCKS server failure",
            0x02 => "Connection not allowed by ruleset",
            0x03 => "Network unreachable",
            0x04 => "Host unreachable",
            0x05 => "Connection refused",
            0x06 => "TTL expired",
            0x07 => "Command not supported",
            0x08 => "Address type not supported",
            _ => "Unknown error",
        };
        return Err(DialError::protocol(format!("SOCKS5 request failed: {}", message)));
    }

    let ip = match header[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
        _ => {
            return Err(DialError::protocol(
                "Unsupported address type in SOCKS5 response",
            ))
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(SocketAddr::new(ip, u16::from_be_bytes(port)))
}

fn encode_udp_header(dest: &Destination) -> Result<Vec<u8>, DialError> {
    // RSV(2) FRAG(1) ADDR PORT
    let mut header = vec![0x00, 0x00, 0x00];
    encode_address(dest, &mut header)?;
    Ok(header)
}

/// Offset of the payload in a relayed UDP packet, `None` if malformed or
/// fragmented.
fn udp_payload_offset(packet: &[u8]) -> Option<usize> {
    if packet.len() < 4 || packet[2] != 0x00 {
        return None;
    }
    let addr_len = match packet[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => 1 + *packet.get(4)? as usize,
        _ => return None,
    };
    let offset = 4 + addr_len + 2;
    (offset <= packet.len()).then_some(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowMeta;
    use crate::sniff::SniffingPolicy;
    use tokio::net::TcpListener;

    /// One-shot SOCKS5 server accepting CONNECT and echoing the request target.
    async fn fake_server(require_auth: bool) -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 2];
            sock.read_exact(&mut greeting).await.unwrap();
            let mut methods = vec![0u8; greeting[1] as usize];
            sock.read_exact(&mut methods).await.unwrap();
            if require_auth {
                sock.write_all(&[0x05, 0x02]).await.unwrap();
                let mut ver_ulen = [0u8; 2];
                sock.read_exact(&mut ver_ulen).await.unwrap();
                let mut user = vec![0u8; ver_ulen[1] as usize];
                sock.read_exact(&mut user).await.unwrap();
                let mut plen = [0u8; 1];
                sock.read_exact(&mut plen).await.unwrap();
                let mut pass = vec![0u8; plen[0] as usize];
                sock.read_exact(&mut pass).await.unwrap();
                let ok = user == b"user" && pass == b"secret";
                sock.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).await.unwrap();
                if !ok {
                    return Vec::new();
                }
            } else {
                sock.write_all(&[0x05, 0x00]).await.unwrap();
            }
            let mut request = [0u8; 4];
            sock.read_exact(&mut request).await.unwrap();
            let mut target = Vec::new();
            match request[3] {
                ATYP_DOMAIN => {
                    let mut len = [0u8; 1];
                    sock.read_exact(&mut len).await.unwrap();
                    target.resize(len[0] as usize + 2, 0);
                }
                ATYP_IPV4 => target.resize(6, 0),
                _ => target.resize(18, 0),
            }
            sock.read_exact(&mut target).await.unwrap();
            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38])
                .await
                .unwrap();
            let mut payload = [0u8; 4];
            sock.read_exact(&mut payload).await.unwrap();
            sock.write_all(&payload).await.unwrap();
            target
        });
        (addr, handle)
    }

    fn engine(addr: SocketAddr, username: Option<&str>, password: Option<&str>) -> Socks5Engine {
        Socks5Engine::new(Socks5Config {
            server: addr.ip().to_string(),
            port: addr.port(),
            username: username.map(str::to_string),
            password: password.map(str::to_string),
            udp: true,
        })
        .unwrap()
    }

    fn ctx() -> DialContext {
        DialContext::new(
            FlowMeta::tcp("10.0.89.2:40000".parse().unwrap(), "93.184.216.34:443".parse().unwrap()),
            SniffingPolicy::disabled(),
        )
    }

    #[tokio::test]
    async fn test_connect_with_domain() {
        let (addr, server) = fake_server(false).await;
        let engine = engine(addr, None, None);
        let mut stream = engine
            .dial_tcp(&ctx(), Destination::Domain("example.com".into(), 443))
            .await
            .map_err(|e| e.to_string())
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");

        let target = server.await.unwrap();
        assert_eq!(&target[..11], b"example.com");
        assert_eq!(&target[11..], &443u16.to_be_bytes());
    }

    #[tokio::test]
    async fn test_connect_with_auth() {
        let (addr, server) = fake_server(true).await;
        let engine = engine(addr, Some("user"), Some("secret"));
        let result = engine
            .dial_tcp(&ctx(), Destination::Ip("93.184.216.34:80".parse().unwrap()))
            .await;
        let mut stream = result.map_err(|e| e.to_string()).unwrap();
        stream.write_all(b"ping").await.unwrap();
        let target = server.await.unwrap();
        assert_eq!(&target[..4], &[93, 184, 216, 34]);
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let (addr, _server) = fake_server(true).await;
        let engine = engine(addr, Some("user"), Some("wrong"));
        let result = engine
            .dial_tcp(&ctx(), Destination::Ip("93.184.216.34:80".parse().unwrap()))
            .await;
        assert!(matches!(result, Err(DialError::Protocol(_))));
    }

    #[test]
    fn test_udp_header_roundtrip_offset() {
        let header = encode_udp_header(&Destination::Ip("8.8.8.8:53".parse().unwrap())).unwrap();
        assert_eq!(header.len(), 10);
        let mut packet = header.clone();
        packet.extend_from_slice(b"query");
        assert_eq!(udp_payload_offset(&packet), Some(10));

        packet[2] = 0x01; // fragmented
        assert_eq!(udp_payload_offset(&packet), None);
    }

    #[test]
    fn test_config_validation() {
        let config = Socks5Config {
            server: String::new(),
            port: 1080,
            username: None,
            password: None,
            udp: true,
        };
        assert!(Socks5Engine::new(config).is_err());
    }
}
