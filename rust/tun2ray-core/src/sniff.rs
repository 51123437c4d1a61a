//! Destination sniffing on the first bytes of a TCP flow.
//!
//! Two protocols are recognised: a TLS `ClientHello` carrying the SNI
//! extension and a plain HTTP/1.x request carrying a `Host` header.

use std::fmt;
use tracing::{trace, warn};

const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const TLS_HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const TLS_RECORD_HEADER_SIZE: usize = 5;
const TLS_EXTENSION_SERVER_NAME: u16 = 0x0000;
const SNI_HOST_NAME: u8 = 0x00;

const HTTP_METHODS: &[&[u8]] = &[
    b"GET ", b"POST ", b"PUT ", b"HEAD ", b"DELETE ", b"OPTIONS ", b"PATCH ", b"CONNECT ",
    b"TRACE ",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffProtocol {
    Http,
    Tls,
}

impl fmt::Display for SniffProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SniffProtocol::Http => write!(f, "http"),
            SniffProtocol::Tls => write!(f, "tls"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffResult {
    pub protocol: SniffProtocol,
    pub host: String,
}

/// Which protocols may override a flow's destination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SniffingPolicy {
    pub http: bool,
    pub tls: bool,
}

impl SniffingPolicy {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Build from protocol names. Unknown names are logged and ignored.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let mut policy = Self::default();
        for name in names {
            match name.as_ref().trim().to_ascii_lowercase().as_str() {
                "http" => policy.http = true,
                "tls" => policy.tls = true,
                "" => {}
                other => warn!("Ignoring unsupported sniffing protocol: {}", other),
            }
        }
        policy
    }

    pub fn is_enabled(&self) -> bool {
        self.http || self.tls
    }

    pub fn allows(&self, protocol: SniffProtocol) -> bool {
        match protocol {
            SniffProtocol::Http => self.http,
            SniffProtocol::Tls => self.tls,
        }
    }

    /// Inspect `data` with every enabled protocol.
    pub fn sniff(&self, data: &[u8]) -> Option<SniffResult> {
        if self.tls {
            if let Some(host) = sniff_tls_sni(data) {
                return Some(SniffResult {
                    protocol: SniffProtocol::Tls,
                    host,
                });
            }
        }
        if self.http {
            if let Some(host) = sniff_http_host(data) {
                return Some(SniffResult {
                    protocol: SniffProtocol::Http,
                    host,
                });
            }
        }
        None
    }
}

fn read_u16(data: &[u8], pos: usize) -> Option<u16> {
    let bytes = data.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Extract the SNI host name from a TLS `ClientHello`
pub fn sniff_tls_sni(data: &[u8]) -> Option<String> {
    if data.len() < TLS_RECORD_HEADER_SIZE || data[0] != TLS_CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    let record_len = read_u16(data, 3)? as usize;
    let end = (TLS_RECORD_HEADER_SIZE + record_len).min(data.len());
    let data = &data[..end];

    let mut pos = TLS_RECORD_HEADER_SIZE;
    if *data.get(pos)? != TLS_HANDSHAKE_TYPE_CLIENT_HELLO {
        trace!("TLS handshake is not a ClientHello");
        return None;
    }
    // handshake type + length(3) + version(2) + random(32)
    pos += 1 + 3 + 2 + 32;

    let session_id_len = *data.get(pos)? as usize;
    pos += 1 + session_id_len;

    let cipher_len = read_u16(data, pos)? as usize;
    pos += 2 + cipher_len;

    let compression_len = *data.get(pos)? as usize;
    pos += 1 + compression_len;

    let extensions_len = read_u16(data, pos)? as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(data.len());

    while pos + 4 <= extensions_end {
        let ext_type = read_u16(data, pos)?;
        let ext_len = read_u16(data, pos + 2)? as usize;
        pos += 4;
        if ext_type == TLS_EXTENSION_SERVER_NAME {
            return parse_server_name_list(data.get(pos..pos + ext_len)?);
        }
        pos += ext_len;
    }
    None
}

fn parse_server_name_list(ext: &[u8]) -> Option<String> {
    let list_len = read_u16(ext, 0)? as usize;
    let list = ext.get(2..2 + list_len)?;
    let mut pos = 0;
    while pos + 3 <= list.len() {
        let name_type = list[pos];
        let name_len = read_u16(list, pos + 1)? as usize;
        pos += 3;
        let name = list.get(pos..pos + name_len)?;
        if name_type == SNI_HOST_NAME {
            let host = std::str::from_utf8(name).ok()?;
            if host.is_empty() {
                return None;
            }
            return Some(host.to_ascii_lowercase());
        }
        pos += name_len;
    }
    None
}

pub fn looks_like_http(data: &[u8]) -> bool {
    HTTP_METHODS.iter().any(|m| data.starts_with(m))
}

/// Extract the `Host` header from an HTTP/1.x request, without the port
pub fn sniff_http_host(data: &[u8]) -> Option<String> {
    if !looks_like_http(data) {
        return None;
    }
    let text = std::str::from_utf8(data).ok().or_else(|| {
        // Request line and headers are ASCII; a body may be cut mid-character.
        let head_end = data.windows(4).position(|w| w == b"\r\n\r\n")?;
        std::str::from_utf8(&data[..head_end]).ok()
    })?;

    for line in text.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("host") {
            let value = value.trim();
            let host = strip_port(value);
            if host.is_empty() {
                return None;
            }
            return Some(host.to_ascii_lowercase());
        }
    }
    None
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    }
}
