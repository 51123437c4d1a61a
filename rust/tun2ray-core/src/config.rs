use crate::error::ConfigError;
use serde::{Deserialize, Deserializer, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_MTU: u16 = 1500;
pub const DEFAULT_UDP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_DNS_PORT: u16 = 53;

/// TUN device configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunConfig {
    pub name: String,
    pub address: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dns: Vec<IpAddr>,
    pub mtu: u16,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: "tun2ray".to_string(),
            address: Ipv4Addr::new(10, 0, 89, 2),
            gateway: Ipv4Addr::new(10, 0, 89, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            dns: vec![IpAddr::V4(Ipv4Addr::new(114, 114, 114, 114))],
            mtu: DEFAULT_MTU,
        }
    }
}

impl TunConfig {
    pub fn prefix_len(&self) -> u8 {
        netmask_to_prefix(self.netmask)
    }
}

/// Transport used to forward DNS queries on the fallback path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DnsTransport {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsFallbackConfig {
    /// Destination port treated as DNS
    pub port: u16,
    /// Resolver to forward to. `None` forwards to the flow's own destination.
    pub upstream: Option<SocketAddr>,
    pub transport: DnsTransport,
    pub timeout_secs: u64,
}

impl Default for DnsFallbackConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DNS_PORT,
            upstream: None,
            transport: DnsTransport::Tcp,
            timeout_secs: 5,
        }
    }
}

impl DnsFallbackConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Startup parameters consumed by `Engine::start`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tun: TunConfig,
    /// Proxy engine configuration. Opaque to the bridge; accepted either as a
    /// JSON string or as an inline JSON object.
    #[serde(deserialize_with = "deserialize_blob")]
    pub proxy: String,
    pub sniffing: Vec<String>,
    pub udp_enabled: bool,
    pub udp_timeout_secs: u64,
    pub exception_apps: Vec<String>,
    pub send_through: Option<SocketAddr>,
    pub dns_fallback: DnsFallbackConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tun: TunConfig::default(),
            proxy: String::new(),
            sniffing: vec!["http".to_string(), "tls".to_string()],
            udp_enabled: true,
            udp_timeout_secs: DEFAULT_UDP_TIMEOUT_SECS,
            exception_apps: Vec::new(),
            send_through: None,
            dns_fallback: DnsFallbackConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        Ok(config)
    }

    pub fn udp_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_timeout_secs)
    }

    /// Check invariants and normalise list fields in place.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if !(576..=65535).contains(&self.tun.mtu) {
            return Err(ConfigError::invalid(
                "mtu",
                format!("{} is outside 576..=65535", self.tun.mtu),
            ));
        }
        if self.udp_timeout_secs == 0 {
            return Err(ConfigError::invalid("udp_timeout", "must be greater than zero"));
        }
        if self.dns_fallback.port == 0 {
            return Err(ConfigError::invalid("dns_fallback.port", "must not be zero"));
        }
        if self.dns_fallback.timeout_secs == 0 {
            return Err(ConfigError::invalid("dns_fallback.timeout", "must be greater than zero"));
        }
        if self.tun.name.trim().is_empty() {
            return Err(ConfigError::invalid("tun.name", "must not be empty"));
        }

        let mut apps: Vec<String> = self
            .exception_apps
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        apps.sort();
        apps.dedup();
        self.exception_apps = apps;

        self.sniffing = self
            .sniffing
            .iter()
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(())
    }
}

/// Split a comma separated list, dropping blanks: `"a, b,,c"` -> `[a, b, c]`
pub fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a comma separated list of IP addresses
pub fn parse_ip_list(s: &str) -> Result<Vec<IpAddr>, ConfigError> {
    split_list(s)
        .iter()
        .map(|ip| ip.parse::<IpAddr>().map_err(ConfigError::from))
        .collect()
}

pub fn netmask_to_prefix(netmask: Ipv4Addr) -> u8 {
    netmask.octets().iter().map(|o| o.count_ones() as u8).sum()
}

fn deserialize_blob<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}
