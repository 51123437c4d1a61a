use crate::config::TunConfig;
use crate::error::DeviceError;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Packet-level read/write access to a TUN device
#[async_trait]
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    /// MTU negotiated with the OS. The pump buffer is sized to this.
    fn mtu(&self) -> usize;

    /// Read one IP packet. Returns `DeviceError::Closed` once closed.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, DeviceError>;

    async fn send(&self, packet: &[u8]) -> Result<usize, DeviceError>;

    /// Close the device. Unblocks a pending `recv`. Idempotent.
    async fn close(&self) -> Result<(), DeviceError>;
}

/// Opens the device named by the startup parameters
#[async_trait]
pub trait DeviceFactory: Send + Sync {
    async fn open(&self, config: &TunConfig) -> Result<Arc<dyn Device>, DeviceError>;
}

/// Commands that point the interface's resolvers at `dns`. Empty where the
/// platform has no per-interface resolver setting.
pub fn resolver_commands(name: &str, dns: &[IpAddr]) -> Vec<(String, Vec<String>)> {
    if dns.is_empty() {
        return Vec::new();
    }
    #[cfg(target_os = "windows")]
    {
        dns.iter()
            .enumerate()
            .map(|(i, ip)| {
                let family = if ip.is_ipv4() { "ip" } else { "ipv6" };
                let action = if i == 0 { "set" } else { "add" };
                let args = vec![
                    "interface".to_string(),
                    family.to_string(),
                    action.to_string(),
                    "dns".to_string(),
                    format!("name=\"{}\"", name),
                    format!("addr={}", ip),
                ];
                ("netsh".to_string(), args)
            })
            .collect()
    }
    #[cfg(target_os = "linux")]
    {
        let mut args = vec!["dns".to_string(), name.to_string()];
        args.extend(dns.iter().map(IpAddr::to_string));
        vec![("resolvectl".to_string(), args)]
    }
    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    {
        let _ = name;
        Vec::new()
    }
}

/// Point the interface's resolvers at `dns`. Failures are logged, not fatal.
pub fn apply_resolvers(name: &str, dns: &[IpAddr]) {
    if dns.is_empty() {
        return;
    }
    let commands = resolver_commands(name, dns);
    if commands.is_empty() {
        warn!("Per-interface DNS is not supported here, ignoring resolvers {:?}", dns);
        return;
    }
    for (program, args) in commands {
        match std::process::Command::new(&program).args(&args).output() {
            Ok(output) if output.status.success() => {}
            Ok(output) => warn!(
                "Failed to set DNS on {}: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => {
                warn!("Failed to run {}: {}", program, e);
                return;
            }
        }
    }
    info!("TUN DNS configured on {}: {:?}", name, dns);
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows", target_os = "android"))]
pub use tun::{FdDeviceFactory, TunDevice, TunDeviceFactory};

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows", target_os = "android"))]
mod tun {
    use super::{Device, DeviceFactory};
    use crate::config::TunConfig;
    use crate::error::DeviceError;
    use async_trait::async_trait;
    use parking_lot::RwLock;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info};
    use tun_rs::AsyncDevice;

    /// TUN device backed by `tun-rs`
    pub struct TunDevice {
        name: String,
        mtu: usize,
        inner: RwLock<Option<Arc<AsyncDevice>>>,
        closed: CancellationToken,
    }

    impl TunDevice {
        fn from_async(name: String, mtu: usize, device: AsyncDevice) -> Self {
            Self {
                name,
                mtu,
                inner: RwLock::new(Some(Arc::new(device))),
                closed: CancellationToken::new(),
            }
        }

        /// Create a TUN interface with the configured address and MTU.
        #[cfg(not(target_os = "android"))]
        pub fn create(config: &TunConfig) -> Result<Self, DeviceError> {
            use tun_rs::DeviceBuilder;

            let prefix_len = config.prefix_len();
            let device = DeviceBuilder::new()
                .name(&config.name)
                .ipv4(config.address, prefix_len, Some(config.gateway))
                .mtu(config.mtu)
                .build_async()
                .map_err(|e| DeviceError::Open(format!("Failed to create TUN {}: {}", config.name, e)))?;

            info!(
                "TUN device created: {} with address {}/{} (gateway {})",
                config.name, config.address, prefix_len, config.gateway
            );
            super::apply_resolvers(&config.name, &config.dns);
            Ok(Self::from_async(config.name.clone(), config.mtu as usize, device))
        }

        /// Wrap a descriptor handed over by the platform (Android VpnService).
        /// The descriptor is duplicated; the caller keeps ownership of `fd`.
        #[cfg(unix)]
        pub fn from_fd(fd: i32, mtu: usize) -> Result<Self, DeviceError> {
            if fd < 0 {
                return Err(DeviceError::Open(format!("Invalid TUN fd: {}", fd)));
            }
            // SAFETY: dup only reads the descriptor table; a negative result is handled below
            let dup_fd = unsafe { libc::dup(fd) };
            if dup_fd < 0 {
                return Err(DeviceError::Open(format!(
                    "Failed to duplicate TUN fd: {}",
                    std::io::Error::last_os_error()
                )));
            }
            debug!("Duplicated TUN fd: {} -> {}", fd, dup_fd);

            // SAFETY: dup_fd is a fresh descriptor owned exclusively by the new device
            let device = unsafe { AsyncDevice::from_fd(dup_fd) }.map_err(|e| {
                // SAFETY: the descriptor was not adopted, close it here
                unsafe { libc::close(dup_fd) };
                DeviceError::Open(format!("Failed to adopt TUN fd: {}", e))
            })?;
            Ok(Self::from_async(format!("fd{}", fd), mtu, device))
        }

        fn handle(&self) -> Result<Arc<AsyncDevice>, DeviceError> {
            self.inner.read().clone().ok_or(DeviceError::Closed)
        }
    }

    #[async_trait]
    impl Device for TunDevice {
        fn name(&self) -> &str {
            &self.name
        }

        fn mtu(&self) -> usize {
            self.mtu
        }

        async fn recv(&self, buf: &mut [u8]) -> Result<usize, DeviceError> {
            let device = self.handle()?;
            tokio::select! {
                _ = self.closed.cancelled() => Err(DeviceError::Closed),
                result = device.recv(buf) => result.map_err(DeviceError::from),
            }
        }

        async fn send(&self, packet: &[u8]) -> Result<usize, DeviceError> {
            let device = self.handle()?;
            device.send(packet).await.map_err(DeviceError::from)
        }

        async fn close(&self) -> Result<(), DeviceError> {
            self.closed.cancel();
            if self.inner.write().take().is_some() {
                info!("TUN device {} closed", self.name);
            }
            Ok(())
        }
    }

    /// Opens a TUN interface by name
    #[derive(Debug, Default, Clone, Copy)]
    pub struct TunDeviceFactory;

    #[async_trait]
    impl DeviceFactory for TunDeviceFactory {
        async fn open(&self, config: &TunConfig) -> Result<Arc<dyn Device>, DeviceError> {
            #[cfg(not(target_os = "android"))]
            {
                Ok(Arc::new(TunDevice::create(config)?))
            }
            #[cfg(target_os = "android")]
            {
                let _ = config;
                Err(DeviceError::Open(
                    "TUN interfaces are created by VpnService on Android; pass its fd".into(),
                ))
            }
        }
    }

    /// Adopts an already-open TUN descriptor
    #[derive(Debug, Clone, Copy)]
    pub struct FdDeviceFactory {
        pub fd: i32,
    }

    #[async_trait]
    impl DeviceFactory for FdDeviceFactory {
        async fn open(&self, config: &TunConfig) -> Result<Arc<dyn Device>, DeviceError> {
            #[cfg(unix)]
            {
                // the owner of the descriptor configures its address and resolvers
                debug!(
                    "Adopting TUN fd {}, gateway {} and DNS {:?} are left to its owner",
                    self.fd, config.gateway, config.dns
                );
                Ok(Arc::new(TunDevice::from_fd(self.fd, config.mtu as usize)?))
            }
            #[cfg(not(unix))]
            {
                let _ = config;
                Err(DeviceError::Open(format!(
                    "adopting TUN fd {} is not supported on this platform",
                    self.fd
                )))
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_resolvers_no_commands() {
        assert!(resolver_commands("tun2ray", &[]).is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_resolver_commands() {
        let dns: Vec<IpAddr> = vec!["114.114.114.114".parse().unwrap(), "2001:db8::53".parse().unwrap()];
        let commands = resolver_commands("tun2ray", &dns);
        assert_eq!(
            commands,
            vec![(
                "resolvectl".to_string(),
                vec![
                    "dns".to_string(),
                    "tun2ray".to_string(),
                    "114.114.114.114".to_string(),
                    "2001:db8::53".to_string(),
                ]
            )]
        );
    }

    #[cfg(target_os = "windows")]
    #[test]
    fn test_windows_resolver_commands() {
        let dns: Vec<IpAddr> = vec!["1.1.1.1".parse().unwrap(), "8.8.8.8".parse().unwrap()];
        let commands = resolver_commands("tun2ray", &dns);
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].0, "netsh");
        assert_eq!(commands[0].1[2], "set");
        assert_eq!(commands[1].1[2], "add");
        assert_eq!(commands[1].1[5], "addr=8.8.8.8");
    }
}
