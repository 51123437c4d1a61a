use crate::flow::Network;
use std::net::SocketAddr;

/// Maps a flow's local endpoint to the name of the process that owns it
pub trait ProcessResolver: Send + Sync {
    /// Blocking lookup. Called from `spawn_blocking`.
    fn lookup(&self, network: Network, source: SocketAddr) -> Option<String>;
}

/// Resolver for the current platform
pub fn system_resolver() -> Option<std::sync::Arc<dyn ProcessResolver>> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        Some(std::sync::Arc::new(procfs::ProcFsResolver::default()))
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        None
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use procfs::ProcFsResolver;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod procfs {
    use super::ProcessResolver;
    use crate::flow::Network;
    use std::fs;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
    use std::path::{Path, PathBuf};
    use tracing::trace;

    /// Looks sockets up through `/proc/net/*` and `/proc/<pid>/fd`
    #[derive(Debug, Clone)]
    pub struct ProcFsResolver {
        root: PathBuf,
    }

    impl Default for ProcFsResolver {
        fn default() -> Self {
            Self {
                root: PathBuf::from("/proc"),
            }
        }
    }

    impl ProcFsResolver {
        pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
            Self { root: root.into() }
        }

        fn socket_inode(&self, network: Network, source: SocketAddr) -> Option<String> {
            let tables: &[(&str, bool)] = match network {
                Network::Tcp => &[("tcp", false), ("tcp6", true)],
                Network::Udp => &[("udp", false), ("udp6", true)],
            };
            let mut wildcard = None;
            for (table, is_ipv6) in tables {
                let Ok(content) = fs::read_to_string(self.root.join("net").join(table)) else {
                    continue;
                };
                for line in content.lines().skip(1) {
                    let Some((addr, inode)) = parse_socket_line(line, *is_ipv6) else {
                        continue;
                    };
                    if inode == "0" {
                        continue;
                    }
                    if same_endpoint(addr, source) {
                        return Some(inode.to_string());
                    }
                    // Unconnected UDP sockets are listed by port with a wildcard address
                    if wildcard.is_none() && addr.port() == source.port() && addr.ip().is_unspecified() {
                        wildcard = Some(inode.to_string());
                    }
                }
            }
            wildcard
        }

        fn owner_of_inode(&self, inode: &str) -> Option<String> {
            let needle = format!("socket:[{}]", inode);
            for entry in fs::read_dir(&self.root).ok()?.flatten() {
                let path = entry.path();
                let Some(pid) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if pid.parse::<u32>().is_err() {
                    continue;
                }
                let Ok(fds) = fs::read_dir(path.join("fd")) else {
                    continue;
                };
                let owns = fds.flatten().any(|fd| {
                    fs::read_link(fd.path())
                        .map(|link| link.as_os_str() == needle.as_str())
                        .unwrap_or(false)
                });
                if owns {
                    return process_name(&path);
                }
            }
            None
        }
    }

    impl ProcessResolver for ProcFsResolver {
        fn lookup(&self, network: Network, source: SocketAddr) -> Option<String> {
            let inode = self.socket_inode(network, source)?;
            let name = self.owner_of_inode(&inode);
            trace!("{} {} -> inode {} -> {:?}", network, source, inode, name);
            name
        }
    }

    fn same_endpoint(a: SocketAddr, b: SocketAddr) -> bool {
        if a.port() != b.port() {
            return false;
        }
        let canon = |addr: SocketAddr| match addr {
            SocketAddr::V6(v6) => v6
                .ip()
                .to_ipv4_mapped()
                .map(std::net::IpAddr::V4)
                .unwrap_or(std::net::IpAddr::V6(*v6.ip())),
            SocketAddr::V4(v4) => std::net::IpAddr::V4(*v4.ip()),
        };
        canon(a) == canon(b)
    }

    fn process_name(proc_dir: &Path) -> Option<String> {
        if let Ok(exe) = fs::read_link(proc_dir.join("exe")) {
            if let Some(name) = exe.file_name().and_then(|n| n.to_str()) {
                return Some(name.to_string());
            }
        }
        // Android app processes report their package name through cmdline
        if let Ok(cmdline) = fs::read_to_string(proc_dir.join("cmdline")) {
            if let Some(first) = cmdline.split('\0').next().filter(|s| !s.is_empty()) {
                return Some(first.to_string());
            }
        }
        let status = fs::read_to_string(proc_dir.join("status")).ok()?;
        status
            .lines()
            .find(|line| line.starts_with("Name:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .map(str::to_string)
    }

    /// Parse one `/proc/net/{tcp,udp}[6]` row into (local address, inode)
    pub(super) fn parse_socket_line(line: &str, is_ipv6: bool) -> Option<(SocketAddr, &str)> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            return None;
        }
        let (addr_hex, port_hex) = parts[1].split_once(':')?;
        let port = u16::from_str_radix(port_hex, 16).ok()?;
        let ip = if is_ipv6 {
            std::net::IpAddr::V6(hex_to_ipv6(addr_hex)?)
        } else {
            std::net::IpAddr::V4(hex_to_ipv4(addr_hex)?)
        };
        Some((SocketAddr::new(ip, port), parts[9]))
    }

    fn hex_to_ipv4(hex: &str) -> Option<Ipv4Addr> {
        if hex.len() != 8 {
            return None;
        }
        let raw = u32::from_str_radix(hex, 16).ok()?;
        // kernel prints the address in host (little-endian) order
        Some(Ipv4Addr::from(raw.swap_bytes()))
    }

    fn hex_to_ipv6(hex: &str) -> Option<Ipv6Addr> {
        if hex.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (word, chunk) in hex.as_bytes().chunks(8).enumerate() {
            let raw = u32::from_str_radix(std::str::from_utf8(chunk).ok()?, 16).ok()?;
            bytes[word * 4..word * 4 + 4].copy_from_slice(&raw.swap_bytes().to_be_bytes());
        }
        Some(Ipv6Addr::from(bytes))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse_ipv4_line() {
            let line = "   0: 0259000A:9C40 22D8B85D:0050 01 00000000:00000000 00:00000000 00000000  1000        0 123456 1 0000000000000000 20 4 30 10 -1";
            let (addr, inode) = parse_socket_line(line, false).unwrap();
            assert_eq!(addr, "10.0.89.2:40000".parse::<SocketAddr>().unwrap());
            assert_eq!(inode, "123456");
        }

        #[test]
        fn test_parse_ipv6_line() {
            let line = "   0: 0000000000000000FFFF00000259000A:0035 00000000000000000000000000000000:0000 07 00000000:00000000 00:00000000 00000000  1000        0 777 2 0000000000000000 0";
            let (addr, inode) = parse_socket_line(line, true).unwrap();
            assert!(same_endpoint(addr, "10.0.89.2:53".parse().unwrap()));
            assert_eq!(inode, "777");
        }

        #[test]
        fn test_parse_rejects_short_line() {
            assert!(parse_socket_line("sl local_address", false).is_none());
        }

        #[test]
        fn test_lookup_in_fake_procfs() {
            let root = std::env::temp_dir().join(format!("tun2ray-procfs-{}", std::process::id()));
            let _ = fs::remove_dir_all(&root);
            fs::create_dir_all(root.join("net")).unwrap();
            fs::create_dir_all(root.join("4242/fd")).unwrap();
            fs::write(
                root.join("net/tcp"),
                "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n   0: 0259000A:9C40 22D8B85D:0050 01 00000000:00000000 00:00000000 00000000  1000        0 555 1 0000000000000000 20 4 30 10 -1\n",
            )
            .unwrap();
            fs::write(root.join("4242/cmdline"), "app1\0--flag\0").unwrap();
            std::os::unix::fs::symlink("socket:[555]", root.join("4242/fd/7")).unwrap();

            let resolver = ProcFsResolver::with_root(&root);
            let name = resolver.lookup(Network::Tcp, "10.0.89.2:40000".parse().unwrap());
            assert_eq!(name.as_deref(), Some("app1"));
            assert_eq!(resolver.lookup(Network::Tcp, "10.0.89.2:1".parse().unwrap()), None);

            let _ = fs::remove_dir_all(&root);
        }
    }
}
