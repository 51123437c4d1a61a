//! Socket protection for outbound sockets created by the direct and DNS
//! fallback paths. On Android a VpnService must exempt these sockets from
//! its own route or they loop back into the tunnel.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

type ProtectCallback = Arc<dyn Fn(i32) -> bool + Send + Sync>;

static PROTECT_CALLBACK: RwLock<Option<ProtectCallback>> = RwLock::new(None);

pub fn set_protect_callback<F>(callback: F)
where
    F: Fn(i32) -> bool + Send + Sync + 'static,
{
    *PROTECT_CALLBACK.write() = Some(Arc::new(callback));
    info!("Socket protect callback registered");
}

pub fn clear_protect_callback() {
    *PROTECT_CALLBACK.write() = None;
    info!("Socket protect callback cleared");
}

pub fn has_protect_callback() -> bool {
    PROTECT_CALLBACK.read().is_some()
}

/// Run the registered callback on `fd`. Without a callback every socket is
/// considered protected.
pub fn protect_fd(fd: i32) -> bool {
    let callback = PROTECT_CALLBACK.read().clone();
    match callback {
        Some(callback) => {
            let ok = callback(fd);
            if ok {
                debug!("Socket fd={} protected", fd);
            } else {
                warn!("Socket fd={} protection FAILED, traffic may loop", fd);
            }
            ok
        }
        None => true,
    }
}

#[cfg(unix)]
pub fn protect_socket(socket: &socket2::Socket) -> bool {
    use std::os::unix::io::AsRawFd;
    protect_fd(socket.as_raw_fd())
}

#[cfg(not(unix))]
pub fn protect_socket(_socket: &socket2::Socket) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn test_callback_sees_fd() {
        static SEEN: AtomicI32 = AtomicI32::new(-1);
        set_protect_callback(|fd| {
            SEEN.store(fd, Ordering::SeqCst);
            fd != 13
        });
        assert!(has_protect_callback());
        assert!(protect_fd(42));
        assert_eq!(SEEN.load(Ordering::SeqCst), 42);
        assert!(!protect_fd(13));
        clear_protect_callback();
        assert!(protect_fd(13));
    }
}
