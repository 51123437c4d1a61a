use crate::error::{LibError, Result};
use crate::{runtime, INSTANCE};
use std::sync::Arc;
use tracing::{info, warn};
use tun2ray_core::device::DeviceFactory;
use tun2ray_core::{default_components, Engine, EngineConfig, StatsSnapshot};

/// Where the TUN device comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSource {
    /// Create an interface from the TUN parameters in the config
    Create,
    /// Adopt a descriptor opened by the host (Android VpnService)
    Fd(i32),
}

impl DeviceSource {
    fn factory(self) -> Result<Arc<dyn DeviceFactory>> {
        #[cfg(any(
            target_os = "linux",
            target_os = "macos",
            target_os = "windows",
            target_os = "android"
        ))]
        {
            use tun2ray_core::device::{FdDeviceFactory, TunDeviceFactory};
            Ok(match self {
                DeviceSource::Create => Arc::new(TunDeviceFactory),
                DeviceSource::Fd(fd) => Arc::new(FdDeviceFactory { fd }),
            })
        }
        #[cfg(not(any(
            target_os = "linux",
            target_os = "macos",
            target_os = "windows",
            target_os = "android"
        )))]
        {
            Err(LibError::InvalidArgument(format!(
                "no TUN support for {:?} on this platform",
                self
            )))
        }
    }
}

/// Start the engine, replacing any instance that is already running.
pub async fn start(config: EngineConfig, source: DeviceSource) -> Result<()> {
    let mut instance = INSTANCE.lock().await;
    if let Some(previous) = instance.take() {
        info!("Restarting: stopping the running engine first");
        if let Err(e) = previous.stop().await {
            warn!("Error stopping previous engine: {}", e);
        }
    }

    let engine = Engine::start(config, default_components(source.factory()?)).await?;
    *instance = Some(engine);
    Ok(())
}

/// Stop the running engine. Does nothing when none is running.
pub async fn stop() -> Result<()> {
    let mut instance = INSTANCE.lock().await;
    match instance.take() {
        Some(engine) => engine.stop().await.map_err(LibError::from),
        None => Ok(()),
    }
}

pub async fn is_running() -> bool {
    INSTANCE
        .lock()
        .await
        .as_ref()
        .is_some_and(|engine| engine.is_running())
}

pub async fn stats() -> Option<StatsSnapshot> {
    INSTANCE.lock().await.as_ref().map(|engine| engine.stats())
}

/// Parse `config_json` and start on the shared runtime.
pub fn start_blocking(config_json: &str, source: DeviceSource) -> Result<()> {
    start_config_blocking(EngineConfig::from_json(config_json)?, source)
}

pub fn start_config_blocking(config: EngineConfig, source: DeviceSource) -> Result<()> {
    runtime()?.block_on(start(config, source))
}

pub fn stop_blocking() -> Result<()> {
    runtime()?.block_on(stop())
}

pub fn is_running_blocking() -> bool {
    match runtime() {
        Ok(rt) => rt.block_on(is_running()),
        Err(_) => false,
    }
}

/// Engine counters as JSON, or `None` when nothing is running
pub fn stats_json() -> Option<String> {
    let snapshot = runtime().ok()?.block_on(stats())?;
    serde_json::to_string(&snapshot).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_when_idle_is_noop() {
        stop_blocking().unwrap();
        stop_blocking().unwrap();
        assert!(!is_running_blocking());
    }

    #[test]
    fn test_start_rejects_bad_json() {
        let err = start_blocking("{not json", DeviceSource::Fd(3)).unwrap_err();
        assert_eq!(err.code(), -1);
        assert!(!is_running_blocking());
    }

    #[cfg(unix)]
    #[test]
    fn test_start_with_bad_fd_leaves_nothing_running() {
        let config = r#"{"proxy": {"type": "direct"}}"#;
        let err = start_blocking(config, DeviceSource::Fd(-1)).unwrap_err();
        assert_eq!(err.code(), -2);
        assert!(!is_running_blocking());
        assert!(stats_json().is_none());
    }
}
