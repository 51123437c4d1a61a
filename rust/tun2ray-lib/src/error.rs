use thiserror::Error;
use tun2ray_core::{ConfigError, StartError, StopError};

/// Errors surfaced through the embedding entry points
#[derive(Error, Debug)]
pub enum LibError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    #[error("start failed: {0}")]
    Start(#[from] StartError),

    #[error("{0}")]
    Stop(#[from] StopError),

    #[error("runtime unavailable: {0}")]
    Runtime(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl LibError {
    /// Negative status code returned across the C ABI
    pub fn code(&self) -> i32 {
        match self {
            LibError::Config(_) | LibError::Start(StartError::Config(_)) => -1,
            LibError::Start(StartError::DeviceUnavailable(_)) => -2,
            LibError::Start(StartError::EngineInitFailed(_)) => -3,
            LibError::Start(StartError::Stack(_)) => -4,
            LibError::Stop(_) => -5,
            LibError::Runtime(_) => -6,
            LibError::InvalidArgument(_) => -7,
        }
    }
}

pub type Result<T> = std::result::Result<T, LibError>;

#[cfg(test)]
mod tests {
    use super::*;
    use tun2ray_core::{DeviceError, ShutdownError};

    #[test]
    fn test_codes_are_distinct_per_component() {
        let device = LibError::from(StartError::DeviceUnavailable(DeviceError::Closed));
        let config = LibError::from(ConfigError::invalid("mtu", "too small"));
        let stop = LibError::from(StopError {
            failures: vec![ShutdownError::new("device", "busy")],
        });
        assert_eq!(device.code(), -2);
        assert_eq!(config.code(), -1);
        assert_eq!(stop.code(), -5);
        assert!(device.to_string().contains("device unavailable"));
    }
}
