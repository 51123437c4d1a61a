use std::fmt;
use thiserror::Error;

/// Malformed or missing startup parameters. Fatal to `Engine::start`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}

impl ConfigError {
    pub fn invalid<S: Into<String>>(field: &'static str, message: S) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// TUN device errors
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("TUN device error: {0}")]
    Open(String),

    #[error("TUN device closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Proxy engine construction and teardown errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported proxy engine type: {0}")]
    UnsupportedType(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Config(e.to_string())
    }
}

/// Reassembly stack errors
#[derive(Error, Debug)]
pub enum StackError {
    #[error("Stack build error: {0}")]
    Build(String),

    #[error("Stack closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A direct or proxied dial failed for a single flow
#[derive(Error, Debug)]
pub enum DialError {
    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {0} timed out")]
    Timeout(String),

    #[error("proxy protocol error: {0}")]
    Protocol(String),

    #[error("proxy engine closed")]
    EngineClosed,

    #[error("UDP is not supported by proxy engine {0}")]
    UdpUnsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DialError {
    pub fn connect<T: fmt::Display>(target: T, source: std::io::Error) -> Self {
        Self::Connect {
            target: target.to_string(),
            source,
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(message.into())
    }
}

/// One sub-component failed to close cleanly during `Stop`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{component}: {message}")]
pub struct ShutdownError {
    pub component: &'static str,
    pub message: String,
}

impl ShutdownError {
    pub fn new<E: fmt::Display>(component: &'static str, err: E) -> Self {
        Self {
            component,
            message: err.to_string(),
        }
    }
}

/// Startup failure. The engine instance is never left partially alive.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(#[source] DeviceError),

    #[error("proxy engine init failed: {0}")]
    EngineInitFailed(#[source] EngineError),

    #[error("stack: {0}")]
    Stack(#[source] StackError),
}

impl StartError {
    /// Name of the sub-component that failed
    pub fn component(&self) -> &'static str {
        match self {
            StartError::Config(_) => "config",
            StartError::DeviceUnavailable(_) => "device",
            StartError::EngineInitFailed(_) => "proxy engine",
            StartError::Stack(_) => "stack",
        }
    }
}

/// Every close failure collected during `Stop`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct StopError {
    pub failures: Vec<ShutdownError>,
}

impl fmt::Display for StopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shutdown failed: ")?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_error_lists_every_failure() {
        let err = StopError {
            failures: vec![
                ShutdownError::new("stack", "busy"),
                ShutdownError::new("proxy engine", "already closed"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "shutdown failed: stack: busy; proxy engine: already closed"
        );
    }

    #[test]
    fn test_start_error_names_component() {
        let err = StartError::EngineInitFailed(EngineError::UnsupportedType("vmess".into()));
        assert_eq!(err.component(), "proxy engine");
        assert!(err.to_string().contains("vmess"));

        let err = StartError::DeviceUnavailable(DeviceError::Open("no such device".into()));
        assert_eq!(err.component(), "device");
    }
}
