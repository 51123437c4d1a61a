//! Engine instance lifecycle.
//!
//! [`Engine::start`] wires device, stack, dispatcher and proxy engine and
//! launches the device pump. [`Engine::stop`] tears them down in a fixed
//! order, collecting every failure. While not running the output hook
//! discards packets without touching the device.

use crate::config::EngineConfig;
use crate::device::{Device, DeviceFactory};
use crate::dispatcher::DispatcherBuilder;
use crate::error::{DeviceError, ShutdownError, StartError, StopError};
use crate::exception::ExceptionSet;
use crate::handler::{DirectDialer, DirectHandler, DnsFallbackHandler, ProxyHandler, SystemDialer};
use crate::process::ProcessResolver;
use crate::proxy::{EngineProvider, ProxyEngine};
use crate::sniff::SniffingPolicy;
use crate::stack::{NetStack, PacketOutput, StackHooks, StackProvider};
use crate::stats::{EngineStats, StatsSnapshot};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const READ_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// External collaborators an engine is assembled from
#[derive(Clone)]
pub struct EngineComponents {
    pub device: Arc<dyn DeviceFactory>,
    pub stack: Arc<dyn StackProvider>,
    pub engines: Arc<dyn EngineProvider>,
    pub dialer: Arc<dyn DirectDialer>,
    pub resolver: Option<Arc<dyn ProcessResolver>>,
}

impl EngineComponents {
    pub fn new(
        device: Arc<dyn DeviceFactory>,
        stack: Arc<dyn StackProvider>,
        engines: Arc<dyn EngineProvider>,
    ) -> Self {
        Self {
            device,
            stack,
            engines,
            dialer: Arc::new(SystemDialer::default()),
            resolver: None,
        }
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn DirectDialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn with_resolver(mut self, resolver: Option<Arc<dyn ProcessResolver>>) -> Self {
        self.resolver = resolver;
        self
    }
}

/// Writes stack output to the device while the engine runs
struct DeviceOutput {
    device: Arc<dyn Device>,
    running: Arc<AtomicBool>,
    stats: Arc<EngineStats>,
}

#[async_trait]
impl PacketOutput for DeviceOutput {
    async fn output(&self, packet: &[u8]) -> Result<usize, DeviceError> {
        if !self.running.load(Ordering::Acquire) {
            self.stats.packet_discarded();
            return Ok(0);
        }
        let n = self.device.send(packet).await?;
        self.stats.packet_out();
        Ok(n)
    }
}

struct Handles {
    stack: Arc<dyn NetStack>,
    proxy: Arc<dyn ProxyEngine>,
    pump: JoinHandle<()>,
    device: Arc<dyn Device>,
}

/// A started engine instance. Single use: a stopped engine is not restarted,
/// a new one is started instead.
pub struct Engine {
    running: Arc<AtomicBool>,
    handles: Mutex<Option<Handles>>,
    shutdown: CancellationToken,
    stats: Arc<EngineStats>,
}

impl Engine {
    pub async fn start(mut config: EngineConfig, components: EngineComponents) -> Result<Engine, StartError> {
        config.validate()?;

        let proxy = components
            .engines
            .create(&config.proxy)
            .map_err(StartError::EngineInitFailed)?;
        info!("Proxy engine {} initialized", proxy.name());

        let device = match components.device.open(&config.tun).await {
            Ok(device) => device,
            Err(e) => {
                close_quietly_engine(&proxy).await;
                return Err(StartError::DeviceUnavailable(e));
            }
        };

        let exceptions = ExceptionSet::new(&config.exception_apps);
        let sniffing = SniffingPolicy::from_names(&config.sniffing);
        let stats = Arc::new(EngineStats::default());
        let running = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let udp_timeout = config.udp_timeout();
        let dispatcher = DispatcherBuilder::new(stats.clone(), shutdown.child_token())
            .exceptions(exceptions)
            .udp_enabled(config.udp_enabled)
            .resolver(components.resolver.clone())
            .build(
                ProxyHandler::new(proxy.clone(), sniffing, udp_timeout),
                DirectHandler::new(components.dialer.clone(), config.send_through, udp_timeout),
                DnsFallbackHandler::new(
                    components.dialer.clone(),
                    config.dns_fallback.clone(),
                    stats.clone(),
                ),
            );

        let hooks = StackHooks {
            output: Arc::new(DeviceOutput {
                device: device.clone(),
                running: running.clone(),
                stats: stats.clone(),
            }),
            acceptor: Arc::new(dispatcher),
        };
        let mtu = device.mtu();
        let stack = match components.stack.build(hooks, mtu) {
            Ok(stack) => stack,
            Err(e) => {
                shutdown.cancel();
                close_quietly_engine(&proxy).await;
                if let Err(close_err) = device.close().await {
                    debug!("Device close after failed start: {}", close_err);
                }
                return Err(StartError::Stack(e));
            }
        };

        running.store(true, Ordering::Release);
        let pump = tokio::spawn(pump(
            device.clone(),
            stack.clone(),
            running.clone(),
            shutdown.child_token(),
            stats.clone(),
        ));

        info!(
            "Engine started on {} (mtu {}, udp {}, {} exception apps, sniffing {:?})",
            device.name(),
            mtu,
            if config.udp_enabled { "proxied" } else { "dns-fallback" },
            config.exception_apps.len(),
            sniffing
        );

        Ok(Engine {
            running,
            handles: Mutex::new(Some(Handles {
                stack,
                proxy,
                pump,
                device,
            })),
            shutdown,
            stats,
        })
    }

    /// Tear the instance down. A second call is a no-op.
    pub async fn stop(&self) -> Result<(), StopError> {
        // output hook goes quiet before anything is closed
        self.running.store(false, Ordering::Release);
        let Some(handles) = self.handles.lock().take() else {
            return Ok(());
        };
        info!("Stopping engine");

        let mut failures = Vec::new();
        if let Err(e) = handles.stack.close().await {
            warn!("Failed to close stack: {}", e);
            failures.push(ShutdownError::new("stack", e));
        }
        if let Err(e) = handles.proxy.close().await {
            warn!("Failed to close proxy engine: {}", e);
            failures.push(ShutdownError::new("proxy engine", e));
        }

        // cancels the pump and every flow task
        self.shutdown.cancel();
        handles.pump.abort();
        let _ = handles.pump.await;

        if let Err(e) = handles.device.close().await {
            warn!("Failed to close device: {}", e);
            failures.push(ShutdownError::new("device", e));
        }

        if failures.is_empty() {
            info!("Engine stopped");
            Ok(())
        } else {
            Err(StopError { failures })
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.handles.get_mut().is_some() {
            warn!("Engine dropped while running; cancelling its tasks");
            self.running.store(false, Ordering::Release);
            self.shutdown.cancel();
        }
    }
}

async fn close_quietly_engine(proxy: &Arc<dyn ProxyEngine>) {
    if let Err(e) = proxy.close().await {
        debug!("Proxy engine close after failed start: {}", e);
    }
}

/// Feed device packets to the stack, in read order, until cancelled.
async fn pump(
    device: Arc<dyn Device>,
    stack: Arc<dyn NetStack>,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    stats: Arc<EngineStats>,
) {
    let mut buf = vec![0u8; device.mtu()];
    debug!("Device pump started ({} byte buffer)", buf.len());
    loop {
        let read = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            read = device.recv(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                stats.zero_read();
                debug!("Zero-length read from device {}", device.name());
                tokio::task::yield_now().await;
            }
            Ok(n) => {
                stats.packet_in();
                if let Err(e) = stack.input(&buf[..n]).await {
                    trace!("Stack rejected packet: {}", e);
                }
            }
            Err(e) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                stats.read_error();
                error!("Device read error: {}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                }
            }
        }
    }
    debug!("Device pump stopped");
}
