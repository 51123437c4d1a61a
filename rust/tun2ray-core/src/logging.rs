use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

const LOG_BUFFER_CAPACITY: usize = 2000;

/// Recent log lines kept for hosts without a console
static LOG_BUFFER: Lazy<Mutex<LogBuffer>> = Lazy::new(|| Mutex::new(LogBuffer::new(LOG_BUFFER_CAPACITY)));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    Error,
    #[serde(alias = "warn")]
    Warning,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_level(self) -> Option<Level> {
        match self {
            LogLevel::Silent => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warning => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "silent" | "none" | "off" => Ok(LogLevel::Silent),
            "error" => Ok(LogLevel::Error),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// Bounded ring of formatted log lines
pub struct LogBuffer {
    logs: VecDeque<String>,
    max_size: usize,
}

impl LogBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            logs: VecDeque::with_capacity(max_size.min(256)),
            max_size,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.max_size == 0 {
            return;
        }
        if self.logs.len() >= self.max_size {
            self.logs.pop_front();
        }
        self.logs.push_back(line);
    }

    /// Newest `count` lines, oldest first. `0` returns everything.
    pub fn get_logs(&self, count: usize) -> Vec<String> {
        let skip = if count == 0 { 0 } else { self.logs.len().saturating_sub(count) };
        self.logs.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.logs.clear();
    }
}

pub fn recent_logs(count: usize) -> Vec<String> {
    LOG_BUFFER.lock().get_logs(count)
}

pub fn clear_logs() {
    LOG_BUFFER.lock().clear();
}

/// Install the global subscriber: console output plus the in-memory buffer.
/// `RUST_LOG` directives are honoured on top of `level`. Only the first call
/// has an effect.
pub fn init_logging(level: LogLevel) {
    INIT.call_once(|| {
        let Some(level) = level.as_level() else {
            return;
        };

        let mut filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::WARN.into())
            .from_env_lossy();
        for directive in [
            format!("tun2ray_core={}", level),
            format!("tun2ray={}", level),
            format!("tun2ray_bin={}", level),
            "netstack_smoltcp=warn".to_string(),
        ] {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }

        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .compact()
            .with_filter(filter);

        let result = tracing_subscriber::registry()
            .with(fmt_layer)
            .with(BufferLayer { max_level: level })
            .try_init();

        if result.is_ok() {
            tracing::info!("Logging initialized at level: {}", level);
        }
    });
}

struct BufferLayer {
    max_level: Level,
}

impl<S> Layer<S> for BufferLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > self.max_level || !metadata.target().starts_with("tun2ray") {
            return;
        }
        let mut visitor = LogVisitor::default();
        event.record(&mut visitor);
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        LOG_BUFFER
            .lock()
            .push(format!("[{}] [{}] {}", timestamp, metadata.level(), visitor.message));
    }
}

#[derive(Default)]
struct LogVisitor {
    message: String,
}

impl tracing::field::Visit for LogVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message.insert_str(0, value);
        } else {
            let _ = write!(self.message, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message.insert_str(0, &format!("{:?}", value));
        } else {
            let _ = write!(self.message, " {}={:?}", field.name(), value);
        }
    }
}
