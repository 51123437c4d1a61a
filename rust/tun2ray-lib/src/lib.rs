//! Embeddable entry points for tun2ray.
//!
//! Hosts drive a single process-wide engine instance through [`api`], the
//! C ABI in [`ffi`] or, on Android, the JNI exports.

use once_cell::sync::{Lazy, OnceCell};
use tokio::runtime::Runtime;
use tokio::sync::Mutex;
use tun2ray_core::Engine;

pub mod api;
mod error;
pub mod ffi;

#[cfg(target_os = "android")]
pub mod android_jni;

pub use api::*;
pub use error::*;

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// The running engine, if any. Start and stop serialize on this lock.
static INSTANCE: Lazy<Mutex<Option<Engine>>> = Lazy::new(|| Mutex::new(None));

/// Runtime shared by every blocking entry point
pub(crate) fn runtime() -> Result<&'static Runtime> {
    RUNTIME.get_or_try_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("tun2ray-worker")
            .build()
            .map_err(|e| LibError::Runtime(e.to_string()))
    })
}
