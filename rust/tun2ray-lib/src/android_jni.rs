#![cfg(target_os = "android")]

use crate::api::{start_config_blocking, stop_blocking, DeviceSource};
use jni::objects::{GlobalRef, JClass, JObject, JString, JValue};
use jni::sys::{jboolean, jint, jstring, JNI_TRUE};
use jni::{JNIEnv, JavaVM};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};
use tun2ray_core::{init_logging, EngineConfig, LogLevel};

/// Reset on every `nativeInit` so a restarted VpnService replaces the old one
static JAVA_VM: RwLock<Option<JavaVM>> = RwLock::new(None);
static VPN_SERVICE: RwLock<Option<GlobalRef>> = RwLock::new(None);
static JNI_INITIALIZED: AtomicBool = AtomicBool::new(false);

fn to_jstring(env: &mut JNIEnv<'_>, message: &str) -> jstring {
    match env.new_string(message) {
        Ok(s) => s.into_raw(),
        Err(e) => {
            error!("Failed to create Java string: {:?}", e);
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub extern "system" fn Java_io_tun2ray_Tun2RayService_nativeInit<'local>(
    env: JNIEnv<'local>,
    vpn_service: JObject<'local>,
) {
    init_logging(LogLevel::Info);
    JNI_INITIALIZED.store(false, Ordering::SeqCst);
    *JAVA_VM.write() = None;
    *VPN_SERVICE.write() = None;

    match env.get_java_vm() {
        Ok(vm) => *JAVA_VM.write() = Some(vm),
        Err(e) => {
            error!("Failed to get JavaVM: {:?}", e);
            return;
        }
    }
    match env.new_global_ref(vpn_service) {
        Ok(service) => *VPN_SERVICE.write() = Some(service),
        Err(e) => {
            error!("Failed to create global reference: {:?}", e);
            return;
        }
    }

    JNI_INITIALIZED.store(true, Ordering::SeqCst);
    tun2ray_core::set_protect_callback(protect_socket_via_jni);
    info!("JNI bridge initialized, socket protection enabled");
}

/// Start on the VpnService descriptor. Returns an empty string on success
/// and a diagnostic otherwise.
#[no_mangle]
pub extern "system" fn Java_io_tun2ray_Tun2RayService_nativeStart<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    fd: jint,
    config: JString<'local>,
    udp_enabled: jboolean,
    mtu: jint,
) -> jstring {
    let config: String = match env.get_string(&config) {
        Ok(s) => s.into(),
        Err(e) => return to_jstring(&mut env, &format!("invalid config string: {:?}", e)),
    };

    let mut engine_config = match EngineConfig::from_json(&config) {
        Ok(c) => c,
        Err(e) => return to_jstring(&mut env, &format!("invalid config: {}", e)),
    };
    engine_config.udp_enabled = udp_enabled == JNI_TRUE;
    if mtu > 0 {
        engine_config.tun.mtu = mtu.min(u16::MAX as jint) as u16;
    }

    match start_config_blocking(engine_config, DeviceSource::Fd(fd)) {
        Ok(()) => to_jstring(&mut env, ""),
        Err(e) => {
            error!("nativeStart failed: {}", e);
            to_jstring(&mut env, &e.to_string())
        }
    }
}

#[no_mangle]
pub extern "system" fn Java_io_tun2ray_Tun2RayService_nativeStop<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
) -> jstring {
    match stop_blocking() {
        Ok(()) => to_jstring(&mut env, ""),
        Err(e) => to_jstring(&mut env, &e.to_string()),
    }
}

/// Call `VpnService.protect(fd)` so the socket bypasses the tunnel.
pub fn protect_socket_via_jni(fd: i32) -> bool {
    if !JNI_INITIALIZED.load(Ordering::SeqCst) {
        warn!("JNI not initialized, cannot protect socket fd={}", fd);
        return false;
    }

    let vm_guard = JAVA_VM.read();
    let service_guard = VPN_SERVICE.read();
    let (Some(vm), Some(service)) = (vm_guard.as_ref(), service_guard.as_ref()) else {
        warn!("VpnService not available, cannot protect socket fd={}", fd);
        return false;
    };

    let mut env = match vm.attach_current_thread() {
        Ok(env) => env,
        Err(e) => {
            error!("Failed to attach thread to JVM: {:?}", e);
            return false;
        }
    };

    match env.call_method(service.as_obj(), "protect", "(I)Z", &[JValue::Int(fd as jint)]) {
        Ok(ret) => match ret.z() {
            Ok(protected) => {
                if protected {
                    debug!("Socket fd={} protected", fd);
                } else {
                    warn!("VpnService.protect() returned false for fd={}", fd);
                }
                protected
            }
            Err(e) => {
                error!("Failed to read protect() result: {:?}", e);
                false
            }
        },
        Err(e) => {
            error!("Failed to call VpnService.protect(): {:?}", e);
            if env.exception_check().unwrap_or(false) {
                let _ = env.exception_describe();
                let _ = env.exception_clear();
            }
            false
        }
    }
}
