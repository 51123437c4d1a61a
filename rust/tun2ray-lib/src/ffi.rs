//! C ABI over the singleton engine.
//!
//! Functions return `0` on success and a negative [`LibError::code`] on
//! failure. The failure message is kept per thread and fetched with
//! `tun2ray_last_error()`.

use crate::api::{is_running_blocking, start_blocking, stop_blocking, DeviceSource};
use crate::error::LibError;
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use tracing::error;

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn set_last_error(message: String) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

fn report(result: Result<(), LibError>) -> i32 {
    match result {
        Ok(()) => {
            clear_last_error();
            0
        }
        Err(e) => {
            error!("{}", e);
            let code = e.code();
            set_last_error(e.to_string());
            code
        }
    }
}

/// # Safety
///
/// `ptr` must be NULL or a valid null-terminated string.
unsafe fn c_str_arg<'a>(ptr: *const c_char, name: &str) -> Result<&'a str, LibError> {
    if ptr.is_null() {
        return Err(LibError::InvalidArgument(format!("{} is NULL", name)));
    }
    // SAFETY: checked non-null above; the caller guarantees termination
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| LibError::InvalidArgument(format!("{} is not valid UTF-8", name)))
}

/// Create a TUN interface from `config_json` and start the engine.
///
/// # Safety
///
/// `config_json` must be a valid null-terminated UTF-8 string.
#[no_mangle]
pub unsafe extern "C" fn tun2ray_start(config_json: *const c_char) -> i32 {
    // SAFETY: forwarded caller contract
    let result = unsafe { c_str_arg(config_json, "config_json") }
        .and_then(|config| start_blocking(config, DeviceSource::Create));
    report(result)
}

/// Start the engine on a TUN descriptor owned by the caller. The
/// descriptor is duplicated, so the caller may close its copy.
///
/// # Safety
///
/// `config_json` must be a valid null-terminated UTF-8 string.
#[no_mangle]
pub unsafe extern "C" fn tun2ray_start_fd(fd: i32, config_json: *const c_char) -> i32 {
    // SAFETY: forwarded caller contract
    let result = unsafe { c_str_arg(config_json, "config_json") }
        .and_then(|config| start_blocking(config, DeviceSource::Fd(fd)));
    report(result)
}

/// Stop the engine. Returns `0` when nothing was running.
#[no_mangle]
pub extern "C" fn tun2ray_stop() -> i32 {
    report(stop_blocking())
}

#[no_mangle]
pub extern "C" fn tun2ray_is_running() -> bool {
    is_running_blocking()
}

/// Message of the last failed call on this thread, or NULL.
/// Free the result with `tun2ray_string_free()`.
#[no_mangle]
pub extern "C" fn tun2ray_last_error() -> *mut c_char {
    LAST_ERROR.with(|slot| match slot.borrow().as_deref() {
        Some(message) => CString::new(message.replace('\0', " "))
            .map(CString::into_raw)
            .unwrap_or(std::ptr::null_mut()),
        None => std::ptr::null_mut(),
    })
}

/// # Safety
///
/// `s` must be NULL or a pointer returned by this library.
#[no_mangle]
pub unsafe extern "C" fn tun2ray_string_free(s: *mut c_char) {
    if !s.is_null() {
        // SAFETY: the pointer came from CString::into_raw in this library
        unsafe {
            drop(CString::from_raw(s));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn last_error() -> Option<String> {
        let ptr = tun2ray_last_error();
        if ptr.is_null() {
            return None;
        }
        let message = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
        unsafe { tun2ray_string_free(ptr) };
        Some(message)
    }

    #[test]
    fn test_null_config_sets_last_error() {
        let code = unsafe { tun2ray_start(std::ptr::null()) };
        assert_eq!(code, -7);
        assert!(last_error().unwrap().contains("config_json is NULL"));
    }

    #[test]
    fn test_stop_clears_last_error() {
        let bad = CString::new("{not json").unwrap();
        assert_eq!(unsafe { tun2ray_start_fd(-1, bad.as_ptr()) }, -1);
        assert!(last_error().is_some());

        assert_eq!(tun2ray_stop(), 0);
        assert!(last_error().is_none());
        assert!(!tun2ray_is_running());
    }
}
