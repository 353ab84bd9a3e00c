//! FFI bindings for Synheart Sentinel
//!
//! This module provides C-compatible functions for calling Sentinel from other languages.
//! All functions use C strings (null-terminated) and return allocated memory that
//! must be freed by the caller using `sentinel_free_string`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::DetectionConfig;
use crate::ml::MlSignal;
use crate::pipeline::{compute_baseline_json, detect_json, DetectionEngine};
use crate::store::{AckTransition, InMemoryStore};
use crate::types::MetricSample;

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Read a required string argument
unsafe fn required_arg(ptr: *const c_char, name: &str) -> Result<String, String> {
    if ptr.is_null() {
        return Err(format!("Null {} pointer", name));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(|s| s.to_string())
        .map_err(|_| format!("Invalid {} string (not UTF-8)", name))
}

/// Read an optional string argument; NULL means absent
unsafe fn optional_arg(ptr: *const c_char, name: &str) -> Result<Option<String>, String> {
    if ptr.is_null() {
        return Ok(None);
    }
    required_arg(ptr, name).map(Some)
}

/// Helper to convert Rust string to C string (caller must free)
fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Hand a JSON result to the caller, or record the error and return NULL
fn json_result<E: ToString>(result: Result<String, E>) -> *mut c_char {
    match result {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Stateless API
// ============================================================================

/// Compute a baseline from a JSON array of daily samples.
///
/// # Safety
/// - `history_json` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `sentinel_free_string`.
/// - Returns NULL on error; call `sentinel_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn sentinel_compute_baseline(history_json: *const c_char) -> *mut c_char {
    clear_last_error();

    let history = match required_arg(history_json, "history_json") {
        Ok(s) => s,
        Err(e) => {
            set_last_error(&e);
            return ptr::null_mut();
        }
    };

    json_result(compute_baseline_json(&history))
}

/// Detect anomalies for one sample and return the detection outcome JSON.
///
/// # Safety
/// - `sample_json` must be a valid null-terminated C string.
/// - `baseline_json` and `ml_signal_json` may be NULL (absent) or valid C strings.
/// - Returns a newly allocated string that must be freed with `sentinel_free_string`.
/// - Returns NULL on error; call `sentinel_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn sentinel_detect(
    sample_json: *const c_char,
    baseline_json: *const c_char,
    ml_signal_json: *const c_char,
) -> *mut c_char {
    clear_last_error();

    let args = required_arg(sample_json, "sample_json").and_then(|sample| {
        let baseline = optional_arg(baseline_json, "baseline_json")?;
        let ml_signal = optional_arg(ml_signal_json, "ml_signal_json")?;
        Ok((sample, baseline, ml_signal))
    });

    match args {
        Ok((sample, baseline, ml_signal)) => json_result(detect_json(
            &sample,
            baseline.as_deref(),
            ml_signal.as_deref(),
        )),
        Err(e) => {
            set_last_error(&e);
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Stateful Engine API
// ============================================================================

/// Opaque handle to a DetectionEngine over an in-memory store
pub struct SentinelEngineHandle {
    engine: DetectionEngine<InMemoryStore>,
}

/// Create a new engine.
///
/// # Safety
/// - `config_json` may be NULL (defaults) or a valid null-terminated C string.
/// - Returns a pointer that must be freed with `sentinel_engine_free`.
/// - Returns NULL on error.
#[no_mangle]
pub unsafe extern "C" fn sentinel_engine_new(config_json: *const c_char) -> *mut SentinelEngineHandle {
    clear_last_error();

    let config = match optional_arg(config_json, "config_json") {
        Ok(None) => Ok(DetectionConfig::default()),
        Ok(Some(json)) => DetectionConfig::from_json(&json).map_err(|e| e.to_string()),
        Err(e) => Err(e),
    };

    let engine = config.and_then(|config| {
        DetectionEngine::with_config(Arc::new(InMemoryStore::new()), config)
            .map_err(|e| e.to_string())
    });

    match engine {
        Ok(engine) => Box::into_raw(Box::new(SentinelEngineHandle { engine })),
        Err(e) => {
            set_last_error(&e);
            ptr::null_mut()
        }
    }
}

/// Free an engine.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `sentinel_engine_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn sentinel_engine_free(engine: *mut SentinelEngineHandle) {
    if !engine.is_null() {
        drop(Box::from_raw(engine));
    }
}

/// Add (or correct) a historical daily sample.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `sentinel_engine_new`.
/// - `sample_json` must be a valid null-terminated C string.
/// - Returns 0 on success, -1 on error (see `sentinel_last_error`).
#[no_mangle]
pub unsafe extern "C" fn sentinel_engine_add_sample(
    engine: *mut SentinelEngineHandle,
    sample_json: *const c_char,
) -> i32 {
    clear_last_error();

    if engine.is_null() {
        set_last_error("Null engine pointer");
        return -1;
    }
    let handle = &*engine;

    let sample = required_arg(sample_json, "sample_json").and_then(|json| {
        let sample: MetricSample = serde_json::from_str(&json).map_err(|e| e.to_string())?;
        sample.validate().map_err(|e| e.to_string())?;
        Ok(sample)
    });

    match sample {
        Ok(sample) => {
            handle.engine.store().upsert_sample(sample);
            0
        }
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

/// Run the daily detection for a sample and return the report JSON.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `sentinel_engine_new`.
/// - `sample_json` must be a valid null-terminated C string.
/// - `ml_signal_json` may be NULL (no ML signal) or a valid C string.
/// - Returns a newly allocated string that must be freed with `sentinel_free_string`.
/// - Returns NULL on error; call `sentinel_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn sentinel_engine_process_day(
    engine: *mut SentinelEngineHandle,
    sample_json: *const c_char,
    ml_signal_json: *const c_char,
) -> *mut c_char {
    clear_last_error();

    if engine.is_null() {
        set_last_error("Null engine pointer");
        return ptr::null_mut();
    }
    let handle = &*engine;

    let report = required_arg(sample_json, "sample_json").and_then(|json| {
        let sample: MetricSample = serde_json::from_str(&json).map_err(|e| e.to_string())?;
        let ml_signal = optional_arg(ml_signal_json, "ml_signal_json")?
            .map(|json| serde_json::from_str::<MlSignal>(&json))
            .transpose()
            .map_err(|e| e.to_string())?;
        let report = handle
            .engine
            .process_day(&sample, ml_signal)
            .map_err(|e| e.to_string())?;
        serde_json::to_string(&report).map_err(|e| e.to_string())
    });

    json_result(report)
}

/// Acknowledge an anomaly by id.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `sentinel_engine_new`.
/// - `anomaly_id` must be a valid null-terminated C string holding a UUID.
/// - Returns 0 when newly acknowledged, 1 when it already was, -1 on error.
#[no_mangle]
pub unsafe extern "C" fn sentinel_engine_acknowledge(
    engine: *mut SentinelEngineHandle,
    anomaly_id: *const c_char,
) -> i32 {
    clear_last_error();

    if engine.is_null() {
        set_last_error("Null engine pointer");
        return -1;
    }
    let handle = &*engine;

    let transition = required_arg(anomaly_id, "anomaly_id").and_then(|id| {
        let id = Uuid::parse_str(&id).map_err(|e| e.to_string())?;
        handle.engine.tracker().acknowledge(id).map_err(|e| e.to_string())
    });

    match transition {
        Ok(AckTransition::Acknowledged) => 0,
        Ok(AckTransition::AlreadyAcknowledged) => 1,
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

/// Unacknowledged anomalies for a user as a JSON array.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `sentinel_engine_new`.
/// - `user_id` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `sentinel_free_string`.
/// - Returns NULL on error; call `sentinel_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn sentinel_engine_pending(
    engine: *mut SentinelEngineHandle,
    user_id: *const c_char,
) -> *mut c_char {
    clear_last_error();

    if engine.is_null() {
        set_last_error("Null engine pointer");
        return ptr::null_mut();
    }
    let handle = &*engine;

    let pending = required_arg(user_id, "user_id").and_then(|user_id| {
        let pending = handle
            .engine
            .tracker()
            .pending(&user_id)
            .map_err(|e| e.to_string())?;
        serde_json::to_string(&pending).map_err(|e| e.to_string())
    });

    json_result(pending)
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by Sentinel functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a Sentinel function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn sentinel_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next Sentinel function call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn sentinel_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

// ============================================================================
// Version Information
// ============================================================================

/// Get the Sentinel library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn sentinel_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
