//! Dynamic library boundary
//!
//! A native module exports
//! `int plugin_invoke(const char* method, const char* params, char** result)`
//! and optionally `void plugin_free(char*)`. Results are JSON envelopes:
//!
//! ```json
//! {"result": ..., "error": {"kind": "http", "code": 404, "message": "..."},
//!  "logs": [{"level": "info", "message": "..."}]}
//! ```

use libloading::{Library, Symbol};
use serde::Deserialize;
use serde_json::Value;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::bridge::runtime::ForeignError;
use crate::core::error::{BridgeError, Result};
use crate::core::logging::forward_module_log;

const INVOKE_SYMBOL: &[u8] = b"plugin_invoke";
const FREE_SYMBOL: &[u8] = b"plugin_free";

type InvokeFn = unsafe extern "C" fn(*const c_char, *const c_char, *mut *mut c_char) -> c_int;
type FreeFn = unsafe extern "C" fn(*mut c_char);

#[derive(Debug, Deserialize)]
struct EnvelopeError {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct LogLine {
    #[serde(default)]
    level: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Envelope {
    result: Value,
    error: Option<EnvelopeError>,
    logs: Vec<LogLine>,
}

impl From<EnvelopeError> for ForeignError {
    fn from(err: EnvelopeError) -> Self {
        match (err.kind.as_str(), err.code) {
            ("http", Some(code)) => ForeignError::Http { code, message: err.message },
            ("io", _) | ("http", None) => ForeignError::Io(err.message),
            _ => ForeignError::Other(err.message),
        }
    }
}

/// Decode what `plugin_invoke` returned, forwarding any module log lines
pub(crate) fn decode_envelope(module: &str, code: i32, text: Option<&str>) -> std::result::Result<Value, ForeignError> {
    let Some(text) = text else {
        if code == 0 {
            return Ok(Value::Null);
        }
        return Err(ForeignError::Other(format!("module returned error code {}", code)));
    };

    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| ForeignError::Other(format!("invalid module response: {}", e)))?;

    for line in &envelope.logs {
        forward_module_log(module, &line.level, &line.message);
    }

    if let Some(err) = envelope.error {
        return Err(err.into());
    }
    if code != 0 {
        return Err(ForeignError::Other(format!("module returned error code {}", code)));
    }
    Ok(envelope.result)
}

/// A loaded module library
pub struct NativeLibrary {
    name: String,
    path: PathBuf,
    library: Library,
    has_free: bool,
}

impl NativeLibrary {
    /// Load `path`, requiring the `plugin_invoke` entry point
    pub fn open(name: &str, path: &Path) -> Result<Self> {
        // Safety: loading runs the library's initializers; only installed,
        // hash-verified module artifacts reach this point.
        let library = unsafe { Library::new(path) }.map_err(|e| {
            BridgeError::InvalidModule(format!("failed to load library {}: {}", path.display(), e))
        })?;

        let has_invoke = unsafe { library.get::<InvokeFn>(INVOKE_SYMBOL) }.is_ok();
        if !has_invoke {
            return Err(BridgeError::InvalidModule(format!(
                "library {} does not export plugin_invoke",
                path.display()
            )));
        }
        let has_free = unsafe { library.get::<FreeFn>(FREE_SYMBOL) }.is_ok();

        debug!(module = %name, path = %path.display(), has_free, "Native library loaded");
        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            library,
            has_free,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Call `method` with JSON `params`. Blocks for as long as the module does.
    pub fn invoke(&self, method: &str, params: &Value) -> std::result::Result<Value, ForeignError> {
        let method_c = CString::new(method)
            .map_err(|e| ForeignError::Other(format!("invalid method name: {}", e)))?;
        let params_c = CString::new(params.to_string())
            .map_err(|e| ForeignError::Other(format!("invalid parameters: {}", e)))?;

        let invoke: Symbol<InvokeFn> = unsafe { self.library.get(INVOKE_SYMBOL) }
            .map_err(|e| ForeignError::Other(format!("plugin_invoke unavailable: {}", e)))?;

        let mut result_ptr: *mut c_char = std::ptr::null_mut();
        let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
            invoke(method_c.as_ptr(), params_c.as_ptr(), &mut result_ptr)
        }))
        .map_err(|_| {
            error!(module = %self.name, method, "Native module panicked");
            ForeignError::Other(format!("module panicked in {}", method))
        })?;

        let text = if result_ptr.is_null() {
            None
        } else {
            let text = unsafe { CStr::from_ptr(result_ptr) }.to_string_lossy().into_owned();
            self.free(result_ptr);
            Some(text)
        };

        decode_envelope(&self.name, code, text.as_deref())
    }

    /// Release a result string with the module's own allocator when it exports one
    fn free(&self, ptr: *mut c_char) {
        if self.has_free {
            if let Ok(free) = unsafe { self.library.get::<FreeFn>(FREE_SYMBOL) } {
                unsafe { free(ptr) };
                return;
            }
        }
        unsafe { libc::free(ptr as *mut libc::c_void) };
    }
}
