//! Minimal run-time metrics sink.
//!
//! No exporter is bundled; the host process may register a raw callback that
//! receives `(name, value)` pairs for every counter and gauge update.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use once_cell::sync::OnceCell;
use std::ffi::CString;
use std::os::raw::{c_char, c_ulonglong};
use std::sync::Arc;

/// Signature for external collectors. `name` is NUL-terminated and only valid
/// for the duration of the call.
pub type StatsCallback = unsafe extern "C" fn(name: *const c_char, value: c_ulonglong);

static CALLBACK: OnceCell<StatsCallback> = OnceCell::new();

/// Register a callback from C/other languages. Only the first registration wins.
#[no_mangle]
pub extern "C" fn allowedips_register_stats_callback(cb: StatsCallback) {
    let _ = CALLBACK.set(cb);
}

/// One registered metric, forwarding to the callback if there is one.
struct FfiMetric {
    name: CString,
}

impl FfiMetric {
    fn new(key: &Key) -> Arc<Self> {
        // metric names are plain identifiers; an interior NUL would be a bug here
        let name = CString::new(key.name()).unwrap_or_default();
        Arc::new(Self { name })
    }

    #[inline]
    fn emit(&self, value: u64) {
        if let Some(cb) = CALLBACK.get() {
            // SAFETY: the callback contract only borrows `name` for the call.
            unsafe { cb(self.name.as_ptr(), value as c_ulonglong) };
        }
    }
}

impl metrics::CounterFn for FfiMetric {
    fn increment(&self, value: u64) {
        self.emit(value);
    }
    fn absolute(&self, value: u64) {
        self.emit(value);
    }
}

impl metrics::GaugeFn for FfiMetric {
    fn set(&self, value: f64) {
        self.emit(value as u64);
    }
    fn increment(&self, value: f64) {
        self.emit(value as u64);
    }
    fn decrement(&self, value: f64) {
        self.emit(value as u64);
    }
}

impl metrics::HistogramFn for FfiMetric {
    fn record(&self, value: f64) {
        self.emit(value as u64);
    }
}

struct FfiRecorder;

impl Recorder for FfiRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(FfiMetric::new(key))
    }
    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(FfiMetric::new(key))
    }
    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(FfiMetric::new(key))
    }
}

/// Install the forwarding recorder exactly once. A recorder the host already
/// installed is left alone.
pub fn init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        if metrics::set_global_recorder(FfiRecorder).is_err() {
            log::debug!("[TELEMETRY] a global metrics recorder is already installed");
        }
    });
}
