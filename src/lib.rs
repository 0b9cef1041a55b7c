//! Region-based hardware performance counter instrumentation.
//!
//! Application code marks named regions with [`region_begin`], [`region_read`] and
//! [`region_end`]. The library lazily brings up the counter backend, maps the requested events
//! onto counter components, keeps one set of counting sessions per thread, accumulates per-region
//! totals across repeated invocations and threads, and writes a JSON report once the program is
//! done.
//!
//! ```no_run
//! papi_hl::region_begin("computation")?;
//! // ... work ...
//! papi_hl::region_read("computation")?;
//! // ... more work ...
//! papi_hl::region_end("computation")?;
//! papi_hl::print_output();
//! # Ok::<(), papi_hl::Error>(())
//! ```
//!
//! The free functions operate on a process-wide [`Profiler`] backed by Linux `perf_event_open`.
//! Independent instances with other backends (for example [`sim::SimBackend`]) can be created
//! with [`Profiler::new`].

#![deny(missing_docs, missing_debug_implementations)]

/// Informational diagnostic, suppressed when the configuration is quiet.
macro_rules! hl_info {
    ($cfg: expr, $($arg: tt)+) => {
        if !$cfg.is_quiet() {
            log::info!("PAPI-HL Info: {}", format_args!($($arg)+));
        }
    };
}

/// Warning diagnostic, suppressed when the configuration is quiet.
macro_rules! hl_warn {
    ($cfg: expr, $($arg: tt)+) => {
        if !$cfg.is_quiet() {
            log::warn!("PAPI-HL Warning: {}", format_args!($($arg)+));
        }
    };
}

/// Error diagnostic, suppressed when the configuration is quiet.
macro_rules! hl_error {
    ($cfg: expr, $($arg: tt)+) => {
        if !$cfg.is_quiet() {
            log::error!("PAPI-HL Error: {}", format_args!($($arg)+));
        }
    };
}

macro_rules! builder_pattern {
    ($(#[$outer:meta])* $var_name: ident : $var_type: ty) => {
        builder_pattern!($(#[$outer])* $var_name => $var_name: $var_type);
    };
    ($(#[$outer:meta])* $name: ident => $var_name: ident : $var_type: ty) => {
        $(#[$outer])*
        pub fn $name(mut self, $var_name: $var_type) -> Self {
            self.$var_name = $var_name;
            self
        }
    };
}

macro_rules! builder_pattern_bool {
    ($(#[$outer:meta])* $var_name: ident) => {
        builder_pattern_bool!($(#[$outer])* $var_name => $var_name);
    };
    ($(#[$outer:meta])* $name: ident => $var_name: ident) => {
        $(#[$outer])*
        pub fn $name(mut self) -> Self {
            self.$var_name = true;
            self
        }
    };
}

mod errors;
pub use errors::{Error, Result};

mod api;
pub use api::{Backend, ComponentId, EventCode, Session, ThreadId};

mod config;
pub use config::{Config, RANK_VARIABLES};

pub mod events;
pub use events::{EventKind, RequestedEvent, DEFAULT_EVENTS};

pub mod registry;
pub use registry::{Component, Registry, TrackedEvent};

mod session;
pub use session::ThreadSession;

pub mod store;
pub use store::{RegionNode, RegionOp, RegionStore, RegionValue, Sample};

pub mod report;

mod profiler;
pub use profiler::Profiler;

pub mod perf;
pub use perf::PerfBackend;

pub mod sim;

pub(crate) mod util;

use lazy_static::lazy_static;
use nix::libc;

lazy_static! {
    static ref GLOBAL: Profiler<PerfBackend> =
        Profiler::new(PerfBackend::default(), Config::from_env());
}

static EXIT_HOOK: std::sync::Once = std::sync::Once::new();

extern "C" fn print_output_at_exit() {
    // Unwinding out of an `atexit` handler aborts the process.
    let _ = std::panic::catch_unwind(|| GLOBAL.print_output());
}

/// The process-wide profiler used by the free functions of this crate.
///
/// The first access registers a process-exit hook that writes the report if it has not been
/// written yet.
pub fn global() -> &'static Profiler<PerfBackend> {
    EXIT_HOOK.call_once(|| unsafe {
        libc::atexit(print_output_at_exit);
    });
    &GLOBAL
}

/// Initialize the process-wide profiler. See [`Profiler::init`].
pub fn init() -> Result<()> {
    global().init()
}

/// Fix the events recorded by the process-wide profiler. See [`Profiler::set_events`].
pub fn set_events(events: Option<&str>) -> Result<()> {
    global().set_events(events)
}

/// Begin a region on the calling thread. See [`Profiler::region_begin`].
pub fn region_begin(region: &str) -> Result<()> {
    global().region_begin(region)
}

/// Record an intermediate sample of a region. See [`Profiler::region_read`].
pub fn region_read(region: &str) -> Result<()> {
    global().region_read(region)
}

/// End a region on the calling thread. See [`Profiler::region_end`].
pub fn region_end(region: &str) -> Result<()> {
    global().region_end(region)
}

/// Release the counting sessions of the calling thread. See [`Profiler::cleanup_thread`].
pub fn cleanup_thread() -> Result<()> {
    global().cleanup_thread()
}

/// Shut down the process-wide profiler. See [`Profiler::finalize`].
pub fn finalize() -> Result<()> {
    global().finalize()
}

/// Write the measurement report if it was not written yet. See [`Profiler::print_output`].
pub fn print_output() {
    global().print_output()
}
