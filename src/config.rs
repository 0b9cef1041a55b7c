//! Run-time configuration of the high-level API.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variables consulted for the process rank, in priority order.
pub const RANK_VARIABLES: [&str; 4] = [
    "OMPI_COMM_WORLD_RANK",
    "ALPS_APP_PE",
    "PMI_RANK",
    "SLURM_PROCID",
];

/// Settings controlling diagnostics, event selection and report placement.
///
/// `Config::default()` is the configuration of an empty environment. `Config::from_env()` reads
/// the `PAPI_*` variables and the job-scheduler rank variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Suppress informational, warning and error diagnostics.
    ///
    /// Defaults to `false`.
    quiet: bool,
    /// Comma separated event list used when the API did not set one.
    ///
    /// Defaults to none.
    events: Option<String>,
    /// Multiplex events of the CPU component.
    ///
    /// Defaults to `false`.
    multiplex: bool,
    /// Directory receiving the measurement directory.
    ///
    /// Defaults to the current working directory.
    output_dir: Option<PathBuf>,
    /// Echo the written report to stdout.
    ///
    /// Defaults to `false`.
    report: bool,
    /// Rank of this process inside a parallel job.
    ///
    /// Defaults to none, in which case a unique file name is generated.
    rank: Option<i64>,
    /// How long late threads wait for the one-time initialization.
    ///
    /// Defaults to 5 seconds.
    init_timeout: Duration,
    /// Sleep between two checks of the initialization flag.
    ///
    /// Defaults to 10 microseconds.
    init_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            quiet: false,
            events: None,
            multiplex: false,
            output_dir: None,
            report: false,
            rank: None,
            init_timeout: Duration::from_secs(5),
            init_poll_interval: Duration::from_micros(10),
        }
    }
}

impl Config {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        Config::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key/value lookup.
    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Config::default();
        cfg.quiet = lookup("PAPI_NO_WARNING").is_some();
        cfg.events = lookup("PAPI_EVENTS");
        cfg.multiplex = lookup("PAPI_MULTIPLEX").is_some();
        cfg.output_dir = lookup("PAPI_OUTPUT_DIRECTORY").map(PathBuf::from);
        cfg.report = lookup("PAPI_REPORT").is_some();
        cfg.rank = RANK_VARIABLES
            .iter()
            .find_map(|var| lookup(var))
            .map(|val| crate::util::atoi(&val));
        cfg
    }

    builder_pattern_bool!(
        /// Suppress diagnostics.
        quiet => quiet
    );

    builder_pattern!(
        /// Set the event list used when the API does not set one.
        events: Option<String>
    );

    builder_pattern_bool!(
        /// Multiplex events of the CPU component.
        multiplex
    );

    builder_pattern!(
        /// Set the directory that receives the measurement directory.
        output_dir: Option<PathBuf>
    );

    builder_pattern_bool!(
        /// Echo the report to stdout after writing it.
        report
    );

    builder_pattern!(
        /// Set the rank used to name the report file.
        rank: Option<i64>
    );

    builder_pattern!(
        /// Set how long late threads wait for initialization.
        init_timeout: Duration
    );

    builder_pattern!(
        /// Set the polling interval used while waiting for initialization.
        init_poll_interval: Duration
    );

    /// Check if diagnostics are suppressed.
    #[inline]
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Event list from the configuration.
    #[inline]
    pub fn event_list(&self) -> Option<&str> {
        self.events.as_deref()
    }

    /// Check if multiplexing was requested.
    #[inline]
    pub fn is_multiplexed(&self) -> bool {
        self.multiplex
    }

    /// Directory receiving the measurement directory, if overridden.
    #[inline]
    pub fn output_prefix(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    /// Check if the report is echoed to stdout.
    #[inline]
    pub fn echo_report(&self) -> bool {
        self.report
    }

    /// Rank of this process, if one was detected.
    #[inline]
    pub fn process_rank(&self) -> Option<i64> {
        self.rank
    }

    /// Timeout of the initialization spin-wait.
    #[inline]
    pub fn wait_timeout(&self) -> Duration {
        self.init_timeout
    }

    /// Polling interval of the initialization spin-wait.
    #[inline]
    pub fn wait_interval(&self) -> Duration {
        self.init_poll_interval
    }
}
