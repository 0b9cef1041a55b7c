//! Utilities for opening, controlling and reading counting perf events.

use crate::perf::ffi;
use crate::Result;
use byteorder::{NativeEndian, ReadBytesExt};
use nix::libc;
use std::convert::TryInto;
use std::os::unix::io::{AsRawFd, FromRawFd};

/// A counting performance counter backed by a perf file descriptor.
#[derive(Debug)]
pub struct PerfEvent {
    /// Attributes corresponding to this event.
    pub attr: ffi::perf_event_attr,
    /// File corresponding to the underlying perf event.
    pub file: std::fs::File,
}

impl PerfEvent {
    /// Construct a new perf event using the associated builder.
    pub fn build() -> PerfEventBuilder {
        PerfEventBuilder::default()
    }

    /// Enable counting for event.
    pub fn enable(&self) -> Result<()> {
        unsafe {
            ffi::perf_event_ioc_enable(self.file.as_raw_fd())?;
        }
        Ok(())
    }

    /// Disable counting for event.
    pub fn disable(&self) -> Result<()> {
        unsafe {
            ffi::perf_event_ioc_disable(self.file.as_raw_fd())?;
        }
        Ok(())
    }

    /// Reset counting for event.
    pub fn reset(&self) -> Result<()> {
        unsafe {
            ffi::perf_event_ioc_reset(self.file.as_raw_fd())?;
        }
        Ok(())
    }

    /// Read the counter together with its enabled and running times.
    pub fn read_value(&self) -> Result<PerfEventValue> {
        let mut bytes = [0u8; 24];
        let n = nix::unistd::read(self.file.as_raw_fd(), &mut bytes)?;
        PerfEventValue::from_cursor(&mut std::io::Cursor::new(&bytes[..n]))
    }
}

/// A single reading of a counting event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfEventValue {
    /// Counter measurement.
    pub value: u64,
    /// Total time spent enabled.
    pub time_enabled: u64,
    /// Total time spent running.
    ///
    /// In the case the of event multiplexing the `time_enabled` and `time running` values can be
    /// used to scale an estimated value for the count.
    pub time_running: u64,
}

impl PerfEventValue {
    /// Parse this structure from a serialized in-memory format provided by the kernel.
    pub fn from_cursor<T>(ptr: &mut std::io::Cursor<T>) -> Result<Self>
    where
        std::io::Cursor<T>: byteorder::ReadBytesExt,
    {
        Ok(PerfEventValue {
            value: ptr.read_u64::<NativeEndian>()?,
            time_enabled: ptr.read_u64::<NativeEndian>()?,
            time_running: ptr.read_u64::<NativeEndian>()?,
        })
    }

    /// Count extrapolated to the full enabled time.
    ///
    /// Returns `0` if the event never ran.
    pub fn scaled(&self) -> u64 {
        if self.time_running == 0 {
            return 0;
        }
        if self.time_running >= self.time_enabled {
            return self.value;
        }
        let scaled =
            u128::from(self.value) * u128::from(self.time_enabled) / u128::from(self.time_running);
        scaled.try_into().unwrap_or(u64::MAX)
    }
}

/// Helper struct to build a `PerfEvent` object.
///
/// Events always count the calling thread on any CPU, excluding kernel and hypervisor code.
#[derive(Debug)]
pub struct PerfEventBuilder {
    /// File descriptor for the group leader event.
    ///
    /// Defaults to none.
    leader: libc::c_int,
    /// Should start the counter disabled.
    ///
    /// Defaults to  `false`.
    start_disabled: bool,
}

impl Default for PerfEventBuilder {
    fn default() -> Self {
        PerfEventBuilder {
            leader: -1,
            start_disabled: false,
        }
    }
}

impl PerfEventBuilder {
    /// Set the fields of an perf_event_attr based on this builder.
    fn _set_attr_config(&self, attr: &mut ffi::perf_event_attr) {
        use ffi::perf_event_read_format::*;
        attr.size = std::mem::size_of::<ffi::perf_event_attr>() as u32;
        attr.read_format = PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING;
        attr.set_exclude_hv(1);
        attr.set_exclude_kernel(1);
        attr.set_disabled(if self.start_disabled { 1 } else { 0 });
    }

    /// Generate the `PerfEvent` from this builder.
    ///
    /// Fields set in the builder overwrite those of `base_event_attr`.
    pub fn open(&self, base_event_attr: ffi::perf_event_attr) -> Result<PerfEvent> {
        let mut attr = base_event_attr;
        self._set_attr_config(&mut attr);

        let fd = ffi::perf_event_open(
            &attr,
            0,
            -1,
            self.leader,
            ffi::PERF_FLAG_FD_CLOEXEC,
        )?;

        // SAFETY: `fd` was just returned by `perf_event_open` and is owned by nobody else.
        let file = unsafe { std::fs::File::from_raw_fd(fd) };
        Ok(PerfEvent { attr, file })
    }

    builder_pattern!(
        /// Set group leader for this perf event
        leader: libc::c_int
    );

    builder_pattern_bool!(
        /// Start the counter disabled.
        start_disabled
    );
}
