//! Declarations of the Linux `perf_event_open` interface used by this crate.
//!
//! Layouts follow `include/uapi/linux/perf_event.h` (attribute size `PERF_ATTR_SIZE_VER5`).

#![allow(non_camel_case_types, non_upper_case_globals, missing_docs)]

use crate::{Error, Result};
use nix::ioctl_none;
use nix::libc;

/// Values of `perf_event_attr::type_`.
pub mod perf_type_id {
    pub const PERF_TYPE_HARDWARE: u32 = 0;
    pub const PERF_TYPE_SOFTWARE: u32 = 1;
    pub const PERF_TYPE_TRACEPOINT: u32 = 2;
    pub const PERF_TYPE_HW_CACHE: u32 = 3;
    pub const PERF_TYPE_RAW: u32 = 4;
    pub const PERF_TYPE_BREAKPOINT: u32 = 5;
    pub const PERF_TYPE_MAX: u32 = 6;
}

/// Generic hardware events.
pub mod perf_hw_id {
    pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
    pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
    pub const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
    pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
    pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
    pub const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;
    pub const PERF_COUNT_HW_BUS_CYCLES: u64 = 6;
    pub const PERF_COUNT_HW_STALLED_CYCLES_FRONTEND: u64 = 7;
    pub const PERF_COUNT_HW_STALLED_CYCLES_BACKEND: u64 = 8;
    pub const PERF_COUNT_HW_REF_CPU_CYCLES: u64 = 9;
}

/// Generic software events.
pub mod perf_sw_ids {
    pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
    pub const PERF_COUNT_SW_TASK_CLOCK: u64 = 1;
    pub const PERF_COUNT_SW_PAGE_FAULTS: u64 = 2;
    pub const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;
    pub const PERF_COUNT_SW_CPU_MIGRATIONS: u64 = 4;
    pub const PERF_COUNT_SW_PAGE_FAULTS_MIN: u64 = 5;
    pub const PERF_COUNT_SW_PAGE_FAULTS_MAJ: u64 = 6;
    pub const PERF_COUNT_SW_ALIGNMENT_FAULTS: u64 = 7;
    pub const PERF_COUNT_SW_EMULATION_FAULTS: u64 = 8;
}

/// Bits of `perf_event_attr::read_format`.
pub mod perf_event_read_format {
    pub const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
    pub const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 1;
    pub const PERF_FORMAT_ID: u64 = 1 << 2;
    pub const PERF_FORMAT_GROUP: u64 = 1 << 3;
}

pub const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

/// Attributes of a perf event, as passed to `perf_event_open`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct perf_event_attr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
}

macro_rules! attr_flag {
    ($get: ident, $set: ident, $bit: expr) => {
        #[inline]
        pub fn $get(&self) -> u64 {
            (self.flags >> $bit) & 1
        }

        #[inline]
        pub fn $set(&mut self, val: u64) {
            self.flags = (self.flags & !(1 << $bit)) | ((val & 1) << $bit);
        }
    };
}

impl perf_event_attr {
    attr_flag!(disabled, set_disabled, 0);
    attr_flag!(inherit, set_inherit, 1);
    attr_flag!(pinned, set_pinned, 2);
    attr_flag!(exclusive, set_exclusive, 3);
    attr_flag!(exclude_user, set_exclude_user, 4);
    attr_flag!(exclude_kernel, set_exclude_kernel, 5);
    attr_flag!(exclude_hv, set_exclude_hv, 6);
    attr_flag!(exclude_idle, set_exclude_idle, 7);

    /// Attributes of an event of the given type and configuration.
    pub fn new(type_: u32, config: u64) -> Self {
        perf_event_attr {
            type_,
            config,
            ..Default::default()
        }
    }
}

// Details at https://elixir.bootlin.com/linux/v5.3.10/source/include/uapi/linux/perf_event.h#L456
ioctl_none!(perf_event_ioc_enable, b'$', 0);
ioctl_none!(perf_event_ioc_disable, b'$', 1);
ioctl_none!(perf_event_ioc_reset, b'$', 3);

/// Rust wrapper for the `perf_event_open` system call.
pub fn perf_event_open(
    attr: &perf_event_attr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_ulong,
) -> Result<std::os::unix::io::RawFd> {
    unsafe {
        let fd = libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const _,
            pid,
            cpu,
            group_fd,
            flags,
        );
        match fd {
            -1 => Err(Error::from_errno()),
            rc => Ok(rc as _),
        }
    }
}
