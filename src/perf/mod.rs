//! Counter backend on top of the Linux `perf_event_open` interface.
//!
//! Event names are resolved against a small table of generic kernel events (the names `perf
//! list` prints, optionally prefixed with `perf::`), a few PAPI preset names mapped onto generic
//! events, and raw PMU events of the form `pmu/config=0x..,config1=0x..,config2=0x../`.
//!
//! Generic hardware and raw events are served by the `perf_event` component, software events by
//! `perf_event_sw`. Events of any other PMU get a component of their own.

pub mod ffi;

mod event;
pub use event::{PerfEvent, PerfEventBuilder, PerfEventValue};

use crate::{Backend, ComponentId, Error, EventCode, Result, Session, ThreadId};
use ffi::perf_event_attr;
use ffi::perf_type_id::*;
use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Component serving kernel software events.
pub const SOFTWARE_COMPONENT: ComponentId = ComponentId(1);

const PMU_TYPES: &str = "/sys/bus/event_source/devices/*/type";

lazy_static! {
    static ref NAMED_EVENTS: HashMap<&'static str, (u32, u64)> = {
        use ffi::perf_hw_id::*;
        use ffi::perf_sw_ids::*;
        let mut m = HashMap::new();
        for (names, config) in &[
            (&["cycles", "cpu-cycles", "papi_tot_cyc"][..], PERF_COUNT_HW_CPU_CYCLES),
            (&["instructions", "papi_tot_ins"][..], PERF_COUNT_HW_INSTRUCTIONS),
            (&["cache-references"][..], PERF_COUNT_HW_CACHE_REFERENCES),
            (&["cache-misses"][..], PERF_COUNT_HW_CACHE_MISSES),
            (&["branches", "branch-instructions", "papi_br_ins"][..], PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
            (&["branch-misses", "papi_br_msp"][..], PERF_COUNT_HW_BRANCH_MISSES),
            (&["bus-cycles"][..], PERF_COUNT_HW_BUS_CYCLES),
            (&["stalled-cycles-frontend"][..], PERF_COUNT_HW_STALLED_CYCLES_FRONTEND),
            (&["stalled-cycles-backend"][..], PERF_COUNT_HW_STALLED_CYCLES_BACKEND),
            (&["ref-cycles", "papi_ref_cyc"][..], PERF_COUNT_HW_REF_CPU_CYCLES),
        ] {
            for name in names.iter() {
                m.insert(*name, (PERF_TYPE_HARDWARE, *config));
            }
        }
        for (names, config) in &[
            (&["cpu-clock"][..], PERF_COUNT_SW_CPU_CLOCK),
            (&["task-clock"][..], PERF_COUNT_SW_TASK_CLOCK),
            (&["page-faults", "faults"][..], PERF_COUNT_SW_PAGE_FAULTS),
            (&["context-switches", "cs"][..], PERF_COUNT_SW_CONTEXT_SWITCHES),
            (&["cpu-migrations", "migrations"][..], PERF_COUNT_SW_CPU_MIGRATIONS),
            (&["minor-faults"][..], PERF_COUNT_SW_PAGE_FAULTS_MIN),
            (&["major-faults"][..], PERF_COUNT_SW_PAGE_FAULTS_MAJ),
            (&["alignment-faults"][..], PERF_COUNT_SW_ALIGNMENT_FAULTS),
            (&["emulation-faults"][..], PERF_COUNT_SW_EMULATION_FAULTS),
        ] {
            for name in names.iter() {
                m.insert(*name, (PERF_TYPE_SOFTWARE, *config));
            }
        }
        m
    };
    static ref RAW_EVENT: Regex = Regex::new(r"^([A-Za-z0-9_.\-]+)/([^/]*)/$").unwrap();
    static ref RAW_TERM: Regex =
        Regex::new(r"^(config|config1|config2)=(0[xX][0-9a-fA-F]+|[0-9]+)$").unwrap();
    static ref CPU_MHZ: Regex = Regex::new(r"(?m)^cpu MHz\s*:\s*([0-9]+)").unwrap();
}

/// Attributes of a generic event, looked up case-insensitively.
fn named_event(name: &str) -> Option<perf_event_attr> {
    let lower = name.to_ascii_lowercase();
    let key = lower.strip_prefix("perf::").unwrap_or(lower.as_str());
    NAMED_EVENTS
        .get(key)
        .map(|(type_, config)| perf_event_attr::new(*type_, *config))
}

fn parse_u64(s: &str) -> Result<u64> {
    Ok(match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => s.parse()?,
    })
}

/// Read the dynamic type of a PMU from sysfs.
fn pmu_type(pmu: &str) -> Result<u32> {
    let path = format!("/sys/bus/event_source/devices/{}/type", pmu);
    Ok(std::fs::read_to_string(path)?.trim().parse()?)
}

/// Attributes of a raw event `pmu/config=..,config1=..,config2=../`.
fn raw_event(name: &str) -> Result<Option<perf_event_attr>> {
    let caps = match RAW_EVENT.captures(name) {
        Some(caps) => caps,
        None => return Ok(None),
    };
    let mut attr = perf_event_attr::new(pmu_type(&caps[1])?, 0);
    for term in caps[2].split(',').filter(|t| !t.is_empty()) {
        let term = RAW_TERM
            .captures(term)
            .ok_or_else(|| Error::UnknownEvent(String::from(name)))?;
        let value = parse_u64(&term[2])?;
        match &term[1] {
            "config" => attr.config = value,
            "config1" => attr.config1 = value,
            _ => attr.config2 = value,
        }
    }
    Ok(Some(attr))
}

fn component_of_type(type_: u32) -> ComponentId {
    match type_ {
        PERF_TYPE_HARDWARE | PERF_TYPE_HW_CACHE | PERF_TYPE_RAW => ComponentId::CPU,
        PERF_TYPE_SOFTWARE => SOFTWARE_COMPONENT,
        t => ComponentId(t),
    }
}

/// Cycle timestamp of the calling CPU.
#[cfg(target_arch = "x86_64")]
pub fn cycle_counter() -> i64 {
    unsafe { core::arch::x86_64::_rdtsc() as i64 }
}

/// Cycle timestamp of the calling CPU.
///
/// Falls back to the monotonic clock in nanoseconds where no cycle counter is exposed.
#[cfg(not(target_arch = "x86_64"))]
pub fn cycle_counter() -> i64 {
    use nix::sys::time::TimeValLike;
    nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.num_nanoseconds())
        .unwrap_or(0)
}

/// Clock rate in MHz from `/proc/cpuinfo`, or from cpufreq if that is missing.
fn read_clock_rate() -> Option<u64> {
    let from_cpuinfo = std::fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|s| {
            CPU_MHZ
                .captures(&s)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok())
        });
    from_cpuinfo.or_else(|| {
        std::fs::read_to_string("/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|khz| khz / 1000)
    })
}

#[derive(Debug, Clone)]
struct PerfEntry {
    name: String,
    attr: perf_event_attr,
}

/// Counter backend using Linux perf events on the calling thread.
#[derive(Debug, Default)]
pub struct PerfBackend {
    events: Arc<RwLock<Vec<PerfEntry>>>,
    pmus: RwLock<BTreeMap<u32, String>>,
    threads: Mutex<BTreeSet<ThreadId>>,
    running: Arc<AtomicUsize>,
    multiplexing: AtomicBool,
}

impl PerfBackend {
    /// Check if `init_multiplexing` was called.
    pub fn is_multiplexing(&self) -> bool {
        self.multiplexing.load(Ordering::SeqCst)
    }

    fn discover_pmus(&self) -> Result<()> {
        let mut pmus = self.pmus.write();
        for path in glob::glob(PMU_TYPES)?.filter_map(std::result::Result::ok) {
            let type_ = match std::fs::read_to_string(&path) {
                Ok(s) => s.trim().parse::<u32>()?,
                Err(_) => continue,
            };
            if let Some(name) = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
            {
                pmus.insert(type_, String::from(name));
            }
        }
        log::debug!("Found PMUs {:?}", pmus);
        Ok(())
    }
}

impl Backend for PerfBackend {
    type Session = PerfSession;

    fn init(&self) -> Result<()> {
        let paranoid = std::fs::read_to_string("/proc/sys/kernel/perf_event_paranoid")
            .map_err(|_| Error::NotSupported)?;
        log::debug!("perf_event_paranoid = {}", paranoid.trim());
        self.discover_pmus()
    }

    fn init_multiplexing(&self) -> Result<()> {
        self.multiplexing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<EventCode> {
        let attr = match named_event(name) {
            Some(attr) => attr,
            None => raw_event(name)
                .ok()
                .and_then(|a| a)
                .ok_or_else(|| Error::UnknownEvent(String::from(name)))?,
        };
        let mut events = self.events.write();
        if let Some(idx) = events.iter().position(|e| e.name == name) {
            return Ok(EventCode(idx as u64));
        }
        events.push(PerfEntry {
            name: String::from(name),
            attr,
        });
        Ok(EventCode(events.len() as u64 - 1))
    }

    fn component_of(&self, code: EventCode) -> ComponentId {
        self.events
            .read()
            .get(code.0 as usize)
            .map(|e| component_of_type(e.attr.type_))
            .unwrap_or(ComponentId::CPU)
    }

    fn component_name(&self, component: ComponentId) -> String {
        match component {
            ComponentId::CPU => String::from("perf_event"),
            SOFTWARE_COMPONENT => String::from("perf_event_sw"),
            ComponentId(t) => self
                .pmus
                .read()
                .get(&t)
                .cloned()
                .unwrap_or_else(|| format!("pmu_{}", t)),
        }
    }

    fn create_session(&self, component: ComponentId, multiplex: bool) -> Result<PerfSession> {
        self.threads.lock().insert(self.thread_id());
        Ok(PerfSession {
            component,
            component_name: self.component_name(component),
            multiplex,
            catalog: self.events.clone(),
            events: Vec::new(),
            running: false,
            shared_running: self.running.clone(),
        })
    }

    fn thread_id(&self) -> ThreadId {
        ThreadId(nix::unistd::gettid().as_raw() as u64)
    }

    fn list_threads(&self) -> Vec<ThreadId> {
        self.threads.lock().iter().copied().collect()
    }

    fn any_session_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) > 0
    }

    fn clock_rate_mhz(&self) -> u64 {
        read_clock_rate().unwrap_or(0)
    }

    fn shutdown(&self) {
        self.threads.lock().clear();
        self.multiplexing.store(false, Ordering::SeqCst);
    }
}

/// A group of perf events of one component counting the calling thread.
///
/// Without multiplexing the events form a single perf group led by the first event, so they are
/// always scheduled together. Multiplexed events are opened independently and their counts are
/// scaled by the fraction of time they were scheduled.
#[derive(Debug)]
pub struct PerfSession {
    component: ComponentId,
    component_name: String,
    multiplex: bool,
    catalog: Arc<RwLock<Vec<PerfEntry>>>,
    events: Vec<PerfEvent>,
    running: bool,
    shared_running: Arc<AtomicUsize>,
}

impl PerfSession {
    fn conflict(&self, name: &str) -> Error {
        Error::EventConflict {
            event: String::from(name),
            component: self.component_name.clone(),
        }
    }

    /// Check if a freshly added group member can be scheduled together with the group.
    fn group_fits(&self, leader: &PerfEvent, member: &PerfEvent) -> Result<bool> {
        leader.reset()?;
        leader.enable()?;
        leader.disable()?;
        let value = member.read_value()?;
        Ok(value.time_enabled == 0 || value.time_running > 0)
    }
}

impl Session for PerfSession {
    fn add_event(&mut self, code: EventCode) -> Result<()> {
        let entry = self
            .catalog
            .read()
            .get(code.0 as usize)
            .cloned()
            .ok_or_else(|| Error::UnknownEvent(code.to_string()))?;
        if component_of_type(entry.attr.type_) != self.component {
            return Err(self.conflict(&entry.name));
        }

        let leader = if self.multiplex {
            None
        } else {
            self.events.first()
        };
        let builder = PerfEvent::build();
        let evt = match leader {
            Some(leader) => builder.leader(leader.file.as_raw_fd()).open(entry.attr),
            None => builder.start_disabled().open(entry.attr),
        }
        .map_err(|e| {
            log::debug!("Opening {} failed - {}", entry.name, e);
            self.conflict(&entry.name)
        })?;

        if let Some(leader) = leader {
            if !self.group_fits(leader, &evt)? {
                return Err(self.conflict(&entry.name));
            }
        }
        self.events.push(evt);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        for evt in &self.events {
            evt.reset()?;
        }
        for evt in &self.events {
            evt.enable()?;
        }
        self.running = true;
        self.shared_running.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Err(Error::NotRunning);
        }
        self.running = false;
        self.shared_running.fetch_sub(1, Ordering::SeqCst);
        for evt in &self.events {
            evt.disable()?;
        }
        Ok(())
    }

    fn read(&mut self, values: &mut [i64]) -> Result<()> {
        if !self.running {
            return Err(Error::NotRunning);
        }
        for (evt, value) in self.events.iter().zip(values.iter_mut()) {
            let v = evt.read_value()?;
            let count = if self.multiplex { v.scaled() } else { v.value };
            *value = count as i64;
        }
        Ok(())
    }

    fn read_ts(&mut self, values: &mut [i64]) -> Result<i64> {
        self.read(values)?;
        Ok(cycle_counter())
    }
}

impl Drop for PerfSession {
    fn drop(&mut self) {
        if self.running {
            self.shared_running.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
