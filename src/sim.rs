//! A deterministic, software-only counter backend.
//!
//! Every read of a session advances each delta event by a fixed step, so a begin/end pair without
//! intermediate reads always accumulates exactly one step. Instant events always read the same
//! value. Each session keeps its own cycle clock that advances by a fixed amount on every
//! timestamped read.
//!
//! ```
//! use papi_hl::sim::SimBackend;
//! use papi_hl::{Config, Profiler};
//!
//! let backend = SimBackend::empty().event("ops", 0, 3).instant_event("temp", 1, 40);
//! let dir = std::env::temp_dir().join("papi-hl-sim-doc");
//! let profiler = Profiler::new(backend, Config::default().quiet().output_dir(Some(dir)));
//! profiler.set_events(Some("ops,temp=instant"))?;
//! profiler.region_begin("work")?;
//! profiler.region_end("work")?;
//! # Ok::<(), papi_hl::Error>(())
//! ```

use crate::{Backend, ComponentId, Error, EventCode, Result, Session, ThreadId};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD: Cell<u64> = Cell::new(0);
}

/// Simulated identifier of the calling thread, stable for its lifetime.
fn current_thread() -> ThreadId {
    THREAD.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_THREAD.fetch_add(1, Ordering::Relaxed));
        }
        ThreadId(id.get())
    })
}

/// A simulated event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimEvent {
    /// Event name.
    pub name: String,
    /// Component serving the event.
    pub component: ComponentId,
    /// Increment per read of delta events.
    pub step: i64,
    /// Constant reading of instant events.
    pub instant: Option<i64>,
}

#[derive(Debug, Clone)]
struct SimComponent {
    name: String,
    max_events: Option<usize>,
}

/// Counters shared between the backend and its sessions.
#[derive(Debug, Default)]
struct SimShared {
    reads: AtomicUsize,
    running: AtomicUsize,
    inits: AtomicUsize,
    shutdowns: AtomicUsize,
    multiplexed_sessions: AtomicUsize,
    multiplexing: AtomicBool,
    threads: Mutex<BTreeSet<ThreadId>>,
}

/// Simulated counter backend.
#[derive(Debug, Clone)]
pub struct SimBackend {
    events: Arc<Vec<SimEvent>>,
    components: BTreeMap<ComponentId, SimComponent>,
    clock_rate: u64,
    cycles_per_read: i64,
    fail_init: bool,
    fail_reads_after: Option<usize>,
    multiplex_supported: bool,
    shared: Arc<SimShared>,
}

impl Default for SimBackend {
    /// A machine with `perf::TASK-CLOCK` on the software component and `PAPI_TOT_INS` and
    /// `PAPI_TOT_CYC` on the CPU component.
    fn default() -> Self {
        SimBackend::empty()
            .event("perf::TASK-CLOCK", 1, 1000)
            .event("PAPI_TOT_INS", 0, 100)
            .event("PAPI_TOT_CYC", 0, 200)
    }
}

impl SimBackend {
    /// A machine with the `perf_event` (0) and `perf_event_sw` (1) components but no events.
    pub fn empty() -> Self {
        SimBackend {
            events: Arc::new(Vec::new()),
            components: BTreeMap::new(),
            clock_rate: 2400,
            cycles_per_read: 10,
            fail_init: false,
            fail_reads_after: None,
            multiplex_supported: true,
            shared: Arc::new(SimShared::default()),
        }
        .component(0, "perf_event")
        .component(1, "perf_event_sw")
    }

    /// Add or rename a component.
    pub fn component(mut self, id: u32, name: &str) -> Self {
        let max_events = self.components.get(&ComponentId(id)).and_then(|c| c.max_events);
        self.components.insert(
            ComponentId(id),
            SimComponent {
                name: String::from(name),
                max_events,
            },
        );
        self
    }

    /// Limit the number of events a non-multiplexed session of component `id` accepts.
    pub fn max_events(mut self, id: u32, max: usize) -> Self {
        let comp = self
            .components
            .entry(ComponentId(id))
            .or_insert_with(|| SimComponent {
                name: format!("sim_{}", id),
                max_events: None,
            });
        comp.max_events = Some(max);
        self
    }

    /// Add a delta event advancing by `step` on every read.
    pub fn event(self, name: &str, component: u32, step: i64) -> Self {
        self.push_event(SimEvent {
            name: String::from(name),
            component: ComponentId(component),
            step,
            instant: None,
        })
    }

    /// Add an event that always reads `value`.
    pub fn instant_event(self, name: &str, component: u32, value: i64) -> Self {
        self.push_event(SimEvent {
            name: String::from(name),
            component: ComponentId(component),
            step: 0,
            instant: Some(value),
        })
    }

    fn push_event(mut self, event: SimEvent) -> Self {
        if !self.components.contains_key(&event.component) {
            self = self.component(event.component.0, &format!("sim_{}", event.component));
        }
        let mut events = (*self.events).clone();
        events.retain(|e| e.name != event.name);
        events.push(event);
        self.events = Arc::new(events);
        self
    }

    builder_pattern!(
        /// Set the reported clock rate in MHz.
        clock_rate: u64
    );

    builder_pattern!(
        /// Set how far the cycle clock of a session advances per timestamped read.
        cycles_per_read: i64
    );

    builder_pattern_bool!(
        /// Make library initialization fail.
        fail_init
    );

    /// Fail every read after the first `n` reads, counted over all sessions.
    pub fn fail_reads_after(mut self, n: usize) -> Self {
        self.fail_reads_after = Some(n);
        self
    }

    /// Report multiplexing as unsupported.
    pub fn without_multiplexing(mut self) -> Self {
        self.multiplex_supported = false;
        self
    }

    /// Number of successful initializations.
    pub fn init_count(&self) -> usize {
        self.shared.inits.load(Ordering::SeqCst)
    }

    /// Number of shutdowns.
    pub fn shutdown_count(&self) -> usize {
        self.shared.shutdowns.load(Ordering::SeqCst)
    }

    /// Number of reads performed so far, over all sessions.
    pub fn read_count(&self) -> usize {
        self.shared.reads.load(Ordering::SeqCst)
    }

    /// Number of multiplexed sessions created so far.
    pub fn multiplexed_sessions(&self) -> usize {
        self.shared.multiplexed_sessions.load(Ordering::SeqCst)
    }

    /// Check if multiplexing was initialized.
    pub fn is_multiplexing(&self) -> bool {
        self.shared.multiplexing.load(Ordering::SeqCst)
    }
}

impl Backend for SimBackend {
    type Session = SimSession;

    fn init(&self) -> Result<()> {
        if self.fail_init {
            return Err(Error::System(nix::errno::Errno::ENODEV));
        }
        self.shared.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn init_multiplexing(&self) -> Result<()> {
        if !self.multiplex_supported {
            return Err(Error::NotSupported);
        }
        self.shared.multiplexing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<EventCode> {
        self.events
            .iter()
            .position(|e| e.name == name)
            .map(|idx| EventCode(idx as u64))
            .ok_or_else(|| Error::UnknownEvent(String::from(name)))
    }

    fn component_of(&self, code: EventCode) -> ComponentId {
        self.events
            .get(code.0 as usize)
            .map(|e| e.component)
            .unwrap_or(ComponentId::CPU)
    }

    fn component_name(&self, component: ComponentId) -> String {
        self.components
            .get(&component)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| format!("sim_{}", component))
    }

    fn create_session(&self, component: ComponentId, multiplex: bool) -> Result<SimSession> {
        let comp = self
            .components
            .get(&component)
            .ok_or(Error::NotSupported)?;
        self.shared.threads.lock().insert(current_thread());
        if multiplex {
            self.shared.multiplexed_sessions.fetch_add(1, Ordering::SeqCst);
        }
        Ok(SimSession {
            component,
            component_name: comp.name.clone(),
            max_events: if multiplex { None } else { comp.max_events },
            catalog: self.events.clone(),
            events: Vec::new(),
            counts: Vec::new(),
            ticks: 0,
            cycles_per_read: self.cycles_per_read,
            fail_reads_after: self.fail_reads_after,
            running: false,
            shared: self.shared.clone(),
        })
    }

    fn thread_id(&self) -> ThreadId {
        current_thread()
    }

    fn list_threads(&self) -> Vec<ThreadId> {
        self.shared.threads.lock().iter().copied().collect()
    }

    fn any_session_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst) > 0
    }

    fn clock_rate_mhz(&self) -> u64 {
        self.clock_rate
    }

    fn shutdown(&self) {
        self.shared.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.shared.threads.lock().clear();
    }
}

/// Session of the simulated backend.
#[derive(Debug)]
pub struct SimSession {
    component: ComponentId,
    component_name: String,
    max_events: Option<usize>,
    catalog: Arc<Vec<SimEvent>>,
    events: Vec<SimEvent>,
    counts: Vec<i64>,
    ticks: i64,
    cycles_per_read: i64,
    fail_reads_after: Option<usize>,
    running: bool,
    shared: Arc<SimShared>,
}

impl Session for SimSession {
    fn add_event(&mut self, code: EventCode) -> Result<()> {
        let event = self
            .catalog
            .get(code.0 as usize)
            .cloned()
            .ok_or_else(|| Error::UnknownEvent(code.to_string()))?;
        let full = self.max_events.map_or(false, |max| self.events.len() >= max);
        if event.component != self.component || full {
            return Err(Error::EventConflict {
                event: event.name,
                component: self.component_name.clone(),
            });
        }
        self.events.push(event);
        self.counts.push(0);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if !self.running {
            self.running = true;
            self.shared.running.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Err(Error::NotRunning);
        }
        self.running = false;
        self.shared.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&mut self, values: &mut [i64]) -> Result<()> {
        if !self.running {
            return Err(Error::NotRunning);
        }
        let reads = self.shared.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_reads_after.map_or(false, |n| reads > n) {
            return Err(Error::System(nix::errno::Errno::EIO));
        }
        for ((event, count), value) in self
            .events
            .iter()
            .zip(self.counts.iter_mut())
            .zip(values.iter_mut())
        {
            *count += event.step;
            *value = event.instant.unwrap_or(*count);
        }
        Ok(())
    }

    fn read_ts(&mut self, values: &mut [i64]) -> Result<i64> {
        self.read(values)?;
        self.ticks += self.cycles_per_read;
        Ok(self.ticks)
    }
}

impl Drop for SimSession {
    fn drop(&mut self) {
        if self.running {
            self.shared.running.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let backend = SimBackend::default();
        let code = backend.resolve("PAPI_TOT_CYC").unwrap();
        assert_eq!(backend.component_of(code), ComponentId(0));
        assert_eq!(backend.component_name(ComponentId(1)), "perf_event_sw");
        assert!(matches!(
            backend.resolve("PAPI_FP_OPS"),
            Err(Error::UnknownEvent(_))
        ));
    }

    #[test]
    fn test_session_counts() {
        let backend = SimBackend::empty().event("ops", 0, 5).instant_event("temp", 0, 42);
        let mut session = backend.create_session(ComponentId(0), false).unwrap();
        session.add_event(backend.resolve("ops").unwrap()).unwrap();
        session.add_event(backend.resolve("temp").unwrap()).unwrap();

        let mut values = [0i64; 2];
        assert!(matches!(session.read(&mut values), Err(Error::NotRunning)));
        session.start().unwrap();
        assert!(backend.any_session_running());
        session.read(&mut values).unwrap();
        assert_eq!(values, [5, 42]);
        assert_eq!(session.read_ts(&mut values).unwrap(), 10);
        assert_eq!(values, [10, 42]);
        session.stop().unwrap();
        assert!(matches!(session.stop(), Err(Error::NotRunning)));
        assert!(!backend.any_session_running());
    }

    #[test]
    fn test_component_limit() {
        let backend = SimBackend::default().max_events(0, 1);
        let ins = backend.resolve("PAPI_TOT_INS").unwrap();
        let cyc = backend.resolve("PAPI_TOT_CYC").unwrap();
        let clock = backend.resolve("perf::TASK-CLOCK").unwrap();

        let mut session = backend.create_session(ComponentId(0), false).unwrap();
        session.add_event(ins).unwrap();
        assert!(matches!(
            session.add_event(cyc),
            Err(Error::EventConflict { .. })
        ));
        // Events of other components never fit.
        assert!(session.add_event(clock).is_err());

        let mut session = backend.create_session(ComponentId(0), true).unwrap();
        session.add_event(ins).unwrap();
        session.add_event(cyc).unwrap();
        assert_eq!(backend.multiplexed_sessions(), 1);
    }

    #[test]
    fn test_dropped_session_stops_running() {
        let backend = SimBackend::default();
        {
            let mut session = backend.create_session(ComponentId(1), false).unwrap();
            session.start().unwrap();
            assert!(backend.any_session_running());
        }
        assert!(!backend.any_session_running());
        assert_eq!(backend.list_threads(), vec![backend.thread_id()]);
    }

    #[test]
    fn test_thread_ids_differ() {
        let backend = SimBackend::default();
        let here = backend.thread_id();
        let there = std::thread::spawn(current_thread).join().unwrap();
        assert_ne!(here, there);
        assert_eq!(here, backend.thread_id());
    }

    #[test]
    fn test_failures() {
        let backend = SimBackend::default().fail_init().fail_reads_after(1);
        assert!(backend.init().is_err());
        let mut session = backend.create_session(ComponentId(0), false).unwrap();
        session.add_event(backend.resolve("PAPI_TOT_INS").unwrap()).unwrap();
        session.start().unwrap();
        let mut values = [0i64; 1];
        assert!(session.read(&mut values).is_ok());
        assert!(session.read(&mut values).is_err());
        assert_eq!(backend.read_count(), 2);
    }
}
