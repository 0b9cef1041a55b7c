//! Defines the interfaces this crate uses to access the underlying hardware-counter subsystem.
//!
//! The high-level region API never touches counters directly. Everything it needs (resolving
//! event names, creating counting sessions, enumerating threads, reading the clock rate) goes
//! through a [`Backend`], so the same bookkeeping can run on top of Linux `perf_event_open`
//! ([`crate::perf::PerfBackend`]) or on simulated counters ([`crate::sim::SimBackend`]).

use crate::Result;
use derive_more::{Display, From};

/// Identifier of a thread as reported by the counter backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Display)]
pub struct ThreadId(pub u64);

/// Implementation-defined code of a resolved event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, From, Display)]
pub struct EventCode(pub u64);

/// Identifier of a counter subsystem ("component") serving a group of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Display)]
pub struct ComponentId(pub u32);

impl ComponentId {
    /// The CPU core component. Only sessions of this component are ever multiplexed.
    pub const CPU: ComponentId = ComponentId(0);
}

/// A live handle that starts, stops and reads a group of events together.
///
/// Dropping a session cleans it up and destroys it.
pub trait Session: 'static {
    /// Add an event to the session. Fails if the event can not be counted alongside the events
    /// already added.
    fn add_event(&mut self, code: EventCode) -> Result<()>;

    /// Start counting.
    fn start(&mut self) -> Result<()>;

    /// Stop counting.
    ///
    /// Stopping a session that is not running yields [`crate::Error::NotRunning`].
    fn stop(&mut self) -> Result<()>;

    /// Read the current value of every event, in the order they were added.
    fn read(&mut self, values: &mut [i64]) -> Result<()>;

    /// Same as [`Session::read`], additionally returning a cycle timestamp taken with the read.
    fn read_ts(&mut self, values: &mut [i64]) -> Result<i64>;
}

/// The hardware-counter subsystem.
pub trait Backend: Send + Sync + 'static {
    /// Counting session type created by this backend.
    type Session: Session;

    /// Bring up the subsystem. Called exactly once per `Profiler`.
    fn init(&self) -> Result<()>;

    /// Enable multiplexing of events onto fewer physical counters.
    ///
    /// [`crate::Error::NotSupported`] signals that multiplexing is unavailable.
    fn init_multiplexing(&self) -> Result<()>;

    /// Resolve an event name to its code.
    fn resolve(&self, name: &str) -> Result<EventCode>;

    /// Component serving an event.
    fn component_of(&self, code: EventCode) -> ComponentId;

    /// Human readable name of a component.
    fn component_name(&self, component: ComponentId) -> String;

    /// Create an empty, stopped session for `component`.
    ///
    /// This registers the calling thread with the backend.
    fn create_session(&self, component: ComponentId, multiplex: bool) -> Result<Self::Session>;

    /// Identifier of the calling thread.
    fn thread_id(&self) -> ThreadId;

    /// All threads the backend knows about.
    fn list_threads(&self) -> Vec<ThreadId>;

    /// Check whether any session created by this backend, on any thread, is still counting.
    fn any_session_running(&self) -> bool;

    /// Clock rate of the CPU in MHz.
    fn clock_rate_mhz(&self) -> u64;

    /// Release the whole subsystem.
    fn shutdown(&self);
}
