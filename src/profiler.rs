//! Lifecycle of the region API: lazy initialization, per-thread state and global teardown.

use crate::report;
use crate::session::ThreadSession;
use crate::store::{RegionOp, RegionStore};
use crate::{Backend, Config, Error, Registry, Result};
use log::debug;
use parking_lot::Mutex;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

static NEXT_PROFILER_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Thread-local state of every profiler this thread has used, keyed by profiler id.
    static LOCAL: RefCell<HashMap<usize, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

/// Per-thread part of a profiler.
struct LocalState<S: crate::Session> {
    session: Option<ThreadSession<S>>,
    active: bool,
    begin_count: u64,
    end_count: u64,
}

impl<S: crate::Session> Default for LocalState<S> {
    fn default() -> Self {
        LocalState {
            session: None,
            active: true,
            begin_count: 0,
            end_count: 0,
        }
    }
}

/// Global state guarded by the profiler lock.
#[derive(Debug, Default)]
struct Shared {
    registry: Option<Arc<Registry>>,
    store: Option<RegionStore>,
    output_dir: Option<PathBuf>,
    output_counter: u32,
    report_path: Option<PathBuf>,
    master: Option<crate::ThreadId>,
    cleaned_threads: usize,
}

/// Region instrumentation on top of a counter [`Backend`].
///
/// A profiler is shared by all threads of the process. The first call into it brings up the
/// backend exactly once, the first region determines the recorded events, and every thread lazily
/// creates its own counting sessions on its first region.
///
/// Any failure that leaves the counters in an unknown state deactivates the profiler for good:
/// all later calls return [`Error::Deactivated`] and release the sessions of the calling thread.
pub struct Profiler<B: Backend> {
    id: usize,
    backend: B,
    config: Config,
    init_claimed: AtomicBool,
    active: AtomicBool,
    initiated: AtomicBool,
    finalized: AtomicBool,
    events_determined: AtomicBool,
    output_generated: AtomicBool,
    shared: Mutex<Shared>,
}

impl<B: Backend + std::fmt::Debug> std::fmt::Debug for Profiler<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profiler")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("config", &self.config)
            .field("active", &self.active)
            .field("initiated", &self.initiated)
            .field("finalized", &self.finalized)
            .field("events_determined", &self.events_determined)
            .field("output_generated", &self.output_generated)
            .finish()
    }
}

impl<B: Backend> Profiler<B> {
    /// Create a profiler. Nothing is initialized until the first call.
    pub fn new(backend: B, config: Config) -> Self {
        Profiler {
            id: NEXT_PROFILER_ID.fetch_add(1, Ordering::Relaxed),
            backend,
            config,
            init_claimed: AtomicBool::new(false),
            active: AtomicBool::new(true),
            initiated: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            events_determined: AtomicBool::new(false),
            output_generated: AtomicBool::new(false),
            shared: Mutex::new(Shared::default()),
        }
    }

    /// The counter backend.
    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The configuration.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Check if the profiler has not been deactivated by a failure.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Check if the report was written, or was given up on.
    #[inline]
    pub fn is_output_generated(&self) -> bool {
        self.output_generated.load(Ordering::Acquire)
    }

    /// Location of the written report.
    pub fn report_path(&self) -> Option<PathBuf> {
        self.shared.lock().report_path.clone()
    }

    /// The recorded events, once determined.
    pub fn registry(&self) -> Option<Arc<Registry>> {
        self.shared.lock().registry.clone()
    }

    /// Inspect the region store under the profiler lock.
    ///
    /// Returns `None` before the events were determined and after teardown.
    pub fn with_store<R, F: FnOnce(&RegionStore) -> R>(&self, f: F) -> Option<R> {
        self.shared.lock().store.as_ref().map(f)
    }

    /// Bring up the counter backend.
    ///
    /// Fails with [`Error::AlreadyInitialized`] on every call after the first one.
    pub fn init(&self) -> Result<()> {
        if !self.is_active() {
            return Err(Error::Deactivated);
        }
        if self.initiated.load(Ordering::Acquire) || self.finalized.load(Ordering::Acquire) {
            return Err(Error::AlreadyInitialized);
        }
        self.onetime_init()?;
        if !self.is_active() {
            return Err(Error::Deactivated);
        }
        Ok(())
    }

    /// Fix the recorded events.
    ///
    /// `events` is a comma separated list of event names, each optionally suffixed with
    /// `=instant` or `=delta`. Without a list, the `PAPI_EVENTS` configuration or the default set
    /// is used. Only the first call has an effect, later calls succeed without changing anything.
    pub fn set_events(&self, events: Option<&str>) -> Result<()> {
        if !self.is_active() {
            return Err(Error::Deactivated);
        }
        self.ensure_init()?;
        if !self.events_determined.load(Ordering::Acquire) {
            let mut shared = self.shared.lock();
            if !self.events_determined.load(Ordering::Acquire) && self.is_active() {
                debug!("Set events: {:?}", events);
                match Registry::resolve(&self.backend, events, &self.config) {
                    Ok(registry) => {
                        shared.store = Some(RegionStore::new(registry.kinds()));
                        shared.registry = Some(Arc::new(registry));
                        self.events_determined.store(true, Ordering::Release);
                    }
                    Err(e) => {
                        hl_error!(self.config, "Could not determine the events to record: {}.", e);
                        shared.store = None;
                        self.active.store(false, Ordering::Release);
                        return Err(e);
                    }
                }
            }
        }
        if !self.is_active() {
            return Err(Error::Deactivated);
        }
        Ok(())
    }

    /// Begin `region` on the calling thread, initializing whatever is still missing.
    pub fn region_begin(&self, region: &str) -> Result<()> {
        self.with_local(|local| {
            self.check_usable(local)?;
            self.ensure_init()?;
            if !self.events_determined.load(Ordering::Acquire) {
                self.set_events(None)?;
            }
            if local.session.is_none() {
                if let Err(e) = self.start_local(local) {
                    debug!(
                        "Could not create local sessions for thread {} - {}",
                        self.backend.thread_id(),
                        e
                    );
                    self.clean_up_all(local, true);
                    return Err(e);
                }
            }
            self.read_and_store(local, region, RegionOp::Begin)?;
            local.begin_count += 1;
            Ok(())
        })
    }

    /// Record an intermediate sample of `region`, which must have been begun on this thread.
    pub fn region_read(&self, region: &str) -> Result<()> {
        self.with_local(|local| {
            self.check_usable(local)?;
            if local.begin_count == 0 {
                return Err(self.unmatched(region, RegionOp::Read));
            }
            self.read_and_store(local, region, RegionOp::Read)
        })
    }

    /// End `region`, which must have been begun on this thread.
    pub fn region_end(&self, region: &str) -> Result<()> {
        self.with_local(|local| {
            self.check_usable(local)?;
            if local.begin_count == 0 {
                return Err(self.unmatched(region, RegionOp::End));
            }
            self.read_and_store(local, region, RegionOp::End)?;
            local.end_count += 1;
            Ok(())
        })
    }

    /// Stop and release the sessions of the calling thread.
    ///
    /// The thread that initialized the profiler keeps its sessions until [`Profiler::finalize`].
    pub fn cleanup_thread(&self) -> Result<()> {
        self.with_local(|local| {
            if !self.is_active() || !self.initiated.load(Ordering::Acquire) || !local.active {
                return Err(Error::Deactivated);
            }
            let master = self.shared.lock().master;
            if master != Some(self.backend.thread_id()) {
                self.clean_up_local(local);
            }
            Ok(())
        })
    }

    /// Write the report if still pending, release the calling thread's sessions and tear down
    /// the global state.
    ///
    /// The backend itself is only shut down once every thread that used it has cleaned up and
    /// no session is running anymore. Calling `finalize` again has no effect.
    pub fn finalize(&self) -> Result<()> {
        if self.finalized.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.is_active() {
            return Err(Error::Deactivated);
        }
        if !self.initiated.load(Ordering::Acquire) {
            return Err(Error::NotRunning);
        }
        self.print_output();
        self.with_local(|local| {
            self.clean_up_all(local, false);
            Ok(())
        })
    }

    /// Write the report unless it was already written or given up on.
    ///
    /// Nothing is written if the numbers of region entries and exits differ.
    pub fn print_output(&self) {
        if self.is_active()
            && self.initiated.load(Ordering::Acquire)
            && !self.output_generated.load(Ordering::Acquire)
        {
            self.write_output();
        }
    }

    /// Run `f` on the calling thread's state of this profiler.
    fn with_local<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut LocalState<B::Session>) -> Result<R>,
    {
        LOCAL
            .try_with(|map| {
                let mut map = map.borrow_mut();
                let entry = map
                    .entry(self.id)
                    .or_insert_with(|| Box::new(LocalState::<B::Session>::default()));
                if !entry.is::<LocalState<B::Session>>() {
                    *entry = Box::new(LocalState::<B::Session>::default());
                }
                match entry.downcast_mut::<LocalState<B::Session>>() {
                    Some(local) => f(local),
                    None => Err(Error::NotRunning),
                }
            })
            .unwrap_or_else(|_| Err(Error::NotRunning))
    }

    /// Short-circuit calls on a deactivated or finalized profiler, releasing local sessions.
    fn check_usable(&self, local: &mut LocalState<B::Session>) -> Result<()> {
        if !self.is_active() {
            if local.active {
                self.clean_up_local(local);
            }
            return Err(Error::Deactivated);
        }
        if self.finalized.load(Ordering::Acquire) {
            if local.active {
                self.clean_up_local(local);
            }
            return Err(Error::NotRunning);
        }
        Ok(())
    }

    fn unmatched(&self, region: &str, op: RegionOp) -> Error {
        let err = Error::NoMatchingRegion {
            region: String::from(region),
            op: op.name(),
        };
        hl_warn!(
            self.config,
            "{} for thread id={}.",
            err,
            self.backend.thread_id()
        );
        err
    }

    fn ensure_init(&self) -> Result<()> {
        if self.initiated.load(Ordering::Acquire) {
            return Ok(());
        }
        match self.init() {
            Ok(()) | Err(Error::AlreadyInitialized) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Run the library bring-up on exactly one thread, letting late threads wait for it.
    fn onetime_init(&self) -> Result<()> {
        if self
            .init_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.library_init();
        }
        let deadline = Instant::now() + self.config.wait_timeout();
        while !self.initiated.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                hl_error!(self.config, "Timed out waiting for the library initialization.");
                return Err(Error::InitTimeout);
            }
            std::thread::sleep(self.config.wait_interval());
        }
        Ok(())
    }

    fn library_init(&self) {
        match self.backend.init() {
            Ok(()) => {
                let mut shared = self.shared.lock();
                let prefix = self.config.output_prefix();
                match report::prepare_output_dir(prefix, shared.output_counter, &self.config) {
                    Ok(dir) => {
                        shared.output_dir = Some(dir);
                        shared.output_counter += 1;
                        shared.master = Some(self.backend.thread_id());
                        debug!("master_thread_id={:?}", shared.master);
                        hl_info!(self.config, "PAPI has been initiated!");
                    }
                    Err(e) => {
                        hl_error!(self.config, "Determining the output path failed: {}.", e);
                        hl_error!(self.config, "PAPI could not be initiated!");
                        self.active.store(false, Ordering::Release);
                    }
                }
            }
            Err(e) => {
                hl_error!(self.config, "Library initialization failed: {}.", e);
                hl_error!(self.config, "PAPI could not be initiated!");
                self.active.store(false, Ordering::Release);
            }
        }

        if self.config.is_multiplexed() {
            match self.backend.init_multiplexing() {
                Ok(()) => hl_info!(self.config, "Multiplex has been initiated!"),
                Err(Error::NotSupported) => hl_info!(self.config, "Multiplex is not supported!"),
                Err(e) => hl_error!(self.config, "Multiplex initialization failed: {}.", e),
            }
        }

        self.initiated.store(true, Ordering::Release);
    }

    fn start_local(&self, local: &mut LocalState<B::Session>) -> Result<()> {
        let registry = self.registry().ok_or(Error::NotRunning)?;
        local.session = Some(ThreadSession::start(&self.backend, registry)?);
        local.active = true;
        Ok(())
    }

    fn read_and_store(
        &self,
        local: &mut LocalState<B::Session>,
        region: &str,
        op: RegionOp,
    ) -> Result<()> {
        let tid = self.backend.thread_id();
        debug!("Thread ID:{}, Region:{}, {:?}", tid, region, op);
        let session = match local.session.as_mut() {
            Some(session) => session,
            None => return Err(Error::NotRunning),
        };

        if let Err(e) = session.read() {
            hl_error!(self.config, "Could not read counters for thread {}: {}.", tid, e);
            self.clean_up_all(local, true);
            return Err(e);
        }

        let stored = match self.shared.lock().store.as_mut() {
            Some(store) => store.record(tid, region, op, session.sample()),
            None => Err(Error::NotRunning),
        };
        if let Err(ref e @ Error::NoMatchingRegion { .. }) = stored {
            hl_warn!(self.config, "{} for thread id={}.", e, tid);
        }
        stored
    }

    /// Release the sessions of the calling thread and mark it inactive.
    fn clean_up_local(&self, local: &mut LocalState<B::Session>) {
        if let Some(session) = local.session.take() {
            debug!(
                "Clean up thread local data for thread {} ({} begins, {} ends)",
                self.backend.thread_id(),
                local.begin_count,
                local.end_count
            );
            session.release(&self.config);
            self.shared.lock().cleaned_threads += 1;
        }
        local.active = false;
    }

    /// Tear down local and global state, optionally deactivating the profiler.
    fn clean_up_all(&self, local: &mut LocalState<B::Session>, deactivate: bool) {
        // Output is either written already or can not be trusted anymore.
        self.output_generated.store(true, Ordering::Release);

        if local.active {
            self.clean_up_local(local);
        }

        if self.is_active() {
            let mut shared = self.shared.lock();
            if self.is_active() {
                if !self.finalized.swap(true, Ordering::AcqRel) {
                    hl_info!(self.config, "Output generation is deactivated!");
                    shared.store = None;
                    self.shutdown_if_clean(&mut shared);
                }
                if deactivate {
                    self.active.store(false, Ordering::Release);
                }
            }
        }
    }

    /// Release the backend if every thread that used it has cleaned up.
    fn shutdown_if_clean(&self, shared: &mut Shared) {
        let threads = self.backend.list_threads().len();
        debug!(
            "Number of registered threads: {}, cleaned threads: {}",
            threads, shared.cleaned_threads
        );
        if !self.backend.any_session_running() && threads == shared.cleaned_threads {
            self.backend.shutdown();
            shared.registry = None;
            debug!("Counter backend shut down");
        } else {
            hl_warn!(
                self.config,
                "Could not shut down the counter backend since some threads still have running sessions. Make sure to call cleanup_thread() at the end of all parallel regions and finalize() in the master thread!"
            );
        }
    }

    fn write_output(&self) {
        if self.output_generated.load(Ordering::Acquire) {
            return;
        }
        let mut shared = self.shared.lock();
        if self.output_generated.load(Ordering::Acquire) {
            return;
        }

        let (store, registry) = match (shared.store.as_ref(), shared.registry.as_ref()) {
            (Some(store), Some(registry)) => (store, registry),
            _ => {
                hl_info!(self.config, "No events were recorded.");
                return;
            }
        };
        if !store.is_balanced() {
            hl_warn!(self.config, "Cannot generate output due to not matching regions.");
            debug!(
                "region_begin_cnt={}, region_end_cnt={}",
                store.begin_count(),
                store.end_count()
            );
            self.output_generated.store(true, Ordering::Release);
            return;
        }
        hl_info!(self.config, "Print results...");

        let dir = match shared.output_dir.clone() {
            Some(dir) => dir,
            None => {
                hl_error!(self.config, "Measurement directory is unknown.");
                return;
            }
        };
        let doc = report::build_report(
            store,
            &report::field_names(registry),
            &self.backend.list_threads(),
            self.backend.clock_rate_mhz(),
        );
        let path = match report::save(&dir, self.config.process_rank(), &doc) {
            Ok(path) => path,
            Err(e) => {
                hl_error!(
                    self.config,
                    "Cannot create output file in {}: {}!",
                    dir.display(),
                    e
                );
                return;
            }
        };
        if self.config.echo_report() {
            if let Err(e) = report::echo(std::io::stdout().lock(), &path) {
                hl_error!(self.config, "Cannot print {}: {}.", path.display(), e);
            }
        }
        shared.report_path = Some(path);
        self.output_generated.store(true, Ordering::Release);
    }
}

impl<B: Backend> Drop for Profiler<B> {
    fn drop(&mut self) {
        // State of other threads is released when they exit.
        let id = self.id;
        let _ = LOCAL.try_with(|map| map.borrow_mut().remove(&id));
    }
}
