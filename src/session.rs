//! Per-thread counting sessions mirroring the component registry.

use crate::store::Sample;
use crate::{Backend, Config, Error, Registry, Result, Session};
use std::sync::Arc;

/// One live session per registry component, owned by a single thread.
pub struct ThreadSession<S: Session> {
    registry: Arc<Registry>,
    sessions: Vec<S>,
    /// Latest raw values, flattened in registry order.
    values: Vec<i64>,
    /// Cycle timestamp of the latest read, relative to `origin`.
    cycles: i64,
    origin: i64,
}

impl<S: Session> std::fmt::Debug for ThreadSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSession")
            .field("registry", &self.registry)
            .field("sessions", &self.sessions.len())
            .field("values", &self.values)
            .field("cycles", &self.cycles)
            .finish()
    }
}

impl<S: Session> ThreadSession<S> {
    /// Create, fill and start one session per component of `registry`.
    ///
    /// A warm-up read is performed and discarded, so the first region of the thread does not pay
    /// for cold code paths.
    pub fn start<B>(backend: &B, registry: Arc<Registry>) -> Result<Self>
    where
        B: Backend<Session = S>,
    {
        let mut sessions = Vec::with_capacity(registry.len());
        for component in registry.components() {
            let mut session =
                backend.create_session(component.id, registry.is_multiplexed(component.id))?;
            for event in &component.events {
                session.add_event(event.code)?;
            }
            sessions.push(session);
        }
        for session in sessions.iter_mut() {
            session.start()?;
        }

        let mut ts = ThreadSession {
            values: vec![0; registry.total_events()],
            registry,
            sessions,
            cycles: 0,
            origin: 0,
        };
        ts.read()?;
        ts.origin = ts.cycles;
        ts.cycles = 0;
        Ok(ts)
    }

    /// Read every session. The last component is read together with the cycle timestamp.
    pub fn read(&mut self) -> Result<()> {
        let last = self.sessions.len().saturating_sub(1);
        let mut offset = 0;
        for (idx, (session, component)) in self
            .sessions
            .iter_mut()
            .zip(self.registry.components())
            .enumerate()
        {
            let values = &mut self.values[offset..offset + component.events.len()];
            if idx == last {
                self.cycles = session.read_ts(values)? - self.origin;
            } else {
                session.read(values)?;
            }
            log::trace!("Component {}: {:?}", component.name, values);
            offset += component.events.len();
        }
        Ok(())
    }

    /// The values of the latest read.
    #[inline]
    pub fn sample(&self) -> Sample<'_> {
        Sample {
            cycles: self.cycles,
            values: &self.values,
        }
    }

    /// Stop and destroy every session.
    ///
    /// Sessions that were not running are skipped silently, other failures are reported.
    pub fn release(mut self, cfg: &Config) {
        for (session, component) in self.sessions.iter_mut().zip(self.registry.components()) {
            match session.stop() {
                Ok(()) | Err(Error::NotRunning) => {}
                Err(e) => hl_error!(cfg, "Stopping component {} failed: {}.", component.name, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBackend;

    fn started(backend: &SimBackend, events: &str) -> ThreadSession<crate::sim::SimSession> {
        let cfg = Config::default().quiet();
        let registry = Registry::resolve(backend, Some(events), &cfg).unwrap();
        ThreadSession::start(backend, Arc::new(registry)).unwrap()
    }

    #[test]
    fn test_start_and_read() {
        let backend = SimBackend::default();
        let mut ts = started(&backend, "PAPI_TOT_INS,perf::TASK-CLOCK");
        assert!(backend.any_session_running());
        // Warm-up read already happened.
        assert_eq!(ts.sample().values, &[100, 1000]);
        assert_eq!(ts.sample().cycles, 0);
        ts.read().unwrap();
        assert_eq!(ts.sample().values, &[200, 2000]);
        assert_eq!(ts.sample().cycles, 10);
    }

    #[test]
    fn test_release_stops_sessions() {
        let backend = SimBackend::default();
        let ts = started(&backend, "PAPI_TOT_INS,perf::TASK-CLOCK");
        assert!(backend.any_session_running());
        ts.release(&Config::default().quiet());
        assert!(!backend.any_session_running());
    }

    #[test]
    fn test_read_failure_propagates() {
        // The warm-up read is the first read of the session.
        let backend = SimBackend::default().fail_reads_after(1);
        let mut ts = started(&backend, "PAPI_TOT_INS");
        assert!(ts.read().is_err());
    }
}
