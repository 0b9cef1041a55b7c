//! Groups the requested events by the counter component serving them.
//!
//! Every component is validated with a template session that receives the events one after
//! another. Events that can not be counted, or that can not be counted together with the events
//! accepted before them, are dropped with a warning. The template sessions are destroyed once all
//! events were processed; only the event metadata survives in the [`Registry`].

use crate::events::{check_event, default_events, parse_event_list, EventKind, RequestedEvent};
use crate::{Backend, ComponentId, Config, Error, EventCode, Result, Session};
use derive_more::{Index, IntoIterator};
use log::debug;

/// An event accepted by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedEvent {
    /// Name as requested by the user.
    pub name: String,
    /// Code resolved by the backend.
    pub code: EventCode,
    /// Accumulation semantics.
    pub kind: EventKind,
}

/// A counter subsystem in use and the events it serves, in registration order.
#[derive(Debug, Clone)]
pub struct Component {
    /// Backend identifier of the component.
    pub id: ComponentId,
    /// Human readable component name.
    pub name: String,
    /// Events served by this component.
    pub events: Vec<TrackedEvent>,
}

/// The fixed set of components and events recorded by every thread.
#[derive(Debug, Default, Index, IntoIterator)]
pub struct Registry {
    #[index]
    #[into_iterator(owned, ref)]
    components: Vec<Component>,
    multiplex: bool,
}

/// Template session of a component under construction.
struct Pending<S> {
    component: Component,
    session: S,
}

impl Registry {
    /// Validate `events` against `backend` and group them by component.
    ///
    /// Fails with [`Error::NoUsableEvents`] if no event survives.
    pub fn build<B: Backend>(backend: &B, events: &[RequestedEvent], cfg: &Config) -> Result<Self> {
        debug!("Create components");
        let multiplex = cfg.is_multiplexed();
        let mut pending: Vec<Pending<B::Session>> = Vec::new();

        for event in events {
            if check_event(backend, &event.name).is_err() {
                hl_warn!(
                    cfg,
                    "\"{}\" does not exist or is not supported on this machine.",
                    event.name
                );
                continue;
            }
            let code = backend.resolve(&event.name)?;
            let id = backend.component_of(code);

            let idx = match pending.iter().position(|p| p.component.id == id) {
                Some(idx) => idx,
                None => {
                    let session = backend.create_session(id, multiplex && id == ComponentId::CPU)?;
                    pending.push(Pending {
                        component: Component {
                            id,
                            name: backend.component_name(id),
                            events: Vec::new(),
                        },
                        session,
                    });
                    pending.len() - 1
                }
            };

            let entry = &mut pending[idx];
            if let Err(e) = entry.session.add_event(code) {
                debug!("Cannot add {} - {}", event.name, e);
                let mut combination: Vec<&str> = entry
                    .component
                    .events
                    .iter()
                    .map(|e| e.name.as_str())
                    .collect();
                combination.push(&event.name);
                hl_warn!(
                    cfg,
                    "Cannot add {} to component {}.\nThe following event combination is not supported:\n  {}\nAdvice: Use papi_event_chooser to obtain an appropriate event set for this component or set PAPI_MULTIPLEX=1.",
                    event.name,
                    entry.component.name,
                    combination.join("\n  ")
                );
                continue;
            }
            entry.component.events.push(TrackedEvent {
                name: event.name.clone(),
                code,
                kind: event.kind,
            });
        }

        // Dropping the template sessions destroys them.
        let components: Vec<Component> = pending
            .into_iter()
            .map(|p| p.component)
            .filter(|c| !c.events.is_empty())
            .collect();
        debug!("Number of components {}", components.len());
        if components.is_empty() {
            return Err(Error::NoUsableEvents);
        }

        let listing: Vec<String> = components
            .iter()
            .flat_map(|c| c.events.iter())
            .map(|e| format!("  {}", e.name))
            .collect();
        hl_info!(cfg, "Using the following events:\n{}", listing.join("\n"));

        Ok(Registry {
            components,
            multiplex,
        })
    }

    /// Determine the events to record.
    ///
    /// `explicit` takes precedence over the event list of the configuration. If neither is given,
    /// or the given list yields no usable event, the supported subset of
    /// [`crate::DEFAULT_EVENTS`] is used.
    pub fn resolve<B: Backend>(backend: &B, explicit: Option<&str>, cfg: &Config) -> Result<Self> {
        if let Some(spec) = explicit.or_else(|| cfg.event_list()) {
            debug!("User events: {}", spec);
            match parse_event_list(spec).and_then(|events| Registry::build(backend, &events, cfg)) {
                Ok(registry) => return Ok(registry),
                Err(e) => {
                    debug!("Requested events rejected - {}", e);
                    hl_warn!(cfg, "All requested events do not work, using default.");
                }
            }
        }
        debug!("Default events");
        Registry::build(backend, &default_events(backend), cfg)
    }

    /// Components in registration order.
    #[inline]
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Number of components.
    #[inline]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Check if the registry holds no component.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Number of tracked events over all components.
    pub fn total_events(&self) -> usize {
        self.components.iter().map(|c| c.events.len()).sum()
    }

    /// All tracked events, flattened in component order.
    pub fn events(&self) -> impl Iterator<Item = &TrackedEvent> {
        self.components.iter().flat_map(|c| c.events.iter())
    }

    /// Names of all tracked events, flattened in component order.
    pub fn names(&self) -> Vec<String> {
        self.events().map(|e| e.name.clone()).collect()
    }

    /// Kinds of all tracked events, flattened in component order.
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().map(|e| e.kind).collect()
    }

    /// Check if sessions of component `id` are multiplexed.
    #[inline]
    pub fn is_multiplexed(&self, id: ComponentId) -> bool {
        self.multiplex && id == ComponentId::CPU
    }
}
