//! Turns user event specifications into validated event requests.

use crate::{Backend, Error, Result, Session};
use derive_more::Display;
use log::debug;

/// Events recorded when the user does not request any, kept only if supported by the machine.
pub const DEFAULT_EVENTS: [&str; 5] = [
    "perf::TASK-CLOCK",
    "PAPI_TOT_INS",
    "PAPI_TOT_CYC",
    "PAPI_FP_INS",
    "PAPI_FP_OPS",
];

/// How values of an event are folded into a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum EventKind {
    /// A running counter. Regions accumulate the difference between end and begin.
    #[display(fmt = "delta")]
    Delta,
    /// A point-in-time value. Regions accumulate the raw reading taken at the end.
    #[display(fmt = "instant")]
    Instant,
}

impl Default for EventKind {
    fn default() -> Self {
        EventKind::Delta
    }
}

/// An event name together with the way its values are accumulated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedEvent {
    /// Name understood by the counter backend.
    pub name: String,
    /// Accumulation semantics.
    pub kind: EventKind,
}

impl RequestedEvent {
    /// Create a delta event.
    pub fn delta<S: Into<String>>(name: S) -> Self {
        RequestedEvent {
            name: name.into(),
            kind: EventKind::Delta,
        }
    }

    /// Parse a single token of an event list.
    ///
    /// A `=instant` suffix selects instant semantics and `=delta` is accepted as a no-op. Any
    /// other suffix is kept as part of the name.
    pub fn parse(token: &str) -> Self {
        let token = crate::util::strip_whitespace(token);
        match token.find('=') {
            Some(idx) if &token[idx..] == "=instant" => RequestedEvent {
                name: String::from(&token[..idx]),
                kind: EventKind::Instant,
            },
            Some(idx) if &token[idx..] == "=delta" => RequestedEvent::delta(&token[..idx]),
            _ => RequestedEvent::delta(token),
        }
    }
}

/// Parse a comma separated event list.
///
/// Empty entries are skipped and repeated names keep their first occurrence. A list without any
/// name is rejected with [`Error::EmptyEventList`].
pub fn parse_event_list(spec: &str) -> Result<Vec<RequestedEvent>> {
    let mut events: Vec<RequestedEvent> = Vec::new();
    for token in spec.split(',') {
        let event = RequestedEvent::parse(token);
        if event.name.is_empty() {
            continue;
        }
        if events.iter().any(|e| e.name == event.name) {
            debug!("Dropping repeated event {}", event.name);
            continue;
        }
        events.push(event);
    }
    if events.is_empty() {
        return Err(Error::EmptyEventList);
    }
    debug!("Number of requested events: {}", events.len());
    Ok(events)
}

/// Check whether `name` can be counted on its own.
///
/// The check resolves the name and adds it to a scratch session which is destroyed afterwards.
pub fn check_event<B: Backend>(backend: &B, name: &str) -> Result<()> {
    let code = backend.resolve(name)?;
    let mut scratch = backend.create_session(backend.component_of(code), false)?;
    scratch.add_event(code)
}

/// Same as [`check_event`], reduced to a yes or no answer.
pub fn is_countable<B: Backend>(backend: &B, name: &str) -> bool {
    match check_event(backend, name) {
        Ok(()) => true,
        Err(e) => {
            debug!("Counter {} is not usable - {}", name, e);
            false
        }
    }
}

/// The default event set filtered to the events supported by `backend`.
pub fn default_events<B: Backend>(backend: &B) -> Vec<RequestedEvent> {
    DEFAULT_EVENTS
        .iter()
        .filter(|name| is_countable(backend, name))
        .map(|name| RequestedEvent::delta(*name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBackend;

    #[test]
    fn test_parse_suffixes() {
        assert_eq!(
            RequestedEvent::parse("PAPI_TOT_INS"),
            RequestedEvent {
                name: "PAPI_TOT_INS".into(),
                kind: EventKind::Delta
            }
        );
        let e = RequestedEvent::parse(" temp =instant");
        assert_eq!(e.name, "temp");
        assert_eq!(e.kind, EventKind::Instant);
        let e = RequestedEvent::parse("PAPI_TOT_CYC=delta");
        assert_eq!(e.name, "PAPI_TOT_CYC");
        assert_eq!(e.kind, EventKind::Delta);
        // Unknown suffixes stay in the name and fail resolution later.
        let e = RequestedEvent::parse("rapl:::PACKAGE_ENERGY=foo");
        assert_eq!(e.name, "rapl:::PACKAGE_ENERGY=foo");
        assert_eq!(e.kind, EventKind::Delta);
    }

    #[test]
    fn test_parse_event_list() {
        let events = parse_event_list("PAPI_TOT_INS, PAPI_TOT_CYC,,PAPI_TOT_INS,temp=instant").unwrap();
        let names: Vec<&str> = events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["PAPI_TOT_INS", "PAPI_TOT_CYC", "temp"]);
        assert_eq!(events[2].kind, EventKind::Instant);
    }

    #[test]
    fn test_empty_event_list() {
        assert!(matches!(parse_event_list(""), Err(Error::EmptyEventList)));
        assert!(matches!(parse_event_list(" , ,"), Err(Error::EmptyEventList)));
    }

    #[test]
    fn test_default_events_filtered() {
        let backend = SimBackend::default();
        let names: Vec<String> = default_events(&backend).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["perf::TASK-CLOCK", "PAPI_TOT_INS", "PAPI_TOT_CYC"]);
        assert!(is_countable(&backend, "PAPI_TOT_INS"));
        assert!(!is_countable(&backend, "PAPI_FP_OPS"));
    }

    #[test]
    fn test_display_kind() {
        assert_eq!(EventKind::Delta.to_string(), "delta");
        assert_eq!(EventKind::Instant.to_string(), "instant");
    }
}
