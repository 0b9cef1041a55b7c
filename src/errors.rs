//! Utilities dealing with error handling in this crate.

use failure::Fail;

/// Errors produced by this crate.
#[derive(Debug, Fail)]
pub enum Error {
    /// Errors originating from calls to `std::io::*`.
    #[fail(display = "IO Error - {}", _0)]
    IO(#[cause] std::io::Error),
    /// Errors originating from calls to `regex::*`.
    #[fail(display = "Regex Error - {}", _0)]
    Regex(#[cause] regex::Error),
    /// Errors parsing Glob patterns.
    #[fail(display = "Glob Error - {}", _0)]
    GlobPattern(#[cause] glob::PatternError),
    /// Errors interating over entries in a glob.
    #[fail(display = "Glob Error - {}", _0)]
    GlobIter(#[cause] glob::GlobError),
    /// Errors caused by parsing integers from strings.
    #[fail(display = "Parse Error - {}", _0)]
    ParseInt(#[cause] std::num::ParseIntError),
    /// Errors while serializing the measurement report.
    #[fail(display = "JSON Error - {}", _0)]
    Json(#[cause] serde_json::Error),
    /// Errors originating from calls to `libc` or other system utilties.
    #[fail(display = "System Error - {}", _0)]
    System(#[cause] nix::Error),
    /// `init` was called after the library had already been brought up.
    #[fail(display = "High-level API has already been initialized")]
    AlreadyInitialized,
    /// The library is disengaged after an earlier failure or after finalization.
    #[fail(display = "High-level API is deactivated")]
    Deactivated,
    /// A session or the whole library is not counting.
    #[fail(display = "Counters are not running")]
    NotRunning,
    /// Another thread did not finish the one-time initialization in time.
    #[fail(display = "Timed out waiting for library initialization")]
    InitTimeout,
    /// An event specification string contained no event names.
    #[fail(display = "Event list is empty")]
    EmptyEventList,
    /// None of the requested or default events can be counted.
    #[fail(display = "No usable events")]
    NoUsableEvents,
    /// An event name could not be resolved by the counter backend.
    #[fail(display = "Unknown event {}", _0)]
    UnknownEvent(String),
    /// An event can not be counted together with the events already in a session.
    #[fail(display = "Cannot add {} to component {}", event, component)]
    EventConflict {
        /// Name of the rejected event.
        event: String,
        /// Name of the component owning the session.
        component: String,
    },
    /// `region_read`/`region_end` without a preceding `region_begin` on the same thread.
    #[fail(display = "Cannot find matching region for {}(\"{}\")", op, region)]
    NoMatchingRegion {
        /// Region name supplied by the caller.
        region: String,
        /// Name of the failing operation.
        op: &'static str,
    },
    /// The counter backend does not support the requested feature.
    #[fail(display = "Not supported")]
    NotSupported,
}

impl Error {
    /// Create a new instance of error from the `errno` variable.
    #[inline]
    pub fn from_errno() -> Self {
        Error::System(nix::errno::Errno::last())
    }
}

macro_rules! error_from {
    ($et: ty => $cet: expr) => {
        impl From<$et> for Error {
            #[inline]
            fn from(err: $et) -> Self {
                $cet(err)
            }
        }
    };
}

error_from!(std::io::Error => Error::IO);
error_from!(regex::Error => Error::Regex);
error_from!(glob::PatternError => Error::GlobPattern);
error_from!(glob::GlobError => Error::GlobIter);
error_from!(std::num::ParseIntError => Error::ParseInt);
error_from!(serde_json::Error => Error::Json);
error_from!(nix::Error => Error::System);

/// Result type used in this crate.
pub type Result<T> = std::result::Result<T, Error>;
