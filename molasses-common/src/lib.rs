//! Shared plumbing for the molasses daemon: configuration, logging,
//! error types, and the record codec spoken on the internal pipes.

pub mod config;
pub mod error;
pub mod logging;
pub mod record;

pub use tracing;

/// Control signal fanned out over the shutdown broadcast channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}

/// Seconds since the Unix epoch. All policy code takes `now` explicitly
/// so tests can supply their own clock; this is the one place the wall
/// clock is read.
#[allow(clippy::cast_possible_wrap)]
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs() as i64)
}
