//! Error taxonomy for the reactor.

use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers.
///
/// Recoverable conditions (`would-block`, connection errors observed during
/// send/recv) never appear here: endpoints translate them into interest
/// re-arming and callbacks. Everything else is either a misuse of an
/// endpoint or driver, or a fatal fault from the host.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The host poll device reported a status that is neither pending,
    /// aborted, nor a readiness outcome. The payload is the device's
    /// textual translation of the raw status.
    #[error("poll device fault: {0}")]
    DriverFatal(String),

    /// A socket operation failed with an unexpected error.
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    /// An endpoint operation was called in a state that does not permit it.
    #[error("{op} is invalid in the {state} state")]
    InvalidState {
        op: &'static str,
        state: &'static str,
    },

    /// A slot index is outside the driver's fixed capacity.
    #[error("slot {slot} out of range for driver capacity {capacity}")]
    InvalidSlot { slot: usize, capacity: usize },

    /// No active slot carries any readiness interest; there is nothing to
    /// poll for.
    #[error("no slot has readiness interest to poll for")]
    EmptyInterest,
}
