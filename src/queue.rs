//! The completion queue seam.

use std::io;
use std::time::Duration;

use crate::device::Cookie;

/// One record pulled from a completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionRecord {
    /// Bytes the device reports having written for this request.
    pub bytes: u32,
    /// The tag of the device the record originated from.
    pub tag: u64,
    /// Identity of the completed request: the submitting driver's
    /// status-record address.
    pub cookie: Cookie,
}

/// A handle yielding completion records.
///
/// A queue outlives every driver that posts to it. Waits are blocking with
/// an optional timeout; `None` means wait forever.
pub trait CompletionQueue {
    /// Wait for a single record. Returns `Ok(None)` on timeout.
    fn wait(&self, timeout: Option<Duration>) -> io::Result<Option<CompletionRecord>>;

    /// Wait for up to `max` records in one host call. Returns an empty
    /// vector on timeout. Records are returned in queue order.
    fn wait_batch(
        &self,
        max: usize,
        timeout: Option<Duration>,
    ) -> io::Result<Vec<CompletionRecord>>;
}
