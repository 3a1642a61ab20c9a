//! Completion demultiplexing and the blocking event-loop surface.

use std::rc::{Rc, Weak};
use std::time::Duration;

use slab::Slab;
use tracing::{trace, warn};

use crate::driver::{Dispatch, PollDriver};
use crate::error::{Error, Result};
use crate::queue::{CompletionQueue, CompletionRecord};

/// Outcome of one loop turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    /// A completion was dispatched; the payload is the number of slots
    /// that received events.
    Dispatched(usize),
    /// The aborted completion of a cancelled request was consumed.
    Aborted,
    /// The wait timed out with no completion. Not an error.
    TimedOut,
    /// A record arrived whose cookie matches no registered driver.
    Unmatched,
}

/// Blocking wait on one completion queue, routing each record to the
/// driver whose status-record address matches its cookie.
///
/// One event loop services one queue. In the minimal configuration a
/// single driver posts to the queue and every record trivially resolves;
/// when several drivers share the queue, the cookie comparison picks the
/// right one.
pub struct EventLoop {
    queue: Rc<dyn CompletionQueue>,
    drivers: Slab<Weak<PollDriver>>,
}

impl EventLoop {
    pub fn new(queue: Rc<dyn CompletionQueue>) -> EventLoop {
        EventLoop {
            queue,
            drivers: Slab::new(),
        }
    }

    /// Register a driver whose completions arrive on this loop's queue.
    /// Returns a key for [`deregister`](Self::deregister).
    pub fn register(&mut self, driver: &Rc<PollDriver>) -> usize {
        self.drivers.insert(Rc::downgrade(driver))
    }

    pub fn deregister(&mut self, key: usize) {
        if self.drivers.contains(key) {
            self.drivers.remove(key);
        }
    }

    /// Number of live registered drivers.
    pub fn driver_count(&self) -> usize {
        self.drivers
            .iter()
            .filter(|(_, d)| d.strong_count() > 0)
            .count()
    }

    /// Wait for one completion and dispatch it.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<Turn> {
        match self.queue.wait(timeout).map_err(Error::Socket)? {
            Some(record) => self.dispatch(&record),
            None => Ok(Turn::TimedOut),
        }
    }

    /// Wait for up to `max` completions in one host call and dispatch them
    /// in the order returned. An empty result means the wait timed out.
    pub fn poll_batch(&mut self, max: usize, timeout: Option<Duration>) -> Result<Vec<Turn>> {
        let records = self.queue.wait_batch(max, timeout).map_err(Error::Socket)?;
        let mut turns = Vec::with_capacity(records.len());
        for record in &records {
            turns.push(self.dispatch(record)?);
        }
        Ok(turns)
    }

    fn dispatch(&mut self, record: &CompletionRecord) -> Result<Turn> {
        trace!(cookie = record.cookie, tag = record.tag, "completion record");
        let mut dead = Vec::new();
        let mut resolved = None;
        for (key, weak) in self.drivers.iter() {
            match weak.upgrade() {
                Some(driver) if driver.cookie() == record.cookie => {
                    resolved = Some(driver);
                    break;
                }
                Some(_) => {}
                None => dead.push(key),
            }
        }
        for key in dead {
            self.drivers.remove(key);
        }

        let Some(driver) = resolved else {
            warn!(cookie = record.cookie, "record matches no registered driver");
            return Ok(Turn::Unmatched);
        };
        match driver.handle_completion()? {
            Dispatch::Events(n) => Ok(Turn::Dispatched(n)),
            Dispatch::Aborted => Ok(Turn::Aborted),
        }
    }
}
