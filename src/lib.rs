//! afdio - readiness-based socket reactor for completion-port hosts.
//!
//! Some hosts only offer completion-based I/O: operations are queued and
//! the kernel reports when they finish. Their kernels still expose a poll
//! channel: a device that accepts a "tell me when any of these sockets
//! is ready" request and completes it, through a completion queue, with a
//! readiness bitmap. This crate turns that primitive into a conventional
//! readiness reactor: non-blocking sockets, per-socket callbacks, and an
//! event loop.
//!
//! # Architecture
//!
//! - [`Readiness`]: the set algebra of poll conditions.
//! - [`PollDriver`]: owns one in-flight poll request covering a fixed
//!   table of slots, the shared descriptor buffers, and the
//!   cancel/re-arm lifecycle.
//! - [`EventLoop`]: waits on a completion queue and routes each record to
//!   the driver whose status-record address matches its cookie.
//! - [`StreamSocket`] / [`ListeningSocket`] / [`DatagramSocket`]: state
//!   machines translating readiness outcomes into user callbacks.
//! - [`PollDevice`] / [`CompletionQueue`] / [`SocketOps`]: the three host
//!   surfaces. [`sys::windows`] implements them on `\Device\Afd` and I/O
//!   completion ports; [`sim`] implements them deterministically in
//!   memory for tests.
//!
//! # Quick start
//!
//! ```ignore
//! use afdio::{DriverHandle, EventLoop, PollDriver, StreamCallbacks, StreamSocket};
//! use afdio::sys::windows::{AfdDevice, IocpQueue, WinSocket};
//! use std::rc::Rc;
//!
//! struct Echo;
//! impl StreamCallbacks for Echo {
//!     fn on_readable(&mut self, sock: &StreamSocket) {
//!         let mut buf = [0u8; 4096];
//!         while let Ok(n) = sock.read(&mut buf) {
//!             if n == 0 { break; }
//!             let _ = sock.write(&buf[..n]);
//!         }
//!     }
//! }
//!
//! let queue = Rc::new(IocpQueue::new()?);
//! let device = AfdDevice::new(&queue)?;
//! let driver = PollDriver::new(device, 64);
//! let mut event_loop = EventLoop::new(queue);
//! event_loop.register(&driver);
//!
//! let sock = StreamSocket::new(
//!     DriverHandle::new(&driver, 0),
//!     Box::new(WinSocket::stream()?),
//!     Box::new(Echo),
//! )?;
//! sock.connect("127.0.0.1:5050".parse()?)?;
//! loop {
//!     event_loop.poll_once(None)?;
//! }
//! ```
//!
//! # Model
//!
//! One event loop services one completion queue on one thread; all
//! callbacks run there and no locks exist anywhere. Scaling out means
//! more driver/queue pairs, each on its own thread. Kernel polling is
//! level-triggered; endpoints strip each handled condition from their
//! interest mask, so user callbacks see edges, and `read`/`write` re-add
//! the condition when they hit the non-blocking limit.

mod device;
mod driver;
mod error;
mod event_loop;
mod events;
mod queue;
mod sock;

pub mod net;
pub mod sim;
pub mod sys;

pub use device::{
    CompletionStatus, Cookie, PollDevice, PollEntry, PollRequest, PollSet, RawSock, StatusBlock,
    SubmitOutcome,
};
pub use driver::{Dispatch, DriverHandle, EventSink, PollDriver, PollDriverBuilder};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, Turn};
pub use events::Readiness;
pub use net::{
    DatagramCallbacks, DatagramSocket, DatagramState, ListenerCallbacks, ListenerState,
    ListeningSocket, StreamCallbacks, StreamSocket, StreamState,
};
pub use queue::{CompletionQueue, CompletionRecord};
pub use sock::SocketOps;
