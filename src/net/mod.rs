//! Socket endpoints: per-socket state machines that translate readiness
//! outcomes into user callbacks.

pub mod datagram;
pub mod listener;
pub mod stream;

pub use datagram::{DatagramCallbacks, DatagramSocket, DatagramState};
pub use listener::{ListenerCallbacks, ListenerState, ListeningSocket};
pub use stream::{StreamCallbacks, StreamSocket, StreamState};
