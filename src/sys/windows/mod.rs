//! Windows host backend.
//!
//! The readiness poll channel is an `\Device\Afd` handle driven with
//! `IOCTL_AFD_POLL`; completions arrive on an I/O completion port. There
//! is little danger of this interface changing: libuv, wepoll and the
//! major Rust pollers all sit on it.

mod afd;
mod iocp;
mod socket;

pub use afd::AfdDevice;
pub use iocp::IocpQueue;
pub use socket::WinSocket;
