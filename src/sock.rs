//! The socket primitive seam.

use std::io;
use std::net::{Shutdown, SocketAddr};

use crate::device::RawSock;

/// Non-blocking socket operations, stream or datagram.
///
/// Implementations are always in non-blocking mode: an operation that
/// cannot proceed returns `io::ErrorKind::WouldBlock` rather than
/// suspending. Connection-level failures surface as
/// `ConnectionReset`/`ConnectionAborted`; endpoints recover those locally.
///
/// Datagram-only operations have stream defaults that report
/// `Unsupported`, and vice versa, so a single trait object serves both
/// endpoint families.
pub trait SocketOps {
    /// The kernel-level base handle for this socket: the object beneath
    /// any layered handles a filter extension may have installed. Poll
    /// association always uses this handle.
    fn base_handle(&self) -> RawSock;

    fn bind(&self, addr: SocketAddr) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn listen(&self, backlog: u32) -> io::Result<()> {
        let _ = backlog;
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    /// Accept one pending connection. `WouldBlock` signals a drained
    /// backlog.
    fn accept(&self) -> io::Result<(Box<dyn SocketOps>, SocketAddr)> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    /// Begin a non-blocking connect. `WouldBlock` means the attempt is in
    /// progress; its resolution arrives as readiness.
    fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        let _ = addr;
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn send(&self, data: &[u8]) -> io::Result<usize> {
        let _ = data;
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let _ = buf;
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let _ = (data, addr);
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let _ = buf;
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let _ = how;
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    /// Close the underlying socket. Further operations fail. Closing an
    /// already-closed socket is a no-op.
    fn close(&self) -> io::Result<()>;
}

/// Whether an I/O error is the non-blocking "try again later" indicator.
pub(crate) fn is_would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// Whether an I/O error reports the connection itself failing
/// (reset/aborted/network reset), which endpoints recover by re-arming
/// interest so the condition is observed through the poll channel.
pub(crate) fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}
