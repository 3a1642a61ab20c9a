//! Winsock sockets for the reactor.

use std::cell::RefCell;
use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{Shutdown, SocketAddr};
use std::os::windows::io::AsRawSocket;
use std::ptr;

use socket2::{Domain, Protocol, Socket, Type};
use windows_sys::Win32::Networking::WinSock::{
    INVALID_SOCKET, SIO_BASE_HANDLE, SIO_BSP_HANDLE_POLL, SOCKET, SOCKET_ERROR, WSAIoctl,
};

use crate::device::RawSock;
use crate::sock::SocketOps;

fn ioctl_socket(socket: SOCKET, ioctl: u32) -> Option<SOCKET> {
    let mut base: SOCKET = INVALID_SOCKET;
    let mut bytes: u32 = 0;
    let rc = unsafe {
        WSAIoctl(
            socket,
            ioctl,
            ptr::null(),
            0,
            &mut base as *mut _ as *mut _,
            mem::size_of::<SOCKET>() as u32,
            &mut bytes,
            ptr::null_mut(),
            None,
        )
    };
    (rc != SOCKET_ERROR && base != INVALID_SOCKET).then_some(base)
}

/// Unwrap layered service provider handles down to the base socket.
///
/// Some LSPs intercept `SIO_BASE_HANDLE` to prevent bypass; they do not
/// handle `SIO_BSP_HANDLE_POLL`, which yields the next socket in the
/// protocol chain, so alternating the two converges on the real base
/// handle.
fn base_socket(socket: SOCKET) -> io::Result<SOCKET> {
    let mut current = socket;
    for _ in 0..16 {
        if let Some(base) = ioctl_socket(current, SIO_BASE_HANDLE) {
            return Ok(base);
        }
        match ioctl_socket(current, SIO_BSP_HANDLE_POLL) {
            Some(next) if next != current => current = next,
            _ => break,
        }
    }
    Err(io::Error::other("unable to retrieve base socket handle"))
}

/// A non-blocking winsock socket.
pub struct WinSocket {
    inner: RefCell<Option<Socket>>,
    base: RawSock,
}

impl WinSocket {
    /// Create a non-blocking TCP socket.
    pub fn stream() -> io::Result<WinSocket> {
        Self::from_socket(Socket::new(
            Domain::IPV4,
            Type::STREAM,
            Some(Protocol::TCP),
        )?)
    }

    /// Create a non-blocking UDP socket.
    pub fn datagram() -> io::Result<WinSocket> {
        Self::from_socket(Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?)
    }

    fn from_socket(socket: Socket) -> io::Result<WinSocket> {
        socket.set_nonblocking(true)?;
        let base = base_socket(socket.as_raw_socket() as SOCKET)?;
        Ok(WinSocket {
            inner: RefCell::new(Some(socket)),
            base: base as RawSock,
        })
    }

    fn with_socket<T>(&self, f: impl FnOnce(&Socket) -> io::Result<T>) -> io::Result<T> {
        let inner = self.inner.borrow();
        match inner.as_ref() {
            Some(socket) => f(socket),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }
}

impl SocketOps for WinSocket {
    fn base_handle(&self) -> RawSock {
        self.base
    }

    fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        self.with_socket(|s| s.bind(&addr.into()))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.with_socket(|s| {
            s.local_addr()?
                .as_socket()
                .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))
        })
    }

    fn listen(&self, backlog: u32) -> io::Result<()> {
        self.with_socket(|s| s.listen(backlog.min(i32::MAX as u32) as i32))
    }

    fn accept(&self) -> io::Result<(Box<dyn SocketOps>, SocketAddr)> {
        self.with_socket(|s| {
            let (accepted, addr) = s.accept()?;
            let addr = addr
                .as_socket()
                .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))?;
            let accepted = WinSocket::from_socket(accepted)?;
            Ok((Box::new(accepted) as Box<dyn SocketOps>, addr))
        })
    }

    fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        self.with_socket(|s| s.connect(&addr.into()))
    }

    fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.with_socket(|s| s.send(data))
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_socket(|s| {
            // socket2 reads into possibly-uninitialized storage; a &mut [u8]
            // is always a valid view of it.
            let uninit =
                unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
            s.recv(uninit)
        })
    }

    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.with_socket(|s| s.send_to(data, &addr.into()))
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.with_socket(|s| {
            let uninit =
                unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
            let (n, addr) = s.recv_from(uninit)?;
            let addr = addr
                .as_socket()
                .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))?;
            Ok((n, addr))
        })
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.with_socket(|s| s.shutdown(how))
    }

    fn close(&self) -> io::Result<()> {
        // Dropping the socket closes the handle; an in-flight poll
        // observes the close as a local-close readiness.
        drop(self.inner.borrow_mut().take());
        Ok(())
    }
}
