//! Readiness conditions and their set algebra.

bitflags::bitflags! {
    /// A set of socket readiness conditions.
    ///
    /// Both the interest registered with a poll driver and the outcome
    /// delivered on completion are expressed as `Readiness` sets. The bit
    /// values match the host poll device's encoding so that descriptor
    /// buffers can carry them verbatim, but callers only ever deal in the
    /// named conditions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Readiness: u32 {
        /// Data is available to receive.
        const READABLE = 0x0001;
        /// Out-of-band data is available to receive.
        const READABLE_OOB = 0x0002;
        /// The socket can accept more outgoing data.
        const WRITABLE = 0x0004;
        /// The peer has shut down its sending side.
        const PEER_CLOSED = 0x0008;
        /// The connection was reset or aborted.
        const RESET = 0x0010;
        /// The socket was closed locally.
        const LOCAL_CLOSE = 0x0020;
        /// A listening socket has a connection ready to accept.
        const ACCEPT = 0x0080;
        /// An outbound connection attempt failed.
        const CONNECT_FAIL = 0x0100;
    }
}

impl Readiness {
    /// Every condition except `WRITABLE`.
    ///
    /// Useful as a steady-state interest mask: writability is usually only
    /// interesting after a send has been refused.
    pub const ALL_EXCEPT_WRITABLE: Readiness = Readiness::READABLE
        .union(Readiness::READABLE_OOB)
        .union(Readiness::PEER_CLOSED)
        .union(Readiness::RESET)
        .union(Readiness::LOCAL_CLOSE)
        .union(Readiness::ACCEPT)
        .union(Readiness::CONNECT_FAIL);

    /// Every condition.
    pub const ALL: Readiness = Readiness::ALL_EXCEPT_WRITABLE.union(Readiness::WRITABLE);
}
