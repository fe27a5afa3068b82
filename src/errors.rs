//! Crate-wide error type.

use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while describing a bus, encoding or
/// decoding a signal, or talking to the kernel's CAN sockets.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A caller-supplied value failed validation: an id out of range, a bad
    /// bit position, an unknown endianness/signal type, or a physical value
    /// outside a signal's representable range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A received frame's payload length did not match its frame
    /// definition's DLC.
    #[error("payload length mismatch: expected {expected} bytes, got {actual}")]
    PayloadLengthMismatch {
        /// DLC declared by the frame definition.
        expected: usize,
        /// Length of the payload actually received.
        actual: usize,
    },

    /// The receive deadline elapsed before a frame arrived.
    #[error("timed out waiting for a frame")]
    Timeout,

    /// The underlying network interface is down (`ENETDOWN`).
    #[error("interface is down")]
    InterfaceDown,

    /// The socket has already been closed (`EBADF`).
    #[error("socket is closed")]
    Closed,

    /// The kernel reported `EINVAL` for a delete-style BCM operation
    /// (`TX_DELETE`/`RX_DELETE`) because no such slot exists.
    #[error("not found by kernel: frame id {frame_id:#x}")]
    NotFoundByKernel {
        /// The frame id the operation targeted.
        frame_id: u32,
    },

    /// A BCM control message was the wrong size, or carried an opcode this
    /// library does not expect to receive.
    #[error("malformed BCM control message: {0}")]
    MalformedControlMessage(String),

    /// A configuration is missing a bus, names an unknown bus, or names an
    /// unknown signal.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Any other OS-level error from the socket layer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A `nix`-level error from a raw syscall wrapper.
    #[error("system call failed: {0}")]
    Nix(#[from] nix::Error),

    /// Failed to parse or validate a KCD document.
    #[cfg(feature = "kcd")]
    #[error("KCD error: {0}")]
    Kcd(String),

    /// Failed to parse a KCD document as XML.
    #[cfg(feature = "kcd")]
    #[error("KCD XML error: {0}")]
    KcdXml(#[from] quick_xml::Error),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Error {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn configuration(msg: impl Into<String>) -> Error {
        Error::Configuration(msg.into())
    }

    /// Maps an `errno` observed after a raw socket operation to the
    /// corresponding library error, defaulting to a bare `io::Error` for
    /// anything not specifically called out by the design.
    pub(crate) fn from_raw_os_error(err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(libc::ENETDOWN) => Error::InterfaceDown,
            Some(libc::EBADF) => Error::Closed,
            _ if err.kind() == io::ErrorKind::WouldBlock
                || err.kind() == io::ErrorKind::TimedOut =>
            {
                Error::Timeout
            }
            _ => Error::Io(err),
        }
    }
}
