//! Exchange structured signals over SocketCAN, described by a KCD bus
//! definition.
//!
//! This crate sits on top of the kernel's two CAN delivery modes: a raw,
//! per-frame socket ([`raw`]) and the broadcast manager ([`bcm`]), which
//! the kernel runs as a periodic transmitter and an inbound
//! throttling/change-detection engine. A [`Configuration`] of
//! [`CanFrameDefinition`]s and [`CanSignalDefinition`]s describes how
//! physical values map onto a frame's payload bytes; the [`Bus`] façade
//! ties a configuration to one open interface and exposes a
//! signal-oriented send/receive API.
//!
//! Everything in this crate targets classic CAN (0..8 data bytes); there
//! is no CAN-FD support.

#![deny(
    missing_docs,
    missing_copy_implementations,
    missing_debug_implementations,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unsafe_op_in_unsafe_fn
)]

mod addr;
mod bcm;
mod bits;
mod bus;
mod compatibility;
mod config;
mod definition;
mod errors;
mod frame;
#[cfg(feature = "kcd")]
mod kcd;
mod raw;
mod signal;

pub use addr::CanAddr;
pub use bcm::BcmSocket;
pub use bits::Endianness;
pub use bus::{Bus, Mode};
pub use config::Configuration;
pub use definition::{CanFrameDefinition, FrameFormat};
pub use errors::{Error, Result};
pub use frame::{AsPtr, CanFrame};
#[cfg(feature = "kcd")]
pub use kcd::{from_kcd_file, from_kcd_str, to_kcd_string, write_kcd_file};
pub use raw::{CanSocket, Socket};
pub use signal::{CanSignalDefinition, SignalType};

pub(crate) use frame::as_bytes_mut;

/// Shorthand used throughout the socket layer, matching the signature of
/// the raw libc/`socket2` calls it wraps.
pub type IoResult<T> = std::io::Result<T>;
