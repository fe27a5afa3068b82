//! The raw CAN interface: per-frame send/receive with kernel-side id
//! filtering (§4.5).

use std::mem::size_of;
use std::time::Duration;

use crate::addr::{if_nametoindex, CanAddr};
use crate::compatibility::{self, can_filter, CAN_RAW_FILTER, SOL_CAN_RAW};
use crate::errors::{Error, Result};
use crate::frame::CanFrame;

/// Largest filter list the kernel is asked to install; beyond this the
/// library falls back to unfiltered (wildcard) reception, same as an
/// empty list.
pub const MAX_NUMBER_OF_RAW_RECEIVE_FILTERS: usize = 100;

/// Common behavior of a bound CAN socket: open it, bound to an interface,
/// and set its receive deadline.
pub trait Socket: Sized {
    /// Opens a socket bound to the named interface (e.g. `"can0"`).
    fn open_iface(ifname: &str) -> Result<Self>;

    /// Sets how long [`CanSocket::recv`] blocks before returning
    /// [`Error::Timeout`]. `None` blocks forever.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()>;
}

/// A raw CAN socket bound to one interface.
#[derive(Debug)]
pub struct CanSocket {
    socket: socket2::Socket,
}

impl Socket for CanSocket {
    fn open_iface(ifname: &str) -> Result<Self> {
        let if_index = if_nametoindex(ifname)?;
        let addr = CanAddr::new(if_index as libc::c_int);
        let socket = compatibility::raw_open_socket(&addr)?;
        log::debug!("opened raw CAN socket on {ifname}");
        Ok(CanSocket { socket })
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }
}

impl CanSocket {
    /// Serializes `frame` to the 16-byte wire format and writes it in one
    /// datagram.
    pub fn send(&self, frame: &CanFrame) -> Result<()> {
        self.write_raw_frame(frame)
            .map_err(Error::from_raw_os_error)
    }

    /// Reads one datagram and parses it into a [`CanFrame`].
    pub fn recv(&self) -> Result<CanFrame> {
        let raw = self.read_raw_frame().map_err(Error::from_raw_os_error)?;
        Ok(raw.into())
    }

    /// Installs a kernel id filter list so that only frames with exactly
    /// these ids are delivered. An empty list, or one larger than
    /// [`MAX_NUMBER_OF_RAW_RECEIVE_FILTERS`], is a silent no-op —
    /// reception stays unfiltered.
    pub fn set_filters(&self, frame_ids: &[u32]) -> Result<()> {
        if frame_ids.is_empty() || frame_ids.len() > MAX_NUMBER_OF_RAW_RECEIVE_FILTERS {
            log::debug!(
                "set_filters: {} ids, leaving reception unfiltered",
                frame_ids.len()
            );
            return Ok(());
        }
        let filters: Vec<can_filter> = frame_ids
            .iter()
            .map(|&id| can_filter {
                can_id: id,
                can_mask: 0x7FF,
            })
            .collect();

        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&self.socket);
        let ret = unsafe {
            compatibility::setsockopt_wrapper(
                fd,
                SOL_CAN_RAW,
                CAN_RAW_FILTER,
                filters.as_ptr() as *const libc::c_void,
                (filters.len() * size_of::<can_filter>()) as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::from_raw_os_error(std::io::Error::last_os_error()));
        }
        log::debug!("installed {} raw receive filters", filters.len());
        Ok(())
    }

    pub(crate) fn as_raw_socket(&self) -> &socket2::Socket {
        &self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_cap_is_documented_and_stable() {
        assert_eq!(MAX_NUMBER_OF_RAW_RECEIVE_FILTERS, 100);
    }
}
