//! CAN socket address: an interface index wrapped as a `sockaddr_can`.

use std::mem::size_of;

use socket2::SockAddr;

use crate::compatibility::{sockaddr_can, AF_CAN};

/// A CAN socket address: just an interface index, since CAN has no notion
/// of ports. Used to bind both raw and BCM sockets.
#[derive(Copy, Clone, Debug)]
pub struct CanAddr {
    inner: sockaddr_can,
}

impl CanAddr {
    /// Builds an address for the given kernel interface index.
    pub fn new(if_index: libc::c_int) -> Self {
        // SAFETY: `sockaddr_can` (both the libc and OSX stand-in flavors)
        // is a plain struct of integers/unions of integers; the
        // all-zeroes bit pattern is a valid value for every field we
        // don't set explicitly below.
        let mut inner: sockaddr_can = unsafe { std::mem::zeroed() };
        inner.can_family = AF_CAN as libc::sa_family_t;
        inner.can_ifindex = if_index;
        CanAddr { inner }
    }

    /// The interface index this address refers to.
    pub fn if_index(&self) -> libc::c_int {
        self.inner.can_ifindex
    }
}

impl From<CanAddr> for SockAddr {
    fn from(addr: CanAddr) -> SockAddr {
        // SAFETY: `sockaddr_can` is POD and `size_of` bounds the write to
        // within the storage `SockAddr::try_init` provides.
        unsafe {
            SockAddr::try_init(|storage, len| {
                std::ptr::write(storage as *mut sockaddr_can, addr.inner);
                *len = size_of::<sockaddr_can>() as libc::socklen_t;
                Ok(())
            })
            .map(|((), sock_addr)| sock_addr)
            .expect("writing a sockaddr_can into socket2's storage cannot fail")
        }
    }
}

/// Resolves an interface name (e.g. `"can0"`) to its kernel index.
pub fn if_nametoindex(ifname: &str) -> std::io::Result<libc::c_uint> {
    nix::net::if_::if_nametoindex(ifname)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}
