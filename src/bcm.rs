//! The broadcast manager (BCM) control channel: header codec plus
//! periodic-send and receive-subscription opcodes (§4.6, the hard part).

use std::io::{Read, Write};

use bitflags::bitflags;

use crate::addr::{if_nametoindex, CanAddr};
use crate::compatibility;
use crate::definition::FrameFormat;
use crate::errors::{Error, Result};
use crate::frame::{as_bytes, as_bytes_mut, CanFrame};

/// Largest message this library reads off the BCM channel: a 56-byte
/// header plus as many as one raw frame's worth of payload, rounded up
/// generously to stay well clear of any kernel padding.
const MAX_NUMBER_OF_BYTES_FROM_BCM: usize = 1024;

const EFF_FLAG: u32 = 0x8000_0000;
const EFF_MASK: u32 = 0x1FFF_FFFF;

/// BCM opcodes, as defined by the Linux kernel's `linux/can/bcm.h`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum OpCode {
    /// Create or update a periodic transmission job.
    TxSetup = 1,
    /// Remove a transmission job.
    TxDelete = 2,
    /// Read back a transmission job's properties (unused by this crate).
    TxRead = 3,
    /// Send one frame immediately.
    TxSend = 4,
    /// Create a receive content filter subscription.
    RxSetup = 5,
    /// Remove a receive content filter subscription.
    RxDelete = 6,
    /// Read back a receive subscription's properties (unused).
    RxRead = 7,
    /// Reply to `TxRead` (unused).
    TxStatus = 8,
    /// Notification that a send job's count expired (unused).
    TxExpired = 9,
    /// Reply to `RxRead` (unused).
    RxStatus = 10,
    /// A cyclic message stopped arriving (unused).
    RxTimeout = 11,
    /// The only inbound opcode this library interprets: a new or changed
    /// frame was received.
    RxChanged = 12,
}

impl OpCode {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => OpCode::TxSetup,
            2 => OpCode::TxDelete,
            3 => OpCode::TxRead,
            4 => OpCode::TxSend,
            5 => OpCode::RxSetup,
            6 => OpCode::RxDelete,
            7 => OpCode::RxRead,
            8 => OpCode::TxStatus,
            9 => OpCode::TxExpired,
            10 => OpCode::RxStatus,
            11 => OpCode::RxTimeout,
            12 => OpCode::RxChanged,
            _ => return None,
        })
    }
}

bitflags! {
    /// BCM message flags.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct BcmFlags: u32 {
        /// Set the value of ival1, ival2, and count.
        const SETTIMER = 0x0001;
        /// (Re)arm the timer; emits one frame immediately.
        const STARTTIMER = 0x0002;
        /// Generate `TX_EXPIRED` when `count` reaches zero.
        const TX_COUNTEVT = 0x0004;
        /// Emit a frame immediately when its data changes.
        const TX_ANNOUNCE = 0x0008;
        /// Copy `can_id` from the header into each frame.
        const TX_CP_CAN_ID = 0x0010;
        /// Filter purely by id, no frame payload required.
        const RX_FILTER_ID = 0x0020;
        /// A DLC change alone triggers `RX_CHANGED`.
        const RX_CHECK_DLC = 0x0040;
        /// Suppress the automatic timeout-monitoring timer.
        const RX_NO_AUTOTIMER = 0x0080;
        /// Re-announce on timeout recovery even without a data change.
        const RX_ANNOUNCE_RESUME = 0x0100;
        /// Reset the multiplex index counter.
        const TX_RESET_MULTI_IDX = 0x0200;
        /// Use the filter payload as the frame to send on RTR receipt.
        const RX_RTR_FRAME = 0x0400;
    }
}

/// Head of a message to or from the broadcast manager (§6.2). Its layout
/// matches the kernel's `struct bcm_msg_head` on the host it's compiled
/// for: `ival1`/`ival2` use the platform's actual `time_t`/`suseconds_t`
/// widths, not a nominal fixed size, so the struct lines up correctly on
/// hosts where the kernel headers widen those fields.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct BcmMsgHead {
    opcode: u32,
    flags: u32,
    count: u32,
    ival1_seconds: libc::time_t,
    ival1_useconds: libc::suseconds_t,
    ival2_seconds: libc::time_t,
    ival2_useconds: libc::suseconds_t,
    can_id: u32,
    nframes: u32,
}

fn ms_to_interval(ms: u32) -> (libc::time_t, libc::suseconds_t) {
    let seconds = (ms / 1000) as libc::time_t;
    let useconds = ((ms % 1000) * 1000) as libc::suseconds_t;
    (seconds, useconds)
}

fn combined_id(frame_id: u32, format: FrameFormat) -> u32 {
    match format {
        FrameFormat::Standard => frame_id & EFF_MASK,
        FrameFormat::Extended => (frame_id & EFF_MASK) | EFF_FLAG,
    }
}

fn decode_combined_id(combined: u32) -> (u32, FrameFormat) {
    if combined & EFF_FLAG != 0 {
        (combined & EFF_MASK, FrameFormat::Extended)
    } else {
        (combined & EFF_MASK, FrameFormat::Standard)
    }
}

/// A connected socket to the kernel's broadcast manager.
#[derive(Debug)]
pub struct BcmSocket {
    socket: socket2::Socket,
}

impl BcmSocket {
    /// Opens and connects a BCM socket to the named interface.
    pub fn open_iface(ifname: &str) -> Result<Self> {
        let if_index = if_nametoindex(ifname)?;
        let addr = CanAddr::new(if_index as libc::c_int);
        let socket = compatibility::open_bcm_socket(&addr)?;
        log::debug!("opened BCM socket on {ifname}");
        Ok(BcmSocket { socket })
    }

    fn write_message(&self, head: &BcmMsgHead, frame: Option<&CanFrame>) -> Result<()> {
        // SAFETY: `BcmMsgHead` is `#[repr(C)]` over plain integers.
        let head_bytes = unsafe { as_bytes(head) };
        let mut buf = Vec::with_capacity(head_bytes.len() + 16);
        buf.extend_from_slice(head_bytes);
        if let Some(frame) = frame {
            buf.extend_from_slice(&frame.to_wire());
        }
        (&self.socket)
            .write_all(&buf)
            .map_err(Error::from_raw_os_error)?;
        Ok(())
    }

    /// Creates or updates a periodic transmission job for `frame_id`.
    ///
    /// `interval_ms` is `None` for a data-only update that must not
    /// disturb an already-running timer (§4.7's "periodic" branch).
    /// `start_timer` arms (or re-arms) the timer and is only set on the
    /// transition out of "not yet started" (see `DESIGN.md` for why a
    /// stale status here can make this silently no-op against the
    /// kernel).
    pub fn tx_setup(
        &self,
        frame_id: u32,
        format: FrameFormat,
        frame: &CanFrame,
        interval_ms: Option<u32>,
        start_timer: bool,
    ) -> Result<()> {
        let mut flags = BcmFlags::empty();
        let (ival2_s, ival2_us) = if let Some(ms) = interval_ms {
            flags |= BcmFlags::SETTIMER;
            ms_to_interval(ms)
        } else {
            (0, 0)
        };
        if start_timer {
            flags |= BcmFlags::STARTTIMER;
        }

        let head = BcmMsgHead {
            opcode: OpCode::TxSetup as u32,
            flags: flags.bits(),
            count: 0,
            ival1_seconds: 0,
            ival1_useconds: 0,
            ival2_seconds: ival2_s,
            ival2_useconds: ival2_us,
            can_id: combined_id(frame_id, format),
            nframes: 1,
        };
        log::debug!("BCM TX_SETUP id={frame_id:#x} flags={flags:?}");
        self.write_message(&head, Some(frame))
    }

    /// Removes a transmission job. Maps a kernel `EINVAL` (no such job)
    /// to [`Error::NotFoundByKernel`].
    pub fn tx_delete(&self, frame_id: u32, format: FrameFormat) -> Result<()> {
        let head = BcmMsgHead {
            opcode: OpCode::TxDelete as u32,
            flags: 0,
            count: 0,
            ival1_seconds: 0,
            ival1_useconds: 0,
            ival2_seconds: 0,
            ival2_useconds: 0,
            can_id: combined_id(frame_id, format),
            nframes: 0,
        };
        log::debug!("BCM TX_DELETE id={frame_id:#x}");
        self.write_message(&head, None)
            .map_err(|e| remap_einval(e, frame_id))
    }

    /// Sends `frame` once, with no timer and no persistent job.
    pub fn tx_send(&self, frame_id: u32, format: FrameFormat, frame: &CanFrame) -> Result<()> {
        let head = BcmMsgHead {
            opcode: OpCode::TxSend as u32,
            flags: 0,
            count: 0,
            ival1_seconds: 0,
            ival1_useconds: 0,
            ival2_seconds: 0,
            ival2_useconds: 0,
            can_id: combined_id(frame_id, format),
            nframes: 1,
        };
        log::debug!("BCM TX_SEND id={frame_id:#x}");
        self.write_message(&head, Some(frame))
    }

    /// Subscribes to `frame_id`. With no `data_mask`, every frame with
    /// this id is delivered. With one, only data changes under the mask
    /// are delivered (kernel `RX_CHECK_DLC` mode). `min_interval_ms`
    /// throttles delivery to at most one message per interval.
    pub fn rx_setup(
        &self,
        frame_id: u32,
        format: FrameFormat,
        data_mask: Option<[u8; 8]>,
        min_interval_ms: Option<u32>,
    ) -> Result<()> {
        let mut flags = if data_mask.is_some() {
            BcmFlags::RX_CHECK_DLC
        } else {
            BcmFlags::RX_FILTER_ID
        };
        let (ival2_s, ival2_us) = if let Some(ms) = min_interval_ms {
            if ms > 0 {
                flags |= BcmFlags::SETTIMER;
                ms_to_interval(ms)
            } else {
                (0, 0)
            }
        } else {
            (0, 0)
        };

        let head = BcmMsgHead {
            opcode: OpCode::RxSetup as u32,
            flags: flags.bits(),
            count: 0,
            ival1_seconds: 0,
            ival1_useconds: 0,
            ival2_seconds: ival2_s,
            ival2_useconds: ival2_us,
            can_id: combined_id(frame_id, format),
            nframes: if data_mask.is_some() { 1 } else { 0 },
        };

        let mask_frame = data_mask
            .map(|mask| CanFrame::new(frame_id, &mask, format))
            .transpose()?;

        log::debug!("BCM RX_SETUP id={frame_id:#x} flags={flags:?}");
        self.write_message(&head, mask_frame.as_ref())
    }

    /// Unsubscribes from `frame_id`. Maps a kernel `EINVAL` (no such
    /// subscription) to [`Error::NotFoundByKernel`].
    pub fn rx_delete(&self, frame_id: u32, format: FrameFormat) -> Result<()> {
        let head = BcmMsgHead {
            opcode: OpCode::RxDelete as u32,
            flags: 0,
            count: 0,
            ival1_seconds: 0,
            ival1_useconds: 0,
            ival2_seconds: 0,
            ival2_useconds: 0,
            can_id: combined_id(frame_id, format),
            nframes: 0,
        };
        log::debug!("BCM RX_DELETE id={frame_id:#x}");
        self.write_message(&head, None)
            .map_err(|e| remap_einval(e, frame_id))
    }

    /// Reads one `RX_CHANGED` notification and parses the frame that
    /// follows it. Any other opcode, or a message too short to contain a
    /// header and a frame, is a [`Error::MalformedControlMessage`].
    pub fn recv_changed(&self) -> Result<CanFrame> {
        let mut buf = vec![0u8; MAX_NUMBER_OF_BYTES_FROM_BCM];
        let n = (&self.socket)
            .read(&mut buf)
            .map_err(Error::from_raw_os_error)?;
        if n < std::mem::size_of::<BcmMsgHead>() + 16 {
            return Err(Error::MalformedControlMessage(format!(
                "short read: {n} bytes"
            )));
        }

        let mut head = unsafe { std::mem::zeroed::<BcmMsgHead>() };
        let head_size = std::mem::size_of::<BcmMsgHead>();
        // SAFETY: `head` is a valid, appropriately sized `BcmMsgHead`.
        unsafe { as_bytes_mut(&mut head) }.copy_from_slice(&buf[..head_size]);

        let Some(OpCode::RxChanged) = OpCode::from_u32(head.opcode) else {
            return Err(Error::MalformedControlMessage(format!(
                "unexpected BCM opcode {}",
                head.opcode
            )));
        };

        let (_id, _format) = decode_combined_id(head.can_id);
        let wire: [u8; 16] = buf[head_size..head_size + 16].try_into().unwrap();
        CanFrame::from_wire(&wire)
    }
}

fn remap_einval(err: Error, frame_id: u32) -> Error {
    if let Error::Io(io_err) = &err {
        if io_err.raw_os_error() == Some(libc::EINVAL) {
            return Error::NotFoundByKernel { frame_id };
        }
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_conversion() {
        assert_eq!(ms_to_interval(20), (0, 20_000));
        assert_eq!(ms_to_interval(1500), (1, 500_000));
        assert_eq!(ms_to_interval(0), (0, 0));
    }

    #[test]
    fn combined_id_roundtrip() {
        let std_id = combined_id(0x123, FrameFormat::Standard);
        assert_eq!(decode_combined_id(std_id), (0x123, FrameFormat::Standard));

        let ext_id = combined_id(0x1ABCDE, FrameFormat::Extended);
        assert_eq!(
            decode_combined_id(ext_id),
            (0x1ABCDE, FrameFormat::Extended)
        );
    }

    #[test]
    fn header_is_56_bytes_on_64_bit_linux_time_t() {
        // This assumption only holds where `time_t`/`suseconds_t` are
        // both 8 bytes wide (LP64 Linux); see `DESIGN.md`.
        if std::mem::size_of::<libc::time_t>() == 8 {
            assert_eq!(std::mem::size_of::<BcmMsgHead>(), 56);
        }
    }
}
