//! The in-memory CAN frame and its wire representation (§4.3, §6.1).

use std::collections::HashMap;

use crate::definition::{check_frame_id_and_format, CanFrameDefinition, FrameFormat};
use crate::errors::{Error, Result};

const EFF_FLAG: u32 = 0x8000_0000;
const RTR_FLAG: u32 = 0x4000_0000;
const ERR_FLAG: u32 = 0x2000_0000;
const EFF_MASK: u32 = 0x1FFF_FFFF;
const SFF_MASK: u32 = 0x0000_07FF;

/// Gives read access to a value's raw bytes, for handing straight to a
/// socket write. Implemented only for types whose memory layout is the
/// wire format they represent.
pub trait AsPtr {
    /// Borrows `self` as its raw byte representation.
    fn as_bytes(&self) -> &[u8];
}

/// # Safety
/// `T` must be a type for which every bit pattern is valid and for which
/// reading `size_of::<T>()` bytes starting at `val`'s address is sound —
/// i.e. a `#[repr(C)]` struct of plain integers/byte arrays with no
/// padding-sensitive invariants.
pub(crate) unsafe fn as_bytes<T: Sized>(val: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(val as *const T as *const u8, std::mem::size_of::<T>()) }
}

/// # Safety
/// See [`as_bytes`]; additionally, any bit pattern written through the
/// returned slice must remain valid for `T`.
pub(crate) unsafe fn as_bytes_mut<T: Sized>(val: &mut T) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(val as *mut T as *mut u8, std::mem::size_of::<T>()) }
}

/// A zeroed low-level `can_frame`, ready to be filled in by a socket read.
pub(crate) fn can_frame_default() -> crate::compatibility::can_frame {
    // SAFETY: the compatibility `can_frame` types are plain structs of
    // integers and byte arrays; the all-zero bit pattern is valid.
    unsafe { std::mem::zeroed() }
}

/// A CAN frame: an identifier, a format, and 0..8 data bytes.
///
/// Memory layout matches the kernel's raw wire format (§6.1) exactly,
/// which lets the raw and BCM interfaces hand it straight to a socket
/// write without a separate serialization step.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct CanFrame {
    id: u32,
    dlc: u8,
    _pad: u8,
    _res0: u8,
    _res1: u8,
    data: [u8; 8],
}

impl CanFrame {
    /// Builds a frame from an id, format, and up to 8 data bytes.
    pub fn new(id: u32, data: &[u8], format: FrameFormat) -> Result<Self> {
        check_frame_id_and_format(id, format)?;
        if data.len() > 8 {
            return Err(Error::invalid("frame data must be 8 bytes or fewer"));
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Ok(CanFrame {
            id: encode_combined_id(id, format),
            dlc: data.len() as u8,
            _pad: 0,
            _res0: 0,
            _res1: 0,
            data: buf,
        })
    }

    /// Builds a frame of `len` zeroed data bytes for the given id/format.
    pub fn from_empty_bytes(id: u32, len: usize, format: FrameFormat) -> Result<Self> {
        Self::new(id, &vec![0u8; len], format)
    }

    /// Parses a frame from its 16-byte wire representation (§6.1).
    pub fn from_wire(buf: &[u8; 16]) -> Result<Self> {
        let combined = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
        let dlc = buf[4];
        if dlc > 8 {
            return Err(Error::invalid(format!("dlc out of range: {dlc}")));
        }
        let (id, format) = decode_combined_id(combined);
        check_frame_id_and_format(id, format)?;
        let mut data = [0u8; 8];
        data.copy_from_slice(&buf[8..16]);
        Ok(CanFrame {
            id: combined,
            dlc,
            _pad: 0,
            _res0: 0,
            _res1: 0,
            data,
        })
    }

    /// Renders this frame as its 16-byte wire representation (§6.1).
    pub fn to_wire(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&self.id.to_ne_bytes());
        buf[4] = self.dlc;
        buf[8..16].copy_from_slice(&self.data);
        buf
    }

    /// The frame identifier (11 or 29 bits, format-dependent).
    pub fn frame_id(&self) -> u32 {
        self.id & EFF_MASK
    }

    /// Standard vs. extended identifier format.
    pub fn frame_format(&self) -> FrameFormat {
        if self.id & EFF_FLAG != 0 {
            FrameFormat::Extended
        } else {
            FrameFormat::Standard
        }
    }

    /// Whether the remote-request bit is set. Recognized, not acted on.
    pub fn is_remote_frame(&self) -> bool {
        self.id & RTR_FLAG != 0
    }

    /// Whether the error-frame bit is set. Recognized, not acted on.
    pub fn is_error_frame(&self) -> bool {
        self.id & ERR_FLAG != 0
    }

    /// Number of valid data bytes.
    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// The valid data bytes (`0..dlc`).
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// The full 8-byte payload buffer, including any bytes beyond `dlc`.
    pub fn payload(&self) -> &[u8; 8] {
        &self.data
    }

    /// Mutable access to the full 8-byte payload buffer.
    pub fn payload_mut(&mut self) -> &mut [u8; 8] {
        &mut self.data
    }

    /// Decodes one signal's physical value out of this frame's payload.
    pub fn get_signal(&self, signal: &crate::signal::CanSignalDefinition) -> Result<f64> {
        signal.decode(&self.data[..self.dlc as usize])
    }

    /// Encodes `value` for one signal into this frame's payload.
    pub fn set_signal(
        &mut self,
        signal: &crate::signal::CanSignalDefinition,
        value: f64,
    ) -> Result<()> {
        let dlc = self.dlc as usize;
        signal.encode(Some(value), &mut self.data[..dlc])
    }

    /// Encodes one signal's configured default physical value into this
    /// frame's payload. Leaves the signal's bits untouched when it has no
    /// configured default (they remain at whatever the buffer already
    /// held, zero for a freshly built frame).
    pub(crate) fn set_signal_default(
        &mut self,
        signal: &crate::signal::CanSignalDefinition,
    ) -> Result<()> {
        let Some(default) = signal.default() else {
            return Ok(());
        };
        let dlc = self.dlc as usize;
        signal.encode(Some(default), &mut self.data[..dlc])
    }

    /// Decodes every signal of the frame definition matching this frame's
    /// id out of the payload. Returns an empty map if `frame_definitions`
    /// has no entry for this frame's id.
    pub fn unpack(
        &self,
        frame_definitions: &HashMap<u32, CanFrameDefinition>,
    ) -> Result<HashMap<String, f64>> {
        let Some(def) = frame_definitions.get(&self.frame_id()) else {
            return Ok(HashMap::new());
        };
        if self.dlc as usize != def.dlc() as usize {
            return Err(Error::PayloadLengthMismatch {
                expected: def.dlc() as usize,
                actual: self.dlc as usize,
            });
        }
        let mut out = HashMap::with_capacity(def.signals().len());
        for signal in def.signals() {
            out.insert(signal.name().to_string(), signal.decode(self.data())?);
        }
        Ok(out)
    }
}

impl embedded_can::Frame for CanFrame {
    fn new(id: impl Into<embedded_can::Id>, data: &[u8]) -> Option<Self> {
        let (raw_id, format) = split_embedded_id(id.into());
        CanFrame::new(raw_id, data, format).ok()
    }

    fn new_remote(id: impl Into<embedded_can::Id>, dlc: usize) -> Option<Self> {
        let (raw_id, format) = split_embedded_id(id.into());
        let mut frame = CanFrame::new(raw_id, &vec![0u8; dlc.min(8)], format).ok()?;
        frame.id |= RTR_FLAG;
        Some(frame)
    }

    fn is_extended(&self) -> bool {
        self.frame_format() == FrameFormat::Extended
    }

    fn is_remote_frame(&self) -> bool {
        CanFrame::is_remote_frame(self)
    }

    fn id(&self) -> embedded_can::Id {
        match self.frame_format() {
            FrameFormat::Standard => embedded_can::Id::Standard(
                embedded_can::StandardId::new(self.frame_id() as u16)
                    .expect("frame_id is range-checked to 11 bits for a standard frame"),
            ),
            FrameFormat::Extended => embedded_can::Id::Extended(
                embedded_can::ExtendedId::new(self.frame_id())
                    .expect("frame_id is range-checked to 29 bits for an extended frame"),
            ),
        }
    }

    fn dlc(&self) -> usize {
        self.dlc as usize
    }

    fn data(&self) -> &[u8] {
        CanFrame::data(self)
    }
}

fn split_embedded_id(id: embedded_can::Id) -> (u32, FrameFormat) {
    match id {
        embedded_can::Id::Standard(s) => (s.as_raw() as u32, FrameFormat::Standard),
        embedded_can::Id::Extended(e) => (e.as_raw(), FrameFormat::Extended),
    }
}

impl AsPtr for CanFrame {
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: `CanFrame` is `#[repr(C)]` over plain integers/arrays.
        unsafe { as_bytes(self) }
    }
}

impl std::fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanFrame")
            .field("id", &format_args!("{:#x}", self.frame_id()))
            .field("format", &self.frame_format())
            .field("dlc", &self.dlc)
            .field("data", &self.data())
            .finish()
    }
}

impl From<crate::compatibility::can_frame> for CanFrame {
    fn from(raw: crate::compatibility::can_frame) -> Self {
        let mut data = [0u8; 8];
        data.copy_from_slice(&raw.data[..8]);
        CanFrame {
            id: raw.can_id,
            dlc: raw.can_dlc,
            _pad: 0,
            _res0: 0,
            _res1: 0,
            data,
        }
    }
}

impl From<&CanFrame> for crate::compatibility::can_frame {
    fn from(frame: &CanFrame) -> Self {
        let mut raw = can_frame_default();
        raw.can_id = frame.id;
        raw.can_dlc = frame.dlc;
        raw.data = frame.data;
        raw
    }
}

fn encode_combined_id(id: u32, format: FrameFormat) -> u32 {
    match format {
        FrameFormat::Standard => id & SFF_MASK,
        FrameFormat::Extended => (id & EFF_MASK) | EFF_FLAG,
    }
}

fn decode_combined_id(combined: u32) -> (u32, FrameFormat) {
    if combined & EFF_FLAG != 0 {
        (combined & EFF_MASK, FrameFormat::Extended)
    } else {
        (combined & SFF_MASK, FrameFormat::Standard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn s9_raw_wire_roundtrip_standard() {
        let frame = CanFrame::new(0x123, &[1, 2, 3], FrameFormat::Standard).unwrap();
        let wire = frame.to_wire();
        let back = CanFrame::from_wire(&wire).unwrap();
        assert_eq!(back.frame_id(), 0x123);
        assert_eq!(back.frame_format(), FrameFormat::Standard);
        assert_eq!(back.data(), &[1, 2, 3]);
    }

    #[test]
    fn raw_wire_roundtrip_extended() {
        let frame = CanFrame::new(0x1ABCDE, &[], FrameFormat::Extended).unwrap();
        let wire = frame.to_wire();
        let back = CanFrame::from_wire(&wire).unwrap();
        assert_eq!(back.frame_id(), 0x1ABCDE);
        assert_eq!(back.frame_format(), FrameFormat::Extended);
    }

    proptest! {
        #[test]
        fn raw_wire_roundtrip_prop(id in 0u32..=0x7FF, len in 0usize..=8) {
            let data = vec![0xAAu8; len];
            let frame = CanFrame::new(id, &data, FrameFormat::Standard).unwrap();
            let back = CanFrame::from_wire(&frame.to_wire()).unwrap();
            prop_assert_eq!(back.frame_id(), frame.frame_id());
            prop_assert_eq!(back.data(), frame.data());
        }
    }

    #[test]
    fn s1_unsigned_little_endian_decode_three_signals() {
        use crate::bits::Endianness;
        use crate::signal::{CanSignalDefinition, SignalType};

        let mut def = CanFrameDefinition::new(1, "F1", FrameFormat::Standard).unwrap();
        def.add_signal(
            CanSignalDefinition::new(
                "s1", 56, 1, Endianness::Little, SignalType::Unsigned, 1.0, 0.0, None, None, None,
            )
            .unwrap(),
        )
        .unwrap();
        def.add_signal(
            CanSignalDefinition::new(
                "s2", 8, 16, Endianness::Big, SignalType::Unsigned, 1.0, 0.0, None, None, None,
            )
            .unwrap(),
        )
        .unwrap();
        def.add_signal(
            CanSignalDefinition::new(
                "s3",
                24,
                16,
                Endianness::Little,
                SignalType::Unsigned,
                1.0,
                0.0,
                None,
                Some(1200.0),
                None,
            )
            .unwrap(),
        )
        .unwrap();

        let payload = [0x00, 0x02, 0x00, 0x08, 0x00, 0x00, 0x00, 0xFF];
        let frame = CanFrame::new(1, &payload, FrameFormat::Standard).unwrap();

        let mut defs = HashMap::new();
        defs.insert(1, def);
        let decoded = frame.unpack(&defs).unwrap();
        assert_eq!(decoded["s1"], 1.0);
        assert_eq!(decoded["s2"], 2.0);
        assert_eq!(decoded["s3"], 8.0);
    }

    #[test]
    fn unpack_is_empty_for_unknown_frame_id() {
        let frame = CanFrame::new(42, &[], FrameFormat::Standard).unwrap();
        let defs = HashMap::new();
        assert!(frame.unpack(&defs).unwrap().is_empty());
    }

    #[test]
    fn unpack_rejects_mismatched_payload_length() {
        let def = CanFrameDefinition::new(1, "F1", FrameFormat::Standard).unwrap();
        let frame = CanFrame::new(1, &[1, 2], FrameFormat::Standard).unwrap();
        let mut defs = HashMap::new();
        defs.insert(1, def);
        assert!(frame.unpack(&defs).is_err());
    }
}
