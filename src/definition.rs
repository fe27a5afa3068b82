//! Frame definitions: the schema side of a CAN frame (§3, §4.3).

use std::collections::BTreeSet;

use crate::errors::{Error, Result};
use crate::signal::CanSignalDefinition;

/// Largest cycle or throttle time this library accepts, in milliseconds.
///
/// The BCM kernel interface itself has no such ceiling; this is a policy
/// decision carried over from the bus-description file format this crate
/// is compatible with (see `DESIGN.md`).
pub const MAX_FRAME_CYCLETIME_MILLISECONDS: u32 = 60_000;

/// Number of data bytes in a classic CAN frame.
pub const MAX_NUMBER_OF_CAN_DATA_BYTES: u8 = 8;

/// Standard (11-bit) vs. extended (29-bit) CAN identifier.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameFormat {
    /// 11-bit identifier, range `0..=0x7FF`.
    Standard,
    /// 29-bit identifier, range `0..=0x1FFFFFFF`.
    Extended,
}

impl FrameFormat {
    fn max_id(self) -> u32 {
        match self {
            FrameFormat::Standard => 0x7FF,
            FrameFormat::Extended => 0x1FFF_FFFF,
        }
    }
}

/// Checks a frame id against its format's id range.
pub fn check_frame_id_and_format(frame_id: u32, format: FrameFormat) -> Result<()> {
    if frame_id > format.max_id() {
        return Err(Error::invalid(format!(
            "frame id {frame_id:#x} out of range for {format:?} format"
        )));
    }
    Ok(())
}

/// The schema for one CAN frame: its id, format, DLC, timing, the nodes
/// that produce it, and the signals it carries.
///
/// Does not hold a frame's current data bytes — see
/// [`crate::frame::CanFrame`] for that.
#[derive(Clone, Debug)]
pub struct CanFrameDefinition {
    frame_id: u32,
    frame_format: FrameFormat,
    name: String,
    dlc: u8,
    cycle_time: Option<u32>,
    throttle_time: Option<u32>,
    producer_ids: BTreeSet<String>,
    receive_on_change_only: bool,
    signals: Vec<CanSignalDefinition>,
}

impl CanFrameDefinition {
    /// Builds a frame definition with the default DLC (8) and no timing,
    /// producers, or signals.
    pub fn new(frame_id: u32, name: impl Into<String>, frame_format: FrameFormat) -> Result<Self> {
        check_frame_id_and_format(frame_id, frame_format)?;
        Ok(CanFrameDefinition {
            frame_id,
            frame_format,
            name: name.into(),
            dlc: MAX_NUMBER_OF_CAN_DATA_BYTES,
            cycle_time: None,
            throttle_time: None,
            producer_ids: BTreeSet::new(),
            receive_on_change_only: false,
            signals: Vec::new(),
        })
    }

    /// Frame identifier.
    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }

    /// Standard vs. extended identifier format.
    pub fn frame_format(&self) -> FrameFormat {
        self.frame_format
    }

    /// Frame name, as given in the bus description.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of valid data bytes, `0..=8`.
    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// Sets the DLC, validating every already-attached signal still fits.
    pub fn set_dlc(&mut self, dlc: u8) -> Result<()> {
        if dlc > MAX_NUMBER_OF_CAN_DATA_BYTES {
            return Err(Error::invalid(format!("dlc out of range: {dlc}")));
        }
        for sig in &self.signals {
            if sig.minimum_dlc() > dlc as usize {
                return Err(Error::invalid(format!(
                    "dlc {dlc} too small for signal '{}' (needs {})",
                    sig.name(),
                    sig.minimum_dlc()
                )));
            }
        }
        self.dlc = dlc;
        Ok(())
    }

    /// Shortest cycle time, in milliseconds, for periodic transmission.
    pub fn cycle_time(&self) -> Option<u32> {
        self.cycle_time
    }

    /// Sets the cycle time; `None` or `0` means non-periodic.
    pub fn set_cycle_time(&mut self, value: Option<u32>) -> Result<()> {
        if let Some(v) = value {
            if v > MAX_FRAME_CYCLETIME_MILLISECONDS {
                return Err(Error::invalid(format!("cycletime is out of range: {v}")));
            }
        }
        self.cycle_time = value;
        Ok(())
    }

    /// Shortest update time, in milliseconds, the kernel should deliver
    /// this frame at when receiving.
    pub fn throttle_time(&self) -> Option<u32> {
        self.throttle_time
    }

    /// Sets the throttle time.
    pub fn set_throttle_time(&mut self, value: Option<u32>) -> Result<()> {
        if let Some(v) = value {
            if v > MAX_FRAME_CYCLETIME_MILLISECONDS {
                return Err(Error::invalid(format!("throttle_time is out of range: {v}")));
            }
        }
        self.throttle_time = value;
        Ok(())
    }

    /// Node identifiers that produce this frame.
    pub fn producer_ids(&self) -> &BTreeSet<String> {
        &self.producer_ids
    }

    /// Replaces the set of producer node identifiers.
    pub fn set_producer_ids<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.producer_ids = ids.into_iter().map(Into::into).collect();
    }

    /// Whether only data-changing updates should be delivered when
    /// receiving (BCM `RX_CHECK_DLC` / data-mask mode).
    pub fn receive_on_change_only(&self) -> bool {
        self.receive_on_change_only
    }

    /// Sets [`Self::receive_on_change_only`].
    pub fn set_receive_on_change_only(&mut self, value: bool) {
        self.receive_on_change_only = value;
    }

    /// The signals carried by this frame, in declaration order.
    pub fn signals(&self) -> &[CanSignalDefinition] {
        &self.signals
    }

    /// Adds a signal, failing if it does not fit within the current DLC or
    /// its name collides with one already present.
    pub fn add_signal(&mut self, signal: CanSignalDefinition) -> Result<()> {
        if signal.minimum_dlc() > self.dlc as usize {
            return Err(Error::invalid(format!(
                "signal '{}' needs {} bytes but frame dlc is {}",
                signal.name(),
                signal.minimum_dlc(),
                self.dlc
            )));
        }
        if self.signals.iter().any(|s| s.name() == signal.name()) {
            return Err(Error::invalid(format!(
                "duplicate signal name '{}'",
                signal.name()
            )));
        }
        self.signals.push(signal);
        Ok(())
    }

    /// Looks up a signal by name.
    pub fn signal(&self, name: &str) -> Option<&CanSignalDefinition> {
        self.signals.iter().find(|s| s.name() == name)
    }

    /// Calculates the 8-byte signal mask: a `1` at every bit position any
    /// signal occupies. Used by the BCM interface's change-detection mode.
    pub fn signal_mask(&self) -> [u8; 8] {
        let mut mask = [0u8; 8];
        for signal in &self.signals {
            let occupied = signal.occupied_mask();
            for i in 0..8 {
                mask[i] |= occupied[i];
            }
        }
        mask
    }

    /// Whether this frame is outbound (transmitted by this process) given
    /// the process's node identity. Defaults to inbound when either set
    /// is empty.
    pub fn is_outbound(&self, ego_node_ids: &BTreeSet<String>) -> bool {
        if self.producer_ids.is_empty() || ego_node_ids.is_empty() {
            return false;
        }
        !self.producer_ids.is_disjoint(ego_node_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::Endianness;
    use crate::signal::SignalType;

    fn def() -> CanFrameDefinition {
        CanFrameDefinition::new(4, "TestFrame", FrameFormat::Standard).unwrap()
    }

    #[test]
    fn s8_signal_mask() {
        let mut d = def();
        d.add_signal(
            CanSignalDefinition::new(
                "s1", 56, 1, Endianness::Little, SignalType::Unsigned, 1.0, 0.0, None, None, None,
            )
            .unwrap(),
        )
        .unwrap();
        d.add_signal(
            CanSignalDefinition::new(
                "s2", 8, 16, Endianness::Big, SignalType::Unsigned, 1.0, 0.0, None, None, None,
            )
            .unwrap(),
        )
        .unwrap();
        d.add_signal(
            CanSignalDefinition::new(
                "s3", 24, 16, Endianness::Little, SignalType::Unsigned, 1.0, 0.0, None, None, None,
            )
            .unwrap(),
        )
        .unwrap();
        d.add_signal(
            CanSignalDefinition::new(
                "s4", 48, 8, Endianness::Little, SignalType::Signed, 1.0, 0.0, None, None, None,
            )
            .unwrap(),
        )
        .unwrap();

        assert_eq!(
            d.signal_mask(),
            [0xFF, 0xFF, 0x00, 0xFF, 0xFF, 0x00, 0xFF, 0x01]
        );
    }

    #[test]
    fn outbound_classification() {
        let mut d = def();
        assert!(!d.is_outbound(&BTreeSet::new()));

        d.set_producer_ids(["ECU_A"]);
        let mut ego = BTreeSet::new();
        assert!(!d.is_outbound(&ego));

        ego.insert("ECU_B".to_string());
        assert!(!d.is_outbound(&ego));

        ego.insert("ECU_A".to_string());
        assert!(d.is_outbound(&ego));
    }

    #[test]
    fn dlc_guard_on_add_signal() {
        let mut d = def();
        d.set_dlc(1).unwrap();
        let big_signal = CanSignalDefinition::new(
            "s", 56, 8, Endianness::Little, SignalType::Unsigned, 1.0, 0.0, None, None, None,
        )
        .unwrap();
        assert!(d.add_signal(big_signal).is_err());
    }
}
