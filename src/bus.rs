//! The bus façade: owns one interface, its configuration, and every
//! outbound frame's working buffer and transmission state (§4.7).

use std::collections::HashMap;
use std::time::Duration;

use crate::bcm::BcmSocket;
use crate::config::Configuration;
use crate::definition::FrameFormat;
use crate::errors::{Error, Result};
use crate::frame::CanFrame;
use crate::raw::{CanSocket, Socket};

/// Which kernel delivery mode the façade drives.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Per-frame sends and receives with kernel-side id filtering.
    Raw,
    /// Periodic transmission and throttled/change-filtered reception via
    /// the broadcast manager.
    Bcm,
}

/// The lifecycle of one outbound frame's periodic transmission job.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum TxStatus {
    /// No periodic job; every `send_signals` call sends once.
    Nonperiodic,
    /// A periodic job is configured in this process but has not yet been
    /// armed with the kernel (no `TX_SETUP` issued yet).
    PeriodicNotYetStarted,
    /// A periodic job is armed; the kernel is transmitting on its own
    /// timer and further sends only update the data.
    Periodic,
}

enum Interface {
    Raw(CanSocket),
    Bcm(BcmSocket),
}

/// Exchanges signals over one CAN interface under one configuration.
///
/// Owns the interface handle exclusively; owning a raw and a BCM
/// interface to the same bus at once is legal only as two separate
/// façades.
pub struct Bus {
    configuration: Configuration,
    interface: Interface,
    mode: Mode,
    working_frames: HashMap<u32, CanFrame>,
    tx_status: HashMap<u32, TxStatus>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus").field("mode", &self.mode).finish()
    }
}

impl Bus {
    /// Opens `ifname` in the given mode, builds one working buffer per
    /// outbound frame initialized from its signals' default values
    /// (zero bits for any signal without one), and sets every outbound
    /// frame's transmission status to its starting state
    /// (`periodic-not-yet-started` for BCM frames with a cycle time,
    /// `nonperiodic` otherwise).
    pub fn new(
        configuration: Configuration,
        ifname: &str,
        timeout: Option<Duration>,
        mode: Mode,
    ) -> Result<Self> {
        let interface = match mode {
            Mode::Raw => {
                let socket = CanSocket::open_iface(ifname)?;
                socket.set_read_timeout(timeout)?;
                Interface::Raw(socket)
            }
            Mode::Bcm => Interface::Bcm(BcmSocket::open_iface(ifname)?),
        };

        let mut working_frames = HashMap::new();
        let mut tx_status = HashMap::new();
        for id in configuration.outbound_frame_ids() {
            let def = &configuration.frame_definitions()[&id];
            let mut frame = CanFrame::from_empty_bytes(id, def.dlc() as usize, def.frame_format())?;
            for signal in def.signals() {
                frame.set_signal_default(signal)?;
            }
            working_frames.insert(id, frame);
            let status = if mode == Mode::Bcm && def.cycle_time().is_some() {
                TxStatus::PeriodicNotYetStarted
            } else {
                TxStatus::Nonperiodic
            };
            tx_status.insert(id, status);
        }

        Ok(Bus {
            configuration,
            interface,
            mode,
            working_frames,
            tx_status,
        })
    }

    /// Updates each named signal's value in its frame's working buffer,
    /// then transmits every touched frame exactly once, in the order the
    /// frames first appear among the given names.
    ///
    /// Validates every name before mutating any buffer (fail-fast); a
    /// later per-frame transmit error leaves already-updated buffers in
    /// place for the next call, matching the source behavior this
    /// library follows.
    pub fn send_signals(&mut self, values: &HashMap<&str, f64>) -> Result<()> {
        let mut touched = Vec::new();
        let mut resolved = Vec::with_capacity(values.len());
        for (&name, &value) in values {
            let frame_id = self.configuration.find_frame_id_by_signal(name)?;
            if !self.configuration.outbound_frame_ids().contains(&frame_id) {
                return Err(Error::configuration(format!(
                    "signal '{name}' is not outbound"
                )));
            }
            resolved.push((frame_id, name, value));
        }

        for (frame_id, name, value) in resolved {
            let def = &self.configuration.frame_definitions()[&frame_id];
            let signal = def.signal(name).expect("resolved above").clone();
            let frame = self
                .working_frames
                .get_mut(&frame_id)
                .expect("every outbound frame has a working buffer");
            frame.set_signal(&signal, value)?;
            if !touched.contains(&frame_id) {
                touched.push(frame_id);
            }
        }

        for frame_id in touched {
            self.transmit_touched_frame(frame_id)?;
        }
        Ok(())
    }

    fn transmit_touched_frame(&mut self, frame_id: u32) -> Result<()> {
        let format = self.configuration.frame_definitions()[&frame_id].frame_format();
        let frame = self.working_frames[&frame_id];

        match (&self.interface, self.mode) {
            (Interface::Raw(socket), Mode::Raw) => socket.send(&frame),
            (Interface::Bcm(socket), Mode::Bcm) => {
                let status = *self
                    .tx_status
                    .get(&frame_id)
                    .expect("every outbound frame has a status");
                match status {
                    TxStatus::Nonperiodic => socket.tx_send(frame_id, format, &frame),
                    TxStatus::PeriodicNotYetStarted => {
                        let interval = self.configuration.frame_definitions()[&frame_id].cycle_time();
                        socket.tx_setup(frame_id, format, &frame, interval, true)?;
                        self.tx_status.insert(frame_id, TxStatus::Periodic);
                        Ok(())
                    }
                    TxStatus::Periodic => socket.tx_setup(frame_id, format, &frame, None, false),
                }
            }
            _ => unreachable!("interface and mode are always set together"),
        }
    }

    /// BCM only: sends every outbound signal at its configured default
    /// value (signals without one are left at their working buffer's
    /// current bits), arming every periodic slot. A no-op in raw mode.
    pub fn start_sending_all_signals(&mut self) -> Result<()> {
        if self.mode != Mode::Bcm {
            return Ok(());
        }
        let outbound_ids = self.configuration.outbound_frame_ids();
        for &id in &outbound_ids {
            let signals: Vec<_> = self.configuration.frame_definitions()[&id].signals().to_vec();
            let frame = self
                .working_frames
                .get_mut(&id)
                .expect("every outbound frame has a working buffer");
            for signal in &signals {
                frame.set_signal_default(signal)?;
            }
        }
        for id in outbound_ids {
            self.transmit_touched_frame(id)?;
        }
        Ok(())
    }

    /// Arms reception of every inbound frame: kernel id filters in raw
    /// mode, `RX_SETUP` subscriptions in BCM mode.
    pub fn init_reception(&self) -> Result<()> {
        let inbound = self.configuration.inbound_frame_ids();
        match &self.interface {
            Interface::Raw(socket) => socket.set_filters(&inbound),
            Interface::Bcm(socket) => {
                for id in inbound {
                    let def = &self.configuration.frame_definitions()[&id];
                    let data_mask = def.receive_on_change_only().then(|| def.signal_mask());
                    socket.rx_setup(id, def.frame_format(), data_mask, def.throttle_time())?;
                }
                Ok(())
            }
        }
    }

    /// Best-effort: removes every inbound BCM subscription. A no-op in
    /// raw mode, since raw filters are reinstalled wholesale rather than
    /// torn down incrementally. `NotFoundByKernel` is logged and
    /// swallowed.
    pub fn stop_reception(&self) {
        if let Interface::Bcm(socket) = &self.interface {
            for id in self.configuration.inbound_frame_ids() {
                let format = self.configuration.frame_definitions()[&id].frame_format();
                if let Err(err) = socket.rx_delete(id, format) {
                    log_swallowed("rx_delete", id, err);
                }
            }
        }
    }

    /// Best-effort: removes every outbound BCM periodic job. A no-op in
    /// raw mode. `NotFoundByKernel` is logged and swallowed.
    pub fn stop_sending(&self) {
        if let Interface::Bcm(socket) = &self.interface {
            for id in self.configuration.outbound_frame_ids() {
                let format = self.configuration.frame_definitions()[&id].frame_format();
                if let Err(err) = socket.tx_delete(id, format) {
                    log_swallowed("tx_delete", id, err);
                }
            }
        }
    }

    /// Best-effort: `stop_sending` then `stop_reception`.
    pub fn stop(&self) {
        self.stop_sending();
        self.stop_reception();
    }

    /// Blocks (up to the façade's configured timeout) for one frame.
    pub fn recv_next_frame(&self) -> Result<CanFrame> {
        match &self.interface {
            Interface::Raw(socket) => socket.recv(),
            Interface::Bcm(socket) => socket.recv_changed(),
        }
    }

    /// As [`Self::recv_next_frame`], additionally decoding every signal
    /// its frame definition carries.
    pub fn recv_next_signals(&self) -> Result<HashMap<String, f64>> {
        let frame = self.recv_next_frame()?;
        frame.unpack(self.configuration.frame_definitions())
    }

    /// Sends a raw frame directly, bypassing signal resolution.
    pub fn send_frame(&self, frame: &CanFrame) -> Result<()> {
        match &self.interface {
            Interface::Raw(socket) => socket.send(frame),
            Interface::Bcm(socket) => socket.tx_send(frame.frame_id(), frame.frame_format(), frame),
        }
    }

    /// The configuration this façade was built from.
    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Writes this façade's configuration out as a KCD file.
    #[cfg(feature = "kcd")]
    pub fn write_configuration(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        self.configuration.write_kcd_file(path)
    }
}

fn log_swallowed(op: &str, frame_id: u32, err: Error) {
    match err {
        Error::NotFoundByKernel { .. } => {
            log::warn!("{op} on {frame_id:#x}: not found by kernel, ignoring");
        }
        other => log::warn!("{op} on {frame_id:#x} failed: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::Endianness;
    use crate::definition::CanFrameDefinition;
    use crate::signal::{CanSignalDefinition, SignalType};

    fn config_with_outbound_frame() -> Configuration {
        let mut cfg = Configuration::new();
        let mut def = CanFrameDefinition::new(1, "Engine", FrameFormat::Standard).unwrap();
        def.set_producer_ids(["ECU_A"]);
        def.add_signal(
            CanSignalDefinition::new(
                "rpm",
                0,
                16,
                Endianness::Little,
                SignalType::Unsigned,
                1.0,
                0.0,
                None,
                None,
                None,
            )
            .unwrap(),
        )
        .unwrap();
        cfg.add(def).unwrap();
        cfg.set_ego_node_ids(["ECU_A"]);
        cfg
    }

    #[test]
    fn working_frame_and_status_initialization_is_pure_config_math() {
        // `Bus::new` requires a real socket, which this crate's test
        // suite deliberately never opens (§5: no live-interface tests).
        // This test instead pins down the status-selection rule it
        // relies on, directly against the configuration.
        let cfg = config_with_outbound_frame();
        assert_eq!(cfg.outbound_frame_ids(), vec![1]);
        let def = &cfg.frame_definitions()[&1];
        assert!(def.cycle_time().is_none());
    }
}
