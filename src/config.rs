//! The configuration: a collection of frame definitions plus the local
//! node identity used to partition them into inbound/outbound (§4.4).

use std::collections::{BTreeSet, HashMap};

use crate::definition::CanFrameDefinition;
use crate::errors::{Error, Result};

/// A bus description: every frame this process knows about, and which
/// node identities it enacts.
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    bus_name: Option<String>,
    frame_definitions: HashMap<u32, CanFrameDefinition>,
    ego_node_ids: BTreeSet<String>,
}

impl Configuration {
    /// An empty configuration with no bus name and no ego node ids.
    pub fn new() -> Self {
        Configuration::default()
    }

    /// The bus name, if the description carried one.
    pub fn bus_name(&self) -> Option<&str> {
        self.bus_name.as_deref()
    }

    /// Sets the bus name.
    pub fn set_bus_name(&mut self, name: impl Into<String>) {
        self.bus_name = Some(name.into());
    }

    /// The node identifiers this process enacts.
    pub fn ego_node_ids(&self) -> &BTreeSet<String> {
        &self.ego_node_ids
    }

    /// Replaces the set of node identifiers this process enacts.
    pub fn set_ego_node_ids<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ego_node_ids = ids.into_iter().map(Into::into).collect();
    }

    /// All frame definitions, keyed by frame id.
    pub fn frame_definitions(&self) -> &HashMap<u32, CanFrameDefinition> {
        &self.frame_definitions
    }

    /// Adds a frame definition, failing if its id is already taken.
    pub fn add(&mut self, def: CanFrameDefinition) -> Result<()> {
        if self.frame_definitions.contains_key(&def.frame_id()) {
            return Err(Error::configuration(format!(
                "duplicate frame id {:#x}",
                def.frame_id()
            )));
        }
        self.frame_definitions.insert(def.frame_id(), def);
        Ok(())
    }

    /// Frame definitions that are outbound given [`Self::ego_node_ids`].
    pub fn outbound_frame_ids(&self) -> Vec<u32> {
        self.frame_definitions
            .values()
            .filter(|d| d.is_outbound(&self.ego_node_ids))
            .map(|d| d.frame_id())
            .collect()
    }

    /// Frame definitions that are inbound given [`Self::ego_node_ids`].
    pub fn inbound_frame_ids(&self) -> Vec<u32> {
        self.frame_definitions
            .values()
            .filter(|d| !d.is_outbound(&self.ego_node_ids))
            .map(|d| d.frame_id())
            .collect()
    }

    /// Finds which frame id carries the named signal.
    pub fn find_frame_id_by_signal(&self, signal_name: &str) -> Result<u32> {
        self.frame_definitions
            .values()
            .find(|d| d.signal(signal_name).is_some())
            .map(|d| d.frame_id())
            .ok_or_else(|| Error::configuration(format!("unknown signal '{signal_name}'")))
    }

    /// Sets the throttle time on one or more frame ids.
    pub fn set_throttle_times(&mut self, frame_ids: &[u32], value: Option<u32>) -> Result<()> {
        for id in frame_ids {
            let def = self
                .frame_definitions
                .get_mut(id)
                .ok_or_else(|| Error::configuration(format!("unknown frame id {id:#x}")))?;
            def.set_throttle_time(value)?;
        }
        Ok(())
    }

    /// Sets the throttle time for the frames that own the named signals.
    pub fn set_throttle_times_from_signalnames(
        &mut self,
        signal_names: &[&str],
        value: Option<u32>,
    ) -> Result<()> {
        let ids = signal_names
            .iter()
            .map(|name| self.find_frame_id_by_signal(name))
            .collect::<Result<Vec<_>>>()?;
        self.set_throttle_times(&ids, value)
    }

    /// Sets `receive_on_change_only` on one or more frame ids.
    pub fn set_receive_on_change_only(&mut self, frame_ids: &[u32], value: bool) -> Result<()> {
        for id in frame_ids {
            let def = self
                .frame_definitions
                .get_mut(id)
                .ok_or_else(|| Error::configuration(format!("unknown frame id {id:#x}")))?;
            def.set_receive_on_change_only(value);
        }
        Ok(())
    }

    /// Sets `receive_on_change_only` for the frames that own the named
    /// signals.
    pub fn set_receive_on_change_only_from_signalnames(
        &mut self,
        signal_names: &[&str],
        value: bool,
    ) -> Result<()> {
        let ids = signal_names
            .iter()
            .map(|name| self.find_frame_id_by_signal(name))
            .collect::<Result<Vec<_>>>()?;
        self.set_receive_on_change_only(&ids, value)
    }

    /// Reads a bus description from a KCD file (§6.3). With no `bus_name`,
    /// selects whichever `Bus` element sorts first alphabetically.
    #[cfg(feature = "kcd")]
    pub fn from_kcd_file(path: impl AsRef<std::path::Path>, bus_name: Option<&str>) -> Result<Self> {
        crate::kcd::from_kcd_file(path, bus_name)
    }

    /// Writes this configuration as a KCD file (§6.3).
    #[cfg(feature = "kcd")]
    pub fn write_kcd_file(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        crate::kcd::write_kcd_file(self, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::FrameFormat;

    fn config_with_one_frame() -> Configuration {
        let mut cfg = Configuration::new();
        let mut def = CanFrameDefinition::new(1, "Engine", FrameFormat::Standard).unwrap();
        def.set_producer_ids(["ECU_A"]);
        cfg.add(def).unwrap();
        cfg
    }

    #[test]
    fn outbound_inbound_partition() {
        let mut cfg = config_with_one_frame();
        cfg.set_ego_node_ids(["ECU_A"]);
        assert_eq!(cfg.outbound_frame_ids(), vec![1]);
        assert!(cfg.inbound_frame_ids().is_empty());

        cfg.set_ego_node_ids(["ECU_B"]);
        assert!(cfg.outbound_frame_ids().is_empty());
        assert_eq!(cfg.inbound_frame_ids(), vec![1]);
    }

    #[test]
    fn duplicate_frame_id_rejected() {
        let mut cfg = config_with_one_frame();
        let dup = CanFrameDefinition::new(1, "Dup", FrameFormat::Standard).unwrap();
        assert!(cfg.add(dup).is_err());
    }

    #[test]
    fn find_frame_id_by_signal_errors_when_unknown() {
        let cfg = config_with_one_frame();
        assert!(cfg.find_frame_id_by_signal("nope").is_err());
    }
}
