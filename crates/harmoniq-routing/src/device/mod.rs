//! Devices: sinks and sources.

pub mod control;
pub mod io;

use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::direction::{Direction, StreamId};
use crate::driver::DeviceDriver;
use crate::message::IoLink;
use crate::proplist::Proplist;
use crate::sample::{ChannelMap, SampleSpec};
use crate::volume::{ChannelVolumes, Volume};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceFlags: u32 {
        const HW_VOLUME_CTRL = 1 << 0;
        const LATENCY = 1 << 1;
        const HARDWARE = 1 << 2;
        const NETWORK = 1 << 3;
        const HW_MUTE_CTRL = 1 << 4;
        const DECIBEL_VOLUME = 1 << 5;
        const FLAT_VOLUME = 1 << 6;
        const DYNAMIC_LATENCY = 1 << 7;
        const SET_FORMATS = 1 << 8;
        const SHARE_VOLUME_WITH_MASTER = 1 << 9;
        const DEFERRED_VOLUME = 1 << 10;
    }
}

bitflags! {
    /// Independent reasons for a device to be suspended. The device runs only
    /// while the set is empty.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SuspendCause: u32 {
        const USER = 1 << 0;
        const APPLICATION = 1 << 1;
        const IDLE = 1 << 2;
        const SESSION = 1 << 3;
        const PASSTHROUGH = 1 << 4;
        const INTERNAL = 1 << 5;
        const UNAVAILABLE = 1 << 6;
    }
}

impl Serialize for DeviceFlags {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DeviceFlags {
    fn deserialize<De>(deserializer: De) -> Result<Self, De::Error>
    where
        De: serde::Deserializer<'de>,
    {
        let bits = u32::deserialize(deserializer)?;
        Ok(DeviceFlags::from_bits_truncate(bits))
    }
}

impl Serialize for SuspendCause {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SuspendCause {
    fn deserialize<De>(deserializer: De) -> Result<Self, De::Error>
    where
        De: serde::Deserializer<'de>,
    {
        let bits = u32::deserialize(deserializer)?;
        Ok(SuspendCause::from_bits_truncate(bits))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Init,
    Idle,
    Running,
    Suspended,
    Unlinked,
}

impl DeviceState {
    pub fn is_linked(self) -> bool {
        matches!(self, DeviceState::Idle | DeviceState::Running | DeviceState::Suspended)
    }

    /// Idle or running: the hardware is open.
    pub fn is_opened(self) -> bool {
        matches!(self, DeviceState::Idle | DeviceState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortAvailable {
    #[default]
    Unknown,
    No,
    Yes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub available: PortAvailable,
    #[serde(default)]
    pub latency_offset: i64,
}

impl Port {
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            priority,
            available: PortAvailable::Unknown,
            latency_offset: 0,
        }
    }

    pub fn with_available(mut self, available: PortAvailable) -> Self {
        self.available = available;
        self
    }

    pub fn with_latency_offset(mut self, offset: i64) -> Self {
        self.latency_offset = offset;
        self
    }
}

/// Highest priority port, preferring ports not known to be unavailable.
pub(crate) fn best_port<'a>(ports: impl IntoIterator<Item = &'a Port>) -> Option<&'a Port> {
    let mut best: Option<&Port> = None;
    for port in ports {
        best = match best {
            None => Some(port),
            Some(current) => {
                let current_off = current.available == PortAvailable::No;
                let port_off = port.available == PortAvailable::No;
                if (current_off && !port_off)
                    || (current_off == port_off && port.priority > current.priority)
                {
                    Some(port)
                } else {
                    Some(current)
                }
            }
        };
    }
    best
}

/// Everything needed to create a device. Hooks may edit it before the
/// device is allocated.
#[derive(Debug, Clone)]
pub struct DeviceNewData<D: Direction> {
    pub name: String,
    pub fail_on_name_collision: bool,
    pub driver: String,
    pub proplist: Proplist,
    pub sample_spec: SampleSpec,
    pub channel_map: Option<ChannelMap>,
    pub alternate_sample_rate: Option<u32>,
    pub avoid_resampling: Option<bool>,
    pub volume: Option<ChannelVolumes>,
    pub muted: Option<bool>,
    pub ports: Vec<Port>,
    pub active_port: Option<String>,
    pub flags: DeviceFlags,
    pub suspend_cause: SuspendCause,
    pub priority: u32,
    pub save_volume: bool,
    pub save_muted: bool,
    pub save_port: bool,
    _direction: PhantomData<D>,
}

impl<D: Direction> DeviceNewData<D> {
    pub fn new(name: impl Into<String>, sample_spec: SampleSpec) -> Self {
        Self {
            name: name.into(),
            fail_on_name_collision: false,
            driver: String::from("unknown"),
            proplist: Proplist::new(),
            sample_spec,
            channel_map: None,
            alternate_sample_rate: None,
            avoid_resampling: None,
            volume: None,
            muted: None,
            ports: Vec::new(),
            active_port: None,
            flags: DeviceFlags::empty(),
            suspend_cause: SuspendCause::empty(),
            priority: 0,
            save_volume: false,
            save_muted: false,
            save_port: false,
            _direction: PhantomData,
        }
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    pub fn with_channel_map(mut self, map: ChannelMap) -> Self {
        self.channel_map = Some(map);
        self
    }

    pub fn with_flags(mut self, flags: DeviceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_volume(mut self, volume: ChannelVolumes) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn with_muted(mut self, muted: bool) -> Self {
        self.muted = Some(muted);
        self
    }

    pub fn with_port(mut self, port: Port) -> Self {
        self.ports.push(port);
        self
    }

    pub fn with_active_port(mut self, name: impl Into<String>) -> Self {
        self.active_port = Some(name.into());
        self
    }

    pub fn with_suspend_cause(mut self, cause: SuspendCause) -> Self {
        self.suspend_cause = cause;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_alternate_sample_rate(mut self, rate: u32) -> Self {
        self.alternate_sample_rate = Some(rate);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.proplist.set(key, value);
        self
    }

    pub fn strict_name(mut self) -> Self {
        self.fail_on_name_collision = true;
        self
    }
}

pub struct Device<D: Direction> {
    pub(crate) index: u32,
    pub(crate) name: String,
    pub(crate) driver_name: String,
    pub(crate) proplist: Proplist,
    pub(crate) priority: u32,
    pub(crate) flags: DeviceFlags,
    pub(crate) state: DeviceState,
    pub(crate) suspend_cause: SuspendCause,

    pub(crate) spec: SampleSpec,
    pub(crate) map: ChannelMap,
    pub(crate) default_sample_rate: u32,
    pub(crate) alternate_sample_rate: u32,
    pub(crate) avoid_resampling: bool,
    pub(crate) formats: Vec<crate::sample::FormatInfo>,

    pub(crate) reference_volume: ChannelVolumes,
    pub(crate) real_volume: ChannelVolumes,
    pub(crate) soft_volume: ChannelVolumes,
    pub(crate) base_volume: Volume,
    pub(crate) n_volume_steps: u32,
    pub(crate) muted: bool,
    pub(crate) save_volume: bool,
    pub(crate) save_muted: bool,
    pub(crate) save_port: bool,
    pub(crate) refresh_volume: bool,
    pub(crate) refresh_muted: bool,
    pub(crate) set_mute_in_progress: bool,

    pub(crate) ports: BTreeMap<String, Port>,
    pub(crate) active_port: Option<String>,
    pub(crate) port_latency_offset: i64,

    pub(crate) streams: BTreeSet<u32>,
    pub(crate) n_corked: u32,
    /// The stream on another device this filter device feeds or reads from.
    pub(crate) master_stream: Option<u32>,
    pub(crate) unlink_requested: bool,
    pub(crate) saved_volume: Option<ChannelVolumes>,
    pub(crate) saved_save_volume: bool,

    pub(crate) driver: Box<dyn DeviceDriver>,
    pub(crate) io: IoLink<D>,
}

impl<D: Direction> Device<D> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn proplist(&self) -> &Proplist {
        &self.proplist
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn suspend_cause(&self) -> SuspendCause {
        self.suspend_cause
    }

    pub fn is_linked(&self) -> bool {
        self.state.is_linked()
    }

    pub fn sample_spec(&self) -> &SampleSpec {
        &self.spec
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.map
    }

    pub fn reference_volume(&self) -> &ChannelVolumes {
        &self.reference_volume
    }

    pub fn real_volume(&self) -> &ChannelVolumes {
        &self.real_volume
    }

    pub fn soft_volume(&self) -> &ChannelVolumes {
        &self.soft_volume
    }

    pub fn base_volume(&self) -> Volume {
        self.base_volume
    }

    pub fn n_volume_steps(&self) -> u32 {
        self.n_volume_steps
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn save_volume(&self) -> bool {
        self.save_volume
    }

    pub fn save_muted(&self) -> bool {
        self.save_muted
    }

    pub fn save_port(&self) -> bool {
        self.save_port
    }

    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.values()
    }

    pub fn active_port(&self) -> Option<&Port> {
        self.active_port.as_ref().and_then(|name| self.ports.get(name))
    }

    pub fn port_latency_offset(&self) -> i64 {
        self.port_latency_offset
    }

    pub fn streams(&self) -> impl Iterator<Item = StreamId<D>> + '_ {
        self.streams.iter().map(|index| StreamId::new(*index))
    }

    pub fn n_corked(&self) -> u32 {
        self.n_corked
    }

    pub fn master_stream(&self) -> Option<StreamId<D>> {
        self.master_stream.map(StreamId::new)
    }

    pub fn flat_volume_enabled(&self) -> bool {
        self.flags.contains(DeviceFlags::FLAT_VOLUME)
    }

    pub fn shares_volume(&self) -> bool {
        self.flags.contains(DeviceFlags::SHARE_VOLUME_WITH_MASTER)
    }

    pub fn default_sample_rate(&self) -> u32 {
        self.default_sample_rate
    }

    pub fn alternate_sample_rate(&self) -> u32 {
        self.alternate_sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_port_prefers_available_then_priority() {
        let ports = vec![
            Port::new("speaker", 10),
            Port::new("headphones", 50).with_available(PortAvailable::No),
            Port::new("line", 20).with_available(PortAvailable::Yes),
        ];
        assert_eq!(best_port(&ports).map(|p| p.name.as_str()), Some("line"));
        let unplugged = vec![Port::new("headphones", 50).with_available(PortAvailable::No)];
        assert_eq!(best_port(&unplugged).map(|p| p.name.as_str()), Some("headphones"));
    }
}
