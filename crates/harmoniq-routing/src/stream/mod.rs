//! Streams: sink-inputs and source-outputs.

pub mod control;
pub mod io;
pub mod moving;

use std::collections::BTreeMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::direction::{DeviceId, Direction, StreamId};
use crate::driver::StreamDriver;
use crate::proplist::Proplist;
use crate::sample::{ChannelMap, FormatInfo, SampleSpec};
use crate::volume::ChannelVolumes;

pub use io::StreamIo;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StreamFlags: u32 {
        const VARIABLE_RATE = 1 << 0;
        const DONT_MOVE = 1 << 1;
        const START_CORKED = 1 << 2;
        const NO_REMAP = 1 << 3;
        const NO_REMIX = 1 << 4;
        const FIX_FORMAT = 1 << 5;
        const FIX_RATE = 1 << 6;
        const FIX_CHANNELS = 1 << 7;
        const DONT_INHIBIT_AUTO_SUSPEND = 1 << 8;
        const NO_CREATE_ON_SUSPEND = 1 << 9;
        const KILL_ON_SUSPEND = 1 << 10;
        const PASSTHROUGH = 1 << 11;
    }
}

impl Serialize for StreamFlags {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StreamFlags {
    fn deserialize<De>(deserializer: De) -> Result<Self, De::Error>
    where
        De: serde::Deserializer<'de>,
    {
        let bits = u32::deserialize(deserializer)?;
        Ok(StreamFlags::from_bits_truncate(bits))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Init,
    Running,
    Corked,
    Unlinked,
}

impl StreamState {
    pub fn is_linked(self) -> bool {
        matches!(self, StreamState::Running | StreamState::Corked)
    }
}

/// Everything needed to create a stream. The new and fixate hooks may edit
/// it, the new hook typically to pick the device.
#[derive(Debug, Clone)]
pub struct StreamNewData<D: Direction> {
    pub driver: String,
    pub client: Option<u32>,
    pub proplist: Proplist,
    pub device: Option<DeviceId<D>>,
    pub device_requested_by_application: bool,
    /// Filter device fed by this stream.
    pub origin_device: Option<DeviceId<D>>,
    pub sample_spec: SampleSpec,
    pub channel_map: Option<ChannelMap>,
    /// Requested formats in order of preference. Synthesized from the
    /// sample spec when empty.
    pub requested_formats: Vec<FormatInfo>,
    /// Request order intersected with what the device offers.
    pub negotiated_formats: Vec<FormatInfo>,
    pub format: Option<FormatInfo>,
    pub volume: Option<ChannelVolumes>,
    pub volume_is_absolute: bool,
    pub volume_writable: bool,
    pub volume_factor_items: BTreeMap<String, ChannelVolumes>,
    pub volume_factor_device_items: BTreeMap<String, ChannelVolumes>,
    pub muted: Option<bool>,
    pub flags: StreamFlags,
    pub sync_base: Option<StreamId<D>>,
    /// Capture streams only: the playback stream this one monitors.
    pub direct_on_input: Option<u32>,
    pub preferred_device: Option<String>,
    pub save_volume: bool,
    pub save_muted: bool,
}

impl<D: Direction> StreamNewData<D> {
    pub fn new(sample_spec: SampleSpec) -> Self {
        Self {
            driver: String::from("unknown"),
            client: None,
            proplist: Proplist::new(),
            device: None,
            device_requested_by_application: false,
            origin_device: None,
            sample_spec,
            channel_map: None,
            requested_formats: Vec::new(),
            negotiated_formats: Vec::new(),
            format: None,
            volume: None,
            volume_is_absolute: false,
            volume_writable: true,
            volume_factor_items: BTreeMap::new(),
            volume_factor_device_items: BTreeMap::new(),
            muted: None,
            flags: StreamFlags::empty(),
            sync_base: None,
            direct_on_input: None,
            preferred_device: None,
            save_volume: false,
            save_muted: false,
        }
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    pub fn with_client(mut self, client: u32) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_device(mut self, device: DeviceId<D>) -> Self {
        self.device = Some(device);
        self.device_requested_by_application = true;
        self
    }

    pub fn with_origin_device(mut self, device: DeviceId<D>) -> Self {
        self.origin_device = Some(device);
        self
    }

    pub fn with_channel_map(mut self, map: ChannelMap) -> Self {
        self.channel_map = Some(map);
        self
    }

    pub fn with_formats(mut self, formats: Vec<FormatInfo>) -> Self {
        self.requested_formats = formats;
        self
    }

    pub fn with_volume(mut self, volume: ChannelVolumes, absolute: bool) -> Self {
        self.volume = Some(volume);
        self.volume_is_absolute = absolute;
        self
    }

    pub fn with_volume_factor(mut self, key: impl Into<String>, factor: ChannelVolumes) -> Self {
        self.volume_factor_items.insert(key.into(), factor);
        self
    }

    pub fn with_device_volume_factor(mut self, key: impl Into<String>, factor: ChannelVolumes) -> Self {
        self.volume_factor_device_items.insert(key.into(), factor);
        self
    }

    pub fn with_muted(mut self, muted: bool) -> Self {
        self.muted = Some(muted);
        self
    }

    pub fn with_flags(mut self, flags: StreamFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_sync_base(mut self, base: StreamId<D>) -> Self {
        self.sync_base = Some(base);
        self
    }

    pub fn with_direct_on_input(mut self, input: u32) -> Self {
        self.direct_on_input = Some(input);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.proplist.set(key, value);
        self
    }

    pub fn is_passthrough(&self) -> bool {
        self.flags.contains(StreamFlags::PASSTHROUGH)
            || self.format.as_ref().is_some_and(FormatInfo::is_passthrough)
    }
}

pub struct Stream<D: Direction> {
    pub(crate) index: u32,
    pub(crate) client: Option<u32>,
    pub(crate) driver_name: String,
    pub(crate) proplist: Proplist,
    pub(crate) flags: StreamFlags,
    pub(crate) state: StreamState,
    pub(crate) device: Option<u32>,
    pub(crate) device_requested_by_application: bool,
    pub(crate) preferred_device: Option<String>,
    pub(crate) origin_device: Option<u32>,

    pub(crate) spec: SampleSpec,
    pub(crate) map: ChannelMap,
    pub(crate) format: FormatInfo,

    pub(crate) volume: ChannelVolumes,
    pub(crate) reference_ratio: ChannelVolumes,
    pub(crate) real_ratio: ChannelVolumes,
    pub(crate) volume_factor: ChannelVolumes,
    pub(crate) volume_factor_items: BTreeMap<String, ChannelVolumes>,
    pub(crate) volume_factor_device: ChannelVolumes,
    pub(crate) volume_factor_device_items: BTreeMap<String, ChannelVolumes>,
    pub(crate) soft_volume: ChannelVolumes,
    pub(crate) muted: bool,
    pub(crate) volume_writable: bool,
    pub(crate) save_volume: bool,
    pub(crate) save_muted: bool,

    pub(crate) sync_prev: Option<u32>,
    pub(crate) sync_next: Option<u32>,
    pub(crate) direct_on_input: Option<u32>,
    pub(crate) requested_latency: Option<u64>,

    pub(crate) driver: Box<dyn StreamDriver>,
    /// The realtime half while no device thread owns it.
    pub(crate) io: Option<Box<StreamIo>>,
    _direction: std::marker::PhantomData<D>,
}

impl<D: Direction> Stream<D> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn id(&self) -> StreamId<D> {
        StreamId::new(self.index)
    }

    pub fn client(&self) -> Option<u32> {
        self.client
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn proplist(&self) -> &Proplist {
        &self.proplist
    }

    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_linked(&self) -> bool {
        self.state.is_linked()
    }

    pub fn is_corked(&self) -> bool {
        self.state == StreamState::Corked
    }

    pub fn device(&self) -> Option<DeviceId<D>> {
        self.device.map(DeviceId::new)
    }

    pub fn preferred_device(&self) -> Option<&str> {
        self.preferred_device.as_deref()
    }

    pub fn origin_device(&self) -> Option<DeviceId<D>> {
        self.origin_device.map(DeviceId::new)
    }

    pub fn sample_spec(&self) -> &SampleSpec {
        &self.spec
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.map
    }

    pub fn format(&self) -> &FormatInfo {
        &self.format
    }

    pub fn is_passthrough(&self) -> bool {
        self.flags.contains(StreamFlags::PASSTHROUGH) || self.format.is_passthrough()
    }

    pub fn volume(&self) -> &ChannelVolumes {
        &self.volume
    }

    pub fn reference_ratio(&self) -> &ChannelVolumes {
        &self.reference_ratio
    }

    pub fn real_ratio(&self) -> &ChannelVolumes {
        &self.real_ratio
    }

    pub fn volume_factor(&self) -> &ChannelVolumes {
        &self.volume_factor
    }

    pub fn volume_factor_device(&self) -> &ChannelVolumes {
        &self.volume_factor_device
    }

    pub fn soft_volume(&self) -> &ChannelVolumes {
        &self.soft_volume
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn volume_writable(&self) -> bool {
        self.volume_writable
    }

    pub fn save_volume(&self) -> bool {
        self.save_volume
    }

    pub fn save_muted(&self) -> bool {
        self.save_muted
    }

    pub fn sync_prev(&self) -> Option<StreamId<D>> {
        self.sync_prev.map(StreamId::new)
    }

    pub fn sync_next(&self) -> Option<StreamId<D>> {
        self.sync_next.map(StreamId::new)
    }

    pub fn direct_on_input(&self) -> Option<u32> {
        self.direct_on_input
    }

    pub fn requested_latency(&self) -> Option<u64> {
        self.requested_latency
    }

    /// True while a move has detached the stream from every device.
    pub fn is_moving(&self) -> bool {
        self.state.is_linked() && self.device.is_none()
    }

    /// Recomputes `soft = real_ratio × volume_factor`.
    pub(crate) fn update_soft_volume(&mut self) {
        self.soft_volume = self.real_ratio.multiply(&self.volume_factor);
    }
}
