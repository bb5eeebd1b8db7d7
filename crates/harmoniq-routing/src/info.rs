//! Serializable views of the core, used by the CLI and by tests that want
//! to compare whole states.

use serde::Serialize;

use crate::core::Core;
use crate::device::{Device, DeviceFlags, DeviceState, Port, SuspendCause};
use crate::direction::{Capture, Direction, DirectionKind, Playback};
use crate::proplist::Proplist;
use crate::sample::{ChannelMap, FormatInfo, SampleSpec};
use crate::stream::{Stream, StreamFlags, StreamState};
use crate::volume::ChannelVolumes;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub index: u32,
    pub kind: DirectionKind,
    pub name: String,
    pub driver: String,
    pub state: DeviceState,
    pub suspend_cause: SuspendCause,
    pub flags: DeviceFlags,
    pub priority: u32,
    pub sample_spec: SampleSpec,
    pub channel_map: ChannelMap,
    pub reference_volume: ChannelVolumes,
    pub real_volume: ChannelVolumes,
    pub soft_volume: ChannelVolumes,
    pub muted: bool,
    pub ports: Vec<Port>,
    pub active_port: Option<String>,
    pub master_stream: Option<u32>,
    pub streams: Vec<u32>,
    pub n_corked: u32,
    pub is_default: bool,
    pub proplist: Proplist,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    pub index: u32,
    pub kind: DirectionKind,
    pub driver: String,
    pub client: Option<u32>,
    pub state: StreamState,
    pub flags: StreamFlags,
    pub device: Option<u32>,
    pub origin_device: Option<u32>,
    pub preferred_device: Option<String>,
    pub sample_spec: SampleSpec,
    pub channel_map: ChannelMap,
    pub format: FormatInfo,
    pub volume: ChannelVolumes,
    pub reference_ratio: ChannelVolumes,
    pub real_ratio: ChannelVolumes,
    pub soft_volume: ChannelVolumes,
    pub muted: bool,
    pub sync_prev: Option<u32>,
    pub sync_next: Option<u32>,
    pub proplist: Proplist,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoreSnapshot {
    pub sinks: Vec<DeviceInfo>,
    pub sources: Vec<DeviceInfo>,
    pub sink_inputs: Vec<StreamInfo>,
    pub source_outputs: Vec<StreamInfo>,
}

impl DeviceInfo {
    fn from_device<D: Direction>(device: &Device<D>, default: Option<u32>) -> Self {
        Self {
            index: device.index,
            kind: D::KIND,
            name: device.name.clone(),
            driver: device.driver_name.clone(),
            state: device.state,
            suspend_cause: device.suspend_cause,
            flags: device.flags,
            priority: device.priority,
            sample_spec: device.spec,
            channel_map: device.map.clone(),
            reference_volume: device.reference_volume.clone(),
            real_volume: device.real_volume.clone(),
            soft_volume: device.soft_volume.clone(),
            muted: device.muted,
            ports: device.ports.values().cloned().collect(),
            active_port: device.active_port.clone(),
            master_stream: device.master_stream,
            streams: device.streams.iter().copied().collect(),
            n_corked: device.n_corked,
            is_default: default == Some(device.index),
            proplist: device.proplist.clone(),
        }
    }
}

impl StreamInfo {
    fn from_stream<D: Direction>(stream: &Stream<D>) -> Self {
        Self {
            index: stream.index,
            kind: D::KIND,
            driver: stream.driver_name.clone(),
            client: stream.client,
            state: stream.state,
            flags: stream.flags,
            device: stream.device,
            origin_device: stream.origin_device,
            preferred_device: stream.preferred_device.clone(),
            sample_spec: stream.spec,
            channel_map: stream.map.clone(),
            format: stream.format.clone(),
            volume: stream.volume.clone(),
            reference_ratio: stream.reference_ratio.clone(),
            real_ratio: stream.real_ratio.clone(),
            soft_volume: stream.soft_volume.clone(),
            muted: stream.muted,
            sync_prev: stream.sync_prev,
            sync_next: stream.sync_next,
            proplist: stream.proplist.clone(),
        }
    }
}

impl Core {
    pub fn device_infos<D: Direction>(&self) -> Vec<DeviceInfo> {
        let domain = D::domain(self);
        domain
            .devices
            .values()
            .map(|device| DeviceInfo::from_device(device, domain.default_device))
            .collect()
    }

    pub fn stream_infos<D: Direction>(&self) -> Vec<StreamInfo> {
        D::domain(self).streams.values().map(StreamInfo::from_stream).collect()
    }

    pub fn snapshot(&self) -> CoreSnapshot {
        CoreSnapshot {
            sinks: self.device_infos::<Playback>(),
            sources: self.device_infos::<Capture>(),
            sink_inputs: self.stream_infos::<Playback>(),
            source_outputs: self.stream_infos::<Capture>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceNewData;
    use crate::driver::{DeviceCallbacks, StreamCallbacks};
    use crate::stream::StreamNewData;

    #[test]
    fn snapshot_serializes_linked_objects() {
        let mut core = Core::default();
        let sink = core
            .create_device(DeviceNewData::<Playback>::new("speakers", SampleSpec::default()), DeviceCallbacks::null())
            .unwrap();
        core.put_device(sink).unwrap();
        let input = core
            .create_stream(
                StreamNewData::<Playback>::new(SampleSpec::default()).with_property("media.name", "song"),
                StreamCallbacks::null(),
            )
            .unwrap();
        core.put_stream(input).unwrap();

        let snapshot = core.snapshot();
        assert_eq!(snapshot.sinks.len(), 1);
        assert!(snapshot.sinks[0].is_default);
        assert_eq!(snapshot.sinks[0].streams, vec![input.index()]);
        assert_eq!(snapshot.sink_inputs[0].device, Some(sink.index()));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["sinks"][0]["name"], "speakers");
        assert_eq!(json["sinks"][0]["state"], "running");
        assert_eq!(json["sink_inputs"][0]["proplist"]["media.name"], "song");
        core.shutdown();
    }
}
