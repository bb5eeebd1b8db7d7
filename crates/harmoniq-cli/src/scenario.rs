//! Routing scenarios: a JSON description of devices, streams and the
//! actions applied to them, replayed against a fresh core.

use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, bail, Context, Result};
use harmoniq_routing::{
    Capture, ChannelVolumes, Core, CoreConfig, CoreSnapshot, DeviceCallbacks, DeviceFlags, DeviceId, DeviceNewData,
    Direction, FormatInfo, IoBlock, Playback, Port, SampleFormat, SampleSpec, StreamCallbacks, StreamFlags, StreamId,
    StreamNewData, SuspendCause, Volume,
};
use serde::Deserialize;

/// Upper bound on actions, so a hostile file cannot keep the core busy.
pub const MAX_ACTIONS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Sink,
    Source,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSpec {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: DeviceKind,
    #[serde(default = "default_rate")]
    pub rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub flags: DeviceFlags,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamSpec {
    pub name: String,
    /// Device name; the default device when absent.
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: DeviceKind,
    #[serde(default = "default_rate")]
    pub rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub corked: bool,
    #[serde(default)]
    pub flags: StreamFlags,
    #[serde(default)]
    pub formats: Vec<FormatInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Action {
    Move { stream: String, device: String },
    Cork { stream: String, cork: bool },
    Kill { stream: String },
    SetStreamVolume { stream: String, volume: f64 },
    SetStreamMute { stream: String, muted: bool },
    SetDeviceVolume { device: String, volume: f64 },
    SetDeviceMute { device: String, muted: bool },
    Suspend { device: String, suspend: bool },
    SetPort { device: String, port: String },
    UnlinkDevice { device: String },
    Render { device: String, bytes: usize },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub config: CoreConfig,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
    #[serde(default)]
    pub streams: Vec<StreamSpec>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

fn default_kind() -> DeviceKind {
    DeviceKind::Sink
}

fn default_rate() -> u32 {
    44_100
}

fn default_channels() -> u8 {
    2
}

/// Outcome of a replayed scenario.
#[derive(Debug)]
pub struct Report {
    pub snapshot: CoreSnapshot,
    /// Actions the core refused, with the reason.
    pub failures: Vec<(usize, String)>,
    pub rendered_bytes: usize,
}

#[derive(Clone, Copy)]
enum DeviceHandle {
    Sink(DeviceId<Playback>),
    Source(DeviceId<Capture>),
}

#[derive(Clone, Copy)]
enum StreamHandle {
    Input(StreamId<Playback>),
    Output(StreamId<Capture>),
}

impl Scenario {
    pub fn from_json(text: &str) -> Result<Self> {
        let scenario: Scenario = serde_json::from_str(text).context("failed to parse scenario")?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Checks names and references without touching a core.
    pub fn validate(&self) -> Result<()> {
        if self.actions.len() > MAX_ACTIONS {
            bail!("scenario has {} actions, at most {MAX_ACTIONS} allowed", self.actions.len());
        }
        let mut devices = HashSet::new();
        for device in &self.devices {
            if !devices.insert(device.name.as_str()) {
                bail!("device {:?} declared twice", device.name);
            }
            if !sample_spec(device.rate, device.channels).is_valid() {
                bail!("device {:?} has an invalid sample spec", device.name);
            }
        }
        let mut streams = HashSet::new();
        for stream in &self.streams {
            if !streams.insert(stream.name.as_str()) {
                bail!("stream {:?} declared twice", stream.name);
            }
            if let Some(device) = &stream.device {
                if !devices.contains(device.as_str()) {
                    bail!("stream {:?} targets unknown device {device:?}", stream.name);
                }
            }
        }
        for (position, action) in self.actions.iter().enumerate() {
            let (stream, device) = action.references();
            if let Some(stream) = stream.filter(|s| !streams.contains(s)) {
                bail!("action {position} names unknown stream {stream:?}");
            }
            if let Some(device) = device.filter(|d| !devices.contains(d)) {
                bail!("action {position} names unknown device {device:?}");
            }
        }
        Ok(())
    }

    /// Builds the core, links everything and replays the actions. Refused
    /// actions are collected rather than aborting the run.
    pub fn run(&self) -> Result<Report> {
        let mut core = Core::new(self.config.clone());
        let mut devices = BTreeMap::new();
        for spec in &self.devices {
            let handle = match spec.kind {
                DeviceKind::Sink => DeviceHandle::Sink(add_device::<Playback>(&mut core, spec)?),
                DeviceKind::Source => DeviceHandle::Source(add_device::<Capture>(&mut core, spec)?),
            };
            devices.insert(spec.name.clone(), handle);
        }

        let mut streams = BTreeMap::new();
        for spec in &self.streams {
            let target = spec.device.as_ref().and_then(|name| devices.get(name)).copied();
            let handle = match (spec.kind, target) {
                (DeviceKind::Sink, None) => StreamHandle::Input(add_stream::<Playback>(&mut core, spec, None)?),
                (DeviceKind::Sink, Some(DeviceHandle::Sink(id))) => {
                    StreamHandle::Input(add_stream(&mut core, spec, Some(id))?)
                }
                (DeviceKind::Source, None) => StreamHandle::Output(add_stream::<Capture>(&mut core, spec, None)?),
                (DeviceKind::Source, Some(DeviceHandle::Source(id))) => {
                    StreamHandle::Output(add_stream(&mut core, spec, Some(id))?)
                }
                _ => bail!("stream {:?} does not match the kind of its device", spec.name),
            };
            streams.insert(spec.name.clone(), handle);
        }

        let mut failures = Vec::new();
        let mut rendered_bytes = 0;
        for (position, action) in self.actions.iter().enumerate() {
            match apply(&mut core, &devices, &streams, action) {
                Ok(bytes) => rendered_bytes += bytes,
                Err(err) => {
                    tracing::info!(position, %err, "action refused");
                    failures.push((position, format!("{err:#}")));
                }
            }
        }

        let snapshot = core.snapshot();
        core.shutdown();
        Ok(Report {
            snapshot,
            failures,
            rendered_bytes,
        })
    }
}

impl Action {
    fn references(&self) -> (Option<&str>, Option<&str>) {
        match self {
            Action::Move { stream, device } => (Some(stream), Some(device)),
            Action::Cork { stream, .. }
            | Action::Kill { stream }
            | Action::SetStreamVolume { stream, .. }
            | Action::SetStreamMute { stream, .. } => (Some(stream), None),
            Action::SetDeviceVolume { device, .. }
            | Action::SetDeviceMute { device, .. }
            | Action::Suspend { device, .. }
            | Action::SetPort { device, .. }
            | Action::UnlinkDevice { device }
            | Action::Render { device, .. } => (None, Some(device)),
        }
    }
}

fn sample_spec(rate: u32, channels: u8) -> SampleSpec {
    SampleSpec::new(SampleFormat::S16Le, rate, channels)
}

fn volume(channels: u8, fraction: f64) -> Result<ChannelVolumes> {
    if !(0.0..=4.0).contains(&fraction) {
        bail!("volume {fraction} out of range");
    }
    Ok(ChannelVolumes::uniform(channels, Volume::from_fraction(fraction)))
}

fn add_device<D: Direction>(core: &mut Core, spec: &DeviceSpec) -> Result<DeviceId<D>> {
    let mut data = DeviceNewData::<D>::new(spec.name.clone(), sample_spec(spec.rate, spec.channels))
        .with_driver("scenario")
        .with_priority(spec.priority)
        .with_flags(spec.flags)
        .strict_name();
    for port in &spec.ports {
        data = data.with_port(port.clone());
    }
    if let Some(level) = spec.volume {
        data = data.with_volume(volume(spec.channels, level)?);
    }
    let id = core
        .create_device(data, DeviceCallbacks::null())
        .with_context(|| format!("failed to create device {:?}", spec.name))?;
    core.put_device(id)
        .with_context(|| format!("failed to link device {:?}", spec.name))?;
    Ok(id)
}

fn add_stream<D: Direction>(core: &mut Core, spec: &StreamSpec, device: Option<DeviceId<D>>) -> Result<StreamId<D>> {
    let mut flags = spec.flags;
    if spec.corked {
        flags |= StreamFlags::START_CORKED;
    }
    let mut data = StreamNewData::<D>::new(sample_spec(spec.rate, spec.channels))
        .with_driver("scenario")
        .with_flags(flags)
        .with_property("media.name", spec.name.clone());
    if let Some(device) = device {
        data = data.with_device(device);
    }
    if !spec.formats.is_empty() {
        data = data.with_formats(spec.formats.clone());
    }
    if let Some(level) = spec.volume {
        data = data.with_volume(volume(spec.channels, level)?, true);
    }
    let id = core
        .create_stream(data, StreamCallbacks::null())
        .with_context(|| format!("failed to create stream {:?}", spec.name))?;
    core.put_stream(id)
        .with_context(|| format!("failed to link stream {:?}", spec.name))?;
    Ok(id)
}

fn stream_channels<D: Direction>(core: &Core, id: StreamId<D>) -> Result<u8> {
    core.stream(id)
        .map(|s| s.sample_spec().channels)
        .ok_or_else(|| anyhow!("stream {id} is gone"))
}

fn device_channels<D: Direction>(core: &Core, id: DeviceId<D>) -> Result<u8> {
    core.device(id)
        .map(|d| d.sample_spec().channels)
        .ok_or_else(|| anyhow!("device {id} is gone"))
}

fn apply(
    core: &mut Core,
    devices: &BTreeMap<String, DeviceHandle>,
    streams: &BTreeMap<String, StreamHandle>,
    action: &Action,
) -> Result<usize> {
    let (stream, device) = action.references();
    let stream = stream
        .map(|name| streams.get(name).copied().ok_or_else(|| anyhow!("unknown stream {name:?}")))
        .transpose()?;
    let device = device
        .map(|name| devices.get(name).copied().ok_or_else(|| anyhow!("unknown device {name:?}")))
        .transpose()?;

    match (action, stream, device) {
        (Action::Move { .. }, Some(StreamHandle::Input(s)), Some(DeviceHandle::Sink(d))) => {
            core.move_stream_to(s, d, true)?
        }
        (Action::Move { .. }, Some(StreamHandle::Output(s)), Some(DeviceHandle::Source(d))) => {
            core.move_stream_to(s, d, true)?
        }
        (Action::Move { .. }, _, _) => bail!("cannot move a stream across directions"),
        (Action::Cork { cork, .. }, Some(StreamHandle::Input(s)), _) => core.cork_stream(s, *cork)?,
        (Action::Cork { cork, .. }, Some(StreamHandle::Output(s)), _) => core.cork_stream(s, *cork)?,
        (Action::Kill { .. }, Some(StreamHandle::Input(s)), _) => core.kill_stream(s),
        (Action::Kill { .. }, Some(StreamHandle::Output(s)), _) => core.kill_stream(s),
        (Action::SetStreamVolume { volume: level, .. }, Some(StreamHandle::Input(s)), _) => {
            let channels = stream_channels(core, s)?;
            core.set_stream_volume(s, &volume(channels, *level)?, true, true)?
        }
        (Action::SetStreamVolume { volume: level, .. }, Some(StreamHandle::Output(s)), _) => {
            let channels = stream_channels(core, s)?;
            core.set_stream_volume(s, &volume(channels, *level)?, true, true)?
        }
        (Action::SetStreamMute { muted, .. }, Some(StreamHandle::Input(s)), _) => {
            core.set_stream_mute(s, *muted, true)?
        }
        (Action::SetStreamMute { muted, .. }, Some(StreamHandle::Output(s)), _) => {
            core.set_stream_mute(s, *muted, true)?
        }
        (Action::SetDeviceVolume { volume: level, .. }, _, Some(DeviceHandle::Sink(d))) => {
            let channels = device_channels(core, d)?;
            core.set_device_volume(d, Some(&volume(channels, *level)?), true, true)?
        }
        (Action::SetDeviceVolume { volume: level, .. }, _, Some(DeviceHandle::Source(d))) => {
            let channels = device_channels(core, d)?;
            core.set_device_volume(d, Some(&volume(channels, *level)?), true, true)?
        }
        (Action::SetDeviceMute { muted, .. }, _, Some(DeviceHandle::Sink(d))) => core.set_device_mute(d, *muted, true)?,
        (Action::SetDeviceMute { muted, .. }, _, Some(DeviceHandle::Source(d))) => {
            core.set_device_mute(d, *muted, true)?
        }
        (Action::Suspend { suspend, .. }, _, Some(DeviceHandle::Sink(d))) => {
            core.suspend_device(d, *suspend, SuspendCause::USER)?
        }
        (Action::Suspend { suspend, .. }, _, Some(DeviceHandle::Source(d))) => {
            core.suspend_device(d, *suspend, SuspendCause::USER)?
        }
        (Action::SetPort { port, .. }, _, Some(DeviceHandle::Sink(d))) => core.set_device_port(d, port, true)?,
        (Action::SetPort { port, .. }, _, Some(DeviceHandle::Source(d))) => core.set_device_port(d, port, true)?,
        (Action::UnlinkDevice { .. }, _, Some(DeviceHandle::Sink(d))) => core.unlink_device(d),
        (Action::UnlinkDevice { .. }, _, Some(DeviceHandle::Source(d))) => core.unlink_device(d),
        (Action::Render { bytes, .. }, _, Some(DeviceHandle::Sink(d))) => {
            let data = core.process_device(d, IoBlock::Render((*bytes).min(1 << 20)))?;
            return Ok(data.len());
        }
        (Action::Render { bytes, .. }, _, Some(DeviceHandle::Source(d))) => {
            let block = vec![0; (*bytes).min(1 << 20)];
            let len = block.len();
            core.process_device(d, IoBlock::Capture(block))?;
            return Ok(len);
        }
        _ => bail!("action is missing its target"),
    }
    Ok(0)
}

/// Parses and replays arbitrary bytes as a scenario. Errors are expected;
/// panics and hangs are what the fuzzer looks for.
#[cfg(feature = "fuzzing")]
pub fn fuzz_parse_scenario(data: &[u8]) {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(scenario) = Scenario::from_json(text) {
        let _ = scenario.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_SINKS: &str = r#"{
        "devices": [
            { "name": "speakers" },
            { "name": "hdmi", "priority": 10, "rate": 48000 }
        ],
        "streams": [
            { "name": "music", "device": "speakers", "volume": 0.5 },
            { "name": "chat", "volume": 0.25 }
        ],
        "actions": [
            { "op": "move", "stream": "music", "device": "hdmi" },
            { "op": "set-device-volume", "device": "hdmi", "volume": 1.0 },
            { "op": "render", "device": "hdmi", "bytes": 1024 },
            { "op": "set-port", "device": "speakers", "port": "line" }
        ]
    }"#;

    #[test]
    fn scenario_replays_moves_and_collects_refusals() {
        let scenario = Scenario::from_json(TWO_SINKS).unwrap();
        let report = scenario.run().unwrap();

        let hdmi = report.snapshot.sinks.iter().find(|s| s.name == "hdmi").unwrap();
        assert!(hdmi.is_default);
        assert_eq!(hdmi.streams.len(), 2);
        assert_eq!(report.rendered_bytes, 1024);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, 3);
    }

    #[test]
    fn unknown_references_are_rejected_before_running() {
        let text = r#"{ "actions": [ { "op": "kill", "stream": "ghost" } ] }"#;
        let err = Scenario::from_json(text).unwrap_err();
        assert!(format!("{err:#}").contains("ghost"));

        let text = r#"{ "devices": [ { "name": "a" }, { "name": "a" } ] }"#;
        assert!(Scenario::from_json(text).is_err());
    }

    #[test]
    fn mismatched_stream_kind_fails_the_run() {
        let text = r#"{
            "devices": [ { "name": "mic", "kind": "source" } ],
            "streams": [ { "name": "music", "device": "mic" } ]
        }"#;
        let scenario = Scenario::from_json(text).unwrap();
        assert!(scenario.run().is_err());
    }
}
