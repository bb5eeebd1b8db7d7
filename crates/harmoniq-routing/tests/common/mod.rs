#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use harmoniq_routing::{
    Capture, ChannelVolumes, Core, CoreConfig, DeviceCallbacks, DeviceDriver, DeviceFlags, DeviceId, DeviceNewData,
    DriverError, IoDriver, NullDriver, Playback, SampleFormat, SampleSpec, StreamCallbacks, StreamDriver, StreamId,
    StreamNewData, StreamRender, StreamState, Volume,
};

pub fn stereo_44k() -> SampleSpec {
    SampleSpec::new(SampleFormat::S16Le, 44_100, 2)
}

pub fn stereo_48k() -> SampleSpec {
    SampleSpec::new(SampleFormat::S16Le, 48_000, 2)
}

pub fn level(fraction: f64) -> ChannelVolumes {
    ChannelVolumes::uniform(2, Volume::from_fraction(fraction))
}

/// What a stream owner saw from the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCall {
    Kill,
    Moving(Option<u32>),
    Suspend(bool),
    State(StreamState),
    Event(String),
    VolumeChanged,
    MuteChanged,
}

#[derive(Clone, Default)]
pub struct StreamLog {
    pub calls: Arc<Mutex<Vec<StreamCall>>>,
    pub popped: Arc<Mutex<usize>>,
    pub pushed: Arc<Mutex<usize>>,
    pub rewinds: Arc<Mutex<Vec<usize>>>,
    pub refuse_moves: Arc<Mutex<bool>>,
}

impl StreamLog {
    pub fn calls(&self) -> Vec<StreamCall> {
        self.calls.lock().clone()
    }

    pub fn was_killed(&self) -> bool {
        self.calls.lock().contains(&StreamCall::Kill)
    }

    pub fn callbacks(&self) -> StreamCallbacks {
        StreamCallbacks::new(RecordingStream(self.clone()), ToneRender(self.clone()))
    }
}

pub struct RecordingStream(pub StreamLog);

impl StreamDriver for RecordingStream {
    fn kill(&mut self) {
        self.0.calls.lock().push(StreamCall::Kill);
    }

    fn moving(&mut self, destination: Option<u32>) {
        self.0.calls.lock().push(StreamCall::Moving(destination));
    }

    fn may_move_to(&self, _destination: u32) -> bool {
        !*self.0.refuse_moves.lock()
    }

    fn suspend(&mut self, suspended: bool) {
        self.0.calls.lock().push(StreamCall::Suspend(suspended));
    }

    fn state_change(&mut self, state: StreamState) {
        self.0.calls.lock().push(StreamCall::State(state));
    }

    fn send_event(&mut self, event: &str, _properties: &harmoniq_routing::Proplist) {
        self.0.calls.lock().push(StreamCall::Event(event.to_string()));
    }

    fn volume_changed(&mut self) {
        self.0.calls.lock().push(StreamCall::VolumeChanged);
    }

    fn mute_changed(&mut self) {
        self.0.calls.lock().push(StreamCall::MuteChanged);
    }
}

/// Playback render callback producing a constant non-silent sample.
pub struct ToneRender(pub StreamLog);

impl StreamRender for ToneRender {
    fn pop(&mut self, nbytes: usize) -> Option<Vec<u8>> {
        *self.0.popped.lock() += nbytes;
        Some(
            std::iter::repeat(0x2000i16.to_le_bytes())
                .take(nbytes / 2)
                .flatten()
                .collect(),
        )
    }

    fn push(&mut self, data: &[u8]) {
        *self.0.pushed.lock() += data.len();
    }

    fn process_rewind(&mut self, nbytes: usize) {
        self.0.rewinds.lock().push(nbytes);
    }
}

/// Hardware with its own volume control and a fixed latency.
#[derive(Clone, Default)]
pub struct HwLog {
    pub volume_writes: Arc<Mutex<Vec<ChannelVolumes>>>,
    pub deferred_writes: Arc<Mutex<Vec<ChannelVolumes>>>,
    pub states: Arc<Mutex<Vec<harmoniq_routing::DeviceState>>>,
    pub latency_usec: Arc<Mutex<i64>>,
}

pub struct HwControl(pub HwLog);

impl DeviceDriver for HwControl {
    fn set_state(
        &mut self,
        state: harmoniq_routing::DeviceState,
        _cause: harmoniq_routing::SuspendCause,
    ) -> Result<(), DriverError> {
        self.0.states.lock().push(state);
        Ok(())
    }

    fn set_volume(&mut self, real: &ChannelVolumes) -> Result<Option<ChannelVolumes>, DriverError> {
        self.0.volume_writes.lock().push(real.clone());
        Ok(None)
    }
}

pub struct HwIo(pub HwLog);

impl IoDriver for HwIo {
    fn latency_usec(&mut self) -> i64 {
        *self.0.latency_usec.lock()
    }

    fn write_volume(&mut self, hw: &ChannelVolumes) {
        self.0.deferred_writes.lock().push(hw.clone());
    }
}

impl HwLog {
    pub fn callbacks(&self) -> DeviceCallbacks {
        DeviceCallbacks::new(HwControl(self.clone()), HwIo(self.clone()))
    }
}

pub fn core() -> Core {
    Core::new(CoreConfig::default())
}

pub fn sink(core: &mut Core, name: &str) -> DeviceId<Playback> {
    sink_with(core, DeviceNewData::new(name, stereo_44k()), DeviceCallbacks::null())
}

pub fn sink_with(core: &mut Core, data: DeviceNewData<Playback>, callbacks: DeviceCallbacks) -> DeviceId<Playback> {
    let id = core.create_device(data, callbacks).expect("create sink");
    core.put_device(id).expect("put sink");
    id
}

pub fn source(core: &mut Core, name: &str) -> DeviceId<Capture> {
    let id = core
        .create_device(DeviceNewData::new(name, stereo_44k()), DeviceCallbacks::new(NullDriver, NullDriver))
        .expect("create source");
    core.put_device(id).expect("put source");
    id
}

/// A filter sink fed by a stream on `master`, sharing the master's volume.
pub fn filter_sink(core: &mut Core, name: &str, master: DeviceId<Playback>) -> (DeviceId<Playback>, StreamId<Playback>) {
    let filter = core
        .create_device(
            DeviceNewData::new(name, stereo_44k()).with_flags(DeviceFlags::SHARE_VOLUME_WITH_MASTER),
            DeviceCallbacks::null(),
        )
        .expect("create filter");
    let feed = core
        .create_stream(
            StreamNewData::new(stereo_44k())
                .with_device(master)
                .with_origin_device(filter)
                .with_driver("filter"),
            StreamCallbacks::null(),
        )
        .expect("create filter feed");
    core.put_device(filter).expect("put filter");
    core.put_stream(feed).expect("put filter feed");
    (filter, feed)
}

pub fn input(core: &mut Core, data: StreamNewData<Playback>, log: &StreamLog) -> StreamId<Playback> {
    let id = core.create_stream(data, log.callbacks()).expect("create sink input");
    core.put_stream(id).expect("put sink input");
    id
}

pub fn input_on(core: &mut Core, device: DeviceId<Playback>, volume: f64) -> StreamId<Playback> {
    input(
        core,
        StreamNewData::new(stereo_44k())
            .with_device(device)
            .with_volume(level(volume), true),
        &StreamLog::default(),
    )
}
