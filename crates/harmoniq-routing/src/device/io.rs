//! Realtime state of a device and its message handler.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::clock::Clock;
use crate::deferred::VolumeChangeQueue;
use crate::device::{DeviceFlags, DeviceState, SuspendCause};
use crate::direction::Direction;
use crate::driver::IoDriver;
use crate::error::{RoutingError, RoutingResult};
use crate::latency::{combine_requests, LatencyRange, DEFAULT_FIXED_LATENCY};
use crate::message::{DeviceMsg, IoStats, PostedMsg, Reply, VolumeUpdate};
use crate::mix::{apply_volume, mix, silence, MixInput};
use crate::sample::{ChannelMap, SampleSpec};
use crate::stream::io::RewindRequest;
use crate::stream::{StreamIo, StreamState};
use crate::volume::ChannelVolumes;

pub struct DeviceIo<D: Direction> {
    index: u32,
    pub(crate) state: DeviceState,
    flags: DeviceFlags,
    pub(crate) spec: SampleSpec,
    pub(crate) map: ChannelMap,
    driver: Box<dyn IoDriver>,
    pub(crate) streams: BTreeMap<u32, Box<StreamIo>>,
    pub(crate) soft_volume: ChannelVolumes,
    pub(crate) soft_muted: bool,
    /// `None` when it has to be recomputed.
    requested_latency: Option<Option<u64>>,
    latency_range: LatencyRange,
    fixed_latency: u64,
    max_rewind: usize,
    max_request: usize,
    rewind_nbytes: usize,
    rewind_requested: bool,
    port_latency_offset: i64,
    volume_changes: VolumeChangeQueue,
    pub(crate) current_hw_volume: ChannelVolumes,
    clock: Arc<dyn Clock>,
    posted: Sender<PostedMsg>,
    stats: IoStats,
    _direction: PhantomData<D>,
}

/// Construction parameters for [`DeviceIo`].
pub(crate) struct DeviceIoParams {
    pub index: u32,
    pub flags: DeviceFlags,
    pub spec: SampleSpec,
    pub map: ChannelMap,
    pub driver: Box<dyn IoDriver>,
    pub clock: Arc<dyn Clock>,
    pub posted: Sender<PostedMsg>,
    pub safety_margin_usec: u64,
    pub extra_delay_usec: i64,
    pub hw_volume: ChannelVolumes,
}

impl<D: Direction> DeviceIo<D> {
    pub(crate) fn new(params: DeviceIoParams) -> Self {
        Self {
            index: params.index,
            state: DeviceState::Init,
            flags: params.flags,
            spec: params.spec,
            map: params.map,
            driver: params.driver,
            streams: BTreeMap::new(),
            soft_volume: ChannelVolumes::norm(params.spec.channels),
            soft_muted: false,
            requested_latency: None,
            latency_range: LatencyRange::default(),
            fixed_latency: DEFAULT_FIXED_LATENCY,
            max_rewind: 0,
            max_request: 0,
            rewind_nbytes: 0,
            rewind_requested: false,
            port_latency_offset: 0,
            volume_changes: VolumeChangeQueue::new(params.safety_margin_usec, params.extra_delay_usec),
            current_hw_volume: params.hw_volume,
            clock: params.clock,
            posted: params.posted,
            stats: IoStats::default(),
            _direction: PhantomData,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn set_flags(&mut self, flags: DeviceFlags) {
        self.flags = flags;
    }

    fn stream_mut(&mut self, index: u32) -> RoutingResult<&mut StreamIo> {
        self.streams
            .get_mut(&index)
            .map(|io| io.as_mut())
            .ok_or(RoutingError::NoEntity("stream on device thread"))
    }

    pub(crate) fn handle(&mut self, msg: DeviceMsg) -> RoutingResult<Reply> {
        self.stats.messages += 1;
        match msg {
            DeviceMsg::AddStream(io) => {
                self.add_stream(io);
                Ok(Reply::Done)
            }
            DeviceMsg::RemoveStream(index) => self.remove_stream(index).map(Reply::Stream),
            DeviceMsg::StartMove(index) => self.start_move(index).map(Reply::Stream),
            DeviceMsg::FinishMove(io) => {
                self.finish_move(io);
                Ok(Reply::Done)
            }
            DeviceMsg::SetState { state, cause } => {
                self.set_state(state, cause)?;
                Ok(Reply::Done)
            }
            DeviceMsg::SetSpec { spec, map } => {
                self.spec = spec;
                self.map = map;
                Ok(Reply::Done)
            }
            DeviceMsg::SetVolume(update) => {
                self.set_volume(update, true);
                Ok(Reply::Done)
            }
            DeviceMsg::SyncVolumes(update) => {
                self.set_volume(update, false);
                Ok(Reply::Done)
            }
            DeviceMsg::GetVolume => Ok(Reply::Volume(self.read_volume())),
            DeviceMsg::SetMute { muted } => {
                if self.soft_muted != muted {
                    self.soft_muted = muted;
                    self.request_rewind(None);
                }
                if self.flags.contains(DeviceFlags::DEFERRED_VOLUME) {
                    self.driver.write_mute(muted);
                }
                Ok(Reply::Done)
            }
            DeviceMsg::GetMute => {
                let muted = if self.flags.contains(DeviceFlags::DEFERRED_VOLUME) {
                    self.driver.read_mute()
                } else {
                    None
                };
                Ok(Reply::Mute(muted))
            }
            DeviceMsg::SetStreamState { stream, state } => {
                let max_rewind = self.max_rewind;
                let request = self.stream_mut(stream)?.set_state(state, max_rewind);
                self.apply_stream_rewind(request);
                Ok(Reply::Done)
            }
            DeviceMsg::SetStreamSoftVolume {
                stream,
                soft_volume,
                volume_factor_device,
            } => {
                let max_rewind = self.max_rewind;
                let io = self.stream_mut(stream)?;
                io.volume_factor_device = volume_factor_device;
                if io.soft_volume != soft_volume {
                    io.soft_volume = soft_volume;
                    let request = io.request_rewind(0, true, false, false, max_rewind);
                    self.apply_stream_rewind(request);
                }
                Ok(Reply::Done)
            }
            DeviceMsg::SetStreamMute { stream, muted } => {
                let max_rewind = self.max_rewind;
                let io = self.stream_mut(stream)?;
                if io.muted != muted {
                    io.muted = muted;
                    let request = io.request_rewind(0, true, false, false, max_rewind);
                    self.apply_stream_rewind(request);
                }
                Ok(Reply::Done)
            }
            DeviceMsg::SetStreamRate { stream, rate } => {
                let io = self.stream_mut(stream)?;
                io.spec.rate = rate;
                if let Some(resampler) = io.resampler.as_mut() {
                    match D::KIND {
                        crate::direction::DirectionKind::Playback => resampler.set_input_rate(rate),
                        crate::direction::DirectionKind::Capture => resampler.set_output_rate(rate),
                    }
                }
                Ok(Reply::Done)
            }
            DeviceMsg::SetStreamRequestedLatency { stream, usec } => {
                let usec = self.set_stream_requested_latency(stream, usec)?;
                Ok(Reply::OptUsec(usec))
            }
            DeviceMsg::GetStreamRequestedLatency { stream } => {
                Ok(Reply::OptUsec(self.stream_mut(stream)?.requested_latency))
            }
            DeviceMsg::UpdateStreamResampler {
                stream,
                resampler,
                device_spec,
                volume_factor_device,
            } => {
                let max_rewind = self.max_rewind;
                let io = self.stream_mut(stream)?;
                io.replace_resampler(resampler, device_spec, volume_factor_device);
                io.update_max_rewind(max_rewind);
                Ok(Reply::Done)
            }
            DeviceMsg::RequestStreamRewind {
                stream,
                nbytes,
                rewrite,
                flush,
                dont_rewind_render,
            } => {
                let max_rewind = self.max_rewind;
                let request = self
                    .stream_mut(stream)?
                    .request_rewind(nbytes, rewrite, flush, dont_rewind_render, max_rewind);
                self.apply_stream_rewind(request);
                Ok(Reply::Done)
            }
            DeviceMsg::GetRequestedLatency => {
                let usec = self.requested_latency().unwrap_or(self.latency_range.max);
                Ok(Reply::Usec(usec))
            }
            DeviceMsg::SetLatencyRange(range) => {
                self.latency_range = range;
                self.invalidate_requested_latency(false);
                Ok(Reply::Done)
            }
            DeviceMsg::GetLatencyRange => Ok(Reply::Range(self.latency_range)),
            DeviceMsg::SetFixedLatency(usec) => {
                self.fixed_latency = usec;
                self.invalidate_requested_latency(false);
                Ok(Reply::Done)
            }
            DeviceMsg::GetFixedLatency => Ok(Reply::Usec(self.fixed_latency)),
            DeviceMsg::SetMaxRewind(nbytes) => {
                self.max_rewind = nbytes;
                for io in self.streams.values_mut() {
                    io.update_max_rewind(nbytes);
                }
                Ok(Reply::Done)
            }
            DeviceMsg::GetMaxRewind => Ok(Reply::Bytes(self.max_rewind)),
            DeviceMsg::SetMaxRequest(nbytes) => {
                self.max_request = nbytes;
                for io in self.streams.values_mut() {
                    io.update_max_request(nbytes);
                }
                Ok(Reply::Done)
            }
            DeviceMsg::GetMaxRequest => Ok(Reply::Bytes(self.max_request)),
            DeviceMsg::SetPortLatencyOffset(offset) => {
                self.port_latency_offset = offset;
                Ok(Reply::Done)
            }
            DeviceMsg::GetLatency => {
                let usec = if self.state == DeviceState::Suspended
                    || !self.flags.contains(DeviceFlags::LATENCY)
                {
                    0
                } else {
                    (self.driver.latency_usec() + self.port_latency_offset).max(0)
                };
                Ok(Reply::Latency(usec))
            }
            DeviceMsg::Process(block) => D::process_block(self, block),
            DeviceMsg::Stats => Ok(Reply::Stats(self.stats.clone())),
            DeviceMsg::Shutdown => Ok(Reply::Done),
        }
    }

    /// Logs a failed posted request; resource failures also reach the
    /// control context.
    pub(crate) fn report(&self, request: &'static str, err: RoutingError) {
        if err.is_resource_failure() {
            tracing::warn!(device = self.index, request, %err, "realtime request failed");
            self.post(PostedMsg::DriverFailure {
                facility: D::DEVICE_FACILITY,
                index: self.index,
                message: err.to_string(),
            });
        } else {
            tracing::debug!(device = self.index, request, %err, "realtime request refused");
        }
    }

    fn post(&self, msg: PostedMsg) {
        if self.posted.send(msg).is_err() {
            tracing::trace!(device = self.index, "control context gone, dropping notification");
        }
    }

    /// Applies due deferred volume changes and polls the driver for
    /// hardware changes. Runs before every request.
    pub(crate) fn tick(&mut self) {
        self.apply_volume_changes();
        if self.driver.poll_hw_change() {
            self.post(PostedMsg::UpdateVolumeAndMute {
                kind: D::KIND,
                device: self.index,
            });
        }
    }

    /// Microseconds until the next deferred volume change is due.
    pub(crate) fn next_wakeup(&self) -> Option<u64> {
        let at = self.volume_changes.next_at()?;
        Some(at.saturating_sub(self.clock.now_usec()))
    }

    pub fn pending_volume_changes(&self) -> usize {
        self.volume_changes.len()
    }

    fn apply_volume_changes(&mut self) {
        if self.volume_changes.is_empty() {
            return;
        }
        let now = self.clock.now_usec();
        if let Some(hw) = self.volume_changes.apply(now) {
            tracing::debug!(device = self.index, volume = hw.avg().0, "writing deferred hardware volume");
            self.driver.write_volume(&hw);
            self.current_hw_volume = hw;
            self.stats.hw_volume_writes += 1;
        }
    }

    fn latency_within_thread(&mut self) -> u64 {
        let usec = self.driver.latency_usec() + self.port_latency_offset;
        usec.max(0) as u64
    }

    fn set_state(&mut self, state: DeviceState, cause: SuspendCause) -> RoutingResult<()> {
        let suspend_change = (self.state == DeviceState::Suspended && state.is_opened())
            || (self.state.is_opened() && state == DeviceState::Suspended);
        self.driver.set_state(state, cause)?;
        self.state = state;
        if state == DeviceState::Suspended {
            self.rewind_nbytes = 0;
            self.rewind_requested = false;
        }
        if suspend_change {
            let suspended = state == DeviceState::Suspended;
            for io in self.streams.values_mut() {
                io.render.suspend(suspended);
            }
        }
        Ok(())
    }

    fn set_volume(&mut self, update: VolumeUpdate, write_hw: bool) {
        if write_hw && self.flags.contains(DeviceFlags::DEFERRED_VOLUME) {
            let hw = update.real_volume.divide(&update.soft_volume);
            let latency = self.latency_within_thread();
            let now = self.clock.now_usec();
            self.volume_changes.push(hw, &self.current_hw_volume, latency, now);
            self.apply_volume_changes();
        }
        if self.soft_volume != update.soft_volume {
            self.soft_volume = update.soft_volume;
            self.request_rewind(None);
        }
        let max_rewind = self.max_rewind;
        for (stream, soft_volume) in update.stream_soft_volumes {
            let Some(io) = self.streams.get_mut(&stream) else {
                continue;
            };
            if io.soft_volume != soft_volume {
                io.soft_volume = soft_volume;
                let request = io.request_rewind(0, true, false, false, max_rewind);
                self.apply_stream_rewind(request);
            }
        }
    }

    fn read_volume(&mut self) -> Option<ChannelVolumes> {
        if !self.flags.contains(DeviceFlags::DEFERRED_VOLUME) {
            return None;
        }
        let hw = self.driver.read_volume()?;
        self.volume_changes.flush();
        let real = hw.multiply(&self.soft_volume);
        self.current_hw_volume = hw;
        Some(real)
    }

    fn add_stream(&mut self, mut io: Box<StreamIo>) {
        io.render.attach();
        io.render.state_change(io.state);
        let index = io.index;
        let latency = io.requested_latency;
        io.update_max_rewind(self.max_rewind);
        io.update_max_request(self.max_request);
        self.streams.insert(index, io);
        if latency.is_some() {
            // cannot fail, the stream was just inserted
            let _ = self.set_stream_requested_latency(index, latency);
        }
        self.invalidate_requested_latency(true);
    }

    fn remove_stream(&mut self, index: u32) -> RoutingResult<Box<StreamIo>> {
        let mut io = self
            .streams
            .remove(&index)
            .ok_or(RoutingError::NoEntity("stream on device thread"))?;
        io.render.detach();
        self.invalidate_requested_latency(true);
        self.request_rewind(None);
        Ok(io)
    }

    fn start_move(&mut self, index: u32) -> RoutingResult<Box<StreamIo>> {
        let latency = self.latency_within_thread();
        let mut io = self
            .streams
            .remove(&index)
            .ok_or(RoutingError::NoEntity("stream on device thread"))?;
        if !io.is_corked() {
            let device_bytes = self.spec.usec_to_bytes(latency);
            let total = device_bytes + io.render_queue.length();
            if total > 0 {
                // everything still in flight gets rendered again on the new device
                io.rewrite = crate::stream::io::Rewrite::Bytes(io.to_stream_domain(total));
                io.rewrite_flush = true;
                io.process_rewind(device_bytes);
            }
        }
        io.render.detach();
        self.invalidate_requested_latency(true);
        self.request_rewind(None);
        Ok(io)
    }

    fn finish_move(&mut self, mut io: Box<StreamIo>) {
        io.render.attach();
        let index = io.index;
        let corked = io.is_corked();
        let latency = io.requested_latency;
        io.update_max_rewind(self.max_rewind);
        io.update_max_request(self.max_request);
        if !corked {
            let usec = if self.flags.contains(DeviceFlags::LATENCY) {
                self.latency_within_thread()
            } else {
                0
            };
            let nbytes = self.spec.usec_to_bytes(usec);
            if nbytes > 0 {
                io.drop_bytes(nbytes);
            }
            self.streams.insert(index, io);
            self.request_rewind(Some(nbytes));
        } else {
            self.streams.insert(index, io);
        }
        if latency.is_some() {
            let _ = self.set_stream_requested_latency(index, latency);
        }
        self.invalidate_requested_latency(true);
    }

    fn set_stream_requested_latency(&mut self, stream: u32, usec: Option<u64>) -> RoutingResult<Option<u64>> {
        let effective = usec.map(|usec| {
            if self.flags.contains(DeviceFlags::DYNAMIC_LATENCY) {
                self.latency_range.clamp(usec)
            } else {
                self.fixed_latency
            }
        });
        self.stream_mut(stream)?.requested_latency = effective;
        self.invalidate_requested_latency(true);
        Ok(effective)
    }

    /// Effective requested latency: the smallest stream request for dynamic
    /// devices, the fixed latency otherwise.
    pub(crate) fn requested_latency(&mut self) -> Option<u64> {
        if !self.flags.contains(DeviceFlags::DYNAMIC_LATENCY) {
            return Some(self.latency_range.clamp(self.fixed_latency));
        }
        if let Some(cached) = self.requested_latency {
            return cached;
        }
        let result = combine_requests(
            self.streams.values().map(|io| io.requested_latency),
            &self.latency_range,
        );
        if self.state.is_linked() {
            self.requested_latency = Some(result);
        }
        result
    }

    fn invalidate_requested_latency(&mut self, dynamic_only: bool) {
        if dynamic_only && !self.flags.contains(DeviceFlags::DYNAMIC_LATENCY) {
            return;
        }
        self.requested_latency = None;
        if self.state.is_linked() {
            let usec = self.requested_latency();
            self.driver.update_requested_latency(usec);
        }
    }

    /// Asks for `nbytes` of already rendered audio to be rewound before the
    /// next render. `None` means as much as possible.
    pub(crate) fn request_rewind(&mut self, nbytes: Option<usize>) {
        if self.state == DeviceState::Suspended {
            return;
        }
        let nbytes = nbytes.unwrap_or(self.max_rewind).min(self.max_rewind);
        if self.rewind_requested && nbytes <= self.rewind_nbytes {
            return;
        }
        tracing::trace!(device = self.index, nbytes, "rewind requested");
        self.rewind_nbytes = nbytes;
        self.rewind_requested = true;
    }

    fn apply_stream_rewind(&mut self, request: Option<RewindRequest>) {
        if let Some(RewindRequest(nbytes)) = request {
            self.request_rewind(Some(nbytes));
        }
    }

    fn process_pending_rewind(&mut self) {
        if !self.rewind_requested {
            return;
        }
        let wanted = self.rewind_nbytes;
        let done = if wanted > 0 { self.driver.rewind(wanted) } else { 0 };
        self.process_rewind(done);
    }

    /// Rewinds every attached stream by `nbytes` of device-domain audio.
    pub(crate) fn process_rewind(&mut self, nbytes: usize) {
        self.rewind_nbytes = 0;
        self.rewind_requested = false;
        if nbytes > 0 {
            tracing::debug!(device = self.index, nbytes, "processing rewind");
            self.stats.rewinds += 1;
            if self.flags.contains(DeviceFlags::DEFERRED_VOLUME) {
                let rewound = self.spec.bytes_to_usec(nbytes);
                let latency = self.latency_within_thread();
                let now = self.clock.now_usec();
                self.volume_changes
                    .rewind(rewound, &self.current_hw_volume, latency, now);
                self.apply_volume_changes();
            }
        }
        for io in self.streams.values_mut() {
            io.process_rewind(nbytes);
        }
    }

    fn is_passthrough(&self) -> bool {
        self.streams.len() == 1 && self.streams.values().all(|io| io.passthrough)
    }

    /// Mixes `nbytes` of audio from the attached streams.
    pub(crate) fn render(&mut self, nbytes: usize) -> Vec<u8> {
        self.process_pending_rewind();
        let mut length = self.spec.frame_align(nbytes).max(self.spec.frame_size());
        if !self.state.is_opened() {
            return silence(&self.spec, length);
        }

        let mut chunks = Vec::with_capacity(self.streams.len());
        let mut underruns = Vec::new();
        for (index, io) in self.streams.iter_mut() {
            let peeked = io.peek(length);
            if peeked.underrun {
                underruns.push(*index);
            }
            if !peeked.data.is_empty() {
                length = length.min(peeked.data.len());
            }
            chunks.push(peeked.data);
        }
        let length = self.spec.frame_align(length);

        let out = if self.is_passthrough() {
            let mut data = chunks.pop().unwrap_or_default();
            data.truncate(length);
            data
        } else {
            let unity = ChannelVolumes::norm(self.spec.channels);
            let inputs: Vec<MixInput<'_>> = chunks
                .iter()
                .map(|data| MixInput {
                    data,
                    volume: &unity,
                })
                .collect();
            mix(&inputs, &self.spec, length, &self.soft_volume, self.soft_muted)
        };

        for io in self.streams.values_mut() {
            io.drop_bytes(length);
        }
        for stream in underruns {
            self.stats.underruns += 1;
            self.post(PostedMsg::StreamUnderrun {
                kind: D::KIND,
                stream,
            });
        }
        self.stats.rendered_bytes += out.len() as u64;
        out
    }

    /// Distributes captured audio to the attached streams.
    pub(crate) fn post_captured(&mut self, data: &[u8]) {
        self.process_pending_rewind();
        if !self.state.is_opened() {
            return;
        }
        let length = self.spec.frame_align(data.len());
        let mut chunk = data[..length].to_vec();
        if self.soft_muted {
            chunk = silence(&self.spec, length);
        } else {
            apply_volume(&mut chunk, &self.spec, &self.soft_volume);
        }
        for io in self.streams.values_mut() {
            if io.direct_on_input.is_some() {
                continue;
            }
            io.push(&chunk);
        }
        self.stats.captured_bytes += length as u64;
    }

    pub(crate) fn stream_state(&self, index: u32) -> Option<StreamState> {
        self.streams.get(&index).map(|io| io.state)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crossbeam_channel::unbounded;
    use parking_lot::Mutex;

    use super::*;
    use crate::clock::ManualClock;
    use crate::direction::{DirectionKind, Playback};
    use crate::driver::{NullDriver, StreamRender};
    use crate::sample::SampleFormat;
    use crate::volume::Volume;

    #[derive(Clone, Default)]
    struct HwLog {
        writes: Arc<Mutex<Vec<ChannelVolumes>>>,
    }

    impl IoDriver for HwLog {
        fn latency_usec(&mut self) -> i64 {
            20_000
        }

        fn write_volume(&mut self, hw: &ChannelVolumes) {
            self.writes.lock().push(hw.clone());
        }

        fn rewind(&mut self, nbytes: usize) -> usize {
            nbytes
        }
    }

    struct Tone;

    impl StreamRender for Tone {
        fn pop(&mut self, nbytes: usize) -> Option<Vec<u8>> {
            Some(
                std::iter::repeat(0x2000i16.to_le_bytes())
                    .take(nbytes / 2)
                    .flatten()
                    .collect(),
            )
        }
    }

    fn spec() -> SampleSpec {
        SampleSpec::new(SampleFormat::S16Le, 48_000, 2)
    }

    fn device(driver: Box<dyn IoDriver>, flags: DeviceFlags, clock: &ManualClock) -> DeviceIo<Playback> {
        let (posted, _) = unbounded();
        let mut io = DeviceIo::new(DeviceIoParams {
            index: 0,
            flags,
            spec: spec(),
            map: ChannelMap::stereo(),
            driver,
            clock: Arc::new(clock.clone()),
            posted,
            safety_margin_usec: 1_000,
            extra_delay_usec: 0,
            hw_volume: ChannelVolumes::norm(2),
        });
        io.state = DeviceState::Idle;
        io
    }

    fn stream(index: u32, state: StreamState) -> Box<StreamIo> {
        let mut io = StreamIo::new(index, DirectionKind::Playback, spec(), spec(), None, Box::new(Tone), 0);
        io.state = state;
        Box::new(io)
    }

    fn level(fraction: f64) -> ChannelVolumes {
        ChannelVolumes::uniform(2, Volume::from_fraction(fraction))
    }

    #[test]
    fn deferred_volume_is_written_when_due() {
        let clock = ManualClock::new(0);
        let hw = HwLog::default();
        let writes = Arc::clone(&hw.writes);
        let mut io = device(Box::new(hw), DeviceFlags::DEFERRED_VOLUME, &clock);

        io.handle(DeviceMsg::SetVolume(VolumeUpdate {
            soft_volume: ChannelVolumes::norm(2),
            real_volume: level(0.5),
            stream_soft_volumes: Vec::new(),
        }))
        .unwrap();
        // a decrease lands a safety margin before the latency
        assert_eq!(io.next_wakeup(), Some(19_000));
        assert!(writes.lock().is_empty());

        clock.set(19_000);
        io.tick();
        assert_eq!(*writes.lock(), vec![level(0.5)]);
        assert_eq!(io.current_hw_volume, level(0.5));
    }

    #[test]
    fn render_mixes_running_streams_and_skips_corked_ones() {
        let clock = ManualClock::new(0);
        let mut io = device(Box::new(NullDriver), DeviceFlags::empty(), &clock);
        io.handle(DeviceMsg::AddStream(stream(1, StreamState::Running))).unwrap();
        io.handle(DeviceMsg::AddStream(stream(2, StreamState::Corked))).unwrap();
        let out = io.render(16);
        assert_eq!(out.len(), 16);
        assert_ne!(out, vec![0; 16]);

        io.handle(DeviceMsg::SetStreamState {
            stream: 1,
            state: StreamState::Corked,
        })
        .unwrap();
        assert_eq!(io.render(16), vec![0; 16]);
    }

    #[test]
    fn suspended_devices_ignore_rewind_requests() {
        let clock = ManualClock::new(0);
        let mut io = device(Box::new(NullDriver), DeviceFlags::empty(), &clock);
        io.handle(DeviceMsg::SetMaxRewind(1024)).unwrap();
        io.request_rewind(None);
        assert!(io.rewind_requested);
        io.handle(DeviceMsg::SetState {
            state: DeviceState::Suspended,
            cause: SuspendCause::USER,
        })
        .unwrap();
        assert!(!io.rewind_requested);
        io.request_rewind(Some(64));
        assert!(!io.rewind_requested);
    }

    #[test]
    fn requested_latency_is_the_smallest_clamped_request() {
        let clock = ManualClock::new(0);
        let mut io = device(Box::new(NullDriver), DeviceFlags::DYNAMIC_LATENCY, &clock);
        io.handle(DeviceMsg::SetLatencyRange(LatencyRange::bounded(5_000, 100_000)))
            .unwrap();
        assert_eq!(io.requested_latency(), None);
        io.handle(DeviceMsg::AddStream(stream(1, StreamState::Running))).unwrap();
        io.handle(DeviceMsg::AddStream(stream(2, StreamState::Running))).unwrap();
        io.handle(DeviceMsg::SetStreamRequestedLatency {
            stream: 1,
            usec: Some(40_000),
        })
        .unwrap();
        let reply = io
            .handle(DeviceMsg::SetStreamRequestedLatency {
                stream: 2,
                usec: Some(1_000),
            })
            .unwrap();
        assert_eq!(reply.into_opt_usec().unwrap(), Some(5_000));
        assert_eq!(io.requested_latency(), Some(5_000));
    }
}
