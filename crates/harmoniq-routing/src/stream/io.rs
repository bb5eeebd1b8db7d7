//! The realtime half of a stream.
//!
//! A [`StreamIo`] is owned by exactly one context at a time: the device
//! thread while the stream is attached, the control-side [`super::Stream`]
//! while it is being created, moved or torn down.

use crate::direction::DirectionKind;
use crate::driver::StreamRender;
use crate::mix::{apply_volume, silence};
use crate::render_queue::RenderQueue;
use crate::resampler::Resampler;
use crate::sample::SampleSpec;
use crate::stream::StreamState;
use crate::volume::ChannelVolumes;

/// How much already rendered audio must be regenerated on the next rewind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rewrite {
    Bytes(usize),
    #[default]
    None,
    /// Drop everything queued and render from scratch.
    All,
}

pub struct StreamIo {
    pub(crate) index: u32,
    pub(crate) kind: DirectionKind,
    pub(crate) state: StreamState,
    pub(crate) spec: SampleSpec,
    pub(crate) device_spec: SampleSpec,
    pub(crate) soft_volume: ChannelVolumes,
    pub(crate) volume_factor_device: ChannelVolumes,
    pub(crate) muted: bool,
    pub(crate) passthrough: bool,
    pub(crate) direct_on_input: Option<u32>,
    pub(crate) requested_latency: Option<u64>,
    pub(crate) resampler: Option<Box<dyn Resampler>>,
    /// Device-domain audio already converted but not yet handed out.
    pub(crate) render_queue: RenderQueue,
    pub(crate) render: Box<dyn StreamRender>,
    pub(crate) rewrite: Rewrite,
    pub(crate) rewrite_flush: bool,
    pub(crate) dont_rewind_render: bool,
    /// Stream-domain bytes handed out since the last underrun.
    pub(crate) playing_for: u64,
    /// Stream-domain bytes of silence since the last real data. `None`
    /// until the stream produced anything.
    pub(crate) underrun_for: Option<u64>,
    pub(crate) underrun_for_device: u64,
}

impl std::fmt::Debug for StreamIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamIo")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("spec", &self.spec)
            .field("device_spec", &self.device_spec)
            .field("resampling", &self.resampler.is_some())
            .field("queued", &self.render_queue.length())
            .finish_non_exhaustive()
    }
}

/// Device-domain bytes the device has to rewind on behalf of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RewindRequest(pub usize);

impl StreamIo {
    pub(crate) fn new(
        index: u32,
        kind: DirectionKind,
        spec: SampleSpec,
        device_spec: SampleSpec,
        resampler: Option<Box<dyn Resampler>>,
        render: Box<dyn StreamRender>,
        max_rewind: usize,
    ) -> Self {
        Self {
            index,
            kind,
            state: StreamState::Init,
            spec,
            device_spec,
            soft_volume: ChannelVolumes::norm(spec.channels),
            volume_factor_device: ChannelVolumes::norm(device_spec.channels),
            muted: false,
            passthrough: false,
            direct_on_input: None,
            requested_latency: None,
            resampler,
            render_queue: RenderQueue::new(&device_spec, max_rewind),
            render,
            rewrite: Rewrite::None,
            rewrite_flush: false,
            dont_rewind_render: false,
            playing_for: 0,
            underrun_for: None,
            underrun_for_device: 0,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_corked(&self) -> bool {
        self.state == StreamState::Corked
    }

    pub fn playing_for(&self) -> u64 {
        self.playing_for
    }

    pub fn underrun_for(&self) -> Option<u64> {
        self.underrun_for
    }

    pub fn queued(&self) -> usize {
        self.render_queue.length()
    }

    /// Converts a device-domain byte count into the stream's domain.
    pub(crate) fn to_stream_domain(&self, device_bytes: usize) -> usize {
        match (&self.resampler, self.kind) {
            (None, _) => device_bytes,
            (Some(r), DirectionKind::Playback) => r.request(device_bytes),
            (Some(r), DirectionKind::Capture) => r.result(device_bytes),
        }
    }

    /// Converts a stream-domain byte count into the device's domain.
    pub(crate) fn to_device_domain(&self, stream_bytes: usize) -> usize {
        match (&self.resampler, self.kind) {
            (None, _) => stream_bytes,
            (Some(r), DirectionKind::Playback) => r.result(stream_bytes),
            (Some(r), DirectionKind::Capture) => r.request(stream_bytes),
        }
    }

    /// Returns up to `nbytes` of device-domain audio without consuming it.
    /// Pulls from the driver until something is readable; a corked or
    /// starved stream yields silence.
    pub(crate) fn peek(&mut self, nbytes: usize) -> PeekResult {
        let nbytes = self.device_spec.frame_align(nbytes).max(self.device_spec.frame_size());
        let mut underrun = false;
        while !self.render_queue.is_readable() {
            let mut want = self.to_stream_domain(nbytes);
            if let Some(r) = &self.resampler {
                want = want.min(r.max_block_size());
            }
            let want = self.spec.frame_align(want).max(self.spec.frame_size());

            let corked = self.is_corked();
            let chunk = if corked { None } else { self.render.pop(want) };
            let Some(mut chunk) = chunk.filter(|c| !c.is_empty()) else {
                self.render_queue.seek(nbytes as i64);
                self.playing_for = 0;
                if let Some(silent) = self.underrun_for.as_mut() {
                    if *silent == 0 && !corked {
                        underrun = true;
                    }
                    *silent += want as u64;
                    self.underrun_for_device += nbytes as u64;
                }
                break;
            };

            self.underrun_for = Some(0);
            self.underrun_for_device = 0;
            self.playing_for += chunk.len() as u64;

            if !self.passthrough {
                if self.muted {
                    chunk = silence(&self.spec, chunk.len());
                } else {
                    apply_volume(&mut chunk, &self.spec, &self.soft_volume);
                }
            }
            let mut converted = match self.resampler.as_mut() {
                Some(r) => r.run(&chunk),
                None => chunk,
            };
            if !self.passthrough {
                apply_volume(&mut converted, &self.device_spec, &self.volume_factor_device);
            }
            self.render_queue.push(&converted);
        }

        if underrun {
            self.render.underrun();
        }
        PeekResult {
            data: self.render_queue.peek(nbytes).unwrap_or_default(),
            underrun,
        }
    }

    /// Consumes `nbytes` of device-domain audio after a peek.
    pub(crate) fn drop_bytes(&mut self, nbytes: usize) {
        self.render_queue.drop_bytes(nbytes);
    }

    /// Hands captured device-domain audio to the stream, converted into its
    /// own format.
    pub(crate) fn push(&mut self, data: &[u8]) {
        if self.is_corked() || data.is_empty() {
            return;
        }
        let mut chunk = data.to_vec();
        if !self.passthrough {
            apply_volume(&mut chunk, &self.device_spec, &self.volume_factor_device);
        }
        let mut converted = match self.resampler.as_mut() {
            Some(r) => r.run(&chunk),
            None => chunk,
        };
        if !self.passthrough {
            if self.muted {
                converted = silence(&self.spec, converted.len());
            } else {
                apply_volume(&mut converted, &self.spec, &self.soft_volume);
            }
        }
        self.playing_for += converted.len() as u64;
        self.render.push(&converted);
    }

    /// Rewinds `nbytes` of device-domain audio, then regenerates whatever a
    /// previous [`StreamIo::request_rewind`] asked to rewrite.
    pub(crate) fn process_rewind(&mut self, nbytes: usize) {
        let queued = self.render_queue.length();
        if nbytes > 0 && !self.dont_rewind_render {
            self.render_queue.rewind(nbytes);
        }

        let mut called = false;
        match self.rewrite {
            Rewrite::All => {
                self.render_queue.flush_write();
            }
            Rewrite::Bytes(wanted) if wanted > 0 => {
                let mut max_rewrite = nbytes;
                if nbytes > 0 {
                    max_rewrite += queued;
                }
                let max_rewrite = self.to_stream_domain(max_rewrite);
                let amount = wanted.min(max_rewrite);
                if amount > 0 {
                    tracing::trace!(stream = self.index, amount, "rewriting stream audio");
                    self.render.process_rewind(amount);
                    called = true;
                    let device_amount = self.to_device_domain(amount);
                    self.render_queue.seek(-(device_amount as i64));
                    if self.rewrite_flush {
                        self.render_queue.silence();
                    }
                    if let Some(r) = self.resampler.as_mut() {
                        r.rewind(device_amount);
                    }
                }
            }
            _ => {}
        }

        if !called {
            self.render.process_rewind(0);
        }
        self.rewrite = Rewrite::None;
        self.rewrite_flush = false;
        self.dont_rewind_render = false;
    }

    /// Records a rewind request in the stream's own domain. `nbytes == 0`
    /// asks for as much as the device can give back. Returns the amount the
    /// device itself has to rewind, or `None` while corked.
    pub(crate) fn request_rewind(
        &mut self,
        nbytes: usize,
        rewrite: bool,
        flush: bool,
        dont_rewind_render: bool,
        device_max_rewind: usize,
    ) -> Option<RewindRequest> {
        if self.is_corked() {
            return None;
        }
        let queued = if rewrite { self.render_queue.length() } else { 0 };
        let mut nbytes = match (nbytes, self.rewrite) {
            (n, Rewrite::Bytes(pending)) => n.max(pending),
            (n, _) => n,
        };
        if nbytes == 0 {
            nbytes = self.to_stream_domain(device_max_rewind + queued);
        }

        if self.rewrite != Rewrite::All {
            self.rewrite = if rewrite {
                nbytes = nbytes.min(self.playing_for as usize);
                Rewrite::Bytes(nbytes)
            } else {
                Rewrite::All
            };
        }
        self.rewrite_flush |= flush;
        self.dont_rewind_render |= dont_rewind_render;

        let device_bytes = self.to_device_domain(nbytes);
        Some(RewindRequest(device_bytes.saturating_sub(queued)))
    }

    /// Applies a state change on the realtime side. Corking rewrites what is
    /// queued with silence; uncorking restarts the underrun bookkeeping.
    pub(crate) fn set_state(&mut self, state: StreamState, device_max_rewind: usize) -> Option<RewindRequest> {
        let mut request = None;
        let corking = state == StreamState::Corked && self.state != StreamState::Corked;
        let uncorking = self.state == StreamState::Corked && state != StreamState::Corked;
        if corking {
            request = self.request_rewind(0, true, true, false, device_max_rewind);
        }
        self.state = state;
        if uncorking {
            self.underrun_for = None;
            self.underrun_for_device = 0;
            request = self.request_rewind(0, false, true, true, device_max_rewind);
        }
        self.render.state_change(state);
        request
    }

    pub(crate) fn update_max_rewind(&mut self, device_bytes: usize) {
        self.render_queue.set_max_rewind(device_bytes);
        let stream_bytes = self.to_stream_domain(device_bytes);
        self.render.update_max_rewind(stream_bytes);
    }

    pub(crate) fn update_max_request(&mut self, device_bytes: usize) {
        let stream_bytes = self.to_stream_domain(device_bytes);
        self.render.update_max_request(stream_bytes);
    }

    pub(crate) fn replace_resampler(
        &mut self,
        resampler: Option<Box<dyn Resampler>>,
        device_spec: SampleSpec,
        volume_factor_device: ChannelVolumes,
    ) {
        let max_rewind = self.render_queue.max_rewind();
        self.resampler = resampler;
        self.device_spec = device_spec;
        self.volume_factor_device = volume_factor_device;
        self.render_queue = RenderQueue::new(&device_spec, max_rewind);
    }
}

pub(crate) struct PeekResult {
    pub data: Vec<u8>,
    /// The stream just started to starve.
    pub underrun: bool,
}
