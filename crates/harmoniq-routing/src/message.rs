//! Typed requests between the control context and a device's realtime
//! thread.
//!
//! `send` is a blocking round trip over a bounded(1) reply channel, `post`
//! is fire-and-forget. Before a device is put its realtime state is not yet
//! running on a thread, so requests are handled inline on the caller's
//! thread with the same handler.

use std::marker::PhantomData;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendError, Sender};
use serde::Serialize;

use crate::device::io::DeviceIo;
use crate::device::{DeviceState, SuspendCause};
use crate::direction::{Direction, DirectionKind};
use crate::error::{RoutingError, RoutingResult};
use crate::hooks::Facility;
use crate::latency::LatencyRange;
use crate::resampler::Resampler;
use crate::sample::{ChannelMap, SampleSpec};
use crate::stream::{StreamIo, StreamState};
use crate::volume::ChannelVolumes;

/// Longest the realtime loop sleeps while deferred volume changes are
/// pending.
const MAX_IDLE_WAIT_USEC: u64 = 1_000_000;

/// One driver tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoBlock {
    /// Mix `nbytes` of device-format audio from the attached streams.
    Render(usize),
    /// Distribute captured device-format audio to the attached streams.
    Capture(Vec<u8>),
}

/// Volumes a device thread applies in one step: its own soft volume and the
/// soft volume of every attached stream.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeUpdate {
    pub soft_volume: ChannelVolumes,
    pub real_volume: ChannelVolumes,
    pub stream_soft_volumes: Vec<(u32, ChannelVolumes)>,
}

pub enum DeviceMsg {
    AddStream(Box<StreamIo>),
    RemoveStream(u32),
    StartMove(u32),
    FinishMove(Box<StreamIo>),
    SetState {
        state: DeviceState,
        cause: SuspendCause,
    },
    SetSpec {
        spec: SampleSpec,
        map: ChannelMap,
    },
    /// New volumes including a hardware write for deferred-volume devices.
    SetVolume(VolumeUpdate),
    /// Soft volumes only, after the stream set changed.
    SyncVolumes(VolumeUpdate),
    GetVolume,
    SetMute {
        muted: bool,
    },
    GetMute,
    SetStreamState {
        stream: u32,
        state: StreamState,
    },
    SetStreamSoftVolume {
        stream: u32,
        soft_volume: ChannelVolumes,
        volume_factor_device: ChannelVolumes,
    },
    SetStreamMute {
        stream: u32,
        muted: bool,
    },
    SetStreamRate {
        stream: u32,
        rate: u32,
    },
    SetStreamRequestedLatency {
        stream: u32,
        usec: Option<u64>,
    },
    GetStreamRequestedLatency {
        stream: u32,
    },
    UpdateStreamResampler {
        stream: u32,
        resampler: Option<Box<dyn Resampler>>,
        device_spec: SampleSpec,
        volume_factor_device: ChannelVolumes,
    },
    RequestStreamRewind {
        stream: u32,
        nbytes: usize,
        rewrite: bool,
        flush: bool,
        dont_rewind_render: bool,
    },
    GetRequestedLatency,
    SetLatencyRange(LatencyRange),
    GetLatencyRange,
    SetFixedLatency(u64),
    GetFixedLatency,
    SetMaxRewind(usize),
    GetMaxRewind,
    SetMaxRequest(usize),
    GetMaxRequest,
    SetPortLatencyOffset(i64),
    GetLatency,
    Process(IoBlock),
    Stats,
    Shutdown,
}

impl DeviceMsg {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceMsg::AddStream(_) => "add-stream",
            DeviceMsg::RemoveStream(_) => "remove-stream",
            DeviceMsg::StartMove(_) => "start-move",
            DeviceMsg::FinishMove(_) => "finish-move",
            DeviceMsg::SetState { .. } => "set-state",
            DeviceMsg::SetSpec { .. } => "set-spec",
            DeviceMsg::SetVolume(_) => "set-volume",
            DeviceMsg::SyncVolumes(_) => "sync-volumes",
            DeviceMsg::GetVolume => "get-volume",
            DeviceMsg::SetMute { .. } => "set-mute",
            DeviceMsg::GetMute => "get-mute",
            DeviceMsg::SetStreamState { .. } => "set-stream-state",
            DeviceMsg::SetStreamSoftVolume { .. } => "set-stream-soft-volume",
            DeviceMsg::SetStreamMute { .. } => "set-stream-mute",
            DeviceMsg::SetStreamRate { .. } => "set-stream-rate",
            DeviceMsg::SetStreamRequestedLatency { .. } => "set-stream-requested-latency",
            DeviceMsg::GetStreamRequestedLatency { .. } => "get-stream-requested-latency",
            DeviceMsg::UpdateStreamResampler { .. } => "update-stream-resampler",
            DeviceMsg::RequestStreamRewind { .. } => "request-stream-rewind",
            DeviceMsg::GetRequestedLatency => "get-requested-latency",
            DeviceMsg::SetLatencyRange(_) => "set-latency-range",
            DeviceMsg::GetLatencyRange => "get-latency-range",
            DeviceMsg::SetFixedLatency(_) => "set-fixed-latency",
            DeviceMsg::GetFixedLatency => "get-fixed-latency",
            DeviceMsg::SetMaxRewind(_) => "set-max-rewind",
            DeviceMsg::GetMaxRewind => "get-max-rewind",
            DeviceMsg::SetMaxRequest(_) => "set-max-request",
            DeviceMsg::GetMaxRequest => "get-max-request",
            DeviceMsg::SetPortLatencyOffset(_) => "set-port-latency-offset",
            DeviceMsg::GetLatency => "get-latency",
            DeviceMsg::Process(_) => "process",
            DeviceMsg::Stats => "stats",
            DeviceMsg::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IoStats {
    pub messages: u64,
    pub rendered_bytes: u64,
    pub captured_bytes: u64,
    pub rewinds: u64,
    pub hw_volume_writes: u64,
    pub underruns: u64,
}

#[derive(Debug)]
pub enum Reply {
    Done,
    Stream(Box<StreamIo>),
    Volume(Option<ChannelVolumes>),
    Mute(Option<bool>),
    Usec(u64),
    OptUsec(Option<u64>),
    Latency(i64),
    Range(LatencyRange),
    Bytes(usize),
    Data(Vec<u8>),
    Stats(IoStats),
}

fn unexpected(reply: &Reply) -> RoutingError {
    tracing::error!(?reply, "unexpected reply from realtime thread");
    RoutingError::Invalid("unexpected reply from realtime thread")
}

impl Reply {
    pub fn into_stream(self) -> RoutingResult<Box<StreamIo>> {
        match self {
            Reply::Stream(io) => Ok(io),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_volume(self) -> RoutingResult<Option<ChannelVolumes>> {
        match self {
            Reply::Volume(volume) => Ok(volume),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_mute(self) -> RoutingResult<Option<bool>> {
        match self {
            Reply::Mute(muted) => Ok(muted),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_usec(self) -> RoutingResult<u64> {
        match self {
            Reply::Usec(usec) => Ok(usec),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_opt_usec(self) -> RoutingResult<Option<u64>> {
        match self {
            Reply::OptUsec(usec) => Ok(usec),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_latency(self) -> RoutingResult<i64> {
        match self {
            Reply::Latency(usec) => Ok(usec),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_range(self) -> RoutingResult<LatencyRange> {
        match self {
            Reply::Range(range) => Ok(range),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_bytes(self) -> RoutingResult<usize> {
        match self {
            Reply::Bytes(n) => Ok(n),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_data(self) -> RoutingResult<Vec<u8>> {
        match self {
            Reply::Data(data) => Ok(data),
            Reply::Done => Ok(Vec::new()),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_stats(self) -> RoutingResult<IoStats> {
        match self {
            Reply::Stats(stats) => Ok(stats),
            other => Err(unexpected(&other)),
        }
    }
}

pub struct Envelope {
    pub msg: DeviceMsg,
    pub reply: Option<Sender<RoutingResult<Reply>>>,
}

/// Notifications from a realtime thread to the control context, drained by
/// [`crate::Core::dispatch_posted`].
#[derive(Debug, Clone, PartialEq)]
pub enum PostedMsg {
    /// The hardware volume or mute changed behind our back.
    UpdateVolumeAndMute { kind: DirectionKind, device: u32 },
    StreamUnderrun { kind: DirectionKind, stream: u32 },
    DriverFailure {
        facility: Facility,
        index: u32,
        message: String,
    },
}

/// Outcome of handing a stream's realtime half to a device. The realtime
/// half is returned when the device never took it.
pub(crate) type Handover = Result<(), (RoutingError, Option<Box<StreamIo>>)>;

/// Control-side link to a device's realtime state.
pub(crate) enum IoLink<D: Direction> {
    /// Not yet running; requests are handled inline.
    Local(Box<DeviceIo<D>>),
    Running(IoThread<D>),
    Stopped,
}

impl<D: Direction> IoLink<D> {
    pub(crate) fn send(&mut self, msg: DeviceMsg) -> RoutingResult<Reply> {
        match self {
            IoLink::Local(io) => io.handle(msg),
            IoLink::Running(thread) => thread.send(msg),
            IoLink::Stopped => Err(RoutingError::BadState("device realtime thread stopped")),
        }
    }

    pub(crate) fn post(&mut self, msg: DeviceMsg) -> RoutingResult<()> {
        match self {
            IoLink::Local(io) => {
                let name = msg.name();
                if let Err(err) = io.handle(msg) {
                    io.report(name, err);
                }
                Ok(())
            }
            IoLink::Running(thread) => thread.post(msg),
            IoLink::Stopped => Err(RoutingError::BadState("device realtime thread stopped")),
        }
    }

    /// Hands a moving stream's realtime half to the device. If the device
    /// never received it, the realtime half comes back with the error.
    pub(crate) fn finish_move(&mut self, stream: Box<StreamIo>) -> Handover {
        match self {
            IoLink::Local(io) => io.handle(DeviceMsg::FinishMove(stream)).map(drop).map_err(|err| (err, None)),
            IoLink::Running(thread) => thread.finish_move(stream),
            IoLink::Stopped => Err((RoutingError::BadState("device realtime thread stopped"), Some(stream))),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(self, IoLink::Running(_))
    }

    /// Moves the realtime state onto its own thread.
    pub(crate) fn spawn(&mut self, capacity: usize) -> RoutingResult<()> {
        match std::mem::replace(self, IoLink::Stopped) {
            IoLink::Local(io) => {
                *self = IoLink::Running(IoThread::spawn(io, capacity)?);
                Ok(())
            }
            other => {
                *self = other;
                Err(RoutingError::BadState("device realtime thread already started"))
            }
        }
    }

    /// Stops the thread and hands back the realtime state.
    pub(crate) fn stop(&mut self) -> Option<Box<DeviceIo<D>>> {
        match std::mem::replace(self, IoLink::Stopped) {
            IoLink::Local(io) => Some(io),
            IoLink::Running(thread) => thread.shutdown(),
            IoLink::Stopped => None,
        }
    }

    pub(crate) fn handle(&self) -> Option<IoHandle<D>> {
        match self {
            IoLink::Running(thread) => Some(IoHandle {
                tx: thread.tx.clone(),
                _direction: PhantomData,
            }),
            _ => None,
        }
    }
}

pub(crate) struct IoThread<D: Direction> {
    tx: Sender<Envelope>,
    join: Option<JoinHandle<Box<DeviceIo<D>>>>,
}

impl<D: Direction> IoThread<D> {
    fn spawn(io: Box<DeviceIo<D>>, capacity: usize) -> RoutingResult<Self> {
        let (tx, rx) = bounded(capacity.max(1));
        let name = format!("harmoniq-{}-{}", D::DEVICE_NOUN, io.index());
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || run_loop(io, rx))
            .map_err(|err| RoutingError::driver(format!("failed to spawn realtime thread: {err}")))?;
        Ok(Self {
            tx,
            join: Some(join),
        })
    }

    fn send(&self, msg: DeviceMsg) -> RoutingResult<Reply> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(Envelope {
                msg,
                reply: Some(reply_tx),
            })
            .map_err(|_| RoutingError::Disconnected)?;
        reply_rx.recv().map_err(|_| RoutingError::Disconnected)?
    }

    fn finish_move(&self, stream: Box<StreamIo>) -> Handover {
        let (reply_tx, reply_rx) = bounded(1);
        let envelope = Envelope {
            msg: DeviceMsg::FinishMove(stream),
            reply: Some(reply_tx),
        };
        if let Err(SendError(envelope)) = self.tx.send(envelope) {
            let stream = match envelope.msg {
                DeviceMsg::FinishMove(stream) => Some(stream),
                _ => None,
            };
            return Err((RoutingError::Disconnected, stream));
        }
        match reply_rx.recv() {
            Ok(reply) => reply.map(drop).map_err(|err| (err, None)),
            Err(_) => Err((RoutingError::Disconnected, None)),
        }
    }

    fn post(&self, msg: DeviceMsg) -> RoutingResult<()> {
        self.tx
            .send(Envelope { msg, reply: None })
            .map_err(|_| RoutingError::Disconnected)
    }

    fn shutdown(mut self) -> Option<Box<DeviceIo<D>>> {
        let join = self.join.take()?;
        if self.post(DeviceMsg::Shutdown).is_err() {
            tracing::warn!("device realtime thread already gone");
        }
        match join.join() {
            Ok(io) => Some(io),
            Err(err) => {
                tracing::error!(?err, "device realtime thread panicked");
                None
            }
        }
    }
}

impl<D: Direction> Drop for IoThread<D> {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = self.tx.send(Envelope {
                msg: DeviceMsg::Shutdown,
                reply: None,
            });
            if let Err(err) = join.join() {
                tracing::error!(?err, "failed to join device realtime thread");
            }
        }
    }
}

fn run_loop<D: Direction>(mut io: Box<DeviceIo<D>>, rx: Receiver<Envelope>) -> Box<DeviceIo<D>> {
    tracing::debug!(device = io.index(), kind = D::DEVICE_NOUN, "realtime thread started");
    loop {
        io.tick();
        let envelope = match io.next_wakeup() {
            Some(wait) => match rx.recv_timeout(Duration::from_micros(wait.min(MAX_IDLE_WAIT_USEC))) {
                Ok(envelope) => envelope,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(envelope) => envelope,
                Err(_) => break,
            },
        };

        io.tick();
        let shutdown = matches!(envelope.msg, DeviceMsg::Shutdown);
        let name = envelope.msg.name();
        let result = io.handle(envelope.msg);
        match envelope.reply {
            Some(reply) => {
                // the sender gave up waiting only if the control side is gone
                let _ = reply.send(result);
            }
            None => {
                if let Err(err) = result {
                    io.report(name, err);
                }
            }
        }
        if shutdown {
            break;
        }
    }
    tracing::debug!(device = io.index(), kind = D::DEVICE_NOUN, "realtime thread stopped");
    io
}

/// Handle for driver backends that tick a running device from their own
/// thread.
pub struct IoHandle<D: Direction> {
    tx: Sender<Envelope>,
    _direction: PhantomData<D>,
}

impl<D: Direction> Clone for IoHandle<D> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            _direction: PhantomData,
        }
    }
}

impl<D: Direction> IoHandle<D> {
    fn request(&self, msg: DeviceMsg) -> RoutingResult<Reply> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(Envelope {
                msg,
                reply: Some(reply_tx),
            })
            .map_err(|_| RoutingError::Disconnected)?;
        reply_rx.recv().map_err(|_| RoutingError::Disconnected)?
    }

    pub fn process(&self, block: IoBlock) -> RoutingResult<Vec<u8>> {
        self.request(DeviceMsg::Process(block))?.into_data()
    }

    pub fn stats(&self) -> RoutingResult<IoStats> {
        self.request(DeviceMsg::Stats)?.into_stats()
    }
}
