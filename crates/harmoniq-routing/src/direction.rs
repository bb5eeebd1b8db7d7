//! Playback and capture marker types.
//!
//! Devices and streams are implemented once, generically over a
//! [`Direction`]. The two instantiations differ only in naming, in how a
//! realtime block is processed and in a few capabilities such as sync groups.

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

use serde::Serialize;

use crate::core::{Core, CoreContext, Domain};
use crate::device::io::DeviceIo;
use crate::error::{RoutingError, RoutingResult};
use crate::hooks::Facility;
use crate::message::{IoBlock, Reply};
use crate::namereg::NameKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionKind {
    Playback,
    Capture,
}

pub trait Direction:
    fmt::Debug + Clone + Copy + PartialEq + Eq + Hash + Ord + Send + Sync + 'static
{
    const KIND: DirectionKind;
    const DEVICE_NOUN: &'static str;
    const STREAM_NOUN: &'static str;
    const NAME_KIND: NameKind;
    const DEVICE_FACILITY: Facility;
    const STREAM_FACILITY: Facility;
    /// Whether streams of this direction can form sync groups.
    const SUPPORTS_SYNC: bool;

    fn domain(core: &Core) -> &Domain<Self>;
    fn domain_mut(core: &mut Core) -> &mut Domain<Self>;
    fn split(core: &mut Core) -> (&mut Domain<Self>, &mut CoreContext);

    /// Kills streams of the other direction that monitor `stream` directly.
    fn kill_direct_outputs(core: &mut Core, stream: u32);

    /// Runs one driver tick on the realtime state.
    fn process_block(io: &mut DeviceIo<Self>, block: IoBlock) -> RoutingResult<Reply>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Playback;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Capture;

impl Direction for Playback {
    const KIND: DirectionKind = DirectionKind::Playback;
    const DEVICE_NOUN: &'static str = "sink";
    const STREAM_NOUN: &'static str = "sink-input";
    const NAME_KIND: NameKind = NameKind::Sink;
    const DEVICE_FACILITY: Facility = Facility::Sink;
    const STREAM_FACILITY: Facility = Facility::SinkInput;
    const SUPPORTS_SYNC: bool = true;

    fn domain(core: &Core) -> &Domain<Self> {
        &core.sinks
    }

    fn domain_mut(core: &mut Core) -> &mut Domain<Self> {
        &mut core.sinks
    }

    fn split(core: &mut Core) -> (&mut Domain<Self>, &mut CoreContext) {
        (&mut core.sinks, &mut core.ctx)
    }

    fn kill_direct_outputs(core: &mut Core, stream: u32) {
        let monitors: Vec<u32> = core
            .sources
            .streams
            .values()
            .filter(|output| output.direct_on_input == Some(stream))
            .map(|output| output.index)
            .collect();
        for monitor in monitors {
            core.kill_stream(StreamId::<Capture>::new(monitor));
        }
    }

    fn process_block(io: &mut DeviceIo<Self>, block: IoBlock) -> RoutingResult<Reply> {
        match block {
            IoBlock::Render(nbytes) => Ok(Reply::Data(io.render(nbytes))),
            IoBlock::Capture(_) => Err(RoutingError::Invalid("capture data sent to a sink")),
        }
    }
}

impl Direction for Capture {
    const KIND: DirectionKind = DirectionKind::Capture;
    const DEVICE_NOUN: &'static str = "source";
    const STREAM_NOUN: &'static str = "source-output";
    const NAME_KIND: NameKind = NameKind::Source;
    const DEVICE_FACILITY: Facility = Facility::Source;
    const STREAM_FACILITY: Facility = Facility::SourceOutput;
    const SUPPORTS_SYNC: bool = false;

    fn domain(core: &Core) -> &Domain<Self> {
        &core.sources
    }

    fn domain_mut(core: &mut Core) -> &mut Domain<Self> {
        &mut core.sources
    }

    fn split(core: &mut Core) -> (&mut Domain<Self>, &mut CoreContext) {
        (&mut core.sources, &mut core.ctx)
    }

    fn kill_direct_outputs(_core: &mut Core, _stream: u32) {}

    fn process_block(io: &mut DeviceIo<Self>, block: IoBlock) -> RoutingResult<Reply> {
        match block {
            IoBlock::Capture(data) => {
                io.post_captured(&data);
                Ok(Reply::Done)
            }
            IoBlock::Render(_) => Err(RoutingError::Invalid("render request sent to a source")),
        }
    }
}

/// Index of a device of direction `D`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId<D: Direction>(u32, PhantomData<D>);

/// Index of a stream of direction `D`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId<D: Direction>(u32, PhantomData<D>);

impl<D: Direction> DeviceId<D> {
    pub fn new(index: u32) -> Self {
        Self(index, PhantomData)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl<D: Direction> StreamId<D> {
    pub fn new(index: u32) -> Self {
        Self(index, PhantomData)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl<D: Direction> fmt::Debug for DeviceId<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", D::DEVICE_NOUN, self.0)
    }
}

impl<D: Direction> fmt::Debug for StreamId<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", D::STREAM_NOUN, self.0)
    }
}

impl<D: Direction> fmt::Display for DeviceId<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl<D: Direction> fmt::Display for StreamId<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub type SinkId = DeviceId<Playback>;
pub type SourceId = DeviceId<Capture>;
pub type SinkInputId = StreamId<Playback>;
pub type SourceOutputId = StreamId<Capture>;
