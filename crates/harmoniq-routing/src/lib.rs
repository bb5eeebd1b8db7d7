//! Harmoniq Routing
//! ================
//! Stream routing and volume propagation core of a sound server. Devices
//! (sinks and sources) and the streams attached to them (sink inputs and
//! source outputs) live in a [`Core`]; each linked device runs a realtime
//! thread that owns its audio state and talks to the control side through
//! typed messages.

pub mod clock;
pub mod config;
pub mod core;
pub mod deferred;
pub mod device;
pub mod direction;
pub mod driver;
pub mod error;
pub mod hooks;
pub mod info;
pub mod latency;
pub mod message;
pub mod mix;
pub mod namereg;
mod propagation;
pub mod proplist;
pub mod render_queue;
pub mod resampler;
pub mod sample;
pub mod stream;
pub mod volume;

pub use crate::clock::{Clock, ManualClock, MonotonicClock};
pub use crate::config::CoreConfig;
pub use crate::core::{Core, DomainHooks, MoveFailData, SendEventData};
pub use crate::device::{Device, DeviceFlags, DeviceNewData, DeviceState, Port, PortAvailable, SuspendCause};
pub use crate::direction::{
    Capture, DeviceId, Direction, DirectionKind, Playback, SinkId, SinkInputId, SourceId, SourceOutputId, StreamId,
};
pub use crate::driver::{
    DeviceCallbacks, DeviceDriver, IoDriver, NullDriver, StreamCallbacks, StreamDriver, StreamRender,
};
pub use crate::error::{DriverError, RoutingError, RoutingResult};
pub use crate::hooks::{CoreEvent, EventKind, Facility, HookResult, SubscriptionEvent};
pub use crate::info::{CoreSnapshot, DeviceInfo, StreamInfo};
pub use crate::latency::LatencyRange;
pub use crate::message::{IoBlock, IoHandle, IoStats};
pub use crate::proplist::{Proplist, UpdateMode};
pub use crate::sample::{ChannelMap, ChannelPosition, Encoding, FormatInfo, SampleFormat, SampleSpec};
pub use crate::stream::{Stream, StreamFlags, StreamNewData, StreamState};
pub use crate::volume::{ChannelVolumes, Volume};
