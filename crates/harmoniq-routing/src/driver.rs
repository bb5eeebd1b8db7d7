//! Callback sets supplied by the modules that drive devices and streams.
//!
//! Every method has a default so drivers only implement what their hardware
//! supports. Control-side traits are called from the control context,
//! [`IoDriver`] and [`StreamRender`] only from the device's realtime thread.

use crate::device::{DeviceState, Port, SuspendCause};
use crate::error::DriverError;
use crate::proplist::Proplist;
use crate::sample::{FormatInfo, SampleSpec};
use crate::stream::StreamState;
use crate::volume::ChannelVolumes;

/// Control-side device callbacks.
pub trait DeviceDriver: Send {
    /// Called before the realtime side sees a state change.
    fn set_state(&mut self, _state: DeviceState, _cause: SuspendCause) -> Result<(), DriverError> {
        Ok(())
    }

    /// Writes `real` to the hardware. Returns a software volume to apply on
    /// top when the hardware could not match it exactly.
    fn set_volume(&mut self, _real: &ChannelVolumes) -> Result<Option<ChannelVolumes>, DriverError> {
        Ok(None)
    }

    /// Reads the hardware volume, if the hardware can report it.
    fn get_volume(&mut self) -> Result<Option<ChannelVolumes>, DriverError> {
        Ok(None)
    }

    fn set_mute(&mut self, _muted: bool) -> Result<(), DriverError> {
        Ok(())
    }

    fn get_mute(&mut self) -> Result<Option<bool>, DriverError> {
        Ok(None)
    }

    fn has_port_switch(&self) -> bool {
        false
    }

    fn set_port(&mut self, _port: &Port) -> Result<(), DriverError> {
        Err(DriverError::Unsupported)
    }

    fn has_reconfigure(&self) -> bool {
        false
    }

    /// Reopens the device in `spec`. The driver may adjust the spec to what
    /// the hardware accepted.
    fn reconfigure(&mut self, _spec: &mut SampleSpec, _passthrough: bool) -> Result<(), DriverError> {
        Err(DriverError::Unsupported)
    }

    /// Formats the device accepts. `None` means plain PCM only.
    fn formats(&self) -> Option<Vec<FormatInfo>> {
        None
    }

    fn set_formats(&mut self, _formats: &[FormatInfo]) -> bool {
        false
    }
}

/// Realtime-side device callbacks.
pub trait IoDriver: Send {
    fn set_state(&mut self, _state: DeviceState, _cause: SuspendCause) -> Result<(), DriverError> {
        Ok(())
    }

    /// Current hardware latency in microseconds.
    fn latency_usec(&mut self) -> i64 {
        0
    }

    /// Writes a deferred hardware volume.
    fn write_volume(&mut self, _hw: &ChannelVolumes) {}

    fn read_volume(&mut self) -> Option<ChannelVolumes> {
        None
    }

    fn write_mute(&mut self, _muted: bool) {}

    fn read_mute(&mut self) -> Option<bool> {
        None
    }

    /// Rewinds the hardware buffer. Returns how much was actually rewound.
    fn rewind(&mut self, nbytes: usize) -> usize {
        nbytes
    }

    fn update_requested_latency(&mut self, _usec: Option<u64>) {}

    /// Polled once per loop iteration; true when the hardware volume or mute
    /// changed behind our back.
    fn poll_hw_change(&mut self) -> bool {
        false
    }
}

/// Control-side stream callbacks.
pub trait StreamDriver: Send {
    /// The core is dropping the stream; the owner should forget it.
    fn kill(&mut self) {}

    /// A move started (`Some(destination)`) or failed for good (`None`).
    fn moving(&mut self, _destination: Option<u32>) {}

    fn may_move_to(&self, _destination: u32) -> bool {
        true
    }

    fn suspend(&mut self, _suspended: bool) {}

    fn state_change(&mut self, _state: StreamState) {}

    fn send_event(&mut self, _event: &str, _properties: &Proplist) {}

    fn volume_changed(&mut self) {}

    fn mute_changed(&mut self) {}
}

/// Realtime-side stream callbacks that move audio.
pub trait StreamRender: Send {
    /// Playback: hands out up to `nbytes` in the stream's own format.
    fn pop(&mut self, _nbytes: usize) -> Option<Vec<u8>> {
        None
    }

    /// Capture: receives converted audio.
    fn push(&mut self, _data: &[u8]) {}

    fn process_rewind(&mut self, _nbytes: usize) {}

    fn update_max_rewind(&mut self, _nbytes: usize) {}

    fn update_max_request(&mut self, _nbytes: usize) {}

    fn attach(&mut self) {}

    fn detach(&mut self) {}

    fn state_change(&mut self, _state: StreamState) {}

    fn suspend(&mut self, _suspended: bool) {}

    fn underrun(&mut self) {}
}

/// Driver that accepts everything and does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDriver;

impl DeviceDriver for NullDriver {}
impl IoDriver for NullDriver {}
impl StreamDriver for NullDriver {}
impl StreamRender for NullDriver {}

pub struct DeviceCallbacks {
    pub control: Box<dyn DeviceDriver>,
    pub io: Box<dyn IoDriver>,
}

impl DeviceCallbacks {
    pub fn new(control: impl DeviceDriver + 'static, io: impl IoDriver + 'static) -> Self {
        Self {
            control: Box::new(control),
            io: Box::new(io),
        }
    }

    pub fn null() -> Self {
        Self::new(NullDriver, NullDriver)
    }
}

pub struct StreamCallbacks {
    pub control: Box<dyn StreamDriver>,
    pub render: Box<dyn StreamRender>,
}

impl StreamCallbacks {
    pub fn new(control: impl StreamDriver + 'static, render: impl StreamRender + 'static) -> Self {
        Self {
            control: Box::new(control),
            render: Box::new(render),
        }
    }

    pub fn null() -> Self {
        Self::new(NullDriver, NullDriver)
    }
}
