//! The routing core: one arena of devices and streams per direction plus the
//! registries both directions share.
//!
//! All control operations are methods on [`Core`] that are generic over the
//! [`Direction`] of the id they are given, see `device::control` and
//! `stream::control`.

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::clock::{Clock, MonotonicClock};
use crate::config::CoreConfig;
use crate::device::{Device, DeviceNewData};
use crate::direction::{Capture, DeviceId, Direction, DirectionKind, Playback, StreamId};
use crate::error::{RoutingError, RoutingResult};
use crate::hooks::{CoreEvent, EventBus, EventKind, Facility, Hook};
use crate::message::{DeviceMsg, IoBlock, IoHandle, IoStats, PostedMsg};
use crate::namereg::NameRegistry;
use crate::proplist::Proplist;
use crate::resampler::{NearestResamplerFactory, ResamplerFactory};
use crate::stream::{Stream, StreamNewData};

/// Data handed to the move-fail hook. A slot that can place the stream
/// elsewhere sets `destination` and returns [`crate::HookResult::Stop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveFailData<D: Direction> {
    pub stream: StreamId<D>,
    pub destination: Option<DeviceId<D>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendEventData<D: Direction> {
    pub stream: StreamId<D>,
    pub event: String,
    pub properties: Proplist,
}

/// Extension points of one direction.
pub struct DomainHooks<D: Direction> {
    pub device_new: Hook<DeviceNewData<D>>,
    pub device_fixate: Hook<DeviceNewData<D>>,
    pub device_put: Hook<DeviceId<D>>,
    pub device_unlink: Hook<DeviceId<D>>,
    pub device_unlink_post: Hook<DeviceId<D>>,
    pub device_state_changed: Hook<DeviceId<D>>,
    pub device_volume_changed: Hook<DeviceId<D>>,
    pub device_mute_changed: Hook<DeviceId<D>>,
    pub device_port_changed: Hook<DeviceId<D>>,
    pub default_changed: Hook<Option<DeviceId<D>>>,
    pub stream_new: Hook<StreamNewData<D>>,
    pub stream_fixate: Hook<StreamNewData<D>>,
    pub stream_put: Hook<StreamId<D>>,
    pub stream_unlink: Hook<StreamId<D>>,
    pub stream_unlink_post: Hook<StreamId<D>>,
    pub stream_state_changed: Hook<StreamId<D>>,
    pub stream_volume_changed: Hook<StreamId<D>>,
    pub stream_mute_changed: Hook<StreamId<D>>,
    pub stream_move_start: Hook<StreamId<D>>,
    pub stream_move_finish: Hook<StreamId<D>>,
    pub stream_move_fail: Hook<MoveFailData<D>>,
    pub stream_send_event: Hook<SendEventData<D>>,
    pub stream_proplist_changed: Hook<StreamId<D>>,
}

impl<D: Direction> Default for DomainHooks<D> {
    fn default() -> Self {
        Self {
            device_new: Hook::default(),
            device_fixate: Hook::default(),
            device_put: Hook::default(),
            device_unlink: Hook::default(),
            device_unlink_post: Hook::default(),
            device_state_changed: Hook::default(),
            device_volume_changed: Hook::default(),
            device_mute_changed: Hook::default(),
            device_port_changed: Hook::default(),
            default_changed: Hook::default(),
            stream_new: Hook::default(),
            stream_fixate: Hook::default(),
            stream_put: Hook::default(),
            stream_unlink: Hook::default(),
            stream_unlink_post: Hook::default(),
            stream_state_changed: Hook::default(),
            stream_volume_changed: Hook::default(),
            stream_mute_changed: Hook::default(),
            stream_move_start: Hook::default(),
            stream_move_finish: Hook::default(),
            stream_move_fail: Hook::default(),
            stream_send_event: Hook::default(),
            stream_proplist_changed: Hook::default(),
        }
    }
}

/// Devices and streams of one direction.
pub struct Domain<D: Direction> {
    pub(crate) devices: BTreeMap<u32, Device<D>>,
    pub(crate) streams: BTreeMap<u32, Stream<D>>,
    next_device: u32,
    next_stream: u32,
    pub(crate) configured_default: Option<String>,
    pub(crate) default_device: Option<u32>,
    pub(crate) hooks: DomainHooks<D>,
}

impl<D: Direction> Default for Domain<D> {
    fn default() -> Self {
        Self {
            devices: BTreeMap::new(),
            streams: BTreeMap::new(),
            next_device: 0,
            next_stream: 0,
            configured_default: None,
            default_device: None,
            hooks: DomainHooks::default(),
        }
    }
}

impl<D: Direction> Domain<D> {
    /// Index the next device will get. Only consumed once the device exists.
    pub(crate) fn peek_device_index(&self) -> u32 {
        self.next_device
    }

    pub(crate) fn insert_device(&mut self, device: Device<D>) {
        self.next_device = self.next_device.max(device.index + 1);
        self.devices.insert(device.index, device);
    }

    pub(crate) fn allocate_stream_index(&mut self) -> u32 {
        let index = self.next_stream;
        self.next_stream += 1;
        index
    }

    pub(crate) fn device(&self, index: u32) -> RoutingResult<&Device<D>> {
        self.devices.get(&index).ok_or(RoutingError::NoEntity(D::DEVICE_NOUN))
    }

    pub(crate) fn device_mut(&mut self, index: u32) -> RoutingResult<&mut Device<D>> {
        self.devices
            .get_mut(&index)
            .ok_or(RoutingError::NoEntity(D::DEVICE_NOUN))
    }

    pub(crate) fn stream(&self, index: u32) -> RoutingResult<&Stream<D>> {
        self.streams.get(&index).ok_or(RoutingError::NoEntity(D::STREAM_NOUN))
    }

    pub(crate) fn stream_mut(&mut self, index: u32) -> RoutingResult<&mut Stream<D>> {
        self.streams
            .get_mut(&index)
            .ok_or(RoutingError::NoEntity(D::STREAM_NOUN))
    }
}

/// Registries and services shared by both directions.
pub struct CoreContext {
    pub(crate) config: CoreConfig,
    pub(crate) names: NameRegistry,
    pub(crate) events: EventBus,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) resamplers: Arc<dyn ResamplerFactory>,
    pub(crate) posted_tx: Sender<PostedMsg>,
    posted_rx: Receiver<PostedMsg>,
    clients: BTreeMap<u32, Proplist>,
    next_client: u32,
}

impl CoreContext {
    pub(crate) fn post(&self, facility: Facility, kind: EventKind, index: u32) {
        self.events.post(facility, kind, index);
    }

    pub(crate) fn client_proplist(&self, client: u32) -> Option<&Proplist> {
        self.clients.get(&client)
    }
}

pub struct Core {
    pub(crate) sinks: Domain<Playback>,
    pub(crate) sources: Domain<Capture>,
    pub(crate) ctx: CoreContext,
}

impl Core {
    pub fn new(config: CoreConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(MonotonicClock::default()),
            Arc::new(NearestResamplerFactory),
        )
    }

    /// Builds a core with an explicit clock (tests drive deferred volume
    /// with a manual one) and resampler implementation.
    pub fn with_parts(config: CoreConfig, clock: Arc<dyn Clock>, resamplers: Arc<dyn ResamplerFactory>) -> Self {
        let (posted_tx, posted_rx) = unbounded();
        Self {
            sinks: Domain::default(),
            sources: Domain::default(),
            ctx: CoreContext {
                config,
                names: NameRegistry::new(),
                events: EventBus::default(),
                clock,
                resamplers,
                posted_tx,
                posted_rx,
                clients: BTreeMap::new(),
                next_client: 0,
            },
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.ctx.config
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.ctx.events.subscribe()
    }

    pub fn hooks<D: Direction>(&self) -> &DomainHooks<D> {
        &D::domain(self).hooks
    }

    pub fn register_client(&mut self, proplist: Proplist) -> u32 {
        let index = self.ctx.next_client;
        self.ctx.next_client += 1;
        self.ctx.clients.insert(index, proplist);
        index
    }

    /// Forgets a client and kills every stream it owns.
    pub fn unregister_client(&mut self, client: u32) -> bool {
        if self.ctx.clients.remove(&client).is_none() {
            return false;
        }
        let inputs: Vec<u32> = self
            .sinks
            .streams
            .values()
            .filter(|s| s.client == Some(client))
            .map(|s| s.index)
            .collect();
        for index in inputs {
            self.kill_stream(StreamId::<Playback>::new(index));
        }
        let outputs: Vec<u32> = self
            .sources
            .streams
            .values()
            .filter(|s| s.client == Some(client))
            .map(|s| s.index)
            .collect();
        for index in outputs {
            self.kill_stream(StreamId::<Capture>::new(index));
        }
        true
    }

    pub fn device<D: Direction>(&self, id: DeviceId<D>) -> Option<&Device<D>> {
        D::domain(self).devices.get(&id.index())
    }

    pub fn stream<D: Direction>(&self, id: StreamId<D>) -> Option<&Stream<D>> {
        D::domain(self).streams.get(&id.index())
    }

    pub fn devices<D: Direction>(&self) -> impl Iterator<Item = &Device<D>> {
        D::domain(self).devices.values()
    }

    pub fn streams<D: Direction>(&self) -> impl Iterator<Item = &Stream<D>> {
        D::domain(self).streams.values()
    }

    pub fn lookup_device<D: Direction>(&self, name: &str) -> Option<DeviceId<D>> {
        self.ctx.names.lookup(name, D::NAME_KIND).map(DeviceId::new)
    }

    pub fn default_device<D: Direction>(&self) -> Option<DeviceId<D>> {
        D::domain(self).default_device.map(DeviceId::new)
    }

    /// Drains notifications posted by the realtime threads. Returns how many
    /// were handled.
    pub fn dispatch_posted(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(msg) = self.ctx.posted_rx.try_recv() {
            handled += 1;
            match msg {
                PostedMsg::UpdateVolumeAndMute { kind, device } => match kind {
                    DirectionKind::Playback => self.refresh_volume_and_mute(DeviceId::<Playback>::new(device)),
                    DirectionKind::Capture => self.refresh_volume_and_mute(DeviceId::<Capture>::new(device)),
                },
                PostedMsg::StreamUnderrun { kind, stream } => {
                    let facility = match kind {
                        DirectionKind::Playback => Facility::SinkInput,
                        DirectionKind::Capture => Facility::SourceOutput,
                    };
                    tracing::debug!(?facility, stream, "stream underrun");
                    self.ctx.events.publish(CoreEvent::StreamEvent {
                        facility,
                        index: stream,
                        name: String::from("underrun"),
                        properties: Proplist::new(),
                    });
                }
                PostedMsg::DriverFailure {
                    facility,
                    index,
                    message,
                } => {
                    tracing::warn!(?facility, index, %message, "driver failure reported by realtime thread");
                    self.ctx.events.publish(CoreEvent::DriverFailure {
                        facility,
                        index,
                        message,
                    });
                }
            }
        }
        handled
    }

    fn refresh_volume_and_mute<D: Direction>(&mut self, device: DeviceId<D>) {
        if let Err(err) = self.get_device_volume(device, true) {
            tracing::debug!(%device, %err, "volume refresh failed");
        }
        if let Err(err) = self.get_device_mute(device, true) {
            tracing::debug!(%device, %err, "mute refresh failed");
        }
    }

    /// Runs one driver tick on a device: renders `nbytes` for a sink or
    /// distributes a captured block for a source.
    pub fn process_device<D: Direction>(&mut self, device: DeviceId<D>, block: IoBlock) -> RoutingResult<Vec<u8>> {
        let domain = D::domain_mut(self);
        let device = domain.device_mut(device.index())?;
        device.io.send(DeviceMsg::Process(block))?.into_data()
    }

    /// Handle a driver backend can use to tick the device from its own
    /// thread. `None` until the device is put.
    pub fn io_handle<D: Direction>(&self, device: DeviceId<D>) -> Option<IoHandle<D>> {
        D::domain(self).devices.get(&device.index())?.io.handle()
    }

    pub fn device_stats<D: Direction>(&mut self, device: DeviceId<D>) -> RoutingResult<IoStats> {
        let domain = D::domain_mut(self);
        let device = domain.device_mut(device.index())?;
        device.io.send(DeviceMsg::Stats)?.into_stats()
    }

    /// Unlinks every device, which kills or rescues all streams, and joins
    /// the realtime threads.
    pub fn shutdown(&mut self) {
        let sinks: Vec<u32> = self.sinks.devices.keys().copied().collect();
        for index in sinks {
            self.unlink_device(DeviceId::<Playback>::new(index));
        }
        let sources: Vec<u32> = self.sources.devices.keys().copied().collect();
        for index in sources {
            self.unlink_device(DeviceId::<Capture>::new(index));
        }
        tracing::debug!("routing core shut down");
    }
}

impl Default for Core {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DeviceCallbacks, StreamCallbacks};
    use crate::sample::SampleSpec;

    #[test]
    fn unregistering_a_client_kills_its_streams() {
        let mut core = Core::default();
        let sink = core
            .create_device(
                DeviceNewData::<Playback>::new("out", SampleSpec::default()),
                DeviceCallbacks::null(),
            )
            .unwrap();
        core.put_device(sink).unwrap();
        let client = core.register_client(Proplist::new().with(crate::proplist::APPLICATION_NAME, "player"));
        let input = core
            .create_stream(
                StreamNewData::<Playback>::new(SampleSpec::default()).with_client(client),
                StreamCallbacks::null(),
            )
            .unwrap();
        core.put_stream(input).unwrap();
        assert_eq!(
            core.stream(input).unwrap().proplist().get(crate::proplist::APPLICATION_NAME),
            Some("player")
        );

        assert!(core.unregister_client(client));
        assert!(core.stream(input).is_none());
        assert!(!core.unregister_client(client));
        core.shutdown();
        assert!(core.device(sink).is_none());
    }
}
