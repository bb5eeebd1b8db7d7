//! Control-side device operations: lifecycle, suspend causes, volume and
//! mute, ports, reconfiguration, default selection and latency.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::{Core, CoreContext, Domain};
use crate::device::io::{DeviceIo, DeviceIoParams};
use crate::device::{best_port, Device, DeviceFlags, DeviceNewData, DeviceState, PortAvailable, SuspendCause};
use crate::direction::{DeviceId, Direction, StreamId};
use crate::driver::DeviceCallbacks;
use crate::error::{RoutingError, RoutingResult};
use crate::hooks::{CoreEvent, EventKind, HookResult};
use crate::latency::{clamp_fixed_latency, LatencyRange};
use crate::message::{DeviceMsg, IoLink, VolumeUpdate};
use crate::propagation::{self, VolumeChanges};
use crate::proplist::{self, Proplist, UpdateMode};
use crate::sample::{negotiate_formats, ChannelMap, FormatInfo, SampleSpec};
use crate::stream::{StreamFlags, StreamState};
use crate::volume::{ChannelVolumes, Volume};

impl<D: Direction> Device<D> {
    /// Attached streams that are not corked.
    pub fn used_by(&self) -> usize {
        self.streams.len().saturating_sub(self.n_corked as usize)
    }

    pub fn linked_by(&self) -> usize {
        self.streams.len()
    }
}

/// Exactly one stream is attached and it carries passthrough data.
pub(crate) fn is_passthrough<D: Direction>(domain: &Domain<D>, device: u32) -> bool {
    let Some(dev) = domain.devices.get(&device) else {
        return false;
    };
    if dev.streams.len() != 1 {
        return false;
    }
    dev.streams
        .iter()
        .filter_map(|index| domain.streams.get(index))
        .all(|stream| stream.is_passthrough())
}

/// A device carrying a passthrough stream takes nothing else, and a busy
/// device takes no passthrough stream.
pub(crate) fn check_passthrough_connection<D: Direction>(
    domain: &Domain<D>,
    passthrough: bool,
    device: u32,
) -> RoutingResult<()> {
    if is_passthrough(domain, device) {
        tracing::debug!(device, "device already carries a passthrough stream");
        return Err(RoutingError::Busy("device carries a passthrough stream"));
    }
    let attached = domain.devices.get(&device).map_or(0, |d| d.streams.len());
    if passthrough && attached > 0 {
        tracing::debug!(device, attached, "device busy, refusing passthrough stream");
        return Err(RoutingError::Busy("device already has streams"));
    }
    Ok(())
}

/// Hands the current soft volumes of the sharing tree rooted above `device`
/// to the realtime threads. Only the root writes its hardware volume.
pub(crate) fn sync_thread_volumes<D: Direction>(domain: &mut Domain<D>, device: u32, write_hw: bool) {
    let Some(root) = propagation::get_root(domain, device) else {
        return;
    };
    let mut pending = vec![(root, write_hw)];
    while let Some((index, write_hw)) = pending.pop() {
        let Some(dev) = domain.devices.get(&index) else {
            continue;
        };
        let mut stream_soft_volumes = Vec::with_capacity(dev.streams.len());
        for stream in dev.streams.iter().filter_map(|s| domain.streams.get(s)) {
            stream_soft_volumes.push((stream.index, stream.soft_volume.clone()));
            if let Some(origin) = propagation::sharing_origin(domain, stream.index) {
                pending.push((origin, false));
            }
        }
        let update = VolumeUpdate {
            soft_volume: dev.soft_volume.clone(),
            real_volume: dev.real_volume.clone(),
            stream_soft_volumes,
        };

        for (stream, soft) in &update.stream_soft_volumes {
            if let Some(io) = domain.streams.get_mut(stream).and_then(|s| s.io.as_mut()) {
                io.soft_volume = soft.clone();
            }
        }
        let msg = if write_hw {
            DeviceMsg::SetVolume(update)
        } else {
            DeviceMsg::SyncVolumes(update)
        };
        if let Some(dev) = domain.devices.get_mut(&index) {
            if let Err(err) = dev.io.send(msg) {
                tracing::debug!(device = index, %err, "volume sync not delivered");
            }
        }
    }
}

fn compare_devices<D: Direction>(domain: &Domain<D>, a: &Device<D>, b: &Device<D>) -> Ordering {
    let unavailable = |d: &Device<D>| d.active_port().is_some_and(|p| p.available == PortAvailable::No);
    match (unavailable(a), unavailable(b)) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    let configured = domain.configured_default.as_deref();
    if configured == Some(b.name.as_str()) {
        return Ordering::Less;
    }
    if configured == Some(a.name.as_str()) {
        return Ordering::Greater;
    }
    match a.priority.cmp(&b.priority) {
        Ordering::Equal => {}
        other => return other,
    }
    if domain.default_device == Some(b.index) {
        return Ordering::Less;
    }
    if domain.default_device == Some(a.index) {
        return Ordering::Greater;
    }
    Ordering::Equal
}

fn build_device<D: Direction>(
    domain: &Domain<D>,
    ctx: &CoreContext,
    index: u32,
    mut data: DeviceNewData<D>,
    callbacks: DeviceCallbacks,
) -> RoutingResult<Device<D>> {
    if domain.hooks.device_new.fire(&mut data) == HookResult::Cancel {
        return Err(RoutingError::Canceled);
    }
    if !data.sample_spec.is_valid() {
        return Err(RoutingError::Invalid("sample spec"));
    }
    let map = match data.channel_map.take() {
        Some(map) => map,
        None => ChannelMap::default_for(data.sample_spec.channels)
            .ok_or(RoutingError::Invalid("no default channel map for channel count"))?,
    };
    if !map.is_valid() || !map.is_compatible(&data.sample_spec) {
        return Err(RoutingError::Invalid("channel map does not match sample spec"));
    }
    data.channel_map = Some(map);
    if data.volume.is_some() && data.flags.contains(DeviceFlags::SHARE_VOLUME_WITH_MASTER) {
        return Err(RoutingError::Invalid("volume sharing device with an explicit volume"));
    }
    let volume = match data.volume.take() {
        Some(volume) => volume,
        None => {
            data.save_volume = false;
            ChannelVolumes::norm(data.sample_spec.channels)
        }
    };
    if !volume.is_valid() || !volume.is_compatible(&data.sample_spec) {
        return Err(RoutingError::Invalid("volume"));
    }
    data.volume = Some(volume);

    if !data.proplist.contains(proplist::DEVICE_DESCRIPTION) {
        let description = data.name.clone();
        data.proplist.set(proplist::DEVICE_DESCRIPTION, description);
    }
    data.proplist
        .set(proplist::DEVICE_PRIORITY, data.priority.to_string());

    match &data.active_port {
        Some(active) if !data.ports.iter().any(|p| &p.name == active) => {
            return Err(RoutingError::Invalid("active port is not one of the device ports"));
        }
        Some(_) => {}
        None => data.active_port = best_port(&data.ports).map(|p| p.name.clone()),
    }

    if domain.hooks.device_fixate.fire(&mut data) == HookResult::Cancel {
        return Err(RoutingError::Canceled);
    }

    let spec = data.sample_spec;
    let map = data.channel_map.clone().unwrap_or_else(ChannelMap::stereo);
    let volume = data
        .volume
        .clone()
        .unwrap_or_else(|| ChannelVolumes::norm(spec.channels));
    if !map.is_compatible(&spec) || !volume.is_compatible(&spec) {
        return Err(RoutingError::Invalid("fixated format"));
    }

    let alternate_sample_rate = data
        .alternate_sample_rate
        .unwrap_or(ctx.config.alternate_sample_rate);
    if alternate_sample_rate == spec.rate {
        tracing::warn!(
            device = %data.name,
            rate = spec.rate,
            "default and alternate sample rates are the same"
        );
    }
    let ports: BTreeMap<String, _> = data
        .ports
        .iter()
        .map(|port| (port.name.clone(), port.clone()))
        .collect();
    let port_latency_offset = data
        .active_port
        .as_ref()
        .and_then(|name| ports.get(name))
        .map_or(0, |port| port.latency_offset);
    let formats = callbacks
        .control
        .formats()
        .unwrap_or_else(|| vec![FormatInfo::pcm()]);

    let io = DeviceIo::new(DeviceIoParams {
        index,
        flags: data.flags,
        spec,
        map: map.clone(),
        driver: callbacks.io,
        clock: Arc::clone(&ctx.clock),
        posted: ctx.posted_tx.clone(),
        safety_margin_usec: ctx.config.deferred_volume_safety_margin_usec,
        extra_delay_usec: ctx.config.deferred_volume_extra_delay_usec,
        hw_volume: volume.clone(),
    });

    Ok(Device {
        index,
        name: data.name,
        driver_name: data.driver,
        proplist: data.proplist,
        priority: data.priority,
        flags: data.flags,
        state: DeviceState::Init,
        suspend_cause: data.suspend_cause,
        spec,
        map,
        default_sample_rate: spec.rate,
        alternate_sample_rate,
        avoid_resampling: data
            .avoid_resampling
            .unwrap_or(ctx.config.avoid_resampling),
        formats,
        reference_volume: volume.clone(),
        real_volume: volume,
        soft_volume: ChannelVolumes::norm(spec.channels),
        base_volume: Volume::NORM,
        n_volume_steps: Volume::NORM.0 + 1,
        muted: data.muted.unwrap_or(false),
        save_volume: data.save_volume,
        save_muted: data.save_muted,
        save_port: data.save_port,
        refresh_volume: false,
        refresh_muted: false,
        set_mute_in_progress: false,
        ports,
        active_port: data.active_port,
        port_latency_offset,
        streams: Default::default(),
        n_corked: 0,
        master_stream: None,
        unlink_requested: false,
        saved_volume: None,
        saved_save_volume: false,
        driver: callbacks.control,
        io: IoLink::Local(Box::new(io)),
    })
}

impl Core {
    /// First phase of device creation. The device exists afterwards but is
    /// inert until [`Core::put_device`].
    pub fn create_device<D: Direction>(
        &mut self,
        mut data: DeviceNewData<D>,
        callbacks: DeviceCallbacks,
    ) -> RoutingResult<DeviceId<D>> {
        let (domain, ctx) = D::split(self);
        let index = domain.peek_device_index();
        let name = ctx
            .names
            .register(&data.name, D::NAME_KIND, index, data.fail_on_name_collision)?;
        data.name = name.clone();
        match build_device(domain, ctx, index, data, callbacks) {
            Ok(device) => {
                tracing::info!(kind = D::DEVICE_NOUN, index, name = %name, "created device");
                domain.insert_device(device);
                Ok(DeviceId::new(index))
            }
            Err(err) => {
                ctx.names.unregister(&name);
                tracing::debug!(kind = D::DEVICE_NOUN, name = %name, %err, "device creation refused");
                Err(err)
            }
        }
    }

    /// Activates a device: settles its volume flags, starts the realtime
    /// thread and announces it.
    pub fn put_device<D: Direction>(&mut self, id: DeviceId<D>) -> RoutingResult<()> {
        let flat_volumes = self.ctx.config.flat_volumes;
        let capacity = self.ctx.config.message_queue_capacity;
        let domain = D::domain_mut(self);
        let device = domain.device(id.index())?;
        if device.state != DeviceState::Init {
            return Err(RoutingError::BadState("device already put"));
        }
        let root_volumes = if device.shares_volume() {
            let root = propagation::get_root(domain, id.index())
                .filter(|root| *root != id.index())
                .ok_or(RoutingError::BadState("volume sharing device without a master"))?;
            let root = domain.device(root)?;
            Some((
                root.reference_volume.clone(),
                root.real_volume.clone(),
                root.map.clone(),
            ))
        } else {
            None
        };

        let device = domain.device_mut(id.index())?;
        if !device.flags.contains(DeviceFlags::HW_VOLUME_CTRL) {
            device.flags |= DeviceFlags::DECIBEL_VOLUME;
            device.base_volume = Volume::NORM;
            device.soft_volume = device.reference_volume.clone();
        }
        if device.flags.contains(DeviceFlags::DECIBEL_VOLUME) && flat_volumes {
            device.flags |= DeviceFlags::FLAT_VOLUME;
        }
        match root_volumes {
            Some((reference, real, root_map)) => {
                device.soft_volume = ChannelVolumes::norm(device.spec.channels);
                device.reference_volume = reference.remap(&root_map, &device.map);
                device.real_volume = real.remap(&root_map, &device.map);
            }
            None => device.reference_volume = device.real_volume.clone(),
        }

        let flags = device.flags;
        let muted = device.muted;
        let soft = device.soft_volume.clone();
        let hw = device.real_volume.divide(&device.soft_volume);
        if let IoLink::Local(io) = &mut device.io {
            io.set_flags(flags);
            io.soft_volume = soft;
            io.soft_muted = muted;
            io.current_hw_volume = hw;
        }
        let offset = device.port_latency_offset;
        device.io.send(DeviceMsg::SetPortLatencyOffset(offset))?;
        device.io.spawn(capacity)?;

        let cause = device.suspend_cause;
        let state = if cause.is_empty() {
            DeviceState::Idle
        } else {
            DeviceState::Suspended
        };
        self.set_device_state(id, state, cause)?;

        self.ctx.post(D::DEVICE_FACILITY, EventKind::New, id.index());
        let mut hook_id = id;
        D::domain(self).hooks.device_put.fire(&mut hook_id);
        tracing::info!(device = %id, ?state, ?flags, "device linked");

        self.update_default_device::<D>();
        self.move_streams_to_preferred(id);
        Ok(())
    }

    /// Tears a device down. Safe on devices that were never put and on
    /// devices already being unlinked.
    pub fn unlink_device<D: Direction>(&mut self, id: DeviceId<D>) {
        let rescue = self.ctx.config.rescue_streams;
        let (domain, ctx) = D::split(self);
        let Some(device) = domain.devices.get_mut(&id.index()) else {
            return;
        };
        if device.unlink_requested {
            return;
        }
        device.unlink_requested = true;
        let linked = device.is_linked();
        let name = device.name.clone();
        let master = device.master_stream;

        let mut hook_id = id;
        if linked {
            domain.hooks.device_unlink.fire(&mut hook_id);
        }
        ctx.names.unregister(&name);

        self.update_default_device::<D>();
        if linked && rescue {
            self.move_streams_to_default(id, false);
        }
        let remaining: Vec<u32> = D::domain(self)
            .devices
            .get(&id.index())
            .map(|d| d.streams.iter().copied().collect())
            .unwrap_or_default();
        for stream in remaining {
            self.kill_stream(StreamId::<D>::new(stream));
        }

        if linked {
            let cause = D::domain(self)
                .devices
                .get(&id.index())
                .map_or(SuspendCause::empty(), |d| d.suspend_cause);
            if let Err(err) = self.set_device_state(id, DeviceState::Unlinked, cause) {
                tracing::debug!(device = %id, %err, "state change during unlink failed");
            }
        } else if let Some(device) = D::domain_mut(self).devices.get_mut(&id.index()) {
            device.state = DeviceState::Unlinked;
        }

        let (domain, ctx) = D::split(self);
        if let Some(mut device) = domain.devices.remove(&id.index()) {
            device.io.stop();
        }
        if linked {
            ctx.post(D::DEVICE_FACILITY, EventKind::Remove, id.index());
            domain.hooks.device_unlink_post.fire(&mut hook_id);
        }
        tracing::info!(device = %id, name = %name, "device unlinked");

        // the stream feeding a filter has no purpose without the filter
        if let Some(master) = master {
            self.kill_stream(StreamId::<D>::new(master));
        }
    }

    /// Moves the device to `state` with suspend causes `cause`. Only
    /// resuming may fail; a failed resume leaves the device suspended with
    /// an empty cause and reports the driver error.
    pub(crate) fn set_device_state<D: Direction>(
        &mut self,
        id: DeviceId<D>,
        state: DeviceState,
        cause: SuspendCause,
    ) -> RoutingResult<()> {
        let (domain, ctx) = D::split(self);
        let device = domain.device_mut(id.index())?;
        let old_state = device.state;
        let old_cause = device.suspend_cause;
        if old_state == state && old_cause == cause {
            return Ok(());
        }
        let resuming = old_state == DeviceState::Suspended && state.is_opened();
        let mut state = state;
        let mut cause = cause;
        let mut failure = None;

        if let Err(err) = device.driver.set_state(state, cause) {
            if !resuming {
                tracing::warn!(device = %device.name, ?state, %err, "driver refused state change");
                return Err(err.into());
            }
            tracing::warn!(device = %device.name, %err, "failed to resume device");
            failure = Some(RoutingError::from(err));
            state = DeviceState::Suspended;
            cause = SuspendCause::empty();
        }
        if let Err(err) = device.io.send(DeviceMsg::SetState { state, cause }) {
            if !resuming || failure.is_some() {
                return Err(err);
            }
            tracing::warn!(device = %device.name, %err, "realtime thread failed to resume device");
            if let Err(revert) = device.driver.set_state(DeviceState::Suspended, SuspendCause::empty()) {
                tracing::debug!(device = %device.name, %revert, "driver refused to suspend again");
            }
            failure = Some(err);
            state = DeviceState::Suspended;
            cause = SuspendCause::empty();
        }

        device.state = state;
        device.suspend_cause = cause;
        tracing::debug!(device = %device.name, ?old_state, ?state, ?cause, "device state changed");
        let streams: Vec<u32> = device.streams.iter().copied().collect();

        let mut hook_id = id;
        if state != old_state && state != DeviceState::Unlinked {
            domain.hooks.device_state_changed.fire(&mut hook_id);
            ctx.post(D::DEVICE_FACILITY, EventKind::Change, id.index());
        }

        let suspending = old_state.is_opened() && state == DeviceState::Suspended;
        let resumed = old_state == DeviceState::Suspended && state.is_opened();
        if suspending || resumed || cause != old_cause {
            let suspended = state == DeviceState::Suspended;
            for index in streams {
                let Some(stream) = D::domain_mut(self).streams.get_mut(&index) else {
                    continue;
                };
                if suspended && stream.flags.contains(StreamFlags::KILL_ON_SUSPEND) {
                    self.kill_stream(StreamId::<D>::new(index));
                } else {
                    stream.driver.suspend(suspended);
                }
            }
        }

        match failure {
            Some(err) => {
                self.ctx.events.publish(CoreEvent::DriverFailure {
                    facility: D::DEVICE_FACILITY,
                    index: id.index(),
                    message: err.to_string(),
                });
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Sets or clears one suspend cause. The device runs again only once
    /// every cause is cleared.
    pub fn suspend_device<D: Direction>(
        &mut self,
        id: DeviceId<D>,
        suspend: bool,
        cause: SuspendCause,
    ) -> RoutingResult<()> {
        if cause.is_empty() {
            return Err(RoutingError::Invalid("empty suspend cause"));
        }
        let device = D::domain(self).device(id.index())?;
        if !device.is_linked() {
            return Err(RoutingError::BadState("device not linked"));
        }
        let merged = if suspend {
            device.suspend_cause | cause
        } else {
            device.suspend_cause.difference(cause)
        };
        let state = if !merged.is_empty() {
            DeviceState::Suspended
        } else if device.used_by() > 0 {
            DeviceState::Running
        } else {
            DeviceState::Idle
        };
        self.set_device_state(id, state, merged)
    }

    /// Applies [`Core::suspend_device`] to every linked device of one
    /// direction. Returns the last failure.
    pub fn suspend_all<D: Direction>(&mut self, suspend: bool, cause: SuspendCause) -> RoutingResult<()> {
        let devices: Vec<u32> = D::domain(self)
            .devices
            .values()
            .filter(|d| d.is_linked())
            .map(|d| d.index)
            .collect();
        let mut result = Ok(());
        for index in devices {
            if let Err(err) = self.suspend_device(DeviceId::<D>::new(index), suspend, cause) {
                result = Err(err);
            }
        }
        result
    }

    /// Re-evaluates Idle versus Running after the stream set changed.
    pub(crate) fn update_device_status<D: Direction>(&mut self, id: DeviceId<D>) {
        let Some(device) = D::domain(self).devices.get(&id.index()) else {
            return;
        };
        if !device.is_linked() || device.state == DeviceState::Suspended {
            return;
        }
        let state = if device.used_by() > 0 {
            DeviceState::Running
        } else {
            DeviceState::Idle
        };
        if let Err(err) = self.set_device_state(id, state, SuspendCause::empty()) {
            tracing::debug!(device = %id, %err, "status update failed");
        }
    }

    pub fn device_used_by<D: Direction>(&self, id: DeviceId<D>) -> RoutingResult<usize> {
        Ok(D::domain(self).device(id.index())?.used_by())
    }

    pub fn device_linked_by<D: Direction>(&self, id: DeviceId<D>) -> RoutingResult<usize> {
        Ok(D::domain(self).device(id.index())?.linked_by())
    }

    /// Streams that keep the device from being suspended for idleness.
    pub fn device_check_suspend<D: Direction>(
        &self,
        id: DeviceId<D>,
        ignore: Option<StreamId<D>>,
    ) -> RoutingResult<usize> {
        let domain = D::domain(self);
        let device = domain.device(id.index())?;
        let count = device
            .streams
            .iter()
            .filter(|index| ignore.map(StreamId::index) != Some(**index))
            .filter_map(|index| domain.streams.get(index))
            .filter(|stream| {
                stream.state == StreamState::Running
                    && !stream.flags.contains(StreamFlags::DONT_INHIBIT_AUTO_SUSPEND)
            })
            .count();
        Ok(count)
    }

    pub fn set_configured_default<D: Direction>(&mut self, name: Option<&str>) {
        let domain = D::domain_mut(self);
        if domain.configured_default.as_deref() == name {
            return;
        }
        domain.configured_default = name.map(str::to_string);
        self.update_default_device::<D>();
    }

    /// Picks the best linked device as default. Streams on the previous
    /// default follow the new one unless they explicitly prefer the old.
    pub(crate) fn update_default_device<D: Direction>(&mut self) {
        let domain = D::domain(self);
        let mut best: Option<&Device<D>> = None;
        for device in domain.devices.values() {
            if !device.is_linked() || device.unlink_requested {
                continue;
            }
            best = match best {
                Some(current) if compare_devices(domain, device, current) != Ordering::Greater => Some(current),
                _ => Some(device),
            };
        }
        let new = best.map(|d| d.index);
        let old = domain.default_device;
        if new == old {
            return;
        }
        let (domain, ctx) = D::split(self);
        domain.default_device = new;
        tracing::info!(kind = D::DEVICE_NOUN, ?old, ?new, "default device changed");
        let mut hook_data = new.map(DeviceId::new);
        domain.hooks.default_changed.fire(&mut hook_data);
        ctx.events.publish(CoreEvent::DefaultChanged {
            facility: D::DEVICE_FACILITY,
            index: new,
        });
        if let Some(old) = old {
            self.move_streams_to_default(DeviceId::<D>::new(old), true);
        }
    }

    /// Moves the streams of `old` to the current default device. When the
    /// default merely changed, streams that explicitly prefer `old` stay.
    pub(crate) fn move_streams_to_default<D: Direction>(&mut self, old: DeviceId<D>, default_changed: bool) {
        let domain = D::domain(self);
        let Some(default) = domain.default_device else {
            return;
        };
        if default == old.index() {
            return;
        }
        let Some(device) = domain.devices.get(&old.index()) else {
            return;
        };
        let candidates: Vec<u32> = device
            .streams
            .iter()
            .filter_map(|index| domain.streams.get(index))
            .filter(|stream| stream.is_linked() && stream.device.is_some() && stream.origin_device.is_none())
            .filter(|stream| !(default_changed && stream.preferred_device.as_deref() == Some(device.name.as_str())))
            .map(|stream| stream.index)
            .collect();

        let dest = DeviceId::<D>::new(default);
        for index in candidates {
            let stream = StreamId::<D>::new(index);
            if !self.may_move_stream_to(stream, dest) {
                continue;
            }
            if default_changed {
                tracing::info!(%stream, from = %old, to = %dest, "following the default device");
            }
            if let Err(err) = self.move_stream_to(stream, dest, false) {
                tracing::debug!(%stream, %err, "could not move stream to the default device");
            }
        }
    }

    /// Brings back streams that prefer a device which just appeared.
    fn move_streams_to_preferred<D: Direction>(&mut self, id: DeviceId<D>) {
        let domain = D::domain(self);
        let Some(device) = domain.devices.get(&id.index()) else {
            return;
        };
        let candidates: Vec<u32> = domain
            .streams
            .values()
            .filter(|s| s.is_linked() && s.device.is_some() && s.device != Some(id.index()))
            .filter(|s| s.preferred_device.as_deref() == Some(device.name.as_str()))
            .map(|s| s.index)
            .collect();
        for index in candidates {
            let stream = StreamId::<D>::new(index);
            if self.may_move_stream_to(stream, id) {
                if let Err(err) = self.move_stream_to(stream, id, false) {
                    tracing::debug!(%stream, %err, "could not return stream to its preferred device");
                }
            }
        }
    }

    /// Sets the device volume. `None` recomputes it from the attached
    /// streams, which needs flat volume. The write lands on the root of a
    /// sharing chain.
    pub fn set_device_volume<D: Direction>(
        &mut self,
        id: DeviceId<D>,
        volume: Option<&ChannelVolumes>,
        send_msg: bool,
        save: bool,
    ) -> RoutingResult<()> {
        let (domain, ctx) = D::split(self);
        let device = domain.device(id.index())?;
        if !device.is_linked() {
            return Err(RoutingError::BadState("device not linked"));
        }
        let passthrough_level = device.base_volume.min(Volume::NORM);
        let passthrough = propagation::get_root(domain, id.index()).is_some_and(|root| is_passthrough(domain, root));
        match volume {
            Some(v) if !v.is_valid() || !(v.channels() == 1 || v.is_compatible(&device.spec)) => {
                return Err(RoutingError::Invalid("volume"));
            }
            Some(v) if passthrough && v.values().iter().any(|level| *level != passthrough_level) => {
                tracing::warn!(device = %device.name, "cannot change volume while a passthrough stream is attached");
                return Err(RoutingError::Busy("passthrough stream attached"));
            }
            None if passthrough => {
                return Err(RoutingError::Busy("passthrough stream attached"));
            }
            None if !propagation::flat_volume_enabled(domain, id.index()) => {
                return Err(RoutingError::NotSupported("volume recompute without flat volume"));
            }
            _ => {}
        }
        let root = propagation::get_root(domain, id.index())
            .ok_or(RoutingError::BadState("volume sharing chain is broken"))?;
        let flat = propagation::flat_volume_enabled(domain, root);
        let mut changes = VolumeChanges::default();

        match volume {
            Some(v) => {
                let device = domain.device(id.index())?;
                let reference = if v.channels() == 1 {
                    device.reference_volume.scale(v.max())
                } else {
                    v.clone()
                };
                let map = device.map.clone();
                let changed = propagation::update_reference_volume(domain, root, &reference, &map, save, &mut changes);
                if changed && flat {
                    propagation::propagate_reference_volume(domain, root, &mut changes);
                    propagation::compute_real_volume(domain, root, &mut changes);
                } else if changed {
                    let root_dev = domain.device(root)?;
                    let reference = root_dev.reference_volume.clone();
                    let map = root_dev.map.clone();
                    propagation::update_real_volume(domain, root, &reference, &map, &mut changes);
                }
            }
            None => {
                propagation::compute_real_volume(domain, root, &mut changes);
                let root_dev = domain.device(root)?;
                let device = domain.device(id.index())?;
                let real = root_dev.real_volume.remap(&root_dev.map, &device.map);
                let pushed = device.reference_volume.merge(&real);
                let map = device.map.clone();
                propagation::update_reference_volume(domain, root, &pushed, &map, save, &mut changes);
                propagation::compute_reference_ratios(domain, root);
            }
        }

        let root_dev = domain.device_mut(root)?;
        if root_dev.flags.contains(DeviceFlags::HW_VOLUME_CTRL) {
            root_dev.soft_volume = ChannelVolumes::norm(root_dev.spec.channels);
            if !root_dev.flags.contains(DeviceFlags::DEFERRED_VOLUME) {
                let real = root_dev.real_volume.clone();
                match root_dev.driver.set_volume(&real) {
                    Ok(Some(soft)) if soft.is_compatible(&root_dev.spec) => root_dev.soft_volume = soft,
                    Ok(_) => {}
                    Err(err) => tracing::warn!(device = %root_dev.name, %err, "hardware volume write failed"),
                }
            }
        } else {
            root_dev.soft_volume = root_dev.real_volume.clone();
        }

        changes.notify(domain, ctx);
        if send_msg {
            sync_thread_volumes(domain, root, true);
        }
        Ok(())
    }

    /// Recomputes a flat device's volume from its streams; no-op on devices
    /// without flat volume.
    pub(crate) fn refresh_flat_volume<D: Direction>(&mut self, device: u32, send_msg: bool, save: bool) {
        let domain = D::domain(self);
        if !domain.devices.get(&device).is_some_and(|d| d.is_linked())
            || !propagation::flat_volume_enabled(domain, device)
        {
            return;
        }
        if let Err(err) = self.set_device_volume(DeviceId::<D>::new(device), None, send_msg, save) {
            tracing::debug!(device, %err, "flat volume not recomputed");
        }
    }

    /// Returns the reference volume, re-reading the hardware first when
    /// asked to or when the driver cannot notify changes.
    pub fn get_device_volume<D: Direction>(
        &mut self,
        id: DeviceId<D>,
        force_refresh: bool,
    ) -> RoutingResult<ChannelVolumes> {
        let (domain, ctx) = D::split(self);
        let device = domain.device_mut(id.index())?;
        if device.refresh_volume || force_refresh {
            let old_real = device.real_volume.clone();
            if !device.flags.contains(DeviceFlags::DEFERRED_VOLUME) {
                match device.driver.get_volume() {
                    Ok(Some(real)) if real.is_compatible(&device.spec) => device.real_volume = real,
                    Ok(_) => {}
                    Err(err) => tracing::debug!(device = %device.name, %err, "hardware volume read failed"),
                }
            }
            match device.io.send(DeviceMsg::GetVolume).and_then(|reply| reply.into_volume()) {
                Ok(Some(real)) if real.is_compatible(&device.spec) => device.real_volume = real,
                Ok(_) => {}
                Err(err) => tracing::debug!(device = %device.name, %err, "realtime volume read failed"),
            }
            let real = device.real_volume.clone();
            let map = device.map.clone();
            let mut changes = VolumeChanges::default();
            propagation::update_real_volume(domain, id.index(), &real, &map, &mut changes);
            propagation::propagate_real_volume(domain, id.index(), &old_real, &mut changes);
            changes.notify(domain, ctx);
        }
        Ok(domain.device(id.index())?.reference_volume.clone())
    }

    /// The hardware reports a new real volume, e.g. a physical knob moved.
    /// The change becomes the new reference and is marked for saving.
    pub fn device_volume_changed<D: Direction>(
        &mut self,
        id: DeviceId<D>,
        new_real: &ChannelVolumes,
    ) -> RoutingResult<()> {
        let (domain, ctx) = D::split(self);
        let device = domain.device(id.index())?;
        if !new_real.is_valid() || !new_real.is_compatible(&device.spec) {
            return Err(RoutingError::Invalid("volume"));
        }
        let old_real = device.real_volume.clone();
        let map = device.map.clone();
        let mut changes = VolumeChanges::default();
        propagation::update_real_volume(domain, id.index(), new_real, &map, &mut changes);
        propagation::propagate_real_volume(domain, id.index(), &old_real, &mut changes);
        changes.notify(domain, ctx);
        Ok(())
    }

    pub fn set_device_mute<D: Direction>(&mut self, id: DeviceId<D>, muted: bool, save: bool) -> RoutingResult<()> {
        let (domain, ctx) = D::split(self);
        let device = domain.device_mut(id.index())?;
        if device.muted == muted {
            device.save_muted |= save;
            return Ok(());
        }
        device.muted = muted;
        device.save_muted = save;
        if device.flags.contains(DeviceFlags::HW_MUTE_CTRL) && !device.flags.contains(DeviceFlags::DEFERRED_VOLUME) {
            device.set_mute_in_progress = true;
            let result = device.driver.set_mute(muted);
            device.set_mute_in_progress = false;
            if let Err(err) = result {
                tracing::warn!(device = %device.name, %err, "hardware mute write failed");
            }
        }
        if !device.is_linked() {
            return Ok(());
        }
        device.io.send(DeviceMsg::SetMute { muted })?;
        tracing::debug!(device = %device.name, muted, "device mute changed");
        ctx.post(D::DEVICE_FACILITY, EventKind::Change, id.index());
        let mut hook_id = id;
        domain.hooks.device_mute_changed.fire(&mut hook_id);
        Ok(())
    }

    pub fn get_device_mute<D: Direction>(&mut self, id: DeviceId<D>, force_refresh: bool) -> RoutingResult<bool> {
        let device = D::domain_mut(self).device_mut(id.index())?;
        if device.refresh_muted || force_refresh {
            let reported = if device.flags.contains(DeviceFlags::DEFERRED_VOLUME) {
                device.io.send(DeviceMsg::GetMute)?.into_mute()?
            } else {
                device.driver.get_mute().unwrap_or_else(|err| {
                    tracing::debug!(device = %device.name, %err, "hardware mute read failed");
                    None
                })
            };
            if let Some(muted) = reported {
                self.device_mute_changed(id, muted)?;
            }
        }
        Ok(D::domain(self).device(id.index())?.muted)
    }

    /// The hardware reports a mute change. Ignored while we are writing the
    /// mute ourselves.
    pub fn device_mute_changed<D: Direction>(&mut self, id: DeviceId<D>, muted: bool) -> RoutingResult<()> {
        let device = D::domain(self).device(id.index())?;
        if device.set_mute_in_progress || device.muted == muted {
            return Ok(());
        }
        self.set_device_mute(id, muted, true)
    }

    pub fn set_base_volume<D: Direction>(&mut self, id: DeviceId<D>, base: Volume) -> RoutingResult<()> {
        let (domain, ctx) = D::split(self);
        let device = domain.device_mut(id.index())?;
        if !base.is_valid() {
            return Err(RoutingError::Invalid("base volume"));
        }
        device.base_volume = base;
        if device.is_linked() {
            ctx.post(D::DEVICE_FACILITY, EventKind::Change, id.index());
        }
        Ok(())
    }

    pub fn set_n_volume_steps<D: Direction>(&mut self, id: DeviceId<D>, steps: u32) -> RoutingResult<()> {
        let (domain, ctx) = D::split(self);
        let device = domain.device_mut(id.index())?;
        if steps < 2 {
            return Err(RoutingError::Invalid("volume steps"));
        }
        device.n_volume_steps = steps;
        if device.is_linked() {
            ctx.post(D::DEVICE_FACILITY, EventKind::Change, id.index());
        }
        Ok(())
    }

    pub fn set_device_port<D: Direction>(&mut self, id: DeviceId<D>, name: &str, save: bool) -> RoutingResult<()> {
        let device = D::domain_mut(self).device_mut(id.index())?;
        if !device.driver.has_port_switch() {
            tracing::debug!(device = %device.name, "port switching not implemented by driver");
            return Err(RoutingError::NotImplemented("port switching"));
        }
        let port = device
            .ports
            .get(name)
            .cloned()
            .ok_or(RoutingError::NoEntity("port"))?;
        if device.active_port.as_deref() == Some(name) {
            device.save_port |= save;
            return Ok(());
        }
        if let Err(err) = device.driver.set_port(&port) {
            tracing::warn!(device = %device.name, port = %port.name, %err, "port switch failed");
            return Err(err.into());
        }
        tracing::info!(
            device = %device.name,
            from = ?device.active_port,
            to = %port.name,
            "changed active port"
        );
        device.active_port = Some(port.name.clone());
        device.save_port = save;
        self.ctx.post(D::DEVICE_FACILITY, EventKind::Change, id.index());

        self.set_port_latency_offset(id, port.latency_offset)?;
        self.update_default_device::<D>();
        let mut hook_id = id;
        D::domain(self).hooks.device_port_changed.fire(&mut hook_id);
        Ok(())
    }

    /// Latency offset of the active port, added to every latency report.
    pub fn set_port_latency_offset<D: Direction>(&mut self, id: DeviceId<D>, offset: i64) -> RoutingResult<()> {
        let (domain, ctx) = D::split(self);
        let device = domain.device_mut(id.index())?;
        device.port_latency_offset = offset;
        if let Some(name) = device.active_port.clone() {
            if let Some(port) = device.ports.get_mut(&name) {
                port.latency_offset = offset;
            }
        }
        device.io.send(DeviceMsg::SetPortLatencyOffset(offset))?;
        if device.is_linked() {
            ctx.post(D::DEVICE_FACILITY, EventKind::Change, id.index());
        }
        Ok(())
    }

    /// Records a jack detection result. Availability of the active port
    /// takes part in default device selection.
    pub fn set_port_available<D: Direction>(
        &mut self,
        id: DeviceId<D>,
        port: &str,
        available: PortAvailable,
    ) -> RoutingResult<()> {
        let (domain, ctx) = D::split(self);
        let device = domain.device_mut(id.index())?;
        let entry = device.ports.get_mut(port).ok_or(RoutingError::NoEntity("port"))?;
        if entry.available == available {
            return Ok(());
        }
        entry.available = available;
        tracing::debug!(device = %device.name, port, ?available, "port availability changed");
        if device.is_linked() {
            ctx.post(D::DEVICE_FACILITY, EventKind::Change, id.index());
        }
        self.update_default_device::<D>();
        Ok(())
    }

    /// Tries to reopen the device in a format closer to `spec`. Streams that
    /// are corked get new resamplers afterwards.
    pub fn reconfigure_device<D: Direction>(
        &mut self,
        id: DeviceId<D>,
        spec: &SampleSpec,
        passthrough: bool,
    ) -> RoutingResult<()> {
        let domain = D::domain(self);
        let device = domain.device(id.index())?;
        if *spec == device.spec {
            return Ok(());
        }
        if !device.driver.has_reconfigure() {
            return Err(RoutingError::NotSupported("device cannot be reconfigured"));
        }
        let default_rate = device.default_sample_rate;
        let alternate_rate = device.alternate_sample_rate;
        let avoid_resampling = device.avoid_resampling;
        if default_rate == alternate_rate && !passthrough && !avoid_resampling {
            tracing::debug!(device = %device.name, "default and alternate rates are equal, not switching");
            return Ok(());
        }
        if device.state == DeviceState::Running {
            tracing::debug!(device = %device.name, "device running, keeping its sample spec");
            return Err(RoutingError::Busy("device is running"));
        }
        if !device.is_linked() {
            return Err(RoutingError::BadState("device not linked"));
        }
        if !spec.is_valid() {
            return Err(RoutingError::Invalid("sample spec"));
        }

        let mut desired = device.spec;
        if passthrough {
            desired = *spec;
        } else if avoid_resampling {
            // only follow the stream when its rate is not too low
            if spec.rate >= default_rate || spec.rate >= alternate_rate {
                desired.rate = spec.rate;
            }
            desired.format = spec.format;
        } else if default_rate == spec.rate || alternate_rate == spec.rate {
            desired.rate = spec.rate;
        } else {
            let usable = |rate: u32| {
                (rate % 11_025 == 0 && spec.rate % 11_025 == 0) || (rate % 4_000 == 0 && spec.rate % 4_000 == 0)
            };
            desired.rate = if usable(alternate_rate) && !usable(default_rate) {
                alternate_rate
            } else {
                default_rate
            };
        }
        if desired == device.spec && passthrough == is_passthrough(domain, id.index()) {
            return Ok(());
        }
        if !passthrough && device.used_by() > 0 {
            return Err(RoutingError::Busy("device in use"));
        }

        tracing::debug!(device = %device.name, ?desired, "suspending device to change its format");
        self.suspend_device(id, true, SuspendCause::INTERNAL)?;
        let result = self.apply_reconfigure(id, desired, passthrough);
        if result.is_ok() {
            let corked: Vec<u32> = D::domain(self)
                .devices
                .get(&id.index())
                .map(|d| d.streams.iter().copied().collect())
                .unwrap_or_default();
            for index in corked {
                let stream = StreamId::<D>::new(index);
                if self.stream(stream).is_some_and(|s| s.is_corked()) {
                    if let Err(err) = self.update_stream_resampler(stream) {
                        tracing::debug!(%stream, %err, "resampler update after reconfigure failed");
                    }
                }
            }
        }
        if let Err(err) = self.suspend_device(id, false, SuspendCause::INTERNAL) {
            tracing::warn!(device = %id, %err, "device did not resume after reconfigure");
        }
        result
    }

    fn apply_reconfigure<D: Direction>(
        &mut self,
        id: DeviceId<D>,
        desired: SampleSpec,
        passthrough: bool,
    ) -> RoutingResult<()> {
        let device = D::domain_mut(self).device_mut(id.index())?;
        let mut accepted = desired;
        if let Err(err) = device.driver.reconfigure(&mut accepted, passthrough) {
            tracing::debug!(device = %device.name, %err, "driver refused reconfigure");
            return Err(err.into());
        }
        if !accepted.is_valid() {
            return Err(RoutingError::driver("driver accepted an invalid sample spec"));
        }
        let map = if accepted.channels == device.map.channels() {
            device.map.clone()
        } else {
            ChannelMap::default_for(accepted.channels)
                .ok_or(RoutingError::Invalid("no default channel map for channel count"))?
        };
        device.spec = accepted;
        device.map = map.clone();
        if device.reference_volume.channels() != accepted.channels {
            device.reference_volume = ChannelVolumes::uniform(accepted.channels, device.reference_volume.max());
            device.real_volume = ChannelVolumes::uniform(accepted.channels, device.real_volume.max());
            device.soft_volume = ChannelVolumes::uniform(accepted.channels, device.soft_volume.max());
        }
        device.io.send(DeviceMsg::SetSpec { spec: accepted, map })?;
        tracing::info!(device = %device.name, spec = ?accepted, passthrough, "device reconfigured");
        Ok(())
    }

    /// Saves the device volume and sets unity while a passthrough stream
    /// is attached.
    pub(crate) fn enter_passthrough<D: Direction>(&mut self, id: DeviceId<D>) {
        let saved = match self.get_device_volume(id, true) {
            Ok(volume) => volume,
            Err(err) => {
                tracing::debug!(device = %id, %err, "cannot enter passthrough mode");
                return;
            }
        };
        let Ok(device) = D::domain_mut(self).device_mut(id.index()) else {
            return;
        };
        device.saved_volume = Some(saved);
        device.saved_save_volume = device.save_volume;
        let unity = ChannelVolumes::uniform(device.spec.channels, device.base_volume.min(Volume::NORM));
        if let Err(err) = self.set_device_volume(id, Some(&unity), true, false) {
            tracing::debug!(device = %id, %err, "passthrough volume not applied");
        }
        tracing::debug!(device = %id, "device entered passthrough mode");
    }

    pub(crate) fn leave_passthrough<D: Direction>(&mut self, id: DeviceId<D>) {
        let Ok(device) = D::domain_mut(self).device_mut(id.index()) else {
            return;
        };
        let saved = device.saved_volume.take();
        let save = std::mem::take(&mut device.saved_save_volume);
        if let Some(volume) = saved {
            if let Err(err) = self.set_device_volume(id, Some(&volume), true, save) {
                tracing::debug!(device = %id, %err, "volume not restored after passthrough");
            }
        }
    }

    pub fn device_is_passthrough<D: Direction>(&self, id: DeviceId<D>) -> bool {
        is_passthrough(D::domain(self), id.index())
    }

    /// Device formats intersected with `requested`, in request order.
    pub fn check_device_formats<D: Direction>(
        &self,
        id: DeviceId<D>,
        requested: &[FormatInfo],
    ) -> RoutingResult<Vec<FormatInfo>> {
        let device = D::domain(self).device(id.index())?;
        Ok(negotiate_formats(&device.formats, requested))
    }

    pub fn check_device_format<D: Direction>(&self, id: DeviceId<D>, format: &FormatInfo) -> bool {
        D::domain(self)
            .devices
            .get(&id.index())
            .is_some_and(|device| device.formats.iter().any(|offer| offer.is_compatible(format)))
    }

    /// Asks the driver to accept `formats`. Only devices flagged
    /// `SET_FORMATS` can change their format list.
    pub fn set_device_formats<D: Direction>(&mut self, id: DeviceId<D>, formats: &[FormatInfo]) -> RoutingResult<()> {
        let (domain, ctx) = D::split(self);
        let device = domain.device_mut(id.index())?;
        if !device.flags.contains(DeviceFlags::SET_FORMATS) {
            return Err(RoutingError::NotSupported("device formats are fixed"));
        }
        if !device.driver.set_formats(formats) {
            return Err(RoutingError::driver("driver refused the format list"));
        }
        device.formats = device.driver.formats().unwrap_or_else(|| formats.to_vec());
        if device.is_linked() {
            ctx.post(D::DEVICE_FACILITY, EventKind::Change, id.index());
        }
        Ok(())
    }

    pub fn update_device_proplist<D: Direction>(
        &mut self,
        id: DeviceId<D>,
        mode: UpdateMode,
        properties: &Proplist,
    ) -> RoutingResult<()> {
        let (domain, ctx) = D::split(self);
        let device = domain.device_mut(id.index())?;
        device.proplist.update(mode, properties);
        if device.is_linked() {
            ctx.post(D::DEVICE_FACILITY, EventKind::Change, id.index());
        }
        Ok(())
    }

    /// Detaches every stream of the device for a batch move. Streams that
    /// refuse to move stay.
    pub fn move_all_start<D: Direction>(&mut self, id: DeviceId<D>) -> RoutingResult<Vec<StreamId<D>>> {
        let streams: Vec<u32> = D::domain(self).device(id.index())?.streams.iter().copied().collect();
        let mut detached = Vec::new();
        for index in streams {
            let stream = StreamId::<D>::new(index);
            match self.start_stream_move(stream) {
                Ok(()) => detached.push(stream),
                Err(err) => tracing::debug!(%stream, %err, "stream stays on its device"),
            }
        }
        Ok(detached)
    }

    /// Attaches streams detached by [`Core::move_all_start`] to `id`;
    /// failures go through the move-fail path.
    pub fn move_all_finish<D: Direction>(&mut self, id: DeviceId<D>, streams: Vec<StreamId<D>>, save: bool) {
        for stream in streams {
            if !self.stream(stream).is_some_and(|s| s.is_moving()) {
                continue;
            }
            if let Err(err) = self.finish_stream_move(stream, id, save) {
                tracing::debug!(%stream, device = %id, %err, "batch move failed");
                self.fail_stream_move(stream);
            }
        }
    }

    pub fn move_all_fail<D: Direction>(&mut self, streams: Vec<StreamId<D>>) {
        for stream in streams {
            if self.stream(stream).is_some_and(|s| s.is_moving()) {
                self.fail_stream_move(stream);
            }
        }
    }

    pub fn set_latency_range<D: Direction>(&mut self, id: DeviceId<D>, min: u64, max: u64) -> RoutingResult<()> {
        let device = D::domain_mut(self).device_mut(id.index())?;
        let range = LatencyRange::bounded(min, max);
        if range.min != range.max && !device.flags.contains(DeviceFlags::DYNAMIC_LATENCY) {
            return Err(RoutingError::Invalid("latency range on a fixed latency device"));
        }
        device.io.send(DeviceMsg::SetLatencyRange(range))?;
        Ok(())
    }

    pub fn get_latency_range<D: Direction>(&mut self, id: DeviceId<D>) -> RoutingResult<LatencyRange> {
        let device = D::domain_mut(self).device_mut(id.index())?;
        device.io.send(DeviceMsg::GetLatencyRange)?.into_range()
    }

    pub fn set_fixed_latency<D: Direction>(&mut self, id: DeviceId<D>, usec: u64) -> RoutingResult<()> {
        let device = D::domain_mut(self).device_mut(id.index())?;
        if device.flags.contains(DeviceFlags::DYNAMIC_LATENCY) {
            return Err(RoutingError::BadState("device has dynamic latency"));
        }
        device.io.send(DeviceMsg::SetFixedLatency(clamp_fixed_latency(usec)))?;
        Ok(())
    }

    /// The fixed latency, or 0 for dynamic latency devices.
    pub fn get_fixed_latency<D: Direction>(&mut self, id: DeviceId<D>) -> RoutingResult<u64> {
        let device = D::domain_mut(self).device_mut(id.index())?;
        if device.flags.contains(DeviceFlags::DYNAMIC_LATENCY) {
            return Ok(0);
        }
        device.io.send(DeviceMsg::GetFixedLatency)?.into_usec()
    }

    /// Latency the device should run at. 0 while suspended.
    pub fn get_requested_latency<D: Direction>(&mut self, id: DeviceId<D>) -> RoutingResult<u64> {
        let device = D::domain_mut(self).device_mut(id.index())?;
        if device.state == DeviceState::Suspended {
            return Ok(0);
        }
        device.io.send(DeviceMsg::GetRequestedLatency)?.into_usec()
    }

    /// Current device latency including the port offset, never negative.
    pub fn get_latency<D: Direction>(&mut self, id: DeviceId<D>) -> RoutingResult<u64> {
        let device = D::domain_mut(self).device_mut(id.index())?;
        let usec = device.io.send(DeviceMsg::GetLatency)?.into_latency()?;
        Ok(usec.max(0) as u64)
    }

    pub fn set_max_rewind<D: Direction>(&mut self, id: DeviceId<D>, nbytes: usize) -> RoutingResult<()> {
        let device = D::domain_mut(self).device_mut(id.index())?;
        device.io.send(DeviceMsg::SetMaxRewind(nbytes))?;
        Ok(())
    }

    pub fn get_max_rewind<D: Direction>(&mut self, id: DeviceId<D>) -> RoutingResult<usize> {
        let device = D::domain_mut(self).device_mut(id.index())?;
        device.io.send(DeviceMsg::GetMaxRewind)?.into_bytes()
    }

    pub fn set_max_request<D: Direction>(&mut self, id: DeviceId<D>, nbytes: usize) -> RoutingResult<()> {
        let device = D::domain_mut(self).device_mut(id.index())?;
        device.io.send(DeviceMsg::SetMaxRequest(nbytes))?;
        Ok(())
    }

    pub fn get_max_request<D: Direction>(&mut self, id: DeviceId<D>) -> RoutingResult<usize> {
        let device = D::domain_mut(self).device_mut(id.index())?;
        device.io.send(DeviceMsg::GetMaxRequest)?.into_bytes()
    }
}
