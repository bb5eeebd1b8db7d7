//! Control-side stream operations: the create/put/unlink lifecycle, corking,
//! volume, mute, rate, latency requests and events.

use crate::core::{Core, CoreContext, Domain, SendEventData};
use crate::device::control::{check_passthrough_connection, sync_thread_volumes};
use crate::device::DeviceState;
use crate::direction::{DeviceId, Direction, DirectionKind, StreamId};
use crate::driver::StreamCallbacks;
use crate::error::{RoutingError, RoutingResult};
use crate::hooks::{CoreEvent, EventKind, HookResult};
use crate::message::DeviceMsg;
use crate::propagation::{self, VolumeChanges};
use crate::proplist::{Proplist, UpdateMode};
use crate::resampler::{Resampler, ResamplerFlags};
use crate::sample::{negotiate_formats, ChannelMap, FormatInfo, SampleSpec, RATE_MAX};
use crate::stream::{Stream, StreamFlags, StreamIo, StreamNewData, StreamState};
use crate::volume::{combine_factors, ChannelVolumes};

/// Builds the converter between a stream and its device, if one is needed.
/// Playback converts stream to device, capture device to stream.
pub(crate) fn create_resampler<D: Direction>(
    ctx: &CoreContext,
    stream: (&SampleSpec, &ChannelMap),
    device: (&SampleSpec, &ChannelMap),
    flags: StreamFlags,
    passthrough: bool,
) -> RoutingResult<Option<Box<dyn Resampler>>> {
    let needed = flags.contains(StreamFlags::VARIABLE_RATE) || stream.0 != device.0 || stream.1 != device.1;
    if passthrough || !needed {
        return Ok(None);
    }
    let mut resampler_flags = ResamplerFlags::empty();
    if flags.contains(StreamFlags::VARIABLE_RATE) {
        resampler_flags |= ResamplerFlags::VARIABLE_RATE;
    }
    if flags.contains(StreamFlags::NO_REMAP) {
        resampler_flags |= ResamplerFlags::NO_REMAP;
    }
    if flags.contains(StreamFlags::NO_REMIX) {
        resampler_flags |= ResamplerFlags::NO_REMIX;
    }
    let resampler = match D::KIND {
        DirectionKind::Playback => ctx.resamplers.create(stream, device, resampler_flags)?,
        DirectionKind::Capture => ctx.resamplers.create(device, stream, resampler_flags)?,
    };
    Ok(Some(resampler))
}

/// Hands a realtime update to whoever owns the stream's realtime half: the
/// control side while the stream is initializing or moving, the device
/// thread otherwise.
fn deliver<D: Direction>(
    domain: &mut Domain<D>,
    stream: u32,
    local: impl FnOnce(&mut StreamIo),
    msg: DeviceMsg,
) -> RoutingResult<()> {
    let s = domain.stream_mut(stream)?;
    if let Some(io) = s.io.as_mut() {
        local(io);
        return Ok(());
    }
    let device = s.device.ok_or(RoutingError::BadState("stream is moving"))?;
    domain.device_mut(device)?.io.send(msg)?;
    Ok(())
}

/// Streams of the sync group `stream` belongs to, itself included, in
/// chain order.
pub(crate) fn sync_group<D: Direction>(domain: &Domain<D>, stream: u32) -> Vec<u32> {
    let mut first = stream;
    while let Some(prev) = domain.streams.get(&first).and_then(|s| s.sync_prev) {
        if prev == stream {
            break;
        }
        first = prev;
    }
    let mut group = vec![first];
    let mut current = first;
    while let Some(next) = domain.streams.get(&current).and_then(|s| s.sync_next) {
        if group.contains(&next) {
            break;
        }
        group.push(next);
        current = next;
    }
    group
}

fn original_map(data_map: Option<&ChannelMap>, spec: &SampleSpec) -> RoutingResult<ChannelMap> {
    match data_map {
        Some(map) if map.is_compatible(spec) => Ok(map.clone()),
        Some(_) => Err(RoutingError::Invalid("channel map does not match sample spec")),
        None => ChannelMap::default_for(spec.channels).ok_or(RoutingError::Invalid("channel count")),
    }
}

impl Core {
    /// First phase of stream creation: negotiates the format with the
    /// device, fixes the volume and allocates the stream in `Init`. Nothing
    /// flows until [`Core::put_stream`].
    pub fn create_stream<D: Direction>(
        &mut self,
        mut data: StreamNewData<D>,
        callbacks: StreamCallbacks,
    ) -> RoutingResult<StreamId<D>> {
        if let Some(client) = data.client {
            if let Some(props) = self.ctx.client_proplist(client) {
                data.proplist.update(UpdateMode::Merge, props);
            }
        }
        if let Some(origin) = data.origin_device {
            if self.device(origin).is_some_and(|d| d.shares_volume()) {
                data.volume_writable = false;
            }
        }
        if let Some(input) = data.direct_on_input {
            if D::KIND != DirectionKind::Capture || !self.sinks.streams.contains_key(&input) {
                return Err(RoutingError::Invalid("direct_on_input needs an existing playback stream"));
            }
        }
        let requested_map = original_map(data.channel_map.as_ref(), &data.sample_spec)?;
        if data.requested_formats.is_empty() {
            let format = FormatInfo::from_sample_spec(
                &data.sample_spec,
                Some(&requested_map),
                !data.flags.contains(StreamFlags::FIX_FORMAT),
                !data.flags.contains(StreamFlags::FIX_RATE),
                !data.flags.contains(StreamFlags::FIX_CHANNELS),
            )?;
            data.requested_formats.push(format);
        }

        if D::domain(self).hooks.stream_new.fire(&mut data) == HookResult::Cancel {
            return Err(RoutingError::Canceled);
        }
        let device = match data.device {
            Some(device) => device,
            None => self
                .default_device::<D>()
                .ok_or(RoutingError::NoEntity(D::DEVICE_NOUN))?,
        };
        data.device = Some(device);

        let domain = D::domain(self);
        let dev = domain.device(device.index())?;
        if !dev.is_linked() || dev.unlink_requested {
            return Err(RoutingError::BadState("device not linked"));
        }
        data.negotiated_formats = negotiate_formats(&dev.formats, &data.requested_formats);
        let format = data
            .negotiated_formats
            .first()
            .cloned()
            .ok_or(RoutingError::NotSupported("no format in common with the device"))?;

        if let Some(base) = data.sync_base {
            if !D::SUPPORTS_SYNC {
                return Err(RoutingError::Invalid("sync groups need playback streams"));
            }
            let base = domain.stream(base.index())?;
            if base.device != Some(device.index()) || base.state != StreamState::Corked {
                return Err(RoutingError::Invalid("sync base must be corked on the same device"));
            }
        }

        let (spec, map) = format.to_sample_spec(&dev.spec, &dev.map)?;
        data.format = Some(format);
        data.sample_spec = spec;
        data.channel_map = Some(map.clone());
        let passthrough = data.is_passthrough();
        check_passthrough_connection(domain, passthrough, device.index())?;

        if passthrough {
            data.volume = Some(ChannelVolumes::norm(spec.channels));
            data.volume_is_absolute = true;
            data.save_volume = false;
        } else if data.volume.is_none() {
            data.volume = Some(ChannelVolumes::norm(spec.channels));
            data.volume_is_absolute = false;
            data.save_volume = false;
        }
        if !data.volume_writable {
            data.save_volume = false;
        }
        if let Some(volume) = data.volume.take() {
            let volume = if volume.channels() == 1 {
                ChannelVolumes::uniform(spec.channels, volume.max())
            } else if volume.is_compatible_with_map(&requested_map) {
                volume.remap(&requested_map, &map)
            } else {
                return Err(RoutingError::Invalid("volume"));
            };
            if !volume.is_valid() {
                return Err(RoutingError::Invalid("volume"));
            }
            data.volume = Some(volume);
        }

        let device_spec = dev.spec;
        if !data.flags.contains(StreamFlags::VARIABLE_RATE) && spec != device_spec {
            if let Err(err) = self.reconfigure_device(device, &spec, passthrough) {
                tracing::debug!(%device, %err, "device keeps its sample spec");
            }
        }
        let domain = D::domain(self);
        let dev = domain.device(device.index())?;
        if passthrough && spec != dev.spec {
            tracing::debug!(%device, "device cannot match the passthrough stream format");
            return Err(RoutingError::NotSupported("device cannot carry the passthrough format"));
        }

        if domain.hooks.stream_fixate.fire(&mut data) == HookResult::Cancel {
            return Err(RoutingError::Canceled);
        }
        let spec = data.sample_spec;
        let map = data.channel_map.clone().unwrap_or_else(|| map.clone());
        if !spec.is_valid() || !map.is_compatible(&spec) {
            return Err(RoutingError::Invalid("fixated sample spec"));
        }
        let volume = data
            .volume
            .clone()
            .filter(|v| v.is_compatible(&spec))
            .ok_or(RoutingError::Invalid("fixated volume"))?;

        if data.flags.contains(StreamFlags::NO_CREATE_ON_SUSPEND) && dev.state == DeviceState::Suspended {
            return Err(RoutingError::BadState("device suspended"));
        }
        if dev.streams.len() >= self.ctx.config.max_streams_per_device {
            tracing::debug!(%device, "too many streams on device");
            return Err(RoutingError::TooLarge);
        }

        let passthrough = data.is_passthrough();
        let resampler = create_resampler::<D>(
            &self.ctx,
            (&spec, &map),
            (&dev.spec, &dev.map),
            data.flags,
            passthrough,
        )?;

        let volume = if !data.volume_is_absolute && propagation::flat_volume_enabled(domain, device.index()) {
            volume.multiply(&dev.reference_volume.remap(&dev.map, &map))
        } else {
            volume
        };
        let volume_factor = combine_factors(&data.volume_factor_items, spec.channels);
        let volume_factor_device = combine_factors(&data.volume_factor_device_items, dev.spec.channels);
        let device_spec = dev.spec;

        let domain = D::domain_mut(self);
        let max_rewind = domain
            .device_mut(device.index())?
            .io
            .send(DeviceMsg::GetMaxRewind)?
            .into_bytes()?;
        let index = domain.allocate_stream_index();
        let mut io = StreamIo::new(index, D::KIND, spec, device_spec, resampler, callbacks.render, max_rewind);
        io.volume_factor_device = volume_factor_device.clone();
        io.direct_on_input = data.direct_on_input;
        io.passthrough = passthrough;

        let stream = Stream {
            index,
            client: data.client,
            driver_name: data.driver,
            proplist: data.proplist,
            flags: data.flags,
            state: StreamState::Init,
            device: Some(device.index()),
            device_requested_by_application: data.device_requested_by_application,
            preferred_device: data.preferred_device,
            origin_device: data.origin_device.map(DeviceId::index),
            spec,
            map,
            format: data.format.unwrap_or_else(FormatInfo::pcm),
            reference_ratio: volume.clone(),
            real_ratio: volume.clone(),
            volume,
            volume_factor,
            volume_factor_items: data.volume_factor_items,
            volume_factor_device,
            volume_factor_device_items: data.volume_factor_device_items,
            soft_volume: ChannelVolumes::norm(spec.channels),
            muted: data.muted.unwrap_or(false),
            volume_writable: data.volume_writable,
            save_volume: data.save_volume,
            save_muted: data.save_muted,
            sync_prev: None,
            sync_next: None,
            direct_on_input: data.direct_on_input,
            requested_latency: None,
            driver: callbacks.control,
            io: Some(Box::new(io)),
            _direction: std::marker::PhantomData,
        };
        domain.streams.insert(index, stream);

        if let Some(base) = data.sync_base.map(StreamId::index) {
            let next = domain.streams.get(&base).and_then(|b| b.sync_next);
            if let Some(s) = domain.streams.get_mut(&index) {
                s.sync_prev = Some(base);
                s.sync_next = next;
            }
            if let Some(b) = domain.streams.get_mut(&base) {
                b.sync_next = Some(index);
            }
            if let Some(n) = next.and_then(|n| domain.streams.get_mut(&n)) {
                n.sync_prev = Some(index);
            }
        }
        domain.device_mut(device.index())?.streams.insert(index);
        if let Some(origin) = data.origin_device {
            if let Some(origin) = domain.devices.get_mut(&origin.index()) {
                origin.master_stream = Some(index);
            }
        }

        let id = StreamId::new(index);
        tracing::info!(stream = %id, %device, ?spec, passthrough, "created stream");
        Ok(id)
    }

    /// Second phase: starts the stream on its device's realtime thread.
    pub fn put_stream<D: Direction>(&mut self, id: StreamId<D>) -> RoutingResult<()> {
        let domain = D::domain_mut(self);
        let stream = domain.stream_mut(id.index())?;
        if stream.state != StreamState::Init {
            return Err(RoutingError::BadState("stream already put"));
        }
        let device = stream.device.ok_or(RoutingError::BadState("stream without device"))?;
        let state = if stream.flags.contains(StreamFlags::START_CORKED) {
            StreamState::Corked
        } else {
            StreamState::Running
        };
        stream.state = state;
        let save_volume = stream.save_volume;
        let passthrough = stream.is_passthrough();
        if state == StreamState::Corked {
            domain.device_mut(device)?.n_corked += 1;
        }

        if propagation::flat_volume_enabled(domain, device) {
            self.refresh_flat_volume::<D>(device, false, save_volume);
        } else if let Some(stream) = D::domain_mut(self).streams.get_mut(&id.index()) {
            stream.real_ratio = stream.volume.clone();
            stream.update_soft_volume();
        }
        if passthrough {
            self.enter_passthrough(DeviceId::<D>::new(device));
        }

        let (domain, ctx) = D::split(self);
        let stream = domain.stream_mut(id.index())?;
        let mut io = stream
            .io
            .take()
            .ok_or(RoutingError::BadState("stream realtime half missing"))?;
        io.soft_volume = stream.soft_volume.clone();
        io.muted = stream.muted;
        io.state = state;
        io.passthrough = passthrough;
        io.requested_latency = stream.requested_latency;
        domain.device_mut(device)?.io.send(DeviceMsg::AddStream(io))?;
        sync_thread_volumes(domain, device, true);

        ctx.post(D::STREAM_FACILITY, EventKind::New, id.index());
        let mut hook_id = id;
        domain.hooks.stream_put.fire(&mut hook_id);
        tracing::debug!(stream = %id, ?state, "stream linked");
        self.update_device_status(DeviceId::<D>::new(device));
        Ok(())
    }

    /// Notifies the owner and unlinks the stream.
    pub fn kill_stream<D: Direction>(&mut self, id: StreamId<D>) {
        let Some(stream) = D::domain_mut(self).streams.get_mut(&id.index()) else {
            return;
        };
        tracing::debug!(stream = %id, "killing stream");
        stream.driver.kill();
        self.unlink_stream(id);
    }

    /// Detaches the stream from everything and frees it. Safe on streams
    /// that were never put.
    pub fn unlink_stream<D: Direction>(&mut self, id: StreamId<D>) {
        let domain = D::domain_mut(self);
        let Some(stream) = domain.streams.get_mut(&id.index()) else {
            return;
        };
        if stream.state == StreamState::Unlinked {
            return;
        }
        let old_state = stream.state;
        let linked = old_state.is_linked();
        let device = stream.device;
        let passthrough = stream.is_passthrough();
        let origin = stream.origin_device;
        let (prev, next) = (stream.sync_prev.take(), stream.sync_next.take());
        stream.state = StreamState::Unlinked;

        let mut hook_id = id;
        if linked {
            domain.hooks.stream_unlink.fire(&mut hook_id);
        }
        if let Some(prev) = prev.and_then(|p| domain.streams.get_mut(&p)) {
            prev.sync_next = next;
        }
        if let Some(next) = next.and_then(|n| domain.streams.get_mut(&n)) {
            next.sync_prev = prev;
        }
        if let Some(dev) = device.and_then(|d| domain.devices.get_mut(&d)) {
            dev.streams.remove(&id.index());
            if old_state == StreamState::Corked {
                dev.n_corked = dev.n_corked.saturating_sub(1);
            }
        }
        D::kill_direct_outputs(self, id.index());

        if let Some(device) = device {
            let attached = D::domain(self)
                .streams
                .get(&id.index())
                .is_some_and(|s| s.io.is_none());
            if linked {
                if passthrough {
                    self.leave_passthrough(DeviceId::<D>::new(device));
                }
                self.refresh_flat_volume::<D>(device, false, false);
            }
            let domain = D::domain_mut(self);
            if attached {
                if let Some(dev) = domain.devices.get_mut(&device) {
                    if let Err(err) = dev.io.send(DeviceMsg::RemoveStream(id.index())) {
                        tracing::debug!(stream = %id, %err, "realtime half not returned");
                    }
                }
            }
            if linked {
                sync_thread_volumes(domain, device, true);
            }
        }

        let domain = D::domain_mut(self);
        if let Some(origin) = origin.and_then(|o| domain.devices.get_mut(&o)) {
            if origin.master_stream == Some(id.index()) {
                origin.master_stream = None;
            }
        }
        if let Some(device) = device {
            self.update_device_status(DeviceId::<D>::new(device));
        }

        let (domain, ctx) = D::split(self);
        if linked {
            ctx.post(D::STREAM_FACILITY, EventKind::Remove, id.index());
            domain.hooks.stream_unlink_post.fire(&mut hook_id);
        }
        domain.streams.remove(&id.index());
        tracing::debug!(stream = %id, "stream unlinked");
    }

    /// Corks or uncorks a stream together with its sync group.
    pub fn cork_stream<D: Direction>(&mut self, id: StreamId<D>, cork: bool) -> RoutingResult<()> {
        let stream = D::domain(self).stream(id.index())?;
        if !stream.is_linked() {
            return Err(RoutingError::BadState("stream not linked"));
        }
        let state = if cork { StreamState::Corked } else { StreamState::Running };
        self.set_stream_state(id, state)
    }

    fn set_stream_state<D: Direction>(&mut self, id: StreamId<D>, state: StreamState) -> RoutingResult<()> {
        let domain = D::domain(self);
        let stream = domain.stream(id.index())?;
        if stream.state == state {
            return Ok(());
        }
        let device = stream.device;
        let uncorking = stream.state == StreamState::Corked && state == StreamState::Running;
        let (spec, passthrough) = (stream.spec, stream.is_passthrough());
        let needs_reconfigure = device
            .and_then(|d| domain.devices.get(&d))
            .is_some_and(|dev| uncorking && dev.used_by() == 0 && spec != dev.spec);
        if let (true, Some(device)) = (needs_reconfigure, device) {
            if let Err(err) = self.reconfigure_device(DeviceId::<D>::new(device), &spec, passthrough) {
                tracing::debug!(stream = %id, %err, "no reconfigure on uncork");
            }
        }

        let (domain, ctx) = D::split(self);
        let group = sync_group(domain, id.index());
        let previous: Vec<(u32, StreamState)> = group
            .iter()
            .filter_map(|member| domain.streams.get(member).map(|s| (*member, s.state)))
            .collect();
        for (n, (member, _)) in previous.iter().enumerate() {
            let member = *member;
            let msg = DeviceMsg::SetStreamState { stream: member, state };
            if let Err(err) = deliver(domain, member, |io| io.state = state, msg) {
                for &(done, old) in &previous[..n] {
                    let msg = DeviceMsg::SetStreamState { stream: done, state: old };
                    if let Err(revert) = deliver(domain, done, |io| io.state = old, msg) {
                        tracing::warn!(stream = done, %revert, "sync group member kept the new state");
                    }
                }
                return Err(err);
            }
        }
        for member in &group {
            let Some(s) = domain.streams.get_mut(member) else {
                continue;
            };
            let old = s.state;
            s.state = state;
            s.driver.state_change(state);
            if let Some(dev) = s.device.and_then(|d| domain.devices.get_mut(&d)) {
                if old == StreamState::Corked && state != StreamState::Corked {
                    dev.n_corked = dev.n_corked.saturating_sub(1);
                } else if old != StreamState::Corked && state == StreamState::Corked {
                    dev.n_corked += 1;
                }
            }
        }
        if state != StreamState::Unlinked {
            for member in &group {
                domain.hooks.stream_state_changed.fire(&mut StreamId::new(*member));
                if state.is_linked() {
                    ctx.post(D::STREAM_FACILITY, EventKind::Change, *member);
                }
            }
        }
        tracing::debug!(stream = %id, ?state, members = group.len(), "stream state changed");
        if let Some(device) = device {
            self.update_device_status(DeviceId::<D>::new(device));
        }
        Ok(())
    }

    /// Sets the stream volume. A relative volume on a flat device is taken
    /// relative to the device reference volume.
    pub fn set_stream_volume<D: Direction>(
        &mut self,
        id: StreamId<D>,
        volume: &ChannelVolumes,
        save: bool,
        absolute: bool,
    ) -> RoutingResult<()> {
        let (domain, ctx) = D::split(self);
        let stream = domain.stream(id.index())?;
        if !stream.is_linked() {
            return Err(RoutingError::BadState("stream not linked"));
        }
        let device = stream.device.ok_or(RoutingError::BadState("stream is moving"))?;
        if !volume.is_valid() || !volume.fits(&stream.spec) {
            return Err(RoutingError::Invalid("volume"));
        }
        if !stream.volume_writable {
            return Err(RoutingError::NotSupported("stream volume is not writable"));
        }
        if stream.is_passthrough() && !volume.is_norm() {
            tracing::debug!(stream = %id, "passthrough streams keep unity volume");
            return Err(RoutingError::NotSupported("passthrough stream volume"));
        }

        let flat = propagation::flat_volume_enabled(domain, device);
        let volume = if flat && !absolute {
            let dev = domain.device(device)?;
            let reference = dev.reference_volume.remap(&dev.map, &stream.map);
            if volume.is_compatible(&stream.spec) {
                reference.multiply(volume)
            } else {
                reference.multiply_scalar(volume.max())
            }
        } else if !volume.is_compatible(&stream.spec) {
            stream.volume.scale(volume.max())
        } else {
            volume.clone()
        };

        let stream = domain.stream_mut(id.index())?;
        if stream.volume == volume {
            stream.save_volume |= save;
            return Ok(());
        }
        stream.save_volume = save;
        let mut changes = VolumeChanges::default();
        propagation::set_stream_volume(domain, id.index(), volume.clone(), &mut changes);

        if flat {
            changes.notify(domain, ctx);
            return self.set_device_volume(DeviceId::<D>::new(device), None, true, save);
        }
        let stream = domain.stream_mut(id.index())?;
        stream.real_ratio = volume.clone();
        stream.reference_ratio = volume;
        stream.update_soft_volume();
        let msg = DeviceMsg::SetStreamSoftVolume {
            stream: id.index(),
            soft_volume: stream.soft_volume.clone(),
            volume_factor_device: stream.volume_factor_device.clone(),
        };
        let soft = stream.soft_volume.clone();
        deliver(domain, id.index(), |io| io.soft_volume = soft, msg)?;
        changes.notify(domain, ctx);
        Ok(())
    }

    /// The stream volume, or its ratio to the device reference volume when
    /// not absolute on a flat device.
    pub fn get_stream_volume<D: Direction>(&self, id: StreamId<D>, absolute: bool) -> RoutingResult<ChannelVolumes> {
        let domain = D::domain(self);
        let stream = domain.stream(id.index())?;
        let flat = stream
            .device
            .is_some_and(|device| propagation::flat_volume_enabled(domain, device));
        if absolute || !flat {
            Ok(stream.volume.clone())
        } else {
            Ok(stream.reference_ratio.clone())
        }
    }

    pub fn set_stream_mute<D: Direction>(&mut self, id: StreamId<D>, muted: bool, save: bool) -> RoutingResult<()> {
        let (domain, ctx) = D::split(self);
        let stream = domain.stream_mut(id.index())?;
        if !stream.is_linked() {
            return Err(RoutingError::BadState("stream not linked"));
        }
        if stream.muted == muted {
            stream.save_muted |= save;
            return Ok(());
        }
        stream.muted = muted;
        stream.save_muted = save;
        deliver(
            domain,
            id.index(),
            |io| io.muted = muted,
            DeviceMsg::SetStreamMute {
                stream: id.index(),
                muted,
            },
        )?;
        if let Some(stream) = domain.streams.get_mut(&id.index()) {
            stream.driver.mute_changed();
        }
        ctx.post(D::STREAM_FACILITY, EventKind::Change, id.index());
        domain.hooks.stream_mute_changed.fire(&mut id.clone());
        Ok(())
    }

    pub fn get_stream_mute<D: Direction>(&self, id: StreamId<D>) -> RoutingResult<bool> {
        Ok(D::domain(self).stream(id.index())?.muted)
    }

    /// Adds a named factor to the stream's software volume.
    pub fn add_volume_factor<D: Direction>(
        &mut self,
        id: StreamId<D>,
        key: &str,
        factor: &ChannelVolumes,
    ) -> RoutingResult<()> {
        let domain = D::domain_mut(self);
        let stream = domain.stream_mut(id.index())?;
        if !factor.is_valid() || !factor.fits(&stream.spec) {
            return Err(RoutingError::Invalid("volume factor"));
        }
        if stream.volume_factor_items.contains_key(key) {
            return Err(RoutingError::Exists(key.to_string()));
        }
        stream.volume_factor_items.insert(key.to_string(), factor.clone());
        apply_volume_factor(domain, id.index())
    }

    pub fn remove_volume_factor<D: Direction>(&mut self, id: StreamId<D>, key: &str) -> RoutingResult<()> {
        let domain = D::domain_mut(self);
        let stream = domain.stream_mut(id.index())?;
        if stream.volume_factor_items.remove(key).is_none() {
            return Err(RoutingError::NoEntity("volume factor"));
        }
        apply_volume_factor(domain, id.index())
    }

    /// Changes the stream rate of a variable rate stream. The realtime
    /// thread picks it up asynchronously.
    pub fn set_stream_rate<D: Direction>(&mut self, id: StreamId<D>, rate: u32) -> RoutingResult<()> {
        let (domain, ctx) = D::split(self);
        let stream = domain.stream_mut(id.index())?;
        if rate == 0 || rate > RATE_MAX {
            return Err(RoutingError::Invalid("rate"));
        }
        if !stream.flags.contains(StreamFlags::VARIABLE_RATE) || stream.is_passthrough() {
            return Err(RoutingError::BadState("stream rate is fixed"));
        }
        if stream.spec.rate == rate {
            return Ok(());
        }
        stream.spec.rate = rate;
        let msg = DeviceMsg::SetStreamRate {
            stream: id.index(),
            rate,
        };
        if let Some(io) = stream.io.as_mut() {
            io.spec.rate = rate;
            if let Some(resampler) = io.resampler.as_mut() {
                match D::KIND {
                    DirectionKind::Playback => resampler.set_input_rate(rate),
                    DirectionKind::Capture => resampler.set_output_rate(rate),
                }
            }
        } else if let Some(device) = stream.device {
            domain.device_mut(device)?.io.post(msg)?;
        }
        ctx.post(D::STREAM_FACILITY, EventKind::Change, id.index());
        Ok(())
    }

    /// Requests a latency for the stream; `None` withdraws the request.
    /// Returns the latency the device will actually honour.
    pub fn set_stream_requested_latency<D: Direction>(
        &mut self,
        id: StreamId<D>,
        usec: Option<u64>,
    ) -> RoutingResult<Option<u64>> {
        let domain = D::domain_mut(self);
        let stream = domain.stream_mut(id.index())?;
        let effective = if let Some(io) = stream.io.as_mut() {
            io.requested_latency = usec;
            usec
        } else {
            let device = stream.device.ok_or(RoutingError::BadState("stream is moving"))?;
            domain
                .device_mut(device)?
                .io
                .send(DeviceMsg::SetStreamRequestedLatency {
                    stream: id.index(),
                    usec,
                })?
                .into_opt_usec()?
        };
        domain.stream_mut(id.index())?.requested_latency = effective;
        Ok(effective)
    }

    pub fn get_stream_requested_latency<D: Direction>(&mut self, id: StreamId<D>) -> RoutingResult<Option<u64>> {
        let domain = D::domain_mut(self);
        let stream = domain.stream(id.index())?;
        match (stream.io.is_none(), stream.device) {
            (true, Some(device)) => domain
                .device_mut(device)?
                .io
                .send(DeviceMsg::GetStreamRequestedLatency { stream: id.index() })?
                .into_opt_usec(),
            _ => Ok(stream.requested_latency),
        }
    }

    /// Asks the device to rewind on behalf of the stream. `nbytes` is in the
    /// stream's domain; 0 means as much as possible.
    pub fn request_stream_rewind<D: Direction>(
        &mut self,
        id: StreamId<D>,
        nbytes: usize,
        rewrite: bool,
        flush: bool,
        dont_rewind_render: bool,
    ) -> RoutingResult<()> {
        let domain = D::domain_mut(self);
        let stream = domain.stream(id.index())?;
        if !stream.is_linked() || stream.io.is_some() {
            return Err(RoutingError::BadState("stream not attached to a running device"));
        }
        let device = stream.device.ok_or(RoutingError::BadState("stream is moving"))?;
        domain.device_mut(device)?.io.send(DeviceMsg::RequestStreamRewind {
            stream: id.index(),
            nbytes,
            rewrite,
            flush,
            dont_rewind_render,
        })?;
        Ok(())
    }

    pub fn update_stream_proplist<D: Direction>(
        &mut self,
        id: StreamId<D>,
        mode: UpdateMode,
        properties: &Proplist,
    ) -> RoutingResult<()> {
        let (domain, ctx) = D::split(self);
        let stream = domain.stream_mut(id.index())?;
        stream.proplist.update(mode, properties);
        if stream.is_linked() {
            domain.hooks.stream_proplist_changed.fire(&mut id.clone());
            ctx.post(D::STREAM_FACILITY, EventKind::Change, id.index());
        }
        Ok(())
    }

    /// Sends a named event to the stream owner. A hook may cancel it.
    pub fn send_stream_event<D: Direction>(
        &mut self,
        id: StreamId<D>,
        event: &str,
        properties: &Proplist,
    ) -> RoutingResult<()> {
        let (domain, ctx) = D::split(self);
        domain.stream(id.index())?;
        let mut data = SendEventData {
            stream: id,
            event: event.to_string(),
            properties: properties.clone(),
        };
        if domain.hooks.stream_send_event.fire(&mut data) == HookResult::Cancel {
            return Ok(());
        }
        let stream = domain.stream_mut(id.index())?;
        stream.driver.send_event(&data.event, &data.properties);
        tracing::debug!(stream = %id, event = %data.event, "stream event");
        ctx.events.publish(CoreEvent::StreamEvent {
            facility: D::STREAM_FACILITY,
            index: id.index(),
            name: data.event,
            properties: data.properties,
        });
        Ok(())
    }

    /// Replaces the stream's converter after its device changed format.
    pub fn update_stream_resampler<D: Direction>(&mut self, id: StreamId<D>) -> RoutingResult<()> {
        let (domain, ctx) = D::split(self);
        let stream = domain.stream(id.index())?;
        let device = stream.device.ok_or(RoutingError::BadState("stream is moving"))?;
        let dev = domain.device(device)?;
        let resampler = create_resampler::<D>(
            ctx,
            (&stream.spec, &stream.map),
            (&dev.spec, &dev.map),
            stream.flags,
            stream.is_passthrough(),
        )?;
        let device_spec = dev.spec;
        let factor = stream.volume_factor_device.clone();
        let stream = domain.stream_mut(id.index())?;
        if let Some(io) = stream.io.as_mut() {
            io.replace_resampler(resampler, device_spec, factor);
            return Ok(());
        }
        domain.device_mut(device)?.io.send(DeviceMsg::UpdateStreamResampler {
            stream: id.index(),
            resampler,
            device_spec,
            volume_factor_device: factor,
        })?;
        Ok(())
    }
}

fn apply_volume_factor<D: Direction>(domain: &mut Domain<D>, stream: u32) -> RoutingResult<()> {
    let s = domain.stream_mut(stream)?;
    s.volume_factor = combine_factors(&s.volume_factor_items, s.spec.channels);
    s.update_soft_volume();
    let soft = s.soft_volume.clone();
    let msg = DeviceMsg::SetStreamSoftVolume {
        stream,
        soft_volume: soft.clone(),
        volume_factor_device: s.volume_factor_device.clone(),
    };
    deliver(domain, stream, |io| io.soft_volume = soft, msg)
}
