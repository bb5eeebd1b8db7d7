//! Moving streams between devices.
//!
//! A move is two-phase: [`Core::start_stream_move`] detaches the stream and
//! takes its realtime half back from the old device thread, then
//! [`Core::finish_stream_move`] attaches it to the destination. In between
//! the stream is linked but has no device. A failed finish goes through
//! [`Core::fail_stream_move`], which gives hooks and the rescue policy a
//! chance before the stream is killed.

use crate::core::{Core, Domain, MoveFailData};
use crate::device::control::{check_passthrough_connection, sync_thread_volumes};
use crate::direction::{DeviceId, Direction, StreamId};
use crate::error::{RoutingError, RoutingResult};
use crate::hooks::{EventKind, HookResult};
use crate::message::DeviceMsg;
use crate::propagation::{self, VolumeChanges};
use crate::proplist::Proplist;
use crate::stream::StreamFlags;

/// Upper bound on master chain walks; deeper chains count as cycles.
const MAX_FILTER_DEPTH: usize = 100;

/// Whether `dest` sits downstream of `stream` in a filter chain, so that
/// moving `stream` there would feed a filter its own output.
fn creates_cycle<D: Direction>(domain: &Domain<D>, stream: u32, dest: u32) -> bool {
    let mut device = Some(dest);
    for _ in 0..MAX_FILTER_DEPTH {
        let Some(master) = device.and_then(|d| domain.devices.get(&d)).and_then(|d| d.master_stream) else {
            return false;
        };
        if master == stream {
            return true;
        }
        device = domain.streams.get(&master).and_then(|s| s.device);
    }
    true
}

/// Whether some filter between `stream` and the hardware is itself in the
/// middle of a move.
fn filter_moving<D: Direction>(domain: &Domain<D>, stream: u32) -> bool {
    let Some(mut device) = domain.streams.get(&stream).and_then(|s| s.device) else {
        return false;
    };
    for _ in 0..MAX_FILTER_DEPTH {
        let Some(master) = domain.devices.get(&device).and_then(|d| d.master_stream) else {
            return false;
        };
        match domain.streams.get(&master).and_then(|s| s.device) {
            Some(next) => device = next,
            None => return true,
        }
    }
    true
}

fn may_move<D: Direction>(domain: &Domain<D>, stream: u32) -> bool {
    let Some(s) = domain.streams.get(&stream) else {
        return false;
    };
    s.is_linked() && !s.flags.contains(StreamFlags::DONT_MOVE) && s.sync_prev.is_none() && s.sync_next.is_none()
}

fn check_move_to<D: Direction>(domain: &Domain<D>, max_streams: usize, stream: u32, dest: u32) -> Result<(), &'static str> {
    let s = domain.streams.get(&stream).ok_or("stream gone")?;
    if s.device == Some(dest) {
        return Ok(());
    }
    let device = domain.devices.get(&dest).ok_or("destination gone")?;
    if !device.is_linked() || device.unlink_requested {
        return Err("destination is going away");
    }
    if !may_move(domain, stream) {
        return Err("stream cannot move");
    }
    if creates_cycle(domain, stream, dest) {
        return Err("destination is fed by this stream");
    }
    if filter_moving(domain, stream) {
        return Err("filter chain is moving");
    }
    if device.streams.len() >= max_streams {
        return Err("destination has too many streams");
    }
    if check_passthrough_connection(domain, s.is_passthrough(), dest).is_err() {
        return Err("passthrough conflict");
    }
    if !s.driver.may_move_to(dest) {
        return Err("stream owner refused");
    }
    Ok(())
}

impl Core {
    /// Linked, not pinned and not part of a sync group.
    pub fn may_move_stream<D: Direction>(&self, id: StreamId<D>) -> bool {
        may_move(D::domain(self), id.index())
    }

    pub fn may_move_stream_to<D: Direction>(&self, id: StreamId<D>, dest: DeviceId<D>) -> bool {
        let max = self.ctx.config.max_streams_per_device;
        match check_move_to(D::domain(self), max, id.index(), dest.index()) {
            Ok(()) => true,
            Err(reason) => {
                tracing::trace!(stream = %id, %dest, reason, "move refused");
                false
            }
        }
    }

    /// Detaches the stream from its device and takes its realtime half
    /// back.
    pub fn start_stream_move<D: Direction>(&mut self, id: StreamId<D>) -> RoutingResult<()> {
        let domain = D::domain(self);
        let stream = domain.stream(id.index())?;
        if !stream.is_linked() || stream.io.is_some() {
            return Err(RoutingError::BadState("stream not attached"));
        }
        let device = stream.device.ok_or(RoutingError::BadState("stream already moving"))?;
        if !may_move(domain, id.index()) {
            return Err(RoutingError::Refused("stream cannot move"));
        }
        let passthrough = stream.is_passthrough();
        let corked = stream.is_corked();
        if domain.hooks.stream_move_start.fire(&mut id.clone()) == HookResult::Cancel {
            return Err(RoutingError::Canceled);
        }

        D::kill_direct_outputs(self, id.index());
        let domain = D::domain_mut(self);
        let dev = domain.device_mut(device)?;
        dev.streams.remove(&id.index());
        if corked {
            dev.n_corked = dev.n_corked.saturating_sub(1);
        }
        if passthrough {
            self.leave_passthrough(DeviceId::<D>::new(device));
        }
        self.refresh_flat_volume::<D>(device, false, false);

        let domain = D::domain_mut(self);
        let dev = domain.device_mut(device)?;
        let device_map = dev.map.clone();
        let io = dev.io.send(DeviceMsg::StartMove(id.index()))?.into_stream()?;
        sync_thread_volumes(domain, device, true);

        let stream = domain.stream_mut(id.index())?;
        stream.io = Some(io);
        stream.volume_factor_device = stream.volume_factor_device.remap(&device_map, &stream.map);
        stream.device = None;
        stream.device_requested_by_application = false;
        tracing::debug!(stream = %id, from = device, "move started");
        self.update_device_status(DeviceId::<D>::new(device));
        Ok(())
    }

    /// Attaches a moving stream to `dest`. On error the stream stays
    /// detached and the caller decides, usually via
    /// [`Core::fail_stream_move`].
    pub fn finish_stream_move<D: Direction>(
        &mut self,
        id: StreamId<D>,
        dest: DeviceId<D>,
        save: bool,
    ) -> RoutingResult<()> {
        let max = self.ctx.config.max_streams_per_device;
        let domain = D::domain(self);
        let stream = domain.stream(id.index())?;
        if !stream.is_moving() || stream.io.is_none() {
            return Err(RoutingError::BadState("stream is not moving"));
        }
        check_move_to(domain, max, id.index(), dest.index()).map_err(RoutingError::Refused)?;
        let dev = domain.device(dest.index())?;
        let passthrough = stream.is_passthrough();
        if passthrough && !self.check_device_format(dest, &stream.format) {
            let props = Proplist::new().with("device", dev.name.clone());
            tracing::debug!(stream = %id, %dest, "passthrough format not available on destination");
            self.send_stream_event(id, "format-lost", &props)?;
            return Err(RoutingError::NotSupported("destination lacks the passthrough format"));
        }
        let spec = stream.spec;
        if !stream.flags.contains(StreamFlags::VARIABLE_RATE) && spec != dev.spec {
            if let Err(err) = self.reconfigure_device(dest, &spec, passthrough) {
                tracing::debug!(%dest, %err, "destination keeps its sample spec");
            }
        }

        let default = D::domain(self).default_device;
        let domain = D::domain_mut(self);
        let dest_map = domain.device(dest.index())?.map.clone();
        let dest_name = domain.device(dest.index())?.name.clone();
        let stream = domain.stream_mut(id.index())?;
        stream.driver.moving(Some(dest.index()));
        stream.device = Some(dest.index());
        if save {
            stream.preferred_device = (default != Some(dest.index())).then_some(dest_name);
        }
        stream.volume_factor_device = stream.volume_factor_device.remap(&stream.map, &dest_map);
        let corked = stream.is_corked();
        let dev = domain.device_mut(dest.index())?;
        dev.streams.insert(id.index());
        if corked {
            dev.n_corked += 1;
        }

        if let Err(err) = self.update_stream_resampler(id) {
            self.detach_after_failed_finish(id, dest, corked);
            return Err(err);
        }

        // Hand over the realtime half before volume or passthrough touch
        // the destination; a refused handover must leave it untouched.
        let domain = D::domain_mut(self);
        let stream = domain.stream_mut(id.index())?;
        let Some(mut io) = stream.io.take() else {
            return Err(RoutingError::BadState("stream realtime half missing"));
        };
        io.soft_volume = stream.soft_volume.clone();
        io.muted = stream.muted;
        io.state = stream.state;
        io.passthrough = passthrough;
        io.requested_latency = stream.requested_latency;
        if let Err((err, returned)) = domain.device_mut(dest.index())?.io.finish_move(io) {
            match returned {
                Some(io) => domain.stream_mut(id.index())?.io = Some(io),
                None => tracing::warn!(stream = %id, %dest, "realtime half lost with the destination thread"),
            }
            self.detach_after_failed_finish(id, dest, corked);
            return Err(err);
        }
        self.update_device_status(dest);

        let (domain, ctx) = D::split(self);
        let mut changes = VolumeChanges::default();
        let refresh = propagation::update_volume_due_to_moving(domain, id.index(), dest.index(), &mut changes);
        changes.notify(domain, ctx);
        let save_volume = domain.stream(id.index())?.save_volume;
        if refresh {
            self.refresh_flat_volume::<D>(dest.index(), false, save_volume);
        }
        if passthrough {
            self.enter_passthrough(dest);
        }
        sync_thread_volumes(D::domain_mut(self), dest.index(), true);

        let (domain, ctx) = D::split(self);
        domain.hooks.stream_move_finish.fire(&mut id.clone());
        ctx.post(D::STREAM_FACILITY, EventKind::Change, id.index());
        tracing::info!(stream = %id, %dest, "move finished");
        Ok(())
    }

    fn detach_after_failed_finish<D: Direction>(&mut self, id: StreamId<D>, dest: DeviceId<D>, corked: bool) {
        let domain = D::domain_mut(self);
        if let Some(dev) = domain.devices.get_mut(&dest.index()) {
            dev.streams.remove(&id.index());
            if corked {
                dev.n_corked = dev.n_corked.saturating_sub(1);
            }
        }
        if let Some(stream) = domain.streams.get_mut(&id.index()) {
            stream.device = None;
        }
        self.update_device_status(dest);
    }

    /// A move could not be completed. Hooks get the first chance to place
    /// the stream, then the default device; otherwise the stream is killed.
    pub fn fail_stream_move<D: Direction>(&mut self, id: StreamId<D>) {
        if !self.stream(id).is_some_and(|s| s.is_moving()) {
            return;
        }
        let mut data = MoveFailData {
            stream: id,
            destination: None,
        };
        let verdict = D::domain(self).hooks.stream_move_fail.fire(&mut data);
        if let (HookResult::Stop, Some(dest)) = (verdict, data.destination) {
            match self.finish_stream_move(id, dest, false) {
                Ok(()) => return,
                Err(err) => tracing::debug!(stream = %id, %dest, %err, "hook destination refused the stream"),
            }
        }

        if self.ctx.config.rescue_streams {
            if let Some(default) = self.default_device::<D>() {
                if self.may_move_stream_to(id, default) && self.finish_stream_move(id, default, false).is_ok() {
                    tracing::info!(stream = %id, device = %default, "rescued stream to the default device");
                    return;
                }
            }
        }

        if let Some(stream) = D::domain_mut(self).streams.get_mut(&id.index()) {
            stream.driver.moving(None);
        }
        tracing::info!(stream = %id, "no device left for stream, killing it");
        self.kill_stream(id);
    }

    /// Moves a stream in one go. A refused destination leaves the stream
    /// where it was; a failed attach goes through the fail path.
    pub fn move_stream_to<D: Direction>(&mut self, id: StreamId<D>, dest: DeviceId<D>, save: bool) -> RoutingResult<()> {
        let stream = D::domain(self).stream(id.index())?;
        if stream.device == Some(dest.index()) {
            return Ok(());
        }
        if !self.may_move_stream_to(id, dest) {
            return Err(RoutingError::Refused("stream cannot move to that device"));
        }
        self.start_stream_move(id)?;
        if let Err(err) = self.finish_stream_move(id, dest, save) {
            tracing::debug!(stream = %id, %dest, %err, "move failed after detach");
            self.fail_stream_move(id);
            return Err(err);
        }
        Ok(())
    }
}
