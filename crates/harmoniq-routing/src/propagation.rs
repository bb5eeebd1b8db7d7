//! Flat-volume propagation over one direction's devices and streams.
//!
//! A device in flat mode has a `real_volume` equal to the channel-wise
//! maximum of its streams, and every stream keeps two ratios against its
//! device: `reference_ratio` (against the user visible reference volume) and
//! `real_ratio` (against the real volume, which is what the stream applies in
//! software). Devices that share volume with their master never hold a
//! volume of their own; they mirror the root of their chain and their
//! streams count as streams of the root.
//!
//! The functions here only touch the arena. Every stream volume and device
//! reference volume they change is recorded in a [`VolumeChanges`] log so
//! the caller can notify drivers, subscribers and hooks afterwards.

use std::collections::BTreeSet;

use crate::core::{CoreContext, Domain};
use crate::direction::{DeviceId, Direction, StreamId};
use crate::hooks::EventKind;
use crate::sample::ChannelMap;
use crate::volume::{ChannelVolumes, Volume};

/// Filter chains deeper than this are treated as broken.
const MAX_CHAIN_DEPTH: usize = 64;

/// Devices whose reference volume and streams whose volume changed.
#[derive(Debug, Default)]
pub(crate) struct VolumeChanges {
    devices: BTreeSet<u32>,
    streams: BTreeSet<u32>,
}

impl VolumeChanges {
    pub(crate) fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.streams.is_empty()
    }

    /// Emits change events, driver callbacks and volume hooks.
    pub(crate) fn notify<D: Direction>(self, domain: &mut Domain<D>, ctx: &CoreContext) {
        for index in self.devices {
            if !domain.devices.contains_key(&index) {
                continue;
            }
            ctx.post(D::DEVICE_FACILITY, EventKind::Change, index);
            domain.hooks.device_volume_changed.fire(&mut DeviceId::new(index));
        }
        for index in self.streams {
            let Some(stream) = domain.streams.get_mut(&index) else {
                continue;
            };
            stream.driver.volume_changed();
            if stream.is_linked() {
                ctx.post(D::STREAM_FACILITY, EventKind::Change, index);
            }
            domain.hooks.stream_volume_changed.fire(&mut StreamId::new(index));
        }
    }
}

/// Walks the master chain of a volume sharing device. `None` while some
/// link of the chain is being moved.
pub(crate) fn get_root<D: Direction>(domain: &Domain<D>, device: u32) -> Option<u32> {
    let mut current = device;
    for _ in 0..MAX_CHAIN_DEPTH {
        let dev = domain.devices.get(&current)?;
        if !dev.shares_volume() {
            return Some(current);
        }
        let master = dev.master_stream?;
        current = domain.streams.get(&master)?.device?;
    }
    tracing::warn!(device, "volume sharing chain too deep");
    None
}

/// Flat volume is a property of the root of a sharing chain.
pub(crate) fn flat_volume_enabled<D: Direction>(domain: &Domain<D>, device: u32) -> bool {
    get_root(domain, device)
        .and_then(|root| domain.devices.get(&root))
        .is_some_and(|root| root.flat_volume_enabled())
}

fn device_linked<D: Direction>(domain: &Domain<D>, device: u32) -> bool {
    domain.devices.get(&device).is_some_and(|d| d.is_linked())
}

/// The filter device fed by `stream`, if that device shares its volume.
pub(crate) fn sharing_origin<D: Direction>(domain: &Domain<D>, stream: u32) -> Option<u32> {
    let origin = domain.streams.get(&stream)?.origin_device?;
    domain
        .devices
        .get(&origin)
        .filter(|d| d.shares_volume())
        .map(|d| d.index)
}

pub(crate) fn device_streams<D: Direction>(domain: &Domain<D>, device: u32) -> Vec<u32> {
    domain
        .devices
        .get(&device)
        .map(|d| d.streams.iter().copied().collect())
        .unwrap_or_default()
}

pub(crate) fn set_stream_volume<D: Direction>(
    domain: &mut Domain<D>,
    stream: u32,
    volume: ChannelVolumes,
    changes: &mut VolumeChanges,
) {
    let Some(s) = domain.streams.get_mut(&stream) else {
        return;
    };
    if s.volume == volume {
        return;
    }
    tracing::trace!(stream, volume = volume.avg().0, "stream volume changed");
    s.volume = volume;
    changes.streams.insert(stream);
}

pub(crate) fn set_reference_volume<D: Direction>(
    domain: &mut Domain<D>,
    device: u32,
    volume: ChannelVolumes,
    changes: &mut VolumeChanges,
) {
    let Some(dev) = domain.devices.get_mut(&device) else {
        return;
    };
    if dev.reference_volume == volume {
        return;
    }
    tracing::trace!(device, volume = volume.avg().0, "reference volume changed");
    dev.reference_volume = volume;
    changes.devices.insert(device);
}

/// `reference_ratio := volume ÷ reference_volume`, keeping the old ratio
/// on channels where it already reproduces the volume or where the
/// reference is muted.
pub(crate) fn compute_reference_ratio<D: Direction>(domain: &mut Domain<D>, stream: u32) {
    let Some(s) = domain.streams.get(&stream) else {
        return;
    };
    let Some(device) = s.device else {
        return;
    };
    if !flat_volume_enabled(domain, device) {
        return;
    }
    let Some(dev) = domain.devices.get(&device) else {
        return;
    };
    let remapped = dev.reference_volume.remap(&dev.map, &s.map);
    let mut ratio = s.reference_ratio.clone();
    for c in 0..usize::from(s.volume.channels()) {
        let reference = remapped.get(c);
        if reference == Volume::MUTED {
            continue;
        }
        if ratio.get(c).multiply(reference) == s.volume.get(c) {
            continue;
        }
        ratio.set_channel(c, s.volume.get(c).divide(reference));
    }
    if let Some(s) = domain.streams.get_mut(&stream) {
        s.reference_ratio = ratio;
    }
}

pub(crate) fn compute_reference_ratios<D: Direction>(domain: &mut Domain<D>, device: u32) {
    for stream in device_streams(domain, device) {
        compute_reference_ratio(domain, stream);
        if let Some(origin) = sharing_origin(domain, stream) {
            if device_linked(domain, origin) {
                compute_reference_ratios(domain, origin);
            }
        }
    }
}

/// `real_ratio := volume ÷ real_volume` and `soft := real_ratio × factor`
/// for every stream of `device`. Streams feeding sharing filters carry unity.
pub(crate) fn compute_real_ratios<D: Direction>(domain: &mut Domain<D>, device: u32) {
    let Some(dev) = domain.devices.get(&device) else {
        return;
    };
    let real = dev.real_volume.clone();
    let map = dev.map.clone();
    for stream in device_streams(domain, device) {
        if let Some(origin) = sharing_origin(domain, stream) {
            if let Some(s) = domain.streams.get_mut(&stream) {
                s.real_ratio = ChannelVolumes::norm(s.spec.channels);
                s.soft_volume = s.volume_factor.clone();
            }
            if device_linked(domain, origin) {
                compute_real_ratios(domain, origin);
            }
            continue;
        }
        let Some(s) = domain.streams.get_mut(&stream) else {
            continue;
        };
        let remapped = real.remap(&map, &s.map);
        for c in 0..usize::from(s.volume.channels()) {
            let real_c = remapped.get(c);
            if real_c == Volume::MUTED {
                s.soft_volume.set_channel(c, Volume::MUTED);
                continue;
            }
            if s.real_ratio.get(c).multiply(real_c) != s.volume.get(c) {
                let ratio = s.volume.get(c).divide(real_c);
                s.real_ratio.set_channel(c, ratio);
            }
            let soft = s.real_ratio.get(c).multiply(s.volume_factor.get(c));
            s.soft_volume.set_channel(c, soft);
        }
    }
}

/// Merges the volume of every non-sharing stream below `device` into `max`
/// (in `map` layout).
pub(crate) fn get_maximum_input_volume<D: Direction>(
    domain: &Domain<D>,
    device: u32,
    max: &mut ChannelVolumes,
    map: &ChannelMap,
) {
    for stream in device_streams(domain, device) {
        if let Some(origin) = sharing_origin(domain, stream) {
            if device_linked(domain, origin) {
                get_maximum_input_volume(domain, origin, max, map);
            }
            continue;
        }
        let Some(s) = domain.streams.get(&stream) else {
            continue;
        };
        let remapped = s.volume.remap_minimal_impact(max, &s.map, map);
        *max = max.merge(&remapped);
    }
}

pub(crate) fn has_inputs<D: Direction>(domain: &Domain<D>, device: u32) -> bool {
    device_streams(domain, device).into_iter().any(|stream| {
        match sharing_origin(domain, stream) {
            Some(origin) => has_inputs(domain, origin),
            None => true,
        }
    })
}

/// Sets the real volume of `device` and of every sharing device below it.
/// In flat mode the streams feeding those filters follow the new volume.
pub(crate) fn update_real_volume<D: Direction>(
    domain: &mut Domain<D>,
    device: u32,
    volume: &ChannelVolumes,
    map: &ChannelMap,
    changes: &mut VolumeChanges,
) {
    let flat = flat_volume_enabled(domain, device);
    let Some(dev) = domain.devices.get_mut(&device) else {
        return;
    };
    dev.real_volume = volume.remap(map, &dev.map);

    for stream in device_streams(domain, device) {
        let Some(origin) = sharing_origin(domain, stream) else {
            continue;
        };
        if flat {
            if let Some(s) = domain.streams.get(&stream) {
                let input_volume = volume.remap(map, &s.map);
                set_stream_volume(domain, stream, input_volume, changes);
                compute_reference_ratio(domain, stream);
            }
        }
        if device_linked(domain, origin) {
            update_real_volume(domain, origin, volume, map, changes);
        }
    }
}

/// Recomputes the real volume of a root device as the maximum of its
/// streams, then the real ratios against it.
pub(crate) fn compute_real_volume<D: Direction>(domain: &mut Domain<D>, root: u32, changes: &mut VolumeChanges) {
    let Some(dev) = domain.devices.get(&root) else {
        return;
    };
    let map = dev.map.clone();
    if !has_inputs(domain, root) {
        let reference = dev.reference_volume.clone();
        update_real_volume(domain, root, &reference, &map, changes);
        return;
    }
    let mut real = ChannelVolumes::muted(map.channels());
    get_maximum_input_volume(domain, root, &mut real, &map);
    update_real_volume(domain, root, &real, &map, changes);
    compute_real_ratios(domain, root);
}

/// `volume := reference_volume × reference_ratio` for every stream, after
/// the reference volume was set from outside.
pub(crate) fn propagate_reference_volume<D: Direction>(
    domain: &mut Domain<D>,
    device: u32,
    changes: &mut VolumeChanges,
) {
    let Some(dev) = domain.devices.get(&device) else {
        return;
    };
    let reference = dev.reference_volume.clone();
    let map = dev.map.clone();
    for stream in device_streams(domain, device) {
        if let Some(origin) = sharing_origin(domain, stream) {
            if device_linked(domain, origin) {
                propagate_reference_volume(domain, origin, changes);
            }
            continue;
        }
        let Some(s) = domain.streams.get(&stream) else {
            continue;
        };
        let volume = reference.remap(&map, &s.map).multiply(&s.reference_ratio);
        set_stream_volume(domain, stream, volume, changes);
    }
}

/// Sets the reference volume of `device` and every sharing device below
/// it. Returns false when nothing changed and nothing below has to follow.
pub(crate) fn update_reference_volume<D: Direction>(
    domain: &mut Domain<D>,
    device: u32,
    volume: &ChannelVolumes,
    map: &ChannelMap,
    save: bool,
    changes: &mut VolumeChanges,
) -> bool {
    let Some(dev) = domain.devices.get(&device) else {
        return false;
    };
    let remapped = volume.remap(map, &dev.map);
    let changed = remapped != dev.reference_volume;
    let shares = dev.shares_volume();
    set_reference_volume(domain, device, remapped, changes);
    if let Some(dev) = domain.devices.get_mut(&device) {
        dev.save_volume = (!changed && dev.save_volume) || save;
    }
    if !changed && !shares {
        return false;
    }

    for stream in device_streams(domain, device) {
        if let Some(origin) = sharing_origin(domain, stream) {
            if device_linked(domain, origin) {
                update_reference_volume(domain, origin, volume, map, false, changes);
            }
        }
    }
    true
}

/// Inverse path after the hardware reported a new real volume: the real
/// volume becomes the reference and stream volumes follow with their real
/// ratios held fixed. The change is marked for saving.
pub(crate) fn propagate_real_volume<D: Direction>(
    domain: &mut Domain<D>,
    device: u32,
    old_real: &ChannelVolumes,
    changes: &mut VolumeChanges,
) {
    let Some(dev) = domain.devices.get(&device) else {
        return;
    };
    let shares = dev.shares_volume();
    if !shares {
        if *old_real == dev.real_volume {
            return;
        }
        let real = dev.real_volume.clone();
        let map = dev.map.clone();
        update_reference_volume(domain, device, &real, &map, true, changes);
    }

    if flat_volume_enabled(domain, device) {
        let Some(dev) = domain.devices.get(&device) else {
            return;
        };
        let reference = dev.reference_volume.clone();
        let map = dev.map.clone();
        for stream in device_streams(domain, device) {
            let Some(s) = domain.streams.get_mut(&stream) else {
                continue;
            };
            s.reference_ratio = s.real_ratio.clone();
            let volume = reference.remap(&map, &s.map).multiply(&s.reference_ratio);
            set_stream_volume(domain, stream, volume, changes);
            if let Some(origin) = sharing_origin(domain, stream) {
                if device_linked(domain, origin) {
                    propagate_real_volume(domain, origin, old_real, changes);
                }
            }
        }
    }

    if !shares {
        if let Some(dev) = domain.devices.get_mut(&device) {
            dev.save_volume = true;
        }
    }
}

/// Re-derives the volume of a stream that was just attached to `dest`
/// (directly or through a sharing filter it feeds). Returns true when the
/// caller still has to recompute the destination's flat volume.
pub(crate) fn update_volume_due_to_moving<D: Direction>(
    domain: &mut Domain<D>,
    stream: u32,
    dest: u32,
    changes: &mut VolumeChanges,
) -> bool {
    let Some(device) = domain.streams.get(&stream).and_then(|s| s.device) else {
        return false;
    };
    let flat = flat_volume_enabled(domain, device);

    if let Some(origin) = sharing_origin(domain, stream) {
        if !flat {
            if let Some(s) = domain.streams.get(&stream) {
                let channels = s.volume.channels();
                set_stream_volume(domain, stream, ChannelVolumes::norm(channels), changes);
                if let Some(s) = domain.streams.get_mut(&stream) {
                    s.reference_ratio = ChannelVolumes::norm(s.reference_ratio.channels());
                }
            }
        }

        if let Some(root) = get_root(domain, device).and_then(|r| domain.devices.get(&r)) {
            let root_reference = root.reference_volume.clone();
            let root_real = root.real_volume.clone();
            let root_map = root.map.clone();
            if let Some(origin_map) = domain.devices.get(&origin).map(|d| d.map.clone()) {
                let reference = root_reference.remap(&root_map, &origin_map);
                set_reference_volume(domain, origin, reference, changes);
                if let Some(filter) = domain.devices.get_mut(&origin) {
                    filter.real_volume = root_real.remap(&root_map, &origin_map);
                }
            }
        }

        for inner in device_streams(domain, origin) {
            update_volume_due_to_moving(domain, inner, dest, changes);
        }
    } else if flat {
        if let (Some(s), Some(dev)) = (domain.streams.get(&stream), domain.devices.get(&device)) {
            let volume = dev
                .reference_volume
                .remap(&dev.map, &s.map)
                .multiply(&s.reference_ratio);
            set_stream_volume(domain, stream, volume, changes);
        }
    } else if let Some(s) = domain.streams.get(&stream) {
        let ratio = s.reference_ratio.clone();
        set_stream_volume(domain, stream, ratio.clone(), changes);
        if let Some(s) = domain.streams.get_mut(&stream) {
            s.real_ratio = ratio;
            s.update_soft_volume();
        }
    }

    device == dest && flat
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Core;
    use crate::device::{DeviceFlags, DeviceNewData};
    use crate::direction::Playback;
    use crate::driver::{DeviceCallbacks, StreamCallbacks};
    use crate::sample::SampleSpec;
    use crate::stream::StreamNewData;

    fn fraction(f: f64) -> ChannelVolumes {
        ChannelVolumes::uniform(2, Volume::from_fraction(f))
    }

    #[test]
    fn root_of_a_sharing_chain_is_the_master() {
        let mut core = Core::default();
        let master = core
            .create_device(DeviceNewData::<Playback>::new("hw", SampleSpec::default()), DeviceCallbacks::null())
            .unwrap();
        core.put_device(master).unwrap();
        let filter = core
            .create_device(
                DeviceNewData::<Playback>::new("eq", SampleSpec::default())
                    .with_flags(DeviceFlags::SHARE_VOLUME_WITH_MASTER),
                DeviceCallbacks::null(),
            )
            .unwrap();
        let feed = core
            .create_stream(
                StreamNewData::new(SampleSpec::default())
                    .with_device(master)
                    .with_origin_device(filter),
                StreamCallbacks::null(),
            )
            .unwrap();
        core.put_stream(feed).unwrap();
        core.put_device(filter).unwrap();

        assert_eq!(get_root(&core.sinks, filter.index()), Some(master.index()));
        assert!(flat_volume_enabled(&core.sinks, filter.index()));
        assert!(has_inputs(&core.sinks, filter.index()) == false);
        assert!(!has_inputs(&core.sinks, master.index()));
        core.shutdown();
    }

    #[test]
    fn maximum_input_volume_is_channel_wise() {
        let mut core = Core::default();
        let sink = core
            .create_device(DeviceNewData::<Playback>::new("hw", SampleSpec::default()), DeviceCallbacks::null())
            .unwrap();
        core.put_device(sink).unwrap();
        let left_heavy = ChannelVolumes::from_values(&[Volume::from_fraction(0.8), Volume::from_fraction(0.2)]).unwrap();
        let right_heavy = ChannelVolumes::from_values(&[Volume::from_fraction(0.3), Volume::from_fraction(0.6)]).unwrap();
        for volume in [left_heavy.clone(), right_heavy.clone()] {
            let stream = core
                .create_stream(
                    StreamNewData::<Playback>::new(SampleSpec::default()).with_volume(volume, true),
                    StreamCallbacks::null(),
                )
                .unwrap();
            core.put_stream(stream).unwrap();
        }

        let mut max = ChannelVolumes::muted(2);
        get_maximum_input_volume(&core.sinks, sink.index(), &mut max, &crate::sample::ChannelMap::stereo());
        assert_eq!(max, left_heavy.merge(&right_heavy));
        assert_eq!(core.device(sink).unwrap().real_volume(), &max);
        assert_ne!(max, fraction(0.8));
        core.shutdown();
    }
}
