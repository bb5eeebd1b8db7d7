mod common;

use common::*;
use harmoniq_routing::{
    ChannelVolumes, Core, CoreConfig, CoreEvent, DeviceFlags, DeviceNewData, EventKind, Facility, Playback,
    StreamNewData,
};

fn assert_soft_volumes_reconstruct(core: &Core) {
    for stream in core.streams::<Playback>() {
        assert_eq!(
            stream.soft_volume(),
            &stream.real_ratio().multiply(stream.volume_factor()),
            "soft volume of {}",
            stream.id()
        );
    }
}

#[test]
fn flat_device_follows_its_loudest_stream() {
    let mut core = core();
    let out = sink(&mut core, "speakers");
    let quiet = input_on(&mut core, out, 0.5);
    let loud = input_on(&mut core, out, 0.8);

    assert_eq!(core.device(out).unwrap().real_volume(), &level(0.8));
    assert_eq!(core.stream(loud).unwrap().real_ratio(), &ChannelVolumes::norm(2));
    assert_soft_volumes_reconstruct(&core);

    core.set_stream_volume(quiet, &ChannelVolumes::norm(2), true, true).unwrap();
    assert_eq!(core.device(out).unwrap().real_volume(), &ChannelVolumes::norm(2));
    let loud_stream = core.stream(loud).unwrap();
    assert_eq!(loud_stream.volume(), &level(0.8));
    assert_eq!(loud_stream.soft_volume(), &level(0.8));
    // the device moved up under the quieter stream, so its ratio follows
    assert_eq!(loud_stream.real_ratio(), &level(0.8));
    assert!(core.stream(quiet).unwrap().save_volume());
    assert_soft_volumes_reconstruct(&core);

    // the loudest stream leaving lowers the device again
    core.kill_stream(quiet);
    assert_eq!(core.device(out).unwrap().real_volume(), &level(0.8));
    core.shutdown();
}

#[test]
fn setting_the_current_volume_is_silent() {
    let mut core = core();
    let out = sink(&mut core, "speakers");
    let id = input_on(&mut core, out, 0.5);
    let events = core.subscribe();

    core.set_stream_volume(id, &level(0.5), false, true).unwrap();
    assert_eq!(events.try_iter().count(), 0);

    core.set_stream_volume(id, &level(0.6), false, true).unwrap();
    let changes: Vec<CoreEvent> = events.try_iter().collect();
    assert!(changes.iter().any(|event| matches!(
        event,
        CoreEvent::Subscription(sub) if sub.facility == Facility::SinkInput && sub.kind == EventKind::Change
    )));
    core.shutdown();
}

#[test]
fn device_volume_scales_streams_by_their_reference_ratio() {
    let mut core = core();
    let out = sink(&mut core, "speakers");
    let full = input_on(&mut core, out, 1.0);
    let half = input_on(&mut core, out, 0.5);

    core.set_device_volume(out, Some(&level(0.5)), true, true).unwrap();
    let device = core.device(out).unwrap();
    assert_eq!(device.reference_volume(), &level(0.5));
    assert_eq!(device.real_volume(), &level(0.5));
    assert!(device.save_volume());
    assert_eq!(core.stream(full).unwrap().volume(), &level(0.5));
    assert_eq!(core.stream(half).unwrap().volume(), &level(0.25));
    assert_eq!(core.stream(half).unwrap().reference_ratio(), &level(0.5));

    // relative volumes are taken against the reference volume
    core.set_stream_volume(half, &ChannelVolumes::norm(2), false, false).unwrap();
    assert_eq!(core.stream(half).unwrap().volume(), &level(0.5));
    assert_eq!(core.get_stream_volume(half, false).unwrap(), ChannelVolumes::norm(2));
    assert_soft_volumes_reconstruct(&core);
    core.shutdown();
}

#[test]
fn mono_volume_applies_to_every_channel() {
    let mut core = core();
    let out = sink(&mut core, "speakers");
    let id = input_on(&mut core, out, 1.0);
    let mono = ChannelVolumes::uniform(1, harmoniq_routing::Volume::from_fraction(0.25));
    core.set_stream_volume(id, &mono, false, true).unwrap();
    assert_eq!(core.stream(id).unwrap().volume(), &level(0.25));
    core.shutdown();
}

#[test]
fn filter_streams_count_toward_the_master() {
    let mut core = core();
    let master = sink(&mut core, "master");
    let (filter, feed) = filter_sink(&mut core, "equalizer", master);
    let direct = input_on(&mut core, master, 0.3);
    let filtered = input_on(&mut core, filter, 0.9);

    assert!(core.device(filter).unwrap().shares_volume());
    assert!(!core.stream(feed).unwrap().volume_writable());
    assert_eq!(core.device(master).unwrap().real_volume(), &level(0.9));
    assert_eq!(core.device(filter).unwrap().real_volume(), &level(0.9));
    assert_eq!(core.stream(feed).unwrap().volume(), &level(0.9));
    assert_eq!(core.stream(filtered).unwrap().real_ratio(), &ChannelVolumes::norm(2));
    assert_eq!(core.stream(feed).unwrap().real_ratio(), &ChannelVolumes::norm(2));
    assert!(core.stream(direct).unwrap().real_ratio().max() < harmoniq_routing::Volume::NORM);

    // a volume set on the filter lands on the master
    core.set_device_volume(filter, Some(&level(0.5)), true, false).unwrap();
    assert_eq!(core.device(master).unwrap().reference_volume(), &level(0.5));
    assert_eq!(core.device(filter).unwrap().reference_volume(), &level(0.5));

    assert_eq!(
        core.set_stream_volume(feed, &level(0.2), false, true),
        Err(harmoniq_routing::RoutingError::NotSupported("stream volume is not writable"))
    );

    // unlinking the filter rescues its streams and drops the feed
    core.unlink_device(filter);
    assert!(core.stream(feed).is_none());
    assert_eq!(core.stream(filtered).unwrap().device(), Some(master));
    core.shutdown();
}

#[test]
fn without_flat_volume_stream_and_device_are_independent() {
    let mut core = Core::new(CoreConfig::default().with_flat_volumes(false));
    let out = sink(&mut core, "speakers");
    assert!(!core.device(out).unwrap().flat_volume_enabled());
    let id = input_on(&mut core, out, 0.5);

    core.set_device_volume(out, Some(&level(0.7)), true, false).unwrap();
    assert_eq!(core.device(out).unwrap().soft_volume(), &level(0.7));
    assert_eq!(core.stream(id).unwrap().volume(), &level(0.5));
    assert_eq!(core.stream(id).unwrap().soft_volume(), &level(0.5));
    assert_eq!(
        core.set_device_volume(out, None, true, false),
        Err(harmoniq_routing::RoutingError::NotSupported(
            "volume recompute without flat volume"
        ))
    );
    core.shutdown();
}

#[test]
fn hardware_volume_is_written_by_the_driver() {
    let mut core = core();
    let hw = HwLog::default();
    let out = sink_with(
        &mut core,
        DeviceNewData::<Playback>::new("card", stereo_44k()).with_flags(DeviceFlags::HW_VOLUME_CTRL),
        hw.callbacks(),
    );

    core.set_device_volume(out, Some(&level(0.6)), true, false).unwrap();
    assert_eq!(hw.volume_writes.lock().last(), Some(&level(0.6)));
    assert_eq!(core.device(out).unwrap().soft_volume(), &ChannelVolumes::norm(2));

    // a knob turned on the hardware becomes the new reference
    core.device_volume_changed(out, &level(0.3)).unwrap();
    let device = core.device(out).unwrap();
    assert_eq!(device.reference_volume(), &level(0.3));
    assert!(device.save_volume());
    core.shutdown();
}

#[test]
fn mute_reaches_owner_and_subscribers() {
    let mut core = core();
    let out = sink(&mut core, "speakers");
    let log = StreamLog::default();
    let id = input(&mut core, StreamNewData::new(stereo_44k()).with_device(out), &log);

    core.set_stream_mute(id, true, true).unwrap();
    assert!(core.get_stream_mute(id).unwrap());
    assert!(log.calls().contains(&StreamCall::MuteChanged));

    core.set_device_mute(out, true, false).unwrap();
    assert!(core.device(out).unwrap().is_muted());
    core.set_device_mute(out, false, false).unwrap();
    assert!(!core.get_device_mute(out, false).unwrap());
    core.shutdown();
}

#[test]
fn volume_factors_survive_volume_changes() {
    let mut core = core();
    let out = sink(&mut core, "speakers");
    let id = input(
        &mut core,
        StreamNewData::new(stereo_44k())
            .with_device(out)
            .with_volume(level(0.5), true)
            .with_volume_factor("duck", level(0.5)),
        &StreamLog::default(),
    );
    assert_eq!(core.stream(id).unwrap().volume_factor(), &level(0.5));
    assert_soft_volumes_reconstruct(&core);

    core.set_stream_volume(id, &level(0.8), false, true).unwrap();
    assert_soft_volumes_reconstruct(&core);
    core.remove_volume_factor(id, "duck").unwrap();
    assert_eq!(core.stream(id).unwrap().volume_factor(), &ChannelVolumes::norm(2));
    assert_soft_volumes_reconstruct(&core);
    core.shutdown();
}
