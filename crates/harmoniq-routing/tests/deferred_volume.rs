mod common;

use std::sync::Arc;

use common::*;
use harmoniq_routing::resampler::NearestResamplerFactory;
use harmoniq_routing::{Core, CoreConfig, DeviceFlags, DeviceId, DeviceNewData, ManualClock, Playback};

const LATENCY: i64 = 20_000;
const MARGIN: u64 = 1_000;

fn deferred_sink() -> (Core, ManualClock, HwLog, DeviceId<Playback>) {
    let clock = ManualClock::new(0);
    let mut core = Core::with_parts(
        CoreConfig::default().with_safety_margin(MARGIN),
        Arc::new(clock.clone()),
        Arc::new(NearestResamplerFactory),
    );
    let hw = HwLog::default();
    *hw.latency_usec.lock() = LATENCY;
    let out = sink_with(
        &mut core,
        DeviceNewData::new("card", stereo_44k())
            .with_flags(DeviceFlags::HW_VOLUME_CTRL | DeviceFlags::DEFERRED_VOLUME),
        hw.callbacks(),
    );
    (core, clock, hw, out)
}

/// Lets the device thread look at the clock.
fn poll(core: &mut Core, out: DeviceId<Playback>) -> u64 {
    core.device_stats(out).expect("device stats").hw_volume_writes
}

#[test]
fn lowering_lands_early_and_raising_lands_late() {
    let (mut core, clock, hw, out) = deferred_sink();

    core.set_device_volume(out, Some(&level(0.5)), true, false).unwrap();
    assert!(hw.volume_writes.lock().is_empty());
    assert!(hw.deferred_writes.lock().is_empty());

    clock.set(LATENCY as u64 - MARGIN - 1);
    assert_eq!(poll(&mut core, out), 0);
    clock.set(LATENCY as u64 - MARGIN);
    assert_eq!(poll(&mut core, out), 1);
    assert_eq!(*hw.deferred_writes.lock(), vec![level(0.5)]);

    let now = LATENCY as u64 - MARGIN;
    core.set_device_volume(out, Some(&level(0.8)), true, false).unwrap();
    clock.set(now + LATENCY as u64 + MARGIN - 1);
    assert_eq!(poll(&mut core, out), 1);
    clock.set(now + LATENCY as u64 + MARGIN);
    assert_eq!(poll(&mut core, out), 2);
    assert_eq!(hw.deferred_writes.lock().last(), Some(&level(0.8)));
    core.shutdown();
}

#[test]
fn a_quieter_change_overrides_a_pending_louder_one() {
    let (mut core, clock, hw, out) = deferred_sink();

    core.set_device_volume(out, Some(&level(0.5)), true, false).unwrap();
    clock.set(100_000);
    assert_eq!(poll(&mut core, out), 1);

    // the raise would land at 121ms, the drop at 119ms, so the raise is dropped
    core.set_device_volume(out, Some(&level(1.0)), true, false).unwrap();
    core.set_device_volume(out, Some(&level(0.3)), true, false).unwrap();
    clock.set(119_000);
    assert_eq!(poll(&mut core, out), 2);
    clock.set(200_000);
    assert_eq!(poll(&mut core, out), 2);
    assert_eq!(*hw.deferred_writes.lock(), vec![level(0.5), level(0.3)]);
    assert_eq!(core.device(out).unwrap().real_volume(), &level(0.3));
    core.shutdown();
}

#[test]
fn a_raise_landing_first_drops_a_pending_drop() {
    let (mut core, clock, hw, out) = deferred_sink();

    core.set_device_volume(out, Some(&level(0.5)), true, false).unwrap();
    clock.set(100_000);
    assert_eq!(poll(&mut core, out), 1);

    // the drop is due at 119ms; after the latency shrinks the raise lands at 103ms
    core.set_device_volume(out, Some(&level(0.3)), true, false).unwrap();
    *hw.latency_usec.lock() = 2_000;
    core.set_device_volume(out, Some(&level(0.8)), true, false).unwrap();

    clock.set(102_999);
    assert_eq!(poll(&mut core, out), 1);
    clock.set(103_000);
    assert_eq!(poll(&mut core, out), 2);
    clock.set(200_000);
    assert_eq!(poll(&mut core, out), 2);
    assert_eq!(*hw.deferred_writes.lock(), vec![level(0.5), level(0.8)]);
    assert_eq!(core.device(out).unwrap().real_volume(), &level(0.8));
    core.shutdown();
}

#[test]
fn unchanged_hardware_volume_is_not_queued() {
    let (mut core, clock, hw, out) = deferred_sink();
    core.set_device_volume(out, Some(&harmoniq_routing::ChannelVolumes::norm(2)), true, false)
        .unwrap();
    clock.set(1_000_000);
    assert_eq!(poll(&mut core, out), 0);
    assert!(hw.deferred_writes.lock().is_empty());
    core.shutdown();
}
