mod common;

use common::*;
use harmoniq_routing::{
    Capture, DeviceCallbacks, DeviceFlags, DeviceNewData, IoBlock, RoutingError, StreamNewData, SuspendCause,
};

#[test]
fn dynamic_latency_honours_the_smallest_request() {
    let mut core = core();
    let out = sink_with(
        &mut core,
        DeviceNewData::new("usb", stereo_44k()).with_flags(DeviceFlags::DYNAMIC_LATENCY),
        DeviceCallbacks::null(),
    );
    core.set_latency_range(out, 10_000, 200_000).unwrap();
    let relaxed = input_on(&mut core, out, 1.0);
    let eager = input_on(&mut core, out, 1.0);

    assert_eq!(core.get_requested_latency(out).unwrap(), 200_000);
    assert_eq!(core.set_stream_requested_latency(relaxed, Some(50_000)).unwrap(), Some(50_000));
    assert_eq!(core.set_stream_requested_latency(eager, Some(1_000)).unwrap(), Some(10_000));
    assert_eq!(core.get_requested_latency(out).unwrap(), 10_000);
    assert_eq!(core.get_stream_requested_latency(eager).unwrap(), Some(10_000));

    core.set_stream_requested_latency(eager, None).unwrap();
    assert_eq!(core.get_requested_latency(out).unwrap(), 50_000);
    core.kill_stream(relaxed);
    assert_eq!(core.get_requested_latency(out).unwrap(), 200_000);

    core.suspend_device(out, true, SuspendCause::USER).unwrap();
    assert_eq!(core.get_requested_latency(out).unwrap(), 0);
    core.shutdown();
}

#[test]
fn fixed_latency_devices_ignore_stream_requests() {
    let mut core = core();
    let out = sink(&mut core, "speakers");
    assert_eq!(
        core.set_latency_range(out, 10_000, 200_000),
        Err(RoutingError::Invalid("latency range on a fixed latency device"))
    );
    core.set_fixed_latency(out, 40_000).unwrap();
    assert_eq!(core.get_fixed_latency(out).unwrap(), 40_000);

    let id = input_on(&mut core, out, 1.0);
    assert_eq!(core.set_stream_requested_latency(id, Some(5_000)).unwrap(), Some(40_000));
    assert_eq!(core.get_requested_latency(out).unwrap(), 40_000);
    core.shutdown();
}

#[test]
fn reported_latency_includes_the_port_offset() {
    let mut core = core();
    let hw = HwLog::default();
    *hw.latency_usec.lock() = 12_000;
    let out = sink_with(
        &mut core,
        DeviceNewData::new("card", stereo_44k()).with_flags(DeviceFlags::LATENCY),
        hw.callbacks(),
    );
    assert_eq!(core.get_latency(out).unwrap(), 12_000);
    core.set_port_latency_offset(out, 3_000).unwrap();
    assert_eq!(core.get_latency(out).unwrap(), 15_000);
    core.set_port_latency_offset(out, -20_000).unwrap();
    assert_eq!(core.get_latency(out).unwrap(), 0);

    core.suspend_device(out, true, SuspendCause::USER).unwrap();
    assert_eq!(core.get_latency(out).unwrap(), 0);
    core.shutdown();
}

#[test]
fn rewind_requests_reach_the_stream_on_the_next_render() {
    let mut core = core();
    let out = sink(&mut core, "speakers");
    core.set_max_rewind(out, 8_192).unwrap();
    assert_eq!(core.get_max_rewind(out).unwrap(), 8_192);
    let log = StreamLog::default();
    let id = input(&mut core, StreamNewData::new(stereo_44k()).with_device(out), &log);

    core.process_device(out, IoBlock::Render(4_096)).unwrap();
    core.request_stream_rewind(id, 1_024, true, false, false).unwrap();
    assert!(log.rewinds.lock().is_empty());

    core.process_device(out, IoBlock::Render(4_096)).unwrap();
    assert!(log.rewinds.lock().contains(&1_024));
    assert_eq!(core.device_stats(out).unwrap().rewinds, 1);
    core.shutdown();
}

#[test]
fn corking_rewrites_queued_audio() {
    let mut core = core();
    let out = sink(&mut core, "speakers");
    core.set_max_rewind(out, 8_192).unwrap();
    let log = StreamLog::default();
    let id = input(&mut core, StreamNewData::new(stereo_44k()).with_device(out), &log);
    core.process_device(out, IoBlock::Render(4_096)).unwrap();

    core.cork_stream(id, true).unwrap();
    let popped = *log.popped.lock();
    let rendered = core.process_device(out, IoBlock::Render(4_096)).unwrap();
    assert_eq!(*log.popped.lock(), popped);
    assert!(rendered.iter().all(|byte| *byte == 0));
    assert!(core.device_stats(out).unwrap().rewinds >= 1);

    assert_eq!(core.request_stream_rewind(id, 0, false, false, false), Ok(()));
    core.shutdown();
}

#[test]
fn rendered_audio_is_mixed_and_scaled() {
    let mut core = core();
    let out = sink(&mut core, "speakers");
    let _a = input_on(&mut core, out, 1.0);
    let _b = input_on(&mut core, out, 1.0);

    let rendered = core.process_device(out, IoBlock::Render(64)).unwrap();
    assert_eq!(rendered.len(), 64);
    let first = i16::from_le_bytes([rendered[0], rendered[1]]);
    assert_eq!(first, 0x4000);
    assert_eq!(core.device_stats(out).unwrap().rendered_bytes, 64);

    core.set_device_mute(out, true, false).unwrap();
    let rendered = core.process_device(out, IoBlock::Render(64)).unwrap();
    assert!(rendered.iter().all(|byte| *byte == 0));
    core.shutdown();
}

#[test]
fn captured_audio_reaches_source_outputs() {
    let mut core = core();
    let mic = source(&mut core, "mic");
    let log = StreamLog::default();
    let id = core
        .create_stream(StreamNewData::<Capture>::new(stereo_44k()).with_device(mic), log.callbacks())
        .unwrap();
    core.put_stream(id).unwrap();

    core.process_device(mic, IoBlock::Capture(vec![0x11; 256])).unwrap();
    assert_eq!(*log.pushed.lock(), 256);
    assert_eq!(core.device_stats(mic).unwrap().captured_bytes, 256);

    // a playback block on a capture device is refused
    assert!(core.process_device(mic, IoBlock::Render(64)).is_err());
    core.shutdown();
}
