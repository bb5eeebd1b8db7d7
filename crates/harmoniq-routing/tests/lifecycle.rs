mod common;

use std::sync::Arc;

use parking_lot::Mutex;

use common::*;
use harmoniq_routing::{
    Core, CoreEvent, DeviceCallbacks, DeviceDriver, DeviceNewData, DeviceState, DriverError, Facility, NullDriver,
    Playback, Port, PortAvailable, RoutingError, StreamFlags, StreamNewData, SuspendCause,
};

#[test]
fn device_runs_only_without_suspend_causes() {
    let mut core = core();
    let hw = HwLog::default();
    let out = sink_with(&mut core, DeviceNewData::new("card", stereo_44k()), hw.callbacks());
    let log = StreamLog::default();
    input(&mut core, StreamNewData::new(stereo_44k()).with_device(out), &log);
    assert_eq!(core.device(out).unwrap().state(), DeviceState::Running);

    core.suspend_device(out, true, SuspendCause::USER).unwrap();
    core.suspend_device(out, true, SuspendCause::SESSION).unwrap();
    let device = core.device(out).unwrap();
    assert_eq!(device.state(), DeviceState::Suspended);
    assert_eq!(device.suspend_cause(), SuspendCause::USER | SuspendCause::SESSION);
    assert!(log.calls().contains(&StreamCall::Suspend(true)));

    core.suspend_device(out, false, SuspendCause::USER).unwrap();
    assert_eq!(core.device(out).unwrap().state(), DeviceState::Suspended);
    assert_eq!(core.device(out).unwrap().suspend_cause(), SuspendCause::SESSION);

    core.suspend_device(out, false, SuspendCause::SESSION).unwrap();
    let device = core.device(out).unwrap();
    assert_eq!(device.state(), DeviceState::Running);
    assert!(device.suspend_cause().is_empty());
    assert_eq!(log.calls().last(), Some(&StreamCall::Suspend(false)));
    assert_eq!(hw.states.lock().last(), Some(&DeviceState::Running));

    assert_eq!(
        core.suspend_device(out, true, SuspendCause::empty()),
        Err(RoutingError::Invalid("empty suspend cause"))
    );
    core.shutdown();
}

#[test]
fn idle_devices_resume_to_idle() {
    let mut core = core();
    let out = sink(&mut core, "speakers");
    assert_eq!(core.device(out).unwrap().state(), DeviceState::Idle);
    core.suspend_all::<Playback>(true, SuspendCause::IDLE).unwrap();
    assert_eq!(core.device(out).unwrap().state(), DeviceState::Suspended);
    core.suspend_all::<Playback>(false, SuspendCause::IDLE).unwrap();
    assert_eq!(core.device(out).unwrap().state(), DeviceState::Idle);
    core.shutdown();
}

#[test]
fn suspending_kills_streams_that_asked_for_it() {
    let mut core = core();
    let out = sink(&mut core, "speakers");
    let fragile = StreamLog::default();
    let sturdy = StreamLog::default();
    let fragile_id = input(
        &mut core,
        StreamNewData::new(stereo_44k())
            .with_device(out)
            .with_flags(StreamFlags::KILL_ON_SUSPEND),
        &fragile,
    );
    let sturdy_id = input(&mut core, StreamNewData::new(stereo_44k()).with_device(out), &sturdy);

    core.suspend_device(out, true, SuspendCause::USER).unwrap();
    assert!(fragile.was_killed());
    assert!(core.stream(fragile_id).is_none());
    assert!(core.stream(sturdy_id).is_some());
    assert!(sturdy.calls().contains(&StreamCall::Suspend(true)));

    assert_eq!(
        core.create_stream(
            StreamNewData::<Playback>::new(stereo_44k())
                .with_device(out)
                .with_flags(StreamFlags::NO_CREATE_ON_SUSPEND),
            StreamLog::default().callbacks(),
        ),
        Err(RoutingError::BadState("device suspended"))
    );
    core.shutdown();
}

#[test]
fn devices_can_start_suspended() {
    let mut core = core();
    let out = sink_with(
        &mut core,
        DeviceNewData::new("hdmi", stereo_44k()).with_suspend_cause(SuspendCause::UNAVAILABLE),
        DeviceCallbacks::null(),
    );
    assert_eq!(core.device(out).unwrap().state(), DeviceState::Suspended);
    core.suspend_device(out, false, SuspendCause::UNAVAILABLE).unwrap();
    assert_eq!(core.device(out).unwrap().state(), DeviceState::Idle);
    core.shutdown();
}

/// Driver that cannot reopen the hardware once asked to fail.
struct FlakyResume(Arc<Mutex<bool>>);

impl DeviceDriver for FlakyResume {
    fn set_state(&mut self, state: DeviceState, _cause: SuspendCause) -> Result<(), DriverError> {
        if state.is_opened() && *self.0.lock() {
            return Err(DriverError::Failed("device busy".into()));
        }
        Ok(())
    }
}

#[test]
fn failed_resume_leaves_the_device_suspended() {
    let mut core = core();
    let fail = Arc::new(Mutex::new(false));
    let out = sink_with(
        &mut core,
        DeviceNewData::new("usb", stereo_44k()),
        DeviceCallbacks::new(FlakyResume(Arc::clone(&fail)), NullDriver),
    );
    core.suspend_device(out, true, SuspendCause::USER).unwrap();
    *fail.lock() = true;
    let events = core.subscribe();

    let err = core.suspend_device(out, false, SuspendCause::USER).unwrap_err();
    assert!(err.is_resource_failure());
    let device = core.device(out).unwrap();
    assert_eq!(device.state(), DeviceState::Suspended);
    assert!(device.suspend_cause().is_empty());
    assert!(events.try_iter().any(|event| matches!(
        event,
        CoreEvent::DriverFailure { facility: Facility::Sink, index, .. } if index == out.index()
    )));

    *fail.lock() = false;
    core.suspend_device(out, false, SuspendCause::USER).unwrap();
    assert_eq!(core.device(out).unwrap().state(), DeviceState::Idle);
    core.shutdown();
}

#[test]
fn default_follows_priority_and_configuration() {
    let mut core = core();
    let a = sink(&mut core, "a");
    assert_eq!(core.default_device::<Playback>(), Some(a));
    let id = input(&mut core, StreamNewData::new(stereo_44k()), &StreamLog::default());
    assert_eq!(core.stream(id).unwrap().device(), Some(a));

    let events = core.subscribe();
    let b = sink_with(
        &mut core,
        DeviceNewData::new("b", stereo_44k()).with_priority(10),
        DeviceCallbacks::null(),
    );
    assert_eq!(core.default_device::<Playback>(), Some(b));
    assert!(events.try_iter().any(|event| event
        == CoreEvent::DefaultChanged {
            facility: Facility::Sink,
            index: Some(b.index()),
        }));
    assert_eq!(core.stream(id).unwrap().device(), Some(b));

    core.set_configured_default::<Playback>(Some("a"));
    assert_eq!(core.default_device::<Playback>(), Some(a));
    assert_eq!(core.stream(id).unwrap().device(), Some(a));

    // a configured default that is gone falls back to priority
    core.unlink_device(a);
    assert_eq!(core.default_device::<Playback>(), Some(b));
    assert_eq!(core.stream(id).unwrap().device(), Some(b));
    core.shutdown();
}

/// Driver that can switch ports.
#[derive(Default)]
struct PortSwitch(Arc<Mutex<Vec<String>>>);

impl DeviceDriver for PortSwitch {
    fn has_port_switch(&self) -> bool {
        true
    }

    fn set_port(&mut self, port: &Port) -> Result<(), DriverError> {
        self.0.lock().push(port.name.clone());
        Ok(())
    }
}

fn ports() -> DeviceNewData<Playback> {
    DeviceNewData::new("laptop", stereo_44k())
        .with_port(Port::new("speaker", 10).with_latency_offset(1_500))
        .with_port(Port::new("headphones", 20))
}

#[test]
fn highest_priority_port_is_active_and_switchable() {
    let mut core = core();
    let switched = Arc::new(Mutex::new(Vec::new()));
    let out = sink_with(
        &mut core,
        ports(),
        DeviceCallbacks::new(PortSwitch(Arc::clone(&switched)), NullDriver),
    );
    assert_eq!(core.device(out).unwrap().active_port().map(|p| p.name.as_str()), Some("headphones"));

    core.set_device_port(out, "speaker", true).unwrap();
    let device = core.device(out).unwrap();
    assert_eq!(device.active_port().map(|p| p.name.as_str()), Some("speaker"));
    assert_eq!(device.port_latency_offset(), 1_500);
    assert!(device.save_port());
    assert_eq!(*switched.lock(), vec!["speaker".to_string()]);

    assert_eq!(
        core.set_device_port(out, "hdmi", false),
        Err(RoutingError::NoEntity("port"))
    );
    core.shutdown();
}

#[test]
fn port_switching_needs_driver_support() {
    let mut core = core();
    let out = sink_with(&mut core, ports(), DeviceCallbacks::null());
    assert_eq!(
        core.set_device_port(out, "speaker", false),
        Err(RoutingError::NotImplemented("port switching"))
    );
    core.shutdown();
}

#[test]
fn unplugged_port_gives_up_the_default() {
    let mut core = core();
    let laptop = sink_with(&mut core, ports(), DeviceCallbacks::null());
    let usb = sink(&mut core, "usb");
    assert_eq!(core.default_device::<Playback>(), Some(laptop));

    core.set_port_available(laptop, "headphones", PortAvailable::No).unwrap();
    assert_eq!(core.default_device::<Playback>(), Some(usb));
    core.set_port_available(laptop, "headphones", PortAvailable::Yes).unwrap();
    assert_eq!(core.default_device::<Playback>(), Some(usb));
    core.shutdown();
}

#[test]
fn names_are_unique_per_core() {
    let mut core = core();
    let first = sink(&mut core, "out");
    let second = sink(&mut core, "out");
    assert_eq!(core.device(second).unwrap().name(), "out.2");
    assert_eq!(core.lookup_device::<Playback>("out"), Some(first));
    assert_eq!(core.lookup_device::<Playback>("out.2"), Some(second));

    let strict = core.create_device(
        DeviceNewData::<Playback>::new("out", stereo_44k()).strict_name(),
        DeviceCallbacks::null(),
    );
    assert_eq!(strict.unwrap_err(), RoutingError::Exists("out".into()));

    core.unlink_device(first);
    core.unlink_device(first);
    assert_eq!(core.lookup_device::<Playback>("out"), None);
    core.shutdown();
}

#[test]
fn devices_that_never_linked_unlink_quietly() {
    let mut core: Core = core();
    let events = core.subscribe();
    let id = core
        .create_device(DeviceNewData::<Playback>::new("draft", stereo_44k()), DeviceCallbacks::null())
        .unwrap();
    core.unlink_device(id);
    assert!(core.device(id).is_none());
    assert_eq!(events.try_iter().count(), 0);
    core.shutdown();
}

#[test]
fn stream_counts_track_corking() {
    let mut core = core();
    let out = sink(&mut core, "speakers");
    let id = input(
        &mut core,
        StreamNewData::new(stereo_44k())
            .with_device(out)
            .with_flags(StreamFlags::START_CORKED),
        &StreamLog::default(),
    );
    assert_eq!(core.device_linked_by(out).unwrap(), 1);
    assert_eq!(core.device_used_by(out).unwrap(), 0);
    assert_eq!(core.device_check_suspend(out, None).unwrap(), 0);

    core.cork_stream(id, false).unwrap();
    assert_eq!(core.device_used_by(out).unwrap(), 1);
    assert_eq!(core.device_check_suspend(out, None).unwrap(), 1);
    assert_eq!(core.device_check_suspend(out, Some(id)).unwrap(), 0);
    assert_eq!(core.device(out).unwrap().state(), DeviceState::Running);

    core.unlink_stream(id);
    assert_eq!(core.device_linked_by(out).unwrap(), 0);
    assert_eq!(core.device(out).unwrap().state(), DeviceState::Idle);
    core.shutdown();
}
