mod common;

use common::*;
use harmoniq_routing::{
    Core, CoreConfig, CoreEvent, DeviceId, EventKind, Facility, HookResult, IoBlock, Playback, RoutingError,
    StreamFlags, StreamNewData, StreamState,
};

fn render(core: &mut Core, device: DeviceId<Playback>) {
    core.process_device(device, IoBlock::Render(4096)).expect("render block");
}

#[test]
fn moved_stream_plays_on_its_new_device() {
    let mut core = core();
    let a = sink(&mut core, "a");
    let b = sink(&mut core, "b");
    let log = StreamLog::default();
    let id = input(&mut core, StreamNewData::new(stereo_44k()).with_device(a), &log);
    render(&mut core, a);
    let before = *log.popped.lock();
    assert!(before > 0);

    let events = core.subscribe();
    core.move_stream_to(id, b, true).unwrap();

    let stream = core.stream(id).unwrap();
    assert_eq!(stream.device(), Some(b));
    assert_eq!(stream.preferred_device(), Some("b"));
    assert_eq!(stream.state(), StreamState::Running);
    assert_eq!(core.device(a).unwrap().streams().count(), 0);
    assert_eq!(core.device(b).unwrap().streams().collect::<Vec<_>>(), vec![id]);
    assert!(log.calls().contains(&StreamCall::Moving(Some(b.index()))));
    assert!(events.try_iter().any(|event| event
        == CoreEvent::Subscription(harmoniq_routing::SubscriptionEvent {
            facility: Facility::SinkInput,
            kind: EventKind::Change,
            index: id.index(),
        })));

    render(&mut core, a);
    assert_eq!(*log.popped.lock(), before);
    render(&mut core, b);
    assert!(*log.popped.lock() > before);

    // moving back to the default forgets the preference
    core.move_stream_to(id, a, true).unwrap();
    assert_eq!(core.stream(id).unwrap().preferred_device(), None);
    core.shutdown();
}

#[test]
fn refused_move_leaves_the_stream_in_place() {
    let mut core = core();
    let a = sink(&mut core, "a");
    let b = sink(&mut core, "b");
    let log = StreamLog::default();
    let id = input(&mut core, StreamNewData::new(stereo_44k()).with_device(a), &log);
    *log.refuse_moves.lock() = true;

    assert!(!core.may_move_stream_to(id, b));
    assert!(matches!(core.move_stream_to(id, b, false), Err(RoutingError::Refused(_))));
    assert_eq!(core.stream(id).unwrap().device(), Some(a));
    assert!(!log.calls().iter().any(|call| matches!(call, StreamCall::Moving(_))));

    render(&mut core, a);
    assert!(*log.popped.lock() > 0);
    core.shutdown();
}

#[test]
fn filter_chains_reject_cycles() {
    let mut core = core();
    let master = sink(&mut core, "master");
    let (eq, eq_feed) = filter_sink(&mut core, "equalizer", master);
    let (comp, comp_feed) = filter_sink(&mut core, "compressor", eq);

    assert_eq!(core.stream(comp_feed).unwrap().device(), Some(eq));
    assert!(!core.may_move_stream_to(eq_feed, eq));
    assert!(!core.may_move_stream_to(eq_feed, comp));
    assert!(core.may_move_stream_to(comp_feed, master));

    let app = input_on(&mut core, comp, 0.5);
    assert!(core.may_move_stream_to(app, master));
    assert!(core.may_move_stream_to(app, eq));
    core.shutdown();
}

#[test]
fn corked_stream_stays_silent_across_a_move() {
    let mut core = core();
    let a = sink(&mut core, "a");
    let b = sink(&mut core, "b");
    let log = StreamLog::default();
    let id = input(
        &mut core,
        StreamNewData::new(stereo_44k())
            .with_device(a)
            .with_flags(StreamFlags::START_CORKED),
        &log,
    );
    assert_eq!(core.device(a).unwrap().n_corked(), 1);

    core.move_stream_to(id, b, false).unwrap();
    assert_eq!(core.device(a).unwrap().n_corked(), 0);
    assert_eq!(core.device(b).unwrap().n_corked(), 1);
    assert_eq!(core.device_used_by(b).unwrap(), 0);
    render(&mut core, b);
    assert_eq!(*log.popped.lock(), 0);

    core.cork_stream(id, false).unwrap();
    render(&mut core, b);
    assert!(*log.popped.lock() > 0);
    core.shutdown();
}

#[test]
fn unlinked_device_hands_its_streams_to_the_default() {
    let mut core = core();
    let a = sink(&mut core, "a");
    let b = sink(&mut core, "b");
    let log = StreamLog::default();
    let id = input(&mut core, StreamNewData::new(stereo_44k()).with_device(b), &log);

    core.unlink_device(b);
    assert!(core.device(b).is_none());
    assert_eq!(core.stream(id).unwrap().device(), Some(a));
    assert!(log.calls().contains(&StreamCall::Moving(Some(a.index()))));
    assert!(!log.was_killed());
    core.shutdown();
}

#[test]
fn streams_die_with_their_device_without_rescue() {
    let mut core = Core::new(CoreConfig::default().with_rescue_streams(false));
    let _a = sink(&mut core, "a");
    let b = sink(&mut core, "b");
    let log = StreamLog::default();
    let id = input(&mut core, StreamNewData::new(stereo_44k()).with_device(b), &log);

    core.unlink_device(b);
    assert!(core.stream(id).is_none());
    assert!(log.was_killed());
    core.shutdown();
}

#[test]
fn fail_hook_can_place_the_stream() {
    let mut core = core();
    let a = sink(&mut core, "a");
    let _b = sink(&mut core, "b");
    let c = sink(&mut core, "c");
    let log = StreamLog::default();
    let id = input(&mut core, StreamNewData::new(stereo_44k()).with_device(a), &log);

    core.hooks::<Playback>().stream_move_fail.connect(0, move |data| {
        data.destination = Some(c);
        HookResult::Stop
    });
    core.start_stream_move(id).unwrap();
    assert!(core.stream(id).unwrap().is_moving());
    core.fail_stream_move(id);

    assert_eq!(core.stream(id).unwrap().device(), Some(c));
    assert!(!log.was_killed());
    core.shutdown();
}

#[test]
fn failed_move_without_rescue_kills_the_stream() {
    let mut core = Core::new(CoreConfig::default().with_rescue_streams(false));
    let a = sink(&mut core, "a");
    let log = StreamLog::default();
    let id = input(&mut core, StreamNewData::new(stereo_44k()).with_device(a), &log);

    core.start_stream_move(id).unwrap();
    core.fail_stream_move(id);
    assert!(core.stream(id).is_none());
    assert!(log.calls().contains(&StreamCall::Moving(None)));
    assert!(log.was_killed());
    core.shutdown();
}

#[test]
fn move_start_hook_can_veto() {
    let mut core = core();
    let a = sink(&mut core, "a");
    let b = sink(&mut core, "b");
    let id = input_on(&mut core, a, 1.0);
    core.hooks::<Playback>()
        .stream_move_start
        .connect(0, |_| HookResult::Cancel);

    assert_eq!(core.move_stream_to(id, b, false), Err(RoutingError::Canceled));
    assert_eq!(core.stream(id).unwrap().device(), Some(a));
    assert!(!core.stream(id).unwrap().is_moving());
    core.shutdown();
}

#[test]
fn full_devices_refuse_moves() {
    let mut core = Core::new(CoreConfig::default().with_max_streams_per_device(1));
    let a = sink(&mut core, "a");
    let b = sink(&mut core, "b");
    let id = input_on(&mut core, a, 1.0);
    let occupant = input_on(&mut core, b, 1.0);

    assert!(core.may_move_stream(id));
    assert!(!core.may_move_stream_to(id, b));
    core.kill_stream(occupant);
    assert!(core.may_move_stream_to(id, b));
    core.shutdown();
}

#[test]
fn synced_streams_stay_together() {
    let mut core = core();
    let a = sink(&mut core, "a");
    let b = sink(&mut core, "b");
    let corked = || {
        StreamNewData::<Playback>::new(stereo_44k())
            .with_device(a)
            .with_flags(StreamFlags::START_CORKED)
    };
    let first = input(&mut core, corked(), &StreamLog::default());
    let second = input(&mut core, corked().with_sync_base(first), &StreamLog::default());

    assert!(!core.may_move_stream(first));
    assert!(!core.may_move_stream_to(second, b));
    assert!(matches!(core.start_stream_move(second), Err(RoutingError::Refused(_))));

    // leaving the group frees the survivor
    core.kill_stream(second);
    assert!(core.may_move_stream_to(first, b));
    core.shutdown();
}
