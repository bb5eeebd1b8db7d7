use std::time::Duration;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use harmoniq_routing::{
    ChannelVolumes, Core, CoreConfig, DeviceCallbacks, DeviceId, DeviceNewData, IoBlock, Playback, SampleFormat,
    SampleSpec, StreamCallbacks, StreamId, StreamNewData, Volume,
};

fn stereo() -> SampleSpec {
    SampleSpec::new(SampleFormat::S16Le, 48_000, 2)
}

fn level(fraction: f64) -> ChannelVolumes {
    ChannelVolumes::uniform(2, Volume::from_fraction(fraction))
}

fn sink(core: &mut Core, name: &str) -> DeviceId<Playback> {
    let id = core
        .create_device(DeviceNewData::new(name, stereo()), DeviceCallbacks::null())
        .expect("create sink");
    core.put_device(id).expect("put sink");
    id
}

fn streams(core: &mut Core, device: DeviceId<Playback>, count: usize) -> Vec<StreamId<Playback>> {
    (0..count)
        .map(|n| {
            let data = StreamNewData::new(stereo())
                .with_device(device)
                .with_volume(level(0.2 + (n % 8) as f64 * 0.1), true);
            let id = core.create_stream(data, StreamCallbacks::null()).expect("create stream");
            core.put_stream(id).expect("put stream");
            id
        })
        .collect()
}

fn flat_volume(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(30);

    group.bench_function("flat_volume_32_streams", |b| {
        let mut core = Core::new(CoreConfig::default());
        let out = sink(&mut core, "speakers");
        let ids = streams(&mut core, out, 32);
        let mut step = 0usize;
        b.iter(|| {
            step += 1;
            let id = ids[step % ids.len()];
            core.set_stream_volume(id, &level((step % 100) as f64 / 100.0), false, true)
                .expect("stream volume");
            core.set_device_volume(out, Some(&level(0.5 + (step % 50) as f64 / 100.0)), true, false)
                .expect("device volume");
        });
        core.shutdown();
    });

    group.bench_function("mix_16_streams_block1024", |b| {
        let mut core = Core::new(CoreConfig::default());
        let out = sink(&mut core, "speakers");
        streams(&mut core, out, 16);
        b.iter(|| {
            core.process_device(out, IoBlock::Render(4_096)).expect("render block");
        });
        core.shutdown();
    });

    group.finish();
}

fn move_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("moves");
    group.sample_size(20);

    group.bench_function("move_8_streams_between_sinks", |b| {
        b.iter_batched(
            || {
                let mut core = Core::new(CoreConfig::default());
                let a = sink(&mut core, "a");
                let b = sink(&mut core, "b");
                let ids = streams(&mut core, a, 8);
                (core, a, b, ids)
            },
            |(mut core, a, b, ids)| {
                for id in &ids {
                    core.move_stream_to(*id, b, false).expect("move");
                }
                for id in &ids {
                    core.move_stream_to(*id, a, false).expect("move back");
                }
                core.shutdown();
            },
            BatchSize::PerIteration,
        );
    });

    group.finish();
}

criterion_group!(benches, flat_volume, move_throughput);
criterion_main!(benches);
