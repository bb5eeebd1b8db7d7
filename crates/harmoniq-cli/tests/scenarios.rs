use harmoniq_cli::Scenario;

#[test]
fn laptop_scenario_rescues_streams_from_the_unplugged_output() {
    let scenario = Scenario::from_json(include_str!("../scenarios/laptop.json")).expect("valid scenario");
    let report = scenario.run().expect("scenario runs");
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.rendered_bytes, 4096 + 1024);

    let snapshot = &report.snapshot;
    assert_eq!(snapshot.sinks.len(), 1);
    let laptop = &snapshot.sinks[0];
    assert_eq!(laptop.name, "laptop");
    assert_eq!(laptop.active_port.as_deref(), Some("headphones"));
    assert_eq!(laptop.streams.len(), 2);
    assert!(snapshot
        .sink_inputs
        .iter()
        .all(|input| input.device == Some(laptop.index)));
    assert_eq!(snapshot.source_outputs.len(), 1);
}
