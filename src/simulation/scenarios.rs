//! Built-in topologies runnable from the command line and reused by the
//! end-to-end tests.

use crate::simulation::runner::SimRunner;

pub const SCENARIO_NAMES: &[&str] = &["linear", "star", "companion"];

/// Build a named scenario, or `None` for an unknown name.
pub fn build(name: &str, seed: u64) -> Option<SimRunner> {
    let mut runner = SimRunner::new(seed);
    match name {
        "linear" => setup_linear(&mut runner),
        "star" => setup_star(&mut runner),
        "companion" => setup_companion(&mut runner),
        _ => return None,
    }
    Some(runner)
}

/// Linear chain: RelayA -- RelayB -- RelayC. A knows the time and pings C
/// through B.
pub fn setup_linear(runner: &mut SimRunner) {
    runner.add_repeater("RelayA");
    runner.add_repeater("RelayB");
    runner.add_repeater("RelayC");

    runner.set_link("RelayA", "RelayB", -70, 32);
    runner.set_link("RelayB", "RelayC", -75, 28);
    // RelayA and RelayC are out of range of each other.

    runner
        .node_mut("RelayA")
        .expect("node exists")
        .time_sync
        .set_time(1_700_000_000);

    let target = runner.node("RelayC").expect("node exists").hash();
    runner
        .node_mut("RelayA")
        .expect("node exists")
        .send_directed_ping(target);
}

/// Star: four spokes around a hub. North pings South across the hub.
pub fn setup_star(runner: &mut SimRunner) {
    runner.add_repeater("Center");
    runner.add_repeater("North");
    runner.add_repeater("East");
    runner.add_repeater("South");
    runner.add_repeater("West");

    for name in ["North", "East", "South", "West"] {
        runner.set_link("Center", name, -65, 36);
    }

    runner
        .node_mut("Center")
        .expect("node exists")
        .time_sync
        .set_time(1_700_000_000);

    let target = runner.node("South").expect("node exists").hash();
    runner
        .node_mut("North")
        .expect("node exists")
        .send_directed_ping(target);
}

/// Two companions bridged by two repeaters.
pub fn setup_companion(runner: &mut SimRunner) {
    runner.add_companion("Comp1");
    runner.add_repeater("RepA");
    runner.add_repeater("RepB");
    runner.add_companion("Comp2");

    runner.set_link("Comp1", "RepA", -65, 36);
    runner.set_link("RepA", "RepB", -70, 32);
    runner.set_link("RepB", "Comp2", -65, 36);

    runner
        .node_mut("RepA")
        .expect("node exists")
        .time_sync
        .set_time(1_700_000_000);

    let target = runner.node("Comp2").expect("node exists").hash();
    runner
        .node_mut("Comp1")
        .expect("node exists")
        .send_directed_ping(target);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_scenarios_build() {
        for name in SCENARIO_NAMES {
            let runner = build(name, 7).unwrap();
            assert!(runner.node_names().count() >= 3, "{name} too small");
        }
        assert!(build("bogus", 7).is_none());
    }

    #[test]
    fn linear_scenario_completes_a_ping() {
        let mut runner = build("linear", 7).unwrap();
        runner.run(10_000);
        let ponged = runner
            .node("RelayA")
            .unwrap()
            .events
            .history()
            .any(|e| e.text.contains("PONG") && !e.text.contains("->"));
        assert!(ponged, "RelayA should hear RelayC's pong");
        assert!(runner.node("RelayB").unwrap().stats.fwd_count > 0);
    }

    #[test]
    fn companion_scenario_keeps_endpoints_passive() {
        let mut runner = build("companion", 7).unwrap();
        runner.run(15_000);
        assert_eq!(runner.node("Comp1").unwrap().stats.fwd_count, 0);
        assert_eq!(runner.node("Comp2").unwrap().stats.fwd_count, 0);
        assert!(runner.node("RepA").unwrap().stats.fwd_count > 0);
    }
}
