//! End-to-end engine behavior: module bring-up, election, control-flag
//! application, link-table flow and orderly shutdown.

use std::sync::Arc;
use std::time::Duration;

use rksd::Timespec;
use rksd::adapters::clock::FakeClock;
use rksd::config::Config;
use rksd::domain::link::{LinkFlags, LinkKind, LinkRow, TsCaps};
use rksd::domain::state::{Alarms, ControlFlags, SyncState};
use rksd::engine::{Engine, EngineConfig, ModuleBuilder, ModuleSpec};
use rksd::runtime::{Runtime, RuntimeConfig};
use rksd::sync::ModuleKind;

fn freerun_spec(name: &str, priority: u8) -> ModuleSpec {
    ModuleSpec {
        name: name.to_string(),
        kind: ModuleKind::Freerun,
        tick_interval: Timespec::from_ns(50_000_000),
        user_priority: priority,
        interface: None,
        prefer_hw_timestamps: false,
        builder: ModuleBuilder::Freerun,
    }
}

fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        selection_interval: Timespec::from_ns(50_000_000),
        selection_holdoff: Timespec::from_ns(100_000_000),
        stats_interval: Timespec::from_secs(3600),
        save_interval: Timespec::from_secs(3600),
        ..EngineConfig::default()
    }
}

fn phys_row(idx: i32, name: &str) -> LinkRow {
    LinkRow {
        if_index: idx,
        if_name: name.into(),
        kind: LinkKind::Physical,
        flags: LinkFlags::UP | LinkFlags::RUNNING,
        bond: None,
        vlan_id: None,
        l2_addr: [2, 0, 0, 0, 0, idx as u8],
        ts_caps: TsCaps::SOFTWARE | TsCaps::HARDWARE,
    }
}

#[test]
fn test_engine_elects_best_priority_instance() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let clock = Arc::new(FakeClock::new());
    let specs = vec![freerun_spec("primary", 10), freerun_spec("backup", 200)];
    let engine = Engine::start(&runtime, fast_engine_config(), clock, specs).unwrap();

    // Give the modules a few ticks and the engine a few elections.
    std::thread::sleep(Duration::from_millis(600));

    let primary = engine.instance_status("primary").unwrap();
    let backup = engine.instance_status("backup").unwrap();
    assert_eq!(primary.state, SyncState::Master);
    assert!(
        primary
            .control_flags
            .contains(ControlFlags::SELECTED | ControlFlags::CLOCK_CTRL),
        "primary should be elected: {:?}",
        primary.control_flags
    );
    assert!(!backup.control_flags.contains(ControlFlags::SELECTED));
    assert!(!backup.control_flags.contains(ControlFlags::CLOCK_CTRL));
    assert!(primary.alarms.is_empty());

    assert_eq!(engine.stop(), 0);
    assert_eq!(runtime.pool().outstanding(), 0);
}

#[test]
fn test_unknown_instance_lookup_fails() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let clock = Arc::new(FakeClock::new());
    let engine = Engine::start(
        &runtime,
        fast_engine_config(),
        clock,
        vec![freerun_spec("only", 10)],
    )
    .unwrap();
    assert!(engine.instance_status("nope").is_err());
    assert_eq!(engine.stop(), 0);
}

#[test]
fn test_link_table_flows_through_modules() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let clock = Arc::new(FakeClock::new());
    let engine = Engine::start(
        &runtime,
        fast_engine_config(),
        clock,
        vec![freerun_spec("a", 1), freerun_spec("b", 2)],
    )
    .unwrap();

    // Several published versions in a row: each must be fully released by
    // both modules before the next goes out, and nothing leaks.
    for round in 0..5 {
        engine
            .push_link_table(vec![phys_row(1, "eth0"), phys_row(2 + round, "eth1")])
            .unwrap();
        std::thread::sleep(Duration::from_millis(120));
    }
    let status = engine.instance_status("a").unwrap();
    assert!(status.alarms.is_empty());

    assert_eq!(engine.stop(), 0);
    assert_eq!(runtime.pool().outstanding(), 0);
}

#[test]
fn test_step_clock_and_topology_requests() {
    let runtime = Runtime::new(RuntimeConfig::default());
    let clock = Arc::new(FakeClock::new());
    let engine = Engine::start(
        &runtime,
        fast_engine_config(),
        clock.clone(),
        vec![freerun_spec("fallback", 10)],
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(200));

    engine
        .step_clock("fallback", Timespec::from_ns(250_000))
        .unwrap();
    let state = clock.snapshot();
    assert_eq!(state.steps, vec![Timespec::from_ns(250_000)]);

    let topology = engine.write_topology("fallback").unwrap();
    assert!(topology.contains("grandmaster"));
    assert!(topology.contains("fallback (this host)"));

    engine.test_mode("fallback", 1, [0, 0, 0]).unwrap();
    assert!(engine.step_clock("nope", Timespec::ZERO).is_err());

    assert_eq!(engine.stop(), 0);
    assert_eq!(runtime.pool().outstanding(), 0);
}

#[test]
fn test_engine_from_parsed_config() {
    let toml = r#"
        [general]
        message_pool_size = 64
        selection_interval = 0.05
        selection_holdoff = 0.1

        [[instance]]
        name = "fallback"
        kind = "freerun"
        priority = 128
    "#;
    let config = Config::from_str(toml).unwrap();
    let runtime = Runtime::new(RuntimeConfig {
        pool_size: config.general.message_pool_size,
    });
    let engine_config = EngineConfig {
        selection_interval: config.general.selection_interval,
        selection_holdoff: config.general.selection_holdoff,
        policy: config.general.policy.clone(),
        ..fast_engine_config()
    };
    let specs = vec![freerun_spec("fallback", config.instances[0].priority)];
    let engine = Engine::start(&runtime, engine_config, Arc::new(FakeClock::new()), specs).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    let status = engine.instance_status("fallback").unwrap();
    assert!(status.control_flags.contains(ControlFlags::SELECTED));
    assert!(!status.alarms.contains(Alarms::NO_INTERFACE));
    assert_eq!(engine.stop(), 0);
}
