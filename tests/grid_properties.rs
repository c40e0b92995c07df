//! End-to-end properties of the scan loop, router and point map.

mod common;

use grid_scada_gateway::domain::{Command, CommandOrigin, ElementKind, NetworkTopology};
use grid_scada_gateway::error::CommandError;
use grid_scada_gateway::points::{PointField, PointMap};
use proptest::prelude::*;
use rstest::rstest;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn grown(extra_loads: usize, extra_generators: usize) -> NetworkTopology {
    let mut topology = common::feeder();
    let load = topology.loads[0].clone();
    let generator = topology.generators[0].clone();
    for i in 0..extra_loads {
        let mut l = load.clone();
        l.id = 100 + i as u32;
        topology.loads.push(l);
    }
    for i in 0..extra_generators {
        let mut g = generator.clone();
        g.id = 100 + i as u32;
        topology.generators.push(g);
    }
    topology
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn point_map_is_deterministic(extra_loads in 0usize..60, extra_generators in 0usize..40) {
        let topology = grown(extra_loads, extra_generators);
        let first = PointMap::build(&topology).unwrap();

        let reread: NetworkTopology =
            serde_json::from_str(&serde_json::to_string(&topology).unwrap()).unwrap();
        let second = PointMap::build(&reread).unwrap();
        prop_assert_eq!(&first, &second);

        // loads keep declaration order inside their block
        for (i, load) in topology.loads.iter().enumerate() {
            let entry = first
                .register(PointField::LoadP.modbus_base() + i as u16)
                .and_then(|e| first.entry(e))
                .unwrap();
            prop_assert_eq!(entry.element_id, load.id);
        }
    }
}

#[tokio::test]
async fn test_open_breaker_zeroes_line_flow() {
    let gw = common::gateway();
    let before = gw.store().current();
    assert!(before.state.lines[0].p_mw.abs() > 0.0);

    gw.router()
        .submit(
            Command::Breaker {
                line_id: 0,
                closed: false,
            },
            CommandOrigin::Internal,
        )
        .unwrap();
    let after = gw.scheduler().tick().await.unwrap();

    let line = &after.state.lines[0];
    assert!(!line.closed);
    assert_eq!(line.p_mw, 0.0);
    assert_eq!(after.step, before.step + 1);
}

#[rstest]
#[case::unknown_load(Command::Load { load_id: 77, p_mw: 0.1, q_mvar: None }, ElementKind::Load)]
#[case::unknown_line(Command::Breaker { line_id: 9, closed: true }, ElementKind::Line)]
#[case::unknown_transformer(Command::TransformerTap { transformer_id: 4, tap_position: 0 }, ElementKind::Transformer)]
fn test_unknown_target_never_queued(#[case] command: Command, #[case] kind: ElementKind) {
    let gw = common::gateway();
    let err = gw.router().submit(command, CommandOrigin::Api).unwrap_err();
    assert!(matches!(err, CommandError::UnknownTarget { kind: k, .. } if k == kind));
    assert_eq!(gw.router().pending(), 0);
}

#[tokio::test]
async fn test_busy_target_first_command_wins() {
    let gw = common::gateway();
    let first = Command::Generator {
        generator_id: 0,
        p_mw: 2.0,
        q_mvar: None,
    };
    let second = Command::Generator {
        generator_id: 0,
        p_mw: 0.1,
        q_mvar: None,
    };
    gw.router().submit(first, CommandOrigin::Dnp3).unwrap();
    assert!(matches!(
        gw.router().submit(second, CommandOrigin::Modbus),
        Err(CommandError::TargetBusy(_))
    ));

    let snapshot = gw.scheduler().tick().await.unwrap();
    assert_eq!(snapshot.state.generators[0].p_mw, 2.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_only_see_whole_snapshots() {
    let gw = common::gateway();
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = gw.store().clone();
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                let mut seen = 0u64;
                while !done.load(Ordering::Acquire) {
                    let snapshot = store.current();
                    assert_eq!(snapshot.state.step, snapshot.step);
                    assert_eq!(snapshot.state.epoch, snapshot.epoch);
                    let entry = snapshot
                        .map
                        .register(PointField::GeneratorP.modbus_base())
                        .unwrap();
                    assert_eq!(
                        snapshot.image.value(entry),
                        Some(snapshot.state.generators[0].p_mw)
                    );
                    seen += 1;
                    tokio::task::yield_now().await;
                }
                seen
            })
        })
        .collect();

    for step in 0..20 {
        gw.router()
            .submit(
                Command::Generator {
                    generator_id: 0,
                    p_mw: 0.1 * f64::from(step),
                    q_mvar: None,
                },
                CommandOrigin::Internal,
            )
            .unwrap();
        gw.scheduler().tick().await.unwrap();
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        assert!(reader.await.unwrap() > 0);
    }
    assert_eq!(gw.store().current().step, 20);
}

#[tokio::test]
async fn test_battery_charges_then_discharges() {
    let gw = common::gateway();
    let initial = gw.store().current().state.storage[0].soc_percent;

    gw.router()
        .submit(
            Command::Storage {
                storage_id: 0,
                p_mw: -0.05,
            },
            CommandOrigin::Modbus,
        )
        .unwrap();
    let charged = gw.scheduler().tick().await.unwrap();
    assert_eq!(charged.state.storage[0].p_mw, -0.05);
    assert!(charged.state.storage[0].soc_percent > initial);

    gw.router()
        .submit(
            Command::Storage {
                storage_id: 0,
                p_mw: 0.05,
            },
            CommandOrigin::Dnp3,
        )
        .unwrap();
    let discharged = gw.scheduler().tick().await.unwrap();
    assert_eq!(discharged.state.storage[0].p_mw, 0.05);
    assert!(discharged.state.storage[0].soc_percent < charged.state.storage[0].soc_percent);

    let entry = discharged
        .map
        .register(PointField::StorageSoc.modbus_base())
        .unwrap();
    assert_eq!(
        discharged.image.value(entry),
        Some(discharged.state.storage[0].soc_percent)
    );
}
