//! Kill planner behavior: survivability downgrades, protected addresses,
//! and the cancellation semantics of instant kills.

use stillwater::{
    block_on, KillKind, Locality, ProcessClass, ReplicationPolicy, SimError, SimWorld,
    TaskPriority,
};

/// Three zones, two processes each, split over two datacenters.
fn three_zone_world(seed: u64) -> (SimWorld, Vec<stillwater::ProcessId>) {
    let world = SimWorld::new(seed);
    let mut processes = Vec::new();
    for zone in 0..3 {
        for port in 1..=2 {
            let dc = if zone == 0 { "dc-0" } else { "dc-1" };
            processes.push(world.new_process(
                &format!("z{zone}p{port}"),
                format!("10.0.{zone}.1").parse().expect("ip"),
                port,
                Locality::placed(dc, format!("zone-{zone}")),
                ProcessClass::Storage,
                "",
                "",
            ));
        }
    }
    (world, processes)
}

#[test]
fn unsurvivable_kill_downgrades_to_reboot() {
    let (world, processes) = three_zone_world(1);
    // Exactly three zones and a policy that needs all three: no kill can
    // proceed destructively.
    world.set_replication_policies(
        ReplicationPolicy::across_zones(3),
        ReplicationPolicy::across_zones(3),
        0,
    );

    assert!(world.kill_machine("zone-1", KillKind::KillInstantly, false, true));
    // Drive the scheduled reboot events.
    world.run_until_empty();

    for &p in &processes {
        assert!(
            !world.process_failed(p),
            "downgraded kill must not fail {p:?}"
        );
    }
    assert!(!world.machine_dead("zone-1"));
    for &p in &world.machine_processes("zone-1") {
        assert!(world.process_rebooting(p));
        assert_eq!(world.shutdown_kind(p), Some(KillKind::Reboot));
    }
    // The untouched zones are not rebooting.
    for &p in &world.machine_processes("zone-0") {
        assert!(!world.process_rebooting(p));
    }
}

#[test]
fn survivable_kill_proceeds_and_marks_machine_dead() {
    let (world, _) = three_zone_world(2);
    // Two-of-three zones: losing one leaves the policy satisfiable, and the
    // single dead zone is not itself enough to satisfy it.
    world.set_replication_policies(
        ReplicationPolicy::across_zones(2),
        ReplicationPolicy::across_zones(2),
        0,
    );

    assert!(world.kill_machine("zone-2", KillKind::KillInstantly, false, true));
    world.run_until_empty();

    assert!(world.machine_dead("zone-2"));
    for &p in &world.machine_processes("zone-2") {
        assert!(world.process_failed(p));
    }
    for &p in &world.machine_processes("zone-0") {
        assert!(!world.process_failed(p));
    }
}

#[test]
fn rebooted_address_can_be_rebound() {
    let (world, _) = three_zone_world(3);
    world.set_replication_policies(
        ReplicationPolicy::across_zones(3),
        ReplicationPolicy::across_zones(3),
        0,
    );
    world.kill_machine("zone-1", KillKind::KillInstantly, false, true);
    world.run_until_empty();

    // The harness observes the shutdown signal, destroys the process, and
    // binds a replacement on the same address.
    let victims = world.machine_processes("zone-1");
    for &p in &victims {
        let address = world.process_address(p);
        world.destroy_process(p);
        let replacement = world.new_process(
            "replacement",
            address.ip,
            address.port,
            Locality::placed("dc-1", "zone-1"),
            ProcessClass::Storage,
            "",
            "",
        );
        assert_eq!(world.process_by_address(address), Some(replacement));
        assert!(!world.process_failed(replacement));
        assert!(!world.process_rebooting(replacement));
    }
}

#[test]
fn protected_address_never_loses_data() {
    let (world, processes) = three_zone_world(4);
    let p = processes[0];
    world.protect_address(world.process_address(p));

    world.reboot_process(p, KillKind::RebootProcessAndDelete);
    world.run_until_empty();

    // The delete was silently rewritten to a plain process reboot.
    assert_eq!(world.shutdown_kind(p), Some(KillKind::RebootProcess));
}

#[test]
fn datacenter_kill_respects_survivability() {
    let (world, _) = three_zone_world(5);
    // dc-1 holds zones 1 and 2; losing it leaves one zone standing.
    world.set_replication_policies(
        ReplicationPolicy::across_zones(2),
        ReplicationPolicy::across_zones(2),
        0,
    );

    world.kill_datacenter("dc-1", KillKind::KillInstantly);
    world.run_until_empty();

    // The dead set alone satisfies the policy (the kill would take live
    // data down), so it was downgraded: nothing failed, the zones reboot.
    for zone in ["zone-1", "zone-2"] {
        assert!(!world.machine_dead(zone));
        for &p in &world.machine_processes(zone) {
            assert!(!world.process_failed(p));
            assert!(world.process_rebooting(p));
        }
    }
}

#[test]
fn anti_quorum_blocks_borderline_kills() {
    let (world, _) = three_zone_world(6);
    // Dead set {zone-1} plus any one remaining zone reaches the two-zone
    // policy, which the anti-quorum of one forbids.
    world.set_replication_policies(
        ReplicationPolicy::across_zones(2),
        ReplicationPolicy::across_zones(2),
        1,
    );

    world.kill_machine("zone-1", KillKind::KillInstantly, false, true);
    world.run_until_empty();

    for &p in &world.machine_processes("zone-1") {
        assert!(!world.process_failed(p), "anti-quorum must downgrade the kill");
        assert!(world.process_rebooting(p));
    }
}

#[test]
fn instant_kill_cancels_pending_tasks() {
    let (world, processes) = three_zone_world(7);
    let victim = processes[0];

    let result = {
        let world = world.clone();
        block_on(&world.clone(), async move {
            let sleeper = {
                let world = world.clone();
                tokio::task::spawn_local(async move {
                    world
                        .on_process(victim, TaskPriority::DEFAULT_DELAY)
                        .await
                        .expect("hop");
                    world.sleep(1000.0).await
                })
            };
            world.sleep(1.0).await.expect("sleep");
            world.kill_process(victim, KillKind::KillInstantly);
            sleeper.await.expect("join")
        })
    };

    assert_eq!(result, Err(SimError::ActorCancelled));
    assert!(world.process_failed(victim));
}

#[test]
fn inject_faults_arms_the_process() {
    let (world, processes) = three_zone_world(8);
    let victim = processes[1];
    assert!(!world.fault_injection_armed(victim));
    world.kill_process(victim, KillKind::InjectFaults);
    assert!(world.fault_injection_armed(victim));
    // Faulted processes keep running; only their I/O paths get flaky.
    assert!(!world.process_failed(victim));
}

#[test]
fn tester_processes_are_invisible_to_the_planner() {
    let world = SimWorld::new(9);
    // Two real zones plus a tester-only zone.
    for zone in 0..2 {
        world.new_process(
            &format!("real-{zone}"),
            format!("10.0.{zone}.1").parse().expect("ip"),
            1,
            Locality::zoned(format!("zone-{zone}")),
            ProcessClass::Storage,
            "",
            "",
        );
    }
    world.new_process(
        "tester",
        "10.0.9.1".parse().expect("ip"),
        1,
        Locality::zoned("zone-tester"),
        ProcessClass::Tester,
        "",
        "",
    );
    world.set_replication_policies(
        ReplicationPolicy::across_zones(2),
        ReplicationPolicy::across_zones(2),
        0,
    );

    // With the tester excluded, the survivors of killing zone-1 are just
    // zone-0: the policy fails and the kill downgrades.
    world.kill_machine("zone-1", KillKind::KillInstantly, false, true);
    world.run_until_empty();
    for &p in &world.machine_processes("zone-1") {
        assert!(!world.process_failed(p));
    }
}

#[test]
fn instant_kill_does_not_advance_time_for_dead_tasks() {
    let (world, processes) = three_zone_world(10);
    let victim = processes[0];

    let far_future = world.delay(500.0, TaskPriority::DEFAULT_DELAY, victim);
    world.kill_process(victim, KillKind::KillInstantly);
    world.run_until_empty();

    // The dead target's task resolved as never without advancing the clock.
    assert!(world.now() < 500.0);
    drop(far_future);
}
