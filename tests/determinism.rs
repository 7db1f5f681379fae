//! Determinism and ordering guarantees of the event queue and clock.

use std::cell::RefCell;
use std::rc::Rc;

use stillwater::{
    block_on, Locality, ProcessClass, ProcessId, SimWorld, TaskPriority,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn spawn_processes(world: &SimWorld, count: usize) -> Vec<ProcessId> {
    // count processes over three zones in two datacenters.
    (0..count)
        .map(|i| {
            let zone = format!("zone-{}", i % 3);
            let dc = format!("dc-{}", i % 2);
            let ip = format!("10.0.{}.{}", i % 3, 1).parse().expect("ip");
            world.new_process(
                &format!("process-{i}"),
                ip,
                (i / 3 + 1) as u16,
                Locality::placed(dc, zone),
                ProcessClass::Storage,
                "",
                "",
            )
        })
        .collect()
}

/// One full run of a small ring workload: every process listens, connects to
/// the next process in the ring, and pushes a few randomly spaced messages.
fn ring_workload_trace(seed: u64) -> (u64, f64, u64) {
    let world = SimWorld::new(seed);
    let processes = spawn_processes(&world, 9);
    let addrs: Vec<_> = processes
        .iter()
        .map(|&p| world.process_address(p))
        .collect();

    let result = {
        let world = world.clone();
        block_on(&world.clone(), async move {
            let mut handles = Vec::new();
            for (i, &p) in processes.iter().enumerate() {
                let world = world.clone();
                let my_addr = addrs[i];
                let next_addr = addrs[(i + 1) % addrs.len()];
                handles.push(tokio::task::spawn_local(async move {
                    let net = world.network_provider();
                    world
                        .on_process(p, TaskPriority::DEFAULT_DELAY)
                        .await
                        .expect("hop to own process");
                    let listener = net.listen(my_addr).expect("listen");

                    let server = async {
                        let (mut stream, _peer) = listener.accept().await.expect("accept");
                        let mut buf = [0u8; 50];
                        stream.read_exact(&mut buf).await.expect("server read");
                        buf.iter().map(|&b| b as u64).sum::<u64>()
                    };
                    let client = async {
                        let mut stream = net.connect(next_addr).await.expect("connect");
                        for round in 0..5u8 {
                            world
                                .sleep(stillwater::sim_random01())
                                .await
                                .expect("client sleep");
                            stream
                                .write_all(&[round; 10])
                                .await
                                .expect("client write");
                        }
                        stream.flush().await.expect("flush");
                        // Leave time for delivery before dropping the stream.
                        world.sleep(2.0).await.expect("drain sleep");
                    };
                    let (sum, ()) = tokio::join!(server, client);
                    sum
                }));
            }
            let mut checksum = 0u64;
            for handle in handles {
                checksum += handle.await.expect("workload");
            }
            checksum
        })
    };

    (world.task_count(), world.now(), result)
}

#[test]
fn identical_seeds_produce_identical_runs() {
    let first = ring_workload_trace(0xDEAD_BEEF);
    let second = ring_workload_trace(0xDEAD_BEEF);
    assert_eq!(first, second);
}

#[test]
fn different_seeds_diverge() {
    let first = ring_workload_trace(1);
    let second = ring_workload_trace(2);
    // The payload checksum is seed-independent; the schedule is not.
    assert_eq!(first.2, second.2);
    assert_ne!((first.0, first.1), (second.0, second.1));
}

#[test]
fn dispatch_trace_is_reproducible_and_monotonic() {
    let run = |seed: u64| {
        let world = SimWorld::new(seed);
        let processes = spawn_processes(&world, 6);
        let mut futures = Vec::new();
        for (i, &p) in processes.iter().enumerate() {
            for _ in 0..20 {
                futures.push(world.delay(
                    stillwater::sim_random01() * (i + 1) as f64,
                    TaskPriority::DEFAULT_DELAY,
                    p,
                ));
            }
        }
        let mut trace = Vec::new();
        let mut last = 0.0f64;
        loop {
            let more = world.step();
            let now = world.now();
            assert!(now >= last, "time went backwards: {last} -> {now}");
            last = now;
            trace.push((now.to_bits(), world.current_process()));
            if !more {
                break;
            }
        }
        drop(futures);
        trace
    };

    assert_eq!(run(42), run(42));
    assert_ne!(run(42), run(43));
}

#[test]
fn equal_time_tasks_dispatch_in_enqueue_order() {
    let world = SimWorld::new(7);
    let processes = spawn_processes(&world, 3);
    let order = Rc::new(RefCell::new(Vec::new()));

    {
        let world = world.clone();
        let order = Rc::clone(&order);
        block_on(&world.clone(), async move {
            let mut handles = Vec::new();
            for i in 0..10usize {
                let world = world.clone();
                let order = Rc::clone(&order);
                let p = processes[i % processes.len()];
                // All at virtual time zero, enqueued in index order.
                let fut = world.delay(0.0, TaskPriority::DEFAULT_DELAY, p);
                handles.push(tokio::task::spawn_local(async move {
                    fut.await.expect("delay");
                    order.borrow_mut().push(i);
                }));
            }
            for handle in handles {
                handle.await.expect("task");
            }
        });
    }

    assert_eq!(*order.borrow(), (0..10).collect::<Vec<_>>());
}

#[test]
fn yield_periodically_suspends_long_runs() {
    let world = SimWorld::new(13);
    let p = spawn_processes(&world, 1)[0];
    let suspensions = {
        let world = world.clone();
        block_on(&world.clone(), async move {
            world
                .on_process(p, TaskPriority::DEFAULT_DELAY)
                .await
                .expect("hop");
            let mut suspensions = 0;
            for _ in 0..500 {
                let before = world.now();
                world
                    .yield_now(TaskPriority::DEFAULT_YIELD)
                    .await
                    .expect("yield");
                if world.now() > before {
                    suspensions += 1;
                }
            }
            suspensions
        })
    };
    // The 1..150 down-counter guarantees a cooperative run cannot go
    // unboundedly long without truly yielding.
    assert!(
        (3..=500).contains(&suspensions),
        "unexpected suspension count {suspensions}"
    );
}

#[test]
fn timer_drifts_ahead_but_never_behind_now() {
    let world = SimWorld::new(11);
    let p = spawn_processes(&world, 1)[0];
    let mut futures = Vec::new();
    for i in 0..100 {
        futures.push(world.delay(i as f64 * 0.01, TaskPriority::DEFAULT_DELAY, p));
    }
    let mut last_timer = 0.0f64;
    while world.step() {
        let now = world.now();
        let timer = world.timer();
        assert!(timer >= now);
        assert!(timer <= now + 0.1 + 1e-9);
        assert!(timer >= last_timer, "timer went backwards");
        last_timer = timer;
    }
    drop(futures);
}
