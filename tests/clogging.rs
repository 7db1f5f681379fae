//! Clog semantics: per-pair and per-interface congestion gates delivery.

use stillwater::{block_on, ClogMode, Locality, ProcessClass, SimWorld, TaskPriority};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn pair(world: &SimWorld) -> (stillwater::ProcessId, stillwater::ProcessId) {
    let a = world.new_process(
        "a",
        "10.0.0.1".parse().expect("ip"),
        1,
        Locality::zoned("zone-a"),
        ProcessClass::Storage,
        "",
        "",
    );
    let b = world.new_process(
        "b",
        "10.0.0.2".parse().expect("ip"),
        1,
        Locality::zoned("zone-b"),
        ProcessClass::Storage,
        "",
        "",
    );
    (a, b)
}

#[test]
fn clogged_pair_delays_delivery() {
    let world = SimWorld::new(0xC106);
    let (a, b) = pair(&world);
    let b_addr = world.process_address(b);

    let read_time = {
        let world = world.clone();
        block_on(&world.clone(), async move {
            let net = world.network_provider();
            let server = {
                let world = world.clone();
                let net = net.clone();
                tokio::task::spawn_local(async move {
                    world
                        .on_process(b, TaskPriority::DEFAULT_DELAY)
                        .await
                        .expect("hop");
                    let listener = net.listen(b_addr).expect("listen");
                    let (mut stream, _) = listener.accept().await.expect("accept");
                    let mut buf = [0u8; 5];
                    stream.read_exact(&mut buf).await.expect("read");
                    world.now()
                })
            };

            world
                .on_process(a, TaskPriority::DEFAULT_DELAY)
                .await
                .expect("hop");
            let mut stream = net.connect(b_addr).await.expect("connect");
            world.clog_pair(
                "10.0.0.1".parse().expect("ip"),
                "10.0.0.2".parse().expect("ip"),
                5.0,
            );
            let write_start = world.now();
            stream.write_all(b"CLOGS").await.expect("write");
            let read_time = server.await.expect("server");
            world.sleep(0.5).await.expect("drain");
            assert!(write_start < 1.0);
            read_time
        })
    };

    assert!(
        read_time >= 5.0,
        "clogged pair delivered at {read_time}, before the clog expired"
    );
}

#[test]
fn reverse_pair_clog_does_not_delay() {
    let world = SimWorld::new(0xC107);
    let (a, b) = pair(&world);
    let b_addr = world.process_address(b);

    let read_time = {
        let world = world.clone();
        block_on(&world.clone(), async move {
            let net = world.network_provider();
            let server = {
                let world = world.clone();
                let net = net.clone();
                tokio::task::spawn_local(async move {
                    world
                        .on_process(b, TaskPriority::DEFAULT_DELAY)
                        .await
                        .expect("hop");
                    let listener = net.listen(b_addr).expect("listen");
                    let (mut stream, _) = listener.accept().await.expect("accept");
                    let mut buf = [0u8; 5];
                    stream.read_exact(&mut buf).await.expect("read");
                    world.now()
                })
            };

            world
                .on_process(a, TaskPriority::DEFAULT_DELAY)
                .await
                .expect("hop");
            let mut stream = net.connect(b_addr).await.expect("connect");
            // Clog the b -> a direction only.
            world.clog_pair(
                "10.0.0.2".parse().expect("ip"),
                "10.0.0.1".parse().expect("ip"),
                5.0,
            );
            stream.write_all(b"QUICK").await.expect("write");
            let read_time = server.await.expect("server");
            world.sleep(0.5).await.expect("drain");
            read_time
        })
    };

    assert!(
        read_time < 5.0,
        "reverse clog should not gate a -> b, delivered at {read_time}"
    );
}

#[test]
fn receive_clog_on_destination_delays_delivery() {
    let world = SimWorld::new(0xC108);
    let (a, b) = pair(&world);
    let b_addr = world.process_address(b);

    let read_time = {
        let world = world.clone();
        block_on(&world.clone(), async move {
            let net = world.network_provider();
            let server = {
                let world = world.clone();
                let net = net.clone();
                tokio::task::spawn_local(async move {
                    world
                        .on_process(b, TaskPriority::DEFAULT_DELAY)
                        .await
                        .expect("hop");
                    let listener = net.listen(b_addr).expect("listen");
                    let (mut stream, _) = listener.accept().await.expect("accept");
                    let mut buf = [0u8; 3];
                    stream.read_exact(&mut buf).await.expect("read");
                    world.now()
                })
            };

            world
                .on_process(a, TaskPriority::DEFAULT_DELAY)
                .await
                .expect("hop");
            let mut stream = net.connect(b_addr).await.expect("connect");
            world.clog_interface("10.0.0.2".parse().expect("ip"), 4.0, ClogMode::Receive);
            stream.write_all(b"LAG").await.expect("write");
            let read_time = server.await.expect("server");
            world.sleep(0.5).await.expect("drain");
            read_time
        })
    };

    assert!(read_time >= 4.0, "receive clog ignored, delivered at {read_time}");
}

#[test]
fn clog_durations_extend_not_shorten() {
    let world = SimWorld::new(0xC109);
    let (a, b) = pair(&world);
    let b_addr = world.process_address(b);

    let read_time = {
        let world = world.clone();
        block_on(&world.clone(), async move {
            let net = world.network_provider();
            let server = {
                let world = world.clone();
                let net = net.clone();
                tokio::task::spawn_local(async move {
                    world
                        .on_process(b, TaskPriority::DEFAULT_DELAY)
                        .await
                        .expect("hop");
                    let listener = net.listen(b_addr).expect("listen");
                    let (mut stream, _) = listener.accept().await.expect("accept");
                    let mut buf = [0u8; 1];
                    stream.read_exact(&mut buf).await.expect("read");
                    world.now()
                })
            };

            world
                .on_process(a, TaskPriority::DEFAULT_DELAY)
                .await
                .expect("hop");
            let mut stream = net.connect(b_addr).await.expect("connect");
            let from = "10.0.0.1".parse().expect("ip");
            let to = "10.0.0.2".parse().expect("ip");
            // The longer expiry wins regardless of application order.
            world.clog_pair(from, to, 6.0);
            world.clog_pair(from, to, 1.0);
            stream.write_all(b"X").await.expect("write");
            let read_time = server.await.expect("server");
            world.sleep(0.5).await.expect("drain");
            read_time
        })
    };

    assert!(read_time >= 6.0, "shorter clog overwrote longer, delivered at {read_time}");
}
