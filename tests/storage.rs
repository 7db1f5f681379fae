//! Filesystem semantics: atomic-create-and-write, crash behavior, shared
//! handles, deletes, and disk-space accounting.

use stillwater::{
    block_on, KillKind, Locality, OpenFlags, ProcessClass, SimError, SimWorld, TaskPriority,
};

/// One machine with two processes, rooted in a scratch directory.
fn machine_world(seed: u64) -> (SimWorld, stillwater::ProcessId, stillwater::ProcessId, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let world = SimWorld::new(seed);
    let data = dir.path().to_str().expect("utf-8 path").to_string();
    let p1 = world.new_process(
        "p1",
        "10.0.0.1".parse().expect("ip"),
        1,
        Locality::zoned("zone-1"),
        ProcessClass::Storage,
        &data,
        &data,
    );
    let p2 = world.new_process(
        "p2",
        "10.0.0.1".parse().expect("ip"),
        2,
        Locality::zoned("zone-1"),
        ProcessClass::Storage,
        &data,
        &data,
    );
    (world, p1, p2, dir)
}

fn atomic_flags() -> OpenFlags {
    OpenFlags::ATOMIC_WRITE_AND_CREATE | OpenFlags::CREATE | OpenFlags::READWRITE
}

#[test]
fn atomic_rename_appears_only_after_sync() {
    let (world, p1, p2, dir) = machine_world(1);
    let path = dir.path().join("foo").to_str().expect("utf-8").to_string();

    {
        let world = world.clone();
        let path = path.clone();
        block_on(&world.clone(), async move {
            let fs = world.file_system();
            world
                .on_process(p1, TaskPriority::DEFAULT_DELAY)
                .await
                .expect("hop");
            let file = fs.open(&path, atomic_flags(), 0o644).await.expect("open");
            file.write(b"v1", 0).await.expect("write");
            assert_eq!(file.actual_filename().expect("name"), format!("{path}.part"));

            // Before the sync the logical name must not resolve, even from a
            // sibling process on the same machine.
            world
                .on_process(p2, TaskPriority::DEFAULT_DELAY)
                .await
                .expect("hop");
            let missing = fs.open(&path, OpenFlags::READONLY, 0).await;
            assert_eq!(missing.err(), Some(SimError::FileNotFound));

            world
                .on_process(p1, TaskPriority::DEFAULT_DELAY)
                .await
                .expect("hop");
            file.sync().await.expect("sync");
            assert_eq!(file.actual_filename().expect("name"), path);

            // Now the logical name resolves and the .part name is gone.
            let reopened = fs.open(&path, OpenFlags::READONLY, 0).await.expect("reopen");
            let mut buf = [0u8; 2];
            assert_eq!(reopened.read(&mut buf, 0).await.expect("read"), 2);
            assert_eq!(&buf, b"v1");
        });
    }

    assert!(std::path::Path::new(&path).exists());
    assert!(!std::path::Path::new(&format!("{path}.part")).exists());
}

#[test]
fn unsynced_atomic_write_dies_with_the_process() {
    let (world, p1, p2, dir) = machine_world(2);
    let path = dir.path().join("foo").to_str().expect("utf-8").to_string();

    {
        let world = world.clone();
        let path = path.clone();
        block_on(&world.clone(), async move {
            let fs = world.file_system();
            world
                .on_process(p1, TaskPriority::DEFAULT_DELAY)
                .await
                .expect("hop");
            let file = fs.open(&path, atomic_flags(), 0o644).await.expect("open");
            file.write(b"v1", 0).await.expect("write");
            // No sync: the write is not durable.
            world.kill_process(p1, KillKind::KillInstantly);

            // The replacement (a sibling on the same machine) finds nothing.
            world
                .on_process(p2, TaskPriority::DEFAULT_DELAY)
                .await
                .expect("hop");
            let missing = fs.open(&path, OpenFlags::READONLY, 0).await;
            assert_eq!(missing.err(), Some(SimError::FileNotFound));
            let part = fs
                .open(&format!("{path}.part"), OpenFlags::READONLY, 0)
                .await;
            assert_eq!(part.err(), Some(SimError::FileNotFound));
        });
    }

    assert!(!std::path::Path::new(&path).exists());
    assert!(!std::path::Path::new(&format!("{path}.part")).exists());
}

#[test]
fn same_logical_file_shares_one_handle() {
    let (world, p1, p2, dir) = machine_world(3);
    let path = dir.path().join("shared").to_str().expect("utf-8").to_string();

    {
        let world = world.clone();
        block_on(&world.clone(), async move {
            let fs = world.file_system();
            world
                .on_process(p1, TaskPriority::DEFAULT_DELAY)
                .await
                .expect("hop");
            let first = fs
                .open(&path, OpenFlags::CREATE | OpenFlags::READWRITE, 0o644)
                .await
                .expect("open");
            first.write(b"shared-bytes", 0).await.expect("write");

            // A second consumer, even from another process, sees the same
            // underlying file immediately.
            world
                .on_process(p2, TaskPriority::DEFAULT_DELAY)
                .await
                .expect("hop");
            let second = fs
                .open(&path, OpenFlags::CREATE | OpenFlags::READWRITE, 0o644)
                .await
                .expect("open");
            let mut buf = [0u8; 12];
            assert_eq!(second.read(&mut buf, 0).await.expect("read"), 12);
            assert_eq!(&buf, b"shared-bytes");
            assert_eq!(second.size().await.expect("size"), 12);
        });
    }
}

#[test]
fn durable_delete_removes_the_host_file() {
    let (world, p1, _p2, dir) = machine_world(4);
    let path = dir.path().join("doomed").to_str().expect("utf-8").to_string();

    {
        let world = world.clone();
        let path = path.clone();
        block_on(&world.clone(), async move {
            let fs = world.file_system();
            world
                .on_process(p1, TaskPriority::DEFAULT_DELAY)
                .await
                .expect("hop");
            let file = fs
                .open(&path, OpenFlags::CREATE | OpenFlags::READWRITE, 0o644)
                .await
                .expect("open");
            file.write(b"bytes", 0).await.expect("write");
            file.sync().await.expect("sync");
            drop(file);

            fs.delete_file(&path, true).await.expect("delete");
            let missing = fs.open(&path, OpenFlags::READONLY, 0).await;
            assert_eq!(missing.err(), Some(SimError::FileNotFound));
        });
    }

    assert!(!std::path::Path::new(&path).exists());
}

#[test]
fn truncate_and_size_agree() {
    let (world, p1, _p2, dir) = machine_world(5);
    let path = dir.path().join("sized").to_str().expect("utf-8").to_string();

    {
        let world = world.clone();
        block_on(&world.clone(), async move {
            let fs = world.file_system();
            world
                .on_process(p1, TaskPriority::DEFAULT_DELAY)
                .await
                .expect("hop");
            let file = fs
                .open(&path, OpenFlags::CREATE | OpenFlags::READWRITE, 0o644)
                .await
                .expect("open");
            file.write(&[7u8; 100], 0).await.expect("write");
            assert_eq!(file.size().await.expect("size"), 100);
            file.truncate(40).await.expect("truncate");
            assert_eq!(file.size().await.expect("size"), 40);
            file.truncate(0).await.expect("truncate");
            assert_eq!(file.size().await.expect("size"), 0);
        });
    }
}

#[test]
fn open_consumes_virtual_time_on_the_machine() {
    let (world, p1, _p2, dir) = machine_world(6);
    let path = dir.path().join("timed").to_str().expect("utf-8").to_string();

    {
        let world = world.clone();
        block_on(&world.clone(), async move {
            let fs = world.file_system();
            world
                .on_process(p1, TaskPriority::DEFAULT_DELAY)
                .await
                .expect("hop");
            let before = world.now();
            let _file = fs
                .open(&path, OpenFlags::CREATE | OpenFlags::READWRITE, 0o644)
                .await
                .expect("open");
            let elapsed = world.now() - before;
            // The configured open cost is 0.2ms..1.2ms.
            assert!(elapsed >= 0.0002, "open cost skipped: {elapsed}");
        });
    }
}

#[test]
fn disk_space_is_lazily_initialized_within_bounds() {
    let (world, p1, _p2, _dir) = machine_world(7);

    {
        let world = world.clone();
        block_on(&world.clone(), async move {
            let fs = world.file_system();
            world
                .on_process(p1, TaskPriority::DEFAULT_DELAY)
                .await
                .expect("hop");
            let first = fs.disk_bytes().expect("disk bytes");
            assert!(first.total >= 5_000_000_000);
            assert!(first.total <= 105_000_000_000);
            assert!(first.free > 0);
            assert!(first.free <= first.total);

            world.sleep(10.0).await.expect("sleep");
            let second = fs.disk_bytes().expect("disk bytes");
            // Totals are stable; free drifts by at most 5s * 10MB/s even
            // under buggification.
            assert_eq!(second.total, first.total);
            assert!((second.free - first.free).abs() <= 50_000_000);
        });
    }
}
