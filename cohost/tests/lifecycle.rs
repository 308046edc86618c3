mod common;

use cohost::host::{Ipi, PhysMemory};
use cohost::{CpuSelection, ErrorKind, IkcPair, OsStatus, ResourceRequest};
use cohost_shared::layout::{boot_params, kmsg, monitor, progress, KmsgHeader};
use common::*;
use std::time::Duration;
use zerocopy::IntoBytes;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_boot_run_shutdown() {
    let sim = sim();
    let device = open(&sim, options(vec![mem(128, 0), mem(64, 0)], 2)).await;
    let reserved = device.free_chunks();
    assert_eq!(reserved.len(), 1);
    assert_eq!(reserved[0].size, 192 * MIB);
    let os = device.create_instance().unwrap();

    os.allocate_resources(&ResourceRequest {
        cpus: Some(CpuSelection::Count(2)),
        memory: vec![mem(128, 0), mem(64, 0)],
    })
    .unwrap();
    let info = os.info();
    assert_eq!(info.status, OsStatus::Initial);
    assert_eq!(info.cpus.len(), 2);
    assert_eq!(info.memory.len(), 2);
    assert_eq!(info.window.unwrap().size, 192 * MIB);

    os.load_image(&kernel()).unwrap();
    os.set_kernel_args("console=kmsg loglevel=7").unwrap();
    os.boot().await.unwrap();
    assert_eq!(os.status(), OsStatus::Booting);

    // Lowest reserved core is 6 (hw 12); the trampoline sits at 0x8000.
    assert!(sim.ipi_log().contains(&(12, Ipi::Startup { vector: 8 })));
    let bp = os.info().boot_params.unwrap();
    let mut kargs = [0u8; 24];
    sim.read(bp + boot_params::KARGS, &mut kargs).unwrap();
    assert_eq!(&kargs[..23], b"console=kmsg loglevel=7");
    assert_eq!(kargs[23], 0);
    assert_eq!(
        sim.read_u64(bp + boot_params::IDENTITY_ROOT).unwrap(),
        device.identity_root()
    );

    guest_progress(&sim, &os, progress::RUNNING);
    let status = os.wait_for_status(OsStatus::Running, WAIT).await.unwrap();
    assert_eq!(status, OsStatus::Running);

    sim.clear_ipi_log();
    os.shutdown().await.unwrap();
    assert_eq!(os.status(), OsStatus::Initial);
    let resets: Vec<u32> = sim
        .ipi_log()
        .iter()
        .filter(|(_, ipi)| *ipi == Ipi::InitAssert)
        .map(|(hw, _)| *hw)
        .collect();
    assert_eq!(resets, vec![12, 14]);

    let free = device.free_chunks();
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].size, 192 * MIB);
    assert!(device.used_chunks().is_empty());
    assert_eq!(device.unassigned_cpus().len(), 2);
    assert!(os.info().kernel_args.is_empty());

    let metrics = device.metrics();
    assert_eq!(metrics.boots_issued, 1);
    assert_eq!(metrics.shutdowns, 1);
}

#[tokio::test]
async fn test_progress_steps_are_observed_in_order() {
    let sim = sim();
    let device = open(&sim, options(vec![mem(64, 0)], 1)).await;
    let os = device.create_instance().unwrap();
    os.assign_cpus(1).unwrap();
    os.assign_memory(16 * MIB, None).unwrap();
    os.load_image(&kernel()).unwrap();
    os.boot().await.unwrap();

    assert_eq!(os.query_status().unwrap(), OsStatus::Booting);
    guest_progress(&sim, &os, progress::BOOTED);
    assert_eq!(os.query_status().unwrap(), OsStatus::Booted);
    guest_progress(&sim, &os, progress::READY);
    assert_eq!(os.query_status().unwrap(), OsStatus::Ready);
    // A stale lower value never moves the status back.
    guest_progress(&sim, &os, progress::BOOTED);
    assert_eq!(os.query_status().unwrap(), OsStatus::Ready);
}

#[tokio::test]
async fn test_concurrent_boot_one_wins() {
    let sim = sim();
    let device = open(&sim, options(vec![mem(64, 0)], 1)).await;
    let os = device.create_instance().unwrap();
    os.assign_cpus(1).unwrap();
    os.assign_memory(16 * MIB, Some(0)).unwrap();
    os.load_image(&kernel()).unwrap();

    let other = device.instance(os.id()).unwrap();
    let (a, b) = tokio::join!(os.boot(), other.boot());
    let kinds: Vec<_> = [a, b].into_iter().map(|r| r.map_err(|e| e.kind())).collect();
    assert_eq!(kinds.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(kinds.contains(&Err(ErrorKind::Busy)));
    assert_eq!(os.status(), OsStatus::Booting);
    assert_eq!(device.metrics().busy_rejections, 1);
}

#[tokio::test]
async fn test_shutdown_waits_out_wake_sequence() {
    let sim = sim();
    let mut opts = options(vec![mem(64, 0)], 1);
    opts.boot_timings.init_deassert_delay_ms = 300;
    let device = open(&sim, opts).await;
    let os = device.create_instance().unwrap();
    os.assign_cpus(1).unwrap();
    os.assign_memory(16 * MIB, None).unwrap();
    os.load_image(&kernel()).unwrap();

    let other = device.instance(os.id()).unwrap();
    let boot = tokio::spawn(async move { other.boot().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(os.status(), OsStatus::Booting);
    assert_eq!(os.shutdown().await.unwrap_err().kind(), ErrorKind::Busy);
    assert!(os.has_resources());
    assert_eq!(device.metrics().busy_rejections, 1);

    boot.await.unwrap().unwrap();
    assert_eq!(os.status(), OsStatus::Booting);

    // Once the wake is out, shutdown resets the core after the STARTUPs.
    os.shutdown().await.unwrap();
    let log = sim.ipi_log();
    let last_startup = log
        .iter()
        .rposition(|(_, ipi)| matches!(ipi, Ipi::Startup { .. }))
        .unwrap();
    let last_reset = log.iter().rposition(|(_, ipi)| *ipi == Ipi::InitAssert).unwrap();
    assert!(last_reset > last_startup);
    assert!(!os.has_resources());
    assert_eq!(os.status(), OsStatus::Initial);
}

#[tokio::test]
async fn test_wait_ends_when_instance_is_shut_down() {
    let sim = sim();
    let device = open(&sim, options(vec![mem(64, 0)], 1)).await;
    let os = device.create_instance().unwrap();
    os.assign_cpus(1).unwrap();
    os.assign_memory(16 * MIB, None).unwrap();
    os.load_image(&kernel()).unwrap();
    os.boot().await.unwrap();

    let waiter = device.instance(os.id()).unwrap();
    let wait = tokio::spawn(async move {
        waiter
            .wait_for_status(OsStatus::Running, Duration::from_secs(30))
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    os.shutdown().await.unwrap();

    let status = tokio::time::timeout(WAIT, wait).await.unwrap().unwrap().unwrap();
    assert!(!status.has_reached(OsStatus::Running));
    assert!(!status.on_boot_path());
}

#[tokio::test]
async fn test_operations_are_busy_while_booted() {
    let sim = sim();
    let device = open(&sim, options(vec![mem(64, 0)], 2)).await;
    let os = device.create_instance().unwrap();
    os.assign_cpus(1).unwrap();
    os.assign_memory(16 * MIB, None).unwrap();
    os.load_image(&kernel()).unwrap();
    os.boot().await.unwrap();

    assert_eq!(os.set_kernel_args("quiet").unwrap_err().kind(), ErrorKind::Busy);
    assert_eq!(os.assign_cpus(1).unwrap_err().kind(), ErrorKind::Busy);
    assert_eq!(os.release_memory().unwrap_err().kind(), ErrorKind::Busy);
    assert_eq!(os.load_image(&kernel()).unwrap_err().kind(), ErrorKind::Busy);
    assert_eq!(device.destroy_instance(os.id()).unwrap_err().kind(), ErrorKind::Busy);
    assert_eq!(device.teardown().unwrap_err().kind(), ErrorKind::Busy);
    assert_eq!(os.status(), OsStatus::Booting);
}

#[tokio::test]
async fn test_boot_preconditions_restore_initial() {
    let sim = sim();
    let device = open(&sim, options(vec![mem(64, 0)], 1)).await;
    let os = device.create_instance().unwrap();

    assert_eq!(os.boot().await.unwrap_err().kind(), ErrorKind::Validation);
    assert_eq!(os.status(), OsStatus::Initial);

    os.assign_cpus(1).unwrap();
    assert_eq!(os.boot().await.unwrap_err().kind(), ErrorKind::Validation);

    assert_eq!(os.load_image(&kernel()).unwrap_err().kind(), ErrorKind::Validation);
    os.assign_memory(8 * MIB, None).unwrap();
    os.load_image(&kernel()).unwrap();
    os.release_memory().unwrap();
    // The image went with the memory.
    assert_eq!(os.boot().await.unwrap_err().kind(), ErrorKind::Validation);
    assert_eq!(os.status(), OsStatus::Initial);
    assert!(sim.ipi_log().iter().all(|(_, ipi)| !matches!(ipi, Ipi::Startup { .. })));
}

#[tokio::test]
async fn test_rejected_wake_keeps_booting() {
    let sim = sim();
    let device = open(&sim, options(vec![mem(64, 0)], 1)).await;
    let os = device.create_instance().unwrap();
    os.assign_cpus(1).unwrap();
    os.assign_memory(8 * MIB, None).unwrap();
    os.load_image(&kernel()).unwrap();

    // clear, INIT, clear before STARTUP, STARTUP rejected
    for v in [0, 0, 0, 0x40] {
        sim.inject_error_status(v);
    }
    let err = os.boot().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HardwareProtocol);
    assert_eq!(os.status(), OsStatus::Booting);
    assert_eq!(device.metrics().boot_failures, 1);

    os.shutdown().await.unwrap();
    assert_eq!(os.status(), OsStatus::Initial);
}

#[tokio::test]
async fn test_guest_panic_is_terminal() {
    let sim = sim();
    let device = open(&sim, options(vec![mem(64, 0)], 1)).await;
    let os = device.create_instance().unwrap();
    os.assign_cpus(1).unwrap();
    os.assign_memory(8 * MIB, None).unwrap();
    os.load_image(&kernel()).unwrap();
    os.boot().await.unwrap();

    guest_progress(&sim, &os, progress::READY);
    guest_write(&sim, &os, boot_params::MONITOR_STATUS, monitor::PANIC);
    let status = os.wait_for_status(OsStatus::Running, WAIT).await.unwrap();
    assert_eq!(status, OsStatus::Failed);

    // Further progress is ignored once failed.
    guest_write(&sim, &os, boot_params::MONITOR_STATUS, monitor::OK);
    guest_progress(&sim, &os, progress::RUNNING);
    assert_eq!(os.query_status().unwrap(), OsStatus::Failed);

    os.shutdown().await.unwrap();
    assert_eq!(device.free_chunks().len(), 1);
}

#[tokio::test]
async fn test_stalled_heartbeat_is_hungup() {
    let sim = sim();
    let mut opts = options(vec![mem(64, 0)], 1);
    opts.liveness_timeout_ms = Some(20);
    let device = open(&sim, opts).await;
    let os = device.create_instance().unwrap();
    os.assign_cpus(1).unwrap();
    os.assign_memory(8 * MIB, None).unwrap();
    os.load_image(&kernel()).unwrap();
    os.boot().await.unwrap();

    guest_progress(&sim, &os, progress::RUNNING);
    assert_eq!(os.query_status().unwrap(), OsStatus::Running);
    guest_write(&sim, &os, boot_params::HEARTBEAT, 1);
    assert_eq!(os.query_status().unwrap(), OsStatus::Running);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(os.query_status().unwrap(), OsStatus::Hungup);
    os.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wait_times_out() {
    let sim = sim();
    let device = open(&sim, options(vec![mem(64, 0)], 1)).await;
    let os = device.create_instance().unwrap();
    os.assign_cpus(1).unwrap();
    os.assign_memory(8 * MIB, None).unwrap();
    os.load_image(&kernel()).unwrap();
    os.boot().await.unwrap();

    let err = os
        .wait_for_status(OsStatus::Running, Duration::from_millis(20))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(os.status(), OsStatus::Booting);
}

#[tokio::test]
async fn test_failed_allocation_rolls_back() {
    let sim = sim();
    let device = open(&sim, options(vec![mem(32, 0)], 2)).await;
    let os = device.create_instance().unwrap();

    let err = os
        .allocate_resources(&ResourceRequest {
            cpus: Some(CpuSelection::Count(2)),
            memory: vec![mem(16, 0), mem(64, 0)],
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert_eq!(os.status(), OsStatus::Initial);
    assert!(!os.has_resources());
    assert_eq!(device.free_chunks().len(), 1);
    assert_eq!(device.unassigned_cpus().len(), 2);
    assert_eq!(device.metrics().allocation_failures, 1);
}

#[tokio::test]
async fn test_kernel_args_are_bounded() {
    let sim = sim();
    let device = open(&sim, options(vec![mem(32, 0)], 1)).await;
    let os = device.create_instance().unwrap();

    let long = "x".repeat(boot_params::KARGS_SIZE);
    assert_eq!(os.set_kernel_args(&long).unwrap_err().kind(), ErrorKind::Validation);
    assert_eq!(os.set_kernel_args("a\0b").unwrap_err().kind(), ErrorKind::Validation);
    os.set_kernel_args("console=kmsg").unwrap();
    assert_eq!(os.info().kernel_args, "console=kmsg");
}

#[tokio::test]
async fn test_ikc_map_validation() {
    let sim = sim();
    let device = open(&sim, options(vec![mem(32, 0)], 2)).await;
    let os = device.create_instance().unwrap();
    let cpus = os.assign_cpus(1).unwrap();
    let guest = cpus[0].logical_id;

    let reserved_host = device
        .reserved_cpus()
        .into_iter()
        .find(|c| c.logical_id != guest)
        .unwrap()
        .logical_id;
    let err = os
        .set_ikc_map(&[IkcPair { guest_cpu: guest, host_cpu: reserved_host }])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = os
        .set_ikc_map(&[IkcPair { guest_cpu: reserved_host, host_cpu: 1 }])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let pair = IkcPair { guest_cpu: guest, host_cpu: 1 };
    os.set_ikc_map(&[pair]).unwrap();
    assert_eq!(os.info().ikc_map, vec![pair]);

    os.release_cpus().unwrap();
    assert!(os.info().ikc_map.is_empty());
}

#[tokio::test]
async fn test_kmsg_after_guest_publishes_ring() {
    let sim = sim();
    let device = open(&sim, options(vec![mem(64, 0)], 1)).await;
    let os = device.create_instance().unwrap();
    os.assign_cpus(1).unwrap();
    let chunk = os.assign_memory(8 * MIB, None).unwrap();
    os.load_image(&kernel()).unwrap();
    assert_eq!(os.kmsg(false).unwrap_err().kind(), ErrorKind::Validation);

    os.boot().await.unwrap();
    assert_eq!(os.kmsg(false).unwrap_err().kind(), ErrorKind::Validation);

    let ring = chunk.start + 0x20_0000;
    let header = KmsgHeader { head: 0, tail: 6, len: 64, lock: 0 };
    sim.write(ring, header.as_bytes()).unwrap();
    sim.write(ring + kmsg::DATA, b"booted").unwrap();
    guest_write(&sim, &os, boot_params::MSG_BUFFER, ring);

    assert_eq!(os.kmsg(true).unwrap(), "booted");
    assert_eq!(os.kmsg(false).unwrap(), "");
}
