//! Integration tests for supervisor liveness.

mod support;

use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use afd_status::{HeartbeatConfig, HeartbeatMonitor, HeartbeatRegion, Liveness, SupervisorAction};

fn quick() -> HeartbeatConfig {
    HeartbeatConfig {
        poll_interval: Duration::from_millis(10),
        term_grace: Duration::from_millis(50),
        kill_grace: Duration::from_millis(300),
    }
}

/// A supervisor that keeps beating is active.
#[test]
fn test_beating_counter_is_active() {
    support::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("afd_active");
    let region = Arc::new(HeartbeatRegion::create(&path, 2).unwrap());

    let stop = Arc::new(AtomicBool::new(false));
    let beater = {
        let region = Arc::clone(&region);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                region.beat();
                std::thread::sleep(Duration::from_millis(20));
            }
        })
    };

    let monitor = HeartbeatMonitor::new(&path, quick());
    assert!(monitor.is_active(Duration::from_secs(2)));
    assert_eq!(
        monitor.decide(Duration::from_secs(2)).unwrap(),
        SupervisorAction::AlreadyRunning
    );

    stop.store(true, Ordering::Relaxed);
    beater.join().unwrap();
    assert!(path.exists());
}

/// A frozen counter is inactive, and only after the whole window.
#[test]
fn test_frozen_counter_is_inactive() {
    support::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("afd_active");
    let region = HeartbeatRegion::create(&path, 1).unwrap();
    region.beat();
    region.beat();

    let monitor = HeartbeatMonitor::new(&path, quick());
    let window = Duration::from_millis(250);
    let started = Instant::now();
    assert_eq!(monitor.check(window, false).unwrap(), Liveness::Inactive);
    assert!(started.elapsed() >= window);
    // no cleanup requested
    assert!(path.exists());
}

/// Forced cleanup terminates recorded processes and removes the region.
#[test]
fn test_cleanup_terminates_recorded_processes() {
    support::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("afd_active");
    let region = HeartbeatRegion::create(&path, 2).unwrap();

    let mut child = Command::new("sleep").arg("30").spawn().unwrap();
    region.set_pid(1, child.id() as i32).unwrap();
    // our own pid is never signalled
    region.set_pid(0, std::process::id() as i32).unwrap();
    drop(region);

    let monitor = HeartbeatMonitor::new(&path, quick());
    assert_eq!(
        monitor.check(Duration::from_millis(100), true).unwrap(),
        Liveness::Inactive
    );

    let status = child.wait().unwrap();
    assert_eq!(status.signal(), Some(libc::SIGTERM));
    assert!(!path.exists());
}

/// A process that ignores SIGTERM is killed once the kill grace runs out.
#[test]
fn test_cleanup_escalates_to_sigkill() {
    support::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("afd_active");
    let region = HeartbeatRegion::create(&path, 1).unwrap();

    let mut child = Command::new("sh")
        .arg("-c")
        .arg("trap '' TERM; exec sleep 30")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    // let the shell install its trap
    std::thread::sleep(Duration::from_millis(300));
    region.set_pid(1, child.id() as i32).unwrap();
    drop(region);

    let monitor = HeartbeatMonitor::new(&path, quick());
    assert_eq!(
        monitor.check(Duration::from_millis(50), true).unwrap(),
        Liveness::Inactive
    );

    let status = child.wait().unwrap();
    assert_eq!(status.signal(), Some(libc::SIGKILL));
    assert!(!path.exists());
}

/// A wait far beyond any representable deadline is accepted.
#[test]
fn test_huge_wait_does_not_overflow() {
    support::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("afd_active");
    let region = HeartbeatRegion::create(&path, 0).unwrap();

    let beater = {
        let path = path.clone();
        std::thread::spawn(move || {
            let region = HeartbeatRegion::attach(&path).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            region.beat();
        })
    };

    let monitor = HeartbeatMonitor::new(&path, quick());
    assert!(monitor.is_active(Duration::from_secs(u64::MAX)));
    beater.join().unwrap();
    drop(region);
}

/// A dead supervisor means start a new one; afterwards the region is gone.
#[test]
fn test_decide_start_after_dead_supervisor() {
    support::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("afd_active");
    drop(HeartbeatRegion::create(&path, 0).unwrap());

    let monitor = HeartbeatMonitor::new(&path, quick());
    assert_eq!(
        monitor.decide(Duration::from_millis(50)).unwrap(),
        SupervisorAction::Start
    );
    assert!(!path.exists());
    assert_eq!(
        monitor.check(Duration::from_millis(10), false).unwrap(),
        Liveness::Missing
    );
}
