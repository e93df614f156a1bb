//! Integration tests for the consumer side of region rotation.

mod support;

use afd_status::{
    AttachStatus, AttachedRegion, DirConfig, DirectoryStatus, ErrorClass, HostConfig, HostStatus,
    StatusAreaMigrator, StatusError,
};

fn dirs(n: u32) -> Vec<DirConfig> {
    (0..n).map(|i| DirConfig::new(format!("dir{i}"), i)).collect()
}

/// Without a rotation `check` reports `Unchanged` every time.
#[test]
fn test_unchanged_without_rotation() {
    support::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let migrator = StatusAreaMigrator::<DirectoryStatus>::new(dir.path());
    drop(migrator.migrate(&dirs(2)).unwrap());

    let mut attached = AttachedRegion::<DirectoryStatus>::attach(dir.path()).unwrap();
    for _ in 0..100 {
        assert_eq!(attached.check().unwrap(), AttachStatus::Unchanged);
    }
    assert_eq!(attached.area().version_id(), 0);
}

/// One rotation is reported exactly once, with the new capacity.
#[test]
fn test_rotated_exactly_once() {
    support::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let migrator = StatusAreaMigrator::<DirectoryStatus>::new(dir.path());
    drop(migrator.migrate(&dirs(2)).unwrap());

    let mut attached = AttachedRegion::<DirectoryStatus>::attach(dir.path()).unwrap();
    drop(migrator.migrate(&dirs(5)).unwrap());

    assert_eq!(
        attached.check().unwrap(),
        AttachStatus::Rotated {
            version_id: 1,
            capacity: 5
        }
    );
    assert_eq!(attached.check().unwrap(), AttachStatus::Unchanged);
    assert_eq!(attached.area().capacity(), 5);
    assert_eq!(attached.area().find("dir4"), Some(4));
}

/// Several rotations between checks land on the newest version in one step.
#[test]
fn test_multiple_rotations_collapse() {
    support::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let migrator = StatusAreaMigrator::<HostStatus>::new(dir.path());
    drop(migrator.migrate(&[HostConfig::new("a")]).unwrap());

    let mut attached = AttachedRegion::<HostStatus>::attach(dir.path()).unwrap();
    for n in 2..=4 {
        let configs: Vec<HostConfig> = (0..n).map(|i| HostConfig::new(format!("h{i}"))).collect();
        drop(migrator.migrate(&configs).unwrap());
    }

    assert_eq!(
        attached.check().unwrap(),
        AttachStatus::Rotated {
            version_id: 3,
            capacity: 4
        }
    );
    assert_eq!(attached.check().unwrap(), AttachStatus::Unchanged);
}

/// State written through the new attachment is what the migrator carried.
#[test]
fn test_reattached_region_sees_carried_state() {
    support::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let migrator = StatusAreaMigrator::<HostStatus>::new(dir.path());
    drop(migrator.migrate(&[HostConfig::new("a")]).unwrap());

    let mut attached = AttachedRegion::<HostStatus>::attach(dir.path()).unwrap();
    attached.area().update(0, |h| h.jobs_queued = 42).unwrap();

    drop(migrator.migrate(&[HostConfig::new("z"), HostConfig::new("a")]).unwrap());
    attached.check().unwrap();

    let idx = attached.area().find("a").unwrap();
    assert_eq!(idx, 1);
    assert_eq!(attached.area().record(idx).unwrap().jobs_queued, 42);
}

/// A stale region whose successor cannot be mapped is a fatal error.
#[test]
fn test_lost_successor_is_fatal() {
    support::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let migrator = StatusAreaMigrator::<HostStatus>::new(dir.path());
    drop(migrator.migrate(&[HostConfig::new("a")]).unwrap());

    let mut attached = AttachedRegion::<HostStatus>::attach(dir.path()).unwrap();
    let m = migrator.migrate(&[HostConfig::new("a")]).unwrap();
    let current = m.area.path().to_path_buf();
    drop(m);
    std::fs::remove_file(&current).unwrap();

    let err = attached.check().unwrap_err();
    assert_eq!(err.class(), ErrorClass::Fatal);
    assert!(matches!(
        err,
        StatusError::ReattachFailed {
            version_id: Some(1),
            ..
        }
    ));
}

/// Attaching before anything was ever published fails cleanly.
#[test]
fn test_attach_without_id_file() {
    support::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        AttachedRegion::<HostStatus>::attach(dir.path()),
        Err(StatusError::NotFound { .. })
    ));
}
