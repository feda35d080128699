//! Whole-group version translation through the public API.

use cgroupctl::{Context, Group, MountTable, Version};

fn any_context() -> Context {
    Context::with_mounts(MountTable::default())
}

#[test]
fn quota_and_period_fuse_and_split() {
    let ctx = any_context();

    let mut group = Group::new("g").unwrap();
    let cpu = group.add_controller("cpu").unwrap();
    cpu.add_setting("cpu.cfs_quota_us", "50000").unwrap();
    cpu.add_setting("cpu.cfs_period_us", "100000").unwrap();

    let forward = ctx
        .convert_cgroup(&group, Version::V1, Version::V2)
        .unwrap();
    assert!(!forward.unmappable);
    let cpu_max = forward
        .group
        .get_controller("cpu")
        .and_then(|c| c.get_setting("cpu.max"))
        .expect("cpu.max");
    assert_eq!(cpu_max.value, "50000 100000");

    let back = ctx
        .convert_cgroup(&forward.group, Version::V2, Version::V1)
        .unwrap();
    let cpu = back.group.get_controller("cpu").unwrap();
    assert_eq!(cpu.get_setting("cpu.cfs_quota_us").unwrap().value, "50000");
    assert_eq!(cpu.get_setting("cpu.cfs_period_us").unwrap().value, "100000");
}

#[test]
fn unlimited_quota_becomes_max() {
    let ctx = any_context();

    let mut group = Group::new("g").unwrap();
    let cpu = group.add_controller("cpu").unwrap();
    cpu.add_setting("cpu.cfs_quota_us", "-1").unwrap();
    cpu.add_setting("cpu.cfs_period_us", "100000").unwrap();

    let forward = ctx
        .convert_cgroup(&group, Version::V1, Version::V2)
        .unwrap();
    assert_eq!(
        forward
            .group
            .get_controller("cpu")
            .and_then(|c| c.get_setting("cpu.max"))
            .unwrap()
            .value,
        "max 100000"
    );

    let back = ctx
        .convert_cgroup(&forward.group, Version::V2, Version::V1)
        .unwrap();
    let cpu = back.group.get_controller("cpu").unwrap();
    assert_eq!(cpu.get_setting("cpu.cfs_quota_us").unwrap().value, "-1");
}

#[test]
fn shares_and_weight_are_linearly_scaled() {
    let ctx = any_context();

    let mut group = Group::new("g").unwrap();
    group
        .add_controller("cpu")
        .unwrap()
        .add_setting("cpu.shares", "2048")
        .unwrap();

    let forward = ctx
        .convert_cgroup(&group, Version::V1, Version::V2)
        .unwrap();
    assert_eq!(
        forward
            .group
            .get_controller("cpu")
            .and_then(|c| c.get_setting("cpu.weight"))
            .unwrap()
            .value,
        "200"
    );
}

#[test]
fn unmappable_only_controller_is_reported_and_dropped() {
    let ctx = any_context();

    let mut group = Group::new("g").unwrap();
    group
        .add_controller("cpu")
        .unwrap()
        .add_setting("cpu.stat", "usage_usec 0")
        .unwrap();

    let converted = ctx
        .convert_cgroup(&group, Version::V1, Version::V2)
        .unwrap();
    assert!(converted.unmappable);
    assert!(converted.group.get_controller("cpu").is_none());
}

#[test]
fn same_version_conversion_is_identity() {
    let ctx = any_context();

    let mut group = Group::new("g").unwrap();
    group
        .add_controller("memory")
        .unwrap()
        .add_setting("memory.limit_in_bytes", "1048576")
        .unwrap();

    let converted = ctx
        .convert_cgroup(&group, Version::V1, Version::V1)
        .unwrap();
    assert_eq!(
        converted
            .group
            .get_controller("memory")
            .and_then(|c| c.get_setting("memory.limit_in_bytes"))
            .unwrap()
            .value,
        "1048576"
    );
}
