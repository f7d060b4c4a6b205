// Copyright (c) Contributors to the arcfs project.
// SPDX-License-Identifier: Apache-2.0

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use arcfs::fixtures::*;
use arcfs::{Transport, ROOT_INO};
use fuser::{MountOption, SessionACL};
use nix::mount::MsFlags;
use rstest::rstest;

use super::{
    find_unmount_helper,
    release_then,
    session_acl,
    strategy,
    Interrupter,
    KernelMount,
    Method,
};
use crate::dispatch::Dispatcher;
use crate::filesystem::FilesystemHandle;
use crate::idle::Activity;
use crate::Error;

#[rstest]
fn test_kernel_mount_defaults() {
    let args = KernelMount::new(7, &[], 1000, 100);
    assert_eq!(args.source, "arcfs");
    assert_eq!(args.fstype, "fuse");
    assert_eq!(args.flags, MsFlags::empty());
    assert_eq!(args.data, "fd=7,rootmode=40000,user_id=1000,group_id=100");
}

#[rstest]
fn test_kernel_mount_options() {
    let options = [
        MountOption::RO,
        MountOption::NoDev,
        MountOption::NoSuid,
        MountOption::FSName("/images/base.tar".into()),
        MountOption::Subtype("arcfs".into()),
        MountOption::AllowOther,
        MountOption::AllowRoot,
        MountOption::DefaultPermissions,
        MountOption::CUSTOM("max_read=131072".into()),
        MountOption::Exec,
    ];
    let args = KernelMount::new(3, &options, 0, 0);
    assert_eq!(args.source, "/images/base.tar");
    assert_eq!(args.fstype, "fuse.arcfs");
    assert_eq!(
        args.flags,
        MsFlags::MS_RDONLY | MsFlags::MS_NODEV | MsFlags::MS_NOSUID
    );
    assert_eq!(
        args.data,
        "fd=3,rootmode=40000,user_id=0,group_id=0,allow_other,default_permissions,max_read=131072"
    );
}

#[rstest]
#[case(&[], SessionACL::Owner)]
#[case(&[MountOption::AllowRoot], SessionACL::RootAndOwner)]
#[case(&[MountOption::AllowRoot, MountOption::AllowOther], SessionACL::All)]
fn test_session_acl(#[case] options: &[MountOption], #[case] expected: SessionACL) {
    assert!(std::mem::discriminant(&session_acl(options)) == std::mem::discriminant(&expected));
}

#[rstest]
fn test_find_unmount_helper(tmpdir: tempfile::TempDir) {
    let empty = tmpdir.path().join("empty");
    let tools = tmpdir.path().join("tools");
    std::fs::create_dir_all(&empty).unwrap();
    std::fs::create_dir_all(&tools).unwrap();
    let search = std::env::join_paths([&empty, &tools]).unwrap();
    assert_eq!(find_unmount_helper(&search), None);

    let legacy = tools.join("fusermount");
    std::fs::write(&legacy, "#!/bin/sh\n").unwrap();
    std::fs::set_permissions(&legacy, std::fs::Permissions::from_mode(0o755)).unwrap();
    assert_eq!(find_unmount_helper(&search), Some(legacy));

    let current = empty.join("fusermount3");
    std::fs::write(&current, "#!/bin/sh\n").unwrap();
    assert_eq!(
        find_unmount_helper(&search),
        Some(current),
        "the newer helper is preferred"
    );
}

#[rstest]
#[case(Transport::Session)]
#[case(Transport::Channel)]
fn test_unmounted_strategy(#[case] transport: Transport) {
    let mut strategy = strategy(transport);
    assert!(matches!(strategy.run(), Err(Error::NotMounted)));
    assert!(matches!(strategy.interrupter(), Err(Error::NotMounted)));
    strategy.unmount().expect("unmount without a mount does nothing");
    strategy.unmount().expect("and can be repeated");
}

#[rstest]
fn test_release_precedes_teardown(tmpdir: tempfile::TempDir) {
    let path = sample_image().write_to(tmpdir.path());
    let fs = FilesystemHandle::open(&path, 0).unwrap();
    let dispatcher = Arc::new(Dispatcher::new(fs, Arc::new(Activity::new())));
    dispatcher.opendir(ROOT_INO).unwrap();
    assert_eq!(dispatcher.handles().len(), 1);

    let mut torn_down = false;
    release_then(Some(Arc::clone(&dispatcher)), || {
        assert!(dispatcher.handles().is_empty(), "handles must be released first");
        torn_down = true;
        Ok(())
    })
    .unwrap();
    assert!(torn_down);
}

#[rstest]
fn test_release_reports_teardown_failure() {
    let result = release_then(None, || Err(Error::NotMounted));
    assert!(matches!(result, Err(Error::NotMounted)));
}

#[rstest]
fn test_force_without_a_mount(tmpdir: tempfile::TempDir) {
    let interrupter = Interrupter {
        mountpoint: tmpdir.path().join("missing"),
        method: Method::Detach,
    };
    interrupter
        .force()
        .expect("nothing to detach is not a failure");
}
