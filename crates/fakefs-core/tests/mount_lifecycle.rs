// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount lifecycle: persistence across remounts, orphan sweeping,
//! relocation detection and host/metadata reconciliation.

use std::fs;
use std::path::{Path, PathBuf};

use fakefs_core::{
    format, makedev, mode, Credentials, FakeFs, MountOptions, OpenOptions, PassthroughFs, SetAttr,
};
use tempfile::TempDir;

const CRED: Credentials = Credentials {
    euid: 1000,
    egid: 1000,
};

fn mount(data: &Path) -> FakeFs {
    let host = PassthroughFs::new(data.to_path_buf());
    FakeFs::mount(&MountOptions::new(data), Box::new(host)).unwrap()
}

fn fresh_tree() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let data = tmp.path().join("data");
    format(&data).unwrap();
    (tmp, data)
}

/// Give `meta.db` a new host inode, as archiving and re-extracting the tree
/// would.
fn relocate_database(data: &Path) {
    let db = data.with_file_name("meta.db");
    let staging = data.with_file_name("meta.db.relocated");
    fs::copy(&db, &staging).unwrap();
    fs::remove_file(&db).unwrap();
    fs::rename(&staging, &db).unwrap();
}

fn stats_rows(data: &Path) -> i64 {
    let conn = rusqlite::Connection::open(data.with_file_name("meta.db")).unwrap();
    conn.query_row("select count(*) from stats", [], |row| row.get(0))
        .unwrap()
}

#[test]
fn shadow_metadata_survives_remount() {
    let (_tmp, data) = fresh_tree();

    let fs_handle = mount(&data);
    fs_handle.mkdir(Path::new("/a"), 0o700, &CRED).unwrap();
    fs_handle
        .mknod(Path::new("/null"), mode::S_IFCHR | 0o666, makedev(1, 3), &CRED)
        .unwrap();
    fs_handle
        .setattr(Path::new("/null"), SetAttr::Uid(42))
        .unwrap();
    fs_handle.umount();

    let fs_handle = mount(&data);
    let dir = fs_handle.stat(Path::new("/a"), true).unwrap();
    assert_eq!(dir.mode, mode::S_IFDIR | 0o700);
    assert_eq!(dir.uid, CRED.euid);

    let dev = fs_handle.stat(Path::new("/null"), true).unwrap();
    assert_eq!(dev.mode, mode::S_IFCHR | 0o666);
    assert_eq!(dev.rdev, makedev(1, 3));
    assert_eq!(dev.uid, 42);
    fs_handle.umount();
}

#[test]
fn orphan_sweep_collects_unreferenced_stats() {
    let (_tmp, data) = fresh_tree();

    let fs_handle = mount(&data);
    let opts = OpenOptions {
        create: true,
        ..OpenOptions::read_write()
    };
    let fd = fs_handle.open(Path::new("/x"), &opts, 0o600, &CRED).unwrap();
    fs_handle.close(fd);
    fs_handle.link(Path::new("/x"), Path::new("/y")).unwrap();
    fs_handle.unlink(Path::new("/x")).unwrap();
    fs_handle.unlink(Path::new("/y")).unwrap();
    fs_handle.umount();

    // root row plus the now-unreferenced stat row
    assert_eq!(stats_rows(&data), 2);

    mount(&data).umount();
    assert_eq!(stats_rows(&data), 1);
}

#[test]
fn relocation_adopts_foreign_host_objects() {
    let (_tmp, data) = fresh_tree();
    mount(&data).umount();

    // a file appears on the host while the filesystem is offline
    fs::write(data.join("stowaway"), b"hello").unwrap();
    relocate_database(&data);

    let fs_handle = mount(&data);
    let st = fs_handle.stat(Path::new("/stowaway"), true).unwrap();
    assert_eq!(st.mode & mode::S_IFMT, mode::S_IFREG);
    assert_eq!(st.size, 5);
    fs_handle.umount();
}

#[test]
fn without_relocation_foreign_objects_stay_invisible() {
    let (_tmp, data) = fresh_tree();
    mount(&data).umount();

    fs::write(data.join("stowaway"), b"hello").unwrap();

    // same database inode: no rebuild, the shadow stays authoritative
    let fs_handle = mount(&data);
    assert!(fs_handle.stat(Path::new("/stowaway"), true).is_err());
    fs_handle.umount();
}

#[test]
fn crash_between_host_and_metadata_reconciles_on_rebuild() {
    let (_tmp, data) = fresh_tree();

    let fs_handle = mount(&data);
    fs_handle
        .mknod(Path::new("/y"), mode::S_IFREG | 0o644, 0, &CRED)
        .unwrap();
    fs_handle.umount();

    // Crash simulation: the host-side rename landed, the metadata update
    // did not.
    fs::rename(data.join("y"), data.join("z")).unwrap();
    relocate_database(&data);

    let fs_handle = mount(&data);
    // exactly one of the two names is observable, and it is complete
    assert!(fs_handle.stat(Path::new("/y"), true).is_err());
    let st = fs_handle.stat(Path::new("/z"), true).unwrap();
    assert_eq!(st.mode & mode::S_IFMT, mode::S_IFREG);
    fs_handle.umount();

    // the root, plus /z; the stat row stranded by /y was swept at mount
    assert_eq!(stats_rows(&data), 2);
}

#[test]
fn rebuild_recurses_into_directories() {
    let (_tmp, data) = fresh_tree();
    let fs_handle = mount(&data);
    fs_handle.mkdir(Path::new("/d"), 0o755, &CRED).unwrap();
    fs_handle.umount();

    fs::write(data.join("d/inner"), b"x").unwrap();
    relocate_database(&data);

    let fs_handle = mount(&data);
    let st = fs_handle.stat(Path::new("/d/inner"), true).unwrap();
    assert_eq!(st.mode & mode::S_IFMT, mode::S_IFREG);
    // the directory kept its shadow identity
    assert_eq!(
        fs_handle.stat(Path::new("/d"), true).unwrap().mode,
        mode::S_IFDIR | 0o755
    );
    fs_handle.umount();
}
