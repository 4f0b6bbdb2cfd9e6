// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! # fakefs: metadata-overlay filesystem core
//!
//! fakefs presents a complete Unix filesystem to a user-mode syscall
//! emulator on hosts whose native filesystem cannot faithfully represent
//! guest semantics: hosts that refuse device nodes, ignore arbitrary
//! ownership, mangle broken symlinks, or renumber inodes whenever the tree
//! is archived and re-extracted.
//!
//! File *data* is delegated to the host filesystem through the [`HostFs`]
//! collaborator; everything the guest sees in `stat` (file type, ownership,
//! permissions, device numbers, inode identity) lives in a shadow SQLite
//! database kept transactionally consistent with the host tree. Every
//! exported operation runs in exactly one transaction: the host mutation
//! first, the metadata mutation only if it succeeded.
//!
//! On disk a mount is a directory named `data/` (host objects, including
//! regular-file stand-ins for devices and symlinks) with the database in a
//! sibling `meta.db`. See [`format`] to create one and [`FakeFs::mount`] to
//! open it.

pub mod error;
pub mod hostfs;
mod migrate;
pub mod mount;
mod rebuild;
mod store;
pub mod types;
pub mod vfs;

pub use error::{FsError, FsResult};
pub use hostfs::{HostFile, HostFs, PassthroughFs};
pub use mount::{format, MountOptions};
pub use types::{
    dev_major, dev_minor, makedev, mode, Credentials, FlockOp, HostDirEntry, OpenOptions, SetAttr,
    ShadowStat, Stat, StatFs,
};
pub use vfs::{FakeFd, FakeFs};
