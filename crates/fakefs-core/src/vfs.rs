// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Exported filesystem operations
//!
//! Every mutating operation runs one transaction envelope: begin, host call,
//! rollback-and-propagate on host failure, metadata update, commit. Reads
//! use the same envelope so they observe a consistent snapshot. The shadow
//! store, not the host, is authoritative for existence and type: a host
//! object with no shadow row does not exist as far as the guest is
//! concerned.

use std::path::{Path, PathBuf};

use crate::error::{FsError, FsResult};
use crate::hostfs::{HostFile, HostFs};
use crate::store::{path_bytes, MetaStore};
use crate::types::{
    mode, Credentials, FlockOp, OpenOptions, SetAttr, ShadowStat, Stat, StatFs,
};

/// A mounted fakefs.
pub struct FakeFs {
    store: MetaStore,
    host: Box<dyn HostFs>,
}

impl std::fmt::Debug for FakeFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeFs").finish_non_exhaustive()
    }
}

/// Open-file handle: the host file plus the shadow inode captured at open
/// time. Renaming or unlinking the path afterwards does not detach the
/// handle; `fstat`/`fsetattr` keep targeting the captured row.
pub struct FakeFd {
    file: Box<dyn HostFile>,
    fake_inode: i64,
}

impl std::fmt::Debug for FakeFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeFd")
            .field("fake_inode", &self.fake_inode)
            .finish_non_exhaustive()
    }
}

impl FakeFd {
    pub fn fake_inode(&self) -> i64 {
        self.fake_inode
    }

    /// The underlying host file, for data I/O owned by the caller.
    pub fn host(&self) -> &dyn HostFile {
        self.file.as_ref()
    }
}

impl FakeFs {
    /// Mount-kind magic ("fake") for vtable dispatch by the syscall surface.
    pub const MAGIC: u32 = 0x6661_6b65;

    pub(crate) fn assemble(store: MetaStore, host: Box<dyn HostFs>) -> Self {
        Self { store, host }
    }

    pub fn open(
        &self,
        path: &Path,
        opts: &OpenOptions,
        mode_bits: u32,
        cred: &Credentials,
    ) -> FsResult<FakeFd> {
        // Host files are always opened with permissive bits; the
        // guest-visible permissions live entirely in the shadow.
        let file = self.host.open(path, opts, 0o666)?;
        let tx = self.store.begin();
        let mut fake_inode = tx.path_get_inode(path_bytes(path));
        if opts.create && fake_inode == 0 {
            let stat = ShadowStat {
                mode: mode_bits | mode::S_IFREG,
                uid: cred.euid,
                gid: cred.egid,
                rdev: 0,
            };
            tx.path_create(path_bytes(path), &stat);
            fake_inode = tx.path_get_inode(path_bytes(path));
        }
        tx.commit();
        if fake_inode == 0 {
            // the host file exists but the shadow has never heard of it
            return Err(FsError::NotFound);
        }
        Ok(FakeFd { file, fake_inode })
    }

    pub fn link(&self, src: &Path, dst: &Path) -> FsResult<()> {
        let tx = self.store.begin();
        if let Err(err) = self.host.link(src, dst) {
            tx.rollback();
            return Err(err);
        }
        tx.path_link(path_bytes(src), path_bytes(dst));
        tx.commit();
        Ok(())
    }

    pub fn unlink(&self, path: &Path) -> FsResult<()> {
        let tx = self.store.begin();
        if let Err(err) = self.host.unlink(path) {
            tx.rollback();
            return Err(err);
        }
        tx.path_unlink(path_bytes(path));
        tx.commit();
        Ok(())
    }

    pub fn rmdir(&self, path: &Path) -> FsResult<()> {
        let tx = self.store.begin();
        if let Err(err) = self.host.rmdir(path) {
            tx.rollback();
            return Err(err);
        }
        tx.path_unlink(path_bytes(path));
        tx.commit();
        Ok(())
    }

    pub fn rename(&self, src: &Path, dst: &Path) -> FsResult<()> {
        let tx = self.store.begin();
        if let Err(err) = self.host.rename(src, dst) {
            tx.rollback();
            return Err(err);
        }
        tx.path_rename(path_bytes(src), path_bytes(dst));
        tx.commit();
        Ok(())
    }

    pub fn symlink(&self, target: &[u8], link: &Path, cred: &Credentials) -> FsResult<()> {
        let tx = self.store.begin();
        // The host object is a regular file holding the target bytes; hosts
        // that mangle broken symlinks never get to see a real one.
        if let Err(err) = self.host.create_exclusive(link, target) {
            tx.rollback();
            return Err(err);
        }
        let stat = ShadowStat {
            // symlinks always have full permissions
            mode: mode::S_IFLNK | 0o777,
            uid: cred.euid,
            gid: cred.egid,
            rdev: 0,
        };
        tx.path_create(path_bytes(link), &stat);
        tx.commit();
        Ok(())
    }

    pub fn mknod(&self, path: &Path, mode_bits: u32, dev: u32, cred: &Credentials) -> FsResult<()> {
        let mut real_mode = 0o666;
        if mode::is_blk(mode_bits) || mode::is_chr(mode_bits) {
            // the host may refuse device nodes; store a regular stand-in
            real_mode |= mode::S_IFREG;
        } else {
            real_mode |= mode_bits & mode::S_IFMT;
        }
        let tx = self.store.begin();
        if let Err(err) = self.host.mknod(path, real_mode) {
            tx.rollback();
            return Err(err);
        }
        let rdev = if mode::is_blk(mode_bits) || mode::is_chr(mode_bits) {
            dev
        } else {
            0
        };
        let stat = ShadowStat {
            mode: mode_bits,
            uid: cred.euid,
            gid: cred.egid,
            rdev,
        };
        tx.path_create(path_bytes(path), &stat);
        tx.commit();
        Ok(())
    }

    pub fn mkdir(&self, path: &Path, mode_bits: u32, cred: &Credentials) -> FsResult<()> {
        let tx = self.store.begin();
        if let Err(err) = self.host.mkdir(path, 0o777) {
            tx.rollback();
            return Err(err);
        }
        let stat = ShadowStat {
            mode: mode_bits | mode::S_IFDIR,
            uid: cred.euid,
            gid: cred.egid,
            rdev: 0,
        };
        tx.path_create(path_bytes(path), &stat);
        tx.commit();
        Ok(())
    }

    pub fn stat(&self, path: &Path, follow: bool) -> FsResult<Stat> {
        let tx = self.store.begin();
        let Some((inode, shadow)) = tx.path_read_stat(path_bytes(path)) else {
            tx.rollback();
            return Err(FsError::NotFound);
        };
        let host_stat = self.host.stat(path, follow);
        tx.commit();
        let mut st = host_stat?;
        st.inode = inode;
        st.mode = shadow.mode;
        st.uid = shadow.uid;
        st.gid = shadow.gid;
        st.rdev = shadow.rdev;
        Ok(st)
    }

    pub fn fstat(&self, fd: &FakeFd) -> FsResult<Stat> {
        let mut st = fd.file.fstat()?;
        let tx = self.store.begin();
        let shadow = tx.inode_read_stat(fd.fake_inode);
        tx.commit();
        st.inode = fd.fake_inode;
        st.mode = shadow.mode;
        st.uid = shadow.uid;
        st.gid = shadow.gid;
        st.rdev = shadow.rdev;
        Ok(st)
    }

    pub fn setattr(&self, path: &Path, attr: SetAttr) -> FsResult<()> {
        if let SetAttr::Size(size) = attr {
            // size is not shadow metadata
            return self.host.truncate(path, size);
        }
        let tx = self.store.begin();
        let Some((inode, mut shadow)) = tx.path_read_stat(path_bytes(path)) else {
            tx.rollback();
            return Err(FsError::NotFound);
        };
        shadow.apply(&attr);
        tx.inode_write_stat(inode, &shadow);
        tx.commit();
        Ok(())
    }

    pub fn fsetattr(&self, fd: &FakeFd, attr: SetAttr) -> FsResult<()> {
        if let SetAttr::Size(size) = attr {
            return fd.file.truncate(size);
        }
        let tx = self.store.begin();
        let mut shadow = tx.inode_read_stat(fd.fake_inode);
        shadow.apply(&attr);
        tx.inode_write_stat(fd.fake_inode, &shadow);
        tx.commit();
        Ok(())
    }

    pub fn readlink(&self, path: &Path) -> FsResult<Vec<u8>> {
        let tx = self.store.begin();
        let Some((_, shadow)) = tx.path_read_stat(path_bytes(path)) else {
            tx.rollback();
            return Err(FsError::NotFound);
        };
        if !mode::is_lnk(shadow.mode) {
            tx.rollback();
            return Err(FsError::InvalidArgument);
        }
        let result = match self.host.readlink(path) {
            // the target lives in a regular stand-in file
            Err(FsError::InvalidArgument) => self.host.read_contents(path),
            other => other,
        };
        tx.commit();
        result
    }

    // Pass-through delegates: no shadow metadata involved.

    pub fn close(&self, fd: FakeFd) {
        drop(fd);
    }

    pub fn flock(&self, fd: &FakeFd, op: FlockOp) -> FsResult<()> {
        fd.file.flock(op)
    }

    pub fn statfs(&self, path: &Path) -> FsResult<StatFs> {
        self.host.statfs(path)
    }

    pub fn getpath(&self, fd: &FakeFd) -> FsResult<PathBuf> {
        fd.file.getpath()
    }

    pub fn utime(&self, path: &Path, atime: i64, mtime: i64) -> FsResult<()> {
        self.host.utime(path, atime, mtime)
    }
}
