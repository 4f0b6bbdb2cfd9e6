// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host-filesystem collaborator seam
//!
//! fakefs never touches the disk directly; everything below the metadata
//! layer goes through `HostFs`/`HostFile`. The production implementation is
//! `PassthroughFs`, rooted at the mount's `data/` directory. Guest-to-host
//! path translation beyond that root join is the syscall surface's job.

use std::ffi::CString;
use std::fs;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{FsError, FsResult};
use crate::types::{mode, FlockOp, HostDirEntry, OpenOptions, Stat, StatFs};

/// Host filesystem operations used by fakefs.
///
/// Implementations store file *data*; all guest-visible metadata lives in the
/// shadow store, so hosts are free to mangle ownership and permission bits.
#[cfg_attr(test, mockall::automock)]
pub trait HostFs: Send + Sync {
    /// Make the root available. Called once during fakefs mount, before any
    /// other operation.
    fn mount(&mut self) -> FsResult<()>;

    fn open(&self, path: &Path, opts: &OpenOptions, mode: u32) -> FsResult<Box<dyn HostFile>>;
    fn link(&self, src: &Path, dst: &Path) -> FsResult<()>;
    fn unlink(&self, path: &Path) -> FsResult<()>;
    fn rmdir(&self, path: &Path) -> FsResult<()>;
    fn rename(&self, src: &Path, dst: &Path) -> FsResult<()>;
    fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()>;

    /// Create a file-system node. fakefs only ever passes regular, FIFO and
    /// socket type bits here; block and character devices have already been
    /// downgraded to regular stand-ins by the caller.
    fn mknod(&self, path: &Path, mode: u32) -> FsResult<()>;

    fn stat(&self, path: &Path, follow: bool) -> FsResult<Stat>;
    fn readlink(&self, path: &Path) -> FsResult<Vec<u8>>;

    /// Exclusively create a regular file holding `contents`. If the write
    /// fails partway the file is removed before the error is returned.
    fn create_exclusive(&self, path: &Path, contents: &[u8]) -> FsResult<()>;

    /// Read a regular file's full contents (symlink stand-ins).
    fn read_contents(&self, path: &Path) -> FsResult<Vec<u8>>;

    fn truncate(&self, path: &Path, size: u64) -> FsResult<()>;
    fn readdir(&self, path: &Path) -> FsResult<Vec<HostDirEntry>>;
    fn statfs(&self, path: &Path) -> FsResult<StatFs>;
    fn utime(&self, path: &Path, atime: i64, mtime: i64) -> FsResult<()>;
}

/// An open host file backing a fakefs file descriptor.
pub trait HostFile: Send {
    fn fstat(&self) -> FsResult<Stat>;
    fn truncate(&self, size: u64) -> FsResult<()>;
    fn flock(&self, op: FlockOp) -> FsResult<()>;
    fn getpath(&self) -> FsResult<PathBuf>;
}

/// `HostFs` over `std::fs`, rooted at a directory.
pub struct PassthroughFs {
    root: PathBuf,
}

impl PassthroughFs {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn host_path(&self, path: &Path) -> PathBuf {
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }
}

fn map_io(err: io::Error) -> FsError {
    match err.kind() {
        io::ErrorKind::NotFound => FsError::NotFound,
        io::ErrorKind::AlreadyExists => FsError::AlreadyExists,
        io::ErrorKind::InvalidInput => FsError::InvalidArgument,
        _ => match err.raw_os_error() {
            Some(libc::ENOTDIR) => FsError::NotADirectory,
            Some(libc::ENOTEMPTY) => FsError::NotEmpty,
            Some(libc::EINVAL) => FsError::InvalidArgument,
            _ => FsError::Io(err),
        },
    }
}

fn cpath(path: &Path) -> FsResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| FsError::InvalidArgument)
}

fn stat_from_metadata(md: &fs::Metadata) -> Stat {
    Stat {
        inode: md.ino() as i64,
        mode: md.mode(),
        nlink: md.nlink() as u32,
        uid: md.uid(),
        gid: md.gid(),
        rdev: md.rdev() as u32,
        size: md.size(),
        blksize: md.blksize() as u32,
        blocks: md.blocks(),
        atime: md.atime(),
        mtime: md.mtime(),
        ctime: md.ctime(),
    }
}

impl HostFs for PassthroughFs {
    fn mount(&mut self) -> FsResult<()> {
        let md = fs::metadata(&self.root).map_err(map_io)?;
        if !md.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(())
    }

    fn open(&self, path: &Path, opts: &OpenOptions, mode: u32) -> FsResult<Box<dyn HostFile>> {
        let host_path = self.host_path(path);
        let mut options = fs::OpenOptions::new();
        options
            .read(opts.read)
            .write(opts.write)
            .append(opts.append)
            .truncate(opts.truncate)
            .mode(mode);
        if opts.create && opts.excl {
            options.create_new(true);
        } else if opts.create {
            options.create(true);
        }
        let file = options.open(&host_path).map_err(map_io)?;
        Ok(Box::new(PassthroughFile {
            file,
            path: host_path,
        }))
    }

    fn link(&self, src: &Path, dst: &Path) -> FsResult<()> {
        fs::hard_link(self.host_path(src), self.host_path(dst)).map_err(map_io)
    }

    fn unlink(&self, path: &Path) -> FsResult<()> {
        fs::remove_file(self.host_path(path)).map_err(map_io)
    }

    fn rmdir(&self, path: &Path) -> FsResult<()> {
        fs::remove_dir(self.host_path(path)).map_err(map_io)
    }

    fn rename(&self, src: &Path, dst: &Path) -> FsResult<()> {
        fs::rename(self.host_path(src), self.host_path(dst)).map_err(map_io)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()> {
        fs::DirBuilder::new()
            .mode(mode)
            .create(self.host_path(path))
            .map_err(map_io)
    }

    fn mknod(&self, path: &Path, mode: u32) -> FsResult<()> {
        let host_path = self.host_path(path);
        if mode::is_reg(mode) || mode & mode::S_IFMT == 0 {
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode & 0o777)
                .open(&host_path)
                .map_err(map_io)?;
            return Ok(());
        }
        // FIFOs and sockets go through the real mknod; the type bit values
        // coincide with the host's on Unix.
        let cstr = cpath(&host_path)?;
        let rc = unsafe { libc::mknod(cstr.as_ptr(), mode as libc::mode_t, 0) };
        if rc != 0 {
            return Err(map_io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn stat(&self, path: &Path, follow: bool) -> FsResult<Stat> {
        let host_path = self.host_path(path);
        let md = if follow {
            fs::metadata(&host_path)
        } else {
            fs::symlink_metadata(&host_path)
        }
        .map_err(map_io)?;
        Ok(stat_from_metadata(&md))
    }

    fn readlink(&self, path: &Path) -> FsResult<Vec<u8>> {
        let target = fs::read_link(self.host_path(path)).map_err(map_io)?;
        Ok(target.as_os_str().as_bytes().to_vec())
    }

    fn create_exclusive(&self, path: &Path, contents: &[u8]) -> FsResult<()> {
        let host_path = self.host_path(path);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o666)
            .open(&host_path)
            .map_err(map_io)?;
        if let Err(err) = file.write_all(contents) {
            drop(file);
            let _ = fs::remove_file(&host_path);
            return Err(map_io(err));
        }
        Ok(())
    }

    fn read_contents(&self, path: &Path) -> FsResult<Vec<u8>> {
        fs::read(self.host_path(path)).map_err(map_io)
    }

    fn truncate(&self, path: &Path, size: u64) -> FsResult<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(self.host_path(path))
            .map_err(map_io)?;
        file.set_len(size).map_err(map_io)
    }

    fn readdir(&self, path: &Path) -> FsResult<Vec<HostDirEntry>> {
        let entries = fs::read_dir(self.host_path(path)).map_err(map_io)?;
        let mut result = Vec::new();
        for entry in entries {
            let entry = entry.map_err(map_io)?;
            let file_type = entry.file_type().map_err(map_io)?;
            result.push(HostDirEntry {
                name: entry.file_name(),
                is_dir: file_type.is_dir(),
            });
        }
        Ok(result)
    }

    fn statfs(&self, path: &Path) -> FsResult<StatFs> {
        let cstr = cpath(&self.host_path(path))?;
        let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(cstr.as_ptr(), &mut vfs) };
        if rc != 0 {
            return Err(map_io(io::Error::last_os_error()));
        }
        Ok(StatFs {
            bsize: vfs.f_bsize as u64,
            frsize: vfs.f_frsize as u64,
            blocks: vfs.f_blocks as u64,
            bfree: vfs.f_bfree as u64,
            bavail: vfs.f_bavail as u64,
            files: vfs.f_files as u64,
            ffree: vfs.f_ffree as u64,
            fsid: vfs.f_fsid as u64,
            flags: vfs.f_flag as u64,
            namemax: vfs.f_namemax as u64,
        })
    }

    fn utime(&self, path: &Path, atime: i64, mtime: i64) -> FsResult<()> {
        let cstr = cpath(&self.host_path(path))?;
        let times = [
            libc::timeval {
                tv_sec: atime as libc::time_t,
                tv_usec: 0,
            },
            libc::timeval {
                tv_sec: mtime as libc::time_t,
                tv_usec: 0,
            },
        ];
        let rc = unsafe { libc::utimes(cstr.as_ptr(), times.as_ptr()) };
        if rc != 0 {
            return Err(map_io(io::Error::last_os_error()));
        }
        Ok(())
    }
}

struct PassthroughFile {
    file: fs::File,
    /// Host path at open time; a later rename leaves this stale, which is
    /// all `getpath` promises.
    path: PathBuf,
}

impl HostFile for PassthroughFile {
    fn fstat(&self) -> FsResult<Stat> {
        let md = self.file.metadata().map_err(map_io)?;
        Ok(stat_from_metadata(&md))
    }

    fn truncate(&self, size: u64) -> FsResult<()> {
        self.file.set_len(size).map_err(map_io)
    }

    fn flock(&self, op: FlockOp) -> FsResult<()> {
        let flag = match op {
            FlockOp::Shared => libc::LOCK_SH,
            FlockOp::Exclusive => libc::LOCK_EX,
            FlockOp::Unlock => libc::LOCK_UN,
        };
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), flag) };
        if rc != 0 {
            return Err(map_io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn getpath(&self) -> FsResult<PathBuf> {
        Ok(self.path.clone())
    }
}
