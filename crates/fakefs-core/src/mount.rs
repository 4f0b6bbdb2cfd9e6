// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount lifecycle
//!
//! A fakefs tree on disk is a directory that must be named `data`, holding
//! the host objects, with the metadata database in a sibling file `meta.db`.
//! Mounting validates that layout, opens the database, brings the schema up
//! to date, detects relocation, sweeps orphaned stat rows and warms the
//! statement cache. `format` creates a fresh, empty tree.

use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FsError, FsResult};
use crate::hostfs::HostFs;
use crate::store::MetaStore;
use crate::types::{mode, ShadowStat};
use crate::vfs::FakeFs;
use crate::{migrate, rebuild};

/// Mount configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MountOptions {
    /// The `data` directory holding host objects; `meta.db` lives beside it.
    pub data_dir: PathBuf,
    /// Prepared-statement cache capacity for the metadata store.
    #[serde(default = "default_statement_cache")]
    pub statement_cache: usize,
}

fn default_statement_cache() -> usize {
    32
}

impl MountOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            statement_cache: default_statement_cache(),
        }
    }
}

const SQLITE_MAGIC: &[u8] = b"SQLite format 3";

fn meta_db_path(data_dir: &Path) -> FsResult<PathBuf> {
    if data_dir.file_name() != Some(OsStr::new("data")) {
        return Err(FsError::InvalidArgument);
    }
    Ok(data_dir.with_file_name("meta.db"))
}

/// The database file must already look like a SQLite database before we hand
/// it to the library.
fn check_magic(db_path: &Path) -> FsResult<()> {
    let mut file = fs::File::open(db_path)?;
    let mut buf = [0u8; 16];
    let n = file.read(&mut buf)?;
    if n < SQLITE_MAGIC.len() || &buf[..SQLITE_MAGIC.len()] != SQLITE_MAGIC {
        return Err(FsError::InvalidArgument);
    }
    Ok(())
}

fn enable_wal(conn: &Connection) -> FsResult<()> {
    // the pragma reports the resulting mode as a row
    let journal: String = conn.query_row("pragma journal_mode=wal", [], |row| row.get(0))?;
    debug!(mode = %journal, "journal mode configured");
    Ok(())
}

impl FakeFs {
    /// Mount a fakefs tree. `host` must be rooted at the same `data`
    /// directory named in `options`.
    pub fn mount(options: &MountOptions, mut host: Box<dyn HostFs>) -> FsResult<FakeFs> {
        let db_path = meta_db_path(&options.data_dir)?;
        check_magic(&db_path)?;

        let conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| {
            warn!(path = %db_path.display(), "error opening metadata database: {err}");
            FsError::InvalidArgument
        })?;
        enable_wal(&conn)?;

        // the host root must be usable before migrate/rebuild run
        host.mount()?;

        migrate::migrate(&conn)?;

        // After the tree is archived, transmitted and re-extracted, host
        // inode numbers change. The database remembers the inode of its own
        // file; a mismatch means the tree moved and the shadow metadata must
        // be reconciled against the relocated host tree.
        let db_inode = fs::metadata(&db_path)?.ino() as i64;
        let recorded: Option<i64> = conn
            .query_row("select db_inode from meta", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()?
            .flatten();
        if let Some(recorded) = recorded {
            if recorded != db_inode {
                rebuild::rebuild(&conn, host.as_ref())?;
            }
        }
        conn.execute("update meta set db_inode = ?", params![db_inode])?;

        // Orphan sweep: unlink and rename never delete stat rows, so rows
        // with no referring path accumulate between mounts.
        let swept = conn.execute(
            "delete from stats where not exists (select 1 from paths where inode = stats.inode)",
            [],
        )?;
        if swept > 0 {
            debug!(rows = swept, "swept orphaned stat rows");
        }

        let store = MetaStore::new(conn);
        store.warm(options.statement_cache);
        info!(data_dir = %options.data_dir.display(), "fakefs mounted");
        Ok(FakeFs::assemble(store, host))
    }

    /// Unmount. Closes the metadata database; host-side unmount is a no-op.
    pub fn umount(self) {}
}

/// Create a fresh fakefs tree: the `data/` directory plus an initialized
/// `meta.db` beside it, holding a root directory entry and the relocation
/// marker. Refuses to touch an existing database.
pub fn format(data_dir: &Path) -> FsResult<()> {
    let db_path = meta_db_path(data_dir)?;
    if db_path.exists() {
        return Err(FsError::AlreadyExists);
    }
    fs::create_dir_all(data_dir)?;

    let conn = Connection::open(&db_path)?;
    enable_wal(&conn)?;
    migrate::migrate(&conn)?;

    let root = ShadowStat {
        mode: mode::S_IFDIR | 0o755,
        uid: 0,
        gid: 0,
        rdev: 0,
    };
    conn.execute(
        "insert into stats (stat) values (?)",
        params![&root.to_bytes()[..]],
    )?;
    conn.execute(
        "insert into paths values (?, last_insert_rowid())",
        params![&b"/"[..]],
    )?;

    let db_inode = fs::metadata(&db_path)?.ino() as i64;
    conn.execute("insert into meta (db_inode) values (?)", params![db_inode])?;
    info!(data_dir = %data_dir.display(), "formatted fakefs tree");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostfs::PassthroughFs;
    use tempfile::TempDir;

    #[test]
    fn format_requires_data_basename() {
        let tmp = TempDir::new().unwrap();
        let wrong = tmp.path().join("stuff");
        assert!(matches!(format(&wrong), Err(FsError::InvalidArgument)));
    }

    #[test]
    fn format_refuses_existing_tree() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("data");
        format(&data).unwrap();
        assert!(matches!(format(&data), Err(FsError::AlreadyExists)));
    }

    #[test]
    fn mount_rejects_bad_basename() {
        let tmp = TempDir::new().unwrap();
        let wrong = tmp.path().join("stuff");
        fs::create_dir_all(&wrong).unwrap();
        let host = PassthroughFs::new(wrong.clone());
        let err = FakeFs::mount(&MountOptions::new(wrong), Box::new(host)).unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument));
    }

    #[test]
    fn mount_rejects_non_sqlite_database() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("data");
        fs::create_dir_all(&data).unwrap();
        fs::write(tmp.path().join("meta.db"), b"definitely not a database").unwrap();
        let host = PassthroughFs::new(data.clone());
        let err = FakeFs::mount(&MountOptions::new(data), Box::new(host)).unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument));
    }

    #[test]
    fn mount_requires_the_database_to_exist() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("data");
        fs::create_dir_all(&data).unwrap();
        let host = PassthroughFs::new(data.clone());
        let err = FakeFs::mount(&MountOptions::new(data), Box::new(host)).unwrap_err();
        assert!(matches!(err, FsError::Io(_)));
    }

    #[test]
    fn fresh_tree_mounts_and_has_a_root() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("data");
        format(&data).unwrap();
        let host = PassthroughFs::new(data.clone());
        let fs = FakeFs::mount(&MountOptions::new(data), Box::new(host)).unwrap();
        let st = fs.stat(Path::new("/"), true).unwrap();
        assert_eq!(st.mode, mode::S_IFDIR | 0o755);
        fs.umount();
    }
}
