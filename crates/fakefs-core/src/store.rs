// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shadow metadata store
//!
//! A thin, prepared-statement-driven wrapper over the mount's SQLite
//! database. Two relations: `paths` maps guest path bytes to inodes
//! (many-to-one for hard links), `stats` holds one shadow record per inode.
//! Every typed operation here assumes it runs inside an active `MetaTx`.
//!
//! The store is authoritative for guest state; an error it cannot classify
//! as benign row-absence means corruption, and the process dies rather than
//! letting guest and host state diverge.

use std::fmt::Display;
use std::path::Path;
use std::process;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{error, trace};

use crate::types::ShadowStat;

const SQL_BEGIN: &str = "begin";
const SQL_COMMIT: &str = "commit";
const SQL_ROLLBACK: &str = "rollback";
const SQL_PATH_GET_INODE: &str = "select inode from paths where path = ?";
const SQL_PATH_READ_STAT: &str =
    "select inode, stat from stats natural join paths where path = ?";
const SQL_PATH_CREATE_STAT: &str = "insert into stats (stat) values (?)";
const SQL_PATH_CREATE_PATH: &str = "insert into paths values (?, last_insert_rowid())";
const SQL_INODE_READ_STAT: &str = "select stat from stats where inode = ?";
const SQL_INODE_WRITE_STAT: &str = "update stats set stat = ? where inode = ?";
const SQL_PATH_LINK: &str = "insert into paths (path, inode) values (?, ?)";
const SQL_PATH_UNLINK: &str = "delete from paths where path = ?";
const SQL_PATH_RENAME: &str = "update or replace paths set path = ? where path = ?";

/// Every statement a mount uses, warmed into the cache at mount time.
const STATEMENTS: &[&str] = &[
    SQL_BEGIN,
    SQL_COMMIT,
    SQL_ROLLBACK,
    SQL_PATH_GET_INODE,
    SQL_PATH_READ_STAT,
    SQL_PATH_CREATE_STAT,
    SQL_PATH_CREATE_PATH,
    SQL_INODE_READ_STAT,
    SQL_INODE_WRITE_STAT,
    SQL_PATH_LINK,
    SQL_PATH_UNLINK,
    SQL_PATH_RENAME,
];

fn die(msg: impl Display) -> ! {
    error!("fatal metadata store error: {msg}");
    process::abort();
}

fn exec(conn: &Connection, sql: &str) {
    let mut stmt = conn.prepare_cached(sql).unwrap_or_else(|err| die(err));
    stmt.execute([]).unwrap_or_else(|err| die(err));
}

/// Guest paths are stored as uninterpreted bytes so the database never
/// normalizes them.
pub(crate) fn path_bytes(path: &Path) -> &[u8] {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes()
}

/// One database handle per mount, serialized by one mutex per mount.
pub(crate) struct MetaStore {
    conn: Mutex<Connection>,
}

impl MetaStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Acquire the mount mutex, then begin a store transaction. Exactly one
    /// balanced begin..commit/rollback envelope per exported operation;
    /// transactions do not nest.
    pub fn begin(&self) -> MetaTx<'_> {
        let conn = self.conn.lock().unwrap();
        trace!(target: "fakefs::sql", "begin");
        exec(&conn, SQL_BEGIN);
        MetaTx { conn, open: true }
    }

    pub fn warm(&self, capacity: usize) {
        let conn = self.conn.lock().unwrap();
        conn.set_prepared_statement_cache_capacity(capacity.max(STATEMENTS.len()));
        for sql in STATEMENTS {
            if let Err(err) = conn.prepare_cached(sql) {
                die(err);
            }
        }
    }
}

/// An open transaction. Holds the mount mutex; `commit`/`rollback` consume
/// it, and dropping an unfinished transaction rolls back so the lock and the
/// store transaction release together on every exit path.
pub(crate) struct MetaTx<'store> {
    conn: MutexGuard<'store, Connection>,
    open: bool,
}

impl MetaTx<'_> {
    pub fn commit(mut self) {
        self.open = false;
        exec(&self.conn, SQL_COMMIT);
        trace!(target: "fakefs::sql", "commit");
    }

    pub fn rollback(mut self) {
        self.open = false;
        exec(&self.conn, SQL_ROLLBACK);
        trace!(target: "fakefs::sql", "rollback");
    }

    /// Inode for a path, 0 when absent.
    pub fn path_get_inode(&self, path: &[u8]) -> i64 {
        let mut stmt = self
            .conn
            .prepare_cached(SQL_PATH_GET_INODE)
            .unwrap_or_else(|err| die(err));
        stmt.query_row(params![path], |row| row.get(0))
            .optional()
            .unwrap_or_else(|err| die(err))
            .unwrap_or(0)
    }

    pub fn path_read_stat(&self, path: &[u8]) -> Option<(i64, ShadowStat)> {
        let mut stmt = self
            .conn
            .prepare_cached(SQL_PATH_READ_STAT)
            .unwrap_or_else(|err| die(err));
        let row = stmt
            .query_row(params![path], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .optional()
            .unwrap_or_else(|err| die(err))?;
        let (inode, blob) = row;
        let stat = ShadowStat::from_bytes(&blob)
            .unwrap_or_else(|| die(format!("malformed stat blob for inode {inode}")));
        Some((inode, stat))
    }

    /// Shadow record for an inode known to exist. A missing row means the
    /// referential invariant is already broken, which is unrecoverable.
    pub fn inode_read_stat(&self, inode: i64) -> ShadowStat {
        let mut stmt = self
            .conn
            .prepare_cached(SQL_INODE_READ_STAT)
            .unwrap_or_else(|err| die(err));
        let blob = stmt
            .query_row(params![inode], |row| row.get::<_, Vec<u8>>(0))
            .unwrap_or_else(|err| die(format!("inode_read_stat({inode}): {err}")));
        ShadowStat::from_bytes(&blob)
            .unwrap_or_else(|| die(format!("malformed stat blob for inode {inode}")))
    }

    pub fn inode_write_stat(&self, inode: i64, stat: &ShadowStat) {
        let blob = stat.to_bytes();
        let mut stmt = self
            .conn
            .prepare_cached(SQL_INODE_WRITE_STAT)
            .unwrap_or_else(|err| die(err));
        stmt.execute(params![&blob[..], inode])
            .unwrap_or_else(|err| die(err));
    }

    /// Insert a stat row, then bind the path to the fresh row id.
    pub fn path_create(&self, path: &[u8], stat: &ShadowStat) {
        let blob = stat.to_bytes();
        let mut stmt = self
            .conn
            .prepare_cached(SQL_PATH_CREATE_STAT)
            .unwrap_or_else(|err| die(err));
        stmt.execute(params![&blob[..]]).unwrap_or_else(|err| die(err));
        let mut stmt = self
            .conn
            .prepare_cached(SQL_PATH_CREATE_PATH)
            .unwrap_or_else(|err| die(err));
        stmt.execute(params![path]).unwrap_or_else(|err| die(err));
    }

    /// Bind `dst` to `src`'s inode. The caller guarantees `src` exists.
    pub fn path_link(&self, src: &[u8], dst: &[u8]) {
        let inode = self.path_get_inode(src);
        if inode == 0 {
            die(format!(
                "link({}, {}): nonexistent source path",
                String::from_utf8_lossy(src),
                String::from_utf8_lossy(dst)
            ));
        }
        let mut stmt = self
            .conn
            .prepare_cached(SQL_PATH_LINK)
            .unwrap_or_else(|err| die(err));
        stmt.execute(params![dst, inode]).unwrap_or_else(|err| die(err));
    }

    /// Remove the path row. The stat row stays; if nothing else references
    /// it the next mount's orphan sweep collects it.
    pub fn path_unlink(&self, path: &[u8]) {
        let mut stmt = self
            .conn
            .prepare_cached(SQL_PATH_UNLINK)
            .unwrap_or_else(|err| die(err));
        stmt.execute(params![path]).unwrap_or_else(|err| die(err));
    }

    /// Move a path binding, displacing any existing row at `dst`.
    pub fn path_rename(&self, src: &[u8], dst: &[u8]) {
        let mut stmt = self
            .conn
            .prepare_cached(SQL_PATH_RENAME)
            .unwrap_or_else(|err| die(err));
        stmt.execute(params![dst, src]).unwrap_or_else(|err| die(err));
    }
}

impl Drop for MetaTx<'_> {
    fn drop(&mut self) {
        if self.open {
            exec(&self.conn, SQL_ROLLBACK);
            trace!(target: "fakefs::sql", "rollback (drop)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::mode;

    fn test_store() -> MetaStore {
        let conn = Connection::open_in_memory().unwrap();
        crate::migrate::migrate(&conn).unwrap();
        MetaStore::new(conn)
    }

    fn stat(uid: u32) -> ShadowStat {
        ShadowStat {
            mode: mode::S_IFREG | 0o644,
            uid,
            gid: 0,
            rdev: 0,
        }
    }

    #[test]
    fn create_then_read_back() {
        let store = test_store();
        let tx = store.begin();
        tx.path_create(b"/a", &stat(7));
        let (inode, read) = tx.path_read_stat(b"/a").unwrap();
        assert!(inode > 0);
        assert_eq!(read, stat(7));
        assert_eq!(tx.path_get_inode(b"/a"), inode);
        assert_eq!(tx.inode_read_stat(inode), stat(7));
        tx.commit();
    }

    #[test]
    fn absent_path_reads_as_zero() {
        let store = test_store();
        let tx = store.begin();
        assert_eq!(tx.path_get_inode(b"/nope"), 0);
        assert!(tx.path_read_stat(b"/nope").is_none());
        tx.commit();
    }

    #[test]
    fn rollback_discards_create() {
        let store = test_store();
        let tx = store.begin();
        tx.path_create(b"/a", &stat(1));
        tx.rollback();
        let tx = store.begin();
        assert_eq!(tx.path_get_inode(b"/a"), 0);
        tx.commit();
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let store = test_store();
        {
            let tx = store.begin();
            tx.path_create(b"/a", &stat(1));
            // dropped without commit
        }
        let tx = store.begin();
        assert_eq!(tx.path_get_inode(b"/a"), 0);
        tx.commit();
    }

    #[test]
    fn link_shares_the_inode() {
        let store = test_store();
        let tx = store.begin();
        tx.path_create(b"/a", &stat(1));
        tx.path_link(b"/a", b"/b");
        let inode = tx.path_get_inode(b"/a");
        assert_ne!(inode, 0);
        assert_eq!(tx.path_get_inode(b"/b"), inode);
        tx.commit();
    }

    #[test]
    fn unlink_keeps_the_stat_row() {
        let store = test_store();
        let tx = store.begin();
        tx.path_create(b"/a", &stat(1));
        let inode = tx.path_get_inode(b"/a");
        tx.path_unlink(b"/a");
        assert_eq!(tx.path_get_inode(b"/a"), 0);
        // orphaned until the next mount sweeps it
        assert_eq!(tx.inode_read_stat(inode), stat(1));
        tx.commit();
    }

    #[test]
    fn rename_displaces_existing_target() {
        let store = test_store();
        let tx = store.begin();
        tx.path_create(b"/a", &stat(1));
        tx.path_create(b"/b", &stat(2));
        let inode_a = tx.path_get_inode(b"/a");
        tx.path_rename(b"/a", b"/b");
        assert_eq!(tx.path_get_inode(b"/a"), 0);
        assert_eq!(tx.path_get_inode(b"/b"), inode_a);
        tx.commit();
    }

    #[test]
    fn inode_write_is_visible_through_every_path() {
        let store = test_store();
        let tx = store.begin();
        tx.path_create(b"/a", &stat(1));
        tx.path_link(b"/a", b"/b");
        let inode = tx.path_get_inode(b"/a");
        tx.inode_write_stat(inode, &stat(42));
        assert_eq!(tx.path_read_stat(b"/b").unwrap().1.uid, 42);
        tx.commit();
    }
}
