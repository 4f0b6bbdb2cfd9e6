//! Host-tree reconciliation
//!
//! Runs when the mount detects that the database file's host inode changed,
//! meaning the whole data directory was archived, copied or re-extracted and
//! the shadow metadata may disagree with the host tree in either direction.
//! The walk restores two invariants: every host object has a path row, and
//! every path row has a host object. Stat rows stranded by dropped paths are
//! left for the orphan sweep that follows.

use std::collections::HashSet;
use std::path::PathBuf;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::FsResult;
use crate::hostfs::HostFs;
use crate::store::path_bytes;
use crate::types::ShadowStat;

pub(crate) fn rebuild(conn: &Connection, host: &dyn HostFs) -> FsResult<()> {
    info!("database inode changed; reconciling shadow metadata with host tree");

    // Depth-first walk of the host tree. The root is always present.
    let mut host_objects: Vec<PathBuf> = vec![PathBuf::from("/")];
    let mut stack = vec![PathBuf::from("/")];
    while let Some(dir) = stack.pop() {
        for entry in host.readdir(&dir)? {
            let child = dir.join(&entry.name);
            if entry.is_dir {
                stack.push(child.clone());
            }
            host_objects.push(child);
        }
    }

    let tx = conn.unchecked_transaction()?;
    let mut present: HashSet<Vec<u8>> = HashSet::new();
    let mut adopted = 0usize;
    {
        let mut lookup = tx.prepare("select inode from paths where path = ?")?;
        let mut insert_stat = tx.prepare("insert into stats (stat) values (?)")?;
        let mut insert_path = tx.prepare("insert into paths values (?, last_insert_rowid())")?;
        for path in &host_objects {
            let bytes = path_bytes(path);
            present.insert(bytes.to_vec());
            let known: Option<i64> = lookup
                .query_row(params![bytes], |row| row.get(0))
                .optional()?;
            if known.is_some() {
                continue;
            }
            // No shadow record survives for this object; the best identity
            // available is what the host reports. Stand-ins come back as
            // regular files.
            let host_stat = host.stat(path, false)?;
            let shadow = ShadowStat {
                mode: host_stat.mode,
                uid: host_stat.uid,
                gid: host_stat.gid,
                rdev: 0,
            };
            debug!(path = %path.display(), "adopting host object into shadow metadata");
            insert_stat.execute(params![&shadow.to_bytes()[..]])?;
            insert_path.execute(params![bytes])?;
            adopted += 1;
        }
    }

    let stale: Vec<Vec<u8>> = {
        let mut all_paths = tx.prepare("select path from paths")?;
        let rows = all_paths.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        rows.filter_map(Result::ok)
            .filter(|path| !present.contains(path))
            .collect()
    };
    {
        let mut delete = tx.prepare("delete from paths where path = ?")?;
        for path in &stale {
            debug!(
                path = %String::from_utf8_lossy(path),
                "dropping shadow path with no host object"
            );
            delete.execute(params![path.as_slice()])?;
        }
    }
    tx.commit()?;

    info!(adopted, dropped = stale.len(), "rebuild complete");
    Ok(())
}
