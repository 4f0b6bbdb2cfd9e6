// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Schema migrations for the metadata database
//!
//! Versioning rides on `pragma user_version`: each entry in `MIGRATIONS`
//! moves the database up one version, inside its own transaction. Running
//! against an up-to-date database is a no-op.

use rusqlite::Connection;
use tracing::debug;

use crate::error::FsResult;

const MIGRATIONS: &[&str] = &[
    // v1: initial schema
    "create table stats (inode integer primary key autoincrement, stat blob not null);
     create table paths (path blob primary key, inode integer not null references stats (inode));
     create table meta (db_inode integer);",
];

pub(crate) fn migrate(conn: &Connection) -> FsResult<()> {
    let version: i64 = conn.query_row("pragma user_version", [], |row| row.get(0))?;
    for (index, sql) in MIGRATIONS.iter().enumerate().skip(version as usize) {
        debug!(version = index + 1, "applying metadata schema migration");
        conn.execute_batch(&format!("begin; {sql} commit;"))?;
        conn.pragma_update(None, "user_version", (index + 1) as i64)?;
    }
    Ok(())
}
