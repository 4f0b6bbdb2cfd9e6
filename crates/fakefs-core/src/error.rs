// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for fakefs

use std::io;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not a directory")]
    NotADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("unsupported")]
    Unsupported,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Store errors surfaced while the mount is still being assembled.
    /// Inside a live mount the store layer aborts instead (see `store`).
    #[error("metadata store error: {0}")]
    Store(#[from] rusqlite::Error),
}

pub type FsResult<T> = Result<T, FsError>;
