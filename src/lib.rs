//! Library for periodic incremental filesystem backups streamed to an
//! object store.
//!
//! A capture of a directory tree is produced by an external archiver
//! ([`capture`]), split into fixed-size chunks and uploaded as one or more
//! size-bounded multipart objects ([`transfer`]). The full/incremental
//! cycle is tracked per target in a small on-disk state directory
//! ([`state`]) that only advances after a confirmed-successful transfer.

#![forbid(unsafe_code)]

pub mod capture;
pub mod cli;
pub mod config;
pub mod state;
pub mod store;
pub mod transfer;
