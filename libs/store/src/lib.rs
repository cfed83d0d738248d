//! # store
//!
//! Persistence contract for leases and devices. The DHCP handler only ever
//! sees the [`Store`] trait; backends plug in underneath it. Two are
//! provided: an in-memory map for tests and diskless runs, and an embedded
//! key-value database with write coalescing.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::net::Ipv4Addr;

use async_trait::async_trait;
use pnet::util::MacAddr;
use thiserror::Error;

pub mod kv;
pub mod memory;
pub mod models;

pub use kv::KvStore;
pub use memory::MemoryStore;
pub use models::{Device, Lease};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error")]
    Io(#[from] std::io::Error),
    #[error("lease record truncated: {0} bytes")]
    Truncated(usize),
    #[error("database error: {0}")]
    Database(String),
    #[error("store is closed")]
    Closed,
}

impl From<redb::Error> for StoreError {
    fn from(e: redb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Persistent storage for leases and devices.
///
/// `get_device` always yields a record: a MAC the backend has never seen is
/// an unregistered, un-blacklisted device. Backends may acknowledge
/// `put_lease` before the bytes are durable, but must drain any queued
/// writes in `close`.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get_lease(&self, ip: Ipv4Addr) -> Result<Option<Lease>, StoreError>;
    async fn put_lease(&self, lease: &Lease) -> Result<(), StoreError>;
    async fn for_each_lease(
        &self,
        visit: &mut (dyn FnMut(Lease) + Send),
    ) -> Result<(), StoreError>;

    async fn get_device(&self, mac: MacAddr) -> Result<Device, StoreError>;
    async fn put_device(&self, device: &Device) -> Result<(), StoreError>;
    async fn delete_device(&self, device: &Device) -> Result<(), StoreError>;
    async fn for_each_device(
        &self,
        visit: &mut (dyn FnMut(Device) + Send),
    ) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}
