//! Embedded key-value backend.
//!
//! Leases are keyed by their 4 IP octets, devices by their 6 MAC octets,
//! both with the fixed encodings from [`crate::models`]. Lease writes are
//! queued and flushed in one write transaction every 500 ms; `close`
//! drains the queue before returning. Device writes commit immediately.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pnet::util::MacAddr;
use redb::{Database, ReadableTable, TableDefinition};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::models::{mac_from_octets, mac_octets, Device, Lease};
use crate::{Store, StoreError};

const LEASES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("leases");
const DEVICES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("devices");

const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

pub struct KvStore {
    db: Arc<Database>,
    queue: Arc<Mutex<Vec<([u8; 4], Vec<u8>)>>>,
    shutdown: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("queued", &self.queue.lock().len())
            .finish_non_exhaustive()
    }
}

impl KvStore {
    /// Open (or create) the database at `path` and start the flush task.
    /// Must be called from within a tokio runtime.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref())?;
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(LEASES)?;
            let _ = txn.open_table(DEVICES)?;
        }
        txn.commit()?;

        let db = Arc::new(db);
        let queue: Arc<Mutex<Vec<([u8; 4], Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let flusher = {
            let db = Arc::clone(&db);
            let queue = Arc::clone(&queue);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            flush(&db, &queue);
                            return;
                        }
                        _ = ticker.tick() => flush(&db, &queue),
                    }
                }
            })
        };

        Ok(KvStore {
            db,
            queue,
            shutdown,
            flusher: Mutex::new(Some(flusher)),
        })
    }
}

fn flush(db: &Database, queue: &Mutex<Vec<([u8; 4], Vec<u8>)>>) {
    let batch = std::mem::take(&mut *queue.lock());
    if batch.is_empty() {
        return;
    }
    let write = || -> Result<(), StoreError> {
        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(LEASES)?;
            for (key, value) in &batch {
                table.insert(key.as_slice(), value.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    };
    match write() {
        Ok(()) => debug!(leases = batch.len(), "flushed lease batch"),
        Err(err) => error!(%err, leases = batch.len(), "failed flushing lease batch"),
    }
}

#[async_trait]
impl Store for KvStore {
    async fn get_lease(&self, ip: Ipv4Addr) -> Result<Option<Lease>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LEASES)?;
        let key = ip.octets();
        match table.get(key.as_slice())? {
            Some(guard) => Ok(Some(Lease::deserialize(guard.value())?)),
            None => Ok(None),
        }
    }

    async fn put_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        self.queue.lock().push((lease.ip.octets(), lease.serialize()));
        Ok(())
    }

    async fn for_each_lease(
        &self,
        visit: &mut (dyn FnMut(Lease) + Send),
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LEASES)?;
        for entry in table.iter()? {
            let (_, value) = entry?;
            // skip records that fail to decode rather than aborting startup
            match Lease::deserialize(value.value()) {
                Ok(lease) => visit(lease),
                Err(err) => error!(%err, "skipping bad lease record"),
            }
        }
        Ok(())
    }

    async fn get_device(&self, mac: MacAddr) -> Result<Device, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DEVICES)?;
        let key = mac_octets(mac);
        let state = match table.get(key.as_slice())? {
            Some(guard) => guard.value().first().copied().unwrap_or(0),
            None => 0,
        };
        Ok(Device::from_state_byte(mac, state))
    }

    async fn put_device(&self, device: &Device) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DEVICES)?;
            let key = mac_octets(device.mac);
            table.insert(key.as_slice(), [device.state_byte()].as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn delete_device(&self, device: &Device) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DEVICES)?;
            let key = mac_octets(device.mac);
            table.remove(key.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    async fn for_each_device(
        &self,
        visit: &mut (dyn FnMut(Device) + Send),
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DEVICES)?;
        for entry in table.iter()? {
            let (key, value) = entry?;
            if key.value().len() != 6 {
                error!(len = key.value().len(), "skipping bad device key");
                continue;
            }
            let state = value.value().first().copied().unwrap_or(0);
            visit(Device::from_state_byte(mac_from_octets(key.value()), state));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.shutdown.cancel();
        let handle = self.flusher.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(%err, "flush task panicked during close");
            }
        }
        // the flush task drains on cancel; pick up anything queued after
        flush(&self.db, &self.queue);
        Ok(())
    }
}
