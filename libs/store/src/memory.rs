//! In-memory store, for tests and diskless operation.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use parking_lot::Mutex;
use pnet::util::MacAddr;

use crate::models::{Device, Lease};
use crate::{Store, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    leases: HashMap<Ipv4Addr, Lease>,
    devices: HashMap<MacAddr, Device>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_lease(&self, ip: Ipv4Addr) -> Result<Option<Lease>, StoreError> {
        Ok(self.inner.lock().leases.get(&ip).cloned())
    }

    async fn put_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        self.inner.lock().leases.insert(lease.ip, lease.clone());
        Ok(())
    }

    async fn for_each_lease(
        &self,
        visit: &mut (dyn FnMut(Lease) + Send),
    ) -> Result<(), StoreError> {
        for lease in self.inner.lock().leases.values() {
            visit(lease.clone());
        }
        Ok(())
    }

    async fn get_device(&self, mac: MacAddr) -> Result<Device, StoreError> {
        Ok(self
            .inner
            .lock()
            .devices
            .get(&mac)
            .cloned()
            .unwrap_or_else(|| Device::new(mac)))
    }

    async fn put_device(&self, device: &Device) -> Result<(), StoreError> {
        self.inner.lock().devices.insert(device.mac, device.clone());
        Ok(())
    }

    async fn delete_device(&self, device: &Device) -> Result<(), StoreError> {
        self.inner.lock().devices.remove(&device.mac);
        Ok(())
    }

    async fn for_each_device(
        &self,
        visit: &mut (dyn FnMut(Device) + Send),
    ) -> Result<(), StoreError> {
        for device in self.inner.lock().devices.values() {
            visit(device.clone());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
