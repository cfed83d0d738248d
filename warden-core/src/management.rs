//! Management operations: device registration lifecycle, lease queries,
//! and pool statistics. Transport-agnostic; the external API exposes
//! these over HTTP.

use std::net::Ipv4Addr;
use std::sync::Arc;

use pnet::util::MacAddr;
use tracing::info;

use config::Config;
use lease_manager::{LeaseManager, PoolStat};
use store::{Device, Lease, Store, StoreError};

pub struct Management {
    cfg: Arc<Config>,
    leases: Arc<LeaseManager>,
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for Management {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Management").finish_non_exhaustive()
    }
}

impl Management {
    pub fn new(cfg: Arc<Config>, leases: Arc<LeaseManager>, store: Arc<dyn Store>) -> Self {
        Management { cfg, leases, store }
    }

    pub async fn device(&self, mac: MacAddr) -> Result<Device, StoreError> {
        self.store.get_device(mac).await
    }

    pub async fn register(&self, mac: MacAddr) -> Result<(), StoreError> {
        let mut device = self.store.get_device(mac).await?;
        if !device.registered {
            device.registered = true;
            self.store.put_device(&device).await?;
            info!(%mac, "registered device");
        }
        Ok(())
    }

    /// Unregistering a blacklisted device keeps the record so the
    /// blacklist flag survives; otherwise the record carries no
    /// information and is deleted.
    pub async fn unregister(&self, mac: MacAddr) -> Result<(), StoreError> {
        let mut device = self.store.get_device(mac).await?;
        if device.registered {
            if device.blacklisted {
                device.registered = false;
                self.store.put_device(&device).await?;
            } else {
                self.store.delete_device(&device).await?;
            }
            info!(%mac, "unregistered device");
        }
        Ok(())
    }

    pub async fn blacklist(&self, mac: MacAddr) -> Result<(), StoreError> {
        let mut device = self.store.get_device(mac).await?;
        if !device.blacklisted {
            device.blacklisted = true;
            self.store.put_device(&device).await?;
            info!(%mac, "blacklisted device");
        }
        Ok(())
    }

    /// Mirror of [`Management::unregister`]: clearing the blacklist on a
    /// registered device keeps the record, otherwise it is deleted.
    pub async fn remove_blacklist(&self, mac: MacAddr) -> Result<(), StoreError> {
        let mut device = self.store.get_device(mac).await?;
        if device.blacklisted {
            if device.registered {
                device.blacklisted = false;
                self.store.put_device(&device).await?;
            } else {
                self.store.delete_device(&device).await?;
            }
            info!(%mac, "removed device from blacklist");
        }
        Ok(())
    }

    pub async fn delete(&self, mac: MacAddr) -> Result<(), StoreError> {
        let device = self.store.get_device(mac).await?;
        self.store.delete_device(&device).await?;
        info!(%mac, "deleted device");
        Ok(())
    }

    /// The persisted lease for an address.
    pub async fn lease(&self, ip: Ipv4Addr) -> Result<Option<Lease>, StoreError> {
        self.store.get_lease(ip).await
    }

    /// Snapshot of the in-memory pool maps for one network.
    pub fn leases_in_network(&self, name: &str) -> Vec<Lease> {
        self.leases.leases_in_network(&name.to_lowercase())
    }

    pub fn network_names(&self) -> Vec<String> {
        self.cfg.network_names()
    }

    pub fn pool_stats(&self) -> Vec<PoolStat> {
        self.leases.pool_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::MemoryStore;

    fn mac() -> MacAddr {
        MacAddr::new(0x12, 0x34, 0x56, 0x12, 0x34, 0x56)
    }

    async fn record_count(store: &MemoryStore) -> usize {
        let mut count = 0;
        store.for_each_device(&mut |_| count += 1).await.unwrap();
        count
    }

    fn management(store: Arc<MemoryStore>) -> Management {
        let cfg = Arc::new(
            Config::parse_str(
                "network \"n\"\n subnet 10.0.0.0/24\n range 10.0.0.10 10.0.0.20\n end\nend\n",
            )
            .unwrap(),
        );
        let leases = Arc::new(LeaseManager::new(cfg.clone()));
        Management::new(cfg, leases, store)
    }

    #[tokio::test]
    async fn unregister_deletes_unless_blacklisted() {
        let store = Arc::new(MemoryStore::new());
        let mgmt = management(store.clone());

        mgmt.register(mac()).await.unwrap();
        assert_eq!(record_count(&store).await, 1);
        mgmt.unregister(mac()).await.unwrap();
        // nothing left worth remembering
        assert_eq!(record_count(&store).await, 0);

        mgmt.register(mac()).await.unwrap();
        mgmt.blacklist(mac()).await.unwrap();
        mgmt.unregister(mac()).await.unwrap();
        // blacklist flag must survive
        assert_eq!(record_count(&store).await, 1);
        let device = mgmt.device(mac()).await.unwrap();
        assert!(device.blacklisted && !device.registered);
    }

    #[tokio::test]
    async fn remove_blacklist_mirrors_unregister() {
        let store = Arc::new(MemoryStore::new());
        let mgmt = management(store.clone());

        mgmt.blacklist(mac()).await.unwrap();
        mgmt.remove_blacklist(mac()).await.unwrap();
        assert_eq!(record_count(&store).await, 0);

        mgmt.register(mac()).await.unwrap();
        mgmt.blacklist(mac()).await.unwrap();
        mgmt.remove_blacklist(mac()).await.unwrap();
        assert_eq!(record_count(&store).await, 1);
        let device = mgmt.device(mac()).await.unwrap();
        assert!(device.registered && !device.blacklisted);
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let store = Arc::new(MemoryStore::new());
        let mgmt = management(store.clone());
        mgmt.register(mac()).await.unwrap();
        mgmt.blacklist(mac()).await.unwrap();
        mgmt.delete(mac()).await.unwrap();
        assert_eq!(record_count(&store).await, 0);
    }

    #[tokio::test]
    async fn network_name_lookup_is_case_insensitive() {
        let store = Arc::new(MemoryStore::new());
        let mgmt = management(store);
        assert_eq!(mgmt.network_names(), vec!["n".to_owned()]);
        assert!(mgmt.leases_in_network("N").is_empty());
        assert_eq!(mgmt.pool_stats().len(), 1);
    }
}
