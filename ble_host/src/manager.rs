//! Top-level adapter enumeration and lifecycle, spec.md §6 Application
//! surface. Enumerates controllers straight from `/sys/class/bluetooth`
//! rather than going through a running BlueZ daemon, consistent with this
//! stack's raw-HCI-socket design.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use ble_shared::addr::{Address, AddressType};
use ble_shared::listener::ListenerList;

use crate::adapter::{Adapter, AdapterHandle};
use crate::error::HostError;
use crate::listener::ChangedAdapterSetListener;

const SYSFS_BLUETOOTH_CLASS: &str = "/sys/class/bluetooth";

pub struct Manager {
    key_dir: PathBuf,
    adapters: Mutex<HashMap<u16, Arc<Adapter>>>,
    listeners: ListenerList<dyn ChangedAdapterSetListener>,
}

impl Manager {
    pub fn new(key_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self { key_dir, adapters: Mutex::new(HashMap::new()), listeners: ListenerList::new() })
    }

    /// Lists the controller dev ids currently present, by reading the
    /// `hciN` entries `/sys/class/bluetooth` exposes regardless of whether
    /// a BlueZ daemon is bound to them.
    pub fn enumerate_adapters() -> Vec<u16> {
        let Ok(entries) = std::fs::read_dir(SYSFS_BLUETOOTH_CLASS) else {
            return Vec::new();
        };
        let mut dev_ids: Vec<u16> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|name| name.strip_prefix("hci")?.parse::<u16>().ok())
            .collect();
        dev_ids.sort_unstable();
        dev_ids
    }

    pub fn add_changed_adapter_set_listener(&self, listener: Arc<dyn ChangedAdapterSetListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_changed_adapter_set_listener(&self, listener: &Arc<dyn ChangedAdapterSetListener>) {
        self.listeners.remove(listener);
    }

    pub async fn open_adapter(self: &Arc<Self>, dev_id: u16, local_address: (Address, AddressType)) -> Result<(Arc<Adapter>, AdapterHandle), HostError> {
        let (adapter, handle) = Adapter::open(dev_id, local_address, self.key_dir.clone()).await?;
        self.adapters.lock().unwrap().insert(dev_id, adapter.clone());
        for listener in self.listeners.snapshot().iter() {
            listener.adapter_added(dev_id).await;
        }
        Ok((adapter, handle))
    }

    pub fn close_adapter(&self, dev_id: u16) {
        if let Some(adapter) = self.adapters.lock().unwrap().remove(&dev_id) {
            adapter.close();
        }
    }

    pub async fn shutdown(&self) {
        let dev_ids: Vec<u16> = self.adapters.lock().unwrap().keys().copied().collect();
        for dev_id in dev_ids {
            self.close_adapter(dev_id);
            for listener in self.listeners.snapshot().iter() {
                listener.adapter_removed(dev_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_adapters_returns_empty_without_sysfs_bluetooth_class() {
        // This sandbox has no real controllers; the function must degrade
        // to an empty list rather than erroring.
        let dev_ids = Manager::enumerate_adapters();
        assert!(dev_ids.iter().all(|id| *id < 64));
    }
}
