//! Per-device key state
//!
//! Maps DevEUI to the device's last validated public key and the
//! symmetric codec derived from it. The dispatcher is the only writer;
//! the decrypt path reads. Entries are shared as `Arc`s so replacement
//! is a single pointer swap — an in-flight decrypt keeps using the old
//! entry and can never observe a half-built one.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::info;

use crate::crypto::{SensorCrypto, PUBLIC_KEY_LEN};

/// Everything known about one device's key exchange.
#[derive(Debug)]
pub struct DeviceEntry {
    /// The device's uncompressed P-256 public key.
    pub public_key: [u8; PUBLIC_KEY_LEN],
    /// When the key was last validated and installed.
    pub updated_at: DateTime<Utc>,
    /// Codec built from the ECDH secret for this device.
    pub crypto: SensorCrypto,
}

/// Concurrent DevEUI → key state map.
#[derive(Debug, Default)]
pub struct DeviceKeyStore {
    entries: RwLock<HashMap<String, Arc<DeviceEntry>>>,
}

impl DeviceKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the entry for a device atomically.
    pub async fn insert(&self, dev_eui: &str, public_key: [u8; PUBLIC_KEY_LEN], crypto: SensorCrypto) {
        let entry = Arc::new(DeviceEntry {
            public_key,
            updated_at: Utc::now(),
            crypto,
        });
        let replaced = self
            .entries
            .write()
            .await
            .insert(dev_eui.to_string(), entry)
            .is_some();
        info!(dev_eui, replaced, "installed device key");
    }

    /// Fetch the current entry. The returned `Arc` stays valid even if
    /// the entry is replaced while the caller is still decrypting.
    pub async fn get(&self, dev_eui: &str) -> Option<Arc<DeviceEntry>> {
        self.entries.read().await.get(dev_eui).cloned()
    }

    /// Whether a key exchange has completed for this device.
    pub async fn has_key(&self, dev_eui: &str) -> bool {
        self.entries.read().await.contains_key(dev_eui)
    }

    /// All DevEUIs with an established key, for broadcast bookkeeping.
    pub async fn device_ids(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto(seed: u8) -> SensorCrypto {
        SensorCrypto::new(&[seed; 32])
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let store = DeviceKeyStore::new();
        assert!(!store.has_key("aabbccddeeff0011").await);

        store.insert("aabbccddeeff0011", [4u8; 65], crypto(1)).await;
        assert!(store.has_key("aabbccddeeff0011").await);
        assert_eq!(store.len().await, 1);

        let entry = store.get("aabbccddeeff0011").await.unwrap();
        assert_eq!(entry.public_key, [4u8; 65]);
    }

    #[tokio::test]
    async fn test_replace_does_not_invalidate_held_entry() {
        let store = DeviceKeyStore::new();
        store.insert("dev", [1u8; 65], crypto(1)).await;

        let held = store.get("dev").await.unwrap();
        store.insert("dev", [2u8; 65], crypto(2)).await;

        // The old Arc is still usable; new lookups see the new key.
        assert_eq!(held.public_key, [1u8; 65]);
        assert_eq!(store.get("dev").await.unwrap().public_key, [2u8; 65]);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_device_ids() {
        let store = DeviceKeyStore::new();
        store.insert("dev-a", [1u8; 65], crypto(1)).await;
        store.insert("dev-b", [1u8; 65], crypto(1)).await;

        let mut ids = store.device_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["dev-a".to_string(), "dev-b".to_string()]);
    }
}
