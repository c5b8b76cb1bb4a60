//! The ident registry.
//!
//! Records are partitioned by interface, then keyed by the scalar port-pair
//! key. A single exclusive lock guards the whole partition map; every
//! operation takes it once, performs one map operation and releases it.
//!
//! ```text
//! Registry
//!   └── Mutex<HashMap<interface, HashMap<PortPair::key(), IdentityRecord>>>
//!         ├── "10.0.0.1" ──▶ { 10000200 ─▶ alice/app1, ... }
//!         └── "0.0.0.0"  ──▶ { ... }   (wildcard fallback)
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A poisoned lock is recovered; no operation can leave the map half-updated

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::record::{AppId, IdentityRecord, PortPair, WILDCARD_INTERFACE};

type Partition = HashMap<u64, IdentityRecord>;
type Partitions = HashMap<String, Partition>;

/// Concurrent store of identity records.
///
/// This is a cheap-to-clone handle; all clones share the same map. Build one
/// at startup and hand clones to each listener.
#[derive(Clone, Default)]
pub struct Registry {
    partitions: Arc<Mutex<Partitions>>,
}

impl Registry {
    /// Creates an empty registry. Cannot fail.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Partitions> {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Finds the record for a port pair on an interface.
    ///
    /// The interface's own partition is consulted if it exists at all;
    /// otherwise the wildcard partition is used. A literal partition that
    /// lacks the key does not fall through to the wildcard.
    pub fn lookup(&self, local_port: u16, remote_port: u16, interface: &str) -> Option<IdentityRecord> {
        let key = PortPair::new(local_port, remote_port).key();
        let partitions = self.lock();

        partitions
            .get(interface)
            .or_else(|| partitions.get(WILDCARD_INTERFACE))?
            .get(&key)
            .cloned()
    }

    /// Inserts a record, replacing any existing record with the same
    /// interface and port pair. Returns the stored record.
    pub fn add_entry(
        &self,
        local_port: u16,
        remote_port: u16,
        interface: &str,
        username: &str,
        app_id: &AppId,
    ) -> IdentityRecord {
        let record = IdentityRecord::new(
            PortPair::new(local_port, remote_port),
            interface,
            username,
            app_id.clone(),
        );

        let replaced = self
            .lock()
            .entry(record.interface.clone())
            .or_default()
            .insert(record.key(), record.clone());

        debug!(
            interface = %record.interface,
            local_port,
            remote_port,
            username = %record.username,
            app_id = %record.app_id,
            replaced = replaced.is_some(),
            "Registered identity"
        );

        record
    }

    /// Removes the record stored under `record`'s interface and key.
    ///
    /// An interface partition left empty is dropped. Removing a record that
    /// is not present is a no-op.
    pub fn remove_entry(&self, record: &IdentityRecord) {
        let removed = {
            let mut partitions = self.lock();
            remove_from_partition(&mut partitions, &record.interface, record.key())
        };

        if let Some(stored) = removed {
            debug!(
                interface = %stored.interface,
                ports = %stored.ports,
                app_id = %stored.app_id,
                age_secs = stored.age().num_seconds(),
                "Removed identity"
            );
        }
    }

    /// Looks up a record with wildcard fallback and removes whatever was
    /// found, under a single lock acquisition.
    ///
    /// The owning app ID is not checked. Returns the removed record.
    pub fn remove_matching(
        &self,
        local_port: u16,
        remote_port: u16,
        interface: &str,
    ) -> Option<IdentityRecord> {
        let key = PortPair::new(local_port, remote_port).key();

        let removed = {
            let mut partitions = self.lock();
            let target = if partitions.contains_key(interface) {
                interface
            } else {
                WILDCARD_INTERFACE
            };
            remove_from_partition(&mut partitions, target, key)
        };

        if let Some(ref record) = removed {
            debug!(
                interface = %record.interface,
                ports = %record.ports,
                app_id = %record.app_id,
                age_secs = record.age().num_seconds(),
                "Removed identity"
            );
        }

        removed
    }

    /// Removes every record tagged with `app_id`, across all interfaces.
    ///
    /// Returns the number of records removed. Partitions emptied by the
    /// clear are dropped.
    pub fn clear_app_id(&self, app_id: &AppId) -> usize {
        let removed = {
            let mut partitions = self.lock();
            let mut removed = 0;

            for partition in partitions.values_mut() {
                let before = partition.len();
                partition.retain(|_, record| record.app_id != *app_id);
                removed += before - partition.len();
            }
            partitions.retain(|_, partition| !partition.is_empty());

            removed
        };

        debug!(app_id = %app_id, removed, "Cleared identities for app");
        removed
    }

    /// Total number of records across all interfaces.
    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of interface partitions currently allocated.
    pub fn partition_count(&self) -> usize {
        self.lock().len()
    }

    /// Number of records tagged with `app_id`.
    pub fn records_for_app(&self, app_id: &AppId) -> usize {
        self.lock()
            .values()
            .flat_map(HashMap::values)
            .filter(|record| record.app_id == *app_id)
            .count()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let partitions = self.lock();
        f.debug_struct("Registry")
            .field("partitions", &partitions.len())
            .field("records", &partitions.values().map(HashMap::len).sum::<usize>())
            .finish()
    }
}

fn remove_from_partition(partitions: &mut Partitions, interface: &str, key: u64) -> Option<IdentityRecord> {
    let partition = partitions.get_mut(interface)?;
    let removed = partition.remove(&key);
    if partition.is_empty() {
        partitions.remove(interface);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn app(id: &str) -> AppId {
        AppId::from(id)
    }

    #[test]
    fn test_new_registry_is_empty() {
        let registry = Registry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.partition_count(), 0);
        assert!(registry.lookup(1, 2, "10.0.0.1").is_none());
    }

    #[test]
    fn test_add_then_lookup() {
        let registry = Registry::new();
        let stored = registry.add_entry(100, 200, "10.0.0.1", "alice", &app("app1"));

        let found = registry.lookup(100, 200, "10.0.0.1").expect("record should be found");
        assert_eq!(found.username, "alice");
        assert_eq!(found.app_id, app("app1"));
        assert_eq!(found, stored);
    }

    #[test]
    fn test_lookup_is_order_sensitive() {
        let registry = Registry::new();
        registry.add_entry(100, 200, "10.0.0.1", "alice", &app("app1"));

        assert!(registry.lookup(200, 100, "10.0.0.1").is_none());
    }

    #[test]
    fn test_wildcard_fallback() {
        let registry = Registry::new();
        registry.add_entry(100, 200, WILDCARD_INTERFACE, "bob", &app("app1"));

        let found = registry.lookup(100, 200, "192.168.1.5").expect("wildcard should match");
        assert_eq!(found.username, "bob");

        registry.add_entry(100, 200, "192.168.1.5", "carol", &app("app1"));
        let found = registry.lookup(100, 200, "192.168.1.5").expect("literal should match");
        assert_eq!(found.username, "carol");

        // Other interfaces still fall back to the wildcard
        let found = registry.lookup(100, 200, "192.168.1.6").expect("wildcard should match");
        assert_eq!(found.username, "bob");
    }

    #[test]
    fn test_existing_partition_blocks_wildcard_fallback() {
        let registry = Registry::new();
        registry.add_entry(100, 200, WILDCARD_INTERFACE, "bob", &app("app1"));
        registry.add_entry(300, 400, "192.168.1.5", "carol", &app("app1"));

        assert!(registry.lookup(100, 200, "192.168.1.5").is_none());
    }

    #[test]
    fn test_add_replaces_same_key() {
        let registry = Registry::new();
        registry.add_entry(100, 200, "10.0.0.1", "alice", &app("app1"));
        registry.add_entry(100, 200, "10.0.0.1", "mallory", &app("app2"));

        assert_eq!(registry.len(), 1);
        let found = registry.lookup(100, 200, "10.0.0.1").unwrap();
        assert_eq!(found.username, "mallory");
        assert_eq!(found.app_id, app("app2"));
    }

    #[test]
    fn test_same_ports_on_different_interfaces_coexist() {
        let registry = Registry::new();
        registry.add_entry(100, 200, "10.0.0.1", "alice", &app("app1"));
        registry.add_entry(100, 200, "10.0.0.2", "bob", &app("app1"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.partition_count(), 2);
        assert_eq!(registry.lookup(100, 200, "10.0.0.1").unwrap().username, "alice");
        assert_eq!(registry.lookup(100, 200, "10.0.0.2").unwrap().username, "bob");
    }

    #[test]
    fn test_remove_prunes_empty_partition() {
        let registry = Registry::new();
        let record = registry.add_entry(100, 200, "10.0.0.1", "alice", &app("app1"));
        assert_eq!(registry.partition_count(), 1);

        registry.remove_entry(&record);

        assert!(registry.lookup(100, 200, "10.0.0.1").is_none());
        assert_eq!(registry.partition_count(), 0);
    }

    #[test]
    fn test_remove_keeps_non_empty_partition() {
        let registry = Registry::new();
        let first = registry.add_entry(100, 200, "10.0.0.1", "alice", &app("app1"));
        registry.add_entry(101, 200, "10.0.0.1", "bob", &app("app1"));

        registry.remove_entry(&first);

        assert_eq!(registry.partition_count(), 1);
        assert!(registry.lookup(101, 200, "10.0.0.1").is_some());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = Registry::new();
        let record = registry.add_entry(100, 200, "10.0.0.1", "alice", &app("app1"));
        registry.add_entry(300, 400, WILDCARD_INTERFACE, "bob", &app("app1"));

        registry.remove_entry(&record);
        assert_eq!(registry.len(), 1);

        registry.remove_entry(&record);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(300, 400, "10.0.0.9").unwrap().username, "bob");
    }

    #[test]
    fn test_remove_never_added_is_noop() {
        let registry = Registry::new();
        registry.add_entry(100, 200, "10.0.0.1", "alice", &app("app1"));

        let stranger = IdentityRecord::new(PortPair::new(1, 2), "10.9.9.9", "nobody", AppId::default());
        registry.remove_entry(&stranger);
        let stranger = IdentityRecord::new(PortPair::new(1, 2), "10.0.0.1", "nobody", AppId::default());
        registry.remove_entry(&stranger);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.partition_count(), 1);
    }

    #[test]
    fn test_remove_matching_uses_wildcard_fallback() {
        let registry = Registry::new();
        registry.add_entry(100, 200, WILDCARD_INTERFACE, "bob", &app("app2"));

        let removed = registry.remove_matching(100, 200, "10.0.0.1").expect("wildcard removed");
        assert_eq!(removed.username, "bob");
        assert!(registry.is_empty());
        assert_eq!(registry.partition_count(), 0);
    }

    #[test]
    fn test_removed_record_keeps_registration_time() {
        let registry = Registry::new();
        let first = registry.add_entry(100, 200, "10.0.0.1", "alice", &app("app1"));
        let second = registry.add_entry(100, 200, "10.0.0.1", "alice2", &app("app1"));
        assert!(second.registered_at >= first.registered_at);

        let removed = registry.remove_matching(100, 200, "10.0.0.1").expect("record removed");
        assert_eq!(removed.registered_at, second.registered_at);
        assert_eq!(removed.age_at(second.registered_at), chrono::Duration::zero());
    }

    #[test]
    fn test_remove_matching_miss() {
        let registry = Registry::new();
        registry.add_entry(100, 200, "10.0.0.1", "alice", &app("app1"));

        assert!(registry.remove_matching(100, 201, "10.0.0.1").is_none());
        assert!(registry.remove_matching(100, 200, "10.0.0.2").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_clear_app_id_scoped() {
        let registry = Registry::new();
        registry.add_entry(100, 200, "10.0.0.1", "alice", &app("app1"));
        registry.add_entry(100, 200, "10.0.0.2", "bob", &app("app2"));
        registry.add_entry(101, 200, "10.0.0.1", "carol", &app("app2"));
        registry.add_entry(100, 200, WILDCARD_INTERFACE, "dave", &app("app1"));

        let removed = registry.clear_app_id(&app("app1"));

        assert_eq!(removed, 2);
        assert_eq!(registry.len(), 2);
        assert!(registry.lookup(100, 200, "10.0.0.1").is_none());
        assert_eq!(registry.lookup(100, 200, "10.0.0.2").unwrap().username, "bob");
        assert_eq!(registry.lookup(101, 200, "10.0.0.1").unwrap().username, "carol");
        assert_eq!(registry.records_for_app(&app("app1")), 0);
        assert_eq!(registry.records_for_app(&app("app2")), 2);
    }

    #[test]
    fn test_clear_app_id_prunes_emptied_partitions() {
        let registry = Registry::new();
        registry.add_entry(100, 200, "10.0.0.1", "alice", &app("app1"));
        registry.add_entry(100, 200, "10.0.0.2", "bob", &app("app2"));

        registry.clear_app_id(&app("app1"));

        assert_eq!(registry.partition_count(), 1);
    }

    #[test]
    fn test_clear_unknown_app_is_noop() {
        let registry = Registry::new();
        registry.add_entry(100, 200, "10.0.0.1", "alice", &app("app1"));

        assert_eq!(registry.clear_app_id(&app("nobody")), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_clones_share_state() {
        let registry = Registry::new();
        let other = registry.clone();
        other.add_entry(100, 200, "10.0.0.1", "alice", &app("app1"));

        assert!(registry.lookup(100, 200, "10.0.0.1").is_some());
    }

    #[test]
    fn test_concurrent_disjoint_workers() {
        const WORKERS: u16 = 16;
        const PORTS_PER_WORKER: u16 = 200;

        let registry = Registry::new();
        let handles: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let app_id = AppId::new(format!("app{worker}"));
                    let interface = format!("10.0.0.{}", worker % 4);
                    let username = format!("user{worker}");
                    let base = 1000 + worker * PORTS_PER_WORKER;

                    for local in base..base + PORTS_PER_WORKER {
                        let record = registry.add_entry(local, 6667, &interface, &username, &app_id);
                        let found = registry.lookup(local, 6667, &interface).expect("own record visible");
                        assert_eq!(found.username, username);

                        // Remove every other record
                        if local % 2 == 0 {
                            registry.remove_entry(&record);
                            assert!(registry.lookup(local, 6667, &interface).is_none());
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker panicked");
        }

        assert_eq!(registry.len(), usize::from(WORKERS * PORTS_PER_WORKER / 2));
        for worker in 0..WORKERS {
            let interface = format!("10.0.0.{}", worker % 4);
            let base = 1000 + worker * PORTS_PER_WORKER;
            for local in base..base + PORTS_PER_WORKER {
                let found = registry.lookup(local, 6667, &interface);
                if local % 2 == 0 {
                    assert!(found.is_none());
                } else {
                    let record = found.expect("odd ports survive");
                    assert_eq!(record.username, format!("user{worker}"));
                    assert_eq!(record.app_id, AppId::new(format!("app{worker}")));
                }
            }
        }
    }
}
