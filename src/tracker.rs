//! The top-level address book: named subnets, overlap checks, and the
//! crash-tolerant snapshot the whole repository is rewritten into after
//! every mutation.
//!
//! Lock order is repository mutex first, then a subnet's lock; the snapshot
//! write completes before the repository mutex is released, so on-disk state
//! always reflects a single consistent moment.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{Error, Result};
use crate::subnet::{ApiSubnet, Binding, Subnet};

const DATABASE_FILE: &str = "database.json";

/// On-disk snapshot document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Database {
    #[serde(rename = "Subnets")]
    subnets: HashMap<String, ApiSubnet>,
}

pub struct DataTracker {
    data_dir: PathBuf,
    subnets: Mutex<HashMap<String, Arc<Subnet>>>,
}

impl DataTracker {
    /// Creates an empty snapshot so a fresh deployment can start. Leaves an
    /// existing database alone.
    pub async fn init(data_dir: impl AsRef<Path>) -> Result<()> {
        let data_dir = data_dir.as_ref();
        tokio::fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(DATABASE_FILE);
        if path.exists() {
            return Ok(());
        }
        let content = serde_json::to_string_pretty(&Database::default())?;
        write_atomic(data_dir, &content).await
    }

    /// Loads the full repository from the snapshot. A missing or corrupt
    /// database is an error; callers treat it as fatal at startup.
    pub async fn load(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        let path = data_dir.join(DATABASE_FILE);
        let content = tokio::fs::read_to_string(&path).await?;
        let db: Database = serde_json::from_str(&content)?;

        let mut subnets = HashMap::new();
        for (_, api) in db.subnets {
            let subnet = Subnet::from_api(api)?;
            subnets.insert(subnet.name().to_string(), Arc::new(subnet));
        }

        info!(subnets = subnets.len(), path = %path.display(), "Loaded address book");

        Ok(Self {
            data_dir,
            subnets: Mutex::new(subnets),
        })
    }

    async fn save_locked(&self, subnets: &HashMap<String, Arc<Subnet>>) -> Result<()> {
        let mut db = Database::default();
        for (name, subnet) in subnets {
            db.subnets.insert(name.clone(), subnet.to_api().await);
        }
        let content = serde_json::to_string_pretty(&db)?;
        write_atomic(&self.data_dir, &content).await
    }

    /// Rewrites the snapshot from current state.
    pub async fn save(&self) -> Result<()> {
        let subnets = self.subnets.lock().await;
        self.save_locked(&subnets).await
    }

    pub async fn get_subnet(&self, name: &str) -> Option<Arc<Subnet>> {
        self.subnets.lock().await.get(name).cloned()
    }

    /// All subnets in wire shape, sorted by name.
    pub async fn list_subnets(&self) -> Vec<ApiSubnet> {
        let subnets = self.subnets.lock().await;
        let mut list = Vec::with_capacity(subnets.len());
        for subnet in subnets.values() {
            list.push(subnet.to_api().await);
        }
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// First subnet whose CIDR contains the address. Overlap rejection at
    /// create time makes the match unique.
    pub async fn find_subnet(&self, ip: Ipv4Addr) -> Option<Arc<Subnet>> {
        let subnets = self.subnets.lock().await;
        subnets.values().find(|subnet| subnet.contains(ip)).cloned()
    }

    /// First subnet holding a binding for the MAC; diagnostic routing only.
    pub async fn find_bound_ip(&self, mac: &str) -> Option<Arc<Subnet>> {
        let mac = mac.to_lowercase();
        let subnets = self.subnets.lock().await;
        for subnet in subnets.values() {
            if subnet.has_binding_for(&mac).await {
                return Some(Arc::clone(subnet));
            }
        }
        None
    }

    pub async fn add_subnet(&self, api: ApiSubnet) -> Result<()> {
        let subnet = Subnet::from_api(api)?;
        let mut subnets = self.subnets.lock().await;

        if subnets.contains_key(subnet.name()) {
            return Err(Error::SubnetExists(subnet.name().to_string()));
        }
        if overlaps(&subnets, subnet.cidr()) {
            return Err(Error::SubnetOverlap(subnet.name().to_string()));
        }

        subnets.insert(subnet.name().to_string(), Arc::new(subnet));
        self.save_locked(&subnets).await
    }

    pub async fn remove_subnet(&self, name: &str) -> Result<()> {
        let mut subnets = self.subnets.lock().await;
        if subnets.remove(name).is_none() {
            return Err(Error::NotFound(format!("subnet {name}")));
        }
        self.save_locked(&subnets).await
    }

    /// Replaces a subnet's definition while carrying its leases, bindings,
    /// and held-address bits forward unchanged. On overlap the original is
    /// restored untouched.
    pub async fn replace_subnet(&self, name: &str, api: ApiSubnet) -> Result<()> {
        let replacement = Subnet::from_api(api)?;
        let mut subnets = self.subnets.lock().await;

        let Some(old) = subnets.remove(name) else {
            return Err(Error::NotFound(format!("subnet {name}")));
        };

        if overlaps(&subnets, replacement.cidr()) {
            subnets.insert(old.name().to_string(), old);
            return Err(Error::SubnetOverlap(replacement.name().to_string()));
        }

        replacement.carry_state_from(&old).await;
        subnets.insert(replacement.name().to_string(), Arc::new(replacement));
        self.save_locked(&subnets).await
    }

    pub async fn add_binding(&self, name: &str, binding: Binding) -> Result<()> {
        let subnets = self.subnets.lock().await;
        let subnet = subnets
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("subnet {name}")))?;
        subnet.set_binding(binding).await?;
        self.save_locked(&subnets).await
    }

    pub async fn delete_binding(&self, name: &str, mac: &str) -> Result<()> {
        let subnets = self.subnets.lock().await;
        let subnet = subnets
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("subnet {name}")))?;
        subnet.remove_binding(mac).await?;
        self.save_locked(&subnets).await
    }

    /// Updates the boot server of every binding at `ip`; the snapshot is
    /// only rewritten when something changed.
    pub async fn set_next_server(
        &self,
        name: &str,
        ip: Ipv4Addr,
        next_server: Ipv4Addr,
    ) -> Result<()> {
        let subnets = self.subnets.lock().await;
        let subnet = subnets
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("subnet {name}")))?;
        if subnet.update_next_server(ip, next_server).await {
            self.save_locked(&subnets).await?;
        }
        Ok(())
    }
}

fn overlaps(subnets: &HashMap<String, Arc<Subnet>>, cidr: Ipv4Network) -> bool {
    subnets.values().any(|existing| {
        existing.cidr().contains(cidr.network()) || cidr.contains(existing.cidr().network())
    })
}

async fn write_atomic(data_dir: &Path, content: &str) -> Result<()> {
    let tmp = data_dir.join(format!("{DATABASE_FILE}.tmp"));
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, data_dir.join(DATABASE_FILE)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subnet::tests::api_subnet;

    async fn empty_tracker() -> (DataTracker, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        DataTracker::init(dir.path()).await.unwrap();
        let tracker = DataTracker::load(dir.path()).await.unwrap();
        (tracker, dir)
    }

    fn binding(mac: &str, ip: Ipv4Addr) -> Binding {
        Binding {
            ip,
            mac: mac.to_string(),
            options: vec![],
            next_server: None,
        }
    }

    #[tokio::test]
    async fn test_load_missing_database_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DataTracker::load(dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_load_corrupt_database_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DATABASE_FILE), "{not json").unwrap();
        assert!(DataTracker::load(dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        DataTracker::init(dir.path()).await.unwrap();
        let tracker = DataTracker::load(dir.path()).await.unwrap();
        tracker.add_subnet(api_subnet("one")).await.unwrap();
        drop(tracker);

        DataTracker::init(dir.path()).await.unwrap();
        let tracker = DataTracker::load(dir.path()).await.unwrap();
        assert!(tracker.get_subnet("one").await.is_some());
    }

    #[tokio::test]
    async fn test_add_subnet_name_conflict() {
        let (tracker, _dir) = empty_tracker().await;
        tracker.add_subnet(api_subnet("one")).await.unwrap();

        let mut other = api_subnet("one");
        other.subnet = "172.16.0.0/24".parse().unwrap();
        other.active_start = Ipv4Addr::new(172, 16, 0, 10);
        other.active_end = Ipv4Addr::new(172, 16, 0, 20);
        let error = tracker.add_subnet(other).await.unwrap_err();
        assert!(matches!(error, Error::SubnetExists(_)));
        assert_eq!(error.status(), 409);
    }

    #[tokio::test]
    async fn test_add_subnet_overlap_rejected() {
        let (tracker, _dir) = empty_tracker().await;
        tracker.add_subnet(api_subnet("one")).await.unwrap();

        let mut inner = api_subnet("two");
        inner.subnet = "10.0.0.128/25".parse().unwrap();
        inner.active_start = Ipv4Addr::new(10, 0, 0, 200);
        inner.active_end = Ipv4Addr::new(10, 0, 0, 210);
        let error = tracker.add_subnet(inner).await.unwrap_err();
        assert!(matches!(error, Error::SubnetOverlap(_)));
        assert_eq!(error.status(), 400);

        // Repository unchanged.
        assert_eq!(tracker.list_subnets().await.len(), 1);
        assert!(tracker.get_subnet("two").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_subnet() {
        let (tracker, _dir) = empty_tracker().await;
        tracker.add_subnet(api_subnet("one")).await.unwrap();
        tracker.remove_subnet("one").await.unwrap();
        assert!(matches!(
            tracker.remove_subnet("one").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_replace_subnet_preserves_state() {
        let (tracker, _dir) = empty_tracker().await;
        tracker.add_subnet(api_subnet("one")).await.unwrap();
        tracker
            .add_binding("one", binding("aa:bb:cc:00:00:02", Ipv4Addr::new(10, 0, 0, 11)))
            .await
            .unwrap();

        let subnet = tracker.get_subnet("one").await.unwrap();
        let (lease, _, _) = subnet.find_or_allocate("aa:bb:cc:00:00:01", None).await;
        let leased_ip = lease.unwrap().ip;
        tracker.save().await.unwrap();

        let mut updated = api_subnet("one");
        updated.active_lease_time = 300;
        tracker.replace_subnet("one", updated).await.unwrap();

        let replaced = tracker.get_subnet("one").await.unwrap();
        let (lease, _) = replaced.find_info("aa:bb:cc:00:00:01").await;
        assert_eq!(lease.unwrap().ip, leased_ip);
        assert!(replaced.address_held(leased_ip).await);
        assert!(replaced.address_held(Ipv4Addr::new(10, 0, 0, 11)).await);
        assert!(replaced.has_binding_for("aa:bb:cc:00:00:02").await);
    }

    #[tokio::test]
    async fn test_replace_subnet_overlap_rolls_back() {
        let (tracker, _dir) = empty_tracker().await;
        tracker.add_subnet(api_subnet("one")).await.unwrap();

        let mut other = api_subnet("two");
        other.subnet = "172.16.0.0/24".parse().unwrap();
        other.active_start = Ipv4Addr::new(172, 16, 0, 10);
        other.active_end = Ipv4Addr::new(172, 16, 0, 20);
        tracker.add_subnet(other).await.unwrap();

        // Try to move "two" on top of "one".
        let mut clash = api_subnet("two");
        clash.subnet = "10.0.0.0/25".parse().unwrap();
        clash.active_start = Ipv4Addr::new(10, 0, 0, 10);
        clash.active_end = Ipv4Addr::new(10, 0, 0, 20);
        let error = tracker.replace_subnet("two", clash).await.unwrap_err();
        assert!(matches!(error, Error::SubnetOverlap(_)));

        let restored = tracker.get_subnet("two").await.unwrap();
        assert_eq!(restored.cidr(), "172.16.0.0/24".parse().unwrap());
    }

    #[tokio::test]
    async fn test_replace_subnet_can_rename() {
        let (tracker, _dir) = empty_tracker().await;
        tracker.add_subnet(api_subnet("old-name")).await.unwrap();
        tracker
            .replace_subnet("old-name", api_subnet("new-name"))
            .await
            .unwrap();
        assert!(tracker.get_subnet("old-name").await.is_none());
        assert!(tracker.get_subnet("new-name").await.is_some());
    }

    #[tokio::test]
    async fn test_add_binding_normalizes_mac() {
        let (tracker, _dir) = empty_tracker().await;
        tracker.add_subnet(api_subnet("one")).await.unwrap();
        tracker
            .add_binding("one", binding("AA:BB:CC:00:00:02", Ipv4Addr::new(10, 0, 0, 50)))
            .await
            .unwrap();

        let subnet = tracker.get_subnet("one").await.unwrap();
        assert!(subnet.has_binding_for("aa:bb:cc:00:00:02").await);
        assert!(tracker.find_bound_ip("AA:BB:CC:00:00:02").await.is_some());
    }

    #[tokio::test]
    async fn test_add_binding_unknown_subnet() {
        let (tracker, _dir) = empty_tracker().await;
        let result = tracker
            .add_binding("ghost", binding("aa:bb:cc:00:00:02", Ipv4Addr::new(10, 0, 0, 50)))
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_binding() {
        let (tracker, _dir) = empty_tracker().await;
        tracker.add_subnet(api_subnet("one")).await.unwrap();
        tracker
            .add_binding("one", binding("aa:bb:cc:00:00:02", Ipv4Addr::new(10, 0, 0, 11)))
            .await
            .unwrap();
        tracker.delete_binding("one", "aa:bb:cc:00:00:02").await.unwrap();

        let subnet = tracker.get_subnet("one").await.unwrap();
        assert!(!subnet.address_held(Ipv4Addr::new(10, 0, 0, 11)).await);
        assert!(matches!(
            tracker.delete_binding("one", "aa:bb:cc:00:00:02").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_set_next_server() {
        let (tracker, _dir) = empty_tracker().await;
        tracker.add_subnet(api_subnet("one")).await.unwrap();
        tracker
            .add_binding("one", binding("aa:bb:cc:00:00:02", Ipv4Addr::new(10, 0, 0, 50)))
            .await
            .unwrap();

        tracker
            .set_next_server("one", Ipv4Addr::new(10, 0, 0, 50), Ipv4Addr::new(10, 0, 0, 2))
            .await
            .unwrap();

        let subnet = tracker.get_subnet("one").await.unwrap();
        let (_, bound) = subnet.find_info("aa:bb:cc:00:00:02").await;
        assert_eq!(bound.unwrap().next_server, Some(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[tokio::test]
    async fn test_find_subnet_by_ip() {
        let (tracker, _dir) = empty_tracker().await;
        tracker.add_subnet(api_subnet("one")).await.unwrap();

        let found = tracker.find_subnet(Ipv4Addr::new(10, 0, 0, 200)).await;
        assert_eq!(found.unwrap().name(), "one");
        assert!(tracker.find_subnet(Ipv4Addr::new(192, 168, 9, 1)).await.is_none());
    }

    #[tokio::test]
    async fn test_tenant_id_stored_and_returned() {
        let (tracker, _dir) = empty_tracker().await;
        let mut api = api_subnet("one");
        api.tenant_id = Some("tenant-7".to_string());
        tracker.add_subnet(api).await.unwrap();

        let subnet = tracker.get_subnet("one").await.unwrap();
        assert_eq!(subnet.tenant_id(), Some("tenant-7"));
        assert_eq!(
            tracker.list_subnets().await[0].tenant_id.as_deref(),
            Some("tenant-7")
        );
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        DataTracker::init(dir.path()).await.unwrap();

        {
            let tracker = DataTracker::load(dir.path()).await.unwrap();
            tracker.add_subnet(api_subnet("one")).await.unwrap();
            tracker
                .add_binding("one", binding("aa:bb:cc:00:00:02", Ipv4Addr::new(10, 0, 0, 11)))
                .await
                .unwrap();
            let subnet = tracker.get_subnet("one").await.unwrap();
            subnet.find_or_allocate("aa:bb:cc:00:00:01", None).await;
            tracker.save().await.unwrap();
        }

        let tracker = DataTracker::load(dir.path()).await.unwrap();
        let subnet = tracker.get_subnet("one").await.unwrap();
        let (lease, _) = subnet.find_info("aa:bb:cc:00:00:01").await;
        assert_eq!(lease.unwrap().ip, Ipv4Addr::new(10, 0, 0, 10));
        // Bits are rebuilt from leases and bindings, not persisted.
        assert!(subnet.address_held(Ipv4Addr::new(10, 0, 0, 10)).await);
        assert!(subnet.address_held(Ipv4Addr::new(10, 0, 0, 11)).await);
        assert!(!subnet.address_held(Ipv4Addr::new(10, 0, 0, 12)).await);

        let raw = std::fs::read_to_string(dir.path().join(DATABASE_FILE)).unwrap();
        assert!(raw.contains("\"Subnets\""));
        assert!(!raw.contains("active_bits"));
    }

    #[tokio::test]
    async fn test_mutations_persist_without_explicit_save() {
        let dir = tempfile::tempdir().unwrap();
        DataTracker::init(dir.path()).await.unwrap();

        {
            let tracker = DataTracker::load(dir.path()).await.unwrap();
            tracker.add_subnet(api_subnet("one")).await.unwrap();
        }

        let tracker = DataTracker::load(dir.path()).await.unwrap();
        assert!(tracker.get_subnet("one").await.is_some());
    }
}
