//! Declarative address resources and their persisted state.
//!
//! A resource is a named desired address (`hostname`, `section`, `subnet`).
//! Applying it drives the [`Orchestrator`] toward that description and
//! records the outcome, including the derived fields (`ip_address`,
//! `broadcast`, `gateway`, `bitmask`), in a JSON state file.
//!
//! # State File
//!
//! ```json
//! {
//!   "resources": { "web": { "id": "12", "hostname": "web-01", ... } },
//!   "orphaned": [ { "id": "9", "resource": "web", "recorded_at": "..." } ]
//! }
//! ```
//!
//! `orphaned` lists addresses a reallocation left behind upstream.
//!
//! # Thread Safety
//!
//! [`Resources`] uses a [`RwLock`] for the state and a [`Mutex`] around file
//! writes. The lock is never held across IPAM calls.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::orchestrator::{AddressRecord, AddressSpec, Orchestrator};

/// Recorded state of one applied resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressResource {
    /// IPAM address identifier.
    pub id: String,
    pub hostname: String,
    pub section: String,
    pub subnet: String,
    pub ip_address: String,
    #[serde(default)]
    pub broadcast: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub bitmask: String,
    pub updated_at: DateTime<Utc>,
}

impl AddressResource {
    fn from_record(id: String, record: AddressRecord) -> Self {
        Self {
            id,
            hostname: record.hostname,
            section: record.section,
            subnet: record.subnet,
            ip_address: record.ip,
            broadcast: record.broadcast,
            gateway: record.gateway,
            bitmask: record.bitmask,
            updated_at: Utc::now(),
        }
    }

    pub fn spec(&self) -> AddressSpec {
        AddressSpec::new(&self.section, &self.subnet, &self.hostname)
    }
}

/// An address left allocated upstream by an incomplete reallocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanedAddress {
    pub id: String,
    pub resource: String,
    pub recorded_at: DateTime<Utc>,
}

/// Persistent state format (serialized to JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateFile {
    pub resources: BTreeMap<String, AddressResource>,
    #[serde(default)]
    pub orphaned: Vec<OrphanedAddress>,
}

/// Applies address resources and persists their state.
pub struct Resources {
    orchestrator: Arc<Orchestrator>,
    state: RwLock<StateFile>,
    path: PathBuf,
    save_lock: Mutex<()>,
}

impl Resources {
    /// Opens the state file at `path`, starting empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open<P: AsRef<Path>>(orchestrator: Arc<Orchestrator>, path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = Self::load_state(&path).await?;

        Ok(Self {
            orchestrator,
            state: RwLock::new(state),
            path,
            save_lock: Mutex::new(()),
        })
    }

    async fn load_state(path: &Path) -> Result<StateFile> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(StateFile::default())
        }
    }

    /// Returns the recorded state of a resource.
    pub async fn get(&self, name: &str) -> Option<AddressResource> {
        self.state.read().await.resources.get(name).cloned()
    }

    /// Returns all recorded resources, ordered by name.
    pub async fn list(&self) -> Vec<(String, AddressResource)> {
        let state = self.state.read().await;
        state
            .resources
            .iter()
            .map(|(name, resource)| (name.clone(), resource.clone()))
            .collect()
    }

    pub async fn orphaned(&self) -> Vec<OrphanedAddress> {
        self.state.read().await.orphaned.clone()
    }

    /// Creates the resource if it is not recorded yet, otherwise updates it
    /// toward `desired`.
    ///
    /// The identifier the mutation produced is recorded before the address
    /// is read back, so a failing read leaves a resource that `refresh` and
    /// `destroy` can still act on.
    ///
    /// When an update leaves the previous address behind
    /// ([`Error::ReallocationIncomplete`]), the new address is still
    /// recorded and the old identifier is added to the orphan list before
    /// the error is returned.
    pub async fn apply(&self, name: &str, desired: &AddressSpec) -> Result<AddressResource> {
        let id = match self.get(name).await {
            None => self.orchestrator.create(desired, false).await?,
            Some(current) => {
                match self
                    .orchestrator
                    .modify(&current.id, &current.spec(), desired)
                    .await
                {
                    Ok(id) => id,
                    Err(Error::ReallocationIncomplete {
                        old_id,
                        new_id,
                        cause,
                    }) => {
                        self.adopt_after_leak(name, &old_id, &new_id, desired)
                            .await?;
                        return Err(Error::ReallocationIncomplete {
                            old_id,
                            new_id,
                            cause,
                        });
                    }
                    Err(error) => return Err(error),
                }
            }
        };

        self.record_identifier(name, &id, desired).await;
        self.save().await?;

        let record = self.orchestrator.read(&id).await?;
        let resource = AddressResource::from_record(id, record);
        self.store(name, resource.clone()).await?;
        info!(
            "Resource {} applied: {} -> {}",
            name, resource.hostname, resource.ip_address
        );
        Ok(resource)
    }

    /// Points the resource at `id` with the desired placement. Derived
    /// fields are cleared when the identifier changes; the next read fills
    /// them in.
    async fn record_identifier(&self, name: &str, id: &str, desired: &AddressSpec) {
        let mut state = self.state.write().await;
        let resource = state
            .resources
            .entry(name.to_string())
            .or_insert_with(|| AddressResource {
                id: id.to_string(),
                hostname: String::new(),
                section: String::new(),
                subnet: String::new(),
                ip_address: String::new(),
                broadcast: String::new(),
                gateway: String::new(),
                bitmask: String::new(),
                updated_at: Utc::now(),
            });

        if resource.id != id {
            resource.id = id.to_string();
            resource.ip_address.clear();
            resource.broadcast.clear();
            resource.gateway.clear();
            resource.bitmask.clear();
        }
        resource.hostname = desired.hostname.clone();
        resource.section = desired.section.clone();
        resource.subnet = desired.subnet.clone();
        resource.updated_at = Utc::now();
    }

    async fn adopt_after_leak(
        &self,
        name: &str,
        old_id: &str,
        new_id: &str,
        desired: &AddressSpec,
    ) -> Result<()> {
        warn!(
            "Resource {} moved to address {}, previous address {} needs manual cleanup",
            name, new_id, old_id
        );

        self.state.write().await.orphaned.push(OrphanedAddress {
            id: old_id.to_string(),
            resource: name.to_string(),
            recorded_at: Utc::now(),
        });
        self.record_identifier(name, new_id, desired).await;
        self.save().await?;

        match self.orchestrator.read(new_id).await {
            Ok(record) => {
                self.store(name, AddressResource::from_record(new_id.to_string(), record))
                    .await
            }
            Err(error) => {
                warn!("Could not read reallocated address {}: {}", new_id, error);
                Ok(())
            }
        }
    }

    /// Re-reads the resource's address and records the result.
    pub async fn refresh(&self, name: &str) -> Result<AddressResource> {
        let current = self
            .get(name)
            .await
            .ok_or_else(|| Error::ResourceNotFound(name.to_string()))?;

        let record = self.orchestrator.read(&current.id).await?;
        let resource = AddressResource::from_record(current.id, record);
        self.store(name, resource.clone()).await?;
        Ok(resource)
    }

    /// Releases the resource's address and forgets the resource.
    ///
    /// The resource stays recorded if the release is refused or fails.
    pub async fn destroy(&self, name: &str) -> Result<()> {
        let current = self
            .get(name)
            .await
            .ok_or_else(|| Error::ResourceNotFound(name.to_string()))?;

        self.orchestrator.delete(&current.id, false).await?;

        self.state.write().await.resources.remove(name);
        self.save().await?;
        info!("Resource {} destroyed", name);
        Ok(())
    }

    async fn store(&self, name: &str, resource: AddressResource) -> Result<()> {
        self.state
            .write()
            .await
            .resources
            .insert(name.to_string(), resource);
        self.save().await
    }

    /// Writes the state file atomically (temporary file, then rename).
    pub async fn save(&self) -> Result<()> {
        let _save_guard = self.save_lock.lock().await;

        let content = {
            let state = self.state.read().await;
            serde_json::to_string_pretty(&*state)?
        };

        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, content).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }
}
