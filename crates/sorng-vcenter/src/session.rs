//! Connection ownership, stale-session recovery and inventory lookup.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──▶ Connected
//!                                            │  ▲
//!                          stale symptom     ▼  │ connect
//!                                           Stale ──▶ Reconnecting
//! any ──disconnect──▶ Closed   (terminal for implicit reconnects)
//! ```
//!
//! The management endpoint silently drops idle sessions, so every VM and
//! transfer operation starts with [`SessionManager::validate_connection`].

use crate::config::VcenterConfig;
use crate::error::{VcenterError, VcenterResult};
use crate::retry::{self, RetryPolicy};
use crate::transport::TransportClient;
use crate::types::*;
use crate::vim::{VimApi, VimJsonClient};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Stale,
    Reconnecting,
    /// Explicitly disconnected
    Closed,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    datastore_name: Option<String>,
    datastore_path: String,
    is_esx_host: bool,
    connected_at: Option<DateTime<Utc>>,
}

/// Where new VMs and imports land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub datacenter: InventoryObject,
    pub folder: MoRef,
    pub pool: MoRef,
    pub host: Option<MoRef>,
    pub datastore: InventoryObject,
}

/// Summary of the current connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub host: String,
    pub username: String,
    pub state: SessionState,
    pub is_esx_host: bool,
    pub datastore_path: String,
    pub connected_at: Option<String>,
}

struct Established {
    is_esx_host: bool,
    datastore_name: String,
}

/// Owns one authenticated connection to a vCenter / ESXi endpoint.
pub struct SessionManager {
    api: Arc<dyn VimApi>,
    config: VcenterConfig,
    transport: TransportClient,
    inner: Mutex<SessionInner>,
}

impl SessionManager {
    pub fn new(config: VcenterConfig, api: Arc<dyn VimApi>) -> VcenterResult<Self> {
        let transport = TransportClient::from_config(&config)?;
        Ok(Self {
            api,
            config,
            transport,
            inner: Mutex::new(SessionInner {
                state: SessionState::Disconnected,
                datastore_name: None,
                datastore_path: String::new(),
                is_esx_host: false,
                connected_at: None,
            }),
        })
    }

    /// Session backed by the VI/JSON client.
    pub fn from_config(config: VcenterConfig) -> VcenterResult<Self> {
        config.validate()?;
        let api: Arc<dyn VimApi> = Arc::new(VimJsonClient::new(&config)?);
        Self::new(config, api)
    }

    pub fn api(&self) -> &Arc<dyn VimApi> {
        &self.api
    }

    pub fn config(&self) -> &VcenterConfig {
        &self.config
    }

    pub fn transport(&self) -> &TransportClient {
        &self.transport
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn is_esx_host(&self) -> bool {
        self.inner.lock().await.is_esx_host
    }

    /// `"[datastore] "`, the prefix for new VM files.
    pub async fn datastore_path(&self) -> String {
        self.inner.lock().await.datastore_path.clone()
    }

    pub async fn datastore_name(&self) -> Option<String> {
        self.inner.lock().await.datastore_name.clone()
    }

    pub async fn info(&self) -> SessionInfo {
        let inner = self.inner.lock().await;
        SessionInfo {
            host: self.config.host.clone(),
            username: self.config.username.clone(),
            state: inner.state,
            is_esx_host: inner.is_esx_host,
            datastore_path: inner.datastore_path.clone(),
            connected_at: inner.connected_at.map(|t| t.to_rfc3339()),
        }
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Authenticate and discover the datastore, retrying while the
    /// endpoint is unreachable (it may be rebooting).
    pub async fn connect(&self) -> VcenterResult<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.state = match inner.state {
                SessionState::Stale | SessionState::Reconnecting => SessionState::Reconnecting,
                _ => SessionState::Connecting,
            };
        }

        let policy = RetryPolicy::for_connect(&self.config);
        let result = policy
            .execute("connect", || self.establish(), retry::is_transient)
            .await;

        let mut inner = self.inner.lock().await;
        match result {
            Ok(est) => {
                inner.state = SessionState::Connected;
                inner.is_esx_host = est.is_esx_host;
                inner.datastore_path = format!("[{}] ", est.datastore_name);
                inner.datastore_name = Some(est.datastore_name);
                inner.connected_at = Some(Utc::now());
                info!(
                    "Connected to {} ({}), datastore path '{}'",
                    self.config.host,
                    if inner.is_esx_host { "ESX host" } else { "vCenter" },
                    inner.datastore_path
                );
                Ok(())
            }
            Err(e) => {
                inner.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn establish(&self) -> VcenterResult<Established> {
        self.api.login(&self.config.username, &self.config.password).await?;
        let about = self.api.about().await?;

        let datastore_name = match &self.config.datastore_name {
            Some(name) => name.clone(),
            None => {
                let stores = self.api.list_objects(InventoryKind::Datastore).await?;
                let first = stores
                    .into_iter()
                    .next()
                    .ok_or_else(|| VcenterError::config(format!("No datastore found on {}", self.config.host)))?;
                debug!("No datastore configured, using '{}'", first.name);
                first.name
            }
        };

        Ok(Established { is_esx_host: about.is_esx(), datastore_name })
    }

    /// Probe the session and transparently reconnect if it went stale.
    pub async fn validate_connection(&self) -> VcenterResult<()> {
        let state = self.inner.lock().await.state;
        match state {
            SessionState::Closed => {
                return Err(VcenterError::not_connected(format!(
                    "Session to {} was disconnected",
                    self.config.host
                )))
            }
            SessionState::Disconnected | SessionState::Connecting => {
                return Err(VcenterError::not_connected(format!(
                    "Not connected to {}; call connect first",
                    self.config.host
                )))
            }
            SessionState::Stale | SessionState::Reconnecting => return self.reconnect().await,
            SessionState::Connected => {}
        }

        match self.api.current_time().await {
            Ok(_) => Ok(()),
            Err(e) if e.is_stale() => {
                warn!("Session to {} went stale ({e}), reconnecting", self.config.host);
                self.reconnect().await
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the current handle and connect again. Not allowed once closed.
    pub async fn reconnect(&self) -> VcenterResult<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Closed {
                return Err(VcenterError::not_connected(format!(
                    "Session to {} was disconnected",
                    self.config.host
                )));
            }
            inner.state = SessionState::Stale;
        }
        info!("Reconnecting to {}", self.config.host);
        if let Err(e) = self.api.logout().await {
            debug!("Logout of stale session failed: {e}");
        }
        self.connect().await
    }

    /// Release the session. Later operations fail instead of reconnecting.
    pub async fn disconnect(&self) -> VcenterResult<()> {
        let was = {
            let mut inner = self.inner.lock().await;
            std::mem::replace(&mut inner.state, SessionState::Closed)
        };
        if matches!(was, SessionState::Connected | SessionState::Stale) {
            if let Err(e) = self.api.logout().await {
                warn!("Logout from {} failed: {e}", self.config.host);
            }
        }
        info!("Disconnected from {}", self.config.host);
        Ok(())
    }

    // ── Inventory lookup ────────────────────────────────────────────
    // Linear scan over a container view; with duplicate names the first
    // object in server order wins.

    async fn find(&self, kind: InventoryKind, name: &str) -> VcenterResult<Option<InventoryObject>> {
        Ok(self
            .api
            .list_objects(kind)
            .await?
            .into_iter()
            .find(|o| o.name == name))
    }

    async fn first(&self, kind: InventoryKind) -> VcenterResult<Option<InventoryObject>> {
        Ok(self.api.list_objects(kind).await?.into_iter().next())
    }

    pub async fn find_vm(&self, name: &str) -> VcenterResult<Option<VmHandle>> {
        Ok(self
            .find(InventoryKind::VirtualMachine, name)
            .await?
            .map(|o| VmHandle { name: o.name, moref: o.moref }))
    }

    /// Like [`find_vm`](Self::find_vm) but a missing VM is an error.
    pub async fn require_vm(&self, name: &str) -> VcenterResult<VmHandle> {
        self.find_vm(name)
            .await?
            .ok_or_else(|| VcenterError::not_found(format!("VM '{name}' not found")))
    }

    pub async fn find_datastore(&self, name: &str) -> VcenterResult<Option<InventoryObject>> {
        self.find(InventoryKind::Datastore, name).await
    }

    pub async fn find_cluster(&self, name: &str) -> VcenterResult<Option<InventoryObject>> {
        self.find(InventoryKind::ClusterComputeResource, name).await
    }

    pub async fn find_datacenter(&self, name: &str) -> VcenterResult<Option<InventoryObject>> {
        self.find(InventoryKind::Datacenter, name).await
    }

    pub async fn find_host(&self, name: &str) -> VcenterResult<Option<InventoryObject>> {
        self.find(InventoryKind::HostSystem, name).await
    }

    /// Standard networks first, then distributed port groups.
    pub async fn find_network(&self, name: &str) -> VcenterResult<Option<InventoryObject>> {
        if let Some(net) = self.find(InventoryKind::Network, name).await? {
            return Ok(Some(net));
        }
        self.find(InventoryKind::DistributedVirtualPortgroup, name).await
    }

    /// Configured datacenter, or the first one.
    pub async fn datacenter(&self) -> VcenterResult<InventoryObject> {
        match &self.config.datacenter_name {
            Some(name) => self
                .find_datacenter(name)
                .await?
                .ok_or_else(|| VcenterError::config(format!("Datacenter '{name}' not found"))),
            None => self
                .first(InventoryKind::Datacenter)
                .await?
                .ok_or_else(|| VcenterError::config("No datacenter found")),
        }
    }

    /// Datacenter argument for file / disk manager calls (`None` on ESX).
    pub async fn datacenter_ref(&self) -> VcenterResult<Option<MoRef>> {
        if self.is_esx_host().await {
            return Ok(None);
        }
        Ok(Some(self.datacenter().await?.moref))
    }

    pub async fn datastore(&self) -> VcenterResult<InventoryObject> {
        let name = self
            .datastore_name()
            .await
            .ok_or_else(|| VcenterError::not_connected("No datastore selected; call connect first"))?;
        self.find_datastore(&name)
            .await?
            .ok_or_else(|| VcenterError::config(format!("Datastore '{name}' not found")))
    }

    pub async fn resource_pool(&self) -> VcenterResult<MoRef> {
        let compute = if self.is_esx_host().await {
            self.first(InventoryKind::ComputeResource)
                .await?
                .ok_or_else(|| VcenterError::config("No compute resource found on ESX host"))?
        } else {
            match &self.config.cluster_name {
                Some(name) => self
                    .find_cluster(name)
                    .await?
                    .ok_or_else(|| VcenterError::config(format!("Cluster '{name}' not found")))?,
                None => self
                    .first(InventoryKind::ClusterComputeResource)
                    .await?
                    .ok_or_else(|| VcenterError::config("No cluster found"))?,
            }
        };
        self.api.resource_pool_of(&compute.moref).await
    }

    /// Resolve every inventory object a new VM or import needs.
    pub async fn placement(&self) -> VcenterResult<Placement> {
        let datacenter = self.datacenter().await?;
        let folder = self.api.vm_folder_of(&datacenter.moref).await?;
        let pool = self.resource_pool().await?;
        let host = match &self.config.esx_host_name {
            Some(name) => Some(
                self.find_host(name)
                    .await?
                    .ok_or_else(|| VcenterError::config(format!("ESX host '{name}' not found")))?
                    .moref,
            ),
            None => None,
        };
        let datastore = self.datastore().await?;
        Ok(Placement { datacenter, folder, pool, host, datastore })
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let state = self.inner.get_mut().state;
        if !matches!(state, SessionState::Connected | SessionState::Stale) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let api = Arc::clone(&self.api);
                let host = self.config.host.clone();
                handle.spawn(async move {
                    if let Err(e) = api.logout().await {
                        debug!("Logout from {host} on drop failed: {e}");
                    }
                });
            }
            Err(_) => debug!("No runtime to log out of {} on drop", self.config.host),
        }
    }
}
