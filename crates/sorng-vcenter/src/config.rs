//! Connection and deployment configuration.
//!
//! The automation layer that drives this crate fills a [`VcenterConfig`]
//! (usually from a JSON / YAML file) and hands it to
//! [`SessionManager`](crate::session::SessionManager).

use crate::error::{VcenterError, VcenterResult};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Network selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the deployed VM's NIC attaches to the network.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum NicBackingType {
    /// Standard port group on a vSwitch
    #[default]
    Network,
    /// Distributed switch port group
    DistributedVirtualPortGroup,
    /// A specific port on a distributed switch (needs `portKey`)
    DistributedVirtualPort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Network / port-group name
    #[serde(default = "default_network_name")]
    pub name: String,
    #[serde(default)]
    pub backing: NicBackingType,
    /// Distributed port key, only for `DistributedVirtualPort`
    #[serde(default)]
    pub port_key: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: default_network_name(),
            backing: NicBackingType::Network,
            port_key: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything needed to reach a vCenter / ESXi endpoint and place VMs on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VcenterConfig {
    /// vCenter or ESXi hostname / IP
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Verify the endpoint's TLS certificate. Off by default: disk
    /// transfers go straight to ESXi hosts, which are usually self-signed.
    #[serde(default)]
    pub verify_tls: bool,
    /// VI/JSON API release segment in request paths
    #[serde(default = "default_api_release")]
    pub api_release: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    // ── Placement ───────────────────────────────────────────────────
    #[serde(default)]
    pub datacenter_name: Option<String>,
    /// When unset, the first datastore found at connect time is used
    #[serde(default)]
    pub datastore_name: Option<String>,
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub esx_host_name: Option<String>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default = "default_true")]
    pub thin_provisioning: bool,
    #[serde(default)]
    pub eager_scrub: bool,

    // ── Timing ──────────────────────────────────────────────────────
    #[serde(default = "default_connect_retry_timeout")]
    pub connect_retry_timeout_secs: u64,
    #[serde(default = "default_connect_initial_sleep")]
    pub connect_initial_sleep_secs: u64,
    #[serde(default = "default_upload_retry_timeout")]
    pub upload_retry_timeout_secs: u64,
    #[serde(default = "default_upload_initial_sleep")]
    pub upload_initial_sleep_secs: u64,
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_secs: u64,
    #[serde(default = "default_lease_keepalive")]
    pub lease_keepalive_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub transfer_chunk_size: usize,
    #[serde(default = "default_ip_wait_timeout")]
    pub ip_wait_timeout_secs: u64,
}

fn default_port() -> u16 { 443 }
fn default_api_release() -> String { "8.0.1.0".to_string() }
fn default_request_timeout() -> u64 { 300 }
fn default_network_name() -> String { "VM Network".to_string() }
fn default_true() -> bool { true }
fn default_connect_retry_timeout() -> u64 { 1000 }
fn default_connect_initial_sleep() -> u64 { 15 }
fn default_upload_retry_timeout() -> u64 { 600 }
fn default_upload_initial_sleep() -> u64 { 5 }
fn default_lease_timeout() -> u64 { 10_000 }
fn default_lease_keepalive() -> u64 { 5 }
fn default_chunk_size() -> usize { 4096 }
fn default_ip_wait_timeout() -> u64 { 600 }

impl Default for VcenterConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            verify_tls: false,
            api_release: default_api_release(),
            request_timeout_secs: default_request_timeout(),
            datacenter_name: None,
            datastore_name: None,
            cluster_name: None,
            esx_host_name: None,
            network: NetworkConfig::default(),
            thin_provisioning: true,
            eager_scrub: false,
            connect_retry_timeout_secs: default_connect_retry_timeout(),
            connect_initial_sleep_secs: default_connect_initial_sleep(),
            upload_retry_timeout_secs: default_upload_retry_timeout(),
            upload_initial_sleep_secs: default_upload_initial_sleep(),
            lease_timeout_secs: default_lease_timeout(),
            lease_keepalive_secs: default_lease_keepalive(),
            transfer_chunk_size: default_chunk_size(),
            ip_wait_timeout_secs: default_ip_wait_timeout(),
        }
    }
}

impl VcenterConfig {
    /// Load from a `.json`, `.yaml` or `.yml` file and validate it.
    pub fn load(path: impl AsRef<Path>) -> VcenterResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            VcenterError::config(format!("Cannot read config '{}': {e}", path.display()))
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let config: Self = match ext.as_str() {
            "json" => serde_json::from_str(&raw)?,
            "yaml" | "yml" => serde_yaml::from_str(&raw)?,
            other => {
                return Err(VcenterError::config(format!(
                    "Unsupported config format '{other}' for '{}'",
                    path.display()
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configs that can never connect or deploy.
    pub fn validate(&self) -> VcenterResult<()> {
        if self.host.trim().is_empty() {
            return Err(VcenterError::config("host must not be empty"));
        }
        if self.username.trim().is_empty() {
            return Err(VcenterError::config("username must not be empty"));
        }
        if self.transfer_chunk_size == 0 {
            return Err(VcenterError::config("transferChunkSize must be positive"));
        }
        if self.network.backing == NicBackingType::DistributedVirtualPort
            && self.network.port_key.is_none()
        {
            return Err(VcenterError::config(format!(
                "Network '{}' uses a distributed port backing but no portKey was given",
                self.network.name
            )));
        }
        Ok(())
    }

    /// Disk provisioning mode string understood by the import-spec API.
    pub fn disk_provisioning(&self) -> &'static str {
        if self.thin_provisioning {
            "thin"
        } else if self.eager_scrub {
            "eagerZeroedThick"
        } else {
            "thick"
        }
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn lease_keepalive(&self) -> Duration {
        Duration::from_secs(self.lease_keepalive_secs)
    }

    pub fn safe(&self) -> VcenterConfigSafe {
        VcenterConfigSafe {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            verify_tls: self.verify_tls,
            datacenter_name: self.datacenter_name.clone(),
            datastore_name: self.datastore_name.clone(),
            cluster_name: self.cluster_name.clone(),
        }
    }
}

/// Config without the password, safe to log or display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VcenterConfigSafe {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub verify_tls: bool,
    pub datacenter_name: Option<String>,
    pub datastore_name: Option<String>,
    pub cluster_name: Option<String>,
}
