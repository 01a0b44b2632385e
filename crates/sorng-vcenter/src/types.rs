//! Shared types for vCenter / ESXi orchestration.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Managed objects / inventory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Managed-object reference (e.g. `VirtualMachine:vm-42`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MoRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl MoRef {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self { kind: kind.into(), value: value.into() }
    }

    /// Wire form used as a method argument.
    pub fn to_json(&self) -> Value {
        json!({
            "_typeName": "ManagedObjectReference",
            "type": self.kind,
            "value": self.value,
        })
    }
}

impl std::fmt::Display for MoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// Inventory object types that can be enumerated through a container view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InventoryKind {
    VirtualMachine,
    Datastore,
    ClusterComputeResource,
    ComputeResource,
    Datacenter,
    HostSystem,
    Network,
    DistributedVirtualPortgroup,
    ResourcePool,
}

impl InventoryKind {
    pub fn vim_type(self) -> &'static str {
        match self {
            Self::VirtualMachine => "VirtualMachine",
            Self::Datastore => "Datastore",
            Self::ClusterComputeResource => "ClusterComputeResource",
            Self::ComputeResource => "ComputeResource",
            Self::Datacenter => "Datacenter",
            Self::HostSystem => "HostSystem",
            Self::Network => "Network",
            Self::DistributedVirtualPortgroup => "DistributedVirtualPortgroup",
            Self::ResourcePool => "ResourcePool",
        }
    }
}

/// `(name, moref)` pair from a container view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InventoryObject {
    pub name: String,
    pub moref: MoRef,
}

/// Subset of `ServiceContent.about`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AboutInfo {
    /// `VirtualCenter` or `HostAgent`
    #[serde(default)]
    pub api_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub full_name: String,
}

impl AboutInfo {
    /// Directly connected to an ESXi host (no vCenter in between).
    pub fn is_esx(&self) -> bool {
        self.api_type == "HostAgent"
    }
}

/// Distributed switch coordinates of a DV port group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DistributedPortInfo {
    pub switch_uuid: String,
    pub portgroup_key: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  VM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reference to a provisioned VM, scoped to one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmHandle {
    pub name: String,
    pub moref: MoRef,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl PowerState {
    pub fn from_vim(s: &str) -> Option<Self> {
        match s {
            "poweredOn" => Some(Self::PoweredOn),
            "poweredOff" => Some(Self::PoweredOff),
            "suspended" => Some(Self::Suspended),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Devices
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a virtual NIC is wired.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum NicBacking {
    /// Standard vSwitch port group
    Network { device_name: String },
    /// Distributed switch port connection
    Distributed {
        switch_uuid: String,
        portgroup_key: String,
        port_key: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum DeviceKind {
    ScsiController { bus_number: i32 },
    Disk {
        file_name: String,
        thin: bool,
        eager_scrub: bool,
        capacity_kb: u64,
    },
    Nic { backing: NicBacking },
    Serial { file_name: String },
    /// Anything else, by VI type name
    Other { type_name: String },
}

/// One entry of a VM's `config.hardware.device` list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDevice {
    pub key: i32,
    #[serde(default)]
    pub label: Option<String>,
    /// `deviceInfo.summary`, e.g. `"10,240 KB"` for disks
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub controller_key: Option<i32>,
    #[serde(default)]
    pub unit_number: Option<i32>,
    pub kind: DeviceKind,
    /// Device object exactly as the server returned it.
    #[serde(skip)]
    pub(crate) raw: Option<Value>,
}

impl VirtualDevice {
    /// A device that does not exist yet (negative temporary key).
    pub fn new(key: i32, kind: DeviceKind) -> Self {
        Self {
            key,
            label: None,
            summary: None,
            controller_key: None,
            unit_number: None,
            kind,
            raw: None,
        }
    }

    pub fn is_disk(&self) -> bool {
        matches!(self.kind, DeviceKind::Disk { .. })
    }

    pub fn is_scsi_controller(&self) -> bool {
        matches!(self.kind, DeviceKind::ScsiController { .. })
    }

    pub fn disk_file(&self) -> Option<&str> {
        match &self.kind {
            DeviceKind::Disk { file_name, .. } => Some(file_name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DeviceOperation {
    Add,
    Remove,
    Edit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FileOperation {
    Create,
    Destroy,
    Replace,
}

/// `VirtualDeviceConfigSpec`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceChange {
    pub operation: DeviceOperation,
    pub file_operation: Option<FileOperation>,
    pub device: VirtualDevice,
}

impl DeviceChange {
    pub fn add(device: VirtualDevice) -> Self {
        Self { operation: DeviceOperation::Add, file_operation: None, device }
    }

    pub fn remove(device: VirtualDevice) -> Self {
        Self { operation: DeviceOperation::Remove, file_operation: None, device }
    }

    pub fn with_file_operation(mut self, op: FileOperation) -> Self {
        self.file_operation = Some(op);
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Specs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `VirtualMachineConfigSpec` (only the fields this crate sets).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VmConfigSpec {
    pub name: Option<String>,
    pub memory_mb: Option<u64>,
    pub num_cpus: Option<u32>,
    pub guest_id: Option<String>,
    /// `files.vmPathName`, e.g. `"[ds1] "`
    pub files_path: Option<String>,
    pub device_changes: Vec<DeviceChange>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocateSpec {
    pub datastore: Option<MoRef>,
    pub pool: Option<MoRef>,
    pub host: Option<MoRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloneSpec {
    pub location: RelocateSpec,
    pub power_on: bool,
    pub template: bool,
}

/// Static network identity applied through guest customization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CustomizationSpec {
    pub hostname: String,
    #[serde(default)]
    pub domain: String,
    pub ip: String,
    pub subnet_mask: String,
    #[serde(default)]
    pub gateways: Vec<String>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

/// A virtual disk to add or clone.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpec {
    pub size_kb: u64,
    /// Existing datastore path to attach; a new file is created when unset
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub thin: bool,
    #[serde(default)]
    pub eager_scrub: bool,
    /// First free unit on the controller when unset
    #[serde(default)]
    pub unit_number: Option<i32>,
    /// First SCSI controller on the VM when unset
    #[serde(default)]
    pub controller_key: Option<i32>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub state: TaskState,
    /// Remote error message when `state == Error`
    pub error: Option<String>,
    pub result: Option<Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Leases / OVF
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LeaseState {
    Initializing,
    Ready,
    Done,
    Error,
}

/// One transfer endpoint of an HTTP NFC lease.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUrl {
    /// Device key (export) / lease-local key
    pub key: String,
    /// Matches `OvfFileItem.device_id` on import
    #[serde(default)]
    pub import_key: Option<String>,
    pub url: String,
    /// Suggested file name on export
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub disk: bool,
    #[serde(default)]
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseInfo {
    /// VM being exported / created by the import
    pub entity: Option<MoRef>,
    pub device_urls: Vec<DeviceUrl>,
}

/// `OvfFile` entry passed to `CreateDescriptor`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OvfFile {
    pub device_id: String,
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateDescriptorParams {
    pub name: String,
    pub description: String,
    pub ovf_files: Vec<OvfFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSpecParams {
    pub entity_name: String,
    pub disk_provisioning: String,
    pub host: Option<MoRef>,
}

/// File the import expects to be uploaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OvfFileItem {
    pub device_id: String,
    pub path: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub create: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportSpecResult {
    pub import_spec: Option<Value>,
    pub file_items: Vec<OvfFileItem>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moref_wire_form() {
        let m = MoRef::new("VirtualMachine", "vm-42");
        let v = m.to_json();
        assert_eq!(v["_typeName"], "ManagedObjectReference");
        assert_eq!(v["type"], "VirtualMachine");
        assert_eq!(v["value"], "vm-42");
        assert_eq!(m.to_string(), "VirtualMachine:vm-42");
    }

    #[test]
    fn about_detects_esx() {
        let about = AboutInfo { api_type: "HostAgent".into(), ..Default::default() };
        assert!(about.is_esx());
        let about = AboutInfo { api_type: "VirtualCenter".into(), ..Default::default() };
        assert!(!about.is_esx());
    }

    #[test]
    fn power_state_from_vim() {
        assert_eq!(PowerState::from_vim("poweredOn"), Some(PowerState::PoweredOn));
        assert_eq!(PowerState::from_vim("bogus"), None);
    }
}
