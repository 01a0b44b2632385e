//! Aggregate service façade.
//!
//! `HypervisorService` is the capability surface callers program against;
//! `VcenterService` implements it on top of one [`SessionManager`].

use crate::config::VcenterConfig;
use crate::datastore::{DatastoreFiles, DatastorePath};
use crate::error::VcenterResult;
use crate::ova;
use crate::ovf_transfer::{ExportResult, OvfTransfer};
use crate::session::{SessionInfo, SessionManager};
use crate::types::*;
use crate::vim::VimApi;
use crate::vm::VmLifecycle;

use async_trait::async_trait;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[async_trait]
pub trait HypervisorService: Send + Sync {
    // ── Connection ──────────────────────────────────────────────────
    async fn connect(&self) -> VcenterResult<()>;
    async fn disconnect(&self) -> VcenterResult<()>;
    async fn session_info(&self) -> SessionInfo;
    async fn is_esx_host(&self) -> bool;

    // ── VMs ─────────────────────────────────────────────────────────
    async fn find_vm(&self, name: &str) -> VcenterResult<Option<VmHandle>>;
    async fn create_vm(&self, memory_gb: u64, num_cpus: u32, name: &str) -> VcenterResult<VmHandle>;
    async fn destroy_vm(&self, vm: &VmHandle) -> VcenterResult<()>;
    async fn power_on(&self, vm: &VmHandle) -> VcenterResult<()>;
    async fn power_off(&self, vm: &VmHandle) -> VcenterResult<()>;
    async fn reconfigure_vm_cpu_ram(&self, vm: &VmHandle, memory_gb: u64, num_cpus: u32) -> VcenterResult<()>;
    async fn rename_vm(&self, vm: &VmHandle, new_name: &str) -> VcenterResult<VmHandle>;
    async fn change_vm_name(&self, vm: &VmHandle, new_name: &str) -> VcenterResult<VmHandle>;
    async fn clone_vm(&self, vm: &VmHandle, clone_name: &str) -> VcenterResult<VmHandle>;
    async fn configure_static_ip(&self, vm: &VmHandle, spec: &CustomizationSpec) -> VcenterResult<()>;
    async fn mark_as_template(&self, vm: &VmHandle) -> VcenterResult<()>;
    async fn get_vm_ip_address(&self, vm: &VmHandle) -> VcenterResult<String>;

    // ── Disks / serial ports ────────────────────────────────────────
    async fn add_disk(&self, vm: &VmHandle, spec: &DiskSpec) -> VcenterResult<i32>;
    async fn detach_disk(&self, vm: &VmHandle, unit: i32) -> VcenterResult<()>;
    async fn clone_disk(&self, source: &str, dest: &str) -> VcenterResult<()>;
    async fn delete_disk(&self, path: &str) -> VcenterResult<()>;
    async fn get_disk(&self, vm: &VmHandle, unit: i32) -> VcenterResult<Option<VirtualDevice>>;
    async fn get_disk_size(&self, vm: &VmHandle, unit: i32) -> VcenterResult<u64>;
    async fn add_serial_port_to_file(&self, vm: &VmHandle, file_path: &str) -> VcenterResult<()>;
    async fn delete_serial_port_to_file(&self, vm: &VmHandle, file_path: &str) -> VcenterResult<()>;
    async fn download_datastore_file(&self, file: &DatastorePath, dest: &Path) -> VcenterResult<u64>;
    async fn upload_datastore_file(&self, src: &Path, file: &DatastorePath) -> VcenterResult<()>;

    // ── OVF / OVA ───────────────────────────────────────────────────
    async fn export_to_ovf(&self, vm: &VmHandle, dir: &Path, name: &str) -> VcenterResult<ExportResult>;
    async fn upload_ovf_to_vcenter(&self, ovf_path: &Path, vm_name: &str, validate_checksums: bool)
        -> VcenterResult<VmHandle>;
    async fn export_to_ova(&self, vm: &VmHandle, dir: &Path, name: &str) -> VcenterResult<PathBuf>;
    async fn upload_ova(&self, ova_path: &Path, vm_name: &str, validate_checksums: bool) -> VcenterResult<VmHandle>;
}

/// vCenter / ESXi implementation of [`HypervisorService`].
pub struct VcenterService {
    session: SessionManager,
}

impl VcenterService {
    /// Service over the VI/JSON client. Call [`connect`](HypervisorService::connect) before use.
    pub fn new(config: VcenterConfig) -> VcenterResult<Self> {
        Ok(Self { session: SessionManager::from_config(config)? })
    }

    pub fn with_api(config: VcenterConfig, api: Arc<dyn VimApi>) -> VcenterResult<Self> {
        Ok(Self { session: SessionManager::new(config, api)? })
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    fn vms(&self) -> VmLifecycle<'_> {
        VmLifecycle::new(&self.session)
    }

    fn ovf(&self) -> OvfTransfer<'_> {
        OvfTransfer::new(&self.session)
    }
}

async fn remove_quietly(path: &Path) {
    let result = if path.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    if let Err(e) = result {
        warn!("Failed to remove {}: {e}", path.display());
    }
}

#[async_trait]
impl HypervisorService for VcenterService {
    async fn connect(&self) -> VcenterResult<()> {
        self.session.connect().await
    }

    async fn disconnect(&self) -> VcenterResult<()> {
        self.session.disconnect().await
    }

    async fn session_info(&self) -> SessionInfo {
        self.session.info().await
    }

    async fn is_esx_host(&self) -> bool {
        self.session.is_esx_host().await
    }

    async fn find_vm(&self, name: &str) -> VcenterResult<Option<VmHandle>> {
        self.session.validate_connection().await?;
        self.session.find_vm(name).await
    }

    async fn create_vm(&self, memory_gb: u64, num_cpus: u32, name: &str) -> VcenterResult<VmHandle> {
        self.vms().create_vm(memory_gb, num_cpus, name).await
    }

    async fn destroy_vm(&self, vm: &VmHandle) -> VcenterResult<()> {
        self.vms().destroy_vm(vm).await
    }

    async fn power_on(&self, vm: &VmHandle) -> VcenterResult<()> {
        self.vms().power_on(vm).await
    }

    async fn power_off(&self, vm: &VmHandle) -> VcenterResult<()> {
        self.vms().power_off(vm).await
    }

    async fn reconfigure_vm_cpu_ram(&self, vm: &VmHandle, memory_gb: u64, num_cpus: u32) -> VcenterResult<()> {
        self.vms().reconfigure_vm_cpu_ram(vm, memory_gb, num_cpus).await
    }

    async fn rename_vm(&self, vm: &VmHandle, new_name: &str) -> VcenterResult<VmHandle> {
        self.vms().rename_vm(vm, new_name).await
    }

    async fn change_vm_name(&self, vm: &VmHandle, new_name: &str) -> VcenterResult<VmHandle> {
        self.vms().change_vm_name(vm, new_name).await
    }

    async fn clone_vm(&self, vm: &VmHandle, clone_name: &str) -> VcenterResult<VmHandle> {
        self.vms().clone_vm(vm, clone_name).await
    }

    async fn configure_static_ip(&self, vm: &VmHandle, spec: &CustomizationSpec) -> VcenterResult<()> {
        self.vms().configure_static_ip(vm, spec).await
    }

    async fn mark_as_template(&self, vm: &VmHandle) -> VcenterResult<()> {
        self.vms().mark_as_template(vm).await
    }

    async fn get_vm_ip_address(&self, vm: &VmHandle) -> VcenterResult<String> {
        self.vms().get_vm_ip_address(vm).await
    }

    async fn add_disk(&self, vm: &VmHandle, spec: &DiskSpec) -> VcenterResult<i32> {
        self.vms().add_disk(vm, spec).await
    }

    async fn detach_disk(&self, vm: &VmHandle, unit: i32) -> VcenterResult<()> {
        self.vms().detach_disk(vm, unit).await
    }

    async fn clone_disk(&self, source: &str, dest: &str) -> VcenterResult<()> {
        self.vms().clone_disk(source, dest).await
    }

    async fn delete_disk(&self, path: &str) -> VcenterResult<()> {
        self.vms().delete_disk(path).await
    }

    async fn get_disk(&self, vm: &VmHandle, unit: i32) -> VcenterResult<Option<VirtualDevice>> {
        self.vms().get_disk(vm, unit).await
    }

    async fn get_disk_size(&self, vm: &VmHandle, unit: i32) -> VcenterResult<u64> {
        self.vms().get_disk_size(vm, unit).await
    }

    async fn add_serial_port_to_file(&self, vm: &VmHandle, file_path: &str) -> VcenterResult<()> {
        self.vms().add_serial_port_to_file(vm, file_path).await
    }

    async fn delete_serial_port_to_file(&self, vm: &VmHandle, file_path: &str) -> VcenterResult<()> {
        self.vms().delete_serial_port_to_file(vm, file_path).await
    }

    async fn download_datastore_file(&self, file: &DatastorePath, dest: &Path) -> VcenterResult<u64> {
        DatastoreFiles::new(&self.session).download(file, dest).await
    }

    async fn upload_datastore_file(&self, src: &Path, file: &DatastorePath) -> VcenterResult<()> {
        DatastoreFiles::new(&self.session).upload(src, file).await
    }

    async fn export_to_ovf(&self, vm: &VmHandle, dir: &Path, name: &str) -> VcenterResult<ExportResult> {
        self.ovf().export_to_ovf(vm, dir, name).await
    }

    async fn upload_ovf_to_vcenter(
        &self,
        ovf_path: &Path,
        vm_name: &str,
        validate_checksums: bool,
    ) -> VcenterResult<VmHandle> {
        self.ovf().upload_ovf_to_vcenter(ovf_path, vm_name, validate_checksums).await
    }

    /// Export, pack into `<dir>/<name>.ova` and drop the loose files.
    async fn export_to_ova(&self, vm: &VmHandle, dir: &Path, name: &str) -> VcenterResult<PathBuf> {
        let export = self.ovf().export_to_ovf(vm, dir, name).await?;
        let ova_path = dir.join(format!("{name}.ova"));
        ova::pack(&ova_path, &export.ovf_path, Some(&export.manifest_path), &export.disk_paths).await?;

        remove_quietly(&export.ovf_path).await;
        remove_quietly(&export.manifest_path).await;
        for disk in &export.disk_paths {
            remove_quietly(disk).await;
        }
        info!("Packed VM '{}' into {}", vm.name, ova_path.display());
        Ok(ova_path)
    }

    /// Unpack next to the archive, import, then drop the unpacked files.
    async fn upload_ova(&self, ova_path: &Path, vm_name: &str, validate_checksums: bool) -> VcenterResult<VmHandle> {
        let stem = ova_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| vm_name.to_string());
        let work = ova_path
            .parent()
            .unwrap_or(Path::new("."))
            .join(format!("{stem}-unpacked"));

        let contents = ova::unpack(ova_path, &work).await?;
        let result = self
            .ovf()
            .upload_ovf_to_vcenter(&contents.ovf_path, vm_name, validate_checksums)
            .await;
        remove_quietly(&work).await;
        result
    }
}
