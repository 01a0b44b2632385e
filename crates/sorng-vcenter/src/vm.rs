//! VM lifecycle: create, power, reconfigure, rename, clone, destroy,
//! guest customization and templates.
//!
//! Every operation validates the session first. Nothing here retries on
//! its own except the post-clone lookup; retries for transient failures
//! belong to the caller.

use crate::config::NicBackingType;
use crate::datastore::{DatastoreFiles, DatastorePath};
use crate::error::{VcenterError, VcenterResult};
use crate::session::SessionManager;
use crate::task::wait_for_task;
use crate::types::*;

use log::{debug, info, warn};
use std::time::Duration;
use tokio::time::Instant;

/// Placeholder guest OS; the deployed image decides what actually runs.
const GUEST_ID: &str = "otherGuest64";

// Temporary keys for devices added in the same config spec.
const NEW_SCSI_KEY: i32 = -100;
const NEW_NIC_KEY: i32 = -200;

const GUEST_IP_POLL: Duration = Duration::from_secs(5);

fn memory_mb(memory_gb: u64) -> VcenterResult<u64> {
    memory_gb
        .checked_mul(1024)
        .ok_or_else(|| VcenterError::config(format!("Memory size {memory_gb} GB is out of range")))
}

/// VM operations bound to one session.
pub struct VmLifecycle<'a> {
    pub(crate) session: &'a SessionManager,
}

impl<'a> VmLifecycle<'a> {
    pub fn new(session: &'a SessionManager) -> Self {
        Self { session }
    }

    pub(crate) async fn run_task(&self, task: VcenterResult<MoRef>) -> VcenterResult<()> {
        let task = task?;
        wait_for_task(self.session.api().as_ref(), &task).await?;
        Ok(())
    }

    /// NIC wired to the configured network.
    pub(crate) async fn network_device(&self) -> VcenterResult<VirtualDevice> {
        let net = &self.session.config().network;
        let backing = match net.backing {
            NicBackingType::Network => NicBacking::Network { device_name: net.name.clone() },
            NicBackingType::DistributedVirtualPortGroup | NicBackingType::DistributedVirtualPort => {
                let pg = self
                    .session
                    .find_network(&net.name)
                    .await?
                    .ok_or_else(|| VcenterError::config(format!("Network '{}' not found", net.name)))?;
                let port = self.session.api().distributed_port_info(&pg.moref).await?;
                NicBacking::Distributed {
                    switch_uuid: port.switch_uuid,
                    portgroup_key: port.portgroup_key,
                    port_key: match net.backing {
                        NicBackingType::DistributedVirtualPort => net.port_key.clone(),
                        _ => None,
                    },
                }
            }
        };
        Ok(VirtualDevice::new(NEW_NIC_KEY, DeviceKind::Nic { backing }))
    }

    // ── Create / destroy ────────────────────────────────────────────

    /// Create an empty VM with one SCSI controller and one NIC.
    pub async fn create_vm(&self, memory_gb: u64, num_cpus: u32, name: &str) -> VcenterResult<VmHandle> {
        let memory_mb = memory_mb(memory_gb)?;
        self.session.validate_connection().await?;
        let placement = self.session.placement().await?;

        let mut scsi = VirtualDevice::new(NEW_SCSI_KEY, DeviceKind::ScsiController { bus_number: 0 });
        scsi.label = Some("SCSI controller 0".into());
        let spec = VmConfigSpec {
            name: Some(name.to_string()),
            memory_mb: Some(memory_mb),
            num_cpus: Some(num_cpus),
            guest_id: Some(GUEST_ID.to_string()),
            files_path: Some(self.session.datastore_path().await),
            device_changes: vec![
                DeviceChange::add(scsi),
                DeviceChange::add(self.network_device().await?),
            ],
        };

        let api = self.session.api();
        self.run_task(api.create_vm(&placement.folder, &placement.pool, placement.host.as_ref(), &spec).await)
            .await
            .map_err(|e| e.context(format!("Failed to create VM '{name}'")))?;

        let vm = self.session.require_vm(name).await?;
        info!("Created VM '{name}' ({}), {memory_gb} GB / {num_cpus} vCPU", vm.moref);
        Ok(vm)
    }

    /// Power off, unregister, then delete the VM's directory.
    pub async fn destroy_vm(&self, vm: &VmHandle) -> VcenterResult<()> {
        self.session.validate_connection().await?;
        self.power_off(vm).await?;

        let api = self.session.api();
        let vmx = api.vm_path_name(&vm.moref).await?;
        let dir = DatastorePath::parse(&vmx)?.parent();
        api.unregister(&vm.moref).await?;
        info!("Unregistered VM '{}'", vm.name);

        if self.session.is_esx_host().await {
            DatastoreFiles::new(self.session).delete(&dir).await?;
        } else {
            let dc = self.session.datacenter_ref().await?;
            self.run_task(api.delete_datastore_file(&dir.to_string(), dc.as_ref()).await)
                .await
                .map_err(|e| e.context(format!("Failed to delete {dir}")))?;
        }
        info!("Destroyed VM '{}' and deleted {dir}", vm.name);
        Ok(())
    }

    // ── Power ───────────────────────────────────────────────────────

    pub async fn power_state(&self, vm: &VmHandle) -> VcenterResult<PowerState> {
        self.session.api().vm_power_state(&vm.moref).await
    }

    /// No-op when already powered on.
    pub async fn power_on(&self, vm: &VmHandle) -> VcenterResult<()> {
        self.session.validate_connection().await?;
        if self.power_state(vm).await? == PowerState::PoweredOn {
            debug!("VM '{}' is already powered on", vm.name);
            return Ok(());
        }
        self.run_task(self.session.api().power_on(&vm.moref).await).await?;
        info!("Powered on VM '{}'", vm.name);
        Ok(())
    }

    /// No-op when already powered off.
    pub async fn power_off(&self, vm: &VmHandle) -> VcenterResult<()> {
        self.session.validate_connection().await?;
        if self.power_state(vm).await? == PowerState::PoweredOff {
            debug!("VM '{}' is already powered off", vm.name);
            return Ok(());
        }
        self.run_task(self.session.api().power_off(&vm.moref).await).await?;
        info!("Powered off VM '{}'", vm.name);
        Ok(())
    }

    // ── Reconfigure / rename / clone ────────────────────────────────

    pub async fn reconfigure_vm_cpu_ram(&self, vm: &VmHandle, memory_gb: u64, num_cpus: u32) -> VcenterResult<()> {
        let memory_mb = memory_mb(memory_gb)?;
        self.session.validate_connection().await?;
        let spec = VmConfigSpec {
            memory_mb: Some(memory_mb),
            num_cpus: Some(num_cpus),
            ..Default::default()
        };
        self.run_task(self.session.api().reconfigure(&vm.moref, &spec).await).await
    }

    /// Rename the VM and its files on the datastore (vCenter only).
    pub async fn rename_vm(&self, vm: &VmHandle, new_name: &str) -> VcenterResult<VmHandle> {
        self.session.validate_connection().await?;
        if self.session.is_esx_host().await {
            return Err(VcenterError::unsupported(
                "rename_vm needs vCenter; it is not supported on a direct ESX host connection",
            ));
        }
        let api = self.session.api();
        let spec = VmConfigSpec { name: Some(new_name.to_string()), ..Default::default() };
        self.run_task(api.reconfigure(&vm.moref, &spec).await).await?;

        // A storage relocation onto the same datastore renames the files.
        let relocate = RelocateSpec {
            datastore: Some(self.session.datastore().await?.moref),
            ..Default::default()
        };
        self.run_task(api.relocate(&vm.moref, &relocate).await).await?;
        info!("Renamed VM '{}' to '{new_name}' (files included)", vm.name);
        Ok(VmHandle { name: new_name.to_string(), moref: vm.moref.clone() })
    }

    /// Rename only the inventory entry; files keep their old names.
    pub async fn change_vm_name(&self, vm: &VmHandle, new_name: &str) -> VcenterResult<VmHandle> {
        self.session.validate_connection().await?;
        self.run_task(self.session.api().rename(&vm.moref, new_name).await).await?;
        info!("Changed VM name '{}' -> '{new_name}'", vm.name);
        Ok(VmHandle { name: new_name.to_string(), moref: vm.moref.clone() })
    }

    /// Full clone next to the source, powered off.
    pub async fn clone_vm(&self, vm: &VmHandle, clone_name: &str) -> VcenterResult<VmHandle> {
        self.session.validate_connection().await?;
        let placement = self.session.placement().await?;
        let spec = CloneSpec {
            location: RelocateSpec {
                datastore: Some(placement.datastore.moref.clone()),
                pool: Some(placement.pool.clone()),
                host: placement.host.clone(),
            },
            power_on: false,
            template: false,
        };
        self.run_task(
            self.session
                .api()
                .clone_vm(&vm.moref, &placement.folder, clone_name, &spec)
                .await,
        )
        .await
        .map_err(|e| e.context(format!("Failed to clone '{}' to '{clone_name}'", vm.name)))?;

        if let Some(handle) = self.session.find_vm(clone_name).await? {
            return Ok(handle);
        }
        // The inventory can lag behind the finished task.
        warn!("Clone '{clone_name}' not visible yet, reconnecting and retrying lookup");
        self.session.reconnect().await?;
        self.session.require_vm(clone_name).await
    }

    /// Apply a static IP. The customization only takes effect after the
    /// VM has been through a power cycle, so one is done first.
    pub async fn configure_static_ip(&self, vm: &VmHandle, spec: &CustomizationSpec) -> VcenterResult<()> {
        self.session.validate_connection().await?;
        self.power_on(vm).await?;
        self.power_off(vm).await?;
        self.run_task(self.session.api().customize(&vm.moref, spec).await)
            .await
            .map_err(|e| e.context(format!("Failed to customize VM '{}'", vm.name)))?;
        info!("Configured static IP {} on VM '{}'", spec.ip, vm.name);
        Ok(())
    }

    // ── Templates / guest ───────────────────────────────────────────

    pub async fn mark_as_template(&self, vm: &VmHandle) -> VcenterResult<()> {
        self.session.validate_connection().await?;
        if self.session.is_esx_host().await {
            return Err(VcenterError::unsupported(
                "Templates need vCenter; not supported on a direct ESX host connection",
            ));
        }
        self.power_off(vm).await?;
        self.session.api().mark_as_template(&vm.moref).await?;
        info!("Marked VM '{}' as template", vm.name);
        Ok(())
    }

    /// Wait for VMware Tools to report a guest IP.
    pub async fn get_vm_ip_address(&self, vm: &VmHandle) -> VcenterResult<String> {
        self.session.validate_connection().await?;
        let limit = Duration::from_secs(self.session.config().ip_wait_timeout_secs);
        let start = Instant::now();
        loop {
            if let Some(ip) = self.session.api().vm_guest_ip(&vm.moref).await? {
                return Ok(ip);
            }
            if start.elapsed() >= limit {
                return Err(VcenterError::timeout(format!(
                    "VM '{}' reported no IP address within {}s",
                    vm.name,
                    limit.as_secs()
                )));
            }
            tokio::time::sleep(GUEST_IP_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VcenterErrorKind;
    use crate::fake::{DiskServer, FakeVim};
    use crate::session::tests::{connected, test_config};
    use std::sync::Arc;

    #[tokio::test]
    async fn create_vm_builds_scsi_and_nic() {
        let fake = Arc::new(FakeVim::vcenter());
        let session = connected(fake.clone(), test_config()).await;
        let vm = VmLifecycle::new(&session).create_vm(4, 2, "VM-A").await.unwrap();

        assert_eq!(vm.name, "VM-A");
        let spec = fake.state.lock().unwrap().created[0].clone();
        assert_eq!(spec.memory_mb, Some(4096));
        assert_eq!(spec.num_cpus, Some(2));
        assert_eq!(spec.guest_id.as_deref(), Some("otherGuest64"));
        assert_eq!(spec.files_path.as_deref(), Some("[ds1] "));
        assert!(spec.device_changes[0].device.is_scsi_controller());
        assert_eq!(
            spec.device_changes[1].device.kind,
            DeviceKind::Nic { backing: NicBacking::Network { device_name: "VM Network".into() } }
        );
    }

    #[tokio::test]
    async fn create_vm_task_error_is_fatal() {
        let fake = Arc::new(FakeVim::vcenter());
        let session = connected(fake.clone(), test_config()).await;
        fake.fail_task("create_vm", "The name 'VM-A' already exists.");

        let err = VmLifecycle::new(&session).create_vm(1, 1, "VM-A").await.unwrap_err();
        assert_eq!(err.kind, VcenterErrorKind::TaskError);
        assert!(err.message.contains("already exists"));
    }

    #[tokio::test]
    async fn oversized_memory_is_rejected_before_any_call() {
        let fake = Arc::new(FakeVim::vcenter());
        let session = connected(fake.clone(), test_config()).await;
        let vm = fake.add_vm("VM-A", PowerState::PoweredOff, vec![]);
        let ops = VmLifecycle::new(&session);

        let err = ops.create_vm(u64::MAX, 1, "VM-B").await.unwrap_err();
        assert_eq!(err.kind, VcenterErrorKind::ConfigError);
        let err = ops.reconfigure_vm_cpu_ram(&vm, u64::MAX / 512, 2).await.unwrap_err();
        assert_eq!(err.kind, VcenterErrorKind::ConfigError);

        assert!(fake.state.lock().unwrap().created.is_empty());
        assert_eq!(fake.count("reconfigure"), 0);
    }

    #[tokio::test]
    async fn distributed_port_backing_sets_port_key() {
        let fake = Arc::new(FakeVim::vcenter());
        fake.add_object(InventoryKind::DistributedVirtualPortgroup, "dv-pg", "dvportgroup-7");
        fake.state.lock().unwrap().distributed = Some(DistributedPortInfo {
            switch_uuid: "50 2a 11".into(),
            portgroup_key: "dvportgroup-7".into(),
        });
        let mut cfg = test_config();
        cfg.network.name = "dv-pg".into();
        cfg.network.backing = NicBackingType::DistributedVirtualPort;
        cfg.network.port_key = Some("12".into());
        let session = connected(fake, cfg).await;

        let nic = VmLifecycle::new(&session).network_device().await.unwrap();
        assert_eq!(
            nic.kind,
            DeviceKind::Nic {
                backing: NicBacking::Distributed {
                    switch_uuid: "50 2a 11".into(),
                    portgroup_key: "dvportgroup-7".into(),
                    port_key: Some("12".into()),
                }
            }
        );
    }

    #[tokio::test]
    async fn power_operations_are_idempotent() {
        let fake = Arc::new(FakeVim::vcenter());
        let vm = fake.add_vm("VM-A", PowerState::PoweredOn, vec![]);
        let session = connected(fake.clone(), test_config()).await;
        let life = VmLifecycle::new(&session);

        life.power_on(&vm).await.unwrap();
        life.power_on(&vm).await.unwrap();
        assert_eq!(fake.count("power_on"), 0);

        life.power_off(&vm).await.unwrap();
        life.power_off(&vm).await.unwrap();
        assert_eq!(fake.count("power_off"), 1);
        assert_eq!(fake.vm(&vm).power, PowerState::PoweredOff);
    }

    #[tokio::test]
    async fn destroy_on_vcenter_orders_steps() {
        let fake = Arc::new(FakeVim::vcenter());
        let vm = fake.add_vm("VM-A", PowerState::PoweredOn, vec![]);
        let session = connected(fake.clone(), test_config()).await;

        VmLifecycle::new(&session).destroy_vm(&vm).await.unwrap();

        assert_eq!(
            fake.sequence(&["power_off", "unregister", "delete_datastore_file"]),
            vec!["power_off", "unregister", "delete_datastore_file"]
        );
        assert!(fake.calls().contains(&"delete_datastore_file:[ds1] VM-A".to_string()));
        assert_eq!(session.find_vm("VM-A").await.unwrap(), None);
    }

    #[tokio::test]
    async fn destroy_on_esx_deletes_folder_over_http() {
        let server = DiskServer::start().await;
        let fake = Arc::new(FakeVim::esx());
        let vm = fake.add_vm("VM-B", PowerState::PoweredOff, vec![]);
        let mut cfg = test_config();
        cfg.host = server.url("");
        let session = connected(fake.clone(), cfg).await;

        VmLifecycle::new(&session).destroy_vm(&vm).await.unwrap();

        assert_eq!(fake.count("power_off"), 0);
        assert_eq!(fake.count("delete_datastore_file"), 0);
        assert_eq!(server.deletes(), vec!["VM-B".to_string()]);
    }

    #[tokio::test]
    async fn rename_vm_is_unsupported_on_esx() {
        let fake = Arc::new(FakeVim::esx());
        let vm = fake.add_vm("VM-A", PowerState::PoweredOff, vec![]);
        let session = connected(fake.clone(), test_config()).await;

        let err = VmLifecycle::new(&session).rename_vm(&vm, "VM-B").await.unwrap_err();
        assert_eq!(err.kind, VcenterErrorKind::Unsupported);
        assert_eq!(fake.count("reconfigure"), 0);
    }

    #[tokio::test]
    async fn rename_vm_relocates_but_change_name_does_not() {
        let fake = Arc::new(FakeVim::vcenter());
        let vm = fake.add_vm("VM-A", PowerState::PoweredOff, vec![]);
        let session = connected(fake.clone(), test_config()).await;
        let life = VmLifecycle::new(&session);

        let vm = life.rename_vm(&vm, "VM-B").await.unwrap();
        assert_eq!(fake.count("relocate"), 1);
        assert_eq!(
            fake.state.lock().unwrap().relocations[0].datastore,
            Some(MoRef::new("Datastore", "datastore-1"))
        );

        let vm = life.change_vm_name(&vm, "VM-C").await.unwrap();
        assert_eq!(fake.count("rename"), 1);
        assert_eq!(fake.count("relocate"), 1);
        assert_eq!(session.find_vm("VM-C").await.unwrap(), Some(vm));
    }

    #[tokio::test]
    async fn clone_lookup_retries_after_reconnect() {
        let fake = Arc::new(FakeVim::vcenter());
        let vm = fake.add_vm("VM-A", PowerState::PoweredOff, vec![]);
        fake.hide_vm("VM-A-clone", 1);
        let session = connected(fake.clone(), test_config()).await;

        let clone = VmLifecycle::new(&session).clone_vm(&vm, "VM-A-clone").await.unwrap();
        assert_eq!(clone.name, "VM-A-clone");
        assert_eq!(fake.count("login"), 2);
    }

    #[tokio::test]
    async fn clone_lookup_gives_up_after_one_reconnect() {
        let fake = Arc::new(FakeVim::vcenter());
        let vm = fake.add_vm("VM-A", PowerState::PoweredOff, vec![]);
        fake.hide_vm("VM-A-clone", 5);
        let session = connected(fake.clone(), test_config()).await;

        let err = VmLifecycle::new(&session).clone_vm(&vm, "VM-A-clone").await.unwrap_err();
        assert_eq!(err.kind, VcenterErrorKind::NotFound);
        assert_eq!(fake.count("login"), 2);
    }

    #[tokio::test]
    async fn static_ip_power_cycles_before_customizing() {
        let fake = Arc::new(FakeVim::vcenter());
        let vm = fake.add_vm("VM-A", PowerState::PoweredOff, vec![]);
        let session = connected(fake.clone(), test_config()).await;
        let spec = CustomizationSpec {
            hostname: "web1".into(),
            ip: "10.0.0.5".into(),
            subnet_mask: "255.255.255.0".into(),
            ..Default::default()
        };

        VmLifecycle::new(&session).configure_static_ip(&vm, &spec).await.unwrap();

        assert_eq!(
            fake.sequence(&["power_on", "power_off", "customize"]),
            vec!["power_on", "power_off", "customize"]
        );
    }

    #[tokio::test]
    async fn template_unsupported_on_esx() {
        let fake = Arc::new(FakeVim::esx());
        let vm = fake.add_vm("VM-A", PowerState::PoweredOff, vec![]);
        let session = connected(fake.clone(), test_config()).await;
        let err = VmLifecycle::new(&session).mark_as_template(&vm).await.unwrap_err();
        assert_eq!(err.kind, VcenterErrorKind::Unsupported);
        assert_eq!(fake.count("mark_as_template"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn guest_ip_is_polled() {
        let fake = Arc::new(FakeVim::vcenter());
        let vm = fake.add_vm("VM-A", PowerState::PoweredOn, vec![]);
        {
            let mut st = fake.state.lock().unwrap();
            st.guest_ip_misses = 2;
            st.vms.get_mut(&vm.moref.value).unwrap().guest_ip = Some("10.0.0.9".into());
        }
        let session = connected(fake.clone(), test_config()).await;

        let ip = VmLifecycle::new(&session).get_vm_ip_address(&vm).await.unwrap();
        assert_eq!(ip, "10.0.0.9");
        assert_eq!(fake.count("vm_guest_ip"), 3);
    }
}
