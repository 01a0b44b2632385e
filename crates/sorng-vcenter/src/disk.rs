//! Disk and serial-port operations on [`VmLifecycle`].

use crate::error::{VcenterError, VcenterResult};
use crate::types::*;
use crate::vm::VmLifecycle;

use log::{debug, info};

/// Unit 7 on a SCSI bus is the controller itself.
const SCSI_CONTROLLER_UNIT: i32 = 7;
const SCSI_UNITS: i32 = 16;

const NEW_DISK_KEY: i32 = -300;
const NEW_SERIAL_KEY: i32 = -400;

fn first_free_unit(devices: &[VirtualDevice], controller_key: i32) -> Option<i32> {
    (0..SCSI_UNITS)
        .filter(|u| *u != SCSI_CONTROLLER_UNIT)
        .find(|u| {
            !devices
                .iter()
                .any(|d| d.controller_key == Some(controller_key) && d.unit_number == Some(*u))
        })
}

/// Size in KB from a summary such as `"10,240 KB"`.
fn summary_kb(summary: &str) -> Option<u64> {
    summary.split_whitespace().next()?.replace(',', "").parse().ok()
}

impl<'a> VmLifecycle<'a> {
    async fn devices(&self, vm: &VmHandle) -> VcenterResult<Vec<VirtualDevice>> {
        self.session.api().vm_devices(&vm.moref).await
    }

    async fn edit_devices(&self, vm: &VmHandle, changes: Vec<DeviceChange>) -> VcenterResult<()> {
        let spec = VmConfigSpec { device_changes: changes, ..Default::default() };
        self.run_task(self.session.api().reconfigure(&vm.moref, &spec).await).await
    }

    /// Attach a disk and return the unit number it landed on.
    ///
    /// Without `spec.file_path` a new backing file is created next to the VM.
    pub async fn add_disk(&self, vm: &VmHandle, spec: &DiskSpec) -> VcenterResult<i32> {
        self.session.validate_connection().await?;
        let devices = self.devices(vm).await?;

        let controller_key = match spec.controller_key {
            Some(key) => key,
            None => devices
                .iter()
                .find(|d| d.is_scsi_controller())
                .map(|d| d.key)
                .ok_or_else(|| VcenterError::config(format!("No SCSI controller found on VM '{}'", vm.name)))?,
        };
        let unit = match spec.unit_number {
            Some(u) => u,
            None => first_free_unit(&devices, controller_key).ok_or_else(|| {
                VcenterError::config(format!("No free unit on SCSI controller {controller_key} of VM '{}'", vm.name))
            })?,
        };

        let mut disk = VirtualDevice::new(
            NEW_DISK_KEY,
            DeviceKind::Disk {
                file_name: spec.file_path.clone().unwrap_or_default(),
                thin: spec.thin,
                eager_scrub: spec.eager_scrub,
                capacity_kb: spec.size_kb,
            },
        );
        disk.controller_key = Some(controller_key);
        disk.unit_number = Some(unit);

        let mut change = DeviceChange::add(disk);
        if spec.file_path.is_none() {
            change = change.with_file_operation(FileOperation::Create);
        }
        self.edit_devices(vm, vec![change])
            .await
            .map_err(|e| e.context(format!("Failed to add disk to VM '{}'", vm.name)))?;
        info!("Added {} KB disk to VM '{}' at unit {unit}", spec.size_kb, vm.name);
        Ok(unit)
    }

    /// Remove the disk at `unit` from the VM, leaving its file in place.
    pub async fn detach_disk(&self, vm: &VmHandle, unit: i32) -> VcenterResult<()> {
        self.session.validate_connection().await?;
        let disk = self.get_disk(vm, unit).await?.ok_or_else(|| {
            VcenterError::not_found(format!("No disk at unit {unit} on VM '{}'", vm.name))
        })?;
        self.edit_devices(vm, vec![DeviceChange::remove(disk)]).await?;
        info!("Detached disk at unit {unit} from VM '{}'", vm.name);
        Ok(())
    }

    pub async fn clone_disk(&self, source: &str, dest: &str) -> VcenterResult<()> {
        self.session.validate_connection().await?;
        let dc = self.session.datacenter_ref().await?;
        self.run_task(self.session.api().copy_virtual_disk(source, dest, dc.as_ref()).await)
            .await
            .map_err(|e| e.context(format!("Failed to copy {source} to {dest}")))?;
        info!("Copied disk {source} -> {dest}");
        Ok(())
    }

    pub async fn delete_disk(&self, path: &str) -> VcenterResult<()> {
        self.session.validate_connection().await?;
        let dc = self.session.datacenter_ref().await?;
        self.run_task(self.session.api().delete_virtual_disk(path, dc.as_ref()).await)
            .await
            .map_err(|e| e.context(format!("Failed to delete disk {path}")))?;
        info!("Deleted disk {path}");
        Ok(())
    }

    /// Disk at `unit`, or `None`.
    pub async fn get_disk(&self, vm: &VmHandle, unit: i32) -> VcenterResult<Option<VirtualDevice>> {
        self.session.validate_connection().await?;
        Ok(self
            .devices(vm)
            .await?
            .into_iter()
            .find(|d| d.is_disk() && d.unit_number == Some(unit)))
    }

    /// Capacity in KB of the disk at `unit`. Unlike [`get_disk`](Self::get_disk)
    /// a missing disk is an error.
    pub async fn get_disk_size(&self, vm: &VmHandle, unit: i32) -> VcenterResult<u64> {
        let disk = self.get_disk(vm, unit).await?.ok_or_else(|| {
            VcenterError::not_found(format!("No disk at unit {unit} on VM '{}'", vm.name))
        })?;
        let from_summary = disk.summary.as_deref().and_then(summary_kb);
        match (from_summary, &disk.kind) {
            (Some(kb), _) => Ok(kb),
            (None, DeviceKind::Disk { capacity_kb, .. }) => Ok(*capacity_kb),
            (None, _) => Err(VcenterError::parse(format!("Cannot read size of disk at unit {unit}"))),
        }
    }

    // ── Serial ports ────────────────────────────────────────────────

    /// Attach a serial port writing to a datastore file (`[ds] dir/file`).
    pub async fn add_serial_port_to_file(&self, vm: &VmHandle, file_path: &str) -> VcenterResult<()> {
        self.session.validate_connection().await?;
        let port = VirtualDevice::new(NEW_SERIAL_KEY, DeviceKind::Serial { file_name: file_path.to_string() });
        self.edit_devices(vm, vec![DeviceChange::add(port)]).await?;
        info!("Attached serial port -> {file_path} on VM '{}'", vm.name);
        Ok(())
    }

    pub async fn delete_serial_port_to_file(&self, vm: &VmHandle, file_path: &str) -> VcenterResult<()> {
        self.session.validate_connection().await?;
        let port = self.devices(vm).await?.into_iter().find(|d| {
            matches!(&d.kind, DeviceKind::Serial { file_name } if file_name == file_path)
        });
        let Some(port) = port else {
            debug!("VM '{}' has no serial port on {file_path}", vm.name);
            return Ok(());
        };
        self.edit_devices(vm, vec![DeviceChange::remove(port)]).await?;
        info!("Removed serial port -> {file_path} from VM '{}'", vm.name);
        Ok(())
    }
}
