//! OVF export and import over HTTP NFC leases.

use crate::error::{VcenterError, VcenterResult};
use crate::lease::LeaseController;
use crate::manifest::ManifestChecksums;
use crate::ovf;
use crate::retry::{is_transient, RetryPolicy};
use crate::session::SessionManager;
use crate::types::*;
use crate::vim::device_change_json;
use crate::vm::VmLifecycle;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Files written by [`OvfTransfer::export_to_ovf`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub ovf_path: PathBuf,
    pub disk_paths: Vec<PathBuf>,
    pub manifest_path: PathBuf,
}

/// Lease URLs from a host that does not know its own name use `*`.
pub fn rewrite_placeholder_host(url: &str, host: &str) -> String {
    match url.split_once("://*") {
        Some((scheme, rest)) => format!("{scheme}://{host}{rest}"),
        None => url.to_string(),
    }
}

fn url_file_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}

pub struct OvfTransfer<'a> {
    session: &'a SessionManager,
}

impl<'a> OvfTransfer<'a> {
    pub fn new(session: &'a SessionManager) -> Self {
        Self { session }
    }

    /// Configured host without any scheme, for `*` placeholders.
    fn transfer_host(&self) -> &str {
        let host = self.session.config().host.as_str();
        host.split_once("://").map(|(_, h)| h).unwrap_or(host).trim_end_matches('/')
    }

    // ── Export ──────────────────────────────────────────────────────

    /// Download a VM's disks into `dir` and write `<name>.ovf` plus a
    /// `<name>-brkt.mf` manifest next to them.
    pub async fn export_to_ovf(&self, vm: &VmHandle, dir: &Path, name: &str) -> VcenterResult<ExportResult> {
        self.session.validate_connection().await?;
        tokio::fs::create_dir_all(dir).await?;

        let api = Arc::clone(self.session.api());
        let lease_ref = api
            .export_vm(&vm.moref)
            .await
            .map_err(|e| e.context("Failed to get lease to export OVF"))?;
        let ctl = LeaseController::acquire(Arc::clone(&api), lease_ref, self.session.config())
            .await
            .map_err(|e| e.context("Failed to get lease to export OVF"))?;

        let headers = api.transfer_headers().await;
        let transport = self.session.transport();
        let host = self.transfer_host();
        let api_ref = &api;

        let (descriptor, disk_paths) = ctl
            .run(|lease| async move {
                let mut ovf_files = Vec::new();
                let mut paths = Vec::new();
                for (i, dev) in lease.device_urls.iter().enumerate() {
                    if !dev.disk {
                        debug!("Skipping non-disk device URL {}", dev.url);
                        continue;
                    }
                    let file_name = dev
                        .target_id
                        .clone()
                        .unwrap_or_else(|| format!("{name}-disk{}.vmdk", i + 1));
                    let path = dir.join(&file_name);
                    let url = rewrite_placeholder_host(&dev.url, host);
                    let size = transport.download_to_file(&url, &path, &headers).await?;
                    info!("Exported {file_name} ({size} bytes)");
                    ovf_files.push(OvfFile { device_id: dev.key.clone(), path: file_name, size });
                    paths.push(path);
                }
                let params = CreateDescriptorParams {
                    name: name.to_string(),
                    description: String::new(),
                    ovf_files,
                };
                let descriptor = api_ref.create_descriptor(&vm.moref, &params).await?;
                Ok((descriptor, paths))
            })
            .await?;

        let ovf_path = dir.join(format!("{name}.ovf"));
        tokio::fs::write(&ovf_path, descriptor).await?;

        let mut hashed = vec![ovf_path.clone()];
        hashed.extend(disk_paths.iter().cloned());
        let manifest_path = dir.join(format!("{name}-brkt.mf"));
        ManifestChecksums::generate(&hashed).await?.write(&manifest_path).await?;

        info!("Exported VM '{}' to {}", vm.name, ovf_path.display());
        Ok(ExportResult { ovf_path, disk_paths, manifest_path })
    }

    // ── Import ──────────────────────────────────────────────────────

    async fn verified_manifest(&self, ovf_path: &Path, descriptor: &str) -> VcenterResult<ManifestChecksums> {
        let dir = ovf_path.parent().unwrap_or(Path::new("."));
        let base = ovf_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mf_path = ManifestChecksums::locate(dir, &base).ok_or_else(|| {
            VcenterError::checksum(format!("No manifest found for {}", ovf_path.display()))
        })?;
        let manifest = ManifestChecksums::load(&mf_path).await?;

        let files = ovf::referenced_files(descriptor)?;
        manifest.ensure_covers(files.iter().map(String::as_str))?;
        for file in &files {
            manifest.verify_file(&dir.join(file)).await?;
        }
        info!("Verified {} file(s) against {}", files.len(), mf_path.display());
        Ok(manifest)
    }

    /// Deploy `ovf_path` as a new VM named `vm_name`.
    ///
    /// With `validate_checksums` every referenced file is hashed against
    /// the manifest before anything is sent to the server. A VM left
    /// behind by a failed upload is destroyed before the error is returned.
    pub async fn upload_ovf_to_vcenter(
        &self,
        ovf_path: &Path,
        vm_name: &str,
        validate_checksums: bool,
    ) -> VcenterResult<VmHandle> {
        let descriptor = tokio::fs::read_to_string(ovf_path)
            .await
            .map_err(|e| VcenterError::from(e).context(format!("Failed to read {}", ovf_path.display())))?;
        if validate_checksums {
            self.verified_manifest(ovf_path, &descriptor).await?;
        }

        self.session.validate_connection().await?;
        let config = self.session.config();
        let is_esx = self.session.is_esx_host().await;
        let descriptor = ovf::strip_descriptor(&descriptor, is_esx)?;
        let placement = self.session.placement().await?;

        let api = Arc::clone(self.session.api());
        let params = ImportSpecParams {
            entity_name: vm_name.to_string(),
            disk_provisioning: config.disk_provisioning().to_string(),
            host: placement.host.clone(),
        };
        let ImportSpecResult { import_spec, file_items, errors, warnings } = api
            .create_import_spec(&descriptor, &placement.pool, &placement.datastore.moref, &params)
            .await?;
        if !errors.is_empty() {
            return Err(VcenterError::fault(format!(
                "Failed to create import spec: {}",
                errors.join("; ")
            )));
        }
        for w in &warnings {
            warn!("Import spec warning for '{vm_name}': {w}");
        }
        let mut spec = import_spec.ok_or_else(|| VcenterError::config("Server returned no import spec"))?;

        let lifecycle = VmLifecycle::new(self.session);
        let nic = lifecycle.network_device().await?;
        ovf::inject_nic(&mut spec, device_change_json(&DeviceChange::add(nic)))?;

        let lease_ref = api
            .import_vapp(&placement.pool, &spec, Some(&placement.folder), placement.host.as_ref())
            .await
            .map_err(|e| e.context("Failed to get lease to upload OVF"))?;
        let ctl = LeaseController::acquire(Arc::clone(&api), lease_ref, config)
            .await
            .map_err(|e| e.context("Failed to get lease to upload OVF"))?;
        let entity = ctl.lease().entity.clone();

        let dir = ovf_path.parent().unwrap_or(Path::new("."));
        let headers = api.transfer_headers().await;
        let transport = self.session.transport();
        let host = self.transfer_host();
        let retry = RetryPolicy::for_upload(config);
        let file_items = &file_items;

        let outcome = ctl
            .run(|lease| async move {
                for dev in &lease.device_urls {
                    let expected = file_items
                        .iter()
                        .find(|f| dev.import_key.as_deref() == Some(f.device_id.as_str()))
                        .map(|f| dir.join(&f.path));
                    let local = match expected {
                        Some(p) if p.is_file() => p,
                        _ => dir.join(url_file_name(&dev.url)),
                    };
                    if !local.is_file() {
                        return Err(VcenterError::transfer(format!(
                            "No local file for device {} (looked for {})",
                            dev.key,
                            local.display()
                        )));
                    }
                    let url = rewrite_placeholder_host(&dev.url, host);
                    let what = format!("upload {}", local.display());
                    retry
                        .execute(&what, || transport.upload_file(&url, &local, &headers), is_transient)
                        .await?;
                    info!("Uploaded {}", local.display());
                }
                Ok(())
            })
            .await;

        if let Err(e) = outcome {
            if let Some(moref) = entity {
                let partial = VmHandle { name: vm_name.to_string(), moref };
                if let Err(cleanup) = lifecycle.destroy_vm(&partial).await {
                    warn!("Could not destroy partially imported VM '{vm_name}': {cleanup}");
                }
            }
            return Err(e);
        }

        let vm = match entity {
            Some(moref) => VmHandle { name: vm_name.to_string(), moref },
            None => self.session.require_vm(vm_name).await?,
        };
        info!("Imported {} as VM '{vm_name}'", ovf_path.display());
        Ok(vm)
    }
}
