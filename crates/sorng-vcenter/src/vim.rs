//! Remote management API.
//!
//! [`VimApi`] is the call surface the orchestration layer needs from a
//! vCenter / ESXi endpoint. [`VimJsonClient`] implements it over the
//! vSphere VI/JSON protocol:
//! `https://{host}:{port}/sdk/vim25/{release}/{MoType}/{moId}/{method|property}`.
//! Methods are POSTs with a JSON body, properties are GETs, and the
//! session travels in the `vmware-api-session-id` header.

use crate::config::VcenterConfig;
use crate::error::{VcenterError, VcenterResult};
use crate::transport::body_excerpt;
use crate::types::*;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::sync::RwLock;

const SESSION_HEADER: &str = "vmware-api-session-id";

/// Operations used against the management endpoint.
///
/// Task-returning operations hand back the `Task` reference; callers wait
/// on it with [`wait_for_task`](crate::task::wait_for_task).
#[async_trait]
pub trait VimApi: Send + Sync {
    // ── Session ─────────────────────────────────────────────────────
    async fn login(&self, username: &str, password: &str) -> VcenterResult<()>;
    async fn logout(&self) -> VcenterResult<()>;
    async fn about(&self) -> VcenterResult<AboutInfo>;
    /// Cheap authenticated read used to probe the session.
    async fn current_time(&self) -> VcenterResult<String>;
    /// Headers that authorise raw transfers against lease / datastore URLs.
    async fn transfer_headers(&self) -> Vec<(String, String)>;

    // ── Inventory ───────────────────────────────────────────────────
    /// Enumerate every object of `kind` under the root folder, in server order.
    async fn list_objects(&self, kind: InventoryKind) -> VcenterResult<Vec<InventoryObject>>;
    async fn resource_pool_of(&self, compute: &MoRef) -> VcenterResult<MoRef>;
    async fn vm_folder_of(&self, datacenter: &MoRef) -> VcenterResult<MoRef>;
    async fn distributed_port_info(&self, portgroup: &MoRef) -> VcenterResult<DistributedPortInfo>;

    // ── VM properties ───────────────────────────────────────────────
    async fn vm_power_state(&self, vm: &MoRef) -> VcenterResult<PowerState>;
    async fn vm_devices(&self, vm: &MoRef) -> VcenterResult<Vec<VirtualDevice>>;
    /// `[datastore] dir/name.vmx`
    async fn vm_path_name(&self, vm: &MoRef) -> VcenterResult<String>;
    async fn vm_guest_ip(&self, vm: &MoRef) -> VcenterResult<Option<String>>;

    // ── VM tasks ────────────────────────────────────────────────────
    async fn create_vm(
        &self,
        folder: &MoRef,
        pool: &MoRef,
        host: Option<&MoRef>,
        spec: &VmConfigSpec,
    ) -> VcenterResult<MoRef>;
    async fn power_on(&self, vm: &MoRef) -> VcenterResult<MoRef>;
    async fn power_off(&self, vm: &MoRef) -> VcenterResult<MoRef>;
    async fn reconfigure(&self, vm: &MoRef, spec: &VmConfigSpec) -> VcenterResult<MoRef>;
    async fn relocate(&self, vm: &MoRef, spec: &RelocateSpec) -> VcenterResult<MoRef>;
    async fn rename(&self, vm: &MoRef, new_name: &str) -> VcenterResult<MoRef>;
    async fn clone_vm(&self, vm: &MoRef, folder: &MoRef, name: &str, spec: &CloneSpec) -> VcenterResult<MoRef>;
    async fn customize(&self, vm: &MoRef, spec: &CustomizationSpec) -> VcenterResult<MoRef>;
    async fn mark_as_template(&self, vm: &MoRef) -> VcenterResult<()>;
    async fn unregister(&self, vm: &MoRef) -> VcenterResult<()>;

    // ── Files / disks ───────────────────────────────────────────────
    async fn delete_datastore_file(&self, path: &str, datacenter: Option<&MoRef>) -> VcenterResult<MoRef>;
    async fn copy_virtual_disk(&self, source: &str, dest: &str, datacenter: Option<&MoRef>) -> VcenterResult<MoRef>;
    async fn delete_virtual_disk(&self, path: &str, datacenter: Option<&MoRef>) -> VcenterResult<MoRef>;

    async fn task_info(&self, task: &MoRef) -> VcenterResult<TaskInfo>;

    // ── OVF / leases ────────────────────────────────────────────────
    async fn export_vm(&self, vm: &MoRef) -> VcenterResult<MoRef>;
    async fn create_descriptor(&self, vm: &MoRef, params: &CreateDescriptorParams) -> VcenterResult<String>;
    async fn create_import_spec(
        &self,
        descriptor: &str,
        pool: &MoRef,
        datastore: &MoRef,
        params: &ImportSpecParams,
    ) -> VcenterResult<ImportSpecResult>;
    async fn import_vapp(
        &self,
        pool: &MoRef,
        spec: &Value,
        folder: Option<&MoRef>,
        host: Option<&MoRef>,
    ) -> VcenterResult<MoRef>;
    async fn lease_state(&self, lease: &MoRef) -> VcenterResult<LeaseState>;
    async fn lease_error(&self, lease: &MoRef) -> VcenterResult<Option<String>>;
    async fn lease_info(&self, lease: &MoRef) -> VcenterResult<LeaseInfo>;
    async fn lease_progress(&self, lease: &MoRef, percent: u8) -> VcenterResult<()>;
    async fn lease_complete(&self, lease: &MoRef) -> VcenterResult<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  VI/JSON client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceContent {
    root_folder: MoRef,
    session_manager: MoRef,
    view_manager: MoRef,
    #[serde(default)]
    file_manager: Option<MoRef>,
    #[serde(default)]
    virtual_disk_manager: Option<MoRef>,
    #[serde(default)]
    ovf_manager: Option<MoRef>,
    #[serde(default)]
    about: AboutInfo,
}

/// `VimApi` over HTTPS + JSON.
pub struct VimJsonClient {
    client: Client,
    base_url: String,
    session_id: RwLock<Option<String>>,
    content: RwLock<Option<ServiceContent>>,
}

impl VimJsonClient {
    pub fn new(config: &VcenterConfig) -> VcenterResult<Self> {
        let base_url = format!(
            "https://{}:{}/sdk/vim25/{}",
            config.host, config.port, config.api_release
        );
        Self::with_base_url(config, base_url)
    }

    /// Same as [`new`](Self::new) with an explicit `.../sdk/vim25/{release}` root.
    pub fn with_base_url(config: &VcenterConfig, base_url: impl Into<String>) -> VcenterResult<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| VcenterError::connection(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_id: RwLock::new(None),
            content: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn mo_url(&self, mo: &MoRef, tail: &str) -> String {
        format!("{}/{}/{}/{}", self.base_url, mo.kind, mo.value, tail)
    }

    async fn content(&self) -> VcenterResult<ServiceContent> {
        if let Some(c) = self.content.read().await.as_ref() {
            return Ok(c.clone());
        }
        let url = format!("{}/ServiceInstance/ServiceInstance/content", self.base_url);
        let resp = check_response(self.client.get(&url).send().await?).await?;
        let content: ServiceContent = resp.json().await?;
        *self.content.write().await = Some(content.clone());
        Ok(content)
    }

    async fn require_session(&self) -> VcenterResult<String> {
        self.session_id
            .read()
            .await
            .clone()
            .ok_or_else(|| VcenterError::not_connected("No active API session"))
    }

    /// Invoke a managed-object method.
    async fn invoke(&self, mo: &MoRef, method: &str, body: Option<Value>) -> VcenterResult<Value> {
        let sid = self.require_session().await?;
        let mut req = self
            .client
            .post(self.mo_url(mo, method))
            .header(SESSION_HEADER, sid);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = check_response(req.send().await?).await?;
        parse_body(resp).await
    }

    /// Read a managed-object property.
    async fn property(&self, mo: &MoRef, name: &str) -> VcenterResult<Value> {
        let sid = self.require_session().await?;
        let resp = self
            .client
            .get(self.mo_url(mo, name))
            .header(SESSION_HEADER, sid)
            .send()
            .await?;
        parse_body(check_response(resp).await?).await
    }

    async fn invoke_task(&self, mo: &MoRef, method: &str, body: Option<Value>) -> VcenterResult<MoRef> {
        let v = self.invoke(mo, method, body).await?;
        Ok(serde_json::from_value(v)?)
    }

    async fn manager(&self, pick: fn(&ServiceContent) -> Option<MoRef>, what: &str) -> VcenterResult<MoRef> {
        let content = self.content().await?;
        pick(&content).ok_or_else(|| VcenterError::unsupported(format!("Endpoint has no {what}")))
    }

    async fn view_objects(&self, view: &MoRef) -> VcenterResult<Vec<InventoryObject>> {
        let refs: Vec<MoRef> = serde_json::from_value(self.property(view, "view").await?)?;
        let mut out = Vec::with_capacity(refs.len());
        for moref in refs {
            let name = self
                .property(&moref, "name")
                .await?
                .as_str()
                .unwrap_or_default()
                .to_string();
            out.push(InventoryObject { name, moref });
        }
        Ok(out)
    }
}

#[async_trait]
impl VimApi for VimJsonClient {
    async fn login(&self, username: &str, password: &str) -> VcenterResult<()> {
        let content = self.content().await?;
        let resp = self
            .client
            .post(self.mo_url(&content.session_manager, "Login"))
            .json(&json!({ "userName": username, "password": password }))
            .send()
            .await?;
        let resp = check_response(resp).await?;
        let sid = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| VcenterError::auth("Login response carried no session id"))?;
        *self.session_id.write().await = Some(sid);
        Ok(())
    }

    async fn logout(&self) -> VcenterResult<()> {
        if self.session_id.read().await.is_none() {
            return Ok(());
        }
        let content = self.content().await?;
        let result = self.invoke(&content.session_manager, "Logout", None).await;
        *self.session_id.write().await = None;
        result.map(|_| ())
    }

    async fn about(&self) -> VcenterResult<AboutInfo> {
        Ok(self.content().await?.about)
    }

    async fn current_time(&self) -> VcenterResult<String> {
        let si = MoRef::new("ServiceInstance", "ServiceInstance");
        let v = self.invoke(&si, "CurrentTime", None).await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }

    async fn transfer_headers(&self) -> Vec<(String, String)> {
        match self.session_id.read().await.as_ref() {
            Some(sid) => vec![
                (SESSION_HEADER.to_string(), sid.clone()),
                ("Cookie".to_string(), format!("vmware_soap_session=\"{sid}\"")),
            ],
            None => Vec::new(),
        }
    }

    async fn list_objects(&self, kind: InventoryKind) -> VcenterResult<Vec<InventoryObject>> {
        let content = self.content().await?;
        let view: MoRef = serde_json::from_value(
            self.invoke(
                &content.view_manager,
                "CreateContainerView",
                Some(json!({
                    "container": content.root_folder.to_json(),
                    "type": [kind.vim_type()],
                    "recursive": true,
                })),
            )
            .await?,
        )?;
        let result = self.view_objects(&view).await;
        if let Err(e) = self.invoke(&view, "DestroyView", None).await {
            debug!("Failed to destroy container view {view}: {e}");
        }
        result
    }

    async fn resource_pool_of(&self, compute: &MoRef) -> VcenterResult<MoRef> {
        Ok(serde_json::from_value(self.property(compute, "resourcePool").await?)?)
    }

    async fn vm_folder_of(&self, datacenter: &MoRef) -> VcenterResult<MoRef> {
        Ok(serde_json::from_value(self.property(datacenter, "vmFolder").await?)?)
    }

    async fn distributed_port_info(&self, portgroup: &MoRef) -> VcenterResult<DistributedPortInfo> {
        let config = self.property(portgroup, "config").await?;
        let portgroup_key = config["key"]
            .as_str()
            .ok_or_else(|| VcenterError::parse(format!("Port group {portgroup} has no key")))?
            .to_string();
        let switch: MoRef = serde_json::from_value(config["distributedVirtualSwitch"].clone())?;
        let switch_uuid = self
            .property(&switch, "uuid")
            .await?
            .as_str()
            .ok_or_else(|| VcenterError::parse(format!("Switch {switch} has no uuid")))?
            .to_string();
        Ok(DistributedPortInfo { switch_uuid, portgroup_key })
    }

    async fn vm_power_state(&self, vm: &MoRef) -> VcenterResult<PowerState> {
        let runtime = self.property(vm, "runtime").await?;
        let raw = runtime["powerState"].as_str().unwrap_or_default();
        PowerState::from_vim(raw)
            .ok_or_else(|| VcenterError::parse(format!("Unknown power state '{raw}' for {vm}")))
    }

    async fn vm_devices(&self, vm: &MoRef) -> VcenterResult<Vec<VirtualDevice>> {
        let config = self.property(vm, "config").await?;
        Ok(config["hardware"]["device"]
            .as_array()
            .map(|devs| devs.iter().filter_map(parse_device).collect())
            .unwrap_or_default())
    }

    async fn vm_path_name(&self, vm: &MoRef) -> VcenterResult<String> {
        let config = self.property(vm, "config").await?;
        config["files"]["vmPathName"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| VcenterError::not_found(format!("No vmPathName for {vm}")))
    }

    async fn vm_guest_ip(&self, vm: &MoRef) -> VcenterResult<Option<String>> {
        let guest = self.property(vm, "guest").await?;
        Ok(guest["ipAddress"].as_str().filter(|s| !s.is_empty()).map(str::to_string))
    }

    async fn create_vm(
        &self,
        folder: &MoRef,
        pool: &MoRef,
        host: Option<&MoRef>,
        spec: &VmConfigSpec,
    ) -> VcenterResult<MoRef> {
        let mut body = json!({ "config": config_spec_json(spec), "pool": pool.to_json() });
        if let Some(h) = host {
            body["host"] = h.to_json();
        }
        self.invoke_task(folder, "CreateVM_Task", Some(body)).await
    }

    async fn power_on(&self, vm: &MoRef) -> VcenterResult<MoRef> {
        self.invoke_task(vm, "PowerOnVM_Task", None).await
    }

    async fn power_off(&self, vm: &MoRef) -> VcenterResult<MoRef> {
        self.invoke_task(vm, "PowerOffVM_Task", None).await
    }

    async fn reconfigure(&self, vm: &MoRef, spec: &VmConfigSpec) -> VcenterResult<MoRef> {
        self.invoke_task(vm, "ReconfigVM_Task", Some(json!({ "spec": config_spec_json(spec) })))
            .await
    }

    async fn relocate(&self, vm: &MoRef, spec: &RelocateSpec) -> VcenterResult<MoRef> {
        self.invoke_task(vm, "RelocateVM_Task", Some(json!({ "spec": relocate_spec_json(spec) })))
            .await
    }

    async fn rename(&self, vm: &MoRef, new_name: &str) -> VcenterResult<MoRef> {
        self.invoke_task(vm, "Rename_Task", Some(json!({ "newName": new_name })))
            .await
    }

    async fn clone_vm(&self, vm: &MoRef, folder: &MoRef, name: &str, spec: &CloneSpec) -> VcenterResult<MoRef> {
        let body = json!({
            "folder": folder.to_json(),
            "name": name,
            "spec": {
                "_typeName": "VirtualMachineCloneSpec",
                "location": relocate_spec_json(&spec.location),
                "powerOn": spec.power_on,
                "template": spec.template,
            },
        });
        self.invoke_task(vm, "CloneVM_Task", Some(body)).await
    }

    async fn customize(&self, vm: &MoRef, spec: &CustomizationSpec) -> VcenterResult<MoRef> {
        self.invoke_task(vm, "CustomizeVM_Task", Some(json!({ "spec": customization_spec_json(spec) })))
            .await
    }

    async fn mark_as_template(&self, vm: &MoRef) -> VcenterResult<()> {
        self.invoke(vm, "MarkAsTemplate", None).await.map(|_| ())
    }

    async fn unregister(&self, vm: &MoRef) -> VcenterResult<()> {
        self.invoke(vm, "UnregisterVM", None).await.map(|_| ())
    }

    async fn delete_datastore_file(&self, path: &str, datacenter: Option<&MoRef>) -> VcenterResult<MoRef> {
        let fm = self.manager(|c| c.file_manager.clone(), "file manager").await?;
        let mut body = json!({ "name": path });
        if let Some(dc) = datacenter {
            body["datacenter"] = dc.to_json();
        }
        self.invoke_task(&fm, "DeleteDatastoreFile_Task", Some(body)).await
    }

    async fn copy_virtual_disk(&self, source: &str, dest: &str, datacenter: Option<&MoRef>) -> VcenterResult<MoRef> {
        let vdm = self
            .manager(|c| c.virtual_disk_manager.clone(), "virtual disk manager")
            .await?;
        let mut body = json!({ "sourceName": source, "destName": dest });
        if let Some(dc) = datacenter {
            body["sourceDatacenter"] = dc.to_json();
            body["destDatacenter"] = dc.to_json();
        }
        self.invoke_task(&vdm, "CopyVirtualDisk_Task", Some(body)).await
    }

    async fn delete_virtual_disk(&self, path: &str, datacenter: Option<&MoRef>) -> VcenterResult<MoRef> {
        let vdm = self
            .manager(|c| c.virtual_disk_manager.clone(), "virtual disk manager")
            .await?;
        let mut body = json!({ "name": path });
        if let Some(dc) = datacenter {
            body["datacenter"] = dc.to_json();
        }
        self.invoke_task(&vdm, "DeleteVirtualDisk_Task", Some(body)).await
    }

    async fn task_info(&self, task: &MoRef) -> VcenterResult<TaskInfo> {
        parse_task_info(&self.property(task, "info").await?)
    }

    async fn export_vm(&self, vm: &MoRef) -> VcenterResult<MoRef> {
        self.invoke_task(vm, "ExportVm", None).await
    }

    async fn create_descriptor(&self, vm: &MoRef, params: &CreateDescriptorParams) -> VcenterResult<String> {
        let om = self.manager(|c| c.ovf_manager.clone(), "OVF manager").await?;
        let files: Vec<Value> = params
            .ovf_files
            .iter()
            .map(|f| {
                json!({
                    "_typeName": "OvfFile",
                    "deviceId": f.device_id,
                    "path": f.path,
                    "size": f.size,
                })
            })
            .collect();
        let body = json!({
            "obj": vm.to_json(),
            "cdp": {
                "_typeName": "OvfCreateDescriptorParams",
                "name": params.name,
                "description": params.description,
                "ovfFiles": files,
            },
        });
        let result = self.invoke(&om, "CreateDescriptor", Some(body)).await?;
        let errors = fault_list(&result["error"]);
        if !errors.is_empty() {
            return Err(VcenterError::fault(format!(
                "CreateDescriptor failed: {}",
                errors.join("; ")
            )));
        }
        result["ovfDescriptor"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| VcenterError::parse("CreateDescriptor returned no descriptor"))
    }

    async fn create_import_spec(
        &self,
        descriptor: &str,
        pool: &MoRef,
        datastore: &MoRef,
        params: &ImportSpecParams,
    ) -> VcenterResult<ImportSpecResult> {
        let om = self.manager(|c| c.ovf_manager.clone(), "OVF manager").await?;
        let mut cisp = json!({
            "_typeName": "OvfCreateImportSpecParams",
            "entityName": params.entity_name,
            "diskProvisioning": params.disk_provisioning,
            "locale": "",
            "deploymentOption": "",
        });
        if let Some(h) = &params.host {
            cisp["hostSystem"] = h.to_json();
        }
        let body = json!({
            "ovfDescriptor": descriptor,
            "resourcePool": pool.to_json(),
            "datastore": datastore.to_json(),
            "cisp": cisp,
        });
        let result = self.invoke(&om, "CreateImportSpec", Some(body)).await?;
        parse_import_spec_result(&result)
    }

    async fn import_vapp(
        &self,
        pool: &MoRef,
        spec: &Value,
        folder: Option<&MoRef>,
        host: Option<&MoRef>,
    ) -> VcenterResult<MoRef> {
        let mut body = json!({ "spec": spec });
        if let Some(f) = folder {
            body["folder"] = f.to_json();
        }
        if let Some(h) = host {
            body["host"] = h.to_json();
        }
        self.invoke_task(pool, "ImportVApp", Some(body)).await
    }

    async fn lease_state(&self, lease: &MoRef) -> VcenterResult<LeaseState> {
        let v = self.property(lease, "state").await?;
        Ok(serde_json::from_value(v)?)
    }

    async fn lease_error(&self, lease: &MoRef) -> VcenterResult<Option<String>> {
        let v = self.property(lease, "error").await?;
        if v.is_null() {
            return Ok(None);
        }
        Ok(Some(fault_message(&v).unwrap_or_else(|| v.to_string())))
    }

    async fn lease_info(&self, lease: &MoRef) -> VcenterResult<LeaseInfo> {
        let v = self.property(lease, "info").await?;
        let entity = if v["entity"].is_null() {
            None
        } else {
            Some(serde_json::from_value(v["entity"].clone())?)
        };
        let device_urls = match &v["deviceUrl"] {
            Value::Null => Vec::new(),
            urls => serde_json::from_value(urls.clone())?,
        };
        Ok(LeaseInfo { entity, device_urls })
    }

    async fn lease_progress(&self, lease: &MoRef, percent: u8) -> VcenterResult<()> {
        self.invoke(lease, "HttpNfcLeaseProgress", Some(json!({ "percent": percent })))
            .await
            .map(|_| ())
    }

    async fn lease_complete(&self, lease: &MoRef) -> VcenterResult<()> {
        self.invoke(lease, "HttpNfcLeaseComplete", None).await.map(|_| ())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Responses & faults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn check_response(resp: Response) -> VcenterResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(fault_to_error(status.as_u16(), &body))
}

async fn parse_body(resp: Response) -> VcenterResult<Value> {
    let text = resp.text().await?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| {
        VcenterError::parse(format!(
            "Bad JSON from endpoint: {e}; body: {}",
            body_excerpt(&text)
        ))
    })
}

fn fault_message(v: &Value) -> Option<String> {
    v["localizedMessage"]
        .as_str()
        .or_else(|| v["faultMessage"][0]["message"].as_str())
        .or_else(|| v["message"].as_str())
        .or_else(|| v["msg"].as_str())
        .map(str::to_string)
}

fn fault_list(v: &Value) -> Vec<String> {
    v.as_array()
        .map(|items| {
            items
                .iter()
                .map(|f| fault_message(f).unwrap_or_else(|| f.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// Map an error response body to a crate error.
pub(crate) fn fault_to_error(status: u16, body: &str) -> VcenterError {
    let v: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let type_name = v["_typeName"].as_str().unwrap_or_default();
    let msg = fault_message(&v).unwrap_or_else(|| body.trim().to_string());

    match type_name {
        "NotAuthenticated" => VcenterError::stale(format!("Session is no longer authenticated: {msg}")),
        "InvalidLogin" => VcenterError::auth(format!("Invalid login: {msg}")),
        "ManagedObjectNotFound" => VcenterError::not_found(msg),
        "" if status == 401 => VcenterError::stale(format!("Session expired: {msg}")),
        "" if status == 404 => VcenterError::not_found(msg),
        "" => VcenterError::api(status, format!("API error {status}: {msg}")),
        other => VcenterError::fault(format!("{other}: {msg}")),
    }
}

fn parse_task_info(v: &Value) -> VcenterResult<TaskInfo> {
    let state: TaskState = serde_json::from_value(v["state"].clone())?;
    let error = match &v["error"] {
        Value::Null => None,
        e => Some(
            fault_message(e)
                .or_else(|| e["fault"]["_typeName"].as_str().map(str::to_string))
                .unwrap_or_else(|| e.to_string()),
        ),
    };
    let result = match &v["result"] {
        Value::Null => None,
        r => Some(r.clone()),
    };
    Ok(TaskInfo { state, error, result })
}

fn parse_import_spec_result(v: &Value) -> VcenterResult<ImportSpecResult> {
    let import_spec = match &v["importSpec"] {
        Value::Null => None,
        s => Some(s.clone()),
    };
    let file_items = match &v["fileItem"] {
        Value::Null => Vec::new(),
        items => serde_json::from_value(items.clone())?,
    };
    Ok(ImportSpecResult {
        import_spec,
        file_items,
        errors: fault_list(&v["error"]),
        warnings: fault_list(&v["warning"]),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Devices & specs (wire form)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SCSI_CONTROLLER_TYPES: &[&str] = &[
    "ParaVirtualSCSIController",
    "VirtualLsiLogicController",
    "VirtualLsiLogicSASController",
    "VirtualBusLogicController",
];

const NIC_TYPES: &[&str] = &[
    "VirtualVmxnet3",
    "VirtualVmxnet2",
    "VirtualE1000",
    "VirtualE1000e",
    "VirtualPCNet32",
];

fn parse_device(v: &Value) -> Option<VirtualDevice> {
    let type_name = v["_typeName"].as_str()?;
    let key = v["key"].as_i64()? as i32;
    let backing = &v["backing"];

    let kind = if SCSI_CONTROLLER_TYPES.contains(&type_name) {
        DeviceKind::ScsiController { bus_number: v["busNumber"].as_i64().unwrap_or(0) as i32 }
    } else if type_name == "VirtualDisk" {
        DeviceKind::Disk {
            file_name: backing["fileName"].as_str().unwrap_or_default().to_string(),
            thin: backing["thinProvisioned"].as_bool().unwrap_or(false),
            eager_scrub: backing["eagerlyScrub"].as_bool().unwrap_or(false),
            capacity_kb: v["capacityInKB"].as_u64().unwrap_or(0),
        }
    } else if NIC_TYPES.contains(&type_name) {
        let backing = if backing["_typeName"] == "VirtualEthernetCardDistributedVirtualPortBackingInfo" {
            let port = &backing["port"];
            NicBacking::Distributed {
                switch_uuid: port["switchUuid"].as_str().unwrap_or_default().to_string(),
                portgroup_key: port["portgroupKey"].as_str().unwrap_or_default().to_string(),
                port_key: port["portKey"].as_str().map(str::to_string),
            }
        } else {
            NicBacking::Network {
                device_name: backing["deviceName"].as_str().unwrap_or_default().to_string(),
            }
        };
        DeviceKind::Nic { backing }
    } else if type_name == "VirtualSerialPort" {
        DeviceKind::Serial {
            file_name: backing["fileName"].as_str().unwrap_or_default().to_string(),
        }
    } else {
        DeviceKind::Other { type_name: type_name.to_string() }
    };

    Some(VirtualDevice {
        key,
        label: v["deviceInfo"]["label"].as_str().map(str::to_string),
        summary: v["deviceInfo"]["summary"].as_str().map(str::to_string),
        controller_key: v["controllerKey"].as_i64().map(|k| k as i32),
        unit_number: v["unitNumber"].as_i64().map(|u| u as i32),
        kind,
        raw: Some(v.clone()),
    })
}

fn device_json(dev: &VirtualDevice) -> Value {
    let mut obj = Map::new();
    match &dev.kind {
        DeviceKind::ScsiController { bus_number } => {
            obj.insert("_typeName".into(), json!("ParaVirtualSCSIController"));
            obj.insert("busNumber".into(), json!(bus_number));
            obj.insert("sharedBus".into(), json!("noSharing"));
        }
        DeviceKind::Disk { file_name, thin, eager_scrub, capacity_kb } => {
            obj.insert("_typeName".into(), json!("VirtualDisk"));
            obj.insert("capacityInKB".into(), json!(capacity_kb));
            obj.insert(
                "backing".into(),
                json!({
                    "_typeName": "VirtualDiskFlatVer2BackingInfo",
                    "fileName": file_name,
                    "diskMode": "persistent",
                    "thinProvisioned": thin,
                    "eagerlyScrub": eager_scrub,
                }),
            );
        }
        DeviceKind::Nic { backing } => {
            obj.insert("_typeName".into(), json!("VirtualVmxnet3"));
            obj.insert("addressType".into(), json!("generated"));
            obj.insert("backing".into(), nic_backing_json(backing));
            obj.insert(
                "connectable".into(),
                json!({
                    "_typeName": "VirtualDeviceConnectInfo",
                    "startConnected": true,
                    "allowGuestControl": true,
                    "connected": true,
                }),
            );
        }
        DeviceKind::Serial { file_name } => {
            obj.insert("_typeName".into(), json!("VirtualSerialPort"));
            obj.insert("yieldOnPoll".into(), json!(true));
            obj.insert(
                "backing".into(),
                json!({ "_typeName": "VirtualSerialPortFileBackingInfo", "fileName": file_name }),
            );
        }
        DeviceKind::Other { type_name } => {
            obj.insert("_typeName".into(), json!(type_name));
        }
    }
    obj.insert("key".into(), json!(dev.key));
    if let Some(ck) = dev.controller_key {
        obj.insert("controllerKey".into(), json!(ck));
    }
    if let Some(un) = dev.unit_number {
        obj.insert("unitNumber".into(), json!(un));
    }
    Value::Object(obj)
}

fn nic_backing_json(backing: &NicBacking) -> Value {
    match backing {
        NicBacking::Network { device_name } => json!({
            "_typeName": "VirtualEthernetCardNetworkBackingInfo",
            "deviceName": device_name,
        }),
        NicBacking::Distributed { switch_uuid, portgroup_key, port_key } => {
            let mut port = json!({
                "_typeName": "DistributedVirtualSwitchPortConnection",
                "switchUuid": switch_uuid,
                "portgroupKey": portgroup_key,
            });
            if let Some(pk) = port_key {
                port["portKey"] = json!(pk);
            }
            json!({
                "_typeName": "VirtualEthernetCardDistributedVirtualPortBackingInfo",
                "port": port,
            })
        }
    }
}

/// `VirtualDeviceConfigSpec`. Removals and edits of existing devices
/// send the device back as the server described it.
pub(crate) fn device_change_json(change: &DeviceChange) -> Value {
    let device = match (&change.operation, &change.device.raw) {
        (DeviceOperation::Add, _) | (_, None) => device_json(&change.device),
        (_, Some(raw)) => raw.clone(),
    };
    let op = match change.operation {
        DeviceOperation::Add => "add",
        DeviceOperation::Remove => "remove",
        DeviceOperation::Edit => "edit",
    };
    let mut v = json!({
        "_typeName": "VirtualDeviceConfigSpec",
        "operation": op,
        "device": device,
    });
    if let Some(fop) = change.file_operation {
        v["fileOperation"] = json!(match fop {
            FileOperation::Create => "create",
            FileOperation::Destroy => "destroy",
            FileOperation::Replace => "replace",
        });
    }
    v
}

pub(crate) fn config_spec_json(spec: &VmConfigSpec) -> Value {
    let mut v = json!({ "_typeName": "VirtualMachineConfigSpec" });
    if let Some(name) = &spec.name {
        v["name"] = json!(name);
    }
    if let Some(mb) = spec.memory_mb {
        v["memoryMB"] = json!(mb);
    }
    if let Some(n) = spec.num_cpus {
        v["numCPUs"] = json!(n);
    }
    if let Some(g) = &spec.guest_id {
        v["guestId"] = json!(g);
    }
    if let Some(path) = &spec.files_path {
        v["files"] = json!({ "_typeName": "VirtualMachineFileInfo", "vmPathName": path });
    }
    if !spec.device_changes.is_empty() {
        v["deviceChange"] = Value::Array(spec.device_changes.iter().map(device_change_json).collect());
    }
    v
}

fn relocate_spec_json(spec: &RelocateSpec) -> Value {
    let mut v = json!({ "_typeName": "VirtualMachineRelocateSpec" });
    if let Some(ds) = &spec.datastore {
        v["datastore"] = ds.to_json();
    }
    if let Some(pool) = &spec.pool {
        v["pool"] = pool.to_json();
    }
    if let Some(host) = &spec.host {
        v["host"] = host.to_json();
    }
    v
}

fn customization_spec_json(spec: &CustomizationSpec) -> Value {
    json!({
        "_typeName": "CustomizationSpec",
        "identity": {
            "_typeName": "CustomizationLinuxPrep",
            "hostName": { "_typeName": "CustomizationFixedName", "name": spec.hostname },
            "domain": spec.domain,
        },
        "globalIPSettings": {
            "_typeName": "CustomizationGlobalIPSettings",
            "dnsServerList": spec.dns_servers,
        },
        "nicSettingMap": [{
            "_typeName": "CustomizationAdapterMapping",
            "adapter": {
                "_typeName": "CustomizationIPSettings",
                "ip": { "_typeName": "CustomizationFixedIp", "ipAddress": spec.ip },
                "subnetMask": spec.subnet_mask,
                "gateway": spec.gateways,
            },
        }],
    })
}
