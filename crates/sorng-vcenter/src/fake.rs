//! In-memory management endpoint and disk-transfer server for tests.

use crate::error::{VcenterError, VcenterResult};
use crate::types::*;
use crate::vim::VimApi;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub(crate) struct FakeVm {
    pub name: String,
    pub power: PowerState,
    pub devices: Vec<VirtualDevice>,
    pub path: String,
    pub guest_ip: Option<String>,
}

#[derive(Default)]
pub(crate) struct FakeState {
    pub calls: Vec<String>,
    pub api_type: String,
    pub inventory: HashMap<InventoryKind, Vec<InventoryObject>>,
    pub vms: HashMap<String, FakeVm>,
    pub seq: u32,
    pub failures: HashMap<String, VecDeque<VcenterError>>,
    pub task_scripts: HashMap<String, VecDeque<TaskState>>,
    pub task_overrides: HashMap<String, TaskInfo>,
    pub task_errors: HashMap<String, String>,
    /// VM names left out of the next N VirtualMachine listings
    pub hidden: HashMap<String, u32>,
    pub lease_script: VecDeque<LeaseState>,
    pub lease_current: Option<LeaseState>,
    pub lease_error: Option<String>,
    pub lease_info: LeaseInfo,
    pub descriptor: String,
    pub descriptor_params: Option<CreateDescriptorParams>,
    pub import_descriptor: Option<String>,
    pub import_spec: ImportSpecResult,
    pub imported_spec: Option<Value>,
    pub reconfigs: Vec<VmConfigSpec>,
    pub created: Vec<VmConfigSpec>,
    pub relocations: Vec<RelocateSpec>,
    pub guest_ip_misses: u32,
    pub distributed: Option<DistributedPortInfo>,
}

/// `VimApi` that keeps inventory in memory and records every call in order.
pub(crate) struct FakeVim {
    pub state: Mutex<FakeState>,
}

impl FakeVim {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                api_type: "VirtualCenter".into(),
                descriptor: "<Envelope/>".into(),
                ..Default::default()
            }),
        }
    }

    /// vCenter with one datacenter, cluster, datastore `ds1` and `VM Network`.
    pub fn vcenter() -> Self {
        let fake = Self::new();
        fake.add_object(InventoryKind::Datacenter, "dc1", "datacenter-1");
        fake.add_object(InventoryKind::ClusterComputeResource, "cluster1", "domain-c1");
        fake.add_object(InventoryKind::Datastore, "ds1", "datastore-1");
        fake.add_object(InventoryKind::Network, "VM Network", "network-1");
        fake
    }

    /// ESXi host agent with one compute resource and datastore `ds1`.
    pub fn esx() -> Self {
        let fake = Self::new();
        fake.state.lock().unwrap().api_type = "HostAgent".into();
        fake.add_object(InventoryKind::Datacenter, "ha-datacenter", "ha-datacenter");
        fake.add_object(InventoryKind::ComputeResource, "esx1", "ha-compute-res");
        fake.add_object(InventoryKind::Datastore, "ds1", "datastore1");
        fake.add_object(InventoryKind::Network, "VM Network", "HaNetwork-VM Network");
        fake
    }

    pub fn add_object(&self, kind: InventoryKind, name: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .inventory
            .entry(kind)
            .or_default()
            .push(InventoryObject { name: name.into(), moref: MoRef::new(kind.vim_type(), value) });
    }

    pub fn add_vm(&self, name: &str, power: PowerState, devices: Vec<VirtualDevice>) -> VmHandle {
        let mut st = self.state.lock().unwrap();
        st.seq += 1;
        let moref = MoRef::new("VirtualMachine", format!("vm-{}", st.seq));
        st.vms.insert(
            moref.value.clone(),
            FakeVm {
                name: name.into(),
                power,
                devices,
                path: format!("[ds1] {name}/{name}.vmx"),
                guest_ip: None,
            },
        );
        st.inventory
            .entry(InventoryKind::VirtualMachine)
            .or_default()
            .push(InventoryObject { name: name.into(), moref: moref.clone() });
        VmHandle { name: name.into(), moref }
    }

    pub fn vm(&self, handle: &VmHandle) -> FakeVm {
        self.state.lock().unwrap().vms[&handle.moref.value].clone()
    }

    /// Queue an error for the next call of `op`.
    pub fn fail(&self, op: &str, err: VcenterError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op.into())
            .or_default()
            .push_back(err);
    }

    /// The next task submitted by `op` ends in the error state.
    pub fn fail_task(&self, op: &str, msg: &str) {
        self.state.lock().unwrap().task_errors.insert(op.into(), msg.into());
    }

    pub fn script_task(&self, task: &MoRef, states: Vec<TaskState>) {
        self.state
            .lock()
            .unwrap()
            .task_scripts
            .insert(task.value.clone(), states.into());
    }

    pub fn set_task_info(&self, task: &MoRef, info: TaskInfo) {
        self.state.lock().unwrap().task_overrides.insert(task.value.clone(), info);
    }

    pub fn hide_vm(&self, name: &str, listings: u32) {
        self.state.lock().unwrap().hidden.insert(name.into(), listings);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Call names without their arguments.
    pub fn ops(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|c| c.split(':').next().unwrap_or_default().to_string())
            .collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.ops().iter().filter(|c| c.as_str() == op).count()
    }

    /// Ops from `wanted` in the order they were called.
    pub fn sequence(&self, wanted: &[&str]) -> Vec<String> {
        self.ops().into_iter().filter(|c| wanted.contains(&c.as_str())).collect()
    }

    fn record(&self, call: String) -> VcenterResult<()> {
        let mut st = self.state.lock().unwrap();
        let op = call.split(':').next().unwrap_or_default().to_string();
        st.calls.push(call);
        match st.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn new_task(&self, op: &str) -> MoRef {
        let mut st = self.state.lock().unwrap();
        st.seq += 1;
        let task = MoRef::new("Task", format!("task-{}", st.seq));
        if let Some(msg) = st.task_errors.remove(op) {
            st.task_overrides.insert(
                task.value.clone(),
                TaskInfo { state: TaskState::Error, error: Some(msg), result: None },
            );
        }
        task
    }

    fn task_failed(&self, task: &MoRef) -> bool {
        self.state
            .lock()
            .unwrap()
            .task_overrides
            .get(&task.value)
            .map(|i| i.state == TaskState::Error)
            .unwrap_or(false)
    }

    fn new_lease(&self) -> MoRef {
        let mut st = self.state.lock().unwrap();
        st.seq += 1;
        st.lease_current = None;
        MoRef::new("HttpNfcLease", format!("lease-{}", st.seq))
    }

    fn apply_changes(devices: &mut Vec<VirtualDevice>, changes: &[DeviceChange], seq: &mut u32) {
        for change in changes {
            match change.operation {
                DeviceOperation::Add => {
                    *seq += 1;
                    let mut dev = change.device.clone();
                    dev.key = 2000 + *seq as i32;
                    if let DeviceKind::Disk { capacity_kb, .. } = dev.kind {
                        dev.summary = Some(format!("{capacity_kb} KB"));
                    }
                    devices.push(dev);
                }
                DeviceOperation::Remove => devices.retain(|d| d.key != change.device.key),
                DeviceOperation::Edit => {}
            }
        }
    }
}

#[async_trait]
impl VimApi for FakeVim {
    async fn login(&self, username: &str, _password: &str) -> VcenterResult<()> {
        self.record(format!("login:{username}"))
    }

    async fn logout(&self) -> VcenterResult<()> {
        self.record("logout".into())
    }

    async fn about(&self) -> VcenterResult<AboutInfo> {
        self.record("about".into())?;
        Ok(AboutInfo {
            api_type: self.state.lock().unwrap().api_type.clone(),
            version: "8.0.1".into(),
            full_name: "fake".into(),
        })
    }

    async fn current_time(&self) -> VcenterResult<String> {
        self.record("current_time".into())?;
        Ok("2026-10-19T00:00:00Z".into())
    }

    async fn transfer_headers(&self) -> Vec<(String, String)> {
        vec![("vmware-api-session-id".into(), "fake-session".into())]
    }

    async fn list_objects(&self, kind: InventoryKind) -> VcenterResult<Vec<InventoryObject>> {
        self.record(format!("list_objects:{}", kind.vim_type()))?;
        let mut st = self.state.lock().unwrap();
        let mut objs = st.inventory.get(&kind).cloned().unwrap_or_default();
        if kind == InventoryKind::VirtualMachine {
            let hidden = &mut st.hidden;
            objs.retain(|o| match hidden.get_mut(&o.name) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    false
                }
                _ => true,
            });
        }
        Ok(objs)
    }

    async fn resource_pool_of(&self, compute: &MoRef) -> VcenterResult<MoRef> {
        self.record(format!("resource_pool_of:{}", compute.value))?;
        Ok(MoRef::new("ResourcePool", format!("resgroup-{}", compute.value)))
    }

    async fn vm_folder_of(&self, datacenter: &MoRef) -> VcenterResult<MoRef> {
        self.record(format!("vm_folder_of:{}", datacenter.value))?;
        Ok(MoRef::new("Folder", "group-v1"))
    }

    async fn distributed_port_info(&self, portgroup: &MoRef) -> VcenterResult<DistributedPortInfo> {
        self.record(format!("distributed_port_info:{}", portgroup.value))?;
        self.state
            .lock()
            .unwrap()
            .distributed
            .clone()
            .ok_or_else(|| VcenterError::not_found("no switch"))
    }

    async fn vm_power_state(&self, vm: &MoRef) -> VcenterResult<PowerState> {
        self.record(format!("vm_power_state:{}", vm.value))?;
        let st = self.state.lock().unwrap();
        st.vms
            .get(&vm.value)
            .map(|v| v.power)
            .ok_or_else(|| VcenterError::not_found(format!("{vm}")))
    }

    async fn vm_devices(&self, vm: &MoRef) -> VcenterResult<Vec<VirtualDevice>> {
        self.record(format!("vm_devices:{}", vm.value))?;
        let st = self.state.lock().unwrap();
        st.vms
            .get(&vm.value)
            .map(|v| v.devices.clone())
            .ok_or_else(|| VcenterError::not_found(format!("{vm}")))
    }

    async fn vm_path_name(&self, vm: &MoRef) -> VcenterResult<String> {
        self.record(format!("vm_path_name:{}", vm.value))?;
        let st = self.state.lock().unwrap();
        st.vms
            .get(&vm.value)
            .map(|v| v.path.clone())
            .ok_or_else(|| VcenterError::not_found(format!("{vm}")))
    }

    async fn vm_guest_ip(&self, vm: &MoRef) -> VcenterResult<Option<String>> {
        self.record(format!("vm_guest_ip:{}", vm.value))?;
        let mut st = self.state.lock().unwrap();
        if st.guest_ip_misses > 0 {
            st.guest_ip_misses -= 1;
            return Ok(None);
        }
        Ok(st.vms.get(&vm.value).and_then(|v| v.guest_ip.clone()))
    }

    async fn create_vm(
        &self,
        _folder: &MoRef,
        _pool: &MoRef,
        _host: Option<&MoRef>,
        spec: &VmConfigSpec,
    ) -> VcenterResult<MoRef> {
        let name = spec.name.clone().unwrap_or_default();
        self.record(format!("create_vm:{name}"))?;
        let task = self.new_task("create_vm");
        self.state.lock().unwrap().created.push(spec.clone());
        if !self.task_failed(&task) {
            let mut devices = Vec::new();
            {
                let mut st = self.state.lock().unwrap();
                let mut seq = st.seq;
                Self::apply_changes(&mut devices, &spec.device_changes, &mut seq);
                st.seq = seq;
            }
            let handle = self.add_vm(&name, PowerState::PoweredOff, devices);
            let mut st = self.state.lock().unwrap();
            if let Some(vm) = st.vms.get_mut(&handle.moref.value) {
                vm.path = format!("{}{name}/{name}.vmx", spec.files_path.clone().unwrap_or_default());
            }
        }
        Ok(task)
    }

    async fn power_on(&self, vm: &MoRef) -> VcenterResult<MoRef> {
        self.record(format!("power_on:{}", vm.value))?;
        if let Some(v) = self.state.lock().unwrap().vms.get_mut(&vm.value) {
            v.power = PowerState::PoweredOn;
        }
        Ok(self.new_task("power_on"))
    }

    async fn power_off(&self, vm: &MoRef) -> VcenterResult<MoRef> {
        self.record(format!("power_off:{}", vm.value))?;
        if let Some(v) = self.state.lock().unwrap().vms.get_mut(&vm.value) {
            v.power = PowerState::PoweredOff;
        }
        Ok(self.new_task("power_off"))
    }

    async fn reconfigure(&self, vm: &MoRef, spec: &VmConfigSpec) -> VcenterResult<MoRef> {
        self.record(format!("reconfigure:{}", vm.value))?;
        let mut st = self.state.lock().unwrap();
        st.reconfigs.push(spec.clone());
        let mut seq = st.seq;
        let mut renamed = None;
        if let Some(v) = st.vms.get_mut(&vm.value) {
            Self::apply_changes(&mut v.devices, &spec.device_changes, &mut seq);
            if let Some(name) = &spec.name {
                v.name = name.clone();
                renamed = Some(name.clone());
            }
        }
        st.seq = seq;
        if let Some(name) = renamed {
            for obj in st.inventory.entry(InventoryKind::VirtualMachine).or_default() {
                if obj.moref == *vm {
                    obj.name = name.clone();
                }
            }
        }
        drop(st);
        Ok(self.new_task("reconfigure"))
    }

    async fn relocate(&self, vm: &MoRef, spec: &RelocateSpec) -> VcenterResult<MoRef> {
        self.record(format!("relocate:{}", vm.value))?;
        self.state.lock().unwrap().relocations.push(spec.clone());
        Ok(self.new_task("relocate"))
    }

    async fn rename(&self, vm: &MoRef, new_name: &str) -> VcenterResult<MoRef> {
        self.record(format!("rename:{}", vm.value))?;
        {
            let mut st = self.state.lock().unwrap();
            if let Some(v) = st.vms.get_mut(&vm.value) {
                v.name = new_name.into();
            }
            for obj in st.inventory.entry(InventoryKind::VirtualMachine).or_default() {
                if obj.moref == *vm {
                    obj.name = new_name.into();
                }
            }
        }
        Ok(self.new_task("rename"))
    }

    async fn clone_vm(&self, vm: &MoRef, _folder: &MoRef, name: &str, _spec: &CloneSpec) -> VcenterResult<MoRef> {
        self.record(format!("clone_vm:{}", vm.value))?;
        let source = self.state.lock().unwrap().vms.get(&vm.value).cloned();
        if let Some(src) = source {
            self.add_vm(name, PowerState::PoweredOff, src.devices);
        }
        Ok(self.new_task("clone_vm"))
    }

    async fn customize(&self, vm: &MoRef, _spec: &CustomizationSpec) -> VcenterResult<MoRef> {
        self.record(format!("customize:{}", vm.value))?;
        Ok(self.new_task("customize"))
    }

    async fn mark_as_template(&self, vm: &MoRef) -> VcenterResult<()> {
        self.record(format!("mark_as_template:{}", vm.value))
    }

    async fn unregister(&self, vm: &MoRef) -> VcenterResult<()> {
        self.record(format!("unregister:{}", vm.value))?;
        let mut st = self.state.lock().unwrap();
        st.vms.remove(&vm.value);
        if let Some(list) = st.inventory.get_mut(&InventoryKind::VirtualMachine) {
            list.retain(|o| o.moref != *vm);
        }
        Ok(())
    }

    async fn delete_datastore_file(&self, path: &str, _datacenter: Option<&MoRef>) -> VcenterResult<MoRef> {
        self.record(format!("delete_datastore_file:{path}"))?;
        Ok(self.new_task("delete_datastore_file"))
    }

    async fn copy_virtual_disk(&self, source: &str, dest: &str, _datacenter: Option<&MoRef>) -> VcenterResult<MoRef> {
        self.record(format!("copy_virtual_disk:{source}->{dest}"))?;
        Ok(self.new_task("copy_virtual_disk"))
    }

    async fn delete_virtual_disk(&self, path: &str, _datacenter: Option<&MoRef>) -> VcenterResult<MoRef> {
        self.record(format!("delete_virtual_disk:{path}"))?;
        Ok(self.new_task("delete_virtual_disk"))
    }

    async fn task_info(&self, task: &MoRef) -> VcenterResult<TaskInfo> {
        self.record(format!("task_info:{}", task.value))?;
        let mut st = self.state.lock().unwrap();
        if let Some(state) = st.task_scripts.get_mut(&task.value).and_then(|s| s.pop_front()) {
            return Ok(TaskInfo { state, error: None, result: None });
        }
        Ok(st
            .task_overrides
            .get(&task.value)
            .cloned()
            .unwrap_or(TaskInfo { state: TaskState::Success, error: None, result: None }))
    }

    async fn export_vm(&self, vm: &MoRef) -> VcenterResult<MoRef> {
        self.record(format!("export_vm:{}", vm.value))?;
        Ok(self.new_lease())
    }

    async fn create_descriptor(&self, vm: &MoRef, params: &CreateDescriptorParams) -> VcenterResult<String> {
        self.record(format!("create_descriptor:{}", vm.value))?;
        let mut st = self.state.lock().unwrap();
        st.descriptor_params = Some(params.clone());
        Ok(st.descriptor.clone())
    }

    async fn create_import_spec(
        &self,
        descriptor: &str,
        _pool: &MoRef,
        _datastore: &MoRef,
        params: &ImportSpecParams,
    ) -> VcenterResult<ImportSpecResult> {
        self.record(format!("create_import_spec:{}", params.entity_name))?;
        let mut st = self.state.lock().unwrap();
        st.import_descriptor = Some(descriptor.to_string());
        Ok(st.import_spec.clone())
    }

    async fn import_vapp(
        &self,
        _pool: &MoRef,
        spec: &Value,
        _folder: Option<&MoRef>,
        _host: Option<&MoRef>,
    ) -> VcenterResult<MoRef> {
        self.record("import_vapp".into())?;
        self.state.lock().unwrap().imported_spec = Some(spec.clone());
        Ok(self.new_lease())
    }

    async fn lease_state(&self, lease: &MoRef) -> VcenterResult<LeaseState> {
        self.record(format!("lease_state:{}", lease.value))?;
        let mut st = self.state.lock().unwrap();
        if let Some(s) = st.lease_script.pop_front() {
            st.lease_current = Some(s);
            return Ok(s);
        }
        Ok(st.lease_current.unwrap_or(LeaseState::Ready))
    }

    async fn lease_error(&self, lease: &MoRef) -> VcenterResult<Option<String>> {
        self.record(format!("lease_error:{}", lease.value))?;
        Ok(self.state.lock().unwrap().lease_error.clone())
    }

    async fn lease_info(&self, lease: &MoRef) -> VcenterResult<LeaseInfo> {
        self.record(format!("lease_info:{}", lease.value))?;
        Ok(self.state.lock().unwrap().lease_info.clone())
    }

    async fn lease_progress(&self, lease: &MoRef, percent: u8) -> VcenterResult<()> {
        self.record(format!("lease_progress:{}:{percent}", lease.value))
    }

    async fn lease_complete(&self, lease: &MoRef) -> VcenterResult<()> {
        self.record(format!("lease_complete:{}", lease.value))?;
        self.state.lock().unwrap().lease_current = Some(LeaseState::Done);
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Disk transfer server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub(crate) struct Upload {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Default)]
struct DiskState {
    exports: HashMap<String, Vec<u8>>,
    uploads: HashMap<String, Upload>,
    folder: HashMap<String, Vec<u8>>,
    deletes: Vec<String>,
    /// Upload attempts to answer with a transient device fault
    flaky_uploads: u32,
}

type Shared = Arc<Mutex<DiskState>>;

/// Plays the NFC lease endpoints (`/nfc/export/{file}`, `/nfc/import/{device}`)
/// and datastore `/folder/{path}` access.
pub(crate) struct DiskServer {
    addr: SocketAddr,
    state: Shared,
}

impl DiskServer {
    pub async fn start() -> Self {
        let state: Shared = Arc::default();
        let app = Router::new()
            .route("/nfc/export/:name", get(export_file))
            .route("/nfc/import/:name", post(import_file))
            .route(
                "/folder/*path",
                get(folder_get).put(folder_put).delete(folder_delete),
            )
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn put_export(&self, name: &str, body: Vec<u8>) {
        self.state.lock().unwrap().exports.insert(name.into(), body);
    }

    pub fn uploaded(&self, name: &str) -> Option<Upload> {
        self.state.lock().unwrap().uploads.get(name).cloned()
    }

    pub fn folder_file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().folder.get(path).cloned()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.state.lock().unwrap().deletes.clone()
    }

    pub fn fail_uploads(&self, n: u32) {
        self.state.lock().unwrap().flaky_uploads = n;
    }
}

async fn export_file(State(state): State<Shared>, Path(name): Path<String>) -> impl IntoResponse {
    match state.lock().unwrap().exports.get(&name) {
        Some(body) => (StatusCode::OK, body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn import_file(
    State(state): State<Shared>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let mut st = state.lock().unwrap();
    if st.flaky_uploads > 0 {
        st.flaky_uploads -= 1;
        return (StatusCode::SERVICE_UNAVAILABLE, "Device timeout").into_response();
    }
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    st.uploads.insert(name, Upload { body: body.to_vec(), content_type });
    StatusCode::OK.into_response()
}

async fn folder_get(State(state): State<Shared>, Path(path): Path<String>) -> impl IntoResponse {
    match state.lock().unwrap().folder.get(&path) {
        Some(body) => (StatusCode::OK, body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn folder_put(State(state): State<Shared>, Path(path): Path<String>, body: Bytes) -> impl IntoResponse {
    state.lock().unwrap().folder.insert(path, body.to_vec());
    StatusCode::CREATED
}

async fn folder_delete(State(state): State<Shared>, Path(path): Path<String>) -> impl IntoResponse {
    state.lock().unwrap().deletes.push(path);
    StatusCode::NO_CONTENT
}
