//! # SortOfRemote NG – vCenter / ESXi VM Lifecycle Orchestration
//!
//! Drives a vCenter Server or a standalone ESXi host through the vSphere
//! VI/JSON API: sessions that recover from stale connections, task
//! polling, VM and disk lifecycle, and leased OVF / OVA transfers with
//! manifest checksum validation.
//!
//! ## Modules
//!
//! - **error** — Crate-specific error types
//! - **config** — Endpoint, placement, network and timing settings
//! - **types** — Shared data structures (managed object refs, devices, specs, leases)
//! - **retry** — Deadline-bounded exponential backoff + transient-error classifier
//! - **transport** — Streaming HTTP(S) file transfer
//! - **vim** — `VimApi` seam and the VI/JSON client behind it
//! - **task** — Remote task completion polling
//! - **session** — Connection lifecycle, inventory lookup, placement
//! - **lease** — HTTP NFC lease acquisition, keep-alive, completion
//! - **vm** — VM lifecycle (create, power, rename, clone, customize, destroy)
//! - **disk** — Virtual disks and serial ports
//! - **datastore** — Datastore paths and `/folder` file access
//! - **manifest** — `.mf` SHA-1 manifests
//! - **ovf** — OVF descriptor rewriting
//! - **ova** — OVA archive packing
//! - **ovf_transfer** — OVF export / import over leases
//! - **service** — `HypervisorService` trait + `VcenterService` facade

pub mod error;
pub mod config;
pub mod types;
pub mod retry;
pub mod transport;
pub mod vim;
pub mod task;
pub mod session;
pub mod lease;
pub mod vm;
pub mod disk;
pub mod datastore;
pub mod manifest;
pub mod ovf;
pub mod ova;
pub mod ovf_transfer;
pub mod service;

#[cfg(test)]
mod fake;

pub use config::VcenterConfig;
pub use error::{VcenterError, VcenterErrorKind, VcenterResult};
pub use service::{HypervisorService, VcenterService};
