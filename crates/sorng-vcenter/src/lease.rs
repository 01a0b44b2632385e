//! HTTP NFC lease lifecycle for OVF import / export.
//!
//! A lease is polled until `ready`, kept alive by a background heartbeat
//! while the transfer body runs, and completed exactly once afterwards.
//! If a [`LeaseController`] is dropped before it completed the lease, the
//! completion is sent from a background task instead.

use crate::config::VcenterConfig;
use crate::error::{VcenterError, VcenterErrorKind, VcenterResult};
use crate::types::{DeviceUrl, LeaseState, MoRef};
use crate::vim::VimApi;

use log::{debug, info, warn};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Progress value reported by the heartbeat; the server only needs a ping.
const KEEPALIVE_PERCENT: u8 = 50;

/// One import or export transfer.
#[derive(Debug, Clone)]
pub struct TransferLease {
    pub lease_ref: MoRef,
    pub state: LeaseState,
    pub device_urls: Vec<DeviceUrl>,
    /// VM being exported or created by the import
    pub entity: Option<MoRef>,
    /// Client-side bound on the whole transfer body
    pub timeout: Duration,
    /// Set once the transfer body has finished; stops the heartbeat
    pub transfer_complete: Arc<AtomicBool>,
}

impl TransferLease {
    pub fn is_transfer_complete(&self) -> bool {
        self.transfer_complete.load(Ordering::SeqCst)
    }
}

pub struct LeaseController {
    api: Arc<dyn VimApi>,
    lease: TransferLease,
    keepalive: Duration,
    stop: Arc<Notify>,
    heartbeat: Option<JoinHandle<()>>,
    completed: bool,
}

impl LeaseController {
    /// Poll a freshly requested lease until it is ready.
    ///
    /// A lease that ends in `error` is reported with its error detail.
    pub async fn acquire(api: Arc<dyn VimApi>, lease_ref: MoRef, config: &VcenterConfig) -> VcenterResult<Self> {
        let mut ctl = Self {
            api,
            lease: TransferLease {
                lease_ref,
                state: LeaseState::Initializing,
                device_urls: Vec::new(),
                entity: None,
                timeout: config.lease_timeout(),
                transfer_complete: Arc::new(AtomicBool::new(false)),
            },
            keepalive: config.lease_keepalive(),
            stop: Arc::new(Notify::new()),
            heartbeat: None,
            completed: false,
        };
        ctl.wait_ready().await?;
        Ok(ctl)
    }

    async fn wait_ready(&mut self) -> VcenterResult<()> {
        let lease_ref = self.lease.lease_ref.clone();
        loop {
            let state = self.api.lease_state(&lease_ref).await?;
            if state != self.lease.state {
                debug!("Lease {lease_ref}: {:?} -> {state:?}", self.lease.state);
                self.lease.state = state;
            }
            match state {
                LeaseState::Ready => break,
                LeaseState::Error => {
                    // Nothing to release on a lease the server already failed.
                    self.completed = true;
                    let detail = self
                        .api
                        .lease_error(&lease_ref)
                        .await
                        .ok()
                        .flatten()
                        .unwrap_or_else(|| "no detail reported".to_string());
                    return Err(VcenterError::lease(format!("Lease {lease_ref} failed: {detail}")));
                }
                LeaseState::Done => {
                    self.completed = true;
                    return Err(VcenterError::lease(format!(
                        "Lease {lease_ref} finished before it became ready"
                    )));
                }
                LeaseState::Initializing => tokio::task::yield_now().await,
            }
        }

        let info = self.api.lease_info(&lease_ref).await?;
        self.lease.device_urls = info.device_urls;
        self.lease.entity = info.entity;
        info!(
            "Lease {lease_ref} ready with {} device URL(s), timeout {}s",
            self.lease.device_urls.len(),
            self.lease.timeout.as_secs()
        );
        Ok(())
    }

    pub fn lease(&self) -> &TransferLease {
        &self.lease
    }

    /// Run `body` with the heartbeat going, then complete the lease.
    ///
    /// The lease is completed and `transfer_complete` set on every exit
    /// path. An error from `body` takes precedence over a failed completion.
    pub async fn run<T, F, Fut>(mut self, body: F) -> VcenterResult<T>
    where
        F: FnOnce(TransferLease) -> Fut,
        Fut: Future<Output = VcenterResult<T>>,
    {
        self.start_heartbeat();

        let timeout = self.lease.timeout;
        let outcome = match tokio::time::timeout(timeout, body(self.lease.clone())).await {
            Ok(result) => result,
            Err(_) => Err(VcenterError::lease(format!(
                "Transfer on lease {} did not finish within {}s",
                self.lease.lease_ref,
                timeout.as_secs()
            ))),
        };

        let completion = self.finish().await;
        let value = outcome?;
        completion?;
        Ok(value)
    }

    fn start_heartbeat(&mut self) {
        if self.heartbeat.is_some() {
            return;
        }
        self.heartbeat = Some(tokio::spawn(heartbeat(
            Arc::clone(&self.api),
            self.lease.lease_ref.clone(),
            Arc::clone(&self.lease.transfer_complete),
            Arc::clone(&self.stop),
            self.keepalive,
        )));
    }

    async fn finish(&mut self) -> VcenterResult<()> {
        self.lease.transfer_complete.store(true, Ordering::SeqCst);
        self.stop.notify_one();
        if let Some(handle) = self.heartbeat.take() {
            if let Err(e) = handle.await {
                warn!("Lease heartbeat task ended abnormally: {e}");
            }
        }

        if self.completed {
            return Ok(());
        }
        self.completed = true;
        let lease_ref = &self.lease.lease_ref;
        match self.api.lease_complete(lease_ref).await {
            Ok(()) => {
                self.lease.state = LeaseState::Done;
                info!("Lease {lease_ref} completed");
                Ok(())
            }
            Err(e) => {
                warn!("Completing lease {lease_ref} failed: {e}");
                Err(e.context(format!("Failed to complete lease {lease_ref}")))
            }
        }
    }
}

impl Drop for LeaseController {
    fn drop(&mut self) {
        self.lease.transfer_complete.store(true, Ordering::SeqCst);
        self.stop.notify_one();
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        if self.completed {
            return;
        }
        self.completed = true;

        let lease_ref = self.lease.lease_ref.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let api = Arc::clone(&self.api);
                rt.spawn(async move {
                    match api.lease_complete(&lease_ref).await {
                        Ok(()) => debug!("Lease {lease_ref} completed after early drop"),
                        Err(e) => warn!("Completing dropped lease {lease_ref} failed: {e}"),
                    }
                });
            }
            Err(_) => warn!("Lease {lease_ref} dropped outside a runtime; not completed"),
        }
    }
}

/// Ping the lease every `interval` until the transfer is done or the
/// lease leaves the ready state.
async fn heartbeat(
    api: Arc<dyn VimApi>,
    lease_ref: MoRef,
    transfer_complete: Arc<AtomicBool>,
    stop: Arc<Notify>,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = stop.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
        if transfer_complete.load(Ordering::SeqCst) {
            debug!("Lease {lease_ref} heartbeat stopping: transfer complete");
            return;
        }
        match api.lease_state(&lease_ref).await {
            Ok(state @ (LeaseState::Done | LeaseState::Error)) => {
                debug!("Lease {lease_ref} heartbeat stopping: lease is {state:?}");
                return;
            }
            Ok(_) => {}
            Err(e) => return heartbeat_failed(&lease_ref, &e),
        }
        if let Err(e) = api.lease_progress(&lease_ref, KEEPALIVE_PERCENT).await {
            return heartbeat_failed(&lease_ref, &e);
        }
    }
}

fn heartbeat_failed(lease_ref: &MoRef, err: &VcenterError) {
    if is_lease_transition(err) {
        debug!("Lease {lease_ref} heartbeat stopping: {err}");
    } else {
        warn!("Lease {lease_ref} heartbeat failed, lease may time out: {err}");
    }
}

/// Errors a lease raises while moving to `done` / `error` under the heartbeat.
fn is_lease_transition(err: &VcenterError) -> bool {
    match err.kind {
        VcenterErrorKind::LeaseError | VcenterErrorKind::NotFound => true,
        VcenterErrorKind::RemoteFault => {
            err.message.starts_with("InvalidState") || err.message.starts_with("Timedout")
        }
        _ => false,
    }
}
