//! Proximity scanning for trusted maintenance devices.
//!
//! The scanner fetches the trusted-device roster once, then probes for
//! nearby devices on a fixed interval until one of the trusted addresses is
//! seen or the scan is cancelled. A match is reported over a channel; the
//! scanner itself never changes any reservation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::store::{BookingStore, StoreError};
use crate::types::{PersonId, TrustedDevice};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannerConfig {
    /// Pause before each discovery probe
    pub interval: Duration,
    /// Upper bound on a single discovery probe
    pub probe_timeout: Duration,
    /// Upper bound on resolving the matched device's name
    pub name_timeout: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(8),
            name_timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors a discovery backend may report for one probe.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery adapter unavailable: {0}")]
    Unavailable(String),

    #[error("discovery probe timed out")]
    Timeout,

    #[error("discovery probe failed: {0}")]
    ProbeFailed(String),
}

/// Errors that end a scan. Probe failures and timeouts never do.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to fetch trusted roster: {0}")]
    Roster(#[from] StoreError),

    #[error("scan task aborted: {0}")]
    Aborted(String),
}

// ============================================================================
// Collaborators
// ============================================================================

/// Nearby device discovery, typically backed by a Bluetooth adapter.
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    /// Addresses of the devices currently visible.
    async fn discover_nearby(&self, timeout: Duration) -> Result<HashSet<String>, DiscoveryError>;

    /// Human-readable name of a device, if it answers in time.
    async fn resolve_name(&self, address: &str, timeout: Duration) -> Option<String>;
}

/// Source of the trusted-device roster.
#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn trusted_devices(&self) -> Result<Vec<TrustedDevice>, StoreError>;
}

#[async_trait]
impl<S: BookingStore + ?Sized> RosterSource for S {
    async fn trusted_devices(&self) -> Result<Vec<TrustedDevice>, StoreError> {
        self.list_trusted_devices().await
    }
}

// ============================================================================
// Scanner
// ============================================================================

/// A trusted device seen near the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanMatch {
    pub person_id: PersonId,
    pub device_address: String,
    pub device_name: Option<String>,
}

pub struct ProximityScanner {
    roster: Arc<dyn RosterSource>,
    discovery: Arc<dyn DeviceDiscovery>,
    config: ScannerConfig,
}

impl ProximityScanner {
    pub fn new(
        roster: Arc<dyn RosterSource>,
        discovery: Arc<dyn DeviceDiscovery>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            roster,
            discovery,
            config,
        }
    }

    /// Scan until a trusted device is seen or `shutdown` turns true.
    ///
    /// # Returns
    /// `Ok(Some(_))` on a match, `Ok(None)` when cancelled. Only a failure to
    /// fetch the roster is an error.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Option<ScanMatch>, ScanError> {
        let roster = self.roster.trusted_devices().await?;
        info!(trusted = roster.len(), "proximity scan started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("proximity scan cancelled");
                    return Ok(None);
                }
            }

            let probe = timeout(
                self.config.probe_timeout,
                self.discovery.discover_nearby(self.config.probe_timeout),
            );
            let visible = tokio::select! {
                result = probe => match result {
                    Ok(Ok(visible)) => visible,
                    Ok(Err(DiscoveryError::Timeout)) | Err(_) => {
                        debug!("discovery probe timed out, no match this interval");
                        continue;
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "discovery probe failed, no match this interval");
                        continue;
                    }
                },
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("proximity scan cancelled during probe");
                    return Ok(None);
                }
            };

            let Some(device) = roster
                .iter()
                .find(|d| visible.contains(&d.device_address))
            else {
                debug!(visible = visible.len(), "no trusted device nearby");
                continue;
            };

            let device_name = timeout(
                self.config.name_timeout,
                self.discovery
                    .resolve_name(&device.device_address, self.config.name_timeout),
            )
            .await
            .ok()
            .flatten();

            info!(
                person = %device.person_id,
                address = %device.device_address,
                name = ?device_name,
                "trusted device in range"
            );
            return Ok(Some(ScanMatch {
                person_id: device.person_id,
                device_address: device.device_address.clone(),
                device_name,
            }));
        }
    }

    /// Run the scan on its own task.
    pub fn spawn(self) -> ScanHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (match_tx, match_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            if let Some(found) = self.run(shutdown_rx).await? {
                // Receiver may already be gone; the match is logged either way
                let _ = match_tx.send(found);
            }
            Ok(())
        });

        ScanHandle {
            shutdown: shutdown_tx,
            matched: match_rx,
            task,
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        // A dropped sender counts as shutdown
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Handle to a scan running on its own task.
pub struct ScanHandle {
    shutdown: watch::Sender<bool>,
    matched: oneshot::Receiver<ScanMatch>,
    task: JoinHandle<Result<(), ScanError>>,
}

impl ScanHandle {
    /// Ask the scan to stop. Takes effect within one interval.
    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for the scan to report a match. `None` once it ended without one.
    pub async fn matched(&mut self) -> Option<ScanMatch> {
        (&mut self.matched).await.ok()
    }

    /// Wait for the scan task to finish.
    pub async fn join(self) -> Result<(), ScanError> {
        self.task
            .await
            .map_err(|e| ScanError::Aborted(e.to_string()))?
    }
}
