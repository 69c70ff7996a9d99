//! BLE Scanner Module
//!
//! Handles advertisement scanning for Proteus modules and feeds the scan
//! registry.

use crate::domain::models::{
    AppEvent, DiscoveredPeripheral, MessageSeverity, ScannerState, StatusMessage,
};
use crate::domain::registry::{SharedRegistry, UpsertResult};
use crate::infrastructure::bluetooth::transport::{
    Advertisement, BleTransport, ScanFilterConfig, TransportError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("Scan already running")]
    AlreadyRunning,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct ScanStatus {
    state: ScannerState,
    filter: ScanFilterConfig,
    last_error: Option<String>,
}

/// Advertisement scanner for Proteus modules
pub struct AdvertisementScanner {
    transport: Arc<dyn BleTransport>,
    registry: SharedRegistry,
    status: Mutex<ScanStatus>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl AdvertisementScanner {
    /// Create a new scanner
    pub fn new(
        transport: Arc<dyn BleTransport>,
        registry: SharedRegistry,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            transport,
            registry,
            status: Mutex::new(ScanStatus {
                state: ScannerState::Created,
                filter: ScanFilterConfig::default(),
                last_error: None,
            }),
            event_sender,
        }
    }

    /// Start a new scan session
    ///
    /// Clears the registry, then asks the transport to start scanning with
    /// `config`. The filter is fixed until the next `start`.
    pub async fn start(&self, config: ScanFilterConfig) -> Result<(), ScanError> {
        {
            let mut status = self.status.lock();
            if status.state == ScannerState::Started {
                return Err(ScanError::AlreadyRunning);
            }
            status.state = ScannerState::Started;
            status.filter = config.clone();
            status.last_error = None;
            self.registry.lock().clear();
        }

        match &config.service_uuid_filter {
            Some(uuid) => info!("Starting BLE scan for service UUID: {}", uuid),
            None => info!("Starting BLE scan without service filter"),
        }

        if let Err(e) = self.transport.scan_start(&config).await {
            error!("BLE scan could not be started: {}", e);
            {
                let mut status = self.status.lock();
                status.state = ScannerState::Stopped;
                status.last_error = Some(e.to_string());
            }
            self.send_log(
                &format!("BLE scan could not be started: {}", e),
                MessageSeverity::Error,
            );
            self.send_state(ScannerState::Stopped);
            return Err(e.into());
        }

        self.send_log("Advertise watcher started.", MessageSeverity::Info);
        self.send_state(ScannerState::Started);
        Ok(())
    }

    /// Stop scanning
    ///
    /// Once this returns no advertisement touches the registry until the
    /// next `start`.
    pub async fn stop(&self) -> Result<(), ScanError> {
        {
            let mut status = self.status.lock();
            if status.state != ScannerState::Started {
                return Ok(());
            }
            status.state = ScannerState::Stopped;
        }

        info!("Stopping BLE scan...");
        self.send_state(ScannerState::Stopped);
        self.transport.scan_stop().await?;
        self.send_log("Advertise watcher stopped.", MessageSeverity::Info);
        Ok(())
    }

    /// Transport-initiated stop, e.g. a radio fault.
    pub fn on_stopped_unexpectedly(&self, error: Option<String>) {
        let was_started = {
            let mut status = self.status.lock();
            let was_started = status.state == ScannerState::Started;
            status.state = ScannerState::Stopped;
            if error.is_some() {
                status.last_error = error.clone();
            }
            was_started
        };

        match error {
            Some(reason) => {
                warn!("Scan stopped by transport: {}", reason);
                self.send_log(&format!("Error: {}", reason), MessageSeverity::Error);
            }
            None if was_started => {
                self.send_log("Advertise watcher stopped.", MessageSeverity::Info);
            }
            None => {}
        }
        if was_started {
            self.send_state(ScannerState::Stopped);
        }
    }

    /// Apply one advertisement to the registry.
    ///
    /// Any advertisement type may create an entry; only connectable ones
    /// refresh an existing entry.
    pub fn handle_advertisement(&self, adv: Advertisement) {
        let status = self.status.lock();
        if status.state != ScannerState::Started {
            return;
        }
        if let Some(uuid) = status.filter.service_uuid_filter {
            if !adv.service_uuids.contains(&uuid) {
                return;
            }
        }

        let mut registry = self.registry.lock();
        if registry.contains(&adv.mac) && !adv.kind.is_connectable() {
            return;
        }

        let candidate = DiscoveredPeripheral::new(adv.mac, adv.local_name, adv.rssi, adv.timestamp);
        match registry.upsert(candidate.clone()) {
            UpsertResult::Inserted => {
                debug!("Discovered {} ({} dBm)", candidate.mac, candidate.rssi);
                let _ = self
                    .event_sender
                    .send(AppEvent::PeripheralDiscovered(candidate));
            }
            UpsertResult::Updated(fields) => {
                for field in fields {
                    let _ = self.event_sender.send(AppEvent::PeripheralUpdated {
                        mac: candidate.mac,
                        field,
                    });
                }
            }
            UpsertResult::Unchanged | UpsertResult::Rejected => {}
        }
    }

    pub fn state(&self) -> ScannerState {
        self.status.lock().state
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.state() == ScannerState::Started
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.lock().last_error.clone()
    }

    fn send_state(&self, state: ScannerState) {
        let _ = self.event_sender.send(AppEvent::ScanStateChanged(state));
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}
