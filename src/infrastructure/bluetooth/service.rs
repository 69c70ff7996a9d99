//! Bluetooth Service Module
//!
//! Main service that coordinates scanning, connection, and data handling
//! for Proteus modules.

use crate::domain::models::{
    AppEvent, ConnectionState, DiscoveredPeripheral, ErrorCategory, ErrorEvent, MacAddress,
    MessageSeverity, StatusMessage,
};
use crate::domain::registry::{ScanRegistry, SharedRegistry};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::{
    connection::{ConnectionConfig, ConnectionError, ConnectionManager},
    protocol,
    scanner::AdvertisementScanner,
    transport::{BleTransport, ScanFilterConfig, SignalFilter, TransportEvent},
};
use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService {
    registry: SharedRegistry,
    scanner: Arc<AdvertisementScanner>,
    connection: Arc<ConnectionManager>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    settings: Arc<Mutex<SettingsService>>,
    workflow: parking_lot::Mutex<Option<JoinHandle<Result<(), ConnectionError>>>>,
    background: Vec<JoinHandle<()>>,
}

impl BluetoothService {
    /// Create a new Bluetooth service on top of `transport`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        transport: Arc<dyn BleTransport>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        settings: Arc<Mutex<SettingsService>>,
    ) -> Self {
        let registry = ScanRegistry::shared();
        let scanner = Arc::new(AdvertisementScanner::new(
            transport.clone(),
            registry.clone(),
            event_sender.clone(),
        ));
        let connection = Arc::new(ConnectionManager::new(
            transport.clone(),
            registry.clone(),
            event_sender.clone(),
        ));

        let (sink, events) = mpsc::unbounded_channel();
        transport.set_event_sink(sink);

        let background = vec![
            tokio::spawn(dispatch(events, scanner.clone(), connection.clone())),
            tokio::spawn(record_known_addresses(
                connection.subscribe_state(),
                connection.clone(),
                settings.clone(),
            )),
        ];

        Self {
            registry,
            scanner,
            connection,
            event_sender,
            settings,
            workflow: parking_lot::Mutex::new(None),
            background,
        }
    }

    /// Start scanning for devices
    pub async fn start_scan(&self) -> Result<()> {
        let filter = self.scan_filter()?;
        self.scanner.start(filter).await?;
        Ok(())
    }

    /// Stop scanning. A lone discovered device becomes the selection.
    pub async fn stop_scan(&self) -> Result<()> {
        self.scanner.stop().await?;
        let selected = self.registry.lock().select_if_single();
        if let Some(mac) = selected {
            self.send_log(&format!("Selected {}", mac), MessageSeverity::Info);
        }
        Ok(())
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn peripherals(&self) -> Vec<DiscoveredPeripheral> {
        self.registry.lock().snapshot()
    }

    /// Select a registry entry as the connection target
    pub fn select(&self, mac: MacAddress) -> bool {
        let selected = self.registry.lock().select(mac);
        if selected {
            info!("Selected device {}", mac);
        } else {
            warn!("Cannot select {}: not in scan results", mac);
        }
        selected
    }

    pub fn selected(&self) -> Option<MacAddress> {
        self.registry.lock().selected()
    }

    /// Connect to the currently selected device
    pub fn connect_selected(&self) -> Result<()> {
        let mac = self
            .selected()
            .ok_or_else(|| anyhow::anyhow!("No device selected"))?;
        self.connect(mac)
    }

    /// Connect to a device by address
    ///
    /// Returns once the attempt is accepted; progress is reported through
    /// [`AppEvent::ConnectionState`].
    pub fn connect(&self, mac: MacAddress) -> Result<()> {
        if self.scanner.is_scanning() {
            return Err(self.reject(ConnectionError::ScanInProgress).into());
        }

        // Get configuration from settings
        let config = {
            let settings = self
                .settings
                .lock()
                .map_err(|_| anyhow::anyhow!("Lock error"))?;
            ConnectionConfig::from_settings(settings.get())?
        };

        let handle = self.connection.connect(mac, config)?;
        *self.workflow.lock() = Some(handle);
        Ok(())
    }

    /// Request disconnection from the current device
    pub fn disconnect(&self) -> bool {
        self.connection.disconnect()
    }

    /// Wait for the current connection workflow to finish.
    pub async fn join(&self) -> Option<Result<(), ConnectionError>> {
        let handle = self.workflow.lock().take()?;
        match handle.await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!("Connection task ended abnormally: {}", e);
                None
            }
        }
    }

    pub async fn send(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        self.connection.send(payload).await
    }

    /// Send operator hex text as a data frame.
    pub async fn send_hex(&self, text: &str) -> Result<(), ConnectionError> {
        let payload = protocol::parse_hex(text).map_err(|e| self.reject(e.into()))?;
        self.connection.send(&payload).await
    }

    /// PIN to answer the next `ProvidePin` challenge with.
    pub fn set_operator_pin(&self, pin: &str) {
        let pin = pin.trim();
        self.connection
            .negotiator()
            .set_operator_pin((!pin.is_empty()).then(|| pin.to_string()));
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.connection.is_connecting()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    fn scan_filter(&self) -> Result<ScanFilterConfig> {
        let settings = self
            .settings
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?;
        let s = settings.get();

        let service_uuid_filter = if s.apply_uuid_filter {
            Some(protocol::parse_uuid(&s.ble_service_uuid)?)
        } else {
            None
        };
        let signal_filter = s.apply_rssi_filter.then(|| SignalFilter {
            in_range_threshold_dbm: s.in_range_threshold_dbm,
            out_of_range_threshold_dbm: s.out_of_range_threshold_dbm,
            out_of_range_timeout: Duration::from_millis(s.out_of_range_timeout_ms),
            sampling_interval: Duration::from_millis(s.sampling_interval_ms),
        });

        Ok(ScanFilterConfig {
            service_uuid_filter,
            signal_filter,
        })
    }

    fn reject(&self, err: ConnectionError) -> ConnectionError {
        warn!("{}", err);
        let _ = self.event_sender.send(AppEvent::Error(ErrorEvent {
            category: ErrorCategory::Validation,
            message: err.to_string(),
        }));
        err
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

impl Drop for BluetoothService {
    fn drop(&mut self) {
        self.connection.disconnect();
        for task in &self.background {
            task.abort();
        }
    }
}

/// Route transport events to the scanner and connection manager.
async fn dispatch(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    scanner: Arc<AdvertisementScanner>,
    connection: Arc<ConnectionManager>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::AdvertisementReceived(adv) => scanner.handle_advertisement(adv),
            TransportEvent::ScanStopped { error } => scanner.on_stopped_unexpectedly(error),
            TransportEvent::ConnectionStatusChanged { device, connected } => {
                connection.handle_connection_status(device, connected)
            }
            TransportEvent::ValueChanged {
                characteristic,
                value,
                timestamp,
            } => connection.handle_notification(characteristic, &value, timestamp),
        }
    }
    debug!("Transport event channel closed");
}

/// Persist every address that reaches `Ready`.
async fn record_known_addresses(
    mut states: watch::Receiver<ConnectionState>,
    connection: Arc<ConnectionManager>,
    settings: Arc<Mutex<SettingsService>>,
) {
    while states.changed().await.is_ok() {
        if *states.borrow_and_update() != ConnectionState::Ready {
            continue;
        }
        let Some(summary) = connection.session_summary() else {
            continue;
        };
        match settings.lock() {
            Ok(mut settings) => {
                if let Err(e) = settings.add_known_address(summary.mac) {
                    warn!("Failed to save known address {}: {}", summary.mac, e);
                }
            }
            Err(_) => warn!("Settings lock poisoned"),
        }
    }
}
