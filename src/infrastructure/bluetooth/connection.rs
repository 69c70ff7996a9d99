//! BLE Connection Module
//!
//! Drives one Proteus peripheral from "connect requested" through pairing
//! and GATT discovery to an open data channel, and back to idle.
//!
//! ```text
//! Idle -> Connecting -> [Pairing] -> ServiceDiscovery -> Ready -> Disconnecting -> Idle
//!   ^         |              |               |                        ^
//!   +---------+--------------+ (abort)       +-- missing chars -------+
//! ```
//!
//! All state lives in a single slot guarded by one lock. The workflow task
//! is the only writer of state transitions; operator calls and transport
//! callbacks only read it, except for the disconnect request flag.

use crate::domain::models::{
    format_timestamp, AppEvent, ConnectionState, ErrorCategory, ErrorEvent, InboundFrame,
    MacAddress, MessageSeverity, StatusMessage,
};
use crate::domain::registry::SharedRegistry;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::pairing::{PairingConfig, PairingError, PairingNegotiator};
use crate::infrastructure::bluetooth::protocol::{
    self, Command, FrameCodec, FrameError, NOTIFY_CHAR_UUID, SERVICE_UUID, WRITE_CHAR_UUID,
};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharacteristicHandle, CharacteristicInfo, DeviceHandle, ProtectionLevel,
    ServiceHandle, TransportError,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// PDU assumed when the transport cannot report the negotiated size
const FALLBACK_PDU: usize = 23;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Service UUID to look for
    pub service_uuid: Uuid,
    /// Characteristic the central writes frames to
    pub write_char_uuid: Uuid,
    /// Characteristic the peripheral notifies frames on
    pub notify_char_uuid: Uuid,
    /// Pair when the device supports it and is not paired yet
    pub pairing_enabled: bool,
    pub pairing: PairingConfig,
    pub unpair_on_disconnect: bool,
    /// Notification subscription attempts before falling back to send-only
    pub subscribe_attempts: u32,
    pub subscribe_retry_delay: Duration,
    /// Wait after unpairing during teardown
    pub unpair_grace: Duration,
    /// Wait after releasing handles before reporting idle
    pub disconnect_settle: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID,
            write_char_uuid: WRITE_CHAR_UUID,
            notify_char_uuid: NOTIFY_CHAR_UUID,
            pairing_enabled: false,
            pairing: PairingConfig::default(),
            unpair_on_disconnect: false,
            subscribe_attempts: 3,
            subscribe_retry_delay: Duration::from_millis(500),
            unpair_grace: Duration::from_millis(1000),
            disconnect_settle: Duration::from_millis(1000),
        }
    }
}

impl ConnectionConfig {
    pub fn from_settings(s: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            service_uuid: protocol::parse_uuid(&s.ble_service_uuid)?,
            write_char_uuid: protocol::parse_uuid(&s.ble_write_char_uuid)?,
            notify_char_uuid: protocol::parse_uuid(&s.ble_notify_char_uuid)?,
            pairing_enabled: s.pairing_enabled,
            pairing: PairingConfig {
                policy: s.security_policy.clone(),
                default_pin: s.static_pin.clone(),
                pin_length: s.pin_length,
            },
            unpair_on_disconnect: s.unpair_on_disconnect,
            subscribe_attempts: s.subscribe_attempts,
            subscribe_retry_delay: Duration::from_millis(s.subscribe_retry_delay_ms),
            unpair_grace: Duration::from_millis(s.unpair_grace_ms),
            disconnect_settle: Duration::from_millis(s.disconnect_settle_ms),
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("Invalid state for this operation: {0}")]
    InvalidState(ConnectionState),
    #[error("{0} is not the selected scan entry")]
    NotSelected(MacAddress),
    #[error("Cannot connect while scanning")]
    ScanInProgress,
    #[error("Bluetooth seems to be disabled / off")]
    DeviceUnavailable,
    #[error("Pairing failed: {0}")]
    Pairing(#[from] PairingError),
    #[error("Peripheral topology mismatch: {0}")]
    TopologyMismatch(String),
    #[error("Not connected")]
    NotConnected,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("TX Proteus payload data failed: {0}")]
    WriteFailed(String),
    #[error("Malformed hex payload: {0}")]
    MalformedHex(#[from] hex::FromHexError),
    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::DeviceUnavailable => ConnectionError::DeviceUnavailable,
            other => ConnectionError::Transport(other),
        }
    }
}

impl ConnectionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ConnectionError::DeviceUnavailable => ErrorCategory::TransportUnavailable,
            ConnectionError::Pairing(_) => ErrorCategory::Negotiation,
            ConnectionError::TopologyMismatch(_) => ErrorCategory::TopologyMismatch,
            ConnectionError::Transport(_) | ConnectionError::WriteFailed(_) => {
                ErrorCategory::TransportUnavailable
            }
            _ => ErrorCategory::Validation,
        }
    }
}

/// Operator-settable disconnect request.
#[derive(Debug, Default)]
pub struct DisconnectSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl DisconnectSignal {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolve once [`request`](Self::request) has been called.
    pub async fn wait(&self) {
        while !self.is_requested() {
            self.notify.notified().await;
        }
    }
}

/// One attempt to reach one peripheral. Owns every transport handle it
/// acquired; dropped on return to `Idle`.
#[derive(Debug)]
struct ConnectionSession {
    mac: MacAddress,
    security: ProtectionLevel,
    device: Option<DeviceHandle>,
    service: Option<ServiceHandle>,
    write: Option<CharacteristicHandle>,
    notify: Option<CharacteristicHandle>,
    codec: FrameCodec,
    subscribed: bool,
    inbound_registered: bool,
    disconnect: Arc<DisconnectSignal>,
}

impl ConnectionSession {
    fn new(mac: MacAddress) -> Self {
        Self {
            mac,
            security: ProtectionLevel::None,
            device: None,
            service: None,
            write: None,
            notify: None,
            codec: FrameCodec::default(),
            subscribed: false,
            inbound_registered: false,
            disconnect: Arc::new(DisconnectSignal::default()),
        }
    }
}

/// Read-only view of the active session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub mac: MacAddress,
    pub state: ConnectionState,
    pub security: ProtectionLevel,
    pub max_payload: usize,
    pub notifications: bool,
}

struct Slot {
    state: ConnectionState,
    session: Option<ConnectionSession>,
}

enum SetupOutcome {
    Ready,
    Cancelled,
}

/// Connection state machine for a single Proteus peripheral
pub struct ConnectionManager {
    transport: Arc<dyn BleTransport>,
    registry: SharedRegistry,
    negotiator: PairingNegotiator,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<ConnectionState>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        registry: SharedRegistry,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            transport,
            registry,
            negotiator: PairingNegotiator::new(event_sender.clone()),
            slot: Mutex::new(Slot {
                state: ConnectionState::Idle,
                session: None,
            }),
            state_tx,
            event_sender,
        }
    }

    pub fn negotiator(&self) -> &PairingNegotiator {
        &self.negotiator
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.lock().state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.state().is_connecting()
    }

    pub fn session_summary(&self) -> Option<SessionSummary> {
        let slot = self.slot.lock();
        slot.session.as_ref().map(|s| SessionSummary {
            mac: s.mac,
            state: slot.state,
            security: s.security,
            max_payload: s.codec.max_payload(),
            notifications: s.inbound_registered,
        })
    }

    /// Start a connection attempt to the selected registry entry `mac`.
    ///
    /// Validation happens before this returns; the workflow then runs on a
    /// spawned task whose result is the reason the session ended.
    pub fn connect(
        self: &Arc<Self>,
        mac: MacAddress,
        config: ConnectionConfig,
    ) -> Result<JoinHandle<Result<(), ConnectionError>>, ConnectionError> {
        {
            let mut slot = self.slot.lock();
            if slot.state != ConnectionState::Idle {
                return Err(ConnectionError::InvalidState(slot.state));
            }
            if !self.registry.lock().is_selected(&mac) {
                return Err(ConnectionError::NotSelected(mac));
            }
            slot.session = Some(ConnectionSession::new(mac));
            self.transition_locked(&mut slot, ConnectionState::Connecting);
        }

        let manager = Arc::clone(self);
        Ok(tokio::spawn(async move { manager.run(mac, config).await }))
    }

    /// Ask the active session to end. Honoured at the next state boundary.
    pub fn disconnect(&self) -> bool {
        let slot = self.slot.lock();
        match &slot.session {
            Some(session) => {
                info!("Disconnect requested for {}", session.mac);
                session.disconnect.request();
                true
            }
            None => false,
        }
    }

    /// Send user data (command `0x01`).
    pub async fn send(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        self.send_command(Command::DATA, payload).await
    }

    pub async fn send_command(&self, cmd: u8, payload: &[u8]) -> Result<(), ConnectionError> {
        let prepared = {
            let slot = self.slot.lock();
            match (&slot.session, slot.state) {
                (Some(session), ConnectionState::Ready) => match session.write {
                    Some(write) => session.codec.encode(cmd, payload).map(|f| (write, f)).map_err(Into::into),
                    None => Err(ConnectionError::NotConnected),
                },
                _ => Err(ConnectionError::NotConnected),
            }
        };
        let (write, frame) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.report(&e);
                return Err(e);
            }
        };

        match self.transport.write(write, frame.as_bytes()).await {
            Ok(()) => {
                self.send_log(
                    &format!("TX Proteus payload data: 0x{}", protocol::to_hex(frame.payload())),
                    MessageSeverity::Info,
                );
                Ok(())
            }
            Err(e) => {
                let err = ConnectionError::WriteFailed(e.to_string());
                self.report(&err);
                Err(err)
            }
        }
    }

    /// Value-changed callback from the transport.
    pub fn handle_notification(&self, characteristic: CharacteristicHandle, value: &[u8], timestamp: i64) {
        let registered = {
            let slot = self.slot.lock();
            slot.session
                .as_ref()
                .is_some_and(|s| s.inbound_registered && s.notify == Some(characteristic))
        };
        if !registered {
            trace!("Ignoring notification on {:?}", characteristic);
            return;
        }

        let (cmd, payload) = match protocol::decode(value) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Discarding notification: {}", e);
                return;
            }
        };

        let hex = protocol::to_hex(&payload);
        let line = match Command::from(cmd) {
            Command::Data => format!("RX Proteus payload data: 0x{}", hex),
            Command::HighThroughputData => format!(
                "RX Proteus payload data (high throughput mode) - time: {} - 0x{}",
                format_timestamp(timestamp),
                hex
            ),
            Command::Other(code) => format!("RX Proteus cmd(0x{:02X}) - data: 0x{}", code, hex),
        };
        self.send_log(&line, MessageSeverity::Info);
        let _ = self.event_sender.send(AppEvent::FrameReceived(InboundFrame {
            command: cmd,
            payload,
            timestamp,
        }));
    }

    /// Connection-status callback from the transport.
    pub fn handle_connection_status(&self, device: DeviceHandle, connected: bool) {
        let ours = {
            let slot = self.slot.lock();
            slot.session.as_ref().is_some_and(|s| s.device == Some(device))
        };
        if !ours {
            return;
        }
        if connected {
            self.send_log("Event: Connected to device.", MessageSeverity::Info);
        } else {
            self.send_log("Event: Disconnected from device.", MessageSeverity::Warning);
        }
    }

    async fn run(self: Arc<Self>, mac: MacAddress, config: ConnectionConfig) -> Result<(), ConnectionError> {
        match self.setup(mac, &config).await {
            Ok(SetupOutcome::Ready) => {
                if let Some(signal) = self.disconnect_signal() {
                    signal.wait().await;
                }
                self.teardown(&config).await;
                Ok(())
            }
            Ok(SetupOutcome::Cancelled) => {
                info!("Disconnect requested during setup of {}", mac);
                self.teardown(&config).await;
                Ok(())
            }
            Err(e @ ConnectionError::TopologyMismatch(_)) => {
                self.report(&e);
                if let Some(signal) = self.disconnect_signal() {
                    signal.request();
                }
                self.teardown(&config).await;
                Err(e)
            }
            Err(e) => {
                self.report(&e);
                self.abort().await;
                Err(e)
            }
        }
    }

    async fn setup(&self, mac: MacAddress, config: &ConnectionConfig) -> Result<SetupOutcome, ConnectionError> {
        info!("Connecting to Bluetooth device: {}", mac);
        self.send_log(&format!("Connecting to device {}...", mac), MessageSeverity::Info);

        let device = self.transport.connect(mac).await?;
        self.update_session(|s| s.device = Some(device));
        if self.cancel_requested() {
            return Ok(SetupOutcome::Cancelled);
        }

        let device = self.secure(mac, device, config).await?;
        if self.cancel_requested() {
            return Ok(SetupOutcome::Cancelled);
        }

        self.transition(ConnectionState::ServiceDiscovery);
        let (write, notify) = self.discover(device, config).await?;
        let subscribed = self.subscribe_notifications(notify, config).await;
        if subscribed {
            self.update_session(|s| {
                s.subscribed = true;
                s.inbound_registered = true;
            });
        } else {
            warn!("Notifications unavailable; continuing in send-only mode");
            self.report_degraded("Could not enable notifications; channel is send-only");
        }
        if self.cancel_requested() {
            return Ok(SetupOutcome::Cancelled);
        }

        let uplink = self.pdu_size(notify).await;
        let downlink = self.pdu_size(write).await;
        let pdu = uplink.min(downlink);
        let codec = FrameCodec::for_pdu(pdu);
        self.update_session(|s| s.codec = codec);
        self.send_log(&format!("Info: Negotiated PDU = {} bytes", pdu), MessageSeverity::Info);
        self.send_log(
            &format!("Info: Max user payload = (PDU - 4) = {} bytes", codec.max_payload()),
            MessageSeverity::Info,
        );

        self.transition(ConnectionState::Ready);
        self.send_log("Indication: Channel open", MessageSeverity::Success);
        let _ = self.event_sender.send(AppEvent::ChannelOpen {
            mac,
            max_payload: codec.max_payload(),
        });
        Ok(SetupOutcome::Ready)
    }

    /// Pairing step. Returns the device handle to use for GATT access.
    async fn secure(
        &self,
        mac: MacAddress,
        device: DeviceHandle,
        config: &ConnectionConfig,
    ) -> Result<DeviceHandle, ConnectionError> {
        if !self.transport.secure_pairing_supported() {
            warn!("Secure pairing not supported by the local transport");
            self.send_log("Secure pairing not supported by this device", MessageSeverity::Warning);
            return Ok(device);
        }

        let info = self.transport.pairing_info(device).await?;
        if info.is_paired {
            self.transition(ConnectionState::Pairing);
            self.report_protection(info.protection_level);
            let fresh = self.refresh_device(mac, device).await?;
            self.update_session(|s| s.security = info.protection_level);
            return Ok(fresh);
        }

        if !(info.can_pair && config.pairing_enabled) {
            debug!(
                "Pairing skipped (can_pair: {}, enabled: {})",
                info.can_pair, config.pairing_enabled
            );
            return Ok(device);
        }

        self.transition(ConnectionState::Pairing);
        let status = self
            .negotiator
            .negotiate(&*self.transport, device, &config.pairing)
            .await?;
        debug!("Pairing status {:?}, reloading device", status);

        let fresh = self.refresh_device(mac, device).await?;
        let level = match self.transport.pairing_info(fresh).await {
            Ok(info) => info.protection_level,
            Err(e) => {
                warn!("Could not read protection level: {}", e);
                ProtectionLevel::None
            }
        };
        self.report_protection(level);
        self.update_session(|s| s.security = level);
        Ok(fresh)
    }

    /// Drop `old` and request a new handle so GATT services are visible.
    async fn refresh_device(&self, mac: MacAddress, old: DeviceHandle) -> Result<DeviceHandle, ConnectionError> {
        self.update_session(|s| s.device = None);
        self.transport.close_device(old).await;
        let fresh = self.transport.connect(mac).await?;
        self.update_session(|s| s.device = Some(fresh));
        Ok(fresh)
    }

    async fn discover(
        &self,
        device: DeviceHandle,
        config: &ConnectionConfig,
    ) -> Result<(CharacteristicHandle, CharacteristicHandle), ConnectionError> {
        let service = self
            .transport
            .get_primary_service(device, config.service_uuid)
            .await
            .map_err(|e| ConnectionError::TopologyMismatch(format!("primary service: {}", e)))?;
        self.update_session(|s| s.service = Some(service));
        self.send_log(&format!("Found service UUID: {}", config.service_uuid), MessageSeverity::Info);

        let characteristics = self
            .transport
            .get_characteristics(service)
            .await
            .map_err(|e| ConnectionError::TopologyMismatch(format!("characteristics: {}", e)))?;
        let (write, notify) = select_characteristics(&characteristics, config)?;
        self.update_session(|s| {
            s.write = Some(write);
            s.notify = Some(notify);
        });
        Ok((write, notify))
    }

    async fn subscribe_notifications(&self, notify: CharacteristicHandle, config: &ConnectionConfig) -> bool {
        let attempts = config.subscribe_attempts.max(1);
        for attempt in 1..=attempts {
            match self.transport.subscribe(notify).await {
                Ok(()) => {
                    info!("Notifications enabled successfully");
                    self.send_log(
                        "Enabled notifications for Proteus RX Characteristic.",
                        MessageSeverity::Success,
                    );
                    return true;
                }
                Err(e) => {
                    warn!("Notification subscription attempt {} failed: {}", attempt, e);
                    if attempt < attempts {
                        tokio::time::sleep(config.subscribe_retry_delay).await;
                    }
                }
            }
        }
        false
    }

    async fn pdu_size(&self, characteristic: CharacteristicHandle) -> usize {
        match self.transport.max_pdu_size(characteristic).await {
            Ok(size) => size,
            Err(e) => {
                warn!("Could not read PDU size, assuming {}: {}", FALLBACK_PDU, e);
                FALLBACK_PDU
            }
        }
    }

    /// Graceful path back to `Idle`, valid from any point of setup.
    async fn teardown(&self, config: &ConnectionConfig) {
        if self.state() != ConnectionState::Disconnecting {
            self.transition(ConnectionState::Disconnecting);
        }

        let (device, notify, subscribed) = {
            let mut slot = self.slot.lock();
            match slot.session.as_mut() {
                Some(s) => {
                    if s.inbound_registered {
                        s.inbound_registered = false;
                        debug!("Inbound frame handler unregistered");
                    }
                    (s.device, s.notify, s.subscribed)
                }
                None => (None, None, false),
            }
        };

        if config.unpair_on_disconnect {
            if let Some(device) = device {
                self.send_log("Indication: Unpairing device. please wait...", MessageSeverity::Info);
                if let Err(e) = self.transport.unpair(device).await {
                    warn!("Unpair failed: {}", e);
                    self.report_degraded(&format!("Unpair failed: {}", e));
                }
                tokio::time::sleep(config.unpair_grace).await;
            }
        }

        if subscribed {
            if let Some(notify) = notify {
                match self.transport.unsubscribe(notify).await {
                    Ok(()) => {
                        self.update_session(|s| s.subscribed = false);
                        self.send_log(
                            "Notifications for received data from Proteus disabled.",
                            MessageSeverity::Info,
                        );
                    }
                    Err(e) => {
                        warn!("Error while disabling notifications: {}", e);
                        self.report_degraded(&format!("Disabling notifications failed: {}", e));
                    }
                }
            }
        }

        self.release_handles().await;
        self.send_log("Disconnected from Proteus.", MessageSeverity::Info);
        tokio::time::sleep(config.disconnect_settle).await;
        self.finish();
    }

    /// Direct path back to `Idle` after an unrecoverable failure.
    async fn abort(&self) {
        self.release_handles().await;
        self.finish();
    }

    async fn release_handles(&self) {
        let (service, device) = {
            let mut slot = self.slot.lock();
            match slot.session.as_mut() {
                Some(s) => {
                    s.write = None;
                    s.notify = None;
                    s.inbound_registered = false;
                    (s.service.take(), s.device.take())
                }
                None => (None, None),
            }
        };
        if let Some(service) = service {
            self.transport.release_service(service).await;
        }
        if let Some(device) = device {
            self.transport.close_device(device).await;
        }
    }

    fn finish(&self) {
        let mut slot = self.slot.lock();
        slot.session = None;
        self.transition_locked(&mut slot, ConnectionState::Idle);
        let _ = self
            .event_sender
            .send(AppEvent::LogMessage(StatusMessage {
                message: "Connection closed".to_string(),
                severity: MessageSeverity::Info,
            }));
    }

    fn transition(&self, to: ConnectionState) {
        let mut slot = self.slot.lock();
        self.transition_locked(&mut slot, to);
    }

    fn transition_locked(&self, slot: &mut Slot, to: ConnectionState) {
        let from = slot.state;
        if !from.can_transition_to(to) {
            error!("Rejected state transition {} -> {}", from, to);
            return;
        }
        slot.state = to;
        self.state_tx.send_replace(to);
        info!("Connection state: {} -> {}", from, to);
        let _ = self.event_sender.send(AppEvent::ConnectionState { from, to });
    }

    fn update_session(&self, f: impl FnOnce(&mut ConnectionSession)) {
        if let Some(session) = self.slot.lock().session.as_mut() {
            f(session);
        }
    }

    fn disconnect_signal(&self) -> Option<Arc<DisconnectSignal>> {
        self.slot.lock().session.as_ref().map(|s| Arc::clone(&s.disconnect))
    }

    fn cancel_requested(&self) -> bool {
        self.slot
            .lock()
            .session
            .as_ref()
            .is_some_and(|s| s.disconnect.is_requested())
    }

    fn report_protection(&self, level: ProtectionLevel) {
        let line = match level {
            ProtectionLevel::EncryptionAndAuthentication => {
                "Info: Paired, EncryptionAndAuthentication was established."
            }
            ProtectionLevel::Encryption => "Info: Paired, Encryption was established.",
            ProtectionLevel::None => "Info: Paired, but No Encryption or Authentication was established.",
        };
        self.send_log(line, MessageSeverity::Info);
    }

    fn report(&self, err: &ConnectionError) {
        error!("{}", err);
        self.send_log(&format!("Error: {}", err), MessageSeverity::Error);
        let _ = self.event_sender.send(AppEvent::Error(ErrorEvent {
            category: err.category(),
            message: err.to_string(),
        }));
    }

    fn report_degraded(&self, message: &str) {
        self.send_log(message, MessageSeverity::Warning);
        let _ = self.event_sender.send(AppEvent::Error(ErrorEvent {
            category: ErrorCategory::Degraded,
            message: message.to_string(),
        }));
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

/// Pick the write and notify characteristics out of a service listing.
fn select_characteristics(
    characteristics: &[CharacteristicInfo],
    config: &ConnectionConfig,
) -> Result<(CharacteristicHandle, CharacteristicHandle), ConnectionError> {
    let mut write = None;
    let mut notify = None;

    for c in characteristics {
        if c.uuid == config.write_char_uuid {
            info!("Found Proteus TX characteristic: {}", c.uuid);
            if !(c.properties.write || c.properties.write_without_response) {
                warn!("TX characteristic is not writable");
            } else if write.is_none() {
                write = Some(c.handle);
            } else {
                warn!("Ignoring duplicate TX characteristic {:?}", c.handle);
            }
        } else if c.uuid == config.notify_char_uuid {
            info!("Found Proteus RX characteristic: {}", c.uuid);
            if !c.properties.notify {
                warn!("RX characteristic has no notify property");
            } else if notify.is_none() {
                notify = Some(c.handle);
            } else {
                warn!("Ignoring duplicate RX characteristic {:?}", c.handle);
            }
        } else {
            debug!("Found unknown characteristic: {}", c.uuid);
        }
    }

    match (write, notify) {
        (Some(write), Some(notify)) => Ok((write, notify)),
        (None, _) => Err(ConnectionError::TopologyMismatch(format!(
            "write characteristic {} missing",
            config.write_char_uuid
        ))),
        (_, None) => Err(ConnectionError::TopologyMismatch(format!(
            "notify characteristic {} missing",
            config.notify_char_uuid
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DiscoveredPeripheral;
    use crate::domain::registry::ScanRegistry;
    use crate::infrastructure::bluetooth::simulated::{SimulatedPeripheral, SimulatedTransport};
    use crate::infrastructure::bluetooth::transport::{
        CharacteristicProperties, PairingStatus, TransportEvent,
    };

    const MAC: u64 = 0x0018_DA00_0002;

    struct Harness {
        manager: Arc<ConnectionManager>,
        transport: Arc<SimulatedTransport>,
        registry: SharedRegistry,
        events: mpsc::UnboundedReceiver<AppEvent>,
    }

    impl Harness {
        fn new(peripheral: SimulatedPeripheral) -> Self {
            let (tx, events) = mpsc::unbounded_channel();
            let transport = Arc::new(SimulatedTransport::new());
            let registry = ScanRegistry::shared();
            {
                let mut r = registry.lock();
                r.upsert(DiscoveredPeripheral::new(peripheral.mac, "Proteus", -60, 1));
                r.select(peripheral.mac);
            }
            transport.add_peripheral(peripheral);
            let manager = Arc::new(ConnectionManager::new(transport.clone(), registry.clone(), tx));
            Self {
                manager,
                transport,
                registry,
                events,
            }
        }

        fn states(&mut self) -> Vec<ConnectionState> {
            let mut states = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let AppEvent::ConnectionState { to, .. } = event {
                    states.push(to);
                }
            }
            states
        }

        fn errors(&mut self) -> Vec<ErrorEvent> {
            let mut errors = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let AppEvent::Error(e) = event {
                    errors.push(e);
                }
            }
            errors
        }

        async fn wait_for(&self, state: ConnectionState) {
            let mut rx = self.manager.subscribe_state();
            rx.wait_for(|s| *s == state).await.unwrap();
        }
    }

    fn mac() -> MacAddress {
        MacAddress::new(MAC)
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            subscribe_retry_delay: Duration::ZERO,
            unpair_grace: Duration::ZERO,
            disconnect_settle: Duration::ZERO,
            ..ConnectionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_send_disconnect() {
        let mut h = Harness::new(SimulatedPeripheral::proteus(mac()));
        let task = h.manager.connect(mac(), fast_config()).unwrap();
        h.wait_for(ConnectionState::Ready).await;

        let summary = h.manager.session_summary().unwrap();
        assert_eq!(summary.max_payload, 243);
        assert!(summary.notifications);
        assert!(h.manager.is_connected());

        h.manager.send(&[0xDE, 0xAD]).await.unwrap();
        assert_eq!(h.transport.writes(), vec![(mac(), vec![0x01, 0xDE, 0xAD])]);

        assert!(h.manager.disconnect());
        task.await.unwrap().unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Idle);
        assert_eq!(h.transport.open_handles(), 0);
        assert_eq!(h.transport.subscription_count(), 0);

        assert_eq!(
            h.states(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::ServiceDiscovery,
                ConnectionState::Ready,
                ConnectionState::Disconnecting,
                ConnectionState::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn test_echo_delivered_as_frame() {
        let mut h = Harness::new(SimulatedPeripheral::proteus(mac()));
        let (tx, mut transport_events) = mpsc::unbounded_channel();
        h.transport.set_event_sink(tx);

        let task = h.manager.connect(mac(), fast_config()).unwrap();
        h.wait_for(ConnectionState::Ready).await;
        h.manager.send_command(0x04, &[0x11]).await.unwrap();

        while let Ok(event) = transport_events.try_recv() {
            if let TransportEvent::ValueChanged {
                characteristic,
                value,
                timestamp,
            } = event
            {
                h.manager.handle_notification(characteristic, &value, timestamp);
            }
        }

        let mut frames = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            if let AppEvent::FrameReceived(frame) = event {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, 0x04);
        assert_eq!(frames[0].payload, vec![0x11]);

        h.manager.disconnect();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_requires_selection() {
        let h = Harness::new(SimulatedPeripheral::proteus(mac()));
        let other = MacAddress::new(0xAABB_CCDD_EEFF);
        assert_eq!(
            h.manager.connect(other, fast_config()).unwrap_err(),
            ConnectionError::NotSelected(other)
        );
        assert_eq!(h.manager.state(), ConnectionState::Idle);
        assert_eq!(h.transport.connect_count(), 0);

        h.registry.lock().clear();
        assert_eq!(
            h.manager.connect(mac(), fast_config()).unwrap_err(),
            ConnectionError::NotSelected(mac())
        );
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let h = Harness::new(SimulatedPeripheral::proteus(mac()));
        let task = h.manager.connect(mac(), fast_config()).unwrap();
        assert_eq!(
            h.manager.connect(mac(), fast_config()).unwrap_err(),
            ConnectionError::InvalidState(ConnectionState::Connecting)
        );
        h.manager.disconnect();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_radio_off_returns_to_idle() {
        let mut h = Harness::new(SimulatedPeripheral::proteus(mac()));
        h.transport.set_radio_on(false);
        let task = h.manager.connect(mac(), fast_config()).unwrap();
        assert_eq!(task.await.unwrap(), Err(ConnectionError::DeviceUnavailable));
        assert_eq!(h.manager.state(), ConnectionState::Idle);
        assert!(h.manager.session_summary().is_none());
        let errors = h.errors();
        assert_eq!(errors[0].category, ErrorCategory::TransportUnavailable);
    }

    #[tokio::test]
    async fn test_send_rejected_when_not_ready() {
        let h = Harness::new(SimulatedPeripheral::proteus(mac()));
        assert_eq!(h.manager.send(&[1]).await, Err(ConnectionError::NotConnected));
        assert!(h.transport.writes().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let h = Harness::new(SimulatedPeripheral::proteus(mac()).with_pdu(27, 30));
        let task = h.manager.connect(mac(), fast_config()).unwrap();
        h.wait_for(ConnectionState::Ready).await;
        assert_eq!(h.manager.session_summary().unwrap().max_payload, 23);

        assert!(h.manager.send(&[0u8; 22]).await.is_ok());
        assert!(matches!(
            h.manager.send(&[0u8; 23]).await,
            Err(ConnectionError::Frame(FrameError::PayloadTooLarge { .. }))
        ));
        assert_eq!(h.manager.state(), ConnectionState::Ready);
        assert_eq!(h.transport.writes().len(), 1);

        h.manager.disconnect();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_notify_characteristic_never_ready() {
        let mut h = Harness::new(SimulatedPeripheral::proteus(mac()).without_characteristic(NOTIFY_CHAR_UUID));
        let task = h.manager.connect(mac(), fast_config()).unwrap();
        assert!(matches!(task.await.unwrap(), Err(ConnectionError::TopologyMismatch(_))));
        let states = h.states();
        assert!(!states.contains(&ConnectionState::Ready));
        assert_eq!(states.last(), Some(&ConnectionState::Idle));
        assert!(states.contains(&ConnectionState::Disconnecting));
        assert_eq!(h.transport.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_missing_service_never_ready() {
        let mut h = Harness::new(SimulatedPeripheral::proteus(mac()).without_service());
        let task = h.manager.connect(mac(), fast_config()).unwrap();
        assert!(matches!(task.await.unwrap(), Err(ConnectionError::TopologyMismatch(_))));
        assert!(!h.states().contains(&ConnectionState::Ready));
        assert_eq!(h.transport.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_non_writable_tx_is_mismatch() {
        let peripheral = SimulatedPeripheral::proteus(mac())
            .without_characteristic(WRITE_CHAR_UUID)
            .with_extra_characteristic(WRITE_CHAR_UUID, CharacteristicProperties::notifiable());
        let h = Harness::new(peripheral);
        let task = h.manager.connect(mac(), fast_config()).unwrap();
        assert!(matches!(task.await.unwrap(), Err(ConnectionError::TopologyMismatch(_))));
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_degraded() {
        let mut h = Harness::new(SimulatedPeripheral::proteus(mac()).with_failing_subscribe());
        let task = h.manager.connect(mac(), fast_config()).unwrap();
        h.wait_for(ConnectionState::Ready).await;
        assert!(!h.manager.session_summary().unwrap().notifications);
        h.manager.send(&[0x42]).await.unwrap();

        h.manager.disconnect();
        task.await.unwrap().unwrap();
        let errors = h.errors();
        assert!(errors.iter().any(|e| e.category == ErrorCategory::Degraded));
    }

    #[tokio::test]
    async fn test_pairing_then_reload_device() {
        let mut config = fast_config();
        config.pairing_enabled = true;
        let mut h = Harness::new(SimulatedPeripheral::proteus(mac()));
        let task = h.manager.connect(mac(), config).unwrap();
        h.wait_for(ConnectionState::Ready).await;

        assert!(h.transport.is_paired(mac()));
        assert_eq!(h.transport.connect_count(), 2);
        assert_eq!(
            h.manager.session_summary().unwrap().security,
            ProtectionLevel::EncryptionAndAuthentication
        );
        assert!(h.states().contains(&ConnectionState::Pairing));

        h.manager.disconnect();
        task.await.unwrap().unwrap();
        assert_eq!(h.transport.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_already_paired_skips_negotiation() {
        let h = Harness::new(
            SimulatedPeripheral::proteus(mac())
                .already_paired()
                .with_pairing_status(PairingStatus::Failed("should not be called".into())),
        );
        let task = h.manager.connect(mac(), fast_config()).unwrap();
        h.wait_for(ConnectionState::Ready).await;
        assert_eq!(h.transport.connect_count(), 2);
        h.manager.disconnect();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pairing_rejection_aborts() {
        let mut config = fast_config();
        config.pairing_enabled = true;
        let mut h = Harness::new(
            SimulatedPeripheral::proteus(mac())
                .with_pairing_status(PairingStatus::RequiredHandlerNotRegistered),
        );
        let task = h.manager.connect(mac(), config).unwrap();
        assert_eq!(
            task.await.unwrap(),
            Err(ConnectionError::Pairing(PairingError::RequiredHandlerNotRegistered))
        );
        assert_eq!(h.transport.open_handles(), 0);
        let states = h.states();
        assert_eq!(
            states,
            vec![ConnectionState::Connecting, ConnectionState::Pairing, ConnectionState::Idle]
        );
    }

    #[tokio::test]
    async fn test_unsupported_policy_aborts() {
        let mut config = fast_config();
        config.pairing_enabled = true;
        config.pairing.policy = "LESC_Passkey".to_string();
        let mut h = Harness::new(SimulatedPeripheral::proteus(mac()));
        let task = h.manager.connect(mac(), config).unwrap();
        assert!(matches!(
            task.await.unwrap(),
            Err(ConnectionError::Pairing(PairingError::UnsupportedSecurityPolicy(_)))
        ));
        assert_eq!(h.errors()[0].category, ErrorCategory::Negotiation);
        assert_eq!(h.transport.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_no_secure_pairing_support_skips_pairing() {
        let mut config = fast_config();
        config.pairing_enabled = true;
        let mut h = Harness::new(SimulatedPeripheral::proteus(mac()));
        h.transport.set_secure_pairing_supported(false);
        let task = h.manager.connect(mac(), config).unwrap();
        h.wait_for(ConnectionState::Ready).await;
        assert!(!h.transport.is_paired(mac()));
        assert!(!h.states().contains(&ConnectionState::Pairing));
        h.manager.disconnect();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_during_setup() {
        let mut h = Harness::new(
            SimulatedPeripheral::proteus(mac()).with_connect_delay(Duration::from_millis(50)),
        );
        let task = h.manager.connect(mac(), fast_config()).unwrap();
        assert!(h.manager.is_connecting());
        assert!(h.manager.disconnect());
        task.await.unwrap().unwrap();

        let states = h.states();
        assert!(!states.contains(&ConnectionState::Ready));
        assert_eq!(
            &states[states.len() - 2..],
            &[ConnectionState::Disconnecting, ConnectionState::Idle]
        );
        assert_eq!(h.transport.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_unpair_on_disconnect() {
        let mut config = fast_config();
        config.pairing_enabled = true;
        config.unpair_on_disconnect = true;
        let h = Harness::new(SimulatedPeripheral::proteus(mac()).with_failing_unsubscribe());
        let task = h.manager.connect(mac(), config).unwrap();
        h.wait_for(ConnectionState::Ready).await;
        h.manager.disconnect();
        task.await.unwrap().unwrap();

        assert_eq!(h.transport.unpair_count(), 1);
        assert!(!h.transport.is_paired(mac()));
        assert_eq!(h.manager.state(), ConnectionState::Idle);
        assert_eq!(h.transport.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_no_handle_leak_across_cycles() {
        let h = Harness::new(SimulatedPeripheral::proteus(mac()));
        for _ in 0..3 {
            let task = h.manager.connect(mac(), fast_config()).unwrap();
            h.wait_for(ConnectionState::Ready).await;
            h.manager.disconnect();
            task.await.unwrap().unwrap();
            assert_eq!(h.manager.state(), ConnectionState::Idle);
            assert_eq!(h.transport.open_handles(), 0);
        }
        assert_eq!(h.transport.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_notifications_ignored_after_teardown() {
        let mut h = Harness::new(SimulatedPeripheral::proteus(mac()));
        let task = h.manager.connect(mac(), fast_config()).unwrap();
        h.wait_for(ConnectionState::Ready).await;
        h.manager.disconnect();
        task.await.unwrap().unwrap();
        while h.events.try_recv().is_ok() {}

        h.manager.handle_notification(CharacteristicHandle(1), &[0x01, 0x02], 0);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_while_pairing() {
        let mut config = fast_config();
        config.pairing_enabled = true;
        let mut h = Harness::new(
            SimulatedPeripheral::proteus(mac()).with_connect_delay(Duration::from_millis(30)),
        );
        let task = h.manager.connect(mac(), config).unwrap();
        h.wait_for(ConnectionState::Pairing).await;
        assert!(h.manager.disconnect());
        task.await.unwrap().unwrap();

        assert_eq!(
            h.states(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Pairing,
                ConnectionState::Disconnecting,
                ConnectionState::Idle,
            ]
        );
        assert_eq!(h.transport.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_during_service_discovery() {
        let config = ConnectionConfig {
            subscribe_retry_delay: Duration::from_millis(30),
            ..fast_config()
        };
        let mut h = Harness::new(SimulatedPeripheral::proteus(mac()).with_failing_subscribe());
        let task = h.manager.connect(mac(), config).unwrap();
        h.wait_for(ConnectionState::ServiceDiscovery).await;
        assert!(h.manager.disconnect());
        task.await.unwrap().unwrap();

        assert_eq!(
            h.states(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::ServiceDiscovery,
                ConnectionState::Disconnecting,
                ConnectionState::Idle,
            ]
        );
        assert_eq!(h.transport.open_handles(), 0);
        assert_eq!(h.transport.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_link_drop_reported_without_teardown() {
        let mut h = Harness::new(SimulatedPeripheral::proteus(mac()));
        let (tx, mut transport_events) = mpsc::unbounded_channel();
        h.transport.set_event_sink(tx);

        let task = h.manager.connect(mac(), fast_config()).unwrap();
        h.wait_for(ConnectionState::Ready).await;
        while transport_events.try_recv().is_ok() {}
        while h.events.try_recv().is_ok() {}

        h.transport.drop_link(mac());
        assert!(h.transport.notify(mac(), &[0x01, 0x55]));
        while let Ok(event) = transport_events.try_recv() {
            match event {
                TransportEvent::ConnectionStatusChanged { device, connected } => {
                    h.manager.handle_connection_status(device, connected)
                }
                TransportEvent::ValueChanged {
                    characteristic,
                    value,
                    timestamp,
                } => h.manager.handle_notification(characteristic, &value, timestamp),
                _ => {}
            }
        }

        let mut lines = Vec::new();
        let mut frames = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            match event {
                AppEvent::LogMessage(msg) => lines.push(msg.message),
                AppEvent::FrameReceived(frame) => frames.push(frame.payload),
                _ => {}
            }
        }
        assert_eq!(lines[0], "Event: Disconnected from device.");
        assert_eq!(frames, vec![vec![0x55]]);
        assert_eq!(h.manager.state(), ConnectionState::Ready);

        h.manager.disconnect();
        task.await.unwrap().unwrap();
        assert_eq!(h.transport.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_peripheral_without_pairing_support() {
        let mut config = fast_config();
        config.pairing_enabled = true;
        let mut h = Harness::new(SimulatedPeripheral::proteus(mac()).without_pairing());
        let task = h.manager.connect(mac(), config).unwrap();
        h.wait_for(ConnectionState::Ready).await;

        assert!(!h.states().contains(&ConnectionState::Pairing));
        assert_eq!(h.transport.connect_count(), 1);
        assert!(!h.transport.is_paired(mac()));

        h.manager.disconnect();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            ConnectionError::WriteFailed("GATT unreachable".into()).category(),
            ErrorCategory::TransportUnavailable
        );
        assert_eq!(
            ConnectionError::DeviceUnavailable.category(),
            ErrorCategory::TransportUnavailable
        );
        assert_eq!(ConnectionError::NotConnected.category(), ErrorCategory::Validation);
        assert_eq!(
            ConnectionError::InvalidState(ConnectionState::Ready).category(),
            ErrorCategory::Validation
        );
    }

    #[test]
    fn test_select_characteristics_ignores_unknown() {
        let config = ConnectionConfig::default();
        let chars = vec![
            CharacteristicInfo {
                uuid: Uuid::from_u128(0x2A00),
                properties: CharacteristicProperties::default(),
                handle: CharacteristicHandle(1),
            },
            CharacteristicInfo {
                uuid: WRITE_CHAR_UUID,
                properties: CharacteristicProperties::writable(),
                handle: CharacteristicHandle(2),
            },
            CharacteristicInfo {
                uuid: NOTIFY_CHAR_UUID,
                properties: CharacteristicProperties::notifiable(),
                handle: CharacteristicHandle(3),
            },
        ];
        assert_eq!(
            select_characteristics(&chars, &config).unwrap(),
            (CharacteristicHandle(2), CharacteristicHandle(3))
        );
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = Settings::default();
        settings.pairing_enabled = true;
        settings.static_pin = "000111".to_string();
        let config = ConnectionConfig::from_settings(&settings).unwrap();
        assert_eq!(config.service_uuid, SERVICE_UUID);
        assert!(config.pairing_enabled);
        assert_eq!(config.pairing.default_pin, "000111");

        settings.ble_notify_char_uuid = "not-a-uuid".to_string();
        assert!(ConnectionConfig::from_settings(&settings).is_err());
    }
}
