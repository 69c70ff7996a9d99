//! BLE Transport Boundary
//!
//! Abstract capability the client depends on for the actual radio work:
//! scanning, connecting, pairing and GATT access. Implementations deliver
//! asynchronous notifications as [`TransportEvent`]s on a single channel.

use crate::domain::models::MacAddress;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Opaque device handle issued by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

/// Opaque GATT service handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle(pub u64);

/// Opaque GATT characteristic handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle(pub u64);

/// Characteristic property bits (subset used here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub fn writable() -> Self {
        Self {
            write: true,
            write_without_response: true,
            ..Self::default()
        }
    }

    pub fn notifiable() -> Self {
        Self {
            notify: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub handle: CharacteristicHandle,
}

/// Signal strength filter forwarded to the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalFilter {
    pub in_range_threshold_dbm: i16,
    pub out_of_range_threshold_dbm: i16,
    pub out_of_range_timeout: Duration,
    pub sampling_interval: Duration,
}

/// Filter for one scan session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilterConfig {
    /// Restrict to advertisements exposing this service
    pub service_uuid_filter: Option<Uuid>,
    pub signal_filter: Option<SignalFilter>,
}

/// Advertising PDU types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisementKind {
    ConnectableUndirected,
    ConnectableDirected,
    ScannableUndirected,
    NonConnectableUndirected,
    ScanResponse,
    Extended,
}

impl AdvertisementKind {
    pub fn is_connectable(self) -> bool {
        matches!(
            self,
            AdvertisementKind::ConnectableUndirected | AdvertisementKind::ConnectableDirected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub mac: MacAddress,
    pub local_name: String,
    pub rssi: i16,
    /// Unix milliseconds
    pub timestamp: i64,
    pub kind: AdvertisementKind,
    pub service_uuids: Vec<Uuid>,
}

/// Pairing ceremony requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingKind {
    None,
    ConfirmOnly,
    ProvidePin,
    ConfirmPinMatch,
    DisplayPin,
    ProvidePasswordCredential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtectionLevel {
    None,
    Encryption,
    EncryptionAndAuthentication,
}

/// Pairing state of a device as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingInfo {
    pub is_paired: bool,
    pub can_pair: bool,
    pub protection_level: ProtectionLevel,
}

/// Challenge raised by the transport during pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingChallenge {
    pub kind: PairingKind,
    /// PIN shown by the peripheral for `ConfirmPinMatch` / `DisplayPin`
    pub pin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingResponse {
    Accept,
    AcceptWithPin(String),
    AcceptWithPasswordCredential { username: String, password: String },
}

/// Answers pairing challenges while [`BleTransport::pair`] is running.
pub trait PairingChallengeHandler: Send + Sync {
    fn handle_pairing_challenge(&self, challenge: &PairingChallenge) -> PairingResponse;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingStatus {
    Paired,
    AlreadyPaired,
    RequiredHandlerNotRegistered,
    Failed(String),
}

/// Asynchronous notifications from the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    AdvertisementReceived(Advertisement),
    /// Scan ended without being asked to; `None` means a clean stop
    ScanStopped { error: Option<String> },
    ConnectionStatusChanged { device: DeviceHandle, connected: bool },
    ValueChanged {
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
        /// Unix milliseconds
        timestamp: i64,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Bluetooth radio is off or absent")]
    DeviceUnavailable,
    #[error("Unknown handle")]
    InvalidHandle,
    #[error("Service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("{operation} failed: {reason}")]
    OperationFailed {
        operation: &'static str,
        reason: String,
    },
}

impl TransportError {
    pub fn failed(operation: &'static str, reason: impl Into<String>) -> Self {
        TransportError::OperationFailed {
            operation,
            reason: reason.into(),
        }
    }
}

/// Radio capability consumed by the scanner and connection manager.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Register the channel all [`TransportEvent`]s are delivered on.
    fn set_event_sink(&self, sink: mpsc::UnboundedSender<TransportEvent>);

    /// Whether the local stack can perform secure pairing at all.
    fn secure_pairing_supported(&self) -> bool;

    async fn scan_start(&self, filter: &ScanFilterConfig) -> Result<(), TransportError>;

    async fn scan_stop(&self) -> Result<(), TransportError>;

    async fn connect(&self, mac: MacAddress) -> Result<DeviceHandle, TransportError>;

    async fn pairing_info(&self, device: DeviceHandle) -> Result<PairingInfo, TransportError>;

    async fn pair(
        &self,
        device: DeviceHandle,
        kind: PairingKind,
        min_level: ProtectionLevel,
        handler: &dyn PairingChallengeHandler,
    ) -> Result<PairingStatus, TransportError>;

    async fn unpair(&self, device: DeviceHandle) -> Result<(), TransportError>;

    async fn get_primary_service(
        &self,
        device: DeviceHandle,
        uuid: Uuid,
    ) -> Result<ServiceHandle, TransportError>;

    async fn get_characteristics(
        &self,
        service: ServiceHandle,
    ) -> Result<Vec<CharacteristicInfo>, TransportError>;

    async fn subscribe(&self, characteristic: CharacteristicHandle) -> Result<(), TransportError>;

    async fn unsubscribe(&self, characteristic: CharacteristicHandle)
        -> Result<(), TransportError>;

    async fn write(
        &self,
        characteristic: CharacteristicHandle,
        value: &[u8],
    ) -> Result<(), TransportError>;

    /// Negotiated PDU size of the session carrying `characteristic`.
    async fn max_pdu_size(&self, characteristic: CharacteristicHandle)
        -> Result<usize, TransportError>;

    async fn release_service(&self, service: ServiceHandle);

    async fn close_device(&self, device: DeviceHandle);
}
