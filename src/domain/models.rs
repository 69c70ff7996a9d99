use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 48-bit Bluetooth device address.
///
/// Displayed in canonical form as 12 upper-case hex digits without
/// separators (`AABBCCDDEEFF`). Ordering follows the numeric value, which is
/// the same as ordering the canonical strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MacAddress(u64);

impl MacAddress {
    const MASK: u64 = 0xFFFF_FFFF_FFFF;

    /// Build an address from the low 48 bits of `raw`.
    pub fn new(raw: u64) -> Self {
        Self(raw & Self::MASK)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012X}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0}")]
pub struct ParseMacError(String);

impl FromStr for MacAddress {
    type Err = ParseMacError;

    /// Accepts `AABBCCDDEEFF`, `aa:bb:cc:dd:ee:ff` and `AA-BB-CC-DD-EE-FF`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseMacError(s.to_string()));
        }
        u64::from_str_radix(&digits, 16)
            .map(MacAddress)
            .map_err(|_| ParseMacError(s.to_string()))
    }
}

/// A peripheral seen during scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPeripheral {
    pub mac: MacAddress,
    /// Advertised local name, may be empty
    pub name: String,
    /// Signal strength in dBm
    pub rssi: i16,
    /// Last-seen time (Unix milliseconds)
    pub last_seen: i64,
}

impl DiscoveredPeripheral {
    pub fn new(mac: MacAddress, name: impl Into<String>, rssi: i16, last_seen: i64) -> Self {
        Self {
            mac,
            name: name.into(),
            rssi,
            last_seen,
        }
    }

    /// Last-seen time as `HH:MM:SS.mmm` (UTC).
    pub fn last_seen_label(&self) -> String {
        format_timestamp(self.last_seen)
    }
}

/// Field of a [`DiscoveredPeripheral`] that changed on update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeripheralField {
    Name,
    Rssi,
    LastSeen,
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Pairing,
    ServiceDiscovery,
    Ready,
    Disconnecting,
}

impl ConnectionState {
    /// Whether the machine may move from `self` to `next`.
    ///
    /// Any state may fall back to `Idle` on an unrecoverable failure.
    /// `Ready` is entered only from `ServiceDiscovery`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Idle) => self != Idle,
            (Idle, Connecting) => true,
            (Connecting, Pairing) | (Connecting, ServiceDiscovery) => true,
            (Pairing, ServiceDiscovery) => true,
            (ServiceDiscovery, Ready) => true,
            (Connecting | Pairing | ServiceDiscovery | Ready, Disconnecting) => true,
            _ => false,
        }
    }

    /// A connect attempt is in progress but the data channel is not open yet.
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Pairing | ConnectionState::ServiceDiscovery
        )
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Ready
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Pairing => "Pairing",
            ConnectionState::ServiceDiscovery => "ServiceDiscovery",
            ConnectionState::Ready => "Ready",
            ConnectionState::Disconnecting => "Disconnecting",
        };
        f.write_str(label)
    }
}

/// Application-layer frame received from the peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub command: u8,
    pub payload: Vec<u8>,
    /// Transport timestamp (Unix milliseconds)
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    LogMessage(StatusMessage),
    PeripheralDiscovered(DiscoveredPeripheral),
    PeripheralUpdated {
        mac: MacAddress,
        field: PeripheralField,
    },
    ScanStateChanged(ScannerState),
    ConnectionState {
        from: ConnectionState,
        to: ConnectionState,
    },
    ChannelOpen {
        mac: MacAddress,
        max_payload: usize,
    },
    FrameReceived(InboundFrame),
    Error(ErrorEvent),
}

/// Scanner lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerState {
    Created,
    Started,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// Failure classes surfaced to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Radio off or absent
    TransportUnavailable,
    /// Pairing rejected, unsupported policy or missing handler
    Negotiation,
    /// Expected service or characteristics absent
    TopologyMismatch,
    /// Rejected operator input
    Validation,
    /// Non-fatal, logged and ignored
    Degraded,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub category: ErrorCategory,
    pub message: String,
}

/// Render Unix milliseconds as `HH:MM:SS.mmm` (UTC).
pub fn format_timestamp(unix_ms: i64) -> String {
    let ms_of_day = unix_ms.rem_euclid(86_400_000);
    let hours = ms_of_day / 3_600_000;
    let minutes = (ms_of_day / 60_000) % 60;
    let seconds = (ms_of_day / 1000) % 60;
    let millis = ms_of_day % 1000;
    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, millis)
}

/// Current time in Unix milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
