//! Pairing Module
//!
//! Maps the configured security policy to transport pairing parameters and
//! answers pairing challenges raised while pairing runs.

use crate::domain::models::{AppEvent, MessageSeverity, StatusMessage};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, DeviceHandle, PairingChallenge, PairingChallengeHandler, PairingKind,
    PairingResponse, PairingStatus, ProtectionLevel, TransportError,
};
use parking_lot::RwLock;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Credential offered for `ProvidePasswordCredential`. Not a secure default.
pub const PLACEHOLDER_USERNAME: &str = "testuser";
pub const PLACEHOLDER_PASSWORD: &str = "testpassword";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("Security mode {0} not supported")]
    UnsupportedSecurityPolicy(String),
    #[error("Pairing handler not registered; check that bonding is enabled on the peripheral")]
    RequiredHandlerNotRegistered,
    #[error("Pairing rejected with status {0}; retry connecting with pairing")]
    Rejected(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Security policies the Proteus module can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityPolicy {
    Open,
    JustWorks,
    StaticPasskey,
}

impl FromStr for SecurityPolicy {
    type Err = PairingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(SecurityPolicy::Open),
            "justworks" | "just_works" => Ok(SecurityPolicy::JustWorks),
            "staticpasskey" | "static_passkey" => Ok(SecurityPolicy::StaticPasskey),
            _ => Err(PairingError::UnsupportedSecurityPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SecurityPolicy::Open => "Open",
            SecurityPolicy::JustWorks => "JustWorks",
            SecurityPolicy::StaticPasskey => "StaticPasskey",
        };
        f.write_str(label)
    }
}

/// Pairing request handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingParameters {
    pub kind: PairingKind,
    pub min_level: ProtectionLevel,
}

impl SecurityPolicy {
    pub fn parameters(self) -> PairingParameters {
        match self {
            SecurityPolicy::Open => PairingParameters {
                kind: PairingKind::None,
                min_level: ProtectionLevel::None,
            },
            SecurityPolicy::JustWorks => PairingParameters {
                kind: PairingKind::ConfirmOnly,
                min_level: ProtectionLevel::Encryption,
            },
            SecurityPolicy::StaticPasskey => PairingParameters {
                kind: PairingKind::ProvidePin,
                min_level: ProtectionLevel::EncryptionAndAuthentication,
            },
        }
    }
}

/// Per-attempt pairing configuration
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// Policy name as configured, validated on use
    pub policy: String,
    pub default_pin: String,
    pub pin_length: usize,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            policy: SecurityPolicy::StaticPasskey.to_string(),
            default_pin: "123123".to_string(),
            pin_length: 6,
        }
    }
}

/// Drives the pairing handshake for one connection attempt at a time.
pub struct PairingNegotiator {
    operator_pin: RwLock<Option<String>>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl PairingNegotiator {
    pub fn new(event_sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self {
            operator_pin: RwLock::new(None),
            event_sender,
        }
    }

    /// PIN typed by the operator; used instead of the default when valid.
    pub fn set_operator_pin(&self, pin: Option<String>) {
        *self.operator_pin.write() = pin;
    }

    /// Validate the configured policy and map it to pairing parameters.
    pub fn resolve(config: &PairingConfig) -> Result<PairingParameters, PairingError> {
        let policy: SecurityPolicy = config.policy.parse()?;
        Ok(policy.parameters())
    }

    /// Pair `device` according to `config`.
    ///
    /// Returns the successful status (`Paired` or `AlreadyPaired`); every
    /// other outcome is an error naming the cause.
    pub async fn negotiate(
        &self,
        transport: &dyn BleTransport,
        device: DeviceHandle,
        config: &PairingConfig,
    ) -> Result<PairingStatus, PairingError> {
        let params = match Self::resolve(config) {
            Ok(params) => params,
            Err(e) => {
                self.send_log(&format!("Error: {}", e), MessageSeverity::Error);
                return Err(e);
            }
        };

        info!(
            "Pairing with {:?} at minimum protection {:?}",
            params.kind, params.min_level
        );
        self.send_log("Pairing to device now.", MessageSeverity::Info);
        self.send_log(
            "Duration of this pairing process depends on the connection interval. Waiting ...",
            MessageSeverity::Info,
        );

        let responder = ChallengeResponder {
            negotiator: self,
            config,
        };
        let status = transport
            .pair(device, params.kind, params.min_level, &responder)
            .await?;

        match status {
            PairingStatus::Paired | PairingStatus::AlreadyPaired => {
                info!("Pairing finished: {:?}", status);
                Ok(status)
            }
            PairingStatus::RequiredHandlerNotRegistered => {
                Err(PairingError::RequiredHandlerNotRegistered)
            }
            PairingStatus::Failed(reason) => Err(PairingError::Rejected(reason)),
        }
    }

    /// Answer a challenge raised by the transport.
    pub fn handle_pairing_challenge(
        &self,
        challenge: &PairingChallenge,
        config: &PairingConfig,
    ) -> PairingResponse {
        match challenge.kind {
            PairingKind::ProvidePin => {
                let pin = self
                    .operator_pin
                    .read()
                    .clone()
                    .filter(|pin| is_valid_pin(pin, config.pin_length))
                    .unwrap_or_else(|| config.default_pin.clone());
                PairingResponse::AcceptWithPin(pin)
            }
            PairingKind::None | PairingKind::ConfirmOnly => PairingResponse::Accept,
            PairingKind::ConfirmPinMatch => {
                let pin = challenge.pin.as_deref().unwrap_or("?");
                warn!("Auto-confirming PIN match without operator check: {}", pin);
                self.send_log(
                    &format!(
                        "Pairing request. Automatically confirmed pin match (not verified): {}",
                        pin
                    ),
                    MessageSeverity::Warning,
                );
                PairingResponse::Accept
            }
            PairingKind::DisplayPin => {
                let pin = challenge.pin.as_deref().unwrap_or("?");
                self.send_log(
                    &format!("Pairing request. Enter pin on other device: {}", pin),
                    MessageSeverity::Warning,
                );
                PairingResponse::Accept
            }
            PairingKind::ProvidePasswordCredential => {
                warn!("ProvidePasswordCredential answered with placeholder credential");
                self.send_log(
                    "Pairing request ProvidePasswordCredential answered with placeholder credential",
                    MessageSeverity::Warning,
                );
                PairingResponse::AcceptWithPasswordCredential {
                    username: PLACEHOLDER_USERNAME.to_string(),
                    password: PLACEHOLDER_PASSWORD.to_string(),
                }
            }
        }
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

struct ChallengeResponder<'a> {
    negotiator: &'a PairingNegotiator,
    config: &'a PairingConfig,
}

impl PairingChallengeHandler for ChallengeResponder<'_> {
    fn handle_pairing_challenge(&self, challenge: &PairingChallenge) -> PairingResponse {
        self.negotiator
            .handle_pairing_challenge(challenge, self.config)
    }
}

fn is_valid_pin(pin: &str, expected_len: usize) -> bool {
    pin.len() == expected_len && pin.chars().all(|c| c.is_ascii_digit())
}
