//! Simulated Transport
//!
//! In-process [`BleTransport`] modelling Proteus peripherals. Written frames
//! are echoed back as notifications when the notify characteristic is
//! subscribed. Open device and service handles are counted so callers can
//! check that teardown released everything.

use crate::domain::models::{now_millis, MacAddress};
use crate::infrastructure::bluetooth::protocol::{NOTIFY_CHAR_UUID, SERVICE_UUID, WRITE_CHAR_UUID};
use crate::infrastructure::bluetooth::transport::{
    Advertisement, AdvertisementKind, BleTransport, CharacteristicHandle, CharacteristicInfo,
    CharacteristicProperties, DeviceHandle, PairingChallenge, PairingChallengeHandler,
    PairingInfo, PairingKind, PairingResponse, PairingStatus, ProtectionLevel, ScanFilterConfig,
    ServiceHandle, TransportError, TransportEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// One simulated peripheral.
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub mac: MacAddress,
    pub name: String,
    pub rssi: i16,
    pub paired: bool,
    pub can_pair: bool,
    /// PIN expected for `ProvidePin` pairing
    pub pin: String,
    /// Fixed result of `pair`, bypassing the challenge exchange
    pub pairing_status: Option<PairingStatus>,
    pub protection_level: ProtectionLevel,
    pub has_service: bool,
    pub characteristics: Vec<(Uuid, CharacteristicProperties)>,
    pub subscribe_fails: bool,
    pub unsubscribe_fails: bool,
    pub uplink_pdu: usize,
    pub downlink_pdu: usize,
    pub echo: bool,
    pub connect_delay: Duration,
}

impl SimulatedPeripheral {
    /// A Proteus module with default firmware settings.
    pub fn proteus(mac: MacAddress) -> Self {
        Self {
            mac,
            name: "A-1234".to_string(),
            rssi: -60,
            paired: false,
            can_pair: true,
            pin: "123123".to_string(),
            pairing_status: None,
            protection_level: ProtectionLevel::None,
            has_service: true,
            characteristics: vec![
                (WRITE_CHAR_UUID, CharacteristicProperties::writable()),
                (NOTIFY_CHAR_UUID, CharacteristicProperties::notifiable()),
            ],
            subscribe_fails: false,
            unsubscribe_fails: false,
            uplink_pdu: 247,
            downlink_pdu: 247,
            echo: true,
            connect_delay: Duration::ZERO,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_pin(mut self, pin: &str) -> Self {
        self.pin = pin.to_string();
        self
    }

    pub fn already_paired(mut self) -> Self {
        self.paired = true;
        self.protection_level = ProtectionLevel::EncryptionAndAuthentication;
        self
    }

    pub fn without_pairing(mut self) -> Self {
        self.can_pair = false;
        self
    }

    pub fn with_pairing_status(mut self, status: PairingStatus) -> Self {
        self.pairing_status = Some(status);
        self
    }

    pub fn without_service(mut self) -> Self {
        self.has_service = false;
        self
    }

    pub fn without_characteristic(mut self, uuid: Uuid) -> Self {
        self.characteristics.retain(|(u, _)| *u != uuid);
        self
    }

    pub fn with_extra_characteristic(mut self, uuid: Uuid, props: CharacteristicProperties) -> Self {
        self.characteristics.push((uuid, props));
        self
    }

    pub fn with_failing_subscribe(mut self) -> Self {
        self.subscribe_fails = true;
        self
    }

    pub fn with_failing_unsubscribe(mut self) -> Self {
        self.unsubscribe_fails = true;
        self
    }

    pub fn with_pdu(mut self, uplink: usize, downlink: usize) -> Self {
        self.uplink_pdu = uplink;
        self.downlink_pdu = downlink;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    fn advertisement(&self, kind: AdvertisementKind) -> Advertisement {
        Advertisement {
            mac: self.mac,
            local_name: self.name.clone(),
            rssi: self.rssi,
            timestamp: now_millis(),
            kind,
            service_uuids: vec![SERVICE_UUID],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CharacteristicEntry {
    mac: MacAddress,
    service: ServiceHandle,
    uuid: Uuid,
}

struct SimState {
    radio_on: bool,
    secure_pairing: bool,
    scanning: bool,
    peripherals: HashMap<MacAddress, SimulatedPeripheral>,
    next_handle: u64,
    devices: HashMap<DeviceHandle, MacAddress>,
    services: HashMap<ServiceHandle, MacAddress>,
    characteristics: HashMap<CharacteristicHandle, CharacteristicEntry>,
    subscribed: HashSet<CharacteristicHandle>,
    writes: Vec<(MacAddress, Vec<u8>)>,
    connects: usize,
    unpairs: usize,
    sink: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl SimState {
    fn allocate(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn peripheral_for_device(
        &mut self,
        device: DeviceHandle,
    ) -> Result<&mut SimulatedPeripheral, TransportError> {
        let mac = *self.devices.get(&device).ok_or(TransportError::InvalidHandle)?;
        self.peripherals
            .get_mut(&mac)
            .ok_or(TransportError::InvalidHandle)
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(sink) = &self.sink {
            let _ = sink.send(event);
        }
    }
}

/// Loopback transport for tests and the demo console.
pub struct SimulatedTransport {
    state: Mutex<SimState>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                radio_on: true,
                secure_pairing: true,
                scanning: false,
                peripherals: HashMap::new(),
                next_handle: 0,
                devices: HashMap::new(),
                services: HashMap::new(),
                characteristics: HashMap::new(),
                subscribed: HashSet::new(),
                writes: Vec::new(),
                connects: 0,
                unpairs: 0,
                sink: None,
            }),
        }
    }

    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        self.state
            .lock()
            .peripherals
            .insert(peripheral.mac, peripheral);
    }

    pub fn set_radio_on(&self, on: bool) {
        self.state.lock().radio_on = on;
    }

    pub fn set_secure_pairing_supported(&self, supported: bool) {
        self.state.lock().secure_pairing = supported;
    }

    /// Deliver one advertisement per peripheral, if scanning.
    pub fn advertise_all(&self, kind: AdvertisementKind) {
        let state = self.state.lock();
        if !state.scanning {
            return;
        }
        for peripheral in state.peripherals.values() {
            state.emit(TransportEvent::AdvertisementReceived(
                peripheral.advertisement(kind),
            ));
        }
    }

    /// Deliver an arbitrary advertisement, regardless of scan state.
    pub fn inject_advertisement(&self, adv: Advertisement) {
        self.state
            .lock()
            .emit(TransportEvent::AdvertisementReceived(adv));
    }

    /// Simulate a radio fault ending the scan.
    pub fn fail_scan(&self, reason: &str) {
        let mut state = self.state.lock();
        state.scanning = false;
        state.emit(TransportEvent::ScanStopped {
            error: Some(reason.to_string()),
        });
    }

    /// Simulate the peripheral dropping the link.
    pub fn drop_link(&self, mac: MacAddress) {
        let state = self.state.lock();
        for (device, owner) in &state.devices {
            if *owner == mac {
                state.emit(TransportEvent::ConnectionStatusChanged {
                    device: *device,
                    connected: false,
                });
            }
        }
    }

    /// Send `value` as a notification from `mac`, if subscribed.
    pub fn notify(&self, mac: MacAddress, value: &[u8]) -> bool {
        let state = self.state.lock();
        let handle = state.subscribed.iter().copied().find(|h| {
            state
                .characteristics
                .get(h)
                .is_some_and(|c| c.mac == mac && c.uuid == NOTIFY_CHAR_UUID)
        });
        match handle {
            Some(characteristic) => {
                state.emit(TransportEvent::ValueChanged {
                    characteristic,
                    value: value.to_vec(),
                    timestamp: now_millis(),
                });
                true
            }
            None => false,
        }
    }

    /// Device plus service handles not yet released.
    pub fn open_handles(&self) -> usize {
        let state = self.state.lock();
        state.devices.len() + state.services.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscribed.len()
    }

    pub fn writes(&self) -> Vec<(MacAddress, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn unpair_count(&self) -> usize {
        self.state.lock().unpairs
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().scanning
    }

    pub fn is_paired(&self, mac: MacAddress) -> bool {
        self.state
            .lock()
            .peripherals
            .get(&mac)
            .is_some_and(|p| p.paired)
    }
}

#[async_trait]
impl BleTransport for SimulatedTransport {
    fn set_event_sink(&self, sink: mpsc::UnboundedSender<TransportEvent>) {
        self.state.lock().sink = Some(sink);
    }

    fn secure_pairing_supported(&self) -> bool {
        self.state.lock().secure_pairing
    }

    async fn scan_start(&self, filter: &ScanFilterConfig) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.radio_on {
            return Err(TransportError::DeviceUnavailable);
        }
        debug!("Simulated scan started with {:?}", filter);
        state.scanning = true;
        Ok(())
    }

    async fn scan_stop(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.scanning {
            state.scanning = false;
            state.emit(TransportEvent::ScanStopped { error: None });
        }
        Ok(())
    }

    async fn connect(&self, mac: MacAddress) -> Result<DeviceHandle, TransportError> {
        let delay = {
            let state = self.state.lock();
            if !state.radio_on {
                return Err(TransportError::DeviceUnavailable);
            }
            state
                .peripherals
                .get(&mac)
                .map(|p| p.connect_delay)
                .ok_or_else(|| TransportError::failed("connect", format!("{} not in range", mac)))?
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let device = DeviceHandle(state.allocate());
        state.devices.insert(device, mac);
        state.connects += 1;
        state.emit(TransportEvent::ConnectionStatusChanged {
            device,
            connected: true,
        });
        Ok(device)
    }

    async fn pairing_info(&self, device: DeviceHandle) -> Result<PairingInfo, TransportError> {
        let mut state = self.state.lock();
        let peripheral = state.peripheral_for_device(device)?;
        Ok(PairingInfo {
            is_paired: peripheral.paired,
            can_pair: peripheral.can_pair,
            protection_level: peripheral.protection_level,
        })
    }

    async fn pair(
        &self,
        device: DeviceHandle,
        kind: PairingKind,
        min_level: ProtectionLevel,
        handler: &dyn PairingChallengeHandler,
    ) -> Result<PairingStatus, TransportError> {
        let (fixed, already_paired, can_pair, expected_pin) = {
            let mut state = self.state.lock();
            let p = state.peripheral_for_device(device)?;
            (p.pairing_status.clone(), p.paired, p.can_pair, p.pin.clone())
        };
        if let Some(status) = fixed {
            return Ok(status);
        }
        if already_paired {
            return Ok(PairingStatus::AlreadyPaired);
        }
        if !can_pair {
            return Ok(PairingStatus::Failed("NotReadyToPair".to_string()));
        }

        let challenge = PairingChallenge {
            kind,
            pin: matches!(kind, PairingKind::ConfirmPinMatch | PairingKind::DisplayPin)
                .then(|| "042042".to_string()),
        };
        let accepted = match handler.handle_pairing_challenge(&challenge) {
            PairingResponse::AcceptWithPin(pin) => pin == expected_pin,
            PairingResponse::Accept => kind != PairingKind::ProvidePin,
            PairingResponse::AcceptWithPasswordCredential { .. } => {
                kind == PairingKind::ProvidePasswordCredential
            }
        };
        if !accepted {
            return Ok(PairingStatus::Failed("AuthenticationFailure".to_string()));
        }

        let mut state = self.state.lock();
        let p = state.peripheral_for_device(device)?;
        p.paired = true;
        p.protection_level = min_level;
        Ok(PairingStatus::Paired)
    }

    async fn unpair(&self, device: DeviceHandle) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let p = state.peripheral_for_device(device)?;
        p.paired = false;
        p.protection_level = ProtectionLevel::None;
        state.unpairs += 1;
        Ok(())
    }

    async fn get_primary_service(
        &self,
        device: DeviceHandle,
        uuid: Uuid,
    ) -> Result<ServiceHandle, TransportError> {
        let mut state = self.state.lock();
        let peripheral = state.peripheral_for_device(device)?;
        if !peripheral.has_service || uuid != SERVICE_UUID {
            return Err(TransportError::ServiceNotFound(uuid));
        }
        let mac = peripheral.mac;
        let service = ServiceHandle(state.allocate());
        state.services.insert(service, mac);
        Ok(service)
    }

    async fn get_characteristics(
        &self,
        service: ServiceHandle,
    ) -> Result<Vec<CharacteristicInfo>, TransportError> {
        let mut state = self.state.lock();
        let mac = *state
            .services
            .get(&service)
            .ok_or(TransportError::InvalidHandle)?;
        let layout = state
            .peripherals
            .get(&mac)
            .map(|p| p.characteristics.clone())
            .ok_or(TransportError::InvalidHandle)?;

        let mut result = Vec::with_capacity(layout.len());
        for (uuid, properties) in layout {
            let handle = CharacteristicHandle(state.allocate());
            state.characteristics.insert(
                handle,
                CharacteristicEntry { mac, service, uuid },
            );
            result.push(CharacteristicInfo {
                uuid,
                properties,
                handle,
            });
        }
        Ok(result)
    }

    async fn subscribe(&self, characteristic: CharacteristicHandle) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let entry = *state
            .characteristics
            .get(&characteristic)
            .ok_or(TransportError::InvalidHandle)?;
        let fails = state
            .peripherals
            .get(&entry.mac)
            .is_some_and(|p| p.subscribe_fails);
        if fails {
            return Err(TransportError::failed("subscribe", "Unreachable"));
        }
        state.subscribed.insert(characteristic);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        characteristic: CharacteristicHandle,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let entry = *state
            .characteristics
            .get(&characteristic)
            .ok_or(TransportError::InvalidHandle)?;
        let fails = state
            .peripherals
            .get(&entry.mac)
            .is_some_and(|p| p.unsubscribe_fails);
        state.subscribed.remove(&characteristic);
        if fails {
            return Err(TransportError::failed("unsubscribe", "ProtocolError"));
        }
        Ok(())
    }

    async fn write(
        &self,
        characteristic: CharacteristicHandle,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let entry = *state
            .characteristics
            .get(&characteristic)
            .ok_or(TransportError::InvalidHandle)?;
        state.writes.push((entry.mac, value.to_vec()));

        let echo = state.peripherals.get(&entry.mac).is_some_and(|p| p.echo);
        if echo {
            let notify = state.subscribed.iter().copied().find(|h| {
                state
                    .characteristics
                    .get(h)
                    .is_some_and(|c| c.service == entry.service && c.uuid == NOTIFY_CHAR_UUID)
            });
            if let Some(notify) = notify {
                state.emit(TransportEvent::ValueChanged {
                    characteristic: notify,
                    value: value.to_vec(),
                    timestamp: now_millis(),
                });
            }
        }
        Ok(())
    }

    async fn max_pdu_size(
        &self,
        characteristic: CharacteristicHandle,
    ) -> Result<usize, TransportError> {
        let state = self.state.lock();
        let entry = state
            .characteristics
            .get(&characteristic)
            .ok_or(TransportError::InvalidHandle)?;
        let peripheral = state
            .peripherals
            .get(&entry.mac)
            .ok_or(TransportError::InvalidHandle)?;
        Ok(if entry.uuid == NOTIFY_CHAR_UUID {
            peripheral.uplink_pdu
        } else {
            peripheral.downlink_pdu
        })
    }

    async fn release_service(&self, service: ServiceHandle) {
        let mut state = self.state.lock();
        state.services.remove(&service);
        let owned: Vec<_> = state
            .characteristics
            .iter()
            .filter(|(_, c)| c.service == service)
            .map(|(h, _)| *h)
            .collect();
        for handle in owned {
            state.characteristics.remove(&handle);
            state.subscribed.remove(&handle);
        }
    }

    async fn close_device(&self, device: DeviceHandle) {
        let mut state = self.state.lock();
        if state.devices.remove(&device).is_some() {
            state.emit(TransportEvent::ConnectionStatusChanged {
                device,
                connected: false,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handles_counted_until_released() {
        let transport = SimulatedTransport::new();
        let mac = MacAddress::new(0xAABB_CCDD_EEFF);
        transport.add_peripheral(SimulatedPeripheral::proteus(mac));

        let device = transport.connect(mac).await.unwrap();
        let service = transport.get_primary_service(device, SERVICE_UUID).await.unwrap();
        assert_eq!(transport.open_handles(), 2);

        transport.release_service(service).await;
        transport.close_device(device).await;
        assert_eq!(transport.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_echo_requires_subscription() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = SimulatedTransport::new();
        transport.set_event_sink(tx);
        let mac = MacAddress::new(1);
        transport.add_peripheral(SimulatedPeripheral::proteus(mac));

        let device = transport.connect(mac).await.unwrap();
        let service = transport.get_primary_service(device, SERVICE_UUID).await.unwrap();
        let chars = transport.get_characteristics(service).await.unwrap();
        let write = chars.iter().find(|c| c.uuid == WRITE_CHAR_UUID).unwrap().handle;
        let notify = chars.iter().find(|c| c.uuid == NOTIFY_CHAR_UUID).unwrap().handle;

        transport.write(write, &[0x01, 0xAA]).await.unwrap();
        assert!(!transport.notify(mac, &[0x01, 0xCC]));
        transport.subscribe(notify).await.unwrap();
        transport.write(write, &[0x01, 0xBB]).await.unwrap();
        assert!(transport.notify(mac, &[0x01, 0xCC]));

        let mut echoed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TransportEvent::ValueChanged { value, .. } = event {
                echoed.push(value);
            }
        }
        assert_eq!(echoed, vec![vec![0x01, 0xBB], vec![0x01, 0xCC]]);
        assert_eq!(transport.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_advertisements_follow_scan_state() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = SimulatedTransport::new();
        transport.set_event_sink(tx);
        let mac = MacAddress::new(0x0018_DA00_0002);
        transport.add_peripheral(SimulatedPeripheral::proteus(mac));

        transport.advertise_all(AdvertisementKind::ConnectableUndirected);
        assert!(rx.try_recv().is_err());

        transport.scan_start(&ScanFilterConfig::default()).await.unwrap();
        assert!(transport.is_scanning());
        transport.advertise_all(AdvertisementKind::ConnectableUndirected);
        assert!(matches!(
            rx.try_recv(),
            Ok(TransportEvent::AdvertisementReceived(adv)) if adv.mac == mac
        ));

        transport.scan_stop().await.unwrap();
        assert!(!transport.is_scanning());
        assert!(matches!(
            rx.try_recv(),
            Ok(TransportEvent::ScanStopped { error: None })
        ));

        // Injected advertisements bypass the scan state
        transport.inject_advertisement(Advertisement {
            mac: MacAddress::new(0x42),
            local_name: String::new(),
            rssi: -60,
            timestamp: 1,
            kind: AdvertisementKind::ScanResponse,
            service_uuids: Vec::new(),
        });
        assert!(matches!(
            rx.try_recv(),
            Ok(TransportEvent::AdvertisementReceived(adv)) if adv.kind == AdvertisementKind::ScanResponse
        ));
    }

    #[tokio::test]
    async fn test_radio_off() {
        let transport = SimulatedTransport::new();
        transport.set_radio_on(false);
        assert_eq!(
            transport.connect(MacAddress::new(1)).await,
            Err(TransportError::DeviceUnavailable)
        );
    }
}
