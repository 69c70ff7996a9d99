//! Scan Registry
//!
//! Deduplicated collection of peripherals discovered during one scan
//! session, keyed by MAC address.

use crate::domain::models::{DiscoveredPeripheral, MacAddress, PeripheralField};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Signal strengths at or below this value are invalid.
pub const RSSI_VALIDITY_FLOOR: i16 = -127;

/// Registry shared between the scanner and the operator surface.
pub type SharedRegistry = Arc<Mutex<ScanRegistry>>;

/// Outcome of [`ScanRegistry::upsert`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertResult {
    /// New entry created
    Inserted,
    /// Existing entry changed; one element per changed field
    Updated(Vec<PeripheralField>),
    /// Existing entry already held these values
    Unchanged,
    /// Signal strength at or below the validity floor, nothing touched
    Rejected,
}

#[derive(Debug, Default)]
pub struct ScanRegistry {
    entries: BTreeMap<MacAddress, DiscoveredPeripheral>,
    selected: Option<MacAddress>,
}

impl ScanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Insert `candidate` or update the entry with the same MAC.
    pub fn upsert(&mut self, candidate: DiscoveredPeripheral) -> UpsertResult {
        if candidate.rssi <= RSSI_VALIDITY_FLOOR {
            return UpsertResult::Rejected;
        }

        let Some(entry) = self.entries.get_mut(&candidate.mac) else {
            self.entries.insert(candidate.mac, candidate);
            return UpsertResult::Inserted;
        };

        let mut changed = Vec::new();
        if entry.last_seen != candidate.last_seen {
            entry.last_seen = candidate.last_seen;
            changed.push(PeripheralField::LastSeen);
        }
        if entry.rssi != candidate.rssi {
            entry.rssi = candidate.rssi;
            changed.push(PeripheralField::Rssi);
        }
        if entry.name != candidate.name {
            entry.name = candidate.name;
            changed.push(PeripheralField::Name);
        }

        if changed.is_empty() {
            UpsertResult::Unchanged
        } else {
            UpsertResult::Updated(changed)
        }
    }

    /// Drop every entry and the current selection.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.selected = None;
    }

    /// Entries ordered by MAC address.
    pub fn snapshot(&self) -> Vec<DiscoveredPeripheral> {
        self.entries.values().cloned().collect()
    }

    pub fn get(&self, mac: &MacAddress) -> Option<&DiscoveredPeripheral> {
        self.entries.get(mac)
    }

    pub fn contains(&self, mac: &MacAddress) -> bool {
        self.entries.contains_key(mac)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mark `mac` as the operator's choice. Fails if it is not registered.
    pub fn select(&mut self, mac: MacAddress) -> bool {
        if self.entries.contains_key(&mac) {
            self.selected = Some(mac);
            true
        } else {
            false
        }
    }

    pub fn selected(&self) -> Option<MacAddress> {
        self.selected
    }

    /// Select the only entry if exactly one was discovered.
    pub fn select_if_single(&mut self) -> Option<MacAddress> {
        if self.entries.len() == 1 {
            self.selected = self.entries.keys().next().copied();
        }
        self.selected
    }

    /// Whether `mac` is registered and currently selected.
    pub fn is_selected(&self, mac: &MacAddress) -> bool {
        self.selected.as_ref() == Some(mac) && self.entries.contains_key(mac)
    }
}
