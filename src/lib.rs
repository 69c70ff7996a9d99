//! Client engine for Proteus BLE modules: scanning, pairing, connection
//! management and framed data exchange over the Proteus GATT service.

pub mod domain;
pub mod infrastructure;
pub mod presentation;
