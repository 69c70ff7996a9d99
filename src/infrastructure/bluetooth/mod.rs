//! Bluetooth Module
//!
//! Provides BLE communication with Proteus modules.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │  (Main coordinator - public API for the application)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┐
//!         │             │              │
//!         ▼             ▼              ▼
//! ┌───────────┐  ┌─────────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection  │  │ Protocol │
//! │           │  │             │  │          │
//! │ - adverts │  │ - state     │  │ - UUIDs  │
//! │ - registry│  │   machine   │  │ - framing│
//! │           │  │ - pairing   │  │ - hex    │
//! └─────┬─────┘  └──────┬──────┘  └──────────┘
//!       │               │
//!       └───────┬───────┘
//!               ▼
//!        ┌─────────────┐
//!        │ BleTransport│  (radio abstraction, simulated for tests)
//!        └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - Radio abstraction and its event/handle types
//! - [`protocol`] - Proteus UUIDs, frame codec and hex helpers
//! - [`scanner`] - Advertisement scanning into the scan registry
//! - [`pairing`] - Security policy resolution and pairing challenges
//! - [`connection`] - Connection state machine and data channel
//! - [`service`] - Main service coordinator
//! - [`simulated`] - In-process transport

pub mod connection;
pub mod pairing;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulated;
pub mod transport;

// Re-export main service for convenience
pub use service::BluetoothService;
