use proteus_ble::domain::models::MacAddress;
use proteus_ble::domain::settings::SettingsService;
use proteus_ble::infrastructure::bluetooth::simulated::{SimulatedPeripheral, SimulatedTransport};
use proteus_ble::infrastructure::bluetooth::transport::AdvertisementKind;
use proteus_ble::infrastructure::bluetooth::BluetoothService;
use proteus_ble::infrastructure::logging;
use proteus_ble::presentation::console;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::info;

/// Address of the module exposed by the simulated radio
const DEMO_ADDRESS: u64 = 0x0018_DA00_0002;

const ADVERTISING_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting Proteus BLE console");
    info!("Settings file: {}", settings_service.path().display());

    let settings = Arc::new(Mutex::new(settings_service));
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let transport = Arc::new(SimulatedTransport::new());
    transport.add_peripheral(
        SimulatedPeripheral::proteus(MacAddress::new(DEMO_ADDRESS)).with_name("A-0002"),
    );

    let service = BluetoothService::new(transport.clone(), event_tx, settings);
    tokio::spawn(console::print_events(event_rx));

    // The simulated radio only advertises when polled
    let radio = transport.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ADVERTISING_INTERVAL);
        loop {
            ticker.tick().await;
            radio.advertise_all(AdvertisementKind::ConnectableUndirected);
        }
    });

    println!("{}", console::HELP);
    console::run(&service, BufReader::new(tokio::io::stdin())).await?;

    if service.disconnect() {
        let _ = service.join().await;
    }
    info!("Console closed");
    Ok(())
}
