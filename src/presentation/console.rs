//! Operator console
//!
//! Line-oriented front end over [`BluetoothService`]. Each input line is one
//! command; events from the engine are printed as they arrive.

use crate::domain::models::{
    AppEvent, ConnectionState, MacAddress, MessageSeverity, ParseMacError, PeripheralField,
    ScannerState,
};
use crate::infrastructure::bluetooth::BluetoothService;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

pub const HELP: &str = "\
Commands:
  scan                 start scanning (clears the device list)
  stop                 stop scanning
  list                 show discovered devices
  select <n|MAC>       select a device by list index or address
  connect [MAC]        connect to the selected (or given) device
  send <hex>           send a data frame, e.g. send DE AD 01
  pin <digits>         PIN for the next pairing request
  disconnect           close the current connection
  status               show connection state
  quit                 exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectTarget {
    Index(usize),
    Address(MacAddress),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Scan,
    Stop,
    List,
    Select(SelectTarget),
    Connect(Option<MacAddress>),
    Send(String),
    Pin(String),
    Disconnect,
    Status,
    Help,
    Quit,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,
    #[error("Unknown command '{0}', type 'help'")]
    Unknown(String),
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),
    #[error(transparent)]
    InvalidAddress(#[from] ParseMacError),
}

impl FromStr for ConsoleCommand {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word.to_lowercase().as_str() {
            "" => return Err(CommandError::Empty),
            "scan" => ConsoleCommand::Scan,
            "stop" => ConsoleCommand::Stop,
            "list" | "ls" => ConsoleCommand::List,
            "select" => {
                if rest.is_empty() {
                    return Err(CommandError::MissingArgument("device index or address"));
                }
                match rest.parse::<usize>() {
                    Ok(index) if rest.len() < 12 => ConsoleCommand::Select(SelectTarget::Index(index)),
                    _ => ConsoleCommand::Select(SelectTarget::Address(rest.parse()?)),
                }
            }
            "connect" if rest.is_empty() => ConsoleCommand::Connect(None),
            "connect" => ConsoleCommand::Connect(Some(rest.parse()?)),
            "send" => {
                if rest.is_empty() {
                    return Err(CommandError::MissingArgument("hex payload"));
                }
                ConsoleCommand::Send(rest.to_string())
            }
            "pin" => ConsoleCommand::Pin(rest.to_string()),
            "disconnect" => ConsoleCommand::Disconnect,
            "status" => ConsoleCommand::Status,
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}

/// Run one command. Returns `false` when the console should exit.
pub async fn execute(service: &BluetoothService, command: ConsoleCommand) -> anyhow::Result<bool> {
    match command {
        ConsoleCommand::Scan => service.start_scan().await?,
        ConsoleCommand::Stop => service.stop_scan().await?,
        ConsoleCommand::List => {
            let selected = service.selected();
            let peripherals = service.peripherals();
            if peripherals.is_empty() {
                println!("No devices discovered");
            }
            for (index, p) in peripherals.iter().enumerate() {
                let marker = if selected == Some(p.mac) { '*' } else { ' ' };
                println!(
                    "{}{:>3}  {}  {:<20} {:>4} dBm  {}",
                    marker,
                    index,
                    p.mac,
                    p.name,
                    p.rssi,
                    p.last_seen_label()
                );
            }
        }
        ConsoleCommand::Select(target) => {
            let mac = match target {
                SelectTarget::Address(mac) => Some(mac),
                SelectTarget::Index(index) => service.peripherals().get(index).map(|p| p.mac),
            };
            match mac {
                Some(mac) if service.select(mac) => println!("Selected {}", mac),
                _ => println!("No such device"),
            }
        }
        ConsoleCommand::Connect(None) => service.connect_selected()?,
        ConsoleCommand::Connect(Some(mac)) => {
            if !service.select(mac) {
                anyhow::bail!("{} was not discovered in the last scan", mac);
            }
            service.connect(mac)?
        }
        ConsoleCommand::Send(text) => service.send_hex(&text).await?,
        ConsoleCommand::Pin(pin) => service.set_operator_pin(&pin),
        ConsoleCommand::Disconnect => {
            if !service.disconnect() {
                println!("Not connected");
            }
        }
        ConsoleCommand::Status => match service.connection().session_summary() {
            Some(s) => println!(
                "{} {} (security: {:?}, max payload: {}, notifications: {})",
                s.state, s.mac, s.security, s.max_payload, s.notifications
            ),
            None => println!("{}", service.state()),
        },
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => return Ok(false),
    }
    Ok(true)
}

/// Read commands from `input` until EOF or `quit`.
pub async fn run<R>(service: &BluetoothService, input: R) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(CommandError::Empty) => continue,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };
        debug!("Console command: {:?}", command);
        match execute(service, command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                error!("{}", e);
                println!("Error: {}", e);
            }
        }
    }
    Ok(())
}

/// One printable line for an engine event.
pub fn format_event(event: &AppEvent) -> Option<String> {
    let line = match event {
        AppEvent::LogMessage(msg) => {
            let tag = match msg.severity {
                MessageSeverity::Info => "info",
                MessageSeverity::Success => " ok ",
                MessageSeverity::Warning => "warn",
                MessageSeverity::Error => "err ",
            };
            format!("[{}] {}", tag, msg.message)
        }
        AppEvent::PeripheralDiscovered(p) => {
            format!("[scan] {} {} {} dBm", p.mac, p.name, p.rssi)
        }
        AppEvent::PeripheralUpdated { mac, field } => match field {
            // RSSI and timestamp churn on every advertisement
            PeripheralField::Rssi | PeripheralField::LastSeen => return None,
            PeripheralField::Name => format!("[scan] {} renamed", mac),
        },
        AppEvent::ScanStateChanged(state) => match state {
            ScannerState::Started => "[scan] started".to_string(),
            ScannerState::Stopped => "[scan] stopped".to_string(),
            ScannerState::Created => return None,
        },
        AppEvent::ConnectionState { from, to } => {
            if *to == ConnectionState::Idle && *from != ConnectionState::Disconnecting {
                format!("[conn] {} -> {} (aborted)", from, to)
            } else {
                format!("[conn] {} -> {}", from, to)
            }
        }
        AppEvent::ChannelOpen { mac, max_payload } => {
            format!("[conn] channel open to {}, max payload {} bytes", mac, max_payload)
        }
        // RX lines already arrive as log messages
        AppEvent::FrameReceived(_) => return None,
        AppEvent::Error(e) => format!("[{:?}] {}", e.category, e.message),
    };
    Some(line)
}

/// Print events until the engine side closes.
pub async fn print_events(mut events: mpsc::UnboundedReceiver<AppEvent>) {
    while let Some(event) = events.recv().await {
        if let Some(line) = format_event(&event) {
            println!("{}", line);
        }
    }
}
