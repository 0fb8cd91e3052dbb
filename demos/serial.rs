use std::env;

use inquire::Select;
use serialport::SerialPort;
use tsp_link::{
    LineTransport, LinkCoordinator, Millis, Session, SessionConfig, StdClock,
    accessor::{Property, PropertyDescriptor},
};

// Configuration constants - adjust these for your setup
const BAUD_RATE: u32 = 115200;
// Short port timeout; the line transport does its own waiting.
const SERIAL_TIMEOUT_MS: u64 = 10;
// A link reset with several nodes can take a few seconds.
const LINK_RESET_TIMEOUT_MS: u64 = 5000;
const DEFAULT_NODE_COUNT: u16 = 1;

const SOURCE_LEVEL_V: PropertyDescriptor<f64> =
    PropertyDescriptor::real("smua.source.levelv = {value}", "print(smua.source.levelv)");

pub struct PortWrapper(Box<dyn SerialPort>);

#[derive(Debug)]
pub struct IoError(std::io::Error);

impl core::fmt::Display for IoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl embedded_io::Error for IoError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self.0.kind() {
            std::io::ErrorKind::NotFound => embedded_io::ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => embedded_io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::ConnectionRefused => embedded_io::ErrorKind::ConnectionRefused,
            std::io::ErrorKind::ConnectionReset => embedded_io::ErrorKind::ConnectionReset,
            std::io::ErrorKind::ConnectionAborted => embedded_io::ErrorKind::ConnectionAborted,
            std::io::ErrorKind::NotConnected => embedded_io::ErrorKind::NotConnected,
            std::io::ErrorKind::AddrInUse => embedded_io::ErrorKind::AddrInUse,
            std::io::ErrorKind::AddrNotAvailable => embedded_io::ErrorKind::AddrNotAvailable,
            std::io::ErrorKind::BrokenPipe => embedded_io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::AlreadyExists => embedded_io::ErrorKind::AlreadyExists,
            std::io::ErrorKind::InvalidInput => embedded_io::ErrorKind::InvalidInput,
            std::io::ErrorKind::InvalidData => embedded_io::ErrorKind::InvalidData,
            std::io::ErrorKind::TimedOut => embedded_io::ErrorKind::TimedOut,
            std::io::ErrorKind::Interrupted => embedded_io::ErrorKind::Interrupted,
            std::io::ErrorKind::Unsupported => embedded_io::ErrorKind::Unsupported,
            std::io::ErrorKind::OutOfMemory => embedded_io::ErrorKind::OutOfMemory,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for PortWrapper {
    type Error = IoError;
}

impl embedded_io::Read for PortWrapper {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        std::io::Read::read(&mut self.0, buf).map_err(IoError)
    }
}

impl embedded_io::Write for PortWrapper {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        std::io::Write::write(&mut self.0, buf).map_err(IoError)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        std::io::Write::flush(&mut self.0).map_err(IoError)
    }
}

fn main() {
    env_logger::init();

    // Get serial port from command line arg or interactive selection
    let port_name = env::args().nth(1).unwrap_or_else(|| {
        // List available serial ports
        let ports = serialport::available_ports().expect("Failed to enumerate serial ports");

        if ports.is_empty() {
            eprintln!("No serial ports found!");
            std::process::exit(1);
        }

        let port_names: Vec<String> = ports.iter().map(|p| p.port_name.clone()).collect();

        // Interactive selection
        Select::new("Select a serial port:", port_names)
            .prompt()
            .expect("Failed to select port")
    });
    let node_count = env::args()
        .nth(2)
        .map(|n| n.parse().expect("Node count must be a number"))
        .unwrap_or(DEFAULT_NODE_COUNT);

    println!("Using port: {}", port_name);

    // Open serial port
    let port = serialport::new(&port_name, BAUD_RATE)
        .timeout(std::time::Duration::from_millis(SERIAL_TIMEOUT_MS))
        .open()
        .expect("Failed to open serial port");

    let port = PortWrapper(port);

    // Create a session on the controller node
    let transport: LineTransport<PortWrapper, StdClock, 512> =
        LineTransport::new(port, StdClock::new());
    let mut session = Session::new(transport, StdClock::new(), SessionConfig::default());

    let stale = session.discard_unread_data(Millis::millis(100));
    if !stale.is_empty() {
        println!("Discarded: {stale:?}");
    }

    println!("Identity: {}", session.identity().expect("Failed to read identity"));

    // Reset the link and enumerate nodes
    let mut coordinator = LinkCoordinator::new();
    coordinator
        .reset_link(&mut session, Millis::millis(LINK_RESET_TIMEOUT_MS), node_count)
        .expect("Link reset failed");
    coordinator
        .initialize_nodes(&mut session)
        .expect("Failed to read node identities");

    println!("\n--- Link {} ---", coordinator.state());
    for node in coordinator.topology().iter() {
        println!(
            "node {:>2}{} model {} serial {} firmware {} group {:?}",
            node.number(),
            if node.is_controller() { " (controller)" } else { "" },
            node.model_number().unwrap_or("?"),
            node.serial_number().unwrap_or("?"),
            node.firmware_version().unwrap_or("?"),
            node.group()
        );
    }

    // Read a typed property with the status check enabled
    let mut level = Property::new(SOURCE_LEVEL_V);
    match level.query(&mut session, true) {
        Ok(value) => println!("\nSource level: {value} V"),
        Err(e) => println!("\nSource level unavailable: {e}"),
    }

    if session.has_device_errors() {
        println!("\n--- Device errors ---\n{}", session.error_report());
    }
}
