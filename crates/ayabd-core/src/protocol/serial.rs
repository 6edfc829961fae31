//! Serial port handling
//!
//! Port discovery and opening of the AYAB shield's serial line.

use serde::Serialize;
use serialport::{SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::debug;

use super::{ProtocolError, AYAB_BAUD_RATE};

/// USB vendor IDs of boards the AYAB firmware runs on (Arduino, Arduino.org, CH340 clones)
const ARDUINO_VIDS: [u16; 3] = [0x2341, 0x2A03, 0x1A86];

/// Information about an available serial port
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    pub manufacturer: Option<String>,

    pub product: Option<String>,
}

impl PortInfo {
    fn named(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }

    /// Whether the port looks like an Arduino that could carry an AYAB shield
    pub fn is_arduino(&self) -> bool {
        self.vid.is_some_and(|vid| ARDUINO_VIDS.contains(&vid))
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb_info) => Self {
                name: info.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
            },
            _ => Self::named(info.port_name),
        }
    }
}

/// Sort key: Arduino boards first, then ttyACM*, ttyUSB* (numerically), then the rest by name
fn port_sort_key(port: &PortInfo) -> (bool, u8, usize, String) {
    let name = port.name.as_str();
    let basename = name.rsplit('/').next().unwrap_or(name);
    let (class, num) = if let Some(rest) = basename.strip_prefix("ttyACM") {
        (0, rest.parse::<usize>().unwrap_or(usize::MAX))
    } else if let Some(rest) = basename.strip_prefix("ttyUSB") {
        (1, rest.parse::<usize>().unwrap_or(usize::MAX))
    } else {
        (2, 0)
    };
    (!port.is_arduino(), class, num, basename.to_string())
}

/// List available serial ports, likely AYAB controllers first
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let port = PortInfo::from(info);
        map.entry(port.name.clone()).or_insert(port);
    }

    // udev may not report CDC devices in containers
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::named(full));
                }
            }
        }
    }

    let mut ports: Vec<PortInfo> = map.into_values().collect();
    ports.sort_by_key(port_sort_key);
    ports
}

/// Open the AYAB serial line: 115200 baud, 8N1, no flow control
pub fn open_port(path: &str) -> Result<SerialStream, ProtocolError> {
    debug!("Opening serial port {} at {} baud", path, AYAB_BAUD_RATE);
    tokio_serial::new(path, AYAB_BAUD_RATE)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()
        .map_err(|e| ProtocolError::SerialError(format!("{}: {}", path, e)))
}
