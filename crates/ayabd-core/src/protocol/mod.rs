//! AYAB Serial Protocol
//!
//! Implements the host side of the AYAB knitting controller protocol: a
//! byte-framed request/response exchange (INFO, START) followed by device
//! driven LINE requests that are answered with bit-packed needle rows.
//!
//! The [`AyabEngine`] is a sans-IO state machine; [`Transport`] moves its bytes
//! over a serial port, TCP, or an in-process simulated device.

pub mod crc;
mod engine;
mod error;
pub mod framing;
pub mod messages;
pub mod row;
pub mod serial;
pub mod simulation;
mod transport;

use std::time::Duration;

pub use engine::{AyabEngine, EngineOutput, EngineStatus, JobParams, RowSource, SessionState};
pub use error::ProtocolError;
pub use framing::{ConfirmFrame, FramingBuffer, UnsolicitedFrame};
pub use messages::{Carriage, DeviceMessage, FirmwareInfo, HostMessage, LineResponse, MachineState};
pub use row::{pack_row, unpack_row, KnitRow, NeedleBitmap};
pub use serial::{list_ports, PortInfo};
pub use simulation::{SimulatedDevice, SimulatedLink};
pub use transport::{ConnectionSpec, Transport};

/// Baud rate of the AYAB shield's Arduino
pub const AYAB_BAUD_RATE: u32 = 115200;

/// Default port for TCP connections to a serial proxy
pub const DEFAULT_TCP_PORT: u16 = 2109;

/// Connection specification selecting the simulated device
pub const SIMULATION_SPEC: &str = "simulation";

/// The only API version this host implementation speaks
pub const SUPPORTED_API_VERSION: u8 = 4;

/// Number of needles on the bed
pub const NEEDLE_COUNT: u16 = 200;

/// Timeout for command responses.
/// Large, because the controller can take a long time to answer right after reset.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(20);

/// Time the reset line is held, and time allowed for the controller to boot afterwards
pub const RESET_SETTLE: Duration = Duration::from_secs(2);
