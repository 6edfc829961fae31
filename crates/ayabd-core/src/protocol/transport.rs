//! Byte transports to the controller

use std::fmt;
use std::str::FromStr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_serial::{SerialPort, SerialStream};
use tracing::{debug, info, warn};

use super::serial::open_port;
use super::simulation::SimulatedLink;
use super::{ProtocolError, DEFAULT_TCP_PORT, SIMULATION_SPEC};

const READ_CHUNK: usize = 256;

/// Where the controller is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSpec {
    /// In-process simulated device
    Simulation,
    /// Local serial device
    Serial { path: String },
    /// Serial-to-TCP proxy
    Tcp { host: String, port: u16 },
}

impl ConnectionSpec {
    /// Parse `simulation`, a device path (`/dev/ttyACM0`, `COM3`) or `host[:port]`
    pub fn parse(spec: &str) -> Result<Self, ProtocolError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(ProtocolError::InvalidConnectionSpec(
                "empty connection specification".to_string(),
            ));
        }
        if spec == SIMULATION_SPEC {
            return Ok(ConnectionSpec::Simulation);
        }
        if spec.starts_with('/') || is_windows_port(spec) {
            return Ok(ConnectionSpec::Serial {
                path: spec.to_string(),
            });
        }
        match spec.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    ProtocolError::InvalidConnectionSpec(format!("bad port in '{}'", spec))
                })?;
                if host.is_empty() {
                    return Err(ProtocolError::InvalidConnectionSpec(format!(
                        "missing host in '{}'",
                        spec
                    )));
                }
                Ok(ConnectionSpec::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            None => Ok(ConnectionSpec::Tcp {
                host: spec.to_string(),
                port: DEFAULT_TCP_PORT,
            }),
        }
    }

    pub fn is_simulation(&self) -> bool {
        matches!(self, ConnectionSpec::Simulation)
    }
}

fn is_windows_port(spec: &str) -> bool {
    match (spec.get(..3), spec.get(3..)) {
        (Some(prefix), Some(number)) => {
            prefix.eq_ignore_ascii_case("COM")
                && !number.is_empty()
                && number.chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

impl FromStr for ConnectionSpec {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionSpec::Simulation => write!(f, "{}", SIMULATION_SPEC),
            ConnectionSpec::Serial { path } => write!(f, "{}", path),
            ConnectionSpec::Tcp { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// An open byte stream to the controller
pub enum Transport {
    Serial(SerialStream),
    Tcp(TcpStream),
    Simulated(SimulatedLink),
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Serial(_) => f.write_str("Transport::Serial"),
            Transport::Tcp(stream) => write!(f, "Transport::Tcp({:?})", stream.peer_addr().ok()),
            Transport::Simulated(_) => f.write_str("Transport::Simulated"),
        }
    }
}

impl Transport {
    pub async fn open(spec: &ConnectionSpec) -> Result<Self, ProtocolError> {
        let transport = match spec {
            ConnectionSpec::Simulation => {
                info!("SIMULATION MODE: rows are requested through the control API");
                Transport::Simulated(SimulatedLink::new())
            }
            ConnectionSpec::Serial { path } => Transport::Serial(open_port(path)?),
            ConnectionSpec::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| {
                        ProtocolError::ConnectionFailed(format!("{}:{}: {}", host, port, e))
                    })?;
                stream.set_nodelay(true)?;
                Transport::Tcp(stream)
            }
        };
        info!("Connected to AYAB at {}", spec);
        Ok(transport)
    }

    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        match self {
            Transport::Serial(port) => {
                port.write_all(bytes).await?;
                port.flush().await?;
            }
            Transport::Tcp(stream) => stream.write_all(bytes).await?,
            Transport::Simulated(link) => link.send(bytes),
        }
        Ok(())
    }

    /// Wait for the next chunk of bytes. Cancel safe.
    pub async fn receive(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = [0u8; READ_CHUNK];
        let count = match self {
            Transport::Serial(port) => port.read(&mut buf).await?,
            Transport::Tcp(stream) => stream.read(&mut buf).await?,
            Transport::Simulated(link) => return Ok(link.receive().await),
        };
        if count == 0 {
            return Err(ProtocolError::ConnectionLost);
        }
        debug!("RX {:02X?}", &buf[..count]);
        Ok(buf[..count].to_vec())
    }

    /// Drive the controller's reset line (DTR on serial)
    pub fn set_reset_line(&mut self, asserted: bool) -> Result<(), ProtocolError> {
        match self {
            Transport::Serial(port) => port
                .write_data_terminal_ready(asserted)
                .map_err(|e| ProtocolError::SerialError(e.to_string())),
            Transport::Tcp(_) => {
                warn!("Reset line not available over TCP, ignored");
                Ok(())
            }
            Transport::Simulated(link) => {
                if asserted {
                    link.reset();
                }
                Ok(())
            }
        }
    }

    pub fn simulation_mut(&mut self) -> Option<&mut SimulatedLink> {
        match self {
            Transport::Simulated(link) => Some(link),
            _ => None,
        }
    }
}
