//! Simulated AYAB controller
//!
//! Stands in for the shield when the connection specification is
//! `simulation`. Every command is confirmed immediately with success; row
//! requests are issued on manual trigger or, in full speed mode, every
//! [`FULL_SPEED_INTERVAL`] until the last line has been received.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::crc;
use super::messages::{code, DeviceMessage, FirmwareInfo, HostMessage, START_STATUS_OK};
use super::SUPPORTED_API_VERSION;

/// Delay between row requests in full speed mode
pub const FULL_SPEED_INTERVAL: Duration = Duration::from_millis(10);

/// Firmware version the simulated device reports
pub const SIMULATED_FIRMWARE: FirmwareInfo = FirmwareInfo {
    api_version: SUPPORTED_API_VERSION,
    fw_major: 1,
    fw_minor: 0,
};

/// Sans-IO controller stub
#[derive(Debug, Default)]
pub struct SimulatedDevice {
    /// Bytes from the host not decoded yet
    input: Vec<u8>,
    /// Bytes for the host
    output: Vec<u8>,
    knitting: bool,
    full_speed: bool,
    /// A row request is waiting for its LINE response
    awaiting_line: bool,
    next_row: u8,
    lines_received: u32,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_knitting(&self) -> bool {
        self.knitting
    }

    pub fn full_speed(&self) -> bool {
        self.full_speed
    }

    pub fn awaiting_line(&self) -> bool {
        self.awaiting_line
    }

    /// LINE responses received since the last START
    pub fn lines_received(&self) -> u32 {
        self.lines_received
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    /// Process bytes written by the host
    pub fn receive(&mut self, bytes: &[u8]) {
        self.input.extend_from_slice(bytes);
        while let Some(&lead) = self.input.first() {
            if !matches!(lead, code::REQ_INFO | code::REQ_START | code::CNF_LINE) {
                debug!("Simulation: dropping unexpected byte 0x{:02X}", lead);
                self.input.remove(0);
                continue;
            }
            let Some((message, consumed)) = HostMessage::decode(&self.input) else {
                break;
            };
            let crc_ok = lead != code::CNF_LINE || crc::verify(&self.input[..consumed]);
            self.input.drain(..consumed);
            self.handle(message, crc_ok);
        }
    }

    fn handle(&mut self, message: HostMessage, crc_ok: bool) {
        match message {
            HostMessage::InfoRequest => {
                debug!("Simulation: INFO");
                self.emit(DeviceMessage::InfoConfirm(SIMULATED_FIRMWARE));
            }
            HostMessage::StartRequest {
                first_needle,
                last_needle,
            } => {
                info!(
                    "Simulation: START needles {}..={}",
                    first_needle, last_needle
                );
                self.knitting = true;
                self.awaiting_line = false;
                self.next_row = 0;
                self.lines_received = 0;
                self.emit(DeviceMessage::StartConfirm {
                    status: START_STATUS_OK,
                });
            }
            HostMessage::LineResponse(line) => {
                if !crc_ok {
                    warn!("Simulation: LINE {} has a bad CRC", line.row_number);
                }
                self.awaiting_line = false;
                self.lines_received += 1;
                if line.last_line {
                    info!(
                        "Simulation: last line received after {} lines",
                        self.lines_received
                    );
                    self.knitting = false;
                    self.full_speed = false;
                }
            }
        }
    }

    fn emit(&mut self, message: DeviceMessage) {
        self.output.extend_from_slice(&message.encode());
    }

    /// Request the next row, as the carriage passing the turn mark would.
    /// Returns false when no job is running.
    pub fn request_row(&mut self) -> bool {
        if !self.knitting {
            debug!("Simulation: no job running, row request ignored");
            return false;
        }
        let row_number = self.next_row;
        self.next_row = self.next_row.wrapping_add(1);
        self.awaiting_line = true;
        self.emit(DeviceMessage::LineRequest { row_number });
        true
    }

    pub fn set_full_speed(&mut self, full_speed: bool) {
        self.full_speed = full_speed;
    }

    /// Hardware reset: forget everything
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Async front end of [`SimulatedDevice`] used by the transport
#[derive(Debug, Default)]
pub struct SimulatedLink {
    device: SimulatedDevice,
}

impl SimulatedLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(&self) -> &SimulatedDevice {
        &self.device
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.device.receive(bytes);
    }

    /// Manual row trigger; ends full speed mode
    pub fn trigger_row(&mut self) -> bool {
        self.device.set_full_speed(false);
        self.device.request_row()
    }

    /// Switch full speed mode, requesting the first row right away
    pub fn set_full_speed(&mut self, full_speed: bool) {
        self.device.set_full_speed(full_speed);
        if full_speed && !self.device.awaiting_line() {
            self.device.request_row();
        }
    }

    pub fn reset(&mut self) {
        self.device.reset();
    }

    /// Wait for device output. Cancel safe: output is only taken when returned.
    pub async fn receive(&mut self) -> Vec<u8> {
        loop {
            if self.device.has_output() {
                return self.device.take_output();
            }
            let device = &self.device;
            if device.full_speed() && device.is_knitting() && !device.awaiting_line() {
                tokio::time::sleep(FULL_SPEED_INTERVAL).await;
                self.device.request_row();
                continue;
            }
            std::future::pending::<()>().await;
        }
    }
}
