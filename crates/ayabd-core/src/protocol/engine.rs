//! AYAB protocol engine
//!
//! The engine owns the session with the controller but performs no I/O itself.
//! The service feeds it received bytes and the current time and drains the
//! resulting [`EngineOutput`]s (bytes to transmit, reset line changes, job
//! results). Deadlines are reported through [`AyabEngine::poll_timeout`].
//!
//! A job is started with an INFO request. When the firmware reports a
//! supported API version the START request follows, and once START is
//! confirmed the controller requests rows one by one until the row source is
//! exhausted.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::framing::{
    frame_confirm, frame_unsolicited, ConfirmFrame, ExpectedConfirm, FramingBuffer,
    UnsolicitedFrame,
};
use super::messages::{
    DeviceMessage, FirmwareInfo, HostMessage, LineResponse, MachineState, START_STATUS_OK,
};
use super::row::{pack_row, KnitRow};
use super::{ProtocolError, NEEDLE_COUNT, RESET_SETTLE, RESPONSE_TIMEOUT, SUPPORTED_API_VERSION};

/// Session with the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No transport, or the controller is being reset
    Offline,
    /// Transport open, firmware not queried yet
    Connected,
    /// Firmware version accepted, no job running
    Ready,
    /// The controller requests rows
    Knitting,
}

impl SessionState {
    /// Numeric status as reported through the control API
    pub fn status_code(self) -> u8 {
        match self {
            SessionState::Offline => 0,
            SessionState::Connected => 1,
            SessionState::Ready => 2,
            SessionState::Knitting => 3,
        }
    }
}

/// Needle range of a knitting job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobParams {
    pub first_needle: u16,
    pub width: u16,
}

impl JobParams {
    /// Validate a needle range: at least two needles, all of them on the bed
    pub fn new(first_needle: u16, width: u16) -> Result<Self, ProtocolError> {
        if width < 2 || u32::from(first_needle) + u32::from(width) > u32::from(NEEDLE_COUNT) {
            return Err(ProtocolError::InvalidJob {
                first_needle,
                width,
            });
        }
        Ok(Self {
            first_needle,
            width,
        })
    }

    pub fn last_needle(&self) -> u16 {
        self.first_needle + self.width - 1
    }
}

/// Supplies the rows of a job.
///
/// `row_number` counts the rows of the current job from 0. Returning `None`
/// ends the job.
pub trait RowSource {
    fn next_row(&mut self, row_number: u32) -> Option<KnitRow>;
}

impl<F> RowSource for F
where
    F: FnMut(u32) -> Option<KnitRow>,
{
    fn next_row(&mut self, row_number: u32) -> Option<KnitRow> {
        self(row_number)
    }
}

/// Something the service has to act on
#[derive(Debug)]
pub enum EngineOutput {
    /// Write these bytes to the transport
    Transmit(Vec<u8>),
    /// Drive the hardware reset line (`true` = asserted)
    SetResetLine(bool),
    /// The job attempt ended without knitting (all rows)
    JobFailed(ProtocolError),
    /// The row source is exhausted and the last line was sent
    JobCompleted { rows: u32 },
    /// A restart sequence has finished, the controller is connected again
    RestartComplete,
}

/// Snapshot of the session for status reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub state: SessionState,
    pub status: u8,
    pub firmware: Option<FirmwareInfo>,
    pub machine: Option<MachineState>,
    pub job: Option<JobParams>,
    pub row_count: u32,
    pub next_row: u8,
}

/// The command waiting for its confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingCommand {
    Info,
    Start,
}

impl PendingCommand {
    fn expected(self) -> ExpectedConfirm {
        match self {
            PendingCommand::Info => ExpectedConfirm::Info,
            PendingCommand::Start => ExpectedConfirm::Start,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    command: PendingCommand,
    deadline: Instant,
}

/// Steps of a hardware restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetSequence {
    Asserted { until: Instant },
    Released { until: Instant },
}

impl ResetSequence {
    fn deadline(self) -> Instant {
        match self {
            ResetSequence::Asserted { until } | ResetSequence::Released { until } => until,
        }
    }
}

/// Sans-IO AYAB session
#[derive(Debug)]
pub struct AyabEngine {
    state: SessionState,
    job: Option<JobParams>,
    pending: Option<Pending>,
    reset: Option<ResetSequence>,
    framing: FramingBuffer,
    firmware: Option<FirmwareInfo>,
    machine: Option<MachineState>,
    /// Rows requested in the current job
    row_count: u32,
    /// Device row number the next LINE response carries
    next_request_row: u8,
    response_timeout: Duration,
    reset_settle: Duration,
    outputs: VecDeque<EngineOutput>,
}

impl Default for AyabEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AyabEngine {
    pub fn new() -> Self {
        Self::with_timing(RESPONSE_TIMEOUT, RESET_SETTLE)
    }

    /// Create an engine with custom response timeout and reset settle time
    pub fn with_timing(response_timeout: Duration, reset_settle: Duration) -> Self {
        Self {
            state: SessionState::Offline,
            job: None,
            pending: None,
            reset: None,
            framing: FramingBuffer::new(),
            firmware: None,
            machine: None,
            row_count: 0,
            next_request_row: 0,
            response_timeout,
            reset_settle,
            outputs: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn job(&self) -> Option<JobParams> {
        self.job
    }

    pub fn firmware(&self) -> Option<FirmwareInfo> {
        self.firmware
    }

    pub fn machine_state(&self) -> Option<MachineState> {
        self.machine
    }

    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    pub fn next_request_row(&self) -> u8 {
        self.next_request_row
    }

    pub fn is_knitting(&self) -> bool {
        self.state == SessionState::Knitting
    }

    pub fn is_resetting(&self) -> bool {
        self.reset.is_some()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state,
            status: self.state.status_code(),
            firmware: self.firmware,
            machine: self.machine,
            job: self.job,
            row_count: self.row_count,
            next_row: self.next_request_row,
        }
    }

    /// The transport has been opened
    pub fn transport_connected(&mut self) {
        if self.reset.is_some() || self.state != SessionState::Offline {
            return;
        }
        self.framing.clear();
        if let Err(e) = self.enter_connected() {
            debug!("Ignoring transport connect: {}", e);
        }
    }

    /// The transport went away. A command in flight or a running job fails.
    pub fn transport_lost(&mut self) {
        let interrupted = self.pending.take().is_some() || self.state == SessionState::Knitting;
        self.reset = None;
        self.framing.clear();
        self.enter_offline();
        if interrupted {
            self.fail_job(ProtocolError::ConnectionLost);
        }
    }

    /// Start a job on the needles `first_needle..first_needle + width`.
    ///
    /// Only validates and sends the INFO request; the outcome is reported
    /// through [`EngineOutput::JobFailed`] or the controller's row requests.
    pub fn start_job(
        &mut self,
        first_needle: u16,
        width: u16,
        now: Instant,
    ) -> Result<(), ProtocolError> {
        let params = JobParams::new(first_needle, width)?;
        if self.state == SessionState::Offline || self.reset.is_some() {
            return Err(ProtocolError::NotConnected);
        }
        if self.pending.is_some() {
            return Err(ProtocolError::Busy);
        }
        info!(
            "Starting job on needles {}..={}",
            params.first_needle,
            params.last_needle()
        );
        self.job = Some(params);
        self.send_command(PendingCommand::Info, HostMessage::InfoRequest, now);
        Ok(())
    }

    /// Pulse the hardware reset line. The session is offline until
    /// [`EngineOutput::RestartComplete`] is emitted.
    pub fn restart(&mut self, now: Instant) {
        if let Some(pending) = self.pending.take() {
            debug!("Dropping pending {:?} command for restart", pending.command);
        }
        self.framing.clear();
        self.enter_offline();
        info!("Resetting AYAB controller");
        self.outputs.push_back(EngineOutput::SetResetLine(true));
        self.reset = Some(ResetSequence::Asserted {
            until: now + self.reset_settle,
        });
    }

    /// Earliest instant at which [`AyabEngine::handle_timeout`] has work to do
    pub fn poll_timeout(&self) -> Option<Instant> {
        let reset = self.reset.map(ResetSequence::deadline);
        let pending = self.pending.map(|p| p.deadline);
        match (reset, pending) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        match self.reset {
            Some(ResetSequence::Asserted { until }) if now >= until => {
                self.outputs.push_back(EngineOutput::SetResetLine(false));
                self.reset = Some(ResetSequence::Released {
                    until: now + self.reset_settle,
                });
            }
            Some(ResetSequence::Released { until }) if now >= until => {
                self.reset = None;
                self.framing.clear();
                if let Err(e) = self.enter_connected() {
                    warn!("Restart finished in unexpected state: {}", e);
                }
                self.outputs.push_back(EngineOutput::RestartComplete);
            }
            _ => {}
        }

        if let Some(pending) = self.pending {
            if now >= pending.deadline {
                self.pending = None;
                warn!("No response to {:?} command", pending.command);
                self.fail_job(ProtocolError::Timeout);
            }
        }
    }

    pub fn poll_output(&mut self) -> Option<EngineOutput> {
        self.outputs.pop_front()
    }

    /// Feed bytes received from the transport
    pub fn handle_input(&mut self, data: &[u8], now: Instant, rows: &mut dyn RowSource) {
        if self.reset.is_some() {
            debug!("Discarding {} bytes received during reset", data.len());
            return;
        }
        self.framing.push(data);

        loop {
            if let Some(pending) = self.pending {
                match frame_confirm(pending.command.expected(), self.framing.pending()) {
                    ConfirmFrame::NeedMore => break,
                    ConfirmFrame::Confirmed { message, consumed } => {
                        self.framing.consume(consumed);
                        self.pending = None;
                        self.on_confirm(message, now);
                    }
                    ConfirmFrame::Malformed { code, consumed } => {
                        self.framing.consume(consumed);
                        self.pending = None;
                        self.fail_job(ProtocolError::UnexpectedResponse(code));
                    }
                }
            } else {
                match frame_unsolicited(self.framing.pending()) {
                    UnsolicitedFrame::NeedMore => break,
                    UnsolicitedFrame::Discard(count) => {
                        debug!(
                            "Discarding unrecognized bytes: {:02X?}",
                            &self.framing.pending()[..count]
                        );
                        self.framing.consume(count);
                    }
                    UnsolicitedFrame::Message { message, consumed } => {
                        self.framing.consume(consumed);
                        self.on_unsolicited(message, rows);
                    }
                }
            }
        }
    }

    fn on_confirm(&mut self, message: DeviceMessage, now: Instant) {
        match message {
            DeviceMessage::InfoConfirm(firmware) => self.on_info_confirm(firmware, now),
            DeviceMessage::StartConfirm { status } => self.on_start_confirm(status),
            other => debug!("Ignoring {:?} as confirmation", other),
        }
    }

    fn on_info_confirm(&mut self, firmware: FirmwareInfo, now: Instant) {
        info!(
            "AYAB API v{}, firmware v{}.{}",
            firmware.api_version, firmware.fw_major, firmware.fw_minor
        );
        self.firmware = Some(firmware);
        if firmware.api_version != SUPPORTED_API_VERSION {
            self.fail_job(ProtocolError::VersionMismatch {
                expected: SUPPORTED_API_VERSION,
                actual: firmware.api_version,
            });
            return;
        }
        if let Err(e) = self.enter_ready() {
            self.fail_job(e);
            return;
        }
        let Some(job) = self.job else {
            warn!("INFO confirmed without a job");
            return;
        };
        // both needles are below NEEDLE_COUNT
        let start = HostMessage::StartRequest {
            first_needle: job.first_needle as u8,
            last_needle: job.last_needle() as u8,
        };
        self.send_command(PendingCommand::Start, start, now);
    }

    fn on_start_confirm(&mut self, status: u8) {
        if status != START_STATUS_OK {
            self.fail_job(ProtocolError::StartFailed(status));
            return;
        }
        self.row_count = 0;
        self.next_request_row = 0;
        if let Err(e) = self.enter_knitting() {
            self.fail_job(e);
        }
    }

    fn on_unsolicited(&mut self, message: DeviceMessage, rows: &mut dyn RowSource) {
        match message {
            DeviceMessage::LineRequest { row_number } => self.on_line_request(row_number, rows),
            DeviceMessage::StateIndication(state) => {
                debug!(
                    "AYAB state: ready={} hall={}/{} carriage={:?} needle={}",
                    state.ready, state.hall_left, state.hall_right, state.carriage, state.needle
                );
                self.machine = Some(state);
            }
            DeviceMessage::Debug(text) => debug!("AYAB: {}", text),
            other => debug!("Ignoring unsolicited {:?}", other),
        }
    }

    fn on_line_request(&mut self, device_row: u8, rows: &mut dyn RowSource) {
        if self.state != SessionState::Knitting {
            warn!("Row {} requested while not knitting, ignored", device_row);
            return;
        }
        let Some(job) = self.job else {
            return;
        };
        if device_row != self.next_request_row {
            warn!(
                "AYAB requests row {}, expected {}; following the device",
                device_row, self.next_request_row
            );
            self.next_request_row = device_row;
        }

        let row_number = self.row_count;
        self.row_count += 1;
        match rows.next_row(row_number) {
            Some(row) => {
                info!("Row {:4}: {}", row_number, row.to_ascii());
                let line = LineResponse {
                    row_number: self.next_request_row,
                    needles: pack_row(&row, job.first_needle),
                    last_line: false,
                };
                self.transmit(HostMessage::LineResponse(line));
                self.next_request_row = self.next_request_row.wrapping_add(1);
            }
            None => {
                info!("End of pattern after {} rows", row_number);
                self.transmit(HostMessage::LineResponse(LineResponse::end_of_job(
                    self.next_request_row,
                )));
                if let Err(e) = self.enter_ready() {
                    warn!("{}", e);
                }
                self.outputs
                    .push_back(EngineOutput::JobCompleted { rows: row_number });
            }
        }
    }

    fn fail_job(&mut self, error: ProtocolError) {
        warn!("Knitting job failed: {}", error);
        self.outputs.push_back(EngineOutput::JobFailed(error));
    }

    fn transmit(&mut self, message: HostMessage) {
        let bytes = message.encode();
        debug!("TX {:02X?}", bytes);
        self.outputs.push_back(EngineOutput::Transmit(bytes));
    }

    fn send_command(&mut self, command: PendingCommand, message: HostMessage, now: Instant) {
        self.transmit(message);
        self.pending = Some(Pending {
            command,
            deadline: now + self.response_timeout,
        });
    }

    fn transition(
        &mut self,
        to: SessionState,
        allowed_from: &[SessionState],
    ) -> Result<(), ProtocolError> {
        if !allowed_from.contains(&self.state) {
            return Err(ProtocolError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        if self.state != to {
            info!("Session {:?} -> {:?}", self.state, to);
        }
        self.state = to;
        Ok(())
    }

    fn enter_offline(&mut self) {
        if self.state != SessionState::Offline {
            info!("Session {:?} -> Offline", self.state);
        }
        self.state = SessionState::Offline;
    }

    fn enter_connected(&mut self) -> Result<(), ProtocolError> {
        self.transition(SessionState::Connected, &[SessionState::Offline])
    }

    fn enter_ready(&mut self) -> Result<(), ProtocolError> {
        self.transition(
            SessionState::Ready,
            &[
                SessionState::Connected,
                SessionState::Ready,
                SessionState::Knitting,
            ],
        )
    }

    fn enter_knitting(&mut self) -> Result<(), ProtocolError> {
        self.transition(SessionState::Knitting, &[SessionState::Ready])
    }
}
