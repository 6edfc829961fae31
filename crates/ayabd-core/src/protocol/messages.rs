//! Protocol messages
//!
//! Defines the messages exchanged with the AYAB controller. The leading byte of
//! every message is composed of a direction bit, a request/confirm bit and a
//! message id.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use super::crc::crc8;
use super::row::{NeedleBitmap, BITMAP_LEN};

/// Message codes
pub mod code {
    /// Direction bit: message originates from the AYAB
    pub const FROM_AYAB: u8 = 0x80;
    /// Confirmation bit (responses)
    pub const CONFIRM: u8 = 0x40;

    pub const MSGID_START: u8 = 0x01;
    pub const MSGID_LINE: u8 = 0x02;
    pub const MSGID_INFO: u8 = 0x03;
    pub const MSGID_STATE: u8 = 0x04;

    pub const REQ_START: u8 = MSGID_START;
    pub const REQ_INFO: u8 = MSGID_INFO;
    pub const CNF_LINE: u8 = CONFIRM | MSGID_LINE;

    pub const CNF_START: u8 = CONFIRM | MSGID_START;
    pub const CNF_INFO: u8 = CONFIRM | MSGID_INFO;
    pub const REQ_LINE: u8 = FROM_AYAB | MSGID_LINE;
    pub const IND_STATE: u8 = FROM_AYAB | MSGID_STATE;

    /// Leading byte of a debug text line
    pub const DEBUG_TEXT: u8 = b'#';
}

/// Total size of a LINE response frame
pub const LINE_RESPONSE_LEN: usize = 2 + BITMAP_LEN + 2;
/// Size of the INFO confirmation (code, api, fw major, fw minor)
pub const INFO_CONFIRM_LEN: usize = 4;
/// Size of the START confirmation (code, status)
pub const START_CONFIRM_LEN: usize = 2;
/// Size of the LINE request (code, row number)
pub const LINE_REQUEST_LEN: usize = 2;
/// Size of the state indication
pub const STATE_INDICATION_LEN: usize = 8;

/// Status byte value of a successful START confirmation
pub const START_STATUS_OK: u8 = 1;

/// Flag bit in a LINE response marking the final row of a job
pub const FLAG_LAST_LINE: u8 = 0x01;

/// Version information from the INFO confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareInfo {
    pub api_version: u8,
    pub fw_major: u8,
    pub fw_minor: u8,
}

/// Carriage detected by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Carriage {
    None,
    Knit,
    Hole,
    Unknown(u8),
}

impl Carriage {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Carriage::None,
            1 => Carriage::Knit,
            2 => Carriage::Hole,
            other => Carriage::Unknown(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Carriage::None => 0,
            Carriage::Knit => 1,
            Carriage::Hole => 2,
            Carriage::Unknown(other) => other,
        }
    }
}

/// Machine state as reported by the state indication (firmware v4+)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineState {
    pub ready: bool,
    pub hall_left: u16,
    pub hall_right: u16,
    pub carriage: Carriage,
    pub needle: u8,
}

impl MachineState {
    /// Decode from a complete 8 byte indication (including code byte)
    pub(crate) fn from_indication(bytes: &[u8]) -> Self {
        Self {
            ready: bytes[1] != 0,
            hall_left: BigEndian::read_u16(&bytes[2..4]),
            hall_right: BigEndian::read_u16(&bytes[4..6]),
            carriage: Carriage::from_byte(bytes[6]),
            needle: bytes[7],
        }
    }
}

/// A LINE response carrying one row of needle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineResponse {
    /// Device row number this answers
    pub row_number: u8,
    /// Packed needle bits, needle 0 in bit 0 of the first byte
    pub needles: NeedleBitmap,
    /// No more rows follow
    pub last_line: bool,
}

impl LineResponse {
    /// The final, empty row that terminates a job
    pub fn end_of_job(row_number: u8) -> Self {
        Self {
            row_number,
            needles: [0u8; BITMAP_LEN],
            last_line: true,
        }
    }
}

/// Messages sent from host to AYAB
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMessage {
    /// Query API and firmware version
    InfoRequest,
    /// Configure the needle range and begin knitting
    StartRequest { first_needle: u8, last_needle: u8 },
    /// Answer to a LINE request
    LineResponse(LineResponse),
}

impl HostMessage {
    /// Encode to wire format
    pub fn encode(&self) -> Vec<u8> {
        match self {
            HostMessage::InfoRequest => vec![code::REQ_INFO],
            HostMessage::StartRequest {
                first_needle,
                last_needle,
            } => vec![code::REQ_START, *first_needle, *last_needle],
            HostMessage::LineResponse(line) => {
                let mut bytes = Vec::with_capacity(LINE_RESPONSE_LEN);
                bytes.push(code::CNF_LINE);
                bytes.push(line.row_number);
                bytes.extend_from_slice(&line.needles);
                bytes.push(if line.last_line { FLAG_LAST_LINE } else { 0 });
                // CRC over everything before it, seed 0
                bytes.push(crc8(&bytes, 0));
                bytes
            }
        }
    }

    /// Decode a host message from the start of `bytes`.
    ///
    /// Returns the message and the number of bytes it occupies, or `None` if the
    /// bytes do not (yet) hold a complete message. Used by the simulated device.
    pub fn decode(bytes: &[u8]) -> Option<(Self, usize)> {
        match *bytes.first()? {
            code::REQ_INFO => Some((HostMessage::InfoRequest, 1)),
            code::REQ_START if bytes.len() >= 3 => Some((
                HostMessage::StartRequest {
                    first_needle: bytes[1],
                    last_needle: bytes[2],
                },
                3,
            )),
            code::CNF_LINE if bytes.len() >= LINE_RESPONSE_LEN => {
                let mut needles = [0u8; BITMAP_LEN];
                needles.copy_from_slice(&bytes[2..2 + BITMAP_LEN]);
                Some((
                    HostMessage::LineResponse(LineResponse {
                        row_number: bytes[1],
                        needles,
                        last_line: bytes[2 + BITMAP_LEN] & FLAG_LAST_LINE != 0,
                    }),
                    LINE_RESPONSE_LEN,
                ))
            }
            _ => None,
        }
    }
}

/// Messages sent from AYAB to host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    /// Answer to [`HostMessage::InfoRequest`]
    InfoConfirm(FirmwareInfo),
    /// Answer to [`HostMessage::StartRequest`]
    StartConfirm { status: u8 },
    /// The carriage needs the next row
    LineRequest { row_number: u8 },
    /// Hall sensors, carriage and needle position (firmware v4+)
    StateIndication(MachineState),
    /// Free text debug output
    Debug(String),
}

impl DeviceMessage {
    /// Encode to wire format (as the controller would send it)
    pub fn encode(&self) -> Vec<u8> {
        match self {
            DeviceMessage::InfoConfirm(info) => {
                vec![code::CNF_INFO, info.api_version, info.fw_major, info.fw_minor]
            }
            DeviceMessage::StartConfirm { status } => vec![code::CNF_START, *status],
            DeviceMessage::LineRequest { row_number } => vec![code::REQ_LINE, *row_number],
            DeviceMessage::StateIndication(state) => {
                let mut bytes = vec![code::IND_STATE, state.ready as u8, 0, 0, 0, 0];
                BigEndian::write_u16(&mut bytes[2..4], state.hall_left);
                BigEndian::write_u16(&mut bytes[4..6], state.hall_right);
                bytes.push(state.carriage.to_byte());
                bytes.push(state.needle);
                bytes
            }
            DeviceMessage::Debug(text) => {
                let mut bytes = Vec::with_capacity(text.len() + 3);
                bytes.push(code::DEBUG_TEXT);
                bytes.extend_from_slice(text.as_bytes());
                bytes.extend_from_slice(b"\r\n");
                bytes
            }
        }
    }
}
