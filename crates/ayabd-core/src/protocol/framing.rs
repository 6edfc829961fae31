//! Message re-assembly
//!
//! Bytes from the transport arrive in arbitrary chunks. The framing functions
//! look at the buffered bytes and decide how many of them form the next complete
//! message, whether more bytes are needed, or whether the bytes are garbage.

use super::messages::{
    code, DeviceMessage, FirmwareInfo, MachineState, INFO_CONFIRM_LEN, LINE_REQUEST_LEN,
    START_CONFIRM_LEN, STATE_INDICATION_LEN,
};

const CR: u8 = 0x0D;
const LF: u8 = 0x0A;

/// Longest debug line accepted, including the leading `#`
pub const MAX_DEBUG_LINE: usize = 256;

/// Result of framing bytes that arrived while no command was outstanding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsolicitedFrame {
    /// A complete message occupying the first `consumed` bytes
    Message {
        message: DeviceMessage,
        consumed: usize,
    },
    /// The message has started but is not complete yet
    NeedMore,
    /// Unrecognized data, drop this many bytes to resynchronize.
    /// Covers everything up to the next possible message start, or all bytes.
    Discard(usize),
}

/// Result of framing bytes while a command waits for its confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmFrame {
    /// The expected confirmation, occupying the first `consumed` bytes
    Confirmed {
        message: DeviceMessage,
        consumed: usize,
    },
    /// Not enough bytes for the expected confirmation yet
    NeedMore,
    /// A reply of the right size but with the wrong leading code
    Malformed { code: u8, consumed: usize },
}

/// The confirmation a pending command expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedConfirm {
    Info,
    Start,
}

impl ExpectedConfirm {
    pub fn code(self) -> u8 {
        match self {
            ExpectedConfirm::Info => code::CNF_INFO,
            ExpectedConfirm::Start => code::CNF_START,
        }
    }

    /// Fixed size of the confirmation
    pub fn size(self) -> usize {
        match self {
            ExpectedConfirm::Info => INFO_CONFIRM_LEN,
            ExpectedConfirm::Start => START_CONFIRM_LEN,
        }
    }
}

/// Count CR/LF bytes directly following `start`
fn trailing_line_end(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .take_while(|b| **b == CR || **b == LF)
        .count()
}

/// Frame data the controller sent on its own initiative
pub fn frame_unsolicited(bytes: &[u8]) -> UnsolicitedFrame {
    let Some(&lead) = bytes.first() else {
        return UnsolicitedFrame::NeedMore;
    };
    match lead {
        code::DEBUG_TEXT => {
            // ASCII text up to CR, followed by its LF companion. A stray '#'
            // must not swallow the binary messages behind it.
            let end = bytes
                .iter()
                .take(MAX_DEBUG_LINE)
                .position(|b| *b == CR || !b.is_ascii());
            match end {
                Some(cr) if bytes[cr] == CR => {
                    if cr + 2 <= bytes.len() {
                        UnsolicitedFrame::Message {
                            message: DeviceMessage::Debug(
                                String::from_utf8_lossy(&bytes[1..cr]).into_owned(),
                            ),
                            consumed: cr + 2,
                        }
                    } else {
                        UnsolicitedFrame::NeedMore
                    }
                }
                Some(_) => UnsolicitedFrame::Discard(1),
                None if bytes.len() >= MAX_DEBUG_LINE => UnsolicitedFrame::Discard(1),
                None => UnsolicitedFrame::NeedMore,
            }
        }
        code::REQ_LINE => {
            if bytes.len() < LINE_REQUEST_LEN {
                return UnsolicitedFrame::NeedMore;
            }
            // some firmware versions append CRLF
            let consumed = LINE_REQUEST_LEN + trailing_line_end(bytes, LINE_REQUEST_LEN);
            UnsolicitedFrame::Message {
                message: DeviceMessage::LineRequest {
                    row_number: bytes[1],
                },
                consumed,
            }
        }
        code::IND_STATE => {
            if bytes.len() < STATE_INDICATION_LEN {
                return UnsolicitedFrame::NeedMore;
            }
            UnsolicitedFrame::Message {
                message: DeviceMessage::StateIndication(MachineState::from_indication(
                    &bytes[..STATE_INDICATION_LEN],
                )),
                consumed: STATE_INDICATION_LEN,
            }
        }
        _ => {
            // drop everything up to the next byte that can start a message
            let garbage = bytes[1..]
                .iter()
                .position(|b| is_message_start(*b))
                .map_or(bytes.len(), |pos| pos + 1);
            UnsolicitedFrame::Discard(garbage)
        }
    }
}

fn is_message_start(byte: u8) -> bool {
    matches!(byte, code::DEBUG_TEXT | code::REQ_LINE | code::IND_STATE)
}

/// Frame the confirmation for a pending command.
///
/// A reply is recognized by its fixed size and leading code only; CR/LF that
/// some firmware versions append is swallowed when already buffered.
pub fn frame_confirm(expected: ExpectedConfirm, bytes: &[u8]) -> ConfirmFrame {
    let len = expected.size();
    if bytes.len() < len {
        return ConfirmFrame::NeedMore;
    }
    let consumed = len + trailing_line_end(bytes, len);
    if bytes[0] != expected.code() {
        return ConfirmFrame::Malformed {
            code: bytes[0],
            consumed,
        };
    }
    let message = match expected {
        ExpectedConfirm::Info => DeviceMessage::InfoConfirm(FirmwareInfo {
            api_version: bytes[1],
            fw_major: bytes[2],
            fw_minor: bytes[3],
        }),
        ExpectedConfirm::Start => DeviceMessage::StartConfirm { status: bytes[1] },
    };
    ConfirmFrame::Confirmed { message, consumed }
}

/// Accumulates received bytes until they can be framed
#[derive(Debug, Default)]
pub struct FramingBuffer {
    bytes: Vec<u8>,
}

impl FramingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes
    pub fn push(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// All buffered, not yet consumed bytes
    pub fn pending(&self) -> &[u8] {
        &self.bytes
    }

    /// Drop `count` leading bytes
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.bytes.len());
        self.bytes.drain(..count);
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
