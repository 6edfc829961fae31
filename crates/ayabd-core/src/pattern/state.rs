//! Persisted queue state and JSON views for the control API

use serde::{Deserialize, Serialize};

/// Default number of colors
pub(crate) const DEFAULT_COLORS: u8 = 2;

/// Content of the queue state file.
///
/// A missing `queue` means no state has been saved so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueState {
    pub queue: Option<Vec<EntryState>>,
    pub cursor: CursorState,
    pub pattern_width: usize,
    pub pattern_shift: i32,
    pub ribber: bool,
    pub colors: u8,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            queue: None,
            cursor: CursorState::default(),
            pattern_width: 0,
            pattern_shift: 0,
            ribber: false,
            colors: DEFAULT_COLORS,
        }
    }
}

/// A persisted queue entry. Spacers have an empty file path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntryState {
    pub file_path: String,
    #[serde(rename = "weburl")]
    pub web_url: String,
    pub pattern_length: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorState {
    pub entry: usize,
    pub offset: usize,
    pub phase: u8,
}

/// Cursor as reported to API clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorView {
    pub entry: usize,
    pub offset: usize,
    pub phase: u8,
    pub position: usize,
    pub end_of_pattern: bool,
}

/// Queue entry as reported to API clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryView {
    pub file_path: String,
    #[serde(rename = "weburl")]
    pub web_url: String,
    pub pattern_length: usize,
    pub start_position: usize,
    pub spacer: bool,
}

/// Whole queue as reported to API clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueView {
    pub queue: Vec<EntryView>,
    pub cursor: CursorView,
    pub pattern_width: usize,
    pub pattern_shift: i32,
    pub ribber: bool,
    pub colors: u8,
    pub total_length: usize,
}
