//! The pattern queue and its cursor

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::container::{PatternContainer, INK_THRESHOLD};
use super::state::{
    CursorState, CursorView, EntryState, EntryView, QueueState, QueueView, DEFAULT_COLORS,
};
use super::QueueError;
use crate::protocol::{KnitRow, RowSource, NEEDLE_COUNT};

/// Name of the state file inside the state directory
pub const STATE_FILE_NAME: &str = "ayabd_queuestate.json";

/// Most colors a pattern may be knitted with
pub const MAX_COLORS: u8 = 6;

/// Widest row the bed can knit
const MAX_WIDTH: usize = NEEDLE_COUNT as usize;

/// Where the rows of a queue entry come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternSource {
    /// An image file, and the URL it was published under
    File { path: PathBuf, web_url: String },
    /// Blank rows
    Spacer { length: usize },
}

/// One entry of the queue. Its length is known without decoding the image.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    source: PatternSource,
    length: usize,
    container: Option<PatternContainer>,
}

impl QueueEntry {
    pub fn source(&self) -> &PatternSource {
        &self.source
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_loaded(&self) -> bool {
        self.container.is_some()
    }

    fn from_state(state: EntryState) -> Self {
        let source = if state.file_path.is_empty() {
            PatternSource::Spacer {
                length: state.pattern_length,
            }
        } else {
            PatternSource::File {
                path: PathBuf::from(state.file_path),
                web_url: state.web_url,
            }
        };
        Self {
            source,
            length: state.pattern_length,
            container: None,
        }
    }

    fn to_state(&self) -> EntryState {
        match &self.source {
            PatternSource::File { path, web_url } => EntryState {
                file_path: path.to_string_lossy().into_owned(),
                web_url: web_url.clone(),
                pattern_length: self.length,
            },
            PatternSource::Spacer { .. } => EntryState {
                file_path: String::new(),
                web_url: String::new(),
                pattern_length: self.length,
            },
        }
    }

    /// Decode the container. An image that fails to decode knits as background.
    fn load(&self) -> PatternContainer {
        match &self.source {
            PatternSource::Spacer { .. } => PatternContainer::blank(self.length),
            PatternSource::File { path, .. } => match PatternContainer::load(path) {
                Ok(container) => container,
                Err(e) => {
                    warn!("{}, knitting blank rows instead", e);
                    PatternContainer::blank(self.length)
                }
            },
        }
    }
}

/// Ordered pattern entries read as one continuous pattern
#[derive(Debug, Clone)]
pub struct PatternQueue {
    entries: Vec<QueueEntry>,
    /// Needles per row, 0 = not set
    width: usize,
    /// Needle offset applied when sampling
    shift: i32,
    colors: u8,
    ribber: bool,
    cursor_entry: usize,
    cursor_offset: usize,
    /// Carriage pass within the current row, ribber mode only
    phase: u8,
    dirty: bool,
}

impl Default for PatternQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternQueue {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            width: 0,
            shift: 0,
            colors: DEFAULT_COLORS,
            ribber: false,
            cursor_entry: 0,
            cursor_offset: 0,
            phase: 0,
            dirty: false,
        }
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn shift(&self) -> i32 {
        self.shift
    }

    pub fn colors(&self) -> u8 {
        self.colors
    }

    pub fn ribber(&self) -> bool {
        self.ribber
    }

    pub fn phase(&self) -> u8 {
        self.phase
    }

    /// Entry index and offset within it
    pub fn cursor(&self) -> (usize, usize) {
        (self.cursor_entry, self.cursor_offset)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Remove all entries and reset cursor and width
    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor_entry = 0;
        self.cursor_offset = 0;
        self.phase = 0;
        self.width = 0;
        self.dirty = true;
    }

    /// Append an entry, returning its index.
    ///
    /// The first image queued while no width is set determines the width.
    pub fn append(&mut self, source: PatternSource) -> Result<usize, QueueError> {
        let entry = match source {
            PatternSource::File { path, web_url } => {
                let container = PatternContainer::load(&path)?;
                if self.entries.is_empty() && self.width == 0 {
                    if container.width() > MAX_WIDTH {
                        warn!(
                            "{} is {} needles wide, knitting the first {}",
                            path.display(),
                            container.width(),
                            MAX_WIDTH
                        );
                    }
                    self.width = container.width().min(MAX_WIDTH);
                    info!("Pattern width set to {} from {}", self.width, path.display());
                }
                QueueEntry {
                    length: container.length(),
                    source: PatternSource::File { path, web_url },
                    container: Some(container),
                }
            }
            PatternSource::Spacer { length } => QueueEntry {
                source: PatternSource::Spacer { length },
                length,
                container: None,
            },
        };
        info!(
            "Queued {:?} with {} rows at index {}",
            entry.source,
            entry.length,
            self.entries.len()
        );
        self.entries.push(entry);
        self.dirty = true;
        self.current_container();
        Ok(self.entries.len() - 1)
    }

    /// Remove an entry, optionally deleting its image file
    pub fn remove(&mut self, index: usize, delete_file: bool) -> Result<(), QueueError> {
        if index >= self.entries.len() {
            return Err(QueueError::InvalidIndex(index));
        }
        if index == self.cursor_entry && self.cursor_offset > 0 {
            return Err(QueueError::EntryUnderCursor(index));
        }
        let entry = self.entries.remove(index);
        self.dirty = true;
        if index < self.cursor_entry {
            // keep the cursor on the same row
            self.cursor_entry -= 1;
        }
        if delete_file {
            if let PatternSource::File { path, .. } = &entry.source {
                if let Err(e) = fs::remove_file(path) {
                    warn!("Could not delete {}: {}", path.display(), e);
                }
            }
        }
        info!("Removed queue entry {}", index);
        Ok(())
    }

    /// Absolute row at which entry `index` starts; the total length for `index >= len()`
    pub fn image_start_pos(&self, index: usize) -> usize {
        self.entries.iter().take(index).map(|e| e.length).sum()
    }

    pub fn total_length(&self) -> usize {
        self.image_start_pos(self.entries.len())
    }

    /// Absolute row of the cursor
    pub fn cursor_position(&self) -> usize {
        self.image_start_pos(self.cursor_entry) + self.cursor_offset
    }

    pub fn end_of_pattern(&self) -> bool {
        match self.entries.get(self.cursor_entry) {
            Some(entry) => self.cursor_offset >= entry.length,
            None => true,
        }
    }

    /// Move the cursor to an absolute row or by a relative amount (clamped at 0).
    ///
    /// With `snap_to_entry` the cursor lands on the first row of the entry
    /// containing the target. The phase is reset unless `keep_phase`.
    pub fn move_cursor(&mut self, new_pos: i64, relative: bool, snap_to_entry: bool, keep_phase: bool) {
        let old = self.cursor_position() as i64;
        let target = if relative {
            old.saturating_add(new_pos)
        } else {
            new_pos
        };
        let target = usize::try_from(target).unwrap_or(0);

        if target as i64 != old || (snap_to_entry && self.cursor_offset > 0) {
            self.dirty = true;
            self.cursor_entry = 0;
            self.cursor_offset = 0;
            let mut pos = 0;
            while let Some(entry) = self.entries.get(self.cursor_entry) {
                let end = pos + entry.length;
                if target < end {
                    if !snap_to_entry {
                        self.cursor_offset = target - pos;
                    }
                    break;
                }
                pos = end;
                self.cursor_entry += 1;
            }
            self.current_container();
        }
        if !keep_phase && self.phase != 0 {
            self.phase = 0;
            self.dirty = true;
        }
        debug!(
            "Cursor moved from {} to {}: entry {}/{}, offset {}, end of pattern: {}",
            old,
            target,
            self.cursor_entry,
            self.entries.len(),
            self.cursor_offset,
            self.end_of_pattern()
        );
    }

    /// The container under the cursor, loaded on demand. Every other entry is unloaded.
    fn current_container(&mut self) -> Option<&PatternContainer> {
        let current = self.cursor_entry;
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if index != current && entry.container.take().is_some() {
                debug!("Unloaded pattern of entry {}", index);
            }
        }
        let entry = self.entries.get_mut(current)?;
        if entry.container.is_none() {
            entry.container = Some(entry.load());
        }
        entry.container.as_ref()
    }

    /// Color number of a needle in the row under the cursor
    pub fn sample_color(&mut self, needle: usize) -> u8 {
        if self.end_of_pattern() {
            return 0;
        }
        let at_length = self.cursor_offset as i64;
        let at_width = needle as i64 - i64::from(self.shift);
        match self.current_container() {
            Some(container) if container.gray_at(at_length, at_width) >= INK_THRESHOLD => 1,
            _ => 0,
        }
    }

    /// Whether the needle is selected in the current row and pass.
    /// In ribber mode the selection is inverted on phases 0 and 3.
    pub fn needle_active(&mut self, needle: usize) -> bool {
        let inverted = self.ribber && (self.phase == 0 || self.phase == 3);
        (self.sample_color(needle) != 0) != inverted
    }

    /// Advance to the next carriage pass, returning the new phase.
    ///
    /// Without ribber every pass is a new row. With ribber each row is knitted
    /// in two passes, so the cursor advances on every even phase.
    pub fn next_phase(&mut self) -> u8 {
        if !self.ribber {
            self.move_cursor(1, true, false, false);
            return 0;
        }
        let passes = 2 * u16::from(self.colors);
        // below 2 * MAX_COLORS, fits u8
        self.phase = ((u16::from(self.phase) + 1) % passes) as u8;
        self.dirty = true;
        if self.phase % 2 == 0 {
            self.move_cursor(1, true, false, true);
        }
        self.phase
    }

    pub fn reset_phase(&mut self) {
        if self.phase != 0 {
            self.phase = 0;
            self.dirty = true;
        }
    }

    pub fn set_width(&mut self, width: usize) -> Result<(), QueueError> {
        check_width(width)?;
        self.width = width;
        self.dirty = true;
        Ok(())
    }

    pub fn set_shift(&mut self, shift: i32) {
        self.shift = shift;
        self.dirty = true;
    }

    pub fn set_ribber(&mut self, ribber: bool) {
        self.ribber = ribber;
        self.warn_unsupported_colors();
        self.phase = 0;
        self.dirty = true;
    }

    pub fn set_colors(&mut self, colors: u8) -> Result<(), QueueError> {
        check_colors(colors)?;
        self.colors = colors;
        self.warn_unsupported_colors();
        self.phase = 0;
        self.dirty = true;
        Ok(())
    }

    fn warn_unsupported_colors(&self) {
        if self.ribber && self.colors > 2 {
            warn!(
                "Ribber with {} colors is not supported, knitting two colors",
                self.colors
            );
        }
    }

    pub fn state_file(state_dir: &Path) -> PathBuf {
        state_dir.join(STATE_FILE_NAME)
    }

    /// Replace the queue with the state saved in `state_dir`
    pub fn load_state(&mut self, state_dir: &Path) -> Result<(), QueueError> {
        *self = Self::new();
        // nothing saved yet until proven otherwise
        self.dirty = true;
        let path = Self::state_file(state_dir);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No queue state at {}", path.display());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let state: QueueState = serde_json::from_str(&content)?;
        self.apply_state(state)?;
        info!(
            "Loaded queue state: {} entries, cursor at {}",
            self.entries.len(),
            self.cursor_position()
        );
        Ok(())
    }

    fn apply_state(&mut self, state: QueueState) -> Result<(), QueueError> {
        check_width(state.pattern_width)?;
        check_colors(state.colors)?;
        if u16::from(state.cursor.phase) >= 2 * u16::from(state.colors) {
            return Err(QueueError::InvalidParameter(format!(
                "phase {} out of range for {} colors",
                state.cursor.phase, state.colors
            )));
        }
        self.width = state.pattern_width;
        self.shift = state.pattern_shift;
        self.ribber = state.ribber;
        self.colors = state.colors;
        self.cursor_entry = state.cursor.entry;
        self.cursor_offset = state.cursor.offset;
        self.phase = state.cursor.phase;
        if let Some(entries) = state.queue {
            self.entries = entries.into_iter().map(QueueEntry::from_state).collect();
            self.dirty = false;
        }
        Ok(())
    }

    /// Serializable snapshot of everything that is persisted
    pub fn to_state(&self) -> QueueState {
        QueueState {
            queue: Some(self.entries.iter().map(QueueEntry::to_state).collect()),
            cursor: CursorState {
                entry: self.cursor_entry,
                offset: self.cursor_offset,
                phase: self.phase,
            },
            pattern_width: self.width,
            pattern_shift: self.shift,
            ribber: self.ribber,
            colors: self.colors,
        }
    }

    /// Write the state file if anything changed (or `force`). Returns whether it was written.
    pub fn save_state(&mut self, state_dir: &Path, force: bool) -> Result<bool, QueueError> {
        if !self.dirty && !force {
            return Ok(false);
        }
        fs::create_dir_all(state_dir)?;
        let path = Self::state_file(state_dir);
        let content = serde_json::to_string_pretty(&self.to_state())?;
        fs::write(&path, content)?;
        self.dirty = false;
        debug!("Saved queue state to {}", path.display());
        Ok(true)
    }

    pub fn cursor_view(&self) -> CursorView {
        CursorView {
            entry: self.cursor_entry,
            offset: self.cursor_offset,
            phase: self.phase,
            position: self.cursor_position(),
            end_of_pattern: self.end_of_pattern(),
        }
    }

    pub fn view(&self) -> QueueView {
        let mut start_position = 0;
        let queue = self
            .entries
            .iter()
            .map(|entry| {
                let state = entry.to_state();
                let view = EntryView {
                    file_path: state.file_path,
                    web_url: state.web_url,
                    pattern_length: state.pattern_length,
                    start_position,
                    spacer: matches!(entry.source, PatternSource::Spacer { .. }),
                };
                start_position += entry.length;
                view
            })
            .collect();
        QueueView {
            queue,
            cursor: self.cursor_view(),
            pattern_width: self.width,
            pattern_shift: self.shift,
            ribber: self.ribber,
            colors: self.colors,
            total_length: self.total_length(),
        }
    }

    /// Build the row under the cursor and advance to the next pass
    fn knit_row(&mut self) -> Option<KnitRow> {
        if self.end_of_pattern() {
            return None;
        }
        let mut row = KnitRow::new(self.width);
        for needle in 0..self.width {
            row.set(needle, self.needle_active(needle));
        }
        self.next_phase();
        Some(row)
    }
}

fn check_width(width: usize) -> Result<(), QueueError> {
    if width > MAX_WIDTH {
        return Err(QueueError::InvalidParameter(format!(
            "width {} exceeds the {} needles of the bed",
            width, MAX_WIDTH
        )));
    }
    Ok(())
}

fn check_colors(colors: u8) -> Result<(), QueueError> {
    if !(2..=MAX_COLORS).contains(&colors) {
        return Err(QueueError::InvalidParameter(format!(
            "2 to {} colors supported, got {}",
            MAX_COLORS, colors
        )));
    }
    Ok(())
}

impl RowSource for PatternQueue {
    fn next_row(&mut self, _row_number: u32) -> Option<KnitRow> {
        self.knit_row()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spacers(lengths: &[usize]) -> PatternQueue {
        let mut queue = PatternQueue::new();
        for &length in lengths {
            queue.append(PatternSource::Spacer { length }).unwrap();
        }
        queue
    }

    #[test]
    fn test_defaults() {
        let queue = PatternQueue::new();
        assert_eq!(queue.colors(), 2);
        assert!(!queue.ribber());
        assert_eq!(queue.shift(), 0);
        assert_eq!(queue.width(), 0);
        assert!(queue.end_of_pattern());
    }

    #[test]
    fn test_clear_resets_cursor_and_width() {
        let mut queue = spacers(&[3, 4]);
        queue.set_width(30).unwrap();
        queue.move_cursor(5, false, false, false);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.cursor(), (0, 0));
        assert_eq!(queue.width(), 0);
        assert!(queue.is_dirty());
    }

    #[test]
    fn test_spacer_does_not_set_width() {
        let queue = spacers(&[5]);
        assert_eq!(queue.width(), 0);
        assert_eq!(queue.total_length(), 5);
    }

    #[test]
    fn test_move_cursor_absolute_and_relative() {
        let mut queue = spacers(&[3, 4, 5]);
        queue.move_cursor(5, false, false, false);
        assert_eq!(queue.cursor(), (1, 2));
        queue.move_cursor(-10, true, false, false);
        assert_eq!(queue.cursor(), (0, 0));
        queue.move_cursor(100, false, false, false);
        assert_eq!(queue.cursor(), (3, 0));
        assert!(queue.end_of_pattern());
        assert_eq!(queue.cursor_position(), 12);
    }

    #[test]
    fn test_snap_to_entry() {
        let mut queue = spacers(&[3, 4]);
        queue.move_cursor(5, false, true, false);
        assert_eq!(queue.cursor(), (1, 0));

        queue.move_cursor(6, false, false, false);
        queue.move_cursor(0, true, true, false);
        assert_eq!(queue.cursor(), (1, 0));
    }

    #[test]
    fn test_only_current_entry_loaded() {
        let mut queue = spacers(&[2, 2, 2]);
        queue.sample_color(0);
        assert!(queue.entries()[0].is_loaded());
        queue.move_cursor(3, false, false, false);
        let loaded: Vec<bool> = queue.entries().iter().map(QueueEntry::is_loaded).collect();
        assert_eq!(loaded, vec![false, true, false]);
    }

    #[test]
    fn test_remove_rules() {
        let mut queue = spacers(&[3, 4, 5]);
        assert!(matches!(queue.remove(3, false), Err(QueueError::InvalidIndex(3))));

        queue.move_cursor(4, false, false, false);
        assert!(matches!(
            queue.remove(1, false),
            Err(QueueError::EntryUnderCursor(1))
        ));

        queue.remove(0, false).unwrap();
        assert_eq!(queue.cursor(), (0, 1));
        assert_eq!(queue.cursor_position(), 1);
    }

    #[test]
    fn test_remove_entry_at_its_start() {
        let mut queue = spacers(&[3, 4]);
        queue.move_cursor(3, false, false, false);
        queue.remove(1, false).unwrap();
        assert!(queue.end_of_pattern());
    }

    #[test]
    fn test_ribber_phase_sequence() {
        let mut queue = spacers(&[10]);
        queue.set_ribber(true);
        let mut seen = Vec::new();
        for _ in 0..4 {
            let phase = queue.next_phase();
            seen.push((phase, queue.cursor_position()));
        }
        assert_eq!(seen, vec![(1, 0), (2, 1), (3, 1), (0, 2)]);
    }

    #[test]
    fn test_ribber_inverts_phases_0_and_3() {
        let mut queue = spacers(&[10]);
        queue.set_ribber(true);
        // blank rows: only the inverted phases select needles
        let mut active = Vec::new();
        for _ in 0..4 {
            active.push(queue.needle_active(0));
            queue.next_phase();
        }
        assert_eq!(active, vec![true, false, false, true]);
    }

    #[test]
    fn test_move_resets_phase_unless_kept() {
        let mut queue = spacers(&[10]);
        queue.set_ribber(true);
        queue.next_phase();
        queue.move_cursor(0, true, false, true);
        assert_eq!(queue.phase(), 1);
        queue.move_cursor(0, true, false, false);
        assert_eq!(queue.phase(), 0);
    }

    #[test]
    fn test_set_colors_validation() {
        let mut queue = PatternQueue::new();
        assert!(queue.set_colors(1).is_err());
        assert!(matches!(
            queue.set_colors(128),
            Err(QueueError::InvalidParameter(_))
        ));
        queue.set_colors(3).unwrap();
        assert_eq!(queue.colors(), 3);
    }

    #[test]
    fn test_ribber_with_most_colors_cycles_all_phases() {
        let mut queue = spacers(&[100]);
        queue.set_width(4).unwrap();
        queue.set_colors(MAX_COLORS).unwrap();
        queue.set_ribber(true);
        let passes = 2 * usize::from(MAX_COLORS);
        for _ in 0..passes {
            assert!(queue.next_row(0).is_some());
        }
        assert_eq!(queue.phase(), 0);
        assert_eq!(queue.cursor_position(), usize::from(MAX_COLORS));
    }

    #[test]
    fn test_relative_move_saturates() {
        let mut queue = spacers(&[3, 4]);
        queue.move_cursor(1, false, false, false);
        queue.move_cursor(i64::MAX, true, false, false);
        assert!(queue.end_of_pattern());
        assert_eq!(queue.cursor_position(), 7);
        queue.move_cursor(i64::MIN, true, false, false);
        assert_eq!(queue.cursor(), (0, 0));
    }

    #[test]
    fn test_width_limited_to_bed() {
        let mut queue = PatternQueue::new();
        queue.set_width(NEEDLE_COUNT as usize).unwrap();
        assert!(matches!(
            queue.set_width(1_000_000_000_000),
            Err(QueueError::InvalidParameter(_))
        ));
        assert_eq!(queue.width(), NEEDLE_COUNT as usize);
    }

    #[test]
    fn test_out_of_range_state_rejected() {
        let mut queue = PatternQueue::new();
        let state = QueueState {
            colors: 2,
            cursor: CursorState {
                entry: 0,
                offset: 0,
                phase: 255,
            },
            ..QueueState::default()
        };
        assert!(queue.apply_state(state).is_err());
        let state = QueueState {
            colors: 200,
            ..QueueState::default()
        };
        assert!(queue.apply_state(state).is_err());
    }

    #[test]
    fn test_row_source_ends_at_end_of_pattern() {
        let mut queue = spacers(&[2]);
        queue.set_width(4).unwrap();
        assert_eq!(queue.next_row(0), Some(KnitRow::new(4)));
        assert_eq!(queue.next_row(1), Some(KnitRow::new(4)));
        assert_eq!(queue.next_row(2), None);
    }

    #[test]
    fn test_missing_image_knits_background() {
        let mut queue = PatternQueue::new();
        queue.apply_state(QueueState {
            queue: Some(vec![EntryState {
                file_path: "/nonexistent/gone.png".to_string(),
                web_url: String::new(),
                pattern_length: 3,
            }]),
            pattern_width: 4,
            ..QueueState::default()
        })
        .unwrap();
        assert_eq!(queue.sample_color(1), 0);
        assert!(!queue.end_of_pattern());
    }
}
