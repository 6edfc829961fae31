//! Pattern queue
//!
//! Patterns (decoded images or blank spacers) are queued into one continuous
//! knitting job. A single cursor walks the queue row by row; the protocol
//! engine pulls its rows from the queue through [`RowSource`](crate::protocol::RowSource).

mod container;
mod error;
mod queue;
mod state;

pub use container::{PatternContainer, INK_THRESHOLD, SPACER_WIDTH};
pub use error::QueueError;
pub use queue::{PatternQueue, PatternSource, QueueEntry, STATE_FILE_NAME};
pub use state::{CursorState, CursorView, EntryState, EntryView, QueueState, QueueView};
