//! Pattern queue errors

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Could not decode pattern image {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Invalid queue index {0}")]
    InvalidIndex(usize),

    #[error("Cannot remove entry {0}, the cursor is inside it")]
    EntryUnderCursor(usize),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue state error: {0}")]
    Json(#[from] serde_json::Error),
}
