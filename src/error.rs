//! Error taxonomy for the atlas engine.
//!
//! Per-photo failures (decode, oversize-for-atlas, cancellation) are all
//! [`ProcessError`]; every construction site of this type sits inside a
//! group build in [`crate::engine`] that logs the failure and moves on to
//! the next photo, so the type never needs to escape past the group
//! boundary to a caller. There is deliberately no crate-wide umbrella error:
//! nothing in the public API returns a `Result` (`best_region`/`region_at`
//! return `Option`, `update_viewport` can't fail), so there'd be nothing to
//! construct one from.

use thiserror::Error;

/// Errors produced while decoding or downsampling a photo into an LOD bitmap.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The decoder backing this engine failed to decode the source bytes.
    #[error("failed to decode photo: {0}")]
    Decode(#[from] image::ImageError),

    /// The photo could not be read from its source.
    #[error("failed to read photo source: {0}")]
    Source(#[from] std::io::Error),

    /// Work was cancelled before it completed; not a failure, just a
    /// superseded request.
    #[error("processing cancelled")]
    Cancelled,
}
