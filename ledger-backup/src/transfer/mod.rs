//! Transfer progress reporting.

pub mod progress;
pub mod progress_stream;
