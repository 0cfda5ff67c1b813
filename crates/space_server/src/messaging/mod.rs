//! Reliable message delivery with stream reuse and retry.
//!
//! See [`MessagingManager`] for the per-destination stream cache, the
//! deterministic tie-break between racing opens, and the timer-driven
//! retry of sends that have not finished.

pub mod manager;

pub use manager::{MessageSink, MessagingManager};
