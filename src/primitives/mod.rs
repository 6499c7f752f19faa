//! Low-level building blocks shared by the page store and the redo log.

/// Varint and cursor-style byte encoding helpers.
pub mod bytes;

/// Positioned file IO.
pub mod io;
