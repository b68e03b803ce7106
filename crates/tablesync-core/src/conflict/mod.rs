//! Conflict representation and resolution
//!
//! A push rejected for a tag mismatch leaves the row `conflicting` with both
//! variants stored. [`ConflictTable`] lines those variants up column by
//! column; [`ConflictResolver`] commits the caller's decision back through
//! the server. Nothing is ever resolved automatically.

mod error;
mod resolve;
mod table;

pub use error::ConflictError;
pub use resolve::{ConflictResolver, Resolution};
pub use table::{ColumnChoice, ColumnResolution, ColumnState, ConflictRow, ConflictTable};
