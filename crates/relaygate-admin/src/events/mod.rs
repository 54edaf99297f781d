//! Content store holding relay events.
//!
//! All mutations go through [`EventWriter`], a per-operation handle that
//! serializes writers against each other.

mod exceptions;
mod store;

pub use exceptions::{ExceptionParseError, RetentionException, parse_exceptions};
pub use store::{EventDatabase, EventStore, EventWriter};
