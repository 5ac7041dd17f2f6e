//! Shared wire and domain types for the Syncular sync core.
//!
//! Storage rows keep snake_case field names; everything that crosses the
//! HTTP/WS boundary serialises camelCase. No logic lives here beyond trivial
//! constructors and conversions.

pub mod console;
pub mod domain;
pub mod error;
pub mod realtime;
pub mod sync;

pub use console::*;
pub use domain::*;
pub use error::*;
pub use realtime::*;
pub use sync::*;
