// Public contracts for the Skillrun execution core
// This crate defines the event stream entities, tool call/result types,
// the error taxonomy, and terminal execution outcomes.

pub mod error_kind;
pub mod events;
pub mod outcome;
pub mod tools;

pub use error_kind::*;
pub use events::*;
pub use outcome::*;
pub use tools::*;
