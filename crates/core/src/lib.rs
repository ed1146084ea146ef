//! Shared types for the ConvertPulse client core: configuration, errors,
//! wire messages, tracked events, and the event bus.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod events;

pub use error::{PulseError, PulseResult};
