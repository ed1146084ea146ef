//! Device fingerprinting — captures host-supplied device signals and derives
//! a stable, comparable session fingerprint.
//!
//! The fingerprint is a soft signal for session validation, not a security
//! mechanism: it only has to be deterministic for one device configuration
//! and cheap to compare.

mod environment;
mod generator;

pub use environment::{DeviceProfile, Environment, StaticEnvironment};
pub use generator::{stable_hash, FingerprintGenerator, SessionFingerprint, CANVAS_UNAVAILABLE};
