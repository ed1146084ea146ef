//! The tracker facade: composes session identity, the live channel, the
//! batch flush path, consent gating, and pluggable instrumentation modules
//! behind `init/track/page_view/flush/destroy`.

mod consent;
mod modules;
mod tracker;

pub use consent::ConsentManager;
pub use modules::{Instrument, PerformanceTiming, TechnologyDetector};
pub use tracker::Tracker;
