//! Primitives shared by the courier crates

pub mod clock;
pub mod domain;
pub mod logging;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use domain::Domain;
pub use tracing;

/// Lifecycle signal broadcast to long-running loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
