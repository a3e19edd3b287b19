pub mod address;
pub mod logging;

pub use tracing;

/// Lifecycle signal broadcast to long-running components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop starting new work and return once the current iteration ends.
    Shutdown,
}
