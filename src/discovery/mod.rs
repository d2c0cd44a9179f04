// Modules
mod aggregator;
mod registry;
mod relay;
mod scanner;
mod tags;

// Public exports
pub use relay::RelayPool;
pub use scanner::{PhaseReport, Scanner};
