pub mod engine;

pub use engine::{BatchReport, Delivery, Relay, RelayStats, StepOutcome};

#[cfg(test)]
mod tests;
