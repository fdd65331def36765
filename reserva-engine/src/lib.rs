pub mod capacity;
pub mod recurrence;
pub mod retry;
pub mod saga;

pub use capacity::CapacityEngine;
pub use retry::RetryPolicy;
pub use saga::{BookingSagaCoordinator, Disposition, CONSUMER};
