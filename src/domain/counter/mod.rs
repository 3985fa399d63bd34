// ============================================================================
// Counter Aggregate Module
// ============================================================================
//
// The smallest useful aggregate: created at zero, moved by one per event.
// Used by the demo binary and as the fixture aggregate in store tests.
//
// ============================================================================

pub mod aggregate;
pub mod command_handler;
pub mod events;

pub use aggregate::{reduce, CounterAggregate};
pub use command_handler::CounterCommandHandler;
pub use events::{created, decremented, incremented, CREATED, DECREMENTED, INCREMENTED};
