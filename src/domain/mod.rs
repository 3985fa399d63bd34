// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// Domain-specific aggregates built on the event sourcing infrastructure.
// Each aggregate has its own subdirectory with:
// - Events (type names and draft constructors)
// - Aggregate implementation and reducer
// - Command handler
//
// ============================================================================

pub mod counter;
