pub mod conflict;
pub mod notary;

// Re-export the main types for convenience
pub use conflict::{BasicConflictChecker, ConflictResult, InputConflictChecker, StateConflict};
pub use notary::{InMemoryNotary, NotarisationOutcome, NotaryError, NotaryService};
