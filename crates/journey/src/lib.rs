//! Journey execution — advances customer enrollments through multi-step
//! email/SMS follow-up sequences, one bounded batch per invocation.

pub mod control;
pub mod executor;
pub mod memory;
pub mod state_machine;
pub mod store;

pub use control::EnrollmentControls;
pub use executor::{BatchExecutor, BatchReport, SendFailurePolicy};
pub use memory::{DemoSeed, MemoryStore};
pub use store::{
    ContactStamp, CustomerDirectory, EnrollmentCommit, EnrollmentPatch, EnrollmentStore,
    JourneyStore, StepCatalog,
};
