pub mod engine;
pub mod executor;
pub mod ledger;
pub mod reload;

pub use engine::{RunError, StepEngine, WorkflowEngine};
pub use executor::{RunOutcome, Runtime};
pub use ledger::SessionLedger;
pub use reload::WorkflowCell;
