//! Sequence orchestration: campaign definitions, delay tables, step
//! scheduling and execution, and the due-step worker.

pub mod catalog;
pub mod delay;
pub mod executor;
pub mod orchestrator;
pub mod scheduler;
pub mod state_machine;
pub mod worker;

pub use catalog::{definition, SequenceDefinition, StepDefinition, TemplateRule};
pub use delay::DelayCalculator;
pub use executor::{StepExecutor, StepOutcome};
pub use orchestrator::{OrchestrationOutcome, SequenceOrchestrator};
pub use scheduler::{ScheduleReport, StepFailure, StepScheduler};
pub use state_machine::{OrchestrationState, OrchestrationStateMachine};
pub use worker::{DueStepWorker, WorkerPass};
