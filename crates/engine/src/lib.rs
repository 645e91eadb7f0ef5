//! Lifecycle email workflow engine: graph validation, enrollment, a
//! due-time driven step executor, condition branching, A/B subject tests,
//! and course-cycle rotation.

pub mod assignment;
pub mod course_cycle;
pub mod engine;
pub mod enrollment;
pub mod evaluator;
pub mod executor;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod types;
pub mod validator;

pub use ab_test::ABTestController;
pub use course_cycle::CourseCycleController;
pub use engine::WorkflowEngine;
pub use enrollment::{EnrollmentManager, TriggerEvent};
pub use evaluator::ConditionEvaluator;
pub use executor::{StepExecutor, TickOutcome};
pub use scheduler::{Scheduler, SweepReport};
